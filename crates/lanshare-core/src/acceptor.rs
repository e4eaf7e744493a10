//! Connection acceptor: the server side of LANSHARE.
//!
//! Binds a TCP listener and spawns one [`TransferSession`] per accepted
//! connection. There is no connection cap; every session runs on its own task
//! on the multi-threaded runtime.
//!
//! # Shutdown
//!
//! [`ConnectionAcceptor::stop`] stops accepting, cancels every live session
//! through a child [`CancellationToken`], then waits up to the configured
//! shutdown timeout for the sessions to finish on their own. Sessions still
//! live after that are aborted, their sockets dropped, and they are recorded
//! as Cancelled with [`FailureReason::ForcedClose`].

use crate::config::ShareConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventSubscription, Severity};
use crate::file::FileDescriptor;
use crate::format_bytes;
use crate::registry::SessionRegistry;
use crate::session::{FailureReason, Session, SessionId};
use crate::transfer::TransferSession;
use dashmap::DashMap;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Listen backlog passed to `listen(2)`
const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed `accept` so descriptor exhaustion does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A running listener
struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<JoinSet<()>>,
}

struct AcceptorInner {
    config: ShareConfig,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    selection: watch::Sender<Option<Arc<FileDescriptor>>>,
    /// Cancellation handles of live sessions
    session_tokens: DashMap<SessionId, CancellationToken>,
    running: AtomicBool,
    listener: Mutex<Option<ListenerHandle>>,
}

/// Accepts peers and serves them the selected file
///
/// Cloning is cheap; clones control the same listener.
#[derive(Clone)]
pub struct ConnectionAcceptor {
    inner: Arc<AcceptorInner>,
}

impl ConnectionAcceptor {
    /// Create an acceptor
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(config: ShareConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new(config.history_capacity));
        let bus = EventBus::new(config.event_capacity, config.log_capacity);
        let (selection, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(AcceptorInner {
                config,
                registry,
                bus,
                selection,
                session_tokens: DashMap::new(),
                running: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Session registry shared with every session
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Event bus shared with every session
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.bus.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl ConnectionAcceptor {
    /// Bind `addr` and start accepting connections
    ///
    /// Returns the bound address (port 0 selects an ephemeral port).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if already running, [`Error::Bind`] if the
    /// address is unavailable.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut slot = self.inner.listener.lock().await;

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::invalid_state("acceptor already running"));
        }

        let (listener, local_addr) = match bind(addr) {
            Ok(bound) => bound,
            Err(source) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.inner.bus.log(
                    Severity::Error,
                    format!("Failed to start server on {addr}: {source}"),
                    None,
                );
                return Err(Error::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.clone().accept_loop(listener, shutdown.clone()));
        *slot = Some(ListenerHandle {
            local_addr,
            shutdown,
            task,
        });
        drop(slot);

        self.inner
            .bus
            .publish(Event::ListenerStarted { addr: local_addr });
        self.inner
            .bus
            .log(Severity::Info, format!("Server started on {local_addr}"), None);

        Ok(local_addr)
    }

    /// Stop accepting and bring every live session to a terminal state
    ///
    /// Returns once every session is recorded in history, at most about one
    /// shutdown timeout after the call.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if not running.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.inner.listener.lock().await;

        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::invalid_state("acceptor not running"));
        }

        let Some(handle) = slot.take() else {
            return Err(Error::invalid_state("acceptor has no listener"));
        };
        drop(slot);

        // Session tokens are children of this one
        handle.shutdown.cancel();

        let sessions = match handle.task.await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("accept loop ended abnormally: {e}");
                JoinSet::new()
            }
        };
        self.drain_sessions(sessions).await;
        self.inner.session_tokens.clear();

        self.inner.bus.publish(Event::ListenerStopped);
        self.inner.bus.log(
            Severity::Info,
            format!("Server on {} stopped", handle.local_addr),
            None,
        );
        Ok(())
    }

    /// Wait up to the grace period for `sessions`, then abort the rest and
    /// record every session still live as force-closed
    async fn drain_sessions(&self, mut sessions: JoinSet<()>) {
        let grace = self.inner.config.shutdown_timeout;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = sessions.join_next().await {
                log_join_error(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "sessions still live after {:?}, forcing close",
                grace
            );
            sessions.shutdown().await;
        }

        for entry in self.inner.registry.force_close_remaining().await {
            let peer = entry.session().peer_addr.clone();
            let id = entry.id();
            self.inner.bus.publish(Event::SessionEnded(entry));
            self.inner.bus.log(
                Severity::Warning,
                format!(
                    "Transfer to {peer} cancelled: {}",
                    FailureReason::ForcedClose
                ),
                Some(id),
            );
        }
    }

    /// Check if the acceptor is listening
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.local_addr)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// File Selection and Session Control
// ═══════════════════════════════════════════════════════════════════════════

impl ConnectionAcceptor {
    /// Share `file` with every session that has not sent its metadata yet
    /// and with every later connection
    ///
    /// Sessions already transferring keep the file they started with.
    pub fn select_file(&self, file: FileDescriptor) {
        let name = file.name().to_string();
        let size = file.size();

        self.inner.selection.send_replace(Some(Arc::new(file)));

        self.inner.bus.publish(Event::FileSelected {
            name: name.clone(),
            size,
        });
        self.inner.bus.log(
            Severity::Info,
            format!("Selected file: {name} ({})", format_bytes(size)),
            None,
        );
    }

    /// Currently selected file
    #[must_use]
    pub fn selected_file(&self) -> Option<Arc<FileDescriptor>> {
        self.inner.selection.borrow().clone()
    }

    /// Request cancellation of one live session
    ///
    /// The session ends as Cancelled at its next chunk boundary.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unknown ids, [`Error::InvalidState`] for
    /// sessions that already ended.
    pub async fn cancel_session(&self, id: SessionId) -> Result<()> {
        // Sessions are recorded as finished before their token goes away
        if self.inner.registry.get(id).await?.is_terminal() {
            return Err(Error::invalid_state("session already finished"));
        }

        if let Some(token) = self.inner.session_tokens.get(&id) {
            token.cancel();
            tracing::debug!(session = %id, "cancellation requested");
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accept Loop
// ═══════════════════════════════════════════════════════════════════════════

impl ConnectionAcceptor {
    async fn accept_loop(self, listener: TcpListener, shutdown: CancellationToken) -> JoinSet<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join_error(joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_session(&mut sessions, stream, peer, &shutdown).await;
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        tracing::debug!(live = sessions.len(), "accept loop stopped");
        sessions
    }

    async fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) {
        let id = SessionId::next();
        // Token first: a session visible in the registry is always cancellable
        let token = shutdown.child_token();
        self.inner.session_tokens.insert(id, token.clone());

        if let Err(e) = self
            .inner
            .registry
            .register(Session::new(id, peer.to_string()))
            .await
        {
            self.inner.session_tokens.remove(&id);
            tracing::error!(session = %id, peer = %peer, "could not register session: {e}");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(session = %id, "set_nodelay failed: {e}");
        }
        // Unacknowledged data stays near one chunk, so bytes_sent tracks the peer
        let chunk_size = self.inner.config.chunk_size;
        if let Err(e) = SockRef::from(&stream).set_send_buffer_size(chunk_size) {
            tracing::debug!(session = %id, "set_send_buffer_size failed: {e}");
        }

        self.inner.bus.publish(Event::SessionStarted {
            id,
            peer_addr: peer.to_string(),
        });
        self.inner
            .bus
            .log(Severity::Info, format!("Client connected from {peer}"), Some(id));

        let transfer = TransferSession::new(
            id,
            stream,
            self.inner.selection.subscribe(),
            Arc::clone(&self.inner.registry),
            self.inner.bus.clone(),
            token,
            &self.inner.config,
        );

        let acceptor = self.clone();
        sessions.spawn(async move {
            if let Err(e) = transfer.run().await {
                tracing::debug!(session = %id, "session ended without a history entry: {e}");
            }
            acceptor.inner.session_tokens.remove(&id);
        });
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("session task panicked: {e}");
        }
    }
}
