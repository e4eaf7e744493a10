//! Per-connection transfer session.
//!
//! A [`TransferSession`] owns one peer connection and drives it through the
//! session state machine:
//!
//! 1. **Handshaking**: wait until a file is selected, then write the metadata
//!    frame. A failed or timed out write ends the session as Failed with a
//!    connect error.
//! 2. **Transferring**: read the file in chunks and write each chunk under the
//!    write timeout. Every successful write adds to `bytes_sent` and publishes
//!    one progress event. Cancellation is checked between chunks and also
//!    interrupts a pending write.
//! 3. **Terminal**: record the history entry, publish the terminal event and
//!    a log event, then release the connection and the content reader.
//!
//! Failures never leave the session: siblings and the acceptor are unaffected.

use crate::config::ShareConfig;
use crate::error::Result;
use crate::events::{Event, EventBus, Severity};
use crate::file::FileDescriptor;
use crate::format_bytes;
use crate::frame::encode_metadata;
use crate::registry::SessionRegistry;
use crate::session::{FailureReason, HistoryEntry, SessionId, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How the session ended, before it is recorded
#[derive(Debug)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(FailureReason),
}

/// Why a bounded write did not finish
enum WriteFailure {
    Cancelled,
    Io(String),
}

/// Transfer of the shared file to one peer
pub struct TransferSession<W> {
    id: SessionId,
    stream: W,
    file: watch::Receiver<Option<Arc<FileDescriptor>>>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    cancel: CancellationToken,
    chunk_size: usize,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl<W> TransferSession<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a session for an already registered connection
    ///
    /// `file` carries the operator's current selection; the session waits in
    /// Handshaking while it is `None`.
    pub fn new(
        id: SessionId,
        stream: W,
        file: watch::Receiver<Option<Arc<FileDescriptor>>>,
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        cancel: CancellationToken,
        config: &ShareConfig,
    ) -> Self {
        Self {
            id,
            stream,
            file,
            registry,
            bus,
            cancel,
            chunk_size: config.chunk_size.max(1),
            write_timeout: config.write_timeout,
            read_timeout: config.read_timeout,
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drive the session to its terminal state
    ///
    /// Returns the history entry. Errors only if the registry no longer
    /// knows the session (it was force-closed first).
    pub async fn run(mut self) -> Result<HistoryEntry> {
        let outcome = self.drive().await;

        let (state, reason) = match outcome {
            Outcome::Completed => (SessionState::Completed, None),
            Outcome::Cancelled => (SessionState::Cancelled, None),
            Outcome::Failed(reason) => (SessionState::Failed, Some(reason)),
        };
        let entry = self.registry.finish(self.id, state, reason).await?;

        self.bus.publish(Event::SessionEnded(entry.clone()));
        self.report(&entry);

        Ok(entry)
    }

    async fn drive(&mut self) -> Outcome {
        let Some(descriptor) = self.wait_for_file().await else {
            return Outcome::Cancelled;
        };

        let header = descriptor.header();
        if let Err(e) = self.registry.assign_file(self.id, &header).await {
            return Outcome::Failed(FailureReason::ConnectError(e.to_string()));
        }

        let frame = match encode_metadata(&header) {
            Ok(frame) => frame,
            Err(e) => return Outcome::Failed(FailureReason::ConnectError(e.to_string())),
        };
        match self.write_bounded(&frame).await {
            Ok(()) => {}
            Err(WriteFailure::Cancelled) => return Outcome::Cancelled,
            Err(WriteFailure::Io(msg)) => {
                return Outcome::Failed(FailureReason::ConnectError(msg));
            }
        }

        if let Err(e) = self
            .registry
            .set_state(self.id, SessionState::Transferring)
            .await
        {
            return Outcome::Failed(FailureReason::TransferError(e.to_string()));
        }
        tracing::debug!(session = %self.id, file = %header.name, size = header.size, "metadata sent");

        self.stream_payload(&descriptor).await
    }

    async fn wait_for_file(&mut self) -> Option<Arc<FileDescriptor>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let current = self.file.borrow_and_update().clone();
            if let Some(descriptor) = current {
                return Some(descriptor);
            }

            tracing::debug!(session = %self.id, "waiting for a file to be selected");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                changed = self.file.changed() => {
                    // Selection channel gone: the acceptor was dropped
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn stream_payload(&mut self, descriptor: &FileDescriptor) -> Outcome {
        let total = descriptor.size();
        let mut reader = match descriptor.reader().await {
            Ok(reader) => reader,
            Err(e) => {
                return Outcome::Failed(FailureReason::TransferError(format!(
                    "opening {}: {e}",
                    descriptor.name()
                )));
            }
        };

        let capacity = usize::try_from(total).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; self.chunk_size.min(capacity).max(1)];
        let mut sent = 0u64;

        while sent < total {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let want = buf.len().min(usize::try_from(total - sent).unwrap_or(usize::MAX));
            let chunk = reader.read_chunk(&mut buf[..want]);
            let read = match tokio::time::timeout(self.read_timeout, chunk).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Outcome::Failed(FailureReason::TransferError(format!(
                        "reading file: {e}"
                    )));
                }
                Err(_) => {
                    return Outcome::Failed(FailureReason::TransferError(
                        "reading file timed out".to_string(),
                    ));
                }
            };
            if read < want {
                return Outcome::Failed(FailureReason::TransferError(format!(
                    "file ended after {} of {total} bytes",
                    sent + read as u64
                )));
            }

            match self.write_bounded(&buf[..read]).await {
                Ok(()) => {}
                Err(WriteFailure::Cancelled) => return Outcome::Cancelled,
                Err(WriteFailure::Io(msg)) => {
                    return Outcome::Failed(FailureReason::TransferError(msg));
                }
            }

            sent = match self.registry.update_progress(self.id, read as u64).await {
                Ok(sent) => sent,
                Err(e) => return Outcome::Failed(FailureReason::TransferError(e.to_string())),
            };
            tracing::trace!(session = %self.id, sent, total, "chunk written");

            self.bus.publish(Event::Progress {
                id: self.id,
                bytes_sent: sent,
                total_bytes: total,
            });
        }

        if let Err(e) = self.finish_stream().await {
            return Outcome::Failed(FailureReason::TransferError(e));
        }
        Outcome::Completed
    }

    /// Write all of `data`, bounded by the write timeout and interrupted by
    /// cancellation
    async fn write_bounded(&mut self, data: &[u8]) -> std::result::Result<(), WriteFailure> {
        let write = tokio::time::timeout(self.write_timeout, self.stream.write_all(data));
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(WriteFailure::Cancelled),
            result = write => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WriteFailure::Io(e.to_string())),
                Err(_) => Err(WriteFailure::Io(format!(
                    "write timed out after {}s",
                    self.write_timeout.as_secs_f64()
                ))),
            },
        }
    }

    async fn finish_stream(&mut self) -> std::result::Result<(), String> {
        let close = async {
            self.stream.flush().await?;
            self.stream.shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, close).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("closing connection: {e}")),
            Err(_) => Err("closing connection timed out".to_string()),
        }
    }

    fn report(&self, entry: &HistoryEntry) {
        let session = entry.session();
        let (severity, message) = match entry.state() {
            SessionState::Completed => (
                Severity::Info,
                format!(
                    "Sent {} ({}) to {}",
                    session.file_name,
                    format_bytes(session.total_bytes),
                    session.peer_addr
                ),
            ),
            SessionState::Cancelled => (
                Severity::Warning,
                format!(
                    "Transfer to {} cancelled after {} of {}",
                    session.peer_addr,
                    format_bytes(session.bytes_sent),
                    format_bytes(session.total_bytes)
                ),
            ),
            _ => (
                Severity::Error,
                format!(
                    "Transfer to {} failed after {}: {}",
                    session.peer_addr,
                    format_bytes(session.bytes_sent),
                    entry.status_label()
                ),
            ),
        };
        self.bus.log(severity, message, Some(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSubscription;
    use crate::frame::read_metadata;
    use crate::session::Session;
    use std::io::Write;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    /// Accepts `remaining` bytes, then fails every write like a closed peer
    struct FailingWriter {
        remaining: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                )));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        events: EventSubscription,
        selection: watch::Sender<Option<Arc<FileDescriptor>>>,
        cancel: CancellationToken,
        config: ShareConfig,
    }

    impl Harness {
        fn new(file: Option<FileDescriptor>) -> Self {
            let bus = EventBus::new(1024, 64);
            let events = bus.subscribe();
            let (selection, _) = watch::channel(file.map(Arc::new));
            Self {
                registry: Arc::new(SessionRegistry::new(16)),
                bus,
                events,
                selection,
                cancel: CancellationToken::new(),
                config: ShareConfig::default(),
            }
        }

        async fn session<W>(&self, stream: W) -> TransferSession<W>
        where
            W: AsyncWrite + Unpin + Send,
        {
            let session = Session::new(SessionId::next(), "127.0.0.1:50000");
            let id = session.id;
            self.registry.register(session).await.unwrap();
            TransferSession::new(
                id,
                stream,
                self.selection.subscribe(),
                Arc::clone(&self.registry),
                self.bus.clone(),
                self.cancel.child_token(),
                &self.config,
            )
        }

        fn drain(&mut self) -> Vec<Event> {
            std::iter::from_fn(|| self.events.try_next()).collect()
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_transfer_completes() {
        let content = sample(200_000);
        let mut harness = Harness::new(Some(FileDescriptor::from_bytes("data.bin", content.clone())));
        let (server, mut client) = tokio::io::duplex(8192);
        let session = harness.session(server).await;

        let task = tokio::spawn(session.run());

        let header = read_metadata(&mut client).await.unwrap();
        assert_eq!(header.name, "data.bin");
        assert_eq!(header.size, 200_000);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, content);

        let entry = task.await.unwrap().unwrap();
        assert_eq!(entry.state(), SessionState::Completed);
        assert_eq!(entry.session().bytes_sent, 200_000);
        assert_eq!(entry.session().file_name, "data.bin");

        let events = harness.drain();
        assert!(matches!(events.last(), Some(Event::Log(log)) if log.severity == Severity::Info));
        assert!(events.iter().any(|e| matches!(e, Event::SessionEnded(_))));
    }

    #[tokio::test]
    async fn test_progress_event_count() {
        let mut harness = Harness::new(Some(FileDescriptor::from_bytes(
            "five.bin",
            vec![0xA5u8; 5_242_880],
        )));
        harness.config = harness.config.clone().with_chunk_size(65_536);
        let session = harness.session(tokio::io::sink()).await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Completed);

        let progress: Vec<u64> = harness
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress { bytes_sent, .. } => Some(bytes_sent),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 80);
        assert_eq!(progress.last(), Some(&5_242_880));
        assert!(progress.windows(2).all(|w| w[1] - w[0] == 65_536));
    }

    #[tokio::test]
    async fn test_disconnect_after_metadata() {
        let header = FileDescriptor::from_bytes("a.bin", sample(1000)).header();
        let mut harness = Harness::new(Some(FileDescriptor::from_bytes("a.bin", sample(1000))));
        let session = harness
            .session(FailingWriter {
                remaining: header.encoded_len(),
            })
            .await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Failed);
        assert_eq!(entry.session().bytes_sent, 0);
        assert!(matches!(
            entry.session().failure_reason,
            Some(FailureReason::TransferError(_))
        ));

        let events = harness.drain();
        assert!(!events.iter().any(|e| matches!(e, Event::Progress { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::Log(log) if log.severity == Severity::Error)));
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer_keeps_partial_count() {
        let header = FileDescriptor::from_bytes("b.bin", sample(10)).header();
        let mut harness = Harness::new(Some(FileDescriptor::from_bytes("b.bin", sample(300_000))));
        harness.config = harness.config.clone().with_chunk_size(1000);
        // Metadata plus two full chunks and half of the third
        let session = harness
            .session(FailingWriter {
                remaining: header.encoded_len() + 2500,
            })
            .await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Failed);
        assert_eq!(entry.session().bytes_sent, 2000);
    }

    #[tokio::test]
    async fn test_handshake_write_failure() {
        let harness = Harness::new(Some(FileDescriptor::from_bytes("c.bin", sample(10))));
        let session = harness.session(FailingWriter { remaining: 0 }).await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Failed);
        assert!(matches!(
            entry.session().failure_reason,
            Some(FailureReason::ConnectError(_))
        ));
        assert!(entry.status_label().starts_with("Failed: ConnectError"));
    }

    #[tokio::test]
    async fn test_waits_for_late_selection() {
        let harness = Harness::new(None);
        let (server, mut client) = tokio::io::duplex(4096);
        let session = harness.session(server).await;
        let id = session.id();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            harness.registry.get(id).await.unwrap().state,
            SessionState::Handshaking
        );

        let content = sample(5000);
        harness
            .selection
            .send_replace(Some(Arc::new(FileDescriptor::from_bytes("late.bin", content.clone()))));

        let header = read_metadata(&mut client).await.unwrap();
        assert_eq!(header.name, "late.bin");
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, content);
        assert_eq!(task.await.unwrap().unwrap().state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_file() {
        let mut harness = Harness::new(None);
        let session = harness.session(tokio::io::sink()).await;
        let task = tokio::spawn(session.run());

        harness.cancel.cancel();
        let entry = task.await.unwrap().unwrap();
        assert_eq!(entry.state(), SessionState::Cancelled);

        let events = harness.drain();
        assert!(events.iter().any(|e| matches!(e, Event::Log(log) if log.severity == Severity::Warning)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_write() {
        let harness = Harness::new(Some(FileDescriptor::from_bytes("big.bin", sample(1_000_000))));
        // Nobody reads the client half, so writes stall once the pipe is full
        let (server, _client) = tokio::io::duplex(1024);
        let session = harness.session(server).await;
        let id = session.id();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.cancel.cancel();

        let entry = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.id(), id);
        assert_eq!(entry.state(), SessionState::Cancelled);
        assert!(entry.session().bytes_sent < 1_000_000);
    }

    #[tokio::test]
    async fn test_source_shorter_than_announced() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample(10_000)).unwrap();
        file.flush().unwrap();
        let descriptor = FileDescriptor::open(file.path()).await.unwrap();
        file.as_file().set_len(4000).unwrap();

        let mut harness = Harness::new(Some(descriptor));
        harness.config = harness.config.clone().with_chunk_size(1000);
        let session = harness.session(tokio::io::sink()).await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Failed);
        assert_eq!(entry.session().bytes_sent, 4000);
        assert!(entry.status_label().contains("file ended after 4000 of 10000 bytes"));
    }

    #[tokio::test]
    async fn test_empty_file_completes() {
        let harness = Harness::new(Some(FileDescriptor::from_bytes("empty", Vec::new())));
        let session = harness.session(tokio::io::sink()).await;

        let entry = session.run().await.unwrap();
        assert_eq!(entry.state(), SessionState::Completed);
        assert_eq!(entry.session().total_bytes, 0);
    }
}
