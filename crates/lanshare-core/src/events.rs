//! Event bus between the engine and its observers.
//!
//! Sessions and the acceptor publish progress, lifecycle and log events; any
//! number of observers (a terminal UI, a log sink, tests) subscribe.
//!
//! # Backpressure
//!
//! Each subscriber has a bounded queue. Publishing never blocks: when a
//! subscriber falls behind, its oldest undelivered events are overwritten. The
//! subscriber learns about it on its next read (a `warn!` plus the running
//! [`EventSubscription::dropped`] count) and continues with the oldest event
//! still queued. Per-subscriber order always equals publish order.
//!
//! The bus also keeps the most recent [`LogEvent`]s so that observers attached
//! late can show past log lines.

use crate::session::{HistoryEntry, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{error, info, warn};

/// Log event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Normal operation
    Info,
    /// Operator-initiated or recoverable condition
    Warning,
    /// A session failed
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One operator-visible log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Time of the event
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: Severity,
    /// Message text
    pub message: String,
    /// Session the event refers to, if any
    pub session_id: Option<SessionId>,
}

impl LogEvent {
    /// Create a log event stamped now
    pub fn new(severity: Severity, message: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            session_id,
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.severity,
            self.message
        )
    }
}

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum Event {
    /// The acceptor is listening
    ListenerStarted {
        /// Bound address
        addr: SocketAddr,
    },
    /// The acceptor stopped and every session is terminal
    ListenerStopped,
    /// The operator selected the file to share
    FileSelected {
        /// File name
        name: String,
        /// File size in bytes
        size: u64,
    },
    /// A connection was accepted
    SessionStarted {
        /// New session
        id: SessionId,
        /// Remote address
        peer_addr: String,
    },
    /// A chunk was written to a peer
    Progress {
        /// Session
        id: SessionId,
        /// Payload bytes written so far
        bytes_sent: u64,
        /// Announced payload size
        total_bytes: u64,
    },
    /// A session reached its terminal state
    SessionEnded(HistoryEntry),
    /// Log line
    Log(LogEvent),
}

struct BusInner {
    sender: broadcast::Sender<Event>,
    recent_logs: Mutex<VecDeque<LogEvent>>,
    log_capacity: usize,
}

/// Broadcast bus for engine events
///
/// Cloning is cheap; clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with `event_capacity` queued events per subscriber and
    /// `log_capacity` retained log events
    #[must_use]
    pub fn new(event_capacity: usize, log_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                recent_logs: Mutex::new(VecDeque::with_capacity(log_capacity.min(1024))),
                log_capacity: log_capacity.max(1),
            }),
        }
    }

    /// Publish an event to every subscriber
    ///
    /// Never blocks. Events published with no subscribers are discarded
    /// (log events are still retained).
    pub fn publish(&self, event: Event) {
        if let Event::Log(log) = &event {
            let mut logs = self
                .inner
                .recent_logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if logs.len() >= self.inner.log_capacity {
                logs.pop_front();
            }
            logs.push_back(log.clone());
        }

        // Err only means nobody is subscribed
        let _ = self.inner.sender.send(event);
    }

    /// Emit a log line to `tracing` and publish it as a [`LogEvent`]
    pub fn log(&self, severity: Severity, message: impl Into<String>, session_id: Option<SessionId>) {
        let event = LogEvent::new(severity, message, session_id);

        match (severity, session_id) {
            (Severity::Info, Some(id)) => info!(session = %id, "{}", event.message),
            (Severity::Info, None) => info!("{}", event.message),
            (Severity::Warning, Some(id)) => warn!(session = %id, "{}", event.message),
            (Severity::Warning, None) => warn!("{}", event.message),
            (Severity::Error, Some(id)) => error!(session = %id, "{}", event.message),
            (Severity::Error, None) => error!("{}", event.message),
        }

        self.publish(Event::Log(event));
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.inner.sender.subscribe(),
            dropped: 0,
            logs_only: false,
        }
    }

    /// Most recent log events, oldest first
    #[must_use]
    pub fn recent_logs(&self) -> Vec<LogEvent> {
        self.inner
            .recent_logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096, 1000)
    }
}

/// One observer's view of the bus
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    dropped: u64,
    logs_only: bool,
}

impl EventSubscription {
    /// Only yield [`Event::Log`] events
    #[must_use]
    pub fn logs_only(mut self) -> Self {
        self.logs_only = true;
        self
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the bus and every clone of it are dropped.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already queued event, without waiting
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber missed because it fell behind
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn accepts(&self, event: &Event) -> bool {
        !self.logs_only || matches!(event, Event::Log(_))
    }

    fn record_lag(&mut self, n: u64) {
        self.dropped += n;
        warn!(lagged = n, total = self.dropped, "event subscriber lagged, dropped oldest events");
    }
}
