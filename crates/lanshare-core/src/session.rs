//! Session data model: one record per accepted connection.
//!
//! A [`Session`] is created in `Handshaking` when a connection is accepted and
//! moves through the state machine below exactly once:
//!
//! ```text
//!  Handshaking ──► Transferring ──► Completed
//!       │               │
//!       ├──► Failed ◄───┤
//!       └──► Cancelled ◄┘
//! ```
//!
//! Terminal sessions are frozen into [`HistoryEntry`] snapshots.

use crate::error::{Error, Result};
use crate::frame::FileHeader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide session id counter. Ids are never reused.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque session identifier, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next unused id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id (lookups, tests)
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for a file and sending the metadata frame
    Handshaking,
    /// Streaming payload
    Transferring,
    /// Every byte was written to the transport
    Completed,
    /// Transport or source failure
    Failed,
    /// Stopped by the operator or by shutdown
    Cancelled,
}

impl SessionState {
    /// Completed, Failed and Cancelled admit no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshaking, Transferring)
                | (Handshaking, Failed)
                | (Handshaking, Cancelled)
                | (Transferring, Completed)
                | (Transferring, Failed)
                | (Transferring, Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Why a session did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Sending the metadata frame failed
    ConnectError(String),
    /// Streaming the payload failed
    TransferError(String),
    /// Still live when the shutdown grace period ran out
    ForcedClose,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectError(msg) => write!(f, "ConnectError: {msg}"),
            Self::TransferError(msg) => write!(f, "TransferError: {msg}"),
            Self::ForcedClose => write!(f, "forced close after shutdown timeout"),
        }
    }
}

/// Snapshot of one connection's transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Remote address as `ip:port`
    pub peer_addr: String,
    /// Name of the shared file, empty until one is selected
    pub file_name: String,
    /// Current state
    pub state: SessionState,
    /// Payload bytes written to the transport
    pub bytes_sent: u64,
    /// Payload size announced in the metadata frame
    pub total_bytes: u64,
    /// Time the connection was accepted
    pub started_at: DateTime<Utc>,
    /// Time the session reached its terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure detail for Failed (and force-closed) sessions
    pub failure_reason: Option<FailureReason>,
}

impl Session {
    /// New session for a freshly accepted connection
    pub fn new(id: SessionId, peer_addr: impl Into<String>) -> Self {
        Self {
            id,
            peer_addr: peer_addr.into(),
            file_name: String::new(),
            state: SessionState::Handshaking,
            bytes_sent: 0,
            total_bytes: 0,
            started_at: Utc::now(),
            ended_at: None,
            failure_reason: None,
        }
    }

    /// Bind the file this session will send. Only valid while handshaking.
    pub fn assign_file(&mut self, header: &FileHeader) -> Result<()> {
        if self.state != SessionState::Handshaking {
            return Err(Error::invalid_state("file can only be assigned while handshaking"));
        }
        self.file_name = header.name.clone();
        self.total_bytes = header.size;
        Ok(())
    }

    /// Record `delta` more payload bytes written
    pub fn record_progress(&mut self, delta: u64) -> Result<u64> {
        if self.state != SessionState::Transferring {
            return Err(Error::invalid_state("progress outside of Transferring"));
        }
        let bytes_sent = self
            .bytes_sent
            .checked_add(delta)
            .filter(|sent| *sent <= self.total_bytes)
            .ok_or_else(|| Error::invalid_state("bytes sent would exceed total bytes"))?;
        self.bytes_sent = bytes_sent;
        Ok(bytes_sent)
    }

    /// Move to `next`, enforcing the state machine
    ///
    /// Completed additionally requires every byte to be sent. Entering a
    /// terminal state stamps `ended_at`.
    pub fn transition_to(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(
                format!("{} -> {} not allowed", self.state, next).into(),
            ));
        }
        if next == SessionState::Completed && self.bytes_sent != self.total_bytes {
            return Err(Error::invalid_state("completed with bytes outstanding"));
        }

        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Check if the session reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transfer progress (0.0 to 1.0)
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == SessionState::Completed {
                1.0
            } else {
                0.0
            };
        }
        self.bytes_sent as f64 / self.total_bytes as f64
    }
}

/// Immutable snapshot of a session in its terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    session: Session,
}

impl HistoryEntry {
    /// Freeze a terminal session. Non-terminal sessions are rejected.
    pub fn from_terminal(session: Session) -> Result<Self> {
        if !session.is_terminal() {
            return Err(Error::invalid_state("history entries must be terminal"));
        }
        Ok(Self { session })
    }

    /// The frozen session
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    /// Terminal state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Status column as shown in the transfer history
    #[must_use]
    pub fn status_label(&self) -> String {
        match (&self.session.state, &self.session.failure_reason) {
            (SessionState::Completed, _) => "Complete".to_string(),
            (SessionState::Failed, Some(reason)) => format!("Failed: {reason}"),
            (SessionState::Cancelled, Some(reason)) => format!("Cancelled: {reason}"),
            (state, _) => state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transferring(total: u64) -> Session {
        let mut session = Session::new(SessionId::next(), "10.0.0.2:50000");
        session.assign_file(&FileHeader::new("a.bin", total)).unwrap();
        session.transition_to(SessionState::Transferring).unwrap();
        session
    }

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_happy_path() {
        let mut session = transferring(1000);
        assert_eq!(session.record_progress(600).unwrap(), 600);
        assert_eq!(session.progress(), 0.6);
        session.record_progress(400).unwrap();
        session.transition_to(SessionState::Completed).unwrap();

        assert!(session.is_terminal());
        assert!(session.ended_at.is_some());
        assert_eq!(session.bytes_sent, session.total_bytes);
    }

    #[test]
    fn test_progress_cannot_exceed_total() {
        let mut session = transferring(100);
        session.record_progress(90).unwrap();
        assert!(session.record_progress(11).is_err());
        assert_eq!(session.bytes_sent, 90);
    }

    #[test]
    fn test_completed_requires_all_bytes() {
        let mut session = transferring(100);
        session.record_progress(50).unwrap();
        assert!(session.transition_to(SessionState::Completed).is_err());
        assert_eq!(session.state, SessionState::Transferring);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut session = transferring(100);
        session.transition_to(SessionState::Failed).unwrap();
        session.failure_reason = Some(FailureReason::TransferError("reset".into()));
        assert!(session.transition_to(SessionState::Cancelled).is_err());
        assert!(session.record_progress(1).is_err());
        assert_eq!(session.state, SessionState::Failed);
    }

    #[test]
    fn test_assign_file_only_while_handshaking() {
        let mut session = transferring(10);
        assert!(session.assign_file(&FileHeader::new("b.bin", 20)).is_err());
        assert_eq!(session.total_bytes, 10);
    }

    #[test]
    fn test_handshake_can_fail_or_cancel() {
        let mut session = Session::new(SessionId::next(), "peer");
        session.transition_to(SessionState::Failed).unwrap();
        session.failure_reason = Some(FailureReason::ConnectError("broken pipe".into()));
        assert_eq!(session.state, SessionState::Failed);

        let mut session = Session::new(SessionId::next(), "peer");
        session.transition_to(SessionState::Cancelled).unwrap();
        assert!(session.is_terminal());
        assert!(session.transition_to(SessionState::Completed).is_err());
    }

    #[test]
    fn test_empty_file_progress() {
        let mut session = transferring(0);
        assert_eq!(session.progress(), 0.0);
        session.transition_to(SessionState::Completed).unwrap();
        assert_eq!(session.progress(), 1.0);
    }

    #[test]
    fn test_history_entry_requires_terminal() {
        let session = transferring(10);
        assert!(HistoryEntry::from_terminal(session.clone()).is_err());

        let mut session = session;
        session.transition_to(SessionState::Cancelled).unwrap();
        let entry = HistoryEntry::from_terminal(session).unwrap();
        assert_eq!(entry.state(), SessionState::Cancelled);
        assert_eq!(entry.status_label(), "Cancelled");
    }

    #[test]
    fn test_status_label() {
        let mut session = transferring(4);
        session.transition_to(SessionState::Failed).unwrap();
        session.failure_reason = Some(FailureReason::TransferError(
            "connection reset by peer".into(),
        ));
        let entry = HistoryEntry::from_terminal(session).unwrap();
        assert_eq!(
            entry.status_label(),
            "Failed: TransferError: connection reset by peer"
        );

        let mut session = transferring(4);
        session.record_progress(4).unwrap();
        session.transition_to(SessionState::Completed).unwrap();
        let entry = HistoryEntry::from_terminal(session).unwrap();
        assert_eq!(entry.status_label(), "Complete");
    }

    #[test]
    fn test_session_serializes() {
        let session = transferring(42);
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"Transferring\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
