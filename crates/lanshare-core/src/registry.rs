//! Session registry: live sessions and the transfer history.
//!
//! All mutation goes through one lock, so every reader observes each session
//! either before or after a change, never halfway. Readers receive owned
//! snapshots and never hold the lock across an await.
//!
//! History is append-only and ordered by insertion. It keeps at most
//! `history_capacity` entries; when full, the oldest entry is dropped. Outcome
//! counters in [`RegistrySummary`] are kept separately and are not affected by
//! that eviction.

use crate::error::{Error, Result};
use crate::frame::FileHeader;
use crate::session::{FailureReason, HistoryEntry, Session, SessionId, SessionState};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Outcome counts since the registry was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Sessions currently live
    pub active: usize,
    /// Sessions that sent every byte
    pub completed: u64,
    /// Sessions that failed
    pub failed: u64,
    /// Sessions cancelled by the operator or by shutdown
    pub cancelled: u64,
}

#[derive(Default)]
struct Inner {
    active: HashMap<SessionId, Session>,
    history: VecDeque<HistoryEntry>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl Inner {
    fn push_history(&mut self, entry: HistoryEntry, capacity: usize) {
        match entry.state() {
            SessionState::Completed => self.completed += 1,
            SessionState::Failed => self.failed += 1,
            SessionState::Cancelled => self.cancelled += 1,
            SessionState::Handshaking | SessionState::Transferring => {}
        }

        if self.history.len() >= capacity {
            if let Some(evicted) = self.history.pop_front() {
                tracing::debug!(session = %evicted.id(), "history full, dropping oldest entry");
            }
        }
        self.history.push_back(entry);
    }

    fn active_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.active.get_mut(&id).ok_or(Error::NotFound(id))
    }
}

/// Registry of live sessions and terminal history
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    history_capacity: usize,
}

impl SessionRegistry {
    /// Create a registry keeping at most `history_capacity` history entries
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Add a session
    ///
    /// A session that is already terminal goes straight into history.
    pub async fn register(&self, session: Session) -> Result<()> {
        let mut inner = self.inner.write().await;

        if session.is_terminal() {
            let entry = HistoryEntry::from_terminal(session)?;
            inner.push_history(entry, self.history_capacity);
            return Ok(());
        }

        if inner.active.contains_key(&session.id) {
            return Err(Error::InvalidState(
                format!("session {} already registered", session.id).into(),
            ));
        }
        inner.active.insert(session.id, session);
        Ok(())
    }

    /// Snapshot of a live or historical session
    pub async fn get(&self, id: SessionId) -> Result<Session> {
        let inner = self.inner.read().await;
        if let Some(session) = inner.active.get(&id) {
            return Ok(session.clone());
        }
        inner
            .history
            .iter()
            .rev()
            .find(|entry| entry.id() == id)
            .map(|entry| entry.session().clone())
            .ok_or(Error::NotFound(id))
    }

    /// Snapshots of all live sessions, ordered by id
    pub async fn list_active(&self) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner.active.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// History entries, oldest first
    pub async fn list_history(&self) -> Vec<HistoryEntry> {
        self.inner.read().await.history.iter().cloned().collect()
    }

    /// Number of live sessions
    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    /// Outcome counters
    pub async fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read().await;
        RegistrySummary {
            active: inner.active.len(),
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
        }
    }

    /// Bind the shared file to a handshaking session
    pub async fn assign_file(&self, id: SessionId, header: &FileHeader) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.active_mut(id)?.assign_file(header)
    }

    /// Move a live session to a non-terminal state
    ///
    /// Terminal states go through [`finish`](Self::finish) so they are
    /// recorded in history.
    pub async fn set_state(&self, id: SessionId, state: SessionState) -> Result<()> {
        if state.is_terminal() {
            return Err(Error::invalid_state("terminal states must go through finish"));
        }
        let mut inner = self.inner.write().await;
        inner.active_mut(id)?.transition_to(state)
    }

    /// Record payload bytes written, returning the new total
    pub async fn update_progress(&self, id: SessionId, delta: u64) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.active_mut(id)?.record_progress(delta)
    }

    /// Move a live session to its terminal state and into history
    ///
    /// On error the session is left untouched and stays live.
    pub async fn finish(
        &self,
        id: SessionId,
        state: SessionState,
        reason: Option<FailureReason>,
    ) -> Result<HistoryEntry> {
        if !state.is_terminal() {
            return Err(Error::invalid_state("finish requires a terminal state"));
        }

        let mut inner = self.inner.write().await;
        let mut session = inner.active_mut(id)?.clone();
        session.transition_to(state)?;
        session.failure_reason = reason;

        inner.active.remove(&id);
        let entry = HistoryEntry::from_terminal(session)?;
        inner.push_history(entry.clone(), self.history_capacity);
        Ok(entry)
    }

    /// Cancel every session still live, marking it force-closed
    pub async fn force_close_remaining(&self) -> Vec<HistoryEntry> {
        let mut inner = self.inner.write().await;
        let mut ids: Vec<SessionId> = inner.active.keys().copied().collect();
        ids.sort();

        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut session) = inner.active.remove(&id) else {
                continue;
            };
            if let Err(e) = session.transition_to(SessionState::Cancelled) {
                tracing::warn!(session = %id, "force close: {e}");
                continue;
            }
            session.failure_reason = Some(FailureReason::ForcedClose);

            match HistoryEntry::from_terminal(session) {
                Ok(entry) => {
                    inner.push_history(entry.clone(), self.history_capacity);
                    closed.push(entry);
                }
                Err(e) => tracing::warn!(session = %id, "force close: {e}"),
            }
        }
        closed
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(1000)
    }
}
