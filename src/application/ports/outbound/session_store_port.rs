//! Session store port - Durable storage for live session state and event logs
//!
//! Session state is saved as one versioned record. Every save names the
//! version it was derived from; a store that already holds a newer version
//! rejects the write with `VersionConflict` so the caller can reload and
//! reapply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::aggregates::TurnScheduler;
use crate::domain::entities::{EventRecord, Participant, SceneBoard, Session};
use crate::domain::value_objects::{SessionId, UserId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Session {session_id} was modified concurrently (expected version {expected})")]
    VersionConflict { session_id: SessionId, expected: u64 },
    #[error("Session {0} not found in store")]
    NotFound(SessionId),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Everything mutable about one session, persisted as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    /// Ordered by join time
    pub participants: Vec<Participant>,
    pub scheduler: TurnScheduler,
    pub scene: SceneBoard,
    /// Bumped by one on every committed save
    pub version: u64,
}

impl SessionRecord {
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participant(user_id).is_some()
    }
}

#[async_trait]
pub trait SessionStorePort: Send + Sync {
    /// Store a brand new session record
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Every session that has not ended
    async fn list_open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Ended sessions not purged yet
    async fn list_ended_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Replace the stored record if it is still at `expected_version`.
    /// `record.version` must be `expected_version + 1`.
    async fn save_session(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Append one sequenced event
    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError>;

    /// Events with sequence greater than `after_seq`, in order
    async fn events_since(
        &self,
        id: SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The last `n` events, in order
    async fn latest_events(&self, id: SessionId, n: usize) -> Result<Vec<EventRecord>, StoreError>;

    /// Highest sequence stored for the session, 0 when none
    async fn last_sequence(&self, id: SessionId) -> Result<u64, StoreError>;

    /// Drop the session and its events
    async fn purge_session(&self, id: SessionId) -> Result<(), StoreError>;
}
