//! In-memory session store for development and testing
//!
//! Not persistent across restarts. Enforces the same version checks as the
//! SQLite store so conflict handling behaves identically.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::application::ports::outbound::{SessionRecord, SessionStorePort, StoreError};
use crate::domain::entities::EventRecord;
use crate::domain::value_objects::SessionId;

#[derive(Default)]
struct StoredSession {
    record: Option<SessionRecord>,
    events: Vec<EventRecord>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorePort for InMemorySessionStore {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.entry(record.session.id).or_default();
        if stored.record.is_some() {
            return Err(StoreError::VersionConflict {
                session_id: record.session.id,
                expected: record.version,
            });
        }
        stored.record = Some(record.clone());
        Ok(())
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).and_then(|s| s.record.clone()))
    }

    async fn list_open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut open: Vec<SessionRecord> = sessions
            .values()
            .filter_map(|s| s.record.as_ref())
            .filter(|r| !r.session.is_ended())
            .cloned()
            .collect();
        open.sort_by_key(|r| r.session.created_at);
        Ok(open)
    }

    async fn list_ended_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut ended: Vec<SessionRecord> = sessions
            .values()
            .filter_map(|s| s.record.as_ref())
            .filter(|r| r.session.is_ended())
            .cloned()
            .collect();
        ended.sort_by_key(|r| r.session.ended_at);
        Ok(ended)
    }

    async fn save_session(
        &self,
        record: &SessionRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&record.session.id)
            .and_then(|s| s.record.as_mut())
            .ok_or(StoreError::NotFound(record.session.id))?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: record.session.id,
                expected: expected_version,
            });
        }
        *stored = record.clone();
        Ok(())
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.entry(event.session_id).or_default();
        if let Some(last) = stored.events.last() {
            if event.sequence <= last.sequence {
                return Err(StoreError::Database(format!(
                    "Sequence {} already stored for session {}",
                    event.sequence, event.session_id
                )));
            }
        }
        stored.events.push(event.clone());
        Ok(())
    }

    async fn events_since(
        &self,
        id: SessionId,
        after_seq: u64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        let Some(stored) = sessions.get(&id) else {
            return Ok(Vec::new());
        };
        let start = stored.events.partition_point(|e| e.sequence <= after_seq);
        let tail = &stored.events[start..];
        let take = limit.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }

    async fn latest_events(&self, id: SessionId, n: usize) -> Result<Vec<EventRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        let Some(stored) = sessions.get(&id) else {
            return Ok(Vec::new());
        };
        let start = stored.events.len().saturating_sub(n);
        Ok(stored.events[start..].to_vec())
    }

    async fn last_sequence(&self, id: SessionId) -> Result<u64, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&id)
            .and_then(|s| s.events.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    async fn purge_session(&self, id: SessionId) -> Result<(), StoreError> {
        self.sessions.write().await.remove(&id);
        Ok(())
    }
}
