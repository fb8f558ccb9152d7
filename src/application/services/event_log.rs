//! Event log - Ordered, append-only event stream for one session
//!
//! Sequence allocation, persistence and fan-out happen under one lock, so the
//! order records are stored in is the order every subscriber sees. Recent
//! records stay in a bounded buffer for cheap replay; older ones come back
//! from the store.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::application::ports::outbound::SessionStorePort;
use crate::application::services::SessionError;
use crate::domain::entities::{EventDraft, EventRecord};
use crate::domain::value_objects::{SessionId, UserId};

/// Where a subscription starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "from", content = "value", rename_all = "snake_case")]
pub enum ReplayCursor {
    /// Only events published after subscribing
    #[default]
    Now,
    /// Every event with a sequence greater than this one
    Since(u64),
    /// The most recent N events, capped by the replay limit
    Last(usize),
}

/// Filtered, ordered stream of records for one viewer
pub type EventStream = BoxStream<'static, EventRecord>;

#[derive(Debug, Clone, Copy)]
pub struct EventLogSettings {
    pub buffer_capacity: usize,
    pub channel_capacity: usize,
    pub replay_limit: usize,
}

struct LogInner {
    last_sequence: u64,
    buffer: VecDeque<EventRecord>,
    /// `None` once the session has ended
    sender: Option<broadcast::Sender<EventRecord>>,
}

pub struct EventLog {
    session_id: SessionId,
    store: Arc<dyn SessionStorePort>,
    settings: EventLogSettings,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Open the log, continuing from whatever the store already holds
    pub async fn open(
        session_id: SessionId,
        store: Arc<dyn SessionStorePort>,
        settings: EventLogSettings,
    ) -> Result<Arc<Self>, SessionError> {
        let last_sequence = store.last_sequence(session_id).await?;
        let buffer: VecDeque<EventRecord> = store
            .latest_events(session_id, settings.buffer_capacity)
            .await?
            .into();
        let (sender, _) = broadcast::channel(settings.channel_capacity.max(1));

        Ok(Arc::new(Self {
            session_id,
            store,
            settings,
            inner: Mutex::new(LogInner {
                last_sequence,
                buffer,
                sender: Some(sender),
            }),
        }))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn last_sequence(&self) -> u64 {
        self.inner.lock().await.last_sequence
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.sender.is_none()
    }

    /// Sequence, persist and fan out one event
    pub async fn publish(
        &self,
        draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, SessionError> {
        let mut inner = self.inner.lock().await;
        self.append(&mut inner, draft, now).await
    }

    /// Publish several events back to back with nothing interleaved
    pub async fn publish_all(
        &self,
        drafts: Vec<EventDraft>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, SessionError> {
        let mut inner = self.inner.lock().await;
        self.append_all(&mut inner, drafts, now).await
    }

    /// Publish the final events and close the log in one step, so no other
    /// publish can land after them. The log closes even if appending fails.
    pub async fn publish_all_and_close(
        &self,
        drafts: Vec<EventDraft>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, SessionError> {
        let mut inner = self.inner.lock().await;
        let published = self.append_all(&mut inner, drafts, now).await;
        self.close_locked(&mut inner);
        published
    }

    /// Stop accepting events. Live subscribers drain what they have and end.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner);
    }

    fn close_locked(&self, inner: &mut LogInner) {
        if inner.sender.take().is_some() {
            tracing::debug!(session_id = %self.session_id, "Event log closed");
        }
    }

    async fn append_all(
        &self,
        inner: &mut LogInner,
        drafts: Vec<EventDraft>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, SessionError> {
        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            records.push(self.append(inner, draft, now).await?);
        }
        Ok(records)
    }

    async fn append(
        &self,
        inner: &mut LogInner,
        draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, SessionError> {
        let Some(sender) = inner.sender.clone() else {
            return Err(SessionError::SessionEnded(self.session_id));
        };

        let record = EventRecord::from_draft(self.session_id, inner.last_sequence + 1, draft, now);
        self.store.append_event(&record).await?;

        inner.last_sequence = record.sequence;
        inner.buffer.push_back(record.clone());
        while inner.buffer.len() > self.settings.buffer_capacity {
            inner.buffer.pop_front();
        }

        // No receivers is fine; the record is already durable
        let _ = sender.send(record.clone());
        tracing::trace!(
            session_id = %self.session_id,
            sequence = record.sequence,
            kind = record.kind.as_str(),
            "Event published"
        );
        Ok(record)
    }

    /// Replay from `cursor`, then follow live events, filtered for `viewer`
    pub async fn subscribe(
        self: &Arc<Self>,
        viewer: UserId,
        cursor: ReplayCursor,
    ) -> Result<EventStream, SessionError> {
        let (receiver, replay, head) = {
            let inner = self.inner.lock().await;
            let Some(sender) = inner.sender.as_ref() else {
                return Err(SessionError::SessionNotFound(self.session_id));
            };
            // Subscribe before reading history so nothing falls in between
            let receiver = sender.subscribe();
            let head = inner.last_sequence;
            let replay = self.collect(&inner, cursor, head).await?;
            (receiver, replay, head)
        };

        let start_after = match cursor {
            ReplayCursor::Now => head,
            _ => replay
                .first()
                .map(|first| first.sequence.saturating_sub(1))
                .unwrap_or(head),
        };

        let state = StreamState {
            log: Arc::clone(self),
            viewer,
            pending: replay.into(),
            receiver,
            last_delivered: start_after,
        };
        Ok(Box::pin(stream::unfold(state, next_visible)))
    }

    /// One-shot read of history, filtered for `viewer`
    pub async fn read_back(
        &self,
        viewer: &UserId,
        cursor: ReplayCursor,
    ) -> Result<Vec<EventRecord>, SessionError> {
        let inner = self.inner.lock().await;
        let head = inner.last_sequence;
        let records = self.collect(&inner, cursor, head).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.is_visible_to(viewer))
            .collect())
    }

    /// Records after `after_seq`, used to recover from a lagged receiver
    async fn records_after(&self, after_seq: u64) -> Result<Vec<EventRecord>, SessionError> {
        let inner = self.inner.lock().await;
        let head = inner.last_sequence;
        self.collect(&inner, ReplayCursor::Since(after_seq), head).await
    }

    async fn collect(
        &self,
        inner: &LogInner,
        cursor: ReplayCursor,
        head: u64,
    ) -> Result<Vec<EventRecord>, SessionError> {
        match cursor {
            ReplayCursor::Now => Ok(Vec::new()),
            ReplayCursor::Since(after) => {
                if after >= head {
                    return Ok(Vec::new());
                }
                if buffer_covers(&inner.buffer, after + 1) {
                    return Ok(inner
                        .buffer
                        .iter()
                        .filter(|r| r.sequence > after && r.sequence <= head)
                        .cloned()
                        .collect());
                }
                let mut records = self.store.events_since(self.session_id, after, None).await?;
                records.retain(|r| r.sequence <= head);
                Ok(records)
            }
            ReplayCursor::Last(n) => {
                let n = n.min(self.settings.replay_limit);
                if n == 0 {
                    return Ok(Vec::new());
                }
                let wanted_from = head.saturating_sub(n as u64) + 1;
                if buffer_covers(&inner.buffer, wanted_from) {
                    return Ok(inner
                        .buffer
                        .iter()
                        .filter(|r| r.sequence >= wanted_from && r.sequence <= head)
                        .cloned()
                        .collect());
                }
                let mut records = self.store.latest_events(self.session_id, n).await?;
                records.retain(|r| r.sequence <= head);
                Ok(records)
            }
        }
    }
}

/// Whether the buffer holds every record from `from_seq` up to the head
fn buffer_covers(buffer: &VecDeque<EventRecord>, from_seq: u64) -> bool {
    match buffer.front() {
        Some(front) => front.sequence <= from_seq.max(1),
        None => false,
    }
}

struct StreamState {
    log: Arc<EventLog>,
    viewer: UserId,
    pending: VecDeque<EventRecord>,
    receiver: broadcast::Receiver<EventRecord>,
    last_delivered: u64,
}

async fn next_visible(mut state: StreamState) -> Option<(EventRecord, StreamState)> {
    loop {
        let record = match state.pending.pop_front() {
            Some(record) => record,
            None => match state.receiver.recv().await {
                Ok(record) => record,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = %state.log.session_id(),
                        viewer = %state.viewer,
                        skipped,
                        "Subscriber lagged, refilling from log"
                    );
                    match state.log.records_after(state.last_delivered).await {
                        Ok(records) => {
                            state.pending = records.into();
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Could not refill lagged subscriber");
                            return None;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        };

        // Replay and live delivery can overlap; sequence decides
        if record.sequence <= state.last_delivered {
            continue;
        }
        state.last_delivered = record.sequence;

        if record.is_visible_to(&state.viewer) {
            return Some((record, state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::SystemNotice;
    use crate::infrastructure::persistence::InMemorySessionStore;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn settings(buffer_capacity: usize) -> EventLogSettings {
        EventLogSettings {
            buffer_capacity,
            channel_capacity: 64,
            replay_limit: 50,
        }
    }

    async fn open_log(buffer_capacity: usize) -> Arc<EventLog> {
        let store: Arc<dyn SessionStorePort> = Arc::new(InMemorySessionStore::new());
        EventLog::open(SessionId::new(), store, settings(buffer_capacity))
            .await
            .unwrap()
    }

    async fn publish_texts(log: &EventLog, count: usize) {
        for i in 0..count {
            log.publish(EventDraft::text("alice".into(), format!("msg {i}")), Utc::now())
                .await
                .unwrap();
        }
    }

    async fn take(stream: &mut EventStream, n: usize) -> Vec<u64> {
        let mut sequences = Vec::new();
        for _ in 0..n {
            let record = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("stream stalled")
                .expect("stream ended");
            sequences.push(record.sequence);
        }
        sequences
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let log = open_log(16).await;
        let a = log
            .publish(EventDraft::text("alice".into(), "a"), Utc::now())
            .await
            .unwrap();
        let b = log
            .publish(EventDraft::text("bob".into(), "b"), Utc::now())
            .await
            .unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(log.last_sequence().await, 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let log = open_log(16).await;
        let mut first = log.subscribe("alice".into(), ReplayCursor::Now).await.unwrap();
        let mut second = log.subscribe("bob".into(), ReplayCursor::Now).await.unwrap();

        publish_texts(&log, 5).await;

        assert_eq!(take(&mut first, 5).await, vec![1, 2, 3, 4, 5]);
        assert_eq!(take(&mut second, 5).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_resume_from_cursor_has_no_gap_or_duplicate() {
        let log = open_log(16).await;
        publish_texts(&log, 3).await;

        let mut resumed = log.subscribe("bob".into(), ReplayCursor::Since(2)).await.unwrap();
        publish_texts(&log, 2).await;

        assert_eq!(take(&mut resumed, 3).await, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_falls_back_to_store_beyond_buffer() {
        let log = open_log(2).await;
        publish_texts(&log, 6).await;

        let mut resumed = log.subscribe("bob".into(), ReplayCursor::Since(1)).await.unwrap();
        assert_eq!(take(&mut resumed, 5).await, vec![2, 3, 4, 5, 6]);

        let mut tail = log.subscribe("bob".into(), ReplayCursor::Last(4)).await.unwrap();
        assert_eq!(take(&mut tail, 4).await, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_last_n_is_capped_by_replay_limit() {
        let log = open_log(128).await;
        publish_texts(&log, 80).await;

        let history = log.read_back(&"bob".into(), ReplayCursor::Last(1000)).await.unwrap();
        assert_eq!(history.len(), 50);
        assert_eq!(history.first().map(|r| r.sequence), Some(31));
        assert_eq!(history.last().map(|r| r.sequence), Some(80));
    }

    #[tokio::test]
    async fn test_whispers_filtered_per_viewer() {
        let log = open_log(16).await;
        let mut gm = log.subscribe("gm".into(), ReplayCursor::Now).await.unwrap();
        let mut bob = log.subscribe("bob".into(), ReplayCursor::Now).await.unwrap();

        log.publish(EventDraft::whisper("alice".into(), "gm".into(), "secret"), Utc::now())
            .await
            .unwrap();
        log.publish(EventDraft::text("alice".into(), "hello all"), Utc::now())
            .await
            .unwrap();

        assert_eq!(take(&mut gm, 2).await, vec![1, 2]);
        assert_eq!(take(&mut bob, 1).await, vec![2]);
    }

    #[tokio::test]
    async fn test_closed_log_rejects_publish_and_subscribe() {
        let log = open_log(16).await;
        let mut live = log.subscribe("alice".into(), ReplayCursor::Now).await.unwrap();
        log.publish(
            EventDraft::system("gm".into(), SystemNotice::SessionEnded),
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!log.is_closed().await);
        log.close().await;
        assert!(log.is_closed().await);

        // Drains the last record, then ends
        assert_eq!(take(&mut live, 1).await, vec![1]);
        assert!(live.next().await.is_none());

        assert!(matches!(
            log.publish(EventDraft::text("alice".into(), "late"), Utc::now()).await,
            Err(SessionError::SessionEnded(_))
        ));
        assert!(matches!(
            log.subscribe("alice".into(), ReplayCursor::Now).await,
            Err(SessionError::SessionNotFound(_))
        ));
        assert_eq!(log.read_back(&"alice".into(), ReplayCursor::Since(0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_final_events_and_close_are_one_step() {
        let log = open_log(16).await;
        publish_texts(&log, 2).await;
        let mut live = log.subscribe("bob".into(), ReplayCursor::Now).await.unwrap();

        let finals = log
            .publish_all_and_close(
                vec![
                    EventDraft::system("gm".into(), SystemNotice::TurnsHalted),
                    EventDraft::system("gm".into(), SystemNotice::SessionEnded),
                ],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(finals.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![3, 4]);
        assert!(log.is_closed().await);

        assert_eq!(take(&mut live, 2).await, vec![3, 4]);
        assert!(live.next().await.is_none());
        assert!(matches!(
            log.publish(EventDraft::text("alice".into(), "late"), Utc::now()).await,
            Err(SessionError::SessionEnded(_))
        ));
        assert_eq!(log.last_sequence().await, 4);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_recovers_without_gaps() {
        let store: Arc<dyn SessionStorePort> = Arc::new(InMemorySessionStore::new());
        let log = EventLog::open(
            SessionId::new(),
            store,
            EventLogSettings {
                buffer_capacity: 4,
                channel_capacity: 2,
                replay_limit: 50,
            },
        )
        .await
        .unwrap();

        let mut slow = log.subscribe("bob".into(), ReplayCursor::Now).await.unwrap();
        publish_texts(&log, 10).await;

        assert_eq!(take(&mut slow, 10).await, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let store: Arc<dyn SessionStorePort> = Arc::new(InMemorySessionStore::new());
        let session_id = SessionId::new();
        let log = EventLog::open(session_id, store.clone(), settings(8)).await.unwrap();
        publish_texts(&log, 3).await;

        let reopened = EventLog::open(session_id, store, settings(8)).await.unwrap();
        let record = reopened
            .publish(EventDraft::text("alice".into(), "after restart"), Utc::now())
            .await
            .unwrap();
        assert_eq!(record.sequence, 4);
    }
}
