//! Live session - The single writer for one session's mutable state
//!
//! Every mutation goes through [`LiveSession::mutate`]: the authorization
//! gate runs against the committed state, the change is applied to a working
//! copy, saved with the version it was derived from, and only then made
//! visible. Events produced by the change are published while the state lock
//! is still held, so the log order matches the commit order. Once the save
//! succeeds the mutation has happened, even if its events fail to append.
//!
//! Readers never take the state lock; they read the latest committed
//! snapshot from a `watch` channel.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::application::dto::SessionSnapshot;
use crate::application::ports::outbound::{
    ClockPort, SessionRecord, SessionStorePort, StoreError,
};
use crate::application::services::event_log::{EventLog, EventLogSettings};
use crate::application::services::SessionError;
use crate::domain::aggregates::TurnPhase;
use crate::domain::entities::{EventDraft, Participant, SessionLifecycle};
use crate::domain::value_objects::{SessionId, UserId};

/// Role an operation requires from its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any participant of the session
    Participant,
    /// Only the session's GM
    Gm,
    /// No membership required; the operation checks identity itself
    Open,
}

/// Result of applying an operation to the working copy
#[derive(Debug)]
pub enum Outcome {
    Changed(Vec<EventDraft>),
    Unchanged,
}

/// Deadline the turn timer is waiting for, with the turn sequence it belongs to
type ArmedDeadline = Option<(DateTime<Utc>, u64)>;

/// Pause before the timer retries an expiry that failed on storage
const EXPIRY_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct LiveSession {
    id: SessionId,
    state: Mutex<SessionRecord>,
    log: Arc<EventLog>,
    snapshot_tx: watch::Sender<Arc<SessionSnapshot>>,
    armed_tx: watch::Sender<ArmedDeadline>,
    timer_cancel: CancellationToken,
    store: Arc<dyn SessionStorePort>,
    clock: Arc<dyn ClockPort>,
    max_conflict_retries: u32,
}

impl LiveSession {
    /// Bring a stored session online: open its log, publish a snapshot and
    /// arm the turn timer if a turn is running
    pub async fn open(
        record: SessionRecord,
        store: Arc<dyn SessionStorePort>,
        clock: Arc<dyn ClockPort>,
        log_settings: EventLogSettings,
        max_conflict_retries: u32,
    ) -> Result<Arc<Self>, SessionError> {
        let id = record.session.id;
        let log = EventLog::open(id, Arc::clone(&store), log_settings).await?;
        if record.session.is_ended() {
            log.close().await;
        }

        let snapshot = SessionSnapshot::from_record(&record, log.last_sequence().await);
        let armed = record.scheduler.armed_deadline();
        let (snapshot_tx, _) = watch::channel(Arc::new(snapshot));
        let (armed_tx, armed_rx) = watch::channel(armed);
        let timer_cancel = CancellationToken::new();

        let live = Arc::new(Self {
            id,
            state: Mutex::new(record),
            log,
            snapshot_tx,
            armed_tx,
            timer_cancel: timer_cancel.clone(),
            store,
            clock: Arc::clone(&clock),
            max_conflict_retries,
        });

        tokio::spawn(run_turn_timer(
            Arc::downgrade(&live),
            armed_rx,
            clock,
            timer_cancel,
        ));
        Ok(live)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Latest committed snapshot; never waits on writers
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Apply `op` on behalf of `actor` after the authorization gate
    pub async fn mutate<F>(
        &self,
        actor: &UserId,
        access: Access,
        op: F,
    ) -> Result<Arc<SessionSnapshot>, SessionError>
    where
        F: Fn(&mut SessionRecord, DateTime<Utc>) -> Result<Outcome, SessionError> + Send + Sync,
    {
        let mut state = self.state.lock().await;
        self.commit(&mut state, |record, now| {
            authorize(record, actor, access)?;
            op(record, now)
        })
        .await
    }

    /// Auto-advance the turn if its deadline has passed.
    ///
    /// Returns `true` when this call advanced the turn. A check that arrives
    /// after the turn already moved on is a no-op.
    pub async fn expire_turn(&self) -> Result<bool, SessionError> {
        let mut state = self.state.lock().await;
        let Some((deadline, armed_seq)) = state.scheduler.armed_deadline() else {
            return Ok(false);
        };
        if self.clock.now() < deadline {
            return Ok(false);
        }

        let before = state.version;
        self.commit(&mut state, |record, now| {
            let author = record.session.gm_user_id.clone();
            match record.scheduler.expire(now, armed_seq) {
                Some(notices) => {
                    sync_lifecycle(record);
                    Ok(Outcome::Changed(
                        notices
                            .into_iter()
                            .map(|n| EventDraft::system(author.clone(), n))
                            .collect(),
                    ))
                }
                None => Ok(Outcome::Unchanged),
            }
        })
        .await?;

        let advanced = state.version != before;
        if advanced {
            tracing::info!(
                session_id = %self.id,
                current = ?state.scheduler.state().current,
                round = state.scheduler.state().round,
                "Turn expired, advanced automatically"
            );
        }
        Ok(advanced)
    }

    /// Republish the snapshot, picking up events appended outside a mutation
    pub async fn refresh_snapshot(&self) -> Arc<SessionSnapshot> {
        let state = self.state.lock().await;
        self.publish_snapshot(&state).await
    }

    /// Mark every participant offline in memory; nobody is connected after a restart
    pub async fn mark_all_offline(&self) {
        let mut state = self.state.lock().await;
        for participant in state.participants.iter_mut() {
            participant.online = false;
        }
        self.publish_snapshot(&state).await;
    }

    /// Stop the turn timer for good
    pub fn shutdown(&self) {
        self.timer_cancel.cancel();
    }

    async fn commit<F>(
        &self,
        state: &mut MutexGuard<'_, SessionRecord>,
        op: F,
    ) -> Result<Arc<SessionSnapshot>, SessionError>
    where
        F: Fn(&mut SessionRecord, DateTime<Utc>) -> Result<Outcome, SessionError> + Send + Sync,
    {
        let mut attempt = 0;
        let (drafts, now) = loop {
            let now = self.clock.now();
            let mut working = (**state).clone();
            let drafts = match op(&mut working, now)? {
                Outcome::Changed(drafts) => drafts,
                Outcome::Unchanged => return Ok(self.snapshot()),
            };

            let expected = state.version;
            working.version = expected + 1;
            match self.store.save_session(&working, expected).await {
                Ok(()) => {
                    **state = working;
                    break (drafts, now);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::warn!(
                        session_id = %self.id,
                        expected,
                        attempt,
                        "Version conflict, reloading session state"
                    );
                    match self.store.load_session(self.id).await? {
                        Some(fresh) => **state = fresh,
                        None => return Err(SessionError::SessionNotFound(self.id)),
                    }
                    self.publish_snapshot(state).await;
                    self.rearm(state.scheduler.armed_deadline());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::error!(session_id = %self.id, attempts = attempt + 1, "Giving up after repeated conflicts");
                    return Err(SessionError::ConflictRetry(self.id));
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Committed: an append failure past this point is logged, not returned
        let published = if state.session.is_ended() {
            self.log.publish_all_and_close(drafts, now).await
        } else {
            self.log.publish_all(drafts, now).await
        };
        if let Err(e) = published {
            tracing::error!(
                session_id = %self.id,
                version = state.version,
                error = %e,
                "Change committed but its events were not recorded"
            );
        }
        let snapshot = self.publish_snapshot(state).await;
        self.rearm(state.scheduler.armed_deadline());

        Ok(snapshot)
    }

    async fn publish_snapshot(&self, record: &SessionRecord) -> Arc<SessionSnapshot> {
        let snapshot = Arc::new(SessionSnapshot::from_record(
            record,
            self.log.last_sequence().await,
        ));
        self.snapshot_tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Point the turn timer at the current deadline
    fn rearm(&self, armed: ArmedDeadline) {
        self.armed_tx.send_if_modified(|current| {
            if *current == armed {
                return false;
            }
            *current = armed;
            true
        });
    }
}

/// Per-session timer: sleeps until the armed deadline, then asks the session
/// to expire the turn. A new deadline replaces the one being waited on.
async fn run_turn_timer(
    session: Weak<LiveSession>,
    mut armed_rx: watch::Receiver<ArmedDeadline>,
    clock: Arc<dyn ClockPort>,
    cancel: CancellationToken,
) {
    loop {
        let armed = *armed_rx.borrow_and_update();
        let delay = armed.map(|(deadline, _)| {
            (deadline - clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        });

        let due = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = armed_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = due => {
                let Some(live) = session.upgrade() else { break };
                if let Err(e) = live.expire_turn().await {
                    tracing::warn!(session_id = %live.id(), error = %e, "Turn expiry failed");
                    tokio::time::sleep(EXPIRY_RETRY_DELAY).await;
                }
            }
        }
    }
}

/// The single authorization gate every mutating entry point passes through
pub fn authorize<'a>(
    record: &'a SessionRecord,
    actor: &UserId,
    access: Access,
) -> Result<Option<&'a Participant>, SessionError> {
    if record.session.is_ended() {
        return Err(SessionError::SessionEnded(record.session.id));
    }
    if access == Access::Open {
        return Ok(record.participant(actor));
    }

    let participant = record
        .participant(actor)
        .ok_or_else(|| SessionError::Unauthorized {
            session_id: record.session.id,
            user_id: actor.clone(),
        })?;
    if access == Access::Gm && !(participant.is_gm() && &record.session.gm_user_id == actor) {
        return Err(SessionError::Forbidden(actor.clone()));
    }
    Ok(Some(participant))
}

/// Keep the session lifecycle in step with the scheduler phase
pub fn sync_lifecycle(record: &mut SessionRecord) {
    record.session.lifecycle = match record.scheduler.phase() {
        TurnPhase::Idle => SessionLifecycle::Scheduled,
        TurnPhase::Waiting | TurnPhase::TurnActive => SessionLifecycle::Active,
        TurnPhase::TurnPaused => SessionLifecycle::Paused,
        TurnPhase::Ended => SessionLifecycle::Ended,
    };
}
