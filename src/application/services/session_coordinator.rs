//! Session coordinator - Entry point for everything GM and player views do
//!
//! Owns the registry of live sessions. Turn and scene operations become
//! mutations on the session's [`LiveSession`]; chat and dice go straight to
//! the session's event log after a membership check against the latest
//! snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, RwLock};

use crate::application::dto::{SessionSnapshot, SessionSummaryDto};
use crate::application::ports::outbound::{
    ClockPort, IdentityPort, SessionRecord, SessionStorePort,
};
use crate::application::services::event_log::{EventLogSettings, EventStream, ReplayCursor};
use crate::application::services::live_session::{sync_lifecycle, Access, LiveSession, Outcome};
use crate::application::services::SessionError;
use crate::domain::aggregates::{TurnError, TurnScheduler};
use crate::domain::entities::{
    CharacterBinding, EventDraft, EventRecord, Participant, ParticipantRole, SceneBoard,
    SceneState, SceneUpdate, Session, SessionLifecycle, SystemNotice,
};
use crate::domain::value_objects::{roll, RollVisibility, SessionId, TableId, UserId};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub turn_duration: Duration,
    pub max_conflict_retries: u32,
    pub log: EventLogSettings,
    /// How long an ended session stays readable before it is purged
    pub ended_retention: Duration,
}

/// Identity and profile of a user joining a session
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: UserId,
    pub display_name: String,
    pub character: Option<CharacterBinding>,
}

pub struct SessionCoordinator {
    store: Arc<dyn SessionStorePort>,
    identity: Arc<dyn IdentityPort>,
    clock: Arc<dyn ClockPort>,
    settings: CoordinatorSettings,
    sessions: RwLock<HashMap<SessionId, Arc<LiveSession>>>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn SessionStorePort>,
        identity: Arc<dyn IdentityPort>,
        clock: Arc<dyn ClockPort>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring every open session in the store back online, timers included.
    ///
    /// Ended sessions come back read-only while their retention window lasts;
    /// those already past it are purged instead.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let mut restored = 0;
        for record in self.store.list_open_sessions().await? {
            let id = record.session.id;
            let live = self.open_live(record).await?;
            live.mark_all_offline().await;
            self.sessions.write().await.insert(id, live);
            restored += 1;
        }

        let now = self.clock.now();
        let mut archived = 0;
        for record in self.store.list_ended_sessions().await? {
            let id = record.session.id;
            if self.retention_over(record.session.ended_at, now) {
                match self.store.purge_session(id).await {
                    Ok(()) => {
                        tracing::info!(session_id = %id, "Purged ended session on startup");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "Purge failed, leaving it to the cleanup worker");
                    }
                }
            }
            let live = self.open_live(record).await?;
            live.shutdown();
            self.sessions.write().await.insert(id, live);
            archived += 1;
        }

        if restored + archived > 0 {
            tracing::info!(open = restored, ended = archived, "Restored sessions from store");
        }
        Ok(restored + archived)
    }

    /// Start a session for a table. The creator must hold the GM role at the
    /// table and joins the session as its GM.
    pub async fn create_session(
        &self,
        table_id: TableId,
        gm: JoinRequest,
        scheduled: bool,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        let role = self.identity.resolve_role(table_id, &gm.user_id).await;
        if role != Some(ParticipantRole::Gm) {
            return Err(SessionError::Forbidden(gm.user_id));
        }

        let now = self.clock.now();
        let session = Session::new(table_id, gm.user_id.clone(), scheduled, now);
        let mut scheduler = TurnScheduler::new(self.settings.turn_duration);
        if !scheduled {
            scheduler
                .activate()
                .map_err(|e| SessionError::from_turn(session.id, e))?;
        }

        let mut participant = Participant::new(
            gm.user_id.clone(),
            ParticipantRole::Gm,
            gm.display_name.clone(),
            now,
        )
        .with_character(gm.character);
        participant.online = false;

        let record = SessionRecord {
            session,
            participants: vec![participant],
            scheduler,
            scene: SceneBoard::new(),
            version: 0,
        };
        self.store.create_session(&record).await?;

        let id = record.session.id;
        let live = self.open_live(record).await?;
        let mut drafts = vec![EventDraft::system(
            gm.user_id.clone(),
            SystemNotice::ParticipantJoined {
                user_id: gm.user_id.clone(),
                display_name: gm.display_name,
            },
        )];
        if !scheduled {
            drafts.push(EventDraft::system(gm.user_id.clone(), SystemNotice::SessionActivated));
        }
        live.log().publish_all(drafts, now).await?;
        live.refresh_snapshot().await;

        self.sessions.write().await.insert(id, Arc::clone(&live));
        tracing::info!(session_id = %id, table_id = %table_id, gm = %gm.user_id, scheduled, "Session created");
        Ok(live.snapshot())
    }

    /// Move a scheduled session live
    pub async fn activate_session(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live
            .mutate(actor, Access::Gm, |record, _now| {
                if record.session.lifecycle != SessionLifecycle::Scheduled {
                    return Err(SessionError::InvalidRequest(
                        "Session is already active".to_string(),
                    ));
                }
                record
                    .scheduler
                    .activate()
                    .map_err(|e| SessionError::from_turn(session_id, e))?;
                sync_lifecycle(record);
                Ok(Outcome::Changed(vec![EventDraft::system(
                    actor.clone(),
                    SystemNotice::SessionActivated,
                )]))
            })
            .await?;
        tracing::info!(session_id = %session_id, "Session activated");
        Ok(snapshot)
    }

    /// Attach a user to the session, or bring a returning participant back online.
    ///
    /// Only the session's own GM joins with the GM role; every other member
    /// of the table joins as a player.
    pub async fn join_session(
        &self,
        session_id: SessionId,
        request: JoinRequest,
    ) -> Result<Participant, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live.snapshot();
        if snapshot.lifecycle == SessionLifecycle::Ended {
            return Err(SessionError::SessionEnded(session_id));
        }

        let role = if request.user_id == snapshot.gm_user_id {
            ParticipantRole::Gm
        } else {
            match self
                .identity
                .resolve_role(snapshot.table_id, &request.user_id)
                .await
            {
                Some(_) => ParticipantRole::Player,
                None => {
                    return Err(SessionError::Unauthorized {
                        session_id,
                        user_id: request.user_id,
                    })
                }
            }
        };

        let user_id = request.user_id.clone();
        let snapshot = live
            .mutate(&user_id, Access::Open, |record, now| {
                let notice = SystemNotice::ParticipantJoined {
                    user_id: request.user_id.clone(),
                    display_name: request.display_name.clone(),
                };
                match record.participant_mut(&request.user_id) {
                    Some(existing) => {
                        let was_online = existing.online;
                        existing.online = true;
                        existing.display_name = request.display_name.clone();
                        if request.character.is_some() {
                            existing.character = request.character.clone();
                        }
                        if was_online {
                            return Ok(Outcome::Changed(Vec::new()));
                        }
                    }
                    None => {
                        record.participants.push(
                            Participant::new(
                                request.user_id.clone(),
                                role,
                                request.display_name.clone(),
                                now,
                            )
                            .with_character(request.character.clone()),
                        );
                    }
                }
                Ok(Outcome::Changed(vec![EventDraft::system(
                    request.user_id.clone(),
                    notice,
                )]))
            })
            .await?;

        tracing::info!(session_id = %session_id, user_id = %user_id, role = ?role, "Participant joined");
        snapshot
            .participants
            .iter()
            .find(|p| p.user_id == user_id)
            .cloned()
            .ok_or(SessionError::Unauthorized { session_id, user_id })
    }

    /// Mark a participant offline. Membership is kept so they can reconnect.
    pub async fn leave_session(
        &self,
        session_id: SessionId,
        user_id: &UserId,
    ) -> Result<(), SessionError> {
        let live = self.live(session_id).await?;
        live.mutate(user_id, Access::Participant, |record, _now| {
            match record.participant_mut(user_id) {
                Some(participant) if participant.online => {
                    participant.online = false;
                    Ok(Outcome::Changed(vec![EventDraft::system(
                        user_id.clone(),
                        SystemNotice::ParticipantLeft {
                            user_id: user_id.clone(),
                        },
                    )]))
                }
                _ => Ok(Outcome::Unchanged),
            }
        })
        .await?;
        tracing::info!(session_id = %session_id, user_id = %user_id, "Participant left");
        Ok(())
    }

    /// End the session. Terminal: the log stops accepting events and the
    /// turn timer is cancelled.
    pub async fn end_session(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live
            .mutate(actor, Access::Gm, |record, now| {
                record.session.end(now);
                record.scheduler.end();
                for participant in record.participants.iter_mut() {
                    participant.online = false;
                }
                Ok(Outcome::Changed(vec![EventDraft::system(
                    actor.clone(),
                    SystemNotice::SessionEnded,
                )]))
            })
            .await?;
        tracing::info!(session_id = %session_id, "Session ended");
        Ok(snapshot)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummaryDto> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummaryDto> = sessions
            .values()
            .map(|live| SessionSummaryDto::from(live.snapshot().as_ref()))
            .collect();
        summaries.sort_by_key(|s| s.session_id.to_string());
        summaries
    }

    /// Purge and evict sessions that ended longer ago than the retention
    /// window. A session whose purge fails stays registered for the next sweep.
    pub async fn cleanup_ended(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Arc<LiveSession>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|live| self.retention_over(live.snapshot().ended_at, now))
                .cloned()
                .collect()
        };

        let mut purged = 0;
        for live in expired {
            let id = live.id();
            if let Err(e) = self.store.purge_session(id).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to purge ended session");
                continue;
            }
            self.sessions.write().await.remove(&id);
            live.shutdown();
            purged += 1;
            tracing::info!(session_id = %id, "Purged ended session");
        }
        purged
    }

    /// Cancel every turn timer
    pub async fn shutdown(&self) {
        for live in self.sessions.read().await.values() {
            live.shutdown();
        }
    }

    // ========================================================================
    // Turns (GM only)
    // ========================================================================

    pub async fn start_turn(
        &self,
        session_id: SessionId,
        actor: &UserId,
        order: Vec<UserId>,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "start", |record, now| {
            let participants = &record.participants;
            record.scheduler.start_turn(
                order.clone(),
                |user| participants.iter().any(|p| &p.user_id == user),
                now,
            )
        })
        .await
    }

    pub async fn advance_turn(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "advance", |record, now| {
            record.scheduler.advance(now)
        })
        .await
    }

    pub async fn pause_turn(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "pause", |record, now| {
            record.scheduler.pause(now)
        })
        .await
    }

    pub async fn resume_turn(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "resume", |record, now| {
            record.scheduler.resume(now)
        })
        .await
    }

    pub async fn skip_participant(
        &self,
        session_id: SessionId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "skip", |record, now| {
            record.scheduler.skip(target, now)
        })
        .await
    }

    /// Abandon the running turn sequence and go back to waiting
    pub async fn stop_turns(
        &self,
        session_id: SessionId,
        actor: &UserId,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        self.turn_op(session_id, actor, "stop", |record, _now| {
            record.scheduler.stop()
        })
        .await
    }

    /// Expire the current turn if its deadline has passed. Safe to call
    /// any number of times; only the first call past a deadline advances.
    pub async fn check_turn_expiry(&self, session_id: SessionId) -> Result<bool, SessionError> {
        let live = self.live(session_id).await?;
        live.expire_turn().await
    }

    async fn turn_op<F>(
        &self,
        session_id: SessionId,
        actor: &UserId,
        name: &'static str,
        transition: F,
    ) -> Result<Arc<SessionSnapshot>, SessionError>
    where
        F: Fn(&mut SessionRecord, DateTime<Utc>) -> Result<Vec<SystemNotice>, TurnError>
            + Send
            + Sync,
    {
        let live = self.live(session_id).await?;
        let snapshot = live
            .mutate(actor, Access::Gm, |record, now| {
                let notices = transition(record, now)
                    .map_err(|e| SessionError::from_turn(session_id, e))?;
                sync_lifecycle(record);
                Ok(Outcome::Changed(
                    notices
                        .into_iter()
                        .map(|n| EventDraft::system(actor.clone(), n))
                        .collect(),
                ))
            })
            .await?;

        tracing::info!(
            session_id = %session_id,
            operation = name,
            current = ?snapshot.turn.current,
            round = snapshot.turn.round,
            phase = ?snapshot.turn.phase,
            "Turn transition"
        );
        Ok(snapshot)
    }

    // ========================================================================
    // Scene (GM only)
    // ========================================================================

    /// Replace the scene wholesale; the latest committed update wins
    pub async fn set_scene(
        &self,
        session_id: SessionId,
        actor: &UserId,
        update: SceneUpdate,
    ) -> Result<SceneState, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live
            .mutate(actor, Access::Gm, |record, now| {
                let scene = record.scene.apply(update.clone(), actor.clone(), now);
                Ok(Outcome::Changed(vec![EventDraft::system(
                    actor.clone(),
                    SystemNotice::SceneChanged { scene },
                )]))
            })
            .await?;

        let scene = snapshot
            .scene
            .clone()
            .ok_or_else(|| SessionError::InvalidRequest("Scene was not applied".to_string()))?;
        tracing::info!(session_id = %session_id, scene_id = %scene.scene_id, sequence = scene.sequence, "Scene changed");
        Ok(scene)
    }

    /// Latest scene, `None` until the GM sets one
    pub async fn get_current_scene(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SceneState>, SessionError> {
        Ok(self.live(session_id).await?.snapshot().scene.clone())
    }

    // ========================================================================
    // Chat and dice (any participant)
    // ========================================================================

    /// Post a chat line, or a whisper when `recipient` is given
    pub async fn send_message(
        &self,
        session_id: SessionId,
        author: &UserId,
        text: &str,
        recipient: Option<UserId>,
    ) -> Result<EventRecord, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live.snapshot();
        require_member(&snapshot, author)?;

        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidRequest("Message is empty".to_string()));
        }

        let draft = match recipient {
            Some(recipient) => {
                if !snapshot.is_participant(&recipient) {
                    return Err(SessionError::InvalidRequest(format!(
                        "{recipient} is not in this session"
                    )));
                }
                EventDraft::whisper(author.clone(), recipient, text)
            }
            None => EventDraft::text(author.clone(), text),
        };

        let record = live.log().publish(draft, live.now()).await?;
        tracing::debug!(session_id = %session_id, author = %author, sequence = record.sequence, kind = record.kind.as_str(), "Message sent");
        Ok(record)
    }

    /// Roll and publish. GM-only rolls reach only the roller and the GM.
    pub async fn roll_dice(
        &self,
        session_id: SessionId,
        author: &UserId,
        notation: &str,
        visibility: RollVisibility,
    ) -> Result<EventRecord, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live.snapshot();
        require_member(&snapshot, author)?;

        let result = roll(notation)?.with_visibility(visibility);
        let breakdown = result.breakdown();
        let recipient = match visibility {
            RollVisibility::Public => None,
            RollVisibility::GmOnly => Some(snapshot.gm_user_id.clone()),
        };

        let record = live
            .log()
            .publish(EventDraft::dice(author.clone(), result, recipient), live.now())
            .await?;
        tracing::debug!(session_id = %session_id, author = %author, roll = %breakdown, sequence = record.sequence, "Dice rolled");
        Ok(record)
    }

    // ========================================================================
    // Reads and resync
    // ========================================================================

    pub async fn get_snapshot(&self, session_id: SessionId) -> Result<Arc<SessionSnapshot>, SessionError> {
        Ok(self.live(session_id).await?.snapshot())
    }

    /// Snapshot changes as they are committed
    pub async fn watch_snapshots(
        &self,
        session_id: SessionId,
    ) -> Result<watch::Receiver<Arc<SessionSnapshot>>, SessionError> {
        Ok(self.live(session_id).await?.watch())
    }

    /// Live event stream for `viewer`, starting at `cursor`
    pub async fn subscribe(
        &self,
        session_id: SessionId,
        viewer: &UserId,
        cursor: ReplayCursor,
    ) -> Result<EventStream, SessionError> {
        let live = self.live(session_id).await?;
        let snapshot = live.snapshot();
        if snapshot.lifecycle == SessionLifecycle::Ended {
            return Err(SessionError::SessionNotFound(session_id));
        }
        require_member(&snapshot, viewer)?;
        live.log().subscribe(viewer.clone(), cursor).await
    }

    /// Reconnect: the stream resumes after `last_seen`, or replays recent
    /// history when the client has no cursor. The snapshot is taken after
    /// subscribing, so it is never older than the stream's starting point.
    pub async fn resync(
        &self,
        session_id: SessionId,
        viewer: &UserId,
        last_seen: Option<u64>,
    ) -> Result<(Arc<SessionSnapshot>, EventStream), SessionError> {
        let cursor = match last_seen {
            Some(sequence) => ReplayCursor::Since(sequence),
            None => ReplayCursor::Last(self.settings.log.replay_limit),
        };
        let stream = self.subscribe(session_id, viewer, cursor).await?;
        let snapshot = self.get_snapshot(session_id).await?;
        Ok((snapshot, stream))
    }

    /// History read-back; ended sessions stay readable until purged
    pub async fn read_events(
        &self,
        session_id: SessionId,
        viewer: &UserId,
        cursor: ReplayCursor,
    ) -> Result<Vec<EventRecord>, SessionError> {
        let live = self.live(session_id).await?;
        if !live.snapshot().is_participant(viewer) {
            return Err(SessionError::Unauthorized {
                session_id,
                user_id: viewer.clone(),
            });
        }
        live.log().read_back(viewer, cursor).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn live(&self, session_id: SessionId) -> Result<Arc<LiveSession>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::SessionNotFound(session_id))
    }

    fn retention_over(&self, ended_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        ended_at
            .and_then(|ended| ended.checked_add_signed(self.settings.ended_retention))
            .map(|expires| expires <= now)
            .unwrap_or(false)
    }

    async fn open_live(&self, record: SessionRecord) -> Result<Arc<LiveSession>, SessionError> {
        LiveSession::open(
            record,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.settings.log,
            self.settings.max_conflict_retries,
        )
        .await
    }
}

fn require_member(snapshot: &SessionSnapshot, user_id: &UserId) -> Result<(), SessionError> {
    if snapshot.lifecycle == SessionLifecycle::Ended {
        return Err(SessionError::SessionEnded(snapshot.session_id));
    }
    if !snapshot.is_participant(user_id) {
        return Err(SessionError::Unauthorized {
            session_id: snapshot.session_id,
            user_id: user_id.clone(),
        });
    }
    Ok(())
}
