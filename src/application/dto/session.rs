use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::ports::outbound::SessionRecord;
use crate::domain::aggregates::TurnState;
use crate::domain::entities::{
    CharacterBinding, Participant, ParticipantRole, SceneState, SessionLifecycle,
};
use crate::domain::value_objects::{CharacterId, SessionId, TableId, UserId};

/// Point-in-time view of a session, enough for a client to render without
/// waiting for the next live event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub table_id: TableId,
    pub gm_user_id: UserId,
    pub lifecycle: SessionLifecycle,
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
    pub turn: TurnState,
    /// `None` until the GM sets a first scene
    pub scene: Option<SceneState>,
    /// Sequence of the last event committed when the snapshot was taken
    pub last_sequence: u64,
    pub version: u64,
}

impl SessionSnapshot {
    pub fn from_record(record: &SessionRecord, last_sequence: u64) -> Self {
        Self {
            session_id: record.session.id,
            table_id: record.session.table_id,
            gm_user_id: record.session.gm_user_id.clone(),
            lifecycle: record.session.lifecycle,
            ended_at: record.session.ended_at,
            participants: record.participants.clone(),
            turn: record.scheduler.state().clone(),
            scene: record.scene.current().cloned(),
            last_sequence,
            version: record.version,
        }
    }

    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| &p.user_id == user_id)
    }
}

/// Row in the session listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummaryDto {
    pub session_id: SessionId,
    pub table_id: TableId,
    pub gm_user_id: UserId,
    pub lifecycle: SessionLifecycle,
    pub participant_count: usize,
    pub online_count: usize,
}

impl From<&SessionSnapshot> for SessionSummaryDto {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            table_id: snapshot.table_id,
            gm_user_id: snapshot.gm_user_id.clone(),
            lifecycle: snapshot.lifecycle,
            participant_count: snapshot.participants.len(),
            online_count: snapshot.participants.iter().filter(|p| p.online).count(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequestDto {
    pub table_id: String,
    pub gm_user_id: String,
    #[serde(default)]
    pub gm_display_name: Option<String>,
    /// Create in `scheduled` instead of going live immediately
    #[serde(default)]
    pub scheduled: bool,
}

/// Caller identity for REST mutations
#[derive(Debug, Deserialize)]
pub struct ActorRequestDto {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GrantRoleRequestDto {
    pub role: ParticipantRole,
}

/// Character a player binds when joining
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CharacterBindingDto {
    pub character_id: String,
    pub name: String,
}

impl CharacterBindingDto {
    /// `None` when the id is not a valid UUID
    pub fn into_binding(self) -> Option<CharacterBinding> {
        CharacterId::parse(&self.character_id).map(|character_id| CharacterBinding {
            character_id,
            name: self.name,
        })
    }
}
