//! Event record - One immutable entry in a session's ordered event log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::SceneState;
use crate::domain::value_objects::{DiceRollResult, EventId, SessionId, UserId};

/// Category of an event; drives delivery filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Dice,
    System,
    Whisper,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Dice => "dice",
            EventKind::System => "system",
            EventKind::Whisper => "whisper",
        }
    }
}

/// Why the turn moved on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceReason {
    Manual,
    Expired,
    Skipped,
}

/// State changes announced to the table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SystemNotice {
    SessionActivated,
    ParticipantJoined {
        user_id: UserId,
        display_name: String,
    },
    ParticipantLeft {
        user_id: UserId,
    },
    TurnStarted {
        order: Vec<UserId>,
        current: UserId,
        round: u32,
        deadline: DateTime<Utc>,
    },
    TurnAdvanced {
        current: UserId,
        round: u32,
        deadline: DateTime<Utc>,
        reason: AdvanceReason,
    },
    TurnPaused {
        remaining_ms: i64,
    },
    TurnResumed {
        deadline: DateTime<Utc>,
    },
    ParticipantSkipped {
        user_id: UserId,
    },
    /// Turn order ran dry; scheduler is back to waiting
    TurnsHalted,
    SceneChanged {
        scene: SceneState,
    },
    SessionEnded,
}

/// Body of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Text { content: String },
    Dice(DiceRollResult),
    System(SystemNotice),
}

/// An event that has not been sequenced yet
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub author: UserId,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub recipient: Option<UserId>,
}

impl EventDraft {
    pub fn text(author: UserId, content: impl Into<String>) -> Self {
        Self {
            author,
            kind: EventKind::Text,
            payload: EventPayload::Text {
                content: content.into(),
            },
            recipient: None,
        }
    }

    pub fn whisper(author: UserId, recipient: UserId, content: impl Into<String>) -> Self {
        Self {
            author,
            kind: EventKind::Whisper,
            payload: EventPayload::Text {
                content: content.into(),
            },
            recipient: Some(recipient),
        }
    }

    /// A dice event; `recipient` narrows delivery for GM-only rolls
    pub fn dice(author: UserId, result: DiceRollResult, recipient: Option<UserId>) -> Self {
        Self {
            author,
            kind: EventKind::Dice,
            payload: EventPayload::Dice(result),
            recipient,
        }
    }

    pub fn system(author: UserId, notice: SystemNotice) -> Self {
        Self {
            author,
            kind: EventKind::System,
            payload: EventPayload::System(notice),
            recipient: None,
        }
    }
}

/// A sequenced, immutable event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub session_id: SessionId,
    /// Strictly increasing per session, starting at 1
    pub sequence: u64,
    pub author: UserId,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub recipient: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn from_draft(
        session_id: SessionId,
        sequence: u64,
        draft: EventDraft,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            session_id,
            sequence,
            author: draft.author,
            kind: draft.kind,
            payload: draft.payload,
            recipient: draft.recipient,
            created_at,
        }
    }

    /// Narrowed events reach only their author and recipient
    pub fn is_visible_to(&self, viewer: &UserId) -> bool {
        match &self.recipient {
            None => true,
            Some(recipient) => recipient == viewer || &self.author == viewer,
        }
    }
}
