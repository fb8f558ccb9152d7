//! Session entity - One live play instance of a table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{SessionId, TableId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLifecycle {
    Scheduled,
    Active,
    Paused,
    Ended,
}

impl SessionLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLifecycle::Scheduled => "scheduled",
            SessionLifecycle::Active => "active",
            SessionLifecycle::Paused => "paused",
            SessionLifecycle::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub table_id: TableId,
    pub gm_user_id: UserId,
    pub lifecycle: SessionLifecycle,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(table_id: TableId, gm_user_id: UserId, scheduled: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            table_id,
            gm_user_id,
            lifecycle: if scheduled {
                SessionLifecycle::Scheduled
            } else {
                SessionLifecycle::Active
            },
            created_at: now,
            ended_at: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle == SessionLifecycle::Ended
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        self.lifecycle = SessionLifecycle::Ended;
        self.ended_at = Some(now);
    }
}
