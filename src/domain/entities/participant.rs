//! Participant entity - A user attached to a live session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{CharacterId, UserId};

/// Role a participant holds within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Gm,
    Player,
}

/// Character a player brings to the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterBinding {
    pub character_id: CharacterId,
    pub name: String,
}

/// A user attached to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub display_name: String,
    pub character: Option<CharacterBinding>,
    /// False once the user disconnects; membership is kept for reconnects
    pub online: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        user_id: UserId,
        role: ParticipantRole,
        display_name: impl Into<String>,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            role,
            display_name: display_name.into(),
            character: None,
            online: true,
            joined_at,
        }
    }

    pub fn with_character(mut self, character: Option<CharacterBinding>) -> Self {
        self.character = character;
        self
    }

    pub fn is_gm(&self) -> bool {
        self.role == ParticipantRole::Gm
    }
}
