//! Scene state - What the GM is currently showing the table
//!
//! A session has exactly one scene slot. Every update replaces the whole
//! record and takes the next server sequence, so "latest" is the highest
//! sequence regardless of which GM device sent it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{SceneId, UserId};

/// GM-authored scene content, as submitted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneUpdate {
    /// Reuse an existing scene id, or let the engine assign one
    #[serde(default)]
    pub scene_id: Option<SceneId>,
    /// Opaque image reference (id or URL)
    #[serde(default)]
    pub image: Option<String>,
    /// Opaque audio track reference
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// The committed scene every client renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneState {
    pub scene_id: SceneId,
    pub image: Option<String>,
    pub audio: Option<String>,
    pub text: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: UserId,
    /// Server-assigned, strictly increasing per session
    pub sequence: u64,
}

/// Single last-write-wins scene slot for a session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SceneBoard {
    current: Option<SceneState>,
    sequence: u64,
}

impl SceneBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest scene, or `None` when nothing has been set yet
    pub fn current(&self) -> Option<&SceneState> {
        self.current.as_ref()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Replace the scene wholesale; no fields carry over from the prior state
    pub fn apply(&mut self, update: SceneUpdate, author: UserId, now: DateTime<Utc>) -> SceneState {
        self.sequence += 1;
        let scene = SceneState {
            scene_id: update.scene_id.unwrap_or_default(),
            image: update.image,
            audio: update.audio,
            text: update.text,
            updated_at: now,
            updated_by: author,
            sequence: self.sequence,
        };
        self.current = Some(scene.clone());
        scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_board_has_no_scene() {
        let board = SceneBoard::new();
        assert!(board.current().is_none());
        assert_eq!(board.sequence(), 0);
    }

    #[test]
    fn test_later_update_fully_replaces_earlier() {
        let mut board = SceneBoard::new();
        let gm = UserId::from("gm");

        board.apply(
            SceneUpdate {
                scene_id: None,
                image: Some("forest.jpg".into()),
                audio: Some("track-3".into()),
                text: "You enter the forest.".into(),
            },
            gm.clone(),
            Utc::now(),
        );
        let second = board.apply(
            SceneUpdate {
                scene_id: None,
                image: None,
                audio: None,
                text: "Darkness.".into(),
            },
            gm,
            Utc::now(),
        );

        let current = board.current().unwrap();
        assert_eq!(current, &second);
        assert_eq!(current.image, None);
        assert_eq!(current.audio, None);
        assert_eq!(current.text, "Darkness.");
        assert_eq!(current.sequence, 2);
    }

    #[test]
    fn test_explicit_scene_id_is_kept() {
        let mut board = SceneBoard::new();
        let id = SceneId::new();
        let scene = board.apply(
            SceneUpdate {
                scene_id: Some(id),
                ..Default::default()
            },
            "gm".into(),
            Utc::now(),
        );
        assert_eq!(scene.scene_id, id);
    }
}
