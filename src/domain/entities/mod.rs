//! Domain entities - Core objects of a live session

mod event_record;
mod participant;
mod scene;
mod session;

pub use event_record::{
    AdvanceReason, EventDraft, EventKind, EventPayload, EventRecord, SystemNotice,
};
pub use participant::{CharacterBinding, Participant, ParticipantRole};
pub use scene::{SceneBoard, SceneState, SceneUpdate};
pub use session::{Session, SessionLifecycle};
