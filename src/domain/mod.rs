//! Domain layer - Core session logic with no external dependencies
//!
//! This layer contains:
//! - Entities: Session, Participant, EventRecord, SceneBoard
//! - Value Objects: identifiers, dice notation and roll results
//! - Aggregates: the turn scheduler state machine

pub mod aggregates;
pub mod entities;
pub mod value_objects;
