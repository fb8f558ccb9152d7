//! Aggregates - Cluster of domain objects treated as a single unit

pub mod turn_scheduler;

pub use turn_scheduler::{TurnError, TurnPhase, TurnScheduler, TurnState};
