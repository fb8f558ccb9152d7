//! Application services - Use case implementations
//!
//! The session coordinator is the single entry point for GM and player
//! views; it composes the live session state, the event log and the turn
//! timer behind the store, identity and clock ports.

pub mod event_log;
pub mod live_session;
pub mod session_coordinator;
mod session_error;

pub use event_log::{EventLogSettings, ReplayCursor};
pub use session_coordinator::{CoordinatorSettings, JoinRequest, SessionCoordinator};
pub use session_error::SessionError;
