//! Outbound ports - Interfaces that the application requires from external systems

mod clock_port;
mod identity_port;
mod session_store_port;

pub use clock_port::ClockPort;
pub use identity_port::IdentityPort;
#[cfg(test)]
pub use identity_port::MockIdentityPort;
pub use session_store_port::{SessionRecord, SessionStorePort, StoreError};
