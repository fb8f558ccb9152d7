//! Data Transfer Objects - For API boundaries
//!
//! DTOs live in the application layer so infrastructure (HTTP/WebSocket) can
//! serialize/deserialize the same shapes the coordinator hands out.

pub mod session;

pub use session::*;
