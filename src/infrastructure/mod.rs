//! Infrastructure layer - External adapters and implementations
//!
//! This layer contains:
//! - Persistence: in-memory and SQLite session stores
//! - Identity: table roster standing in for the identity service
//! - HTTP: REST API routes
//! - WebSocket: real-time transport for GM and player clients
//! - Config and State: environment configuration and shared application state

pub mod clock;
pub mod config;
pub mod http;
pub mod identity;
pub mod persistence;
pub mod state;
pub mod websocket;
