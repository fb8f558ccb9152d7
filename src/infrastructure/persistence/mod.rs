//! Session store adapters
//!
//! Two backends behind `SessionStorePort`: an in-memory store for development
//! and tests, and SQLite for durable sessions. `factory` picks one from config.

mod factory;
mod memory_store;
mod sqlite_store;

pub use factory::create_session_store;
pub use memory_store::InMemorySessionStore;
pub use sqlite_store::SqliteSessionStore;
