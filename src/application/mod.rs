//! Application layer - Use cases and the ports they depend on
//!
//! Services here orchestrate the domain; the infrastructure layer supplies
//! the adapters behind each port.

pub mod dto;
pub mod ports;
pub mod services;
