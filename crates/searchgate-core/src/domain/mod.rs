//! Domain layer
//!
//! Contains the core business logic and domain models.

pub mod locking;
pub mod queue;
pub mod scheduler;
pub mod search;
pub mod security;
