//! Domain module - Core scrape-tracking logic and entities
//!
//! This module contains the entities, value objects, the retry state machine
//! and the repository/collaborator interfaces the application layer depends on.

pub mod entities;
pub mod events;
pub mod policy_result;
pub mod repositories;
pub mod retry_state;
pub mod services;
pub mod value_objects;

// Re-export commonly used items
pub use entities::{ContentMetrics, Entity, NewSnapshot, ScrapingStatus, Snapshot, Source};
pub use events::{EntityEvent, EventBus};
pub use policy_result::PolicyResult;
pub use retry_state::{FailureKind, FailureTransition, RetryPolicy};
