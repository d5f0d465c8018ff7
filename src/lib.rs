//! Pulse Scraper - self-scheduling revisit pipeline for web content entities
//!
//! Entities are fetched by a pool of queue workers, every attempt is stored
//! as an immutable snapshot, and a policy evaluator decides when each entity
//! is visited next. Failures drive an exponential backoff state machine.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod test_utils;
