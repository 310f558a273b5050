//! Batch enrichment of subject tax ids against the partner consignment API.
//!
//! Two lookup stages per subject (relationship id, then limit details),
//! behind a shared rate governor and an expiring bearer token, with every
//! outcome recorded in the SQLite result store.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod enricher;
pub mod error;
pub mod gateway;
pub mod payload;
pub mod rate_governor;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transport;
pub mod types;
