//! HTTP request handlers for the courier front door.
//!
//! Handlers return `Result<_, ApiError>` and leave status mapping and the
//! JSON error body to [`crate::error::ApiError`].
//!
//! - `publish` - validate a payload and enqueue it on the server's queue or
//!   a named one
//! - `health` - dead-letter queue depth check
//! - `stats` - queue depth and rates from the management API

pub mod health;
pub mod publish;
pub mod stats;

pub use health::{health_check, HealthResponse};
pub use publish::{publish, publish_to_queue};
pub use stats::{queue_stats, StatsResponse};
