//! Core payload model and error codes.
//!
//! Provides the JSON payload that describes an HTTP replay, its validation
//! rules, and the coded error taxonomy shared by the front door and the
//! delivery workers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod payload;

pub use error::{CourierError, Result};
pub use payload::{
    Payload, DEFAULT_BACKOFF_SECONDS, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECONDS, MAX_RETRIES,
    MAX_TIMEOUT_SECONDS,
};
