//! Payload model describing one HTTP replay.
//!
//! A payload is the JSON document carried as the body of every queued
//! message. It is decoded twice in a message's life: once by the front door
//! to validate before publishing, and once by each consumer before the HTTP
//! call. The raw bytes travel through the broker unchanged.

use std::{collections::BTreeMap, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};

/// Retry count applied when the payload omits `retries`.
pub const DEFAULT_RETRIES: i64 = 2;

/// Largest accepted retry count.
pub const MAX_RETRIES: i64 = 9;

/// Backoff base in seconds applied when the payload omits `backoff`.
pub const DEFAULT_BACKOFF_SECONDS: u64 = 1;

/// Per-attempt HTTP timeout applied when the payload omits `timeout`.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Largest accepted per-attempt HTTP timeout.
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Decoded HTTP replay intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Destination URL for the POST.
    #[serde(default, alias = "Endpoint")]
    pub endpoint: String,

    /// Request body, base64 encoded when `base64_decode` is set.
    #[serde(default, alias = "Content")]
    pub content: String,

    /// Whether `content` must be base64 decoded before sending.
    #[serde(default, alias = "Base64Decode")]
    pub base64_decode: bool,

    /// Remaining retries after the first attempt.
    #[serde(default = "default_retries", alias = "Retries")]
    pub retries: i64,

    /// Headers attached to the outgoing request.
    #[serde(default, alias = "Headers")]
    pub headers: BTreeMap<String, String>,

    /// Base backoff in seconds, doubled on every attempt.
    #[serde(default = "default_backoff", alias = "Backoff")]
    pub backoff: u64,

    /// Per-attempt HTTP timeout in seconds.
    #[serde(default = "default_timeout", alias = "Timeout")]
    pub timeout: u64,
}

fn default_retries() -> i64 {
    DEFAULT_RETRIES
}

fn default_backoff() -> u64 {
    DEFAULT_BACKOFF_SECONDS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Payload {
    /// Creates a payload for `endpoint` with every other field defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            content: String::new(),
            base64_decode: false,
            retries: DEFAULT_RETRIES,
            headers: BTreeMap::new(),
            backoff: DEFAULT_BACKOFF_SECONDS,
            timeout: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    /// Decodes and validates a payload from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON object of the expected
    /// shape, or if any field fails [`Payload::validate`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(bytes)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Checks field ranges.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(CourierError::MissingEndpoint);
        }
        if !(0..=MAX_RETRIES).contains(&self.retries) {
            return Err(CourierError::RetriesOutOfRange { retries: self.retries });
        }
        if self.backoff == 0 {
            return Err(CourierError::InvalidBackoff);
        }
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&self.timeout) {
            return Err(CourierError::TimeoutOutOfRange { timeout: self.timeout });
        }
        if self.base64_decode {
            STANDARD.decode(self.content.as_bytes())?;
        }
        Ok(())
    }

    /// Returns the bytes to send as the HTTP request body.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is flagged as base64 but does not decode.
    pub fn body(&self) -> Result<Bytes> {
        if self.base64_decode {
            Ok(Bytes::from(STANDARD.decode(self.content.as_bytes())?))
        } else {
            Ok(Bytes::from(self.content.clone()))
        }
    }

    /// Per-attempt timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
