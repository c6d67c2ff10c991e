//! Courier HTTP front door.
//!
//! Accepts replay payloads over HTTP and publishes them to one provisioned
//! queue, and reports the queue's health and throughput:
//!
//! - `POST /` - validate and enqueue a payload (204, or 400 with a JSON
//!   error)
//! - `POST /{queue}` - the same for a named queue, provisioned on first use
//! - `GET /health` - 200 while the dead-letter queue is empty
//! - `GET /stats` - depth and rates from the broker management API
//!
//! Configuration for the whole service lives in [`config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod management;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ErrorBody};
pub use management::{ManagementClient, ManagementError, QueueStats};
pub use server::{create_router, shutdown_signal, start_server, AppState};
