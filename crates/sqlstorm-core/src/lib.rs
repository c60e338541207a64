//! Core engine types for the sqlstorm MySQL load-testing harness.
//!
//! This crate holds everything that does not touch the network: the event
//! model produced by worker agents, the single-writer statistics
//! aggregator, error classification, the rotating failure-log writer, and
//! configuration parsing. The binary in `services/sqlstorm-bench` wires
//! these pieces to a real database client and the tokio runtime.

pub mod classify;
pub mod config;
pub mod error;
pub mod event;
pub mod faillog;
pub mod stats;

pub use error::{BenchError, BenchResult, ClientError};
pub use event::{Event, Stage};

use chrono::Utc;
use chrono_tz::Tz;

/// Wall-clock timestamp rendered in the configured reporting time zone.
pub fn now_stamp(tz: Tz) -> String {
    Utc::now()
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
