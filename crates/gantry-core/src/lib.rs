//! Foundational low-level utilities shared across gantry crates.
//!
//! Provides the clock helper used for job identifiers, UTF-8 safe
//! truncation for captured process output, and the cooperative cancellation
//! token threaded from the orchestrator down into the process supervisor.

pub mod cancellation;
pub mod text_utils;
pub mod time_utils;

pub use cancellation::CancellationToken;
pub use text_utils::truncate_utf8;
pub use time_utils::current_unix_timestamp_ms;
