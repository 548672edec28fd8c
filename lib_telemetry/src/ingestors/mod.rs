//! # Data Ingestors Module
//!
//! Periodic data sources that feed the `Dispatcher`.
//!
//! ## Contained Modules:
//! - **`modbus_polling`**: The self-scheduling register poll loop. It owns the
//!   `DeviceClient`, reads one register block per tick, scales it, and
//!   publishes the resulting `PollSample`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The fixed-period Modbus register poll loop.
pub mod modbus_polling;

// --- Public API Re-exports ---
pub use modbus_polling::{
    to_engineering_units, Backoff, DeviceState, DeviceTarget, PollLoop, PollSettings, PollStats,
    PollStatsSnapshot, TickOutcome, DEFAULT_POLL_PERIOD, DEFAULT_SCALE,
};
