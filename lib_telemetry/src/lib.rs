//! # lib_telemetry
//!
//! The polling and fan-out engine behind the Modbus telemetry gateway. One
//! background task reads a fixed block of input registers from a device,
//! scales them into engineering units and hands every reading to a dynamic
//! set of subscribers.
//!
//! Modules are gated by folder-level features (`core`, `connections`,
//! `ingestors`), all enabled by default. The `mock-device` feature exposes a
//! scripted in-memory device for tests in dependent crates.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Subscriber registry, dispatcher and the single-poller supervisor.
#[cfg(feature = "core")]
pub mod core;

/// Device-facing clients.
#[cfg(feature = "connections")]
pub mod connections;

/// Periodic data sources feeding the dispatcher.
#[cfg(feature = "ingestors")]
pub mod ingestors;
