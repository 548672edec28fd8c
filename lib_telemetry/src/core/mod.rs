//! # Core Engine Module
//!
//! The shared state every part of the gateway coordinates through.
//!
//! ## Core Components:
//!
//! - **`registry`**: The set of live subscribers. Connection handlers add and
//!   remove themselves; the dispatcher iterates a snapshot taken under the
//!   lock, so membership changes never disturb a broadcast in flight.
//!
//! - **`dispatcher`**: Serializes each `PollSample` once and pushes the shared
//!   frame into every subscriber's bounded queue without blocking. A failed
//!   send affects only that subscriber.
//!
//! - **`supervisor`**: Owns the lifecycle of the one background poll task. The
//!   first caller to claim the start flag spawns it; everyone else is a no-op.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The set of live subscribers with snapshot iteration.
pub mod registry;
/// Per-tick fan-out of samples to every subscriber.
pub mod dispatcher;
/// Start-once lifecycle of the background poll task.
pub mod supervisor;

// --- Public API Re-exports ---
pub use registry::{SendError, Subscriber, SubscriberId, SubscriberRegistry};
pub use dispatcher::{DeliveryReport, Dispatcher, OverflowPolicy, PollSample};
pub use supervisor::{PollerState, PollerSupervisor};
