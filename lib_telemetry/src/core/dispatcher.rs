//! # Sample Dispatcher
//!
//! The `Dispatcher` takes one `PollSample` per tick and delivers it to every
//! subscriber registered at that moment.
//!
//! ## Core Design Principles:
//!
//! 1.  **Encode Once**: The sample is serialized to its JSON wire form a single
//!     time and shared as an `Arc<str>`. Each subscriber queue receives a new
//!     pointer to the same bytes.
//!
//! 2.  **Snapshot Iteration**: Delivery walks a registry snapshot. A subscriber
//!     that joins while a broadcast is running first sees the next tick; one
//!     that leaves mid-broadcast costs at most a failed send.
//!
//! 3.  **Never Block the Poller**: Frames go into bounded per-subscriber queues
//!     with `try_send`. A closed queue removes the subscriber on the spot. A
//!     full queue is handled by the configured `OverflowPolicy`.
//!
//! 4.  **Failure Isolation**: No outcome for one subscriber stops delivery to
//!     the rest of the snapshot.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::registry::{SendError, Subscriber, SubscriberRegistry};

/// # Poll Sample
///
/// One scaled register reading. This is also the wire format sent to
/// subscribers: `{"timestamp": <seconds>, "values": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSample {
    /// Wall-clock time of the reading, in fractional Unix seconds.
    pub timestamp: f64,
    /// Scaled register values in register order.
    pub values: Vec<f64>,
}

impl PollSample {
    /// Stamps `values` with the current wall-clock time.
    pub fn now(values: Vec<f64>) -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Self {
            timestamp: micros as f64 / 1_000_000.0,
            values,
        }
    }

    /// Serializes the sample into its shared wire frame.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// What to do with a subscriber whose queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Skip this sample for the slow subscriber and keep it connected.
    #[default]
    DropNewest,
    /// Remove the slow subscriber, which closes its connection.
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-newest" | "drop_newest" | "drop" => Ok(OverflowPolicy::DropNewest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(format!("unknown overflow policy '{other}' (expected drop-newest or disconnect)")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropNewest => f.write_str("drop-newest"),
            OverflowPolicy::Disconnect => f.write_str("disconnect"),
        }
    }
}

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers whose queue accepted the frame.
    pub delivered: usize,
    /// Subscribers that skipped the frame because their queue was full.
    pub dropped: usize,
    /// Subscribers removed from the registry during this broadcast.
    pub removed: usize,
}

/// # Core Dispatcher
///
/// Fans samples out to the subscribers of a shared `SubscriberRegistry`.
pub struct Dispatcher {
    registry: Arc<SubscriberRegistry>,
    policy: OverflowPolicy,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<SubscriberRegistry>, policy: OverflowPolicy) -> Self {
        Self { registry, policy }
    }

    /// The registry this dispatcher delivers to.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// # Publish
    ///
    /// Encodes `sample` once, takes a registry snapshot and delivers the frame
    /// to every member of it.
    pub fn publish(&self, sample: &PollSample) -> Result<DeliveryReport, serde_json::Error> {
        let frame = sample.to_frame()?;
        let snapshot = self.registry.snapshot();
        Ok(self.fan_out(&snapshot, frame))
    }

    /// Delivers `frame` to each subscriber in `snapshot`.
    pub fn fan_out(&self, snapshot: &[Arc<Subscriber>], frame: Arc<str>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for subscriber in snapshot {
            match subscriber.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(SendError::Closed) => {
                    if self.registry.remove(subscriber.id()) {
                        report.removed += 1;
                        info!(subscriber_id = subscriber.id(), "subscriber gone, removed during broadcast");
                    }
                }
                Err(SendError::Full) => match self.policy {
                    OverflowPolicy::DropNewest => {
                        report.dropped += 1;
                        debug!(
                            subscriber_id = subscriber.id(),
                            dropped_total = subscriber.dropped(),
                            "subscriber queue full, sample skipped"
                        );
                    }
                    OverflowPolicy::Disconnect => {
                        if self.registry.remove(subscriber.id()) {
                            report.removed += 1;
                            info!(subscriber_id = subscriber.id(), "subscriber too slow, disconnecting");
                        }
                    }
                },
            }
        }

        report
    }
}
