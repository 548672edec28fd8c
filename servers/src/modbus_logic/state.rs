use lib_telemetry::connections::DeviceClient;
use lib_telemetry::core::{Dispatcher, OverflowPolicy, PollerSupervisor, SubscriberRegistry};
use lib_telemetry::ingestors::{PollLoop, PollSettings, PollStats};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::modbus_logic::config::GatewayConfig;

/// Everything a connection handler needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    // Live subscribers; handlers add and remove themselves
    pub registry: Arc<SubscriberRegistry>,
    // Owns the not-yet-started poll loop
    pub supervisor: Arc<PollerSupervisor>,
    // Counters published by the poll loop
    pub stats: Arc<PollStats>,
    pub queue_depth: usize,
    // Cancelled once on process shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires `device` into a poll loop that stays idle until the first
    /// subscriber calls `supervisor.ensure_started()`.
    pub fn new<D: DeviceClient>(
        device: D,
        settings: PollSettings,
        queue_depth: usize,
        policy: OverflowPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), policy));
        let poll_loop = PollLoop::new(device, settings, dispatcher);
        let stats = poll_loop.stats();
        let supervisor = Arc::new(PollerSupervisor::new(
            poll_loop.run(shutdown.clone()),
            shutdown.clone(),
        ));

        Self {
            registry,
            supervisor,
            stats,
            queue_depth: queue_depth.max(1),
            shutdown,
        }
    }

    pub fn from_config<D: DeviceClient>(config: &GatewayConfig, device: D, shutdown: CancellationToken) -> Self {
        Self::new(
            device,
            config.poll.clone(),
            config.subscriber_queue,
            config.overflow_policy,
            shutdown,
        )
    }
}
