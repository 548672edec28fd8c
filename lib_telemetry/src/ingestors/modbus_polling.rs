//! # Modbus Register Poll Loop
//!
//! A self-scheduling ingestor: it owns the device connection, wakes on a
//! fixed period, reads one block of input registers, scales it into
//! engineering units and hands the `PollSample` to the `Dispatcher`.
//!
//! ## Key Design Principles:
//! - **Never Crash the Loop**: Every tick yields an explicit `TickOutcome`.
//!   Device failures cost that tick's publish and nothing else; the loop only
//!   ends when the shutdown token is cancelled.
//! - **Exclusive Device Ownership**: The `DeviceClient` and its connection
//!   state live inside the loop and are touched by nothing else.
//! - **Bounded Reconnects**: Connection attempts only happen on tick
//!   boundaries, spaced by an exponential `Backoff` that resets after a
//!   successful read, not merely a successful connect.
//! - **Quiet Failure Logging**: The first failure of a given kind logs at
//!   `warn`; repeats of the same kind log at `debug` until the device recovers.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connections::{DeviceClient, DeviceError, DeviceErrorKind};
use crate::core::dispatcher::{DeliveryReport, Dispatcher, PollSample};

/// Default raw-to-engineering-unit factor applied to every register.
pub const DEFAULT_SCALE: f64 = 12.0 / 36306.925;
/// Default tick period.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(51);

/// Scales raw register values: `value * scale` for each element.
pub fn to_engineering_units<T>(raw: &[T], scale: f64) -> Vec<f64>
where
    T: Copy + Into<f64>,
{
    raw.iter().map(|&v| v.into() * scale).collect()
}

/// Where and what to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    /// Device host name or IP address.
    pub host: String,
    /// Device TCP port.
    pub port: u16,
    /// Modbus unit (slave) identifier.
    pub unit_id: u8,
    /// First input register address.
    pub register_start: u16,
    /// Number of registers per read.
    pub register_count: u16,
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self {
            host: "192.168.0.1".to_string(),
            port: 502,
            unit_id: 255,
            register_start: 0,
            register_count: 23,
        }
    }
}

/// Tunables of the poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Device address and register block.
    pub target: DeviceTarget,
    /// Time between ticks.
    pub period: Duration,
    /// Multiplier applied to each raw register.
    pub scale: f64,
    /// First reconnect delay after a failure.
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max: Duration,
    /// Skip device reads while nobody is subscribed.
    pub pause_when_idle: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            target: DeviceTarget::default(),
            period: DEFAULT_POLL_PERIOD,
            scale: DEFAULT_SCALE,
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            pause_when_idle: false,
        }
    }
}

/// State of the device connection owned by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// No connection has been made yet, or the loop has stopped.
    Disconnected,
    /// Connected and readable.
    Connected,
    /// The connection was lost and has not been re-established.
    Faulted,
}

impl DeviceState {
    fn to_u8(self) -> u8 {
        match self {
            DeviceState::Disconnected => 0,
            DeviceState::Connected => 1,
            DeviceState::Faulted => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DeviceState::Connected,
            2 => DeviceState::Faulted,
            _ => DeviceState::Disconnected,
        }
    }
}

/// Exponential reconnect delay: `base * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff starting at `base`. A `max` below `base` is raised to it.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// The delay before the next attempt; grows on every call.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Back to `base` after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// # Tick Outcome
///
/// The explicit result of one poll cycle.
#[derive(Debug)]
pub enum TickOutcome {
    /// A sample was produced and handed to the dispatcher.
    Published(DeliveryReport),
    /// Nobody is subscribed and idle pausing is on; the device was not read.
    Paused,
    /// Disconnected and still inside the reconnect backoff window.
    AwaitingReconnect {
        /// Time left until the next connect attempt.
        retry_in: Duration,
    },
    /// A connect attempt failed.
    ConnectFailed {
        /// The connect error.
        error: DeviceError,
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// The register read failed.
    ReadFailed(DeviceError),
    /// The sample could not be serialized.
    EncodeFailed(serde_json::Error),
}

impl TickOutcome {
    /// True when this tick published a sample.
    pub fn is_published(&self) -> bool {
        matches!(self, TickOutcome::Published(_))
    }
}

/// Counters shared between the loop and observers such as a health endpoint.
#[derive(Debug, Default)]
pub struct PollStats {
    ticks_published: AtomicU64,
    ticks_failed: AtomicU64,
    device_state: AtomicU8,
    last_sample_ts: Mutex<Option<f64>>,
}

/// Point-in-time copy of `PollStats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatsSnapshot {
    /// Current device connection state.
    pub device: DeviceState,
    /// Ticks that published a sample.
    pub ticks_published: u64,
    /// Ticks that failed to connect, read or encode.
    pub ticks_failed: u64,
    /// Timestamp of the most recent published sample.
    pub last_sample_ts: Option<f64>,
}

impl PollStats {
    fn set_device_state(&self, state: DeviceState) {
        self.device_state.store(state.to_u8(), Ordering::Relaxed);
    }

    fn record_sample(&self, timestamp: f64) {
        self.ticks_published.fetch_add(1, Ordering::Relaxed);
        *self.last_sample_ts.lock().unwrap_or_else(PoisonError::into_inner) = Some(timestamp);
    }

    fn record_failure(&self) {
        self.ticks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            device: DeviceState::from_u8(self.device_state.load(Ordering::Relaxed)),
            ticks_published: self.ticks_published.load(Ordering::Relaxed),
            ticks_failed: self.ticks_failed.load(Ordering::Relaxed),
            last_sample_ts: *self.last_sample_ts.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// # Poll Loop
///
/// The single background task that reads the device.
pub struct PollLoop<D: DeviceClient> {
    device: D,
    settings: PollSettings,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<PollStats>,
    state: DeviceState,
    backoff: Backoff,
    retry_at: Option<Instant>,
    failure_streak: u64,
    last_fault: Option<DeviceErrorKind>,
}

impl<D: DeviceClient> PollLoop<D> {
    /// Creates a loop that has not connected yet. A zero period is raised to
    /// one millisecond.
    pub fn new(device: D, mut settings: PollSettings, dispatcher: Arc<Dispatcher>) -> Self {
        settings.period = settings.period.max(Duration::from_millis(1));
        let backoff = Backoff::new(settings.reconnect_base, settings.reconnect_max);
        Self {
            device,
            settings,
            dispatcher,
            stats: Arc::new(PollStats::default()),
            state: DeviceState::Disconnected,
            backoff,
            retry_at: None,
            failure_streak: 0,
            last_fault: None,
        }
    }

    /// Shared counters for this loop.
    pub fn stats(&self) -> Arc<PollStats> {
        Arc::clone(&self.stats)
    }

    /// Current device connection state.
    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "device state changed");
        }
        self.state = state;
        self.stats.set_device_state(state);
    }

    fn schedule_reconnect(&mut self) -> Duration {
        let retry_in = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + retry_in);
        retry_in
    }

    /// # Main Execution Loop
    ///
    /// Ticks every `period` until `shutdown` is cancelled. Ticks that overrun
    /// the period delay the schedule rather than bursting to catch up.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let target = &self.settings.target;
        info!(
            host = %target.host,
            port = target.port,
            unit_id = target.unit_id,
            register_start = target.register_start,
            register_count = target.register_count,
            period_ms = self.settings.period.as_millis() as u64,
            "register poll loop started"
        );

        let mut ticker = interval(self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            self.record(&outcome);
        }

        self.device.disconnect();
        self.set_state(DeviceState::Disconnected);
        info!("register poll loop stopped");
    }

    /// # Tick
    ///
    /// One poll cycle: (re)connect if needed, read, scale, publish.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.settings.pause_when_idle && self.dispatcher.registry().is_empty() {
            return TickOutcome::Paused;
        }

        if !self.device.is_connected() {
            if self.state == DeviceState::Connected {
                self.set_state(DeviceState::Faulted);
            }
            if let Some(at) = self.retry_at {
                let now = Instant::now();
                if now < at {
                    return TickOutcome::AwaitingReconnect { retry_in: at - now };
                }
            }

            let target = &self.settings.target;
            match self.device.connect(&target.host, target.port).await {
                // The backoff only resets on a good read, so a device that
                // accepts and then drops every request keeps backing off.
                Ok(()) => {
                    self.retry_at = None;
                    self.set_state(DeviceState::Connected);
                }
                Err(error) => {
                    let retry_in = self.schedule_reconnect();
                    return TickOutcome::ConnectFailed { error, retry_in };
                }
            }
        }

        let target = &self.settings.target;
        let read = self
            .device
            .read_block(target.register_start, target.register_count, target.unit_id)
            .await;

        match read {
            Ok(raw) => {
                self.backoff.reset();
                let sample = PollSample::now(to_engineering_units(&raw, self.settings.scale));
                match self.dispatcher.publish(&sample) {
                    Ok(report) => {
                        self.stats.record_sample(sample.timestamp);
                        TickOutcome::Published(report)
                    }
                    Err(e) => TickOutcome::EncodeFailed(e),
                }
            }
            Err(error) => {
                if error.requires_reconnect() || !self.device.is_connected() {
                    self.device.disconnect();
                    self.set_state(DeviceState::Faulted);
                    self.schedule_reconnect();
                }
                TickOutcome::ReadFailed(error)
            }
        }
    }

    fn record(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Published(report) => {
                if self.failure_streak > 0 {
                    info!(failed_ticks = self.failure_streak, "device recovered, publishing resumed");
                }
                self.failure_streak = 0;
                self.last_fault = None;
                trace!(
                    delivered = report.delivered,
                    dropped = report.dropped,
                    removed = report.removed,
                    "sample published"
                );
            }
            TickOutcome::Paused => trace!("no subscribers, device read skipped"),
            TickOutcome::AwaitingReconnect { retry_in } => {
                trace!(retry_in_ms = retry_in.as_millis() as u64, "waiting to reconnect");
            }
            TickOutcome::ConnectFailed { error, retry_in } => self.note_fault(error, Some(*retry_in)),
            TickOutcome::ReadFailed(error) => self.note_fault(error, None),
            TickOutcome::EncodeFailed(e) => {
                self.stats.record_failure();
                error!(error = %e, "failed to encode sample");
            }
        }
    }

    fn note_fault(&mut self, error: &DeviceError, retry_in: Option<Duration>) {
        self.failure_streak += 1;
        self.stats.record_failure();

        let kind = error.kind();
        let retry_in_ms = retry_in.map(|d| d.as_millis() as u64);
        if self.last_fault == Some(kind) {
            debug!(kind = %kind, error = %error, failed_ticks = self.failure_streak, retry_in_ms, "device poll failed again");
        } else {
            warn!(kind = %kind, error = %error, failed_ticks = self.failure_streak, retry_in_ms, "device poll failed");
            self.last_fault = Some(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::mock::{MockDevice, MockFault};
    use crate::core::dispatcher::OverflowPolicy;
    use crate::core::registry::SubscriberRegistry;
    use crate::core::supervisor::PollerSupervisor;
    use tokio::time::timeout;

    fn settings(count: u16) -> PollSettings {
        PollSettings {
            target: DeviceTarget {
                host: "mock".to_string(),
                port: 502,
                unit_id: 1,
                register_start: 0,
                register_count: count,
            },
            period: Duration::from_millis(5),
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(80),
            ..PollSettings::default()
        }
    }

    fn dispatcher() -> (Arc<SubscriberRegistry>, Arc<Dispatcher>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), OverflowPolicy::DropNewest));
        (registry, dispatcher)
    }

    #[test]
    fn test_transform_with_default_scale() {
        let values = to_engineering_units(&[0u32, 36307, 72614], DEFAULT_SCALE);
        let expected = [0.0, 12.0003, 24.0006];
        assert_eq!(values.len(), 3);
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_tick_connects_then_publishes() {
        let (device, probe) = MockDevice::new(vec![100; 4]);
        let (registry, dispatcher) = dispatcher();
        let (_id, mut rx) = registry.register(4);
        let mut poll = PollLoop::new(device, settings(4), dispatcher);

        let outcome = poll.tick().await;

        assert!(outcome.is_published(), "{outcome:?}");
        assert_eq!(probe.connects(), 1);
        assert_eq!(poll.device_state(), DeviceState::Connected);
        let frame = rx.recv().await.unwrap();
        let sample: PollSample = serde_json::from_str(&frame).unwrap();
        assert_eq!(sample.values.len(), 4);
        assert!((sample.values[0] - 100.0 * DEFAULT_SCALE).abs() < 1e-9);

        probe.set_registers(vec![0, 36307]);
        assert!(poll.tick().await.is_published());
        let sample: PollSample = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sample.values.len(), 4);
        assert!((sample.values[1] - 12.0003).abs() < 1e-3);
        assert_eq!(sample.values[3], 0.0);
        assert_eq!(probe.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_waits_for_backoff() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (_registry, dispatcher) = dispatcher();
        probe.fail_next_connects(1);
        let mut poll = PollLoop::new(device, settings(2), dispatcher);

        assert!(matches!(poll.tick().await, TickOutcome::ConnectFailed { .. }));
        assert!(matches!(poll.tick().await, TickOutcome::AwaitingReconnect { .. }));
        assert_eq!(probe.connects(), 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(poll.tick().await.is_published());
        assert_eq!(probe.connects(), 2);
    }

    #[tokio::test]
    async fn test_connection_loss_faults_and_reconnects_later() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (_registry, dispatcher) = dispatcher();
        let mut poll = PollLoop::new(device, settings(2), dispatcher);

        assert!(poll.tick().await.is_published());
        probe.fail_next_reads(1, MockFault::ConnectionLost);
        assert!(matches!(poll.tick().await, TickOutcome::ReadFailed(_)));
        assert_eq!(poll.device_state(), DeviceState::Faulted);
        assert!(matches!(poll.tick().await, TickOutcome::AwaitingReconnect { .. }));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(poll.tick().await.is_published());
        assert_eq!(probe.connects(), 2);
        assert_eq!(poll.device_state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_repeated_connection_loss_keeps_backing_off() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (_registry, dispatcher) = dispatcher();
        probe.fail_next_reads(100_000, MockFault::ConnectionLost);
        let mut cfg = settings(2);
        cfg.reconnect_base = Duration::from_millis(20);
        cfg.reconnect_max = Duration::from_millis(160);

        let poll = PollLoop::new(device, cfg, dispatcher);
        let stats = poll.stats();
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        // Delays 20, 40, 80, 160, 160... allow about 9 connects in a second;
        // a delay stuck at the base would allow about 50.
        let connects = probe.connects();
        assert!(connects >= 3, "only {connects} connects");
        assert!(connects <= 15, "{connects} connects, backoff did not grow");
        assert_eq!(stats.snapshot().ticks_published, 0);
    }

    #[tokio::test]
    async fn test_successful_read_resets_backoff() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (_registry, dispatcher) = dispatcher();
        let mut poll = PollLoop::new(device, settings(2), dispatcher);

        probe.fail_next_reads(2, MockFault::ConnectionLost);
        // Connect, lose the link; the second loss waits twice the base.
        assert!(matches!(poll.tick().await, TickOutcome::ReadFailed(_)));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(matches!(poll.tick().await, TickOutcome::ReadFailed(_)));
        match poll.tick().await {
            TickOutcome::AwaitingReconnect { retry_in } => assert!(retry_in > Duration::from_millis(25)),
            other => panic!("expected to wait, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(45)).await;
        assert!(poll.tick().await.is_published());

        probe.fail_next_reads(1, MockFault::ConnectionLost);
        assert!(matches!(poll.tick().await, TickOutcome::ReadFailed(_)));
        match poll.tick().await {
            TickOutcome::AwaitingReconnect { retry_in } => assert!(retry_in <= Duration::from_millis(20)),
            other => panic!("expected to wait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exception_skips_tick_but_stays_connected() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (_registry, dispatcher) = dispatcher();
        let mut poll = PollLoop::new(device, settings(2), dispatcher);

        probe.fail_next_reads(1, MockFault::Exception(0x02));
        poll.tick().await;
        assert_eq!(poll.device_state(), DeviceState::Connected);
        assert!(poll.tick().await.is_published());
        assert_eq!(probe.connects(), 1);
    }

    #[tokio::test]
    async fn test_pause_when_idle_skips_reads() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (registry, dispatcher) = dispatcher();
        let mut cfg = settings(2);
        cfg.pause_when_idle = true;
        let mut poll = PollLoop::new(device, cfg, dispatcher);

        assert!(matches!(poll.tick().await, TickOutcome::Paused));
        assert_eq!(probe.reads(), 0);

        let (_id, _rx) = registry.register(1);
        assert!(poll.tick().await.is_published());
    }

    #[tokio::test]
    async fn test_loop_survives_five_failed_reads_and_resumes() {
        let (device, probe) = MockDevice::new(vec![7; 3]);
        let (registry, dispatcher) = dispatcher();
        let (_id, mut rx) = registry.register(16);
        probe.fail_next_reads(5, MockFault::Timeout);

        let poll = PollLoop::new(device, settings(3), dispatcher);
        let stats = poll.stats();
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll.run(token.clone()));

        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("publishing never resumed")
            .unwrap();
        let sample: PollSample = serde_json::from_str(&frame).unwrap();
        assert_eq!(sample.values.len(), 3);
        assert!(probe.reads() >= 6);
        assert!(!handle.is_finished());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ticks_failed, 5);
        assert_eq!(snapshot.device, DeviceState::Connected);

        token.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(stats.snapshot().device, DeviceState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ten_concurrent_starts_drive_one_poller() {
        let (device, probe) = MockDevice::new(vec![1; 2]);
        let (registry, dispatcher) = dispatcher();
        let (_id, mut rx) = registry.register(4);
        let token = CancellationToken::new();
        let poll = PollLoop::new(device, settings(2), dispatcher);
        let supervisor = Arc::new(PollerSupervisor::new(poll.run(token.clone()), token));

        let starts: Vec<_> = (0..10)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.ensure_started() })
            })
            .collect();
        let mut started = 0;
        for start in starts {
            started += usize::from(start.await.unwrap());
        }

        for _ in 0..5 {
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        }
        assert_eq!(started, 1);
        assert_eq!(probe.connects(), 1);

        supervisor.shutdown().await;
    }
}
