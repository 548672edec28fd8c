//! # Poller Supervisor
//!
//! Holds the not-yet-started poll task and spawns it exactly once. Any number
//! of connection handlers may call `ensure_started` concurrently; the first to
//! win a compare-and-swap on the start flag spawns the task and every other
//! caller returns immediately. The same supervisor cancels and joins the task
//! on shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle of the supervised task as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    /// Not started yet.
    Idle,
    /// Spawned and not finished.
    Running,
    /// Finished, normally only after shutdown.
    Stopped,
}

/// # Poller Supervisor
///
/// Start-once owner of the background poll task.
pub struct PollerSupervisor {
    claimed: AtomicBool,
    pending: Mutex<Option<BoxFuture<'static, ()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl PollerSupervisor {
    /// Wraps `task` without starting it. The task is expected to watch
    /// `shutdown` and return once it is cancelled.
    pub fn new<F>(task: F, shutdown: CancellationToken) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            claimed: AtomicBool::new(false),
            pending: Mutex::new(Some(task.boxed())),
            handle: Mutex::new(None),
            shutdown,
        }
    }

    /// Spawns the task if nobody has yet. Returns true only for the caller
    /// that actually started it. Must be called from within a tokio runtime.
    pub fn ensure_started(&self) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let task = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            // The flag is only ever set once, so the slot cannot be empty here.
            error!("poll task slot already empty after claiming start");
            return false;
        };
        if self.shutdown.is_cancelled() {
            info!("shutdown already requested, poll task not started");
            return false;
        }

        let handle = tokio::spawn(task);
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// True once some caller has claimed the start.
    pub fn is_started(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollerState {
        if !self.is_started() {
            return PollerState::Idle;
        }
        match &*self.handle.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(handle) if !handle.is_finished() => PollerState::Running,
            Some(_) => PollerState::Stopped,
            // Claimed but not yet stored, or refused because of shutdown.
            None if self.shutdown.is_cancelled() => PollerState::Stopped,
            None => PollerState::Running,
        }
    }

    /// Cancels the shutdown token and waits for the task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "poll task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_task(runs: Arc<AtomicUsize>, token: CancellationToken) -> impl Future<Output = ()> + Send {
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_attempts_spawn_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let supervisor = Arc::new(PollerSupervisor::new(
            counting_task(Arc::clone(&runs), token.clone()),
            token.clone(),
        ));

        let attempts: Vec<_> = (0..10)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.ensure_started() })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state(), PollerState::Running);

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), PollerState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_until_first_start() {
        let token = CancellationToken::new();
        let supervisor = PollerSupervisor::new(async {}, token);
        assert_eq!(supervisor.state(), PollerState::Idle);
        assert!(!supervisor.is_started());
    }

    #[tokio::test]
    async fn test_no_start_after_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let supervisor = PollerSupervisor::new(counting_task(Arc::clone(&runs), token.clone()), token);

        supervisor.shutdown().await;
        assert!(!supervisor.ensure_started());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state(), PollerState::Stopped);
    }
}
