//! Periodic background check that keeps the token and the tracked
//! connections current.

use crate::common::panic_message;
use crate::engine::EngineInner;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Non-blocking gate: at most one holder at a time, contenders give up
/// instead of waiting.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub(crate) fn try_enter(&self) -> Option<SingleFlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlightGuard { flight: self })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop, including during unwinding.
pub(crate) struct SingleFlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.busy.store(false, Ordering::Release);
    }
}

/// Owns the heartbeat task; the task stops when this handle is dropped.
pub(crate) struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the task and waits for it to exit.
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                log::error!("Heartbeat task panicked: {}", panic_message(e.into_panic()));
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts the heartbeat on `runtime`. The task keeps only a weak reference
/// to the engine and exits once the engine is gone or the handle is dropped.
pub(crate) fn spawn_heartbeat(
    engine: Weak<EngineInner>,
    period: Duration,
    runtime: &Handle,
) -> HeartbeatHandle {
    let cancel = CancellationToken::new();
    let stopped = cancel.clone();

    let task = runtime.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                () = stopped.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(engine) = engine.upgrade() else {
                log::debug!("Token engine dropped, heartbeat exiting");
                break;
            };

            // A slow check must not delay the timer; overlapping checks are
            // dropped by the engine's single-flight gate.
            tokio::spawn(guarded_check(engine, period));
        }
    });

    HeartbeatHandle { cancel, task }
}

/// Runs one authentication check, containing any panic so background work
/// can never take the host process down.
pub(crate) async fn guarded_check(engine: Arc<EngineInner>, period: Duration) {
    let outcome = AssertUnwindSafe(engine.background_check())
        .catch_unwind()
        .await;

    if let Err(payload) = outcome {
        log::error!(
            "Failed to ensure that connection authentication is current, next attempt in {}s: {}",
            period.as_secs(),
            panic_message(payload)
        );
    }
}
