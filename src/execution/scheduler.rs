use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::candles::Timeframe;

/// How long `SchedulerHandle::stop` waits for the loop to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancellation flag shared between the scheduler task and whoever stops it
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `stop` has been called (immediately if it already was)
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns once the flag is set
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

static GLOBAL_STOP: OnceLock<StopSignal> = OnceLock::new();

/// Process-wide stop signal, tripped by Ctrl+C in the binary
pub fn global_stop_signal() -> &'static StopSignal {
    GLOBAL_STOP.get_or_init(StopSignal::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The boundary was reached after waiting this long
    Elapsed(Duration),
    Interrupted,
}

/// Time from `now_ms` until the next `timeframe` boundary plus `offset`
pub fn time_to_next_boundary(timeframe: Timeframe, now_ms: i64, offset: Duration) -> Duration {
    let offset_ms = offset.as_millis() as i64;
    let mut target = timeframe.align(now_ms) + offset_ms;
    while target <= now_ms {
        target += timeframe.duration_ms();
    }
    Duration::from_millis((target - now_ms) as u64)
}

/// Sleep until the next boundary, returning early as soon as `stop` fires
pub async fn wait_until_next_boundary(timeframe: Timeframe, offset: Duration, stop: &StopSignal) -> WaitOutcome {
    if stop.is_stopped() {
        return WaitOutcome::Interrupted;
    }

    let wait = time_to_next_boundary(timeframe, Utc::now().timestamp_millis(), offset);
    tracing::debug!("⏰ Next {} boundary in {:.1}s", timeframe, wait.as_secs_f64());

    tokio::select! {
        _ = tokio::time::sleep(wait) => WaitOutcome::Elapsed(wait),
        _ = stop.stopped() => {
            tracing::info!("⏹️ Wait interrupted by stop signal");
            WaitOutcome::Interrupted
        }
    }
}

/// Spawns the scan loop: one task, one cycle at a time, aligned to candle boundaries
pub struct Scheduler;

impl Scheduler {
    /// Run `cycle` after every `timeframe` boundary (+ `offset`).
    ///
    /// No cycle starts once `stop` has fired; a cycle already running is allowed to finish.
    pub fn spawn<F, Fut>(
        timeframe: Timeframe,
        offset: Duration,
        run_immediately: bool,
        stop: StopSignal,
        mut cycle: F,
    ) -> SchedulerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = cycles.clone();
        let loop_stop = stop.clone();

        let join = tokio::spawn(async move {
            tracing::info!("🔄 Scheduler started: timeframe={} offset={}s", timeframe, offset.as_secs());

            if run_immediately && !loop_stop.is_stopped() {
                cycle().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }

            loop {
                if let WaitOutcome::Interrupted = wait_until_next_boundary(timeframe, offset, &loop_stop).await {
                    break;
                }
                if loop_stop.is_stopped() {
                    break;
                }
                cycle().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }

            tracing::info!("⏹️ Scheduler stopped after {} cycles", counter.load(Ordering::SeqCst));
        });

        SchedulerHandle { stop, join, cycles }
    }
}

pub struct SchedulerHandle {
    stop: StopSignal,
    join: JoinHandle<()>,
    cycles: Arc<AtomicU64>,
}

impl SchedulerHandle {
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal stop and wait up to `DEFAULT_STOP_TIMEOUT` for the loop to exit
    pub async fn stop(self) -> bool {
        self.stop_with_timeout(DEFAULT_STOP_TIMEOUT).await
    }

    /// True only for a clean exit; false if the loop was still busy at the timeout or its task failed
    pub async fn stop_with_timeout(self, timeout: Duration) -> bool {
        self.stop.stop();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("Scheduler task failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("⚠️ Scheduler did not stop within {}s", timeout.as_secs());
                false
            }
        }
    }

    /// Wait for the loop to exit on its own (after someone else trips the signal)
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
    }
}
