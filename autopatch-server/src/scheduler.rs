//! Per-type flush scheduler (batching queue).
//!
//! ```text
//!            enqueue(item)
//!                 │
//!                 ▼
//!        ┌─────────────────┐   len ≥ max_batch_size ──► flush(MaxBatchSize)
//!        │ queue (mutex)   │
//!        └────────┬────────┘
//!                 │ ticker every throttle_interval ─────► flush(Timed)
//!                 │ caller                      ────────► flush(Manual)
//!                 ▼
//!     take-and-clear under the queue lock, handlers run outside it
//! ```
//!
//! Flushes are serialized by a gate mutex. Every non-empty flush resets the
//! ticker, so the next timed flush is one full interval after the last drain.
//!
//! ## Delivery guarantee
//!
//! At most once. A handler that returns an error or panics is logged and
//! the drained items are discarded, not retried.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What triggered a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushMode {
    Timed,
    MaxBatchSize,
    Manual,
}

/// Error returned by a flush handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushError(pub String);

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flush handler failed: {}", self.0)
    }
}

impl std::error::Error for FlushError {}

type FlushHandler<Q> = Box<dyn Fn(FlushMode, &[Q]) -> Result<(), FlushError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub throttle_interval: Duration,
    pub max_batch_size: usize,
}

/// Flush counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub timed_flushes: u64,
    pub size_flushes: u64,
    pub manual_flushes: u64,
    pub items_delivered: u64,
    /// Items drained into a handler that failed
    pub items_lost: u64,
}

#[derive(Default)]
struct AtomicFlushStats {
    timed_flushes: AtomicU64,
    size_flushes: AtomicU64,
    manual_flushes: AtomicU64,
    items_delivered: AtomicU64,
    items_lost: AtomicU64,
}

struct Shared<Q> {
    name: String,
    config: SchedulerConfig,
    queue: Mutex<Vec<Q>>,
    flush_gate: Mutex<()>,
    handlers: RwLock<Vec<FlushHandler<Q>>>,
    stopped: AtomicBool,
    stats: AtomicFlushStats,
}

/// Batching queue for one tracked type.
pub struct FlushScheduler<Q> {
    shared: Arc<Shared<Q>>,
    rearm: Arc<Notify>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    runtime: Option<Handle>,
}

impl<Q: Send + Sync + 'static> FlushScheduler<Q> {
    /// Create a scheduler. The periodic timer runs on the current tokio
    /// runtime, if there is one; without a runtime only size-triggered and
    /// manual flushes happen.
    pub fn new(name: impl Into<String>, config: SchedulerConfig) -> Self {
        let name = name.into();
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            log::warn!("Flush scheduler {name} created outside a tokio runtime; timed flushes disabled");
        }
        Self {
            shared: Arc::new(Shared {
                name,
                config: SchedulerConfig {
                    max_batch_size: config.max_batch_size.max(1),
                    ..config
                },
                queue: Mutex::new(Vec::new()),
                flush_gate: Mutex::new(()),
                handlers: RwLock::new(Vec::new()),
                stopped: AtomicBool::new(false),
                stats: AtomicFlushStats::default(),
            }),
            rearm: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            runtime,
        }
    }

    /// Register a handler invoked with every non-empty drained batch.
    pub fn on_flush<F>(&self, handler: F)
    where
        F: Fn(FlushMode, &[Q]) -> Result<(), FlushError> + Send + Sync + 'static,
    {
        self.shared.handlers.write().push(Box::new(handler));
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// Append `item`; flushes immediately once the queue reaches the max batch size.
    pub fn enqueue(&self, item: Q) {
        if self.shared.stopped.load(Ordering::Acquire) {
            log::warn!("Flush scheduler {} is stopped; item discarded", self.shared.name);
            return;
        }
        let reached_max = {
            let mut queue = self.shared.queue.lock();
            queue.push(item);
            queue.len() >= self.shared.config.max_batch_size
        };
        if reached_max {
            self.flush(FlushMode::MaxBatchSize);
        } else {
            self.ensure_timer();
        }
    }

    /// Drain the queue into the handlers. Returns the number of items flushed.
    pub fn flush(&self, mode: FlushMode) -> usize {
        let flushed = flush_shared(&self.shared, mode);
        if flushed > 0 {
            self.rearm.notify_one();
        }
        flushed
    }

    /// Items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the timer and discard pending items.
    ///
    /// Waits for an in-flight flush to finish; no handler runs after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
        {
            let _gate = self.shared.flush_gate.lock();
            self.shared.stopped.store(true, Ordering::Release);
        }
        let discarded = std::mem::take(&mut *self.shared.queue.lock()).len();
        if discarded > 0 {
            log::warn!(
                "Flush scheduler {} stopped with {discarded} pending items discarded",
                self.shared.name
            );
        }
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn stats(&self) -> FlushStats {
        let stats = &self.shared.stats;
        FlushStats {
            timed_flushes: stats.timed_flushes.load(Ordering::Relaxed),
            size_flushes: stats.size_flushes.load(Ordering::Relaxed),
            manual_flushes: stats.manual_flushes.load(Ordering::Relaxed),
            items_delivered: stats.items_delivered.load(Ordering::Relaxed),
            items_lost: stats.items_lost.load(Ordering::Relaxed),
        }
    }

    fn ensure_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };
        log::debug!(
            "Arming flush timer for {} every {:?}",
            self.shared.name,
            self.shared.config.throttle_interval
        );
        *timer = Some(runtime.spawn(run_timer(
            Arc::downgrade(&self.shared),
            self.rearm.clone(),
            self.cancel.clone(),
            self.shared.config.throttle_interval,
        )));
    }
}

impl<Q> Drop for FlushScheduler<Q> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

fn flush_shared<Q>(shared: &Shared<Q>, mode: FlushMode) -> usize {
    let _gate = shared.flush_gate.lock();
    if shared.stopped.load(Ordering::Acquire) {
        return 0;
    }
    let items = std::mem::take(&mut *shared.queue.lock());
    if items.is_empty() {
        return 0;
    }

    log::debug!(
        "Flushing {} with {} items (mode: {mode:?})",
        shared.name,
        items.len()
    );

    let counter = match mode {
        FlushMode::Timed => &shared.stats.timed_flushes,
        FlushMode::MaxBatchSize => &shared.stats.size_flushes,
        FlushMode::Manual => &shared.stats.manual_flushes,
    };
    counter.fetch_add(1, Ordering::Relaxed);

    let mut failed = false;
    for handler in shared.handlers.read().iter() {
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(mode, &items))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed = true;
                log::error!("Error during flush of {}: {e}", shared.name);
            }
            Err(_) => {
                failed = true;
                log::error!("Flush handler of {} panicked", shared.name);
            }
        }
    }

    let count = items.len() as u64;
    if failed {
        shared.stats.items_lost.fetch_add(count, Ordering::Relaxed);
    } else {
        shared.stats.items_delivered.fetch_add(count, Ordering::Relaxed);
    }
    items.len()
}

/// Interval loop owning the periodic flush of one scheduler.
async fn run_timer<Q>(
    shared: Weak<Shared<Q>>,
    rearm: Arc<Notify>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = rearm.notified() => ticker.reset(),
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                flush_shared(&shared, FlushMode::Timed);
            }
        }
    }
    log::debug!("Flush timer stopped");
}
