use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking exchange outcomes and copy-engine activity.
///
/// Implementations receive one call per event from the driving thread and
/// from copy dispatch. They must be cheap and must not block.
pub trait ExchangeMetrics: Send + Sync {
    /// Records a pair whose identities and contents were exchanged.
    fn pair_exchanged(&self);

    /// Records a pair that ended under its original identities.
    fn pair_failed(&self);

    /// Records a pair skipped because one page was already freed.
    fn pair_reclaimed(&self);

    /// Records a pair routed to the serialized path.
    fn pair_serialized(&self);

    /// Records one completed scheduler pass.
    fn pass_completed(&self);

    /// Records a slot swap that had to be retried.
    fn slot_swap_retry(&self);

    /// Records one bulk copy call.
    ///
    /// # Parameters
    /// * `backend` - Name of the engine that served the call.
    fn copy_call(&self, backend: &'static str);

    /// Records a copy engine failure answered by the next engine in line.
    fn copy_fallback(&self);

    /// Records bytes swapped between pages.
    fn bytes_exchanged(&self, bytes: u64);
}

/// A no-op implementation of [`ExchangeMetrics`] that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl ExchangeMetrics for NoopMetrics {
    fn pair_exchanged(&self) {}
    fn pair_failed(&self) {}
    fn pair_reclaimed(&self) {}
    fn pair_serialized(&self) {}
    fn pass_completed(&self) {}
    fn slot_swap_retry(&self) {}
    fn copy_call(&self, _backend: &'static str) {}
    fn copy_fallback(&self) {}
    fn bytes_exchanged(&self, _bytes: u64) {}
}

/// A thread-safe counter-based implementation of [`ExchangeMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Pairs exchanged.
    pub exchanged: AtomicU64,

    /// Pairs that failed.
    pub failed: AtomicU64,

    /// Pairs short-circuited because a page was freed.
    pub reclaimed: AtomicU64,

    /// Pairs routed to the serialized path.
    pub serialized: AtomicU64,

    /// Scheduler passes completed.
    pub passes: AtomicU64,

    /// Slot swaps retried.
    pub slot_swap_retries: AtomicU64,

    /// Copy calls served by the worker pool.
    pub copy_calls_pool: AtomicU64,

    /// Copy calls served by hardware channels.
    pub copy_calls_dma: AtomicU64,

    /// Copy calls served on the calling thread.
    pub copy_calls_serial: AtomicU64,

    /// Copy engine failures that fell back to another engine.
    pub copy_fallbacks: AtomicU64,

    /// Bytes swapped between pages.
    pub bytes: AtomicU64,
}

impl CounterMetrics {
    /// Total copy calls across engines.
    pub fn copy_calls(&self) -> u64 {
        self.copy_calls_pool.load(Ordering::Relaxed)
            + self.copy_calls_dma.load(Ordering::Relaxed)
            + self.copy_calls_serial.load(Ordering::Relaxed)
    }
}

impl ExchangeMetrics for CounterMetrics {
    fn pair_exchanged(&self) {
        self.exchanged.fetch_add(1, Ordering::Relaxed);
    }

    fn pair_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn pair_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    fn pair_serialized(&self) {
        self.serialized.fetch_add(1, Ordering::Relaxed);
    }

    fn pass_completed(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    fn slot_swap_retry(&self) {
        self.slot_swap_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn copy_call(&self, backend: &'static str) {
        match backend {
            "worker-pool" => {
                self.copy_calls_pool.fetch_add(1, Ordering::Relaxed);
            }
            "hardware-channel" => {
                self.copy_calls_dma.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.copy_calls_serial.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn copy_fallback(&self) {
        self.copy_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_exchanged(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn ExchangeMetrics> {
    Arc::new(NoopMetrics)
}
