use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::exchange::metrics::ExchangeMetrics;
use crate::primitives::page::DEFAULT_FRAME_SIZE;
use crate::types::BlockingMode;

/// Upper bound on copy workers per call.
pub const MAX_WORKERS: usize = 32;

/// Which engine moves page content.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum CopyBackend {
    /// Split the copy across a per-node worker pool.
    #[default]
    WorkerPool,
    /// Offload to hardware copy channels, falling back to the worker pool.
    HardwareChannel,
    /// Copy on the calling thread only.
    Serial,
}

impl CopyBackend {
    /// Returns the string representation of the backend.
    pub fn as_str(self) -> &'static str {
        match self {
            CopyBackend::WorkerPool => "worker-pool",
            CopyBackend::HardwareChannel => "hardware-channel",
            CopyBackend::Serial => "serial",
        }
    }

    /// Parses a backend from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "worker-pool" | "threads" | "mt" => Some(CopyBackend::WorkerPool),
            "hardware-channel" | "dma" => Some(CopyBackend::HardwareChannel),
            "serial" | "single" => Some(CopyBackend::Serial),
            _ => None,
        }
    }
}

/// What to do with isolated pages whose frame counts cannot be paired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum OrderMismatchPolicy {
    /// Leave them in the input lists so the caller can split or migrate them.
    #[default]
    Requeue,
    /// Put them back and report them as failed.
    Reject,
}

impl OrderMismatchPolicy {
    /// Returns the string representation of the policy.
    pub fn as_str(self) -> &'static str {
        match self {
            OrderMismatchPolicy::Requeue => "requeue",
            OrderMismatchPolicy::Reject => "reject",
        }
    }

    /// Parses a policy from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "requeue" => Some(OrderMismatchPolicy::Requeue),
            "reject" => Some(OrderMismatchPolicy::Reject),
            _ => None,
        }
    }
}

/// Configuration for an [`super::Exchanger`].
#[derive(Clone)]
pub struct ExchangeOptions {
    /// Lock and write-back patience.
    pub blocking_mode: BlockingMode,
    /// Content copy engine.
    pub copy_backend: CopyBackend,
    /// Requested copy workers; see [`ExchangeOptions::effective_workers`].
    pub worker_count: usize,
    /// Hardware channels to use.
    pub channel_count: usize,
    /// Hold hardware channels for the exchanger's lifetime.
    pub reserve_channels: bool,
    /// Pairs per internal copy call; zero or less is unbounded.
    pub batch_size: i64,
    /// Use the phase-batched scheduler instead of one pair at a time.
    pub concurrent_batching: bool,
    /// Passes over the working list before falling back to serialized handling.
    pub max_passes: u32,
    /// Passes after which blocking locks are allowed in the batch.
    pub force_after_pass: u32,
    /// Slot-swap attempts per pair on the single-pair path.
    pub slot_swap_retries: u32,
    /// Pause between retries.
    pub retry_backoff: Duration,
    /// Size of one frame in bytes.
    pub frame_size: usize,
    /// Handling of unpairable frame counts.
    pub order_mismatch: OrderMismatchPolicy,
    /// Allow pages mapped by more than one translation.
    pub move_shared: bool,
    /// Optional metrics sink.
    pub metrics: Option<Arc<dyn ExchangeMetrics>>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            blocking_mode: BlockingMode::FullSync,
            copy_backend: CopyBackend::WorkerPool,
            worker_count: 4,
            channel_count: 4,
            reserve_channels: false,
            batch_size: 0,
            concurrent_batching: true,
            max_passes: 10,
            force_after_pass: 2,
            slot_swap_retries: 3,
            retry_backoff: Duration::from_micros(50),
            frame_size: DEFAULT_FRAME_SIZE,
            order_mismatch: OrderMismatchPolicy::Requeue,
            move_shared: false,
            metrics: None,
        }
    }
}

impl fmt::Debug for ExchangeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeOptions")
            .field("blocking_mode", &self.blocking_mode)
            .field("copy_backend", &self.copy_backend)
            .field("worker_count", &self.worker_count)
            .field("channel_count", &self.channel_count)
            .field("reserve_channels", &self.reserve_channels)
            .field("batch_size", &self.batch_size)
            .field("concurrent_batching", &self.concurrent_batching)
            .field("max_passes", &self.max_passes)
            .field("force_after_pass", &self.force_after_pass)
            .field("slot_swap_retries", &self.slot_swap_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("frame_size", &self.frame_size)
            .field("order_mismatch", &self.order_mismatch)
            .field("move_shared", &self.move_shared)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl ExchangeOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the blocking mode.
    pub fn blocking_mode(mut self, mode: BlockingMode) -> Self {
        self.blocking_mode = mode;
        self
    }

    /// Sets the copy backend.
    pub fn copy_backend(mut self, backend: CopyBackend) -> Self {
        self.copy_backend = backend;
        self
    }

    /// Sets the requested number of copy workers.
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Sets the number of hardware channels.
    pub fn channel_count(mut self, channels: usize) -> Self {
        self.channel_count = channels;
        self
    }

    /// Holds hardware channels for the exchanger's lifetime.
    pub fn reserve_channels(mut self, reserve: bool) -> Self {
        self.reserve_channels = reserve;
        self
    }

    /// Bounds the number of pairs per internal copy call.
    pub fn batch_size(mut self, pairs: i64) -> Self {
        self.batch_size = pairs;
        self
    }

    /// Chooses between the phase-batched scheduler and the per-pair loop.
    pub fn concurrent_batching(mut self, enabled: bool) -> Self {
        self.concurrent_batching = enabled;
        self
    }

    /// Sets the pass bound.
    pub fn max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes;
        self
    }

    /// Sets the pass after which blocking locks are allowed.
    pub fn force_after_pass(mut self, pass: u32) -> Self {
        self.force_after_pass = pass;
        self
    }

    /// Sets the slot-swap attempt bound.
    pub fn slot_swap_retries(mut self, attempts: u32) -> Self {
        self.slot_swap_retries = attempts;
        self
    }

    /// Sets the pause between retries.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the frame size.
    pub fn frame_size(mut self, bytes: usize) -> Self {
        self.frame_size = bytes;
        self
    }

    /// Sets the order-mismatch policy.
    pub fn order_mismatch(mut self, policy: OrderMismatchPolicy) -> Self {
        self.order_mismatch = policy;
        self
    }

    /// Allows exchanging pages with more than one translation.
    pub fn move_shared(mut self, allow: bool) -> Self {
        self.move_shared = allow;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn ExchangeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Worker count after clamping to [`MAX_WORKERS`] and rounding down to
    /// an even number when above one.
    pub fn effective_workers(&self) -> usize {
        even_workers(self.worker_count.min(MAX_WORKERS))
    }

    /// Pairs per copy call, `None` when unbounded.
    pub fn copy_group(&self) -> Option<usize> {
        (self.batch_size > 0).then_some(self.batch_size as usize)
    }
}

/// Rounds a worker count above one down to an even number.
pub(crate) fn even_workers(n: usize) -> usize {
    if n > 1 {
        n / 2 * 2
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_clamped_and_even() {
        assert_eq!(ExchangeOptions::new().worker_count(0).effective_workers(), 0);
        assert_eq!(ExchangeOptions::new().worker_count(1).effective_workers(), 1);
        assert_eq!(ExchangeOptions::new().worker_count(7).effective_workers(), 6);
        assert_eq!(ExchangeOptions::new().worker_count(99).effective_workers(), 32);
        assert_eq!(ExchangeOptions::default().effective_workers(), 4);
    }

    #[test]
    fn batch_size_zero_or_negative_is_unbounded() {
        assert_eq!(ExchangeOptions::new().batch_size(0).copy_group(), None);
        assert_eq!(ExchangeOptions::new().batch_size(-3).copy_group(), None);
        assert_eq!(ExchangeOptions::new().batch_size(16).copy_group(), Some(16));
    }

    #[test]
    fn backend_and_policy_parse() {
        assert_eq!(CopyBackend::from_str("DMA"), Some(CopyBackend::HardwareChannel));
        assert_eq!(CopyBackend::from_str("serial"), Some(CopyBackend::Serial));
        assert_eq!(CopyBackend::from_str("gpu"), None);
        for backend in [
            CopyBackend::WorkerPool,
            CopyBackend::HardwareChannel,
            CopyBackend::Serial,
        ] {
            assert_eq!(CopyBackend::from_str(backend.as_str()), Some(backend));
        }
        assert_eq!(
            OrderMismatchPolicy::from_str("Reject"),
            Some(OrderMismatchPolicy::Reject)
        );
    }

    #[test]
    fn defaults_match_documented_bounds() {
        let opts = ExchangeOptions::default();
        assert_eq!(opts.max_passes, 10);
        assert_eq!(opts.force_after_pass, 2);
        assert_eq!(opts.frame_size, 4096);
        assert_eq!(opts.blocking_mode, BlockingMode::FullSync);
        assert!(format!("{opts:?}").contains("metrics: false"));
    }
}
