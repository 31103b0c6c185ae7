//! Page exchange core.
//!
//! An [`Exchanger`] swaps the slot identities, contents and metadata of
//! isolated page pairs. Every page handed in is returned to its pool before
//! the call returns, under its new identity if its pair was exchanged and
//! under its original identity otherwise.
//!
//! ```text
//! Exchanger::exchange
//!   -> batch::run_batch         (concurrent_batching)
//!        lock+unmap | slot swap | grouped copy | metadata | remap+putback
//!        -> transaction::run_single for huge, file-backed, leftover pairs
//!   -> transaction::run_single  (one pair at a time)
//! ```

pub mod batch;
pub mod copy;
pub mod metadata;
pub mod metrics;
pub mod options;
pub mod pairing;
pub mod slot;
pub mod transaction;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::env::MemoryEnv;
use crate::primitives::mapping::Mm;
use crate::primitives::page::{Page, PagePair};
use crate::types::{ExchangeError, Result};

pub use batch::BatchReport;
pub use copy::{BulkCopy, ChunkCopyEngine, CopyEngines, CopyError, DmaCopyOffload, DmaMode, SerialCopy};
pub use metadata::transfer_metadata;
pub use metrics::{default_metrics, CounterMetrics, ExchangeMetrics, NoopMetrics};
pub use options::{CopyBackend, ExchangeOptions, OrderMismatchPolicy, MAX_WORKERS};
pub use pairing::{pair_isolated, Pairing};
pub use slot::{expected_refs, swap_slots};
pub use transaction::{PairStatus, TxState};

use transaction::{run_single, TxContext};

/// Entry point of the exchange core.
pub struct Exchanger {
    env: MemoryEnv,
    options: ExchangeOptions,
    engines: CopyEngines,
    metrics: Arc<dyn ExchangeMetrics>,
}

impl Exchanger {
    /// Creates an exchanger, setting up the copy engines `options` select.
    pub fn new(env: MemoryEnv, options: ExchangeOptions) -> Self {
        let engines = CopyEngines::from_options(&options, &env);
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        info!(
            backend = options.copy_backend.as_str(),
            engine = engines.primary_name(true),
            workers = options.effective_workers(),
            mode = options.blocking_mode.as_str(),
            frame_size = options.frame_size,
            order_mismatch = options.order_mismatch.as_str(),
            "exchanger ready"
        );
        Self {
            env,
            options,
            engines,
            metrics,
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    /// Host collaborators.
    pub fn env(&self) -> &MemoryEnv {
        &self.env
    }

    /// Name of the engine that serves copies first.
    pub fn copy_engine(&self) -> &'static str {
        self.engines.primary_name(true)
    }

    fn context(&self) -> TxContext<'_> {
        TxContext {
            env: &self.env,
            options: &self.options,
            engines: &self.engines,
            metrics: self.metrics.as_ref(),
        }
    }

    /// Pairs isolated hot and cold pages with the configured
    /// [`OrderMismatchPolicy`]; rejected pages go back to the pool.
    pub fn pair_isolated(
        &self,
        hot: &mut VecDeque<Arc<Page>>,
        cold: &mut VecDeque<Arc<Page>>,
    ) -> Pairing {
        pair_isolated(hot, cold, self.options.order_mismatch, self.env.pool.as_ref())
    }

    /// Exchanges one pair on the calling thread with the configured
    /// blocking mode.
    pub fn exchange_pair(&self, pair: PagePair) -> PairStatus {
        run_single(&self.context(), pair, self.options.blocking_mode)
    }

    /// Exchanges every pair on behalf of `mm`.
    ///
    /// Only one call per memory domain runs at a time; a concurrent call
    /// returns [`ExchangeError::BatchInProgress`]. A page may appear in at
    /// most one pair. On `Err` every page has been put back under its
    /// original identity, except pairs that completed before an
    /// out-of-memory abort.
    pub fn exchange(&self, mm: &Mm, pairs: Vec<PagePair>) -> Result<BatchReport> {
        let Some(_token) = mm.gate().try_acquire() else {
            put_back_all(&self.env, &pairs);
            return Err(ExchangeError::BatchInProgress);
        };
        let mut seen = HashSet::new();
        let disjoint = pairs.iter().all(|pair| {
            seen.insert(Arc::as_ptr(&pair.from)) && seen.insert(Arc::as_ptr(&pair.to))
        });
        if !disjoint {
            put_back_all(&self.env, &pairs);
            return Err(ExchangeError::Invalid("page listed in more than one pair"));
        }
        self.run(pairs)
    }

    /// Validates each pair, then exchanges the valid ones.
    ///
    /// Invalid pairs are put back and reported in place:
    /// the same page on both sides or a page already listed gives
    /// [`ExchangeError::Invalid`], a page with more than one translation
    /// without [`ExchangeOptions::move_shared`] gives `Invalid("shared")`,
    /// differently shaped pages give [`ExchangeError::OrderMismatch`], pages
    /// of unequal length give [`ExchangeError::SizeMismatch`], and a page
    /// whose length is not [`ExchangeOptions::frame_size`] per frame gives
    /// `Invalid`.
    pub fn exchange_requests(&self, mm: &Mm, pairs: Vec<PagePair>) -> Result<BatchReport> {
        let Some(_token) = mm.gate().try_acquire() else {
            put_back_all(&self.env, &pairs);
            return Err(ExchangeError::BatchInProgress);
        };
        let total = pairs.len();
        let mut statuses: Vec<Option<PairStatus>> = vec![None; total];
        let mut valid = Vec::with_capacity(total);
        let mut slots = Vec::with_capacity(total);
        let mut seen: HashSet<*const Page> = HashSet::new();

        for (idx, pair) in pairs.into_iter().enumerate() {
            match self.validate(&pair, &seen) {
                Ok(()) => {
                    seen.insert(Arc::as_ptr(&pair.from));
                    seen.insert(Arc::as_ptr(&pair.to));
                    slots.push(idx);
                    valid.push(pair);
                }
                Err(err) => {
                    debug!(index = idx, error = %err, "request rejected");
                    for page in [&pair.from, &pair.to] {
                        if seen.insert(Arc::as_ptr(page)) {
                            self.env.pool.putback(page);
                        }
                    }
                    self.metrics.pair_failed();
                    statuses[idx] = Some(PairStatus::Failed(err));
                }
            }
        }

        let report = self.run(valid)?;
        for (idx, status) in slots.into_iter().zip(report.statuses) {
            statuses[idx] = Some(status);
        }
        let statuses = statuses
            .into_iter()
            .map(|status| {
                status.unwrap_or(PairStatus::Failed(ExchangeError::Invariant(
                    "request left without a status",
                )))
            })
            .collect();
        Ok(BatchReport::from_statuses(
            statuses,
            report.serialized,
            report.passes,
        ))
    }

    fn validate(&self, pair: &PagePair, seen: &HashSet<*const Page>) -> Result<()> {
        if pair.is_self_pair() {
            return Err(ExchangeError::Invalid("same page"));
        }
        if seen.contains(&Arc::as_ptr(&pair.from)) || seen.contains(&Arc::as_ptr(&pair.to)) {
            return Err(ExchangeError::Invalid("page listed in more than one pair"));
        }
        if !self.options.move_shared
            && (self.env.rmap.mapcount(&pair.from) > 1 || self.env.rmap.mapcount(&pair.to) > 1)
        {
            return Err(ExchangeError::Invalid("shared"));
        }
        if pair.from.kind() != pair.to.kind() || !pair.orders_match() {
            return Err(ExchangeError::OrderMismatch {
                from: pair.from.nr_frames(),
                to: pair.to.nr_frames(),
            });
        }
        if !pair.sizes_match() {
            return Err(ExchangeError::SizeMismatch {
                from: pair.from.byte_len(),
                to: pair.to.byte_len(),
            });
        }
        if pair.from.byte_len() != self.options.frame_size * pair.from.nr_frames() {
            return Err(ExchangeError::Invalid("page size differs from the frame size"));
        }
        Ok(())
    }

    fn run(&self, pairs: Vec<PagePair>) -> Result<BatchReport> {
        let ctx = self.context();
        if pairs.is_empty() {
            return Ok(BatchReport::default());
        }
        let report = if self.options.concurrent_batching {
            batch::run_batch(&ctx, pairs)?
        } else {
            let statuses = pairs
                .into_iter()
                .map(|pair| run_single(&ctx, pair, self.options.blocking_mode))
                .collect();
            BatchReport::from_statuses(statuses, 0, 0)
        };
        info!(
            exchanged = report.exchanged,
            failed = report.failed,
            reclaimed = report.reclaimed,
            serialized = report.serialized,
            passes = report.passes,
            "exchange finished"
        );
        Ok(report)
    }
}

fn put_back_all(env: &MemoryEnv, pairs: &[PagePair]) {
    let mut seen = HashSet::new();
    for pair in pairs {
        if seen.insert(Arc::as_ptr(&pair.from)) {
            env.pool.putback(&pair.from);
        }
        if seen.insert(Arc::as_ptr(&pair.to)) {
            env.pool.putback(&pair.to);
        }
    }
}

