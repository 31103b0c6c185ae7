//! Phase-batched scheduler.
//!
//! Each pass locks and unmaps every pending pair first, then swaps slots,
//! copies content, transfers metadata and remaps as separate sub-batches.
//! The copy sub-batch is handed to the engines in groups so a pool is set up
//! once per group rather than once per pair.
//!
//! Pairs that cannot be handled concurrently, and pairs still pending when
//! the pass bound runs out, are finished one at a time with blocking locks.

use tracing::{debug, info, warn};

use crate::exchange::transaction::{
    putback_pair, reclaim_if_freed, run_single, ExchangeTx, PairStatus, TxContext,
};
use crate::primitives::page::PagePair;
use crate::types::{BlockingMode, ExchangeError, Result};

/// Outcome of one batch call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Per-pair status, in input order.
    pub statuses: Vec<PairStatus>,
    /// Pairs exchanged.
    pub exchanged: usize,
    /// Pairs that ended under their original identities.
    pub failed: usize,
    /// Pairs skipped because a page was already freed.
    pub reclaimed: usize,
    /// Pairs finished on the serialized path.
    pub serialized: usize,
    /// Scheduler passes run.
    pub passes: u32,
}

impl BatchReport {
    /// Builds a report from per-pair statuses.
    pub fn from_statuses(statuses: Vec<PairStatus>, serialized: usize, passes: u32) -> Self {
        let mut report = Self {
            serialized,
            passes,
            ..Self::default()
        };
        for status in &statuses {
            match status {
                PairStatus::Exchanged => report.exchanged += 1,
                PairStatus::Reclaimed => report.reclaimed += 1,
                PairStatus::Failed(_) => report.failed += 1,
            }
        }
        report.statuses = statuses;
        report
    }

    /// Whether every pair was exchanged or reclaimed.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

type Indexed<T> = Vec<(usize, T)>;

/// Whether a pair has to take the serialized path.
fn needs_serial(pair: &PagePair) -> bool {
    pair.is_huge()
        || !pair.orders_match()
        || !pair.sizes_match()
        || pair.from.address_space().is_some()
        || pair.to.address_space().is_some()
}

/// Ownership may change until both page locks are held, e.g. a free page
/// adopted by a page cache after it was selected.
fn recheck_eligible(tx: &ExchangeTx) -> Result<()> {
    if needs_serial(tx.pair()) {
        return Err(ExchangeError::Unavailable);
    }
    Ok(())
}

pub(crate) fn run_batch(ctx: &TxContext<'_>, pairs: Vec<PagePair>) -> Result<BatchReport> {
    let total = pairs.len();
    let mode = ctx.options.blocking_mode;
    let mut statuses: Vec<Option<PairStatus>> = vec![None; total];
    let mut pending: Indexed<PagePair> = pairs.into_iter().enumerate().collect();
    let mut serialized: Indexed<PagePair> = Vec::new();
    let mut passes = 0u32;

    for pass in 0..ctx.options.max_passes {
        if pending.is_empty() {
            break;
        }
        passes += 1;
        let force = pass > ctx.options.force_after_pass;
        let may_block = force && mode.may_block();
        let wait_writeback = force && mode.waits_for_writeback();
        debug!(pass, pending = pending.len(), force, "exchange pass");

        let mut retry: Indexed<PagePair> = Vec::new();
        let mut unmapped: Indexed<ExchangeTx> = Vec::new();
        let mut work = std::mem::take(&mut pending).into_iter();
        while let Some((idx, pair)) = work.next() {
            if let Some(status) = reclaim_if_freed(ctx, &pair) {
                statuses[idx] = Some(status);
                continue;
            }
            if needs_serial(&pair) {
                ctx.metrics.pair_serialized();
                serialized.push((idx, pair));
                continue;
            }
            let mut tx = ExchangeTx::new(pair);
            let step = tx
                .lock(may_block, wait_writeback)
                .and_then(|()| recheck_eligible(&tx))
                .and_then(|()| tx.unmap(ctx.env));
            match step {
                Ok(()) => unmapped.push((idx, tx)),
                Err(ExchangeError::Unavailable) => {
                    debug!(pass, "pair no longer eligible once locked, serializing");
                    ctx.metrics.pair_serialized();
                    serialized.push((idx, tx.unwind(ctx.env)));
                }
                Err(err @ ExchangeError::OutOfMemory(_)) => {
                    warn!(pass, error = %err, "aborting batch");
                    tx.abort(ctx.env);
                    for (_, tx) in unmapped {
                        tx.abort(ctx.env);
                    }
                    for (_, pair) in work.chain(retry).chain(serialized) {
                        putback_pair(ctx.env, &pair);
                    }
                    return Err(err);
                }
                Err(err) if err.is_retryable() => retry.push((idx, tx.unwind(ctx.env))),
                Err(err) => {
                    debug!(error = %err, "pair failed during unmap");
                    tx.abort(ctx.env);
                    ctx.metrics.pair_failed();
                    statuses[idx] = Some(PairStatus::Failed(err));
                }
            }
        }

        let mut swapped: Indexed<ExchangeTx> = Vec::with_capacity(unmapped.len());
        for (idx, mut tx) in unmapped {
            match tx.swap_slots(ctx.env) {
                Ok(()) => swapped.push((idx, tx)),
                Err(err) if err.is_retryable() => {
                    ctx.metrics.slot_swap_retry();
                    retry.push((idx, tx.unwind(ctx.env)));
                }
                Err(err) => {
                    tx.abort(ctx.env);
                    ctx.metrics.pair_failed();
                    statuses[idx] = Some(PairStatus::Failed(err));
                }
            }
        }

        let group = ctx.options.copy_group().unwrap_or(swapped.len()).max(1);
        for chunk in swapped.chunks_mut(group) {
            let jobs: Vec<_> = chunk.iter().map(|(_, tx)| tx.job()).collect();
            ctx.engines.exchange_jobs(&jobs);
            for (_, tx) in chunk.iter_mut() {
                tx.mark_copied();
            }
        }

        for (_, tx) in swapped.iter_mut() {
            tx.metadata(ctx.env);
        }

        for (idx, mut tx) in swapped {
            tx.remap(ctx.env);
            tx.finish(ctx.env);
            ctx.metrics.pair_exchanged();
            statuses[idx] = Some(PairStatus::Exchanged);
        }

        ctx.metrics.pass_completed();
        pending = retry;
    }

    if !pending.is_empty() {
        info!(
            pairs = pending.len(),
            passes, "pass bound reached, finishing pairs one at a time"
        );
        for _ in &pending {
            ctx.metrics.pair_serialized();
        }
        serialized.append(&mut pending);
    }

    let serialized_count = serialized.len();
    for (idx, pair) in serialized {
        statuses[idx] = Some(run_single(ctx, pair, BlockingMode::FullSync));
    }

    let statuses = statuses
        .into_iter()
        .map(|status| {
            status.unwrap_or(PairStatus::Failed(ExchangeError::Invariant(
                "pair left without a status",
            )))
        })
        .collect();
    Ok(BatchReport::from_statuses(statuses, serialized_count, passes))
}
