//! Single-pair exchange state machine.
//!
//! ```text
//! Start -> Locked -> Unmapped -> SlotSwapped -> ContentCopied
//!       -> MetadataSwapped -> Remapped -> Done
//! ```
//!
//! `Aborted` is reachable from every state before `SlotSwapped`. Once the
//! slots are swapped the remaining steps cannot fail, so a transaction past
//! that point always completes.

use std::sync::Arc;
use std::thread;

use tracing::{debug, trace};

use crate::env::MemoryEnv;
use crate::exchange::copy::{CopyEngines, ExchangeJob};
use crate::exchange::metadata::transfer_metadata;
use crate::exchange::metrics::ExchangeMetrics;
use crate::exchange::options::ExchangeOptions;
use crate::exchange::slot::swap_slots;
use crate::primitives::page::{Page, PageFlags, PageGuard, PageOwner, PagePair};
use crate::types::{AllocSite, BlockingMode, ExchangeError, Result};

/// Final outcome for one pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairStatus {
    /// Identities and contents were exchanged.
    Exchanged,
    /// One page was already freed; both were put back untouched.
    Reclaimed,
    /// Both pages were put back under their original identities.
    Failed(ExchangeError),
}

impl PairStatus {
    /// Whether the pair counts as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, PairStatus::Failed(_))
    }
}

/// Progress of one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxState {
    /// Nothing acquired.
    Start,
    /// Both pages locked.
    Locked,
    /// Translations suspended.
    Unmapped,
    /// Slot identities exchanged.
    SlotSwapped,
    /// Content exchanged.
    ContentCopied,
    /// Status bits and hints exchanged.
    MetadataSwapped,
    /// Translations point at their new pages.
    Remapped,
    /// Pages returned under their new identities.
    Done,
    /// Pages returned under their original identities.
    Aborted,
}

/// Collaborators shared by every transaction of one call.
pub(crate) struct TxContext<'a> {
    pub env: &'a MemoryEnv,
    pub options: &'a ExchangeOptions,
    pub engines: &'a CopyEngines,
    pub metrics: &'a dyn ExchangeMetrics,
}

/// One pair moving through the exchange states.
pub(crate) struct ExchangeTx {
    pair: PagePair,
    state: TxState,
    from: Option<PageGuard>,
    to: Option<PageGuard>,
    from_was_mapped: bool,
    to_was_mapped: bool,
}

impl ExchangeTx {
    pub fn new(pair: PagePair) -> Self {
        Self {
            pair,
            state: TxState::Start,
            from: None,
            to: None,
            from_was_mapped: false,
            to_was_mapped: false,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn pair(&self) -> &PagePair {
        &self.pair
    }

    /// Locks `from`, then `to`. Without `may_block` a contended lock fails
    /// with [`ExchangeError::Busy`]; without `wait_writeback` a page under
    /// write-back fails with [`ExchangeError::Writeback`].
    pub fn lock(&mut self, may_block: bool, wait_writeback: bool) -> Result<()> {
        debug_assert_eq!(self.state, TxState::Start);
        self.from = Some(lock_page(&self.pair.from, may_block, wait_writeback)?);
        self.to = Some(lock_page(&self.pair.to, may_block, wait_writeback)?);
        self.state = TxState::Locked;
        Ok(())
    }

    /// Pins the reverse-mapping anchors, releases orphaned private data and
    /// suspends live translations.
    pub fn unmap(&mut self, env: &MemoryEnv) -> Result<()> {
        debug_assert_eq!(self.state, TxState::Locked);
        if !env.alloc.try_reserve(AllocSite::UnmapBookkeeping, 2) {
            return Err(ExchangeError::OutOfMemory(AllocSite::UnmapBookkeeping));
        }
        for guard in [&mut self.from, &mut self.to].into_iter().flatten() {
            guard.capture_rmap();
        }
        unmap_page(env, &self.pair.from, &mut self.from_was_mapped)?;
        unmap_page(env, &self.pair.to, &mut self.to_was_mapped)?;
        self.state = TxState::Unmapped;
        Ok(())
    }

    pub fn swap_slots(&mut self, env: &MemoryEnv) -> Result<()> {
        debug_assert_eq!(self.state, TxState::Unmapped);
        swap_slots(&self.pair.to, &self.pair.from, 0, env.accounting.as_ref())?;
        self.state = TxState::SlotSwapped;
        Ok(())
    }

    pub fn copy(&mut self, engines: &CopyEngines) {
        debug_assert_eq!(self.state, TxState::SlotSwapped);
        engines.exchange_pair(&self.pair.to, &self.pair.from);
        self.state = TxState::ContentCopied;
    }

    /// Job for a batched copy; see [`ExchangeTx::mark_copied`].
    pub fn job(&self) -> ExchangeJob {
        ExchangeJob::new(Arc::clone(&self.pair.to), Arc::clone(&self.pair.from))
    }

    pub fn mark_copied(&mut self) {
        debug_assert_eq!(self.state, TxState::SlotSwapped);
        self.state = TxState::ContentCopied;
    }

    pub fn metadata(&mut self, env: &MemoryEnv) {
        debug_assert_eq!(self.state, TxState::ContentCopied);
        transfer_metadata(&self.pair.to, &self.pair.from, env.dedup.as_deref());
        self.state = TxState::MetadataSwapped;
    }

    /// Points suspended translations at the page now holding their content.
    pub fn remap(&mut self, env: &MemoryEnv) {
        debug_assert_eq!(self.state, TxState::MetadataSwapped);
        if self.from_was_mapped {
            env.rmap
                .remove_migration_entries(&self.pair.from, &self.pair.to);
        }
        if self.to_was_mapped {
            env.rmap
                .remove_migration_entries(&self.pair.to, &self.pair.from);
        }
        self.from_was_mapped = false;
        self.to_was_mapped = false;
        self.release_rmaps();
        self.state = TxState::Remapped;
    }

    /// Unlocks and puts both pages back under their new identities.
    pub fn finish(mut self, env: &MemoryEnv) {
        debug_assert_eq!(self.state, TxState::Remapped);
        self.release();
        self.state = TxState::Done;
        putback_pair(env, &self.pair);
    }

    /// Restores translations, unlocks and puts both pages back under their
    /// original identities.
    pub fn abort(mut self, env: &MemoryEnv) {
        self.unwind_in_place(env);
        self.state = TxState::Aborted;
        putback_pair(env, &self.pair);
    }

    /// Restores translations and unlocks, keeping both pages isolated so the
    /// pair can be tried again.
    pub fn unwind(mut self, env: &MemoryEnv) -> PagePair {
        self.unwind_in_place(env);
        self.pair.clone()
    }

    /// Restores suspended translations to their own pages and returns to
    /// `Locked`.
    pub fn restore_mappings(&mut self, env: &MemoryEnv) {
        debug_assert!(self.state < TxState::SlotSwapped);
        if self.from_was_mapped {
            env.rmap
                .remove_migration_entries(&self.pair.from, &self.pair.from);
        }
        if self.to_was_mapped {
            env.rmap.remove_migration_entries(&self.pair.to, &self.pair.to);
        }
        self.from_was_mapped = false;
        self.to_was_mapped = false;
        self.release_rmaps();
        if self.state == TxState::Unmapped {
            self.state = TxState::Locked;
        }
    }

    fn unwind_in_place(&mut self, env: &MemoryEnv) {
        debug_assert!(
            self.state < TxState::SlotSwapped,
            "unwind after slot swap"
        );
        self.restore_mappings(env);
        self.release();
        self.state = TxState::Start;
    }

    fn release_rmaps(&mut self) {
        for guard in [&mut self.from, &mut self.to].into_iter().flatten() {
            guard.release_rmap();
        }
    }

    fn release(&mut self) {
        self.to.take();
        self.from.take();
    }
}

fn lock_page(page: &Arc<Page>, may_block: bool, wait_writeback: bool) -> Result<PageGuard> {
    let lock = match page.try_lock() {
        Some(lock) => lock,
        None if may_block => page.lock(),
        None => return Err(ExchangeError::Busy),
    };
    if page.under_writeback() {
        if !wait_writeback {
            return Err(ExchangeError::Writeback);
        }
        page.wait_on_writeback();
    }
    Ok(PageGuard::new(lock))
}

fn unmap_page(env: &MemoryEnv, page: &Arc<Page>, was_mapped: &mut bool) -> Result<()> {
    {
        let mut meta = page.meta();
        if matches!(meta.owner, PageOwner::None) {
            if let Some(private) = meta.private {
                if !private.releasable {
                    return Err(ExchangeError::PrivateBusy);
                }
                meta.private = None;
                meta.flags.remove(PageFlags::PRIVATE);
                trace!(frame = %page.frame(), tag = private.tag, "released orphan private data");
            }
        }
    }
    if env.rmap.mapcount(page) > 0 {
        *was_mapped = true;
        if !env.rmap.try_to_unmap(page) || env.rmap.mapcount(page) > 0 {
            return Err(ExchangeError::Retry);
        }
    }
    Ok(())
}

/// Returns both pages to their lists.
pub(crate) fn putback_pair(env: &MemoryEnv, pair: &PagePair) {
    env.pool.putback(&pair.from);
    if !pair.is_self_pair() {
        env.pool.putback(&pair.to);
    }
}

/// Puts the pair back untouched if either page holds only the isolation
/// reference.
pub(crate) fn reclaim_if_freed(ctx: &TxContext<'_>, pair: &PagePair) -> Option<PairStatus> {
    let freed: Vec<&Arc<Page>> = [&pair.from, &pair.to]
        .into_iter()
        .filter(|page| page.ref_count() == 1)
        .collect();
    if freed.is_empty() {
        return None;
    }
    for page in freed {
        page.clear_flags(PageFlags::ACTIVE | PageFlags::UNEVICTABLE);
    }
    debug!(from = %pair.from.frame(), to = %pair.to.frame(), "page freed before exchange");
    putback_pair(ctx.env, pair);
    ctx.metrics.pair_reclaimed();
    Some(PairStatus::Reclaimed)
}

/// Runs one pair start to finish, retrying slot-swap races with the locks
/// held.
pub(crate) fn run_single(ctx: &TxContext<'_>, pair: PagePair, mode: BlockingMode) -> PairStatus {
    if pair.is_self_pair() {
        putback_pair(ctx.env, &pair);
        ctx.metrics.pair_failed();
        return PairStatus::Failed(ExchangeError::Invalid("same page"));
    }
    if let Some(status) = reclaim_if_freed(ctx, &pair) {
        return status;
    }
    if !pair.orders_match() {
        let err = ExchangeError::OrderMismatch {
            from: pair.from.nr_frames(),
            to: pair.to.nr_frames(),
        };
        putback_pair(ctx.env, &pair);
        ctx.metrics.pair_failed();
        return PairStatus::Failed(err);
    }
    if !pair.sizes_match() {
        let err = ExchangeError::SizeMismatch {
            from: pair.from.byte_len(),
            to: pair.to.byte_len(),
        };
        putback_pair(ctx.env, &pair);
        ctx.metrics.pair_failed();
        return PairStatus::Failed(err);
    }

    let mut tx = ExchangeTx::new(pair);
    if let Err(err) = tx.lock(mode.may_block(), mode.waits_for_writeback()) {
        return fail(ctx, tx, err);
    }

    let bound = ctx.options.slot_swap_retries.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let step = tx.unmap(ctx.env).and_then(|()| tx.swap_slots(ctx.env));
        match step {
            Ok(()) => break,
            Err(ExchangeError::Retry) if attempts < bound => {
                tx.restore_mappings(ctx.env);
                ctx.metrics.slot_swap_retry();
                trace!(attempts, "slot swap raced, retrying");
                if !ctx.options.retry_backoff.is_zero() {
                    thread::sleep(ctx.options.retry_backoff);
                }
            }
            Err(ExchangeError::Retry) => {
                return fail(ctx, tx, ExchangeError::RetryExhausted { attempts });
            }
            Err(err) => return fail(ctx, tx, err),
        }
    }

    tx.copy(ctx.engines);
    tx.metadata(ctx.env);
    tx.remap(ctx.env);
    tx.finish(ctx.env);
    ctx.metrics.pair_exchanged();
    PairStatus::Exchanged
}

fn fail(ctx: &TxContext<'_>, tx: ExchangeTx, err: ExchangeError) -> PairStatus {
    debug!(state = ?tx.state(), error = %err, "pair aborted");
    tx.abort(ctx.env);
    ctx.metrics.pair_failed();
    PairStatus::Failed(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSystem;
    use crate::types::NodeId;

    #[test]
    fn rmap_anchor_is_pinned_only_while_unmapped() {
        let sim = SimSystem::builder().nodes(2).frame_size(64).build();
        let env = sim.env();
        let mm = sim.new_mm();
        let vma = sim.new_anon_vma();
        let from = sim.alloc_anon_page(&mm, &vma, 0, NodeId(0));
        let to = sim.alloc_anon_page(&mm, &vma, 64, NodeId(1));
        sim.isolate(&from);
        sim.isolate(&to);

        let mut tx = ExchangeTx::new(PagePair::new(from.clone(), to.clone()));
        tx.lock(true, true).unwrap();
        assert_eq!(vma.pins(), 0);
        tx.unmap(&env).unwrap();
        assert_eq!(tx.state(), TxState::Unmapped);
        assert_eq!(vma.pins(), 2);
        tx.restore_mappings(&env);
        assert_eq!(tx.state(), TxState::Locked);
        assert_eq!(vma.pins(), 0);

        tx.unmap(&env).unwrap();
        assert_eq!(vma.pins(), 2);
        tx.abort(&env);
        assert_eq!(vma.pins(), 0);
        assert!(!from.is_locked() && !to.is_locked());
        assert!(Arc::ptr_eq(&sim.rmap().translate(mm.id(), 0).unwrap(), &from));
    }
}
