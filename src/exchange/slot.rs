//! Identity exchange inside owning address spaces.
//!
//! A page found through a mapping's slot index must be the only occupant of
//! that slot at every instant a reader can observe. When one side is
//! file-backed the swap runs under the mapping's index lock with both
//! reference counts frozen, so a speculative reader either sees the old
//! page before the freeze or retries until the new one is published.

use std::sync::Arc;

use tracing::trace;

use crate::env::{NodeStat, ZoneAccounting};
use crate::primitives::mapping::AddressSpace;
use crate::primitives::page::{lock_meta_pair, Page, PageFlags, PageMeta, PageOwner};
use crate::types::{ExchangeError, Result};

/// References a page holds in its current slot: the isolation reference,
/// one per frame held by a page cache, plus `extra` held by the caller.
pub fn expected_refs(meta: &PageMeta, nr_frames: usize, extra: u32) -> u32 {
    let cache = match meta.owner {
        PageOwner::File(_) => nr_frames as u32,
        _ => 0,
    };
    1 + extra + cache
}

/// Exchanges the slot identities of `to` and `from`.
///
/// Moves the owner, index, private data (with `PRIVATE`) and `SWAP_BACKED`.
/// Returns [`ExchangeError::Retry`] when either page carries a reference
/// beyond [`expected_refs`] or the slot changed underneath; nothing is
/// modified in that case.
pub fn swap_slots(
    to: &Arc<Page>,
    from: &Arc<Page>,
    extra: u32,
    accounting: &dyn ZoneAccounting,
) -> Result<()> {
    if to.nr_frames() != from.nr_frames() {
        return Err(ExchangeError::OrderMismatch {
            from: from.nr_frames(),
            to: to.nr_frames(),
        });
    }
    if to.byte_len() != from.byte_len() {
        return Err(ExchangeError::SizeMismatch {
            from: from.byte_len(),
            to: to.byte_len(),
        });
    }
    if Arc::ptr_eq(to, from) {
        return Err(ExchangeError::Invalid("same page"));
    }
    match (to.address_space(), from.address_space()) {
        (None, None) => swap_unowned(to, from, extra),
        (Some(mapping), None) => swap_with_mapping(&mapping, to, from, extra, accounting),
        (None, Some(mapping)) => swap_with_mapping(&mapping, from, to, extra, accounting),
        (Some(_), Some(_)) => Err(ExchangeError::BothMapped),
    }
}

fn swap_unowned(to: &Page, from: &Page, extra: u32) -> Result<()> {
    let nr = to.nr_frames();
    let (mut mt, mut mf) = lock_meta_pair(to, from);
    if to.ref_count() != expected_refs(&mt, nr, extra)
        || from.ref_count() != expected_refs(&mf, nr, extra)
    {
        return Err(ExchangeError::Retry);
    }
    swap_identity(&mut mt, &mut mf);
    Ok(())
}

fn swap_with_mapping(
    mapping: &AddressSpace,
    mapped: &Arc<Page>,
    orphan: &Arc<Page>,
    extra: u32,
    accounting: &dyn ZoneAccounting,
) -> Result<()> {
    let nr = mapped.nr_frames();
    let (index, shmem, dirty) = {
        let mut slots = mapping.lock_slots();
        let (mut mm, mut mo) = lock_meta_pair(mapped, orphan);
        let index = mm.index;
        match slots.get(&index) {
            Some(current) if Arc::ptr_eq(current, mapped) => {}
            _ => return Err(ExchangeError::Retry),
        }
        let Some(frozen_mapped) = mapped.refs().try_freeze(expected_refs(&mm, nr, extra)) else {
            return Err(ExchangeError::Retry);
        };
        let Some(frozen_orphan) = orphan.refs().try_freeze(expected_refs(&mo, nr, extra)) else {
            return Err(ExchangeError::Retry);
        };

        let shmem = mapping.is_shmem()
            || (mm.flags.contains(PageFlags::SWAP_BACKED)
                && !mm.flags.contains(PageFlags::SWAP_CACHE));
        let dirty = mm.flags.contains(PageFlags::DIRTY) && mapping.accounts_dirty();

        swap_identity(&mut mm, &mut mo);
        for i in index..index + nr as u64 {
            slots.insert(i, Arc::clone(orphan));
        }
        frozen_mapped.unfreeze(expected_refs(&mm, nr, extra));
        frozen_orphan.unfreeze(expected_refs(&mo, nr, extra));
        (index, shmem, dirty)
    };
    trace!(
        mapping = mapping.id().0,
        index,
        old = %mapped.frame(),
        new = %orphan.frame(),
        "slot replaced"
    );

    if (mapped.node(), mapped.zone()) != (orphan.node(), orphan.zone()) {
        let delta = nr as i64;
        let (old_node, new_node) = (mapped.node(), orphan.node());
        accounting.mod_node_state(old_node, NodeStat::FilePages, -delta);
        accounting.mod_node_state(new_node, NodeStat::FilePages, delta);
        if shmem {
            accounting.mod_node_state(old_node, NodeStat::Shmem, -delta);
            accounting.mod_node_state(new_node, NodeStat::Shmem, delta);
        }
        if dirty {
            accounting.mod_node_state(old_node, NodeStat::FileDirty, -delta);
            accounting.mod_zone_state(old_node, mapped.zone(), NodeStat::WritePending, -delta);
            accounting.mod_node_state(new_node, NodeStat::FileDirty, delta);
            accounting.mod_zone_state(new_node, orphan.zone(), NodeStat::WritePending, delta);
        }
    }
    Ok(())
}

fn swap_identity(a: &mut PageMeta, b: &mut PageMeta) {
    std::mem::swap(&mut a.owner, &mut b.owner);
    std::mem::swap(&mut a.index, &mut b.index);
    std::mem::swap(&mut a.private, &mut b.private);
    for bit in [PageFlags::PRIVATE, PageFlags::SWAP_BACKED] {
        let (in_a, in_b) = (a.flags.contains(bit), b.flags.contains(bit));
        a.flags.set(bit, in_b);
        b.flags.set(bit, in_a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::NodeStat;
    use crate::primitives::mapping::AnonVma;
    use crate::primitives::page::{OwnerId, PageKind, PrivateData};
    use crate::types::{AnonVmaId, FrameId, MappingId, NodeId, ZoneId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Ledger {
        changes: Mutex<Vec<(NodeId, NodeStat, i64)>>,
    }

    impl ZoneAccounting for Ledger {
        fn mod_node_state(&self, node: NodeId, stat: NodeStat, delta: i64) {
            self.changes.lock().push((node, stat, delta));
        }

        fn mod_zone_state(&self, node: NodeId, _zone: ZoneId, stat: NodeStat, delta: i64) {
            self.changes.lock().push((node, stat, delta));
        }
    }

    fn anon(frame: u64, node: u16, vma: &Arc<AnonVma>, index: u64) -> Arc<Page> {
        let page = Page::builder(FrameId(frame))
            .node(NodeId(node))
            .frame_size(64)
            .build();
        {
            let mut meta = page.meta();
            meta.owner = PageOwner::Anon(Arc::clone(vma));
            meta.index = index;
            meta.flags = PageFlags::SWAP_BACKED;
        }
        page
    }

    #[test]
    fn anonymous_identities_swap() {
        let va = AnonVma::new(AnonVmaId(1));
        let vb = AnonVma::new(AnonVmaId(2));
        let a = anon(1, 0, &va, 10);
        let b = anon(2, 1, &vb, 20);
        b.clear_flags(PageFlags::SWAP_BACKED);
        b.meta().private = Some(PrivateData {
            tag: 5,
            releasable: true,
        });
        b.set_flags(PageFlags::PRIVATE);

        swap_slots(&a, &b, 0, &Ledger::default()).unwrap();
        assert_eq!(a.identity().owner, OwnerId::Anon(AnonVmaId(2)));
        assert_eq!(a.identity().index, 20);
        assert_eq!(b.identity().owner, OwnerId::Anon(AnonVmaId(1)));
        assert_eq!(b.identity().index, 10);
        assert_eq!(a.flags(), PageFlags::PRIVATE);
        assert_eq!(b.flags(), PageFlags::SWAP_BACKED);
        assert_eq!(a.meta().private.map(|p| p.tag), Some(5));
    }

    #[test]
    fn unexpected_reference_asks_for_retry() {
        let va = AnonVma::new(AnonVmaId(1));
        let a = anon(1, 0, &va, 1);
        let b = anon(2, 0, &va, 2);
        b.refs().inc();
        assert_eq!(
            swap_slots(&a, &b, 0, &Ledger::default()),
            Err(ExchangeError::Retry)
        );
        assert_eq!(a.identity().index, 1);
        assert_eq!(b.identity().index, 2);
        assert_eq!(swap_slots(&a, &b, 1, &Ledger::default()), Err(ExchangeError::Retry));
    }

    #[test]
    fn file_slot_moves_to_orphan_and_accounting_follows() {
        let mapping = AddressSpace::new(MappingId(9));
        let file = Page::builder(FrameId(1))
            .node(NodeId(0))
            .frame_size(64)
            .huge(PageKind::TransHuge, 2)
            .build();
        {
            let mut meta = file.meta();
            meta.owner = PageOwner::File(Arc::clone(&mapping));
            meta.index = 4;
            meta.flags = PageFlags::DIRTY;
        }
        assert!(mapping.insert(4, &file));
        let orphan = Page::builder(FrameId(2))
            .node(NodeId(1))
            .frame_size(64)
            .huge(PageKind::TransHuge, 2)
            .build();
        let ledger = Ledger::default();

        swap_slots(&file, &orphan, 0, &ledger).unwrap();

        assert!(Arc::ptr_eq(&mapping.lookup(4).unwrap(), &orphan));
        assert!(Arc::ptr_eq(&mapping.lookup(5).unwrap(), &orphan));
        assert_eq!(orphan.identity().owner, OwnerId::File(MappingId(9)));
        assert_eq!(file.identity().owner, OwnerId::None);
        assert_eq!(orphan.ref_count(), 3);
        assert_eq!(file.ref_count(), 1);
        let changes = ledger.changes.lock().clone();
        assert!(changes.contains(&(NodeId(0), NodeStat::FilePages, -2)));
        assert!(changes.contains(&(NodeId(1), NodeStat::FilePages, 2)));
        assert!(changes.contains(&(NodeId(1), NodeStat::FileDirty, 2)));
        assert!(!changes.iter().any(|(_, stat, _)| *stat == NodeStat::Shmem));
    }

    #[test]
    fn stale_slot_asks_for_retry() {
        let mapping = AddressSpace::new(MappingId(3));
        let file = Page::builder(FrameId(1)).frame_size(64).build();
        file.meta().owner = PageOwner::File(Arc::clone(&mapping));
        file.meta().index = 0;
        let orphan = Page::builder(FrameId(2)).frame_size(64).build();
        let ledger = Ledger::default();
        assert_eq!(swap_slots(&file, &orphan, 0, &ledger), Err(ExchangeError::Retry));
        assert_eq!(file.ref_count(), 1);
    }

    #[test]
    fn two_file_pages_are_rejected() {
        let m1 = AddressSpace::new(MappingId(1));
        let m2 = AddressSpace::new(MappingId(2));
        let a = Page::builder(FrameId(1)).frame_size(64).build();
        let b = Page::builder(FrameId(2)).frame_size(64).build();
        a.meta().owner = PageOwner::File(m1);
        b.meta().owner = PageOwner::File(m2);
        assert_eq!(
            swap_slots(&a, &b, 0, &Ledger::default()),
            Err(ExchangeError::BothMapped)
        );
    }

    #[test]
    fn unequal_sizes_are_refused_before_any_change() {
        let va = AnonVma::new(AnonVmaId(1));
        let small = anon(1, 0, &va, 1);
        let large = Page::builder(FrameId(2)).frame_size(128).build();
        large.meta().index = 7;
        assert_eq!(
            swap_slots(&small, &large, 0, &Ledger::default()),
            Err(ExchangeError::SizeMismatch { from: 128, to: 64 })
        );
        assert_eq!(small.identity().index, 1);
        assert_eq!(large.identity().index, 7);
    }
}
