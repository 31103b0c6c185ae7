//! Exchange of non-content page attributes.
//!
//! Runs with both page locks held. Status bits, the NUMA hint and the
//! accounting group move to the other page. Swap-cache membership is
//! corrected last, after the dedup index has been re-pointed, so a swap-cache
//! lookup never sees it set on a page whose other bits are still moving.

use crate::env::DedupIndex;
use crate::primitives::page::{lock_meta_pair, Page, PageFlags, PageMeta};
use crate::types::CgroupId;

/// Bits that move to the other page unchanged.
const CARRIED: PageFlags = PageFlags::ERROR
    .union(PageFlags::REFERENCED)
    .union(PageFlags::UPTODATE)
    .union(PageFlags::CHECKED)
    .union(PageFlags::MAPPED_TO_DISK)
    .union(PageFlags::DIRTY)
    .union(PageFlags::YOUNG)
    .union(PageFlags::IDLE);

/// Bits cleared on capture. `WRITEBACK` is dropped, never carried.
const CLEARED: PageFlags = CARRIED
    .union(PageFlags::ACTIVE)
    .union(PageFlags::UNEVICTABLE)
    .union(PageFlags::WRITEBACK);

#[derive(Clone, Copy, Debug)]
struct Captured {
    flags: PageFlags,
    numa_hint: i32,
    cgroup: Option<CgroupId>,
    swap_cache: bool,
}

fn capture(meta: &mut PageMeta) -> Captured {
    let captured = Captured {
        flags: meta.flags & CLEARED,
        numa_hint: meta.numa_hint,
        cgroup: meta.cgroup,
        swap_cache: meta.flags.contains(PageFlags::SWAP_CACHE),
    };
    meta.flags.remove(CLEARED);
    meta.numa_hint = -1;
    meta.cgroup = None;
    captured
}

fn apply(meta: &mut PageMeta, other: &Captured) {
    meta.flags.insert(other.flags & CARRIED);
    if other.flags.contains(PageFlags::ACTIVE) {
        meta.flags.insert(PageFlags::ACTIVE);
    } else if other.flags.contains(PageFlags::UNEVICTABLE) {
        meta.flags.insert(PageFlags::UNEVICTABLE);
    }
    meta.numa_hint = other.numa_hint;
    meta.cgroup = other.cgroup;
}

/// Exchanges status bits, NUMA hint, accounting group and swap-cache
/// membership between `to` and `from`, then re-points `dedup`.
///
/// `PRIVATE`, `SWAP_BACKED` and `LRU` belong to the slot and the list, not
/// the content, and are left alone. Cannot fail.
pub fn transfer_metadata(to: &Page, from: &Page, dedup: Option<&dyn DedupIndex>) {
    let (to_was, from_was) = {
        let (mut mt, mut mf) = lock_meta_pair(to, from);
        let to_was = capture(&mut mt);
        let from_was = capture(&mut mf);
        apply(&mut mt, &from_was);
        apply(&mut mf, &to_was);
        (to_was, from_was)
    };

    if let Some(dedup) = dedup {
        dedup.exchange(to, from);
    }

    let (mut mt, mut mf) = lock_meta_pair(to, from);
    mt.flags.remove(PageFlags::SWAP_CACHE);
    mf.flags.remove(PageFlags::SWAP_CACHE);
    if from_was.swap_cache {
        mt.flags.insert(PageFlags::SWAP_CACHE);
    }
    if to_was.swap_cache {
        mf.flags.insert(PageFlags::SWAP_CACHE);
    }
}
