//! Slot owners: file-backed address spaces, anonymous anchors and process
//! memory domains.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::primitives::concurrency::RunGate;
use crate::primitives::page::{Page, PageRef};
use crate::types::{AnonVmaId, MappingId, MmId};

/// Anchor shared by every translation of a group of anonymous pages.
pub struct AnonVma {
    id: AnonVmaId,
    pins: AtomicU32,
}

impl AnonVma {
    /// Creates an anchor.
    pub fn new(id: AnonVmaId) -> Arc<Self> {
        Arc::new(Self {
            id,
            pins: AtomicU32::new(0),
        })
    }

    /// Identity of the anchor.
    pub fn id(&self) -> AnonVmaId {
        self.id
    }

    /// Keeps the anchor alive until the returned handle is dropped.
    pub fn pin(self: &Arc<Self>) -> RmapHandle {
        self.pins.fetch_add(1, Ordering::AcqRel);
        RmapHandle {
            vma: Arc::clone(self),
        }
    }

    /// Number of outstanding handles.
    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

/// Pinned anonymous anchor, released on drop.
pub struct RmapHandle {
    vma: Arc<AnonVma>,
}

impl RmapHandle {
    /// The pinned anchor.
    pub fn anon_vma(&self) -> &Arc<AnonVma> {
        &self.vma
    }
}

impl Drop for RmapHandle {
    fn drop(&mut self) {
        self.vma.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Page cache of one file: index to page, behind its own exclusion lock.
pub struct AddressSpace {
    id: MappingId,
    shmem: bool,
    account_dirty: bool,
    slots: Mutex<BTreeMap<u64, Arc<Page>>>,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(id: MappingId) -> Arc<Self> {
        Self::with_options(id, false, true)
    }

    /// Creates an address space with explicit accounting behaviour.
    pub fn with_options(id: MappingId, shmem: bool, account_dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            shmem,
            account_dirty,
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// Identity of the address space.
    pub fn id(&self) -> MappingId {
        self.id
    }

    /// Whether pages here are shared memory backed by swap.
    pub fn is_shmem(&self) -> bool {
        self.shmem
    }

    /// Whether dirty pages here count toward dirty-page accounting.
    pub fn accounts_dirty(&self) -> bool {
        self.account_dirty
    }

    /// Takes the index lock.
    pub fn lock_slots(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Page>>> {
        self.slots.lock()
    }

    /// Stores `page` at `index` and every following index it spans.
    ///
    /// The page takes one reference per frame. Returns false if any target
    /// slot is occupied.
    pub fn insert(&self, index: u64, page: &Arc<Page>) -> bool {
        let nr = page.nr_frames() as u64;
        let mut slots = self.slots.lock();
        if slots.range(index..index + nr).next().is_some() {
            return false;
        }
        for i in index..index + nr {
            slots.insert(i, Arc::clone(page));
        }
        page.refs().add(nr as u32);
        true
    }

    /// Removes the page at `index` and all slots it spans, dropping the
    /// references the cache held.
    pub fn remove(&self, index: u64) -> Option<Arc<Page>> {
        let mut slots = self.slots.lock();
        let page = slots.get(&index).cloned()?;
        slots.retain(|_, p| !Arc::ptr_eq(p, &page));
        page.refs().sub(page.nr_frames() as u32);
        Some(page)
    }

    /// Current occupant of `index`, without taking a reference.
    pub fn lookup(&self, index: u64) -> Option<Arc<Page>> {
        self.slots.lock().get(&index).cloned()
    }

    /// Number of occupied slots.
    pub fn nr_slots(&self) -> usize {
        self.slots.lock().len()
    }

    /// Speculative lookup: reads the slot, takes a reference if the count is
    /// not frozen, then confirms the slot still holds the same page.
    pub fn find_get(&self, index: u64) -> Option<PageRef> {
        loop {
            let page = self.lookup(index)?;
            let Some(held) = PageRef::try_get(&page) else {
                std::thread::yield_now();
                continue;
            };
            match self.lookup(index) {
                Some(current) if Arc::ptr_eq(&current, &page) => return Some(held),
                _ => continue,
            }
        }
    }
}

/// Memory domain of one process.
pub struct Mm {
    id: MmId,
    gate: RunGate,
}

impl Mm {
    /// Creates a memory domain.
    pub fn new(id: MmId) -> Arc<Self> {
        Arc::new(Self {
            id,
            gate: RunGate::new(),
        })
    }

    /// Identity of the domain.
    pub fn id(&self) -> MmId {
        self.id
    }

    /// Gate admitting one top-level exchange at a time.
    pub fn gate(&self) -> &RunGate {
        &self.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::page::PageKind;
    use crate::types::FrameId;

    #[test]
    fn insert_spans_every_frame_and_takes_refs() {
        let mapping = AddressSpace::new(MappingId(1));
        let page = Page::builder(FrameId(10))
            .frame_size(64)
            .huge(PageKind::TransHuge, 4)
            .build();
        assert!(mapping.insert(8, &page));
        assert_eq!(page.ref_count(), 5);
        assert_eq!(mapping.nr_slots(), 4);
        for i in 8..12 {
            assert!(Arc::ptr_eq(&mapping.lookup(i).unwrap(), &page));
        }
        let other = Page::builder(FrameId(20)).frame_size(64).build();
        assert!(!mapping.insert(11, &other));

        let removed = mapping.remove(9).unwrap();
        assert!(Arc::ptr_eq(&removed, &page));
        assert_eq!(page.ref_count(), 1);
        assert_eq!(mapping.nr_slots(), 0);
    }

    #[test]
    fn find_get_rechecks_slot_after_taking_ref() {
        let mapping = AddressSpace::new(MappingId(2));
        let page = Page::builder(FrameId(30)).frame_size(64).build();
        mapping.insert(0, &page);
        let held = mapping.find_get(0).expect("present");
        assert!(Arc::ptr_eq(held.page(), &page));
        assert_eq!(page.ref_count(), 3);
        drop(held);
        assert_eq!(page.ref_count(), 2);
        assert!(mapping.find_get(1).is_none());
    }

    #[test]
    fn rmap_handles_count_pins() {
        let vma = AnonVma::new(AnonVmaId(3));
        let a = vma.pin();
        let b = vma.pin();
        assert_eq!(vma.pins(), 2);
        assert_eq!(a.anon_vma().id(), AnonVmaId(3));
        drop(a);
        drop(b);
        assert_eq!(vma.pins(), 0);
    }
}
