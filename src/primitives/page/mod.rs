//! Page records: identity, content, metadata and the page lock.
//!
//! A [`Page`] is owned by the host environment. The exchange core only
//! mutates its metadata and content while holding the page lock, which is
//! acquired as a [`PageLock`] and wrapped with an optional reverse-mapping
//! handle in a [`PageGuard`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::primitives::concurrency::RefCount;
use crate::primitives::mapping::{AddressSpace, AnonVma, RmapHandle};
use crate::types::{page_fingerprint, AnonVmaId, CgroupId, FrameId, MappingId, NodeId, ZoneId};

/// Frames spanned by a transparent huge page.
pub const HPAGE_PMD_NR: usize = 512;

/// Default size of one frame in bytes.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

bitflags! {
    /// Status bits carried by a page.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// An I/O error occurred on the page.
        const ERROR = 1 << 0;
        /// Recently referenced.
        const REFERENCED = 1 << 1;
        /// Content is valid.
        const UPTODATE = 1 << 2;
        /// On the active list.
        const ACTIVE = 1 << 3;
        /// Must not be evicted.
        const UNEVICTABLE = 1 << 4;
        /// Filesystem-owned check bit.
        const CHECKED = 1 << 5;
        /// Has on-disk blocks allocated.
        const MAPPED_TO_DISK = 1 << 6;
        /// Content differs from backing store.
        const DIRTY = 1 << 7;
        /// Accessed since the last idle scan.
        const YOUNG = 1 << 8;
        /// Not accessed since the last idle scan.
        const IDLE = 1 << 9;
        /// Member of the swap cache.
        const SWAP_CACHE = 1 << 10;
        /// Write-back in progress.
        const WRITEBACK = 1 << 11;
        /// Private data attached.
        const PRIVATE = 1 << 12;
        /// Backed by swap rather than a file.
        const SWAP_BACKED = 1 << 13;
        /// Linked on an LRU list.
        const LRU = 1 << 14;
    }
}

/// Shape of a page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Single frame.
    #[default]
    Base,
    /// Transparent huge page.
    TransHuge,
    /// Hugetlb page, possibly gigantic.
    HugeTlb,
}

/// Filesystem-private data attached to a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrivateData {
    /// Opaque tag identifying the attachment.
    pub tag: u64,
    /// Whether the owner can drop the data on request.
    pub releasable: bool,
}

/// Owner of a page's slot.
#[derive(Clone, Default)]
pub enum PageOwner {
    /// No owner (orphaned or freshly allocated).
    #[default]
    None,
    /// Anonymous memory rooted at a reverse-mapping anchor.
    Anon(Arc<AnonVma>),
    /// File-backed memory inside an address space.
    File(Arc<AddressSpace>),
}

impl PageOwner {
    /// Identity of the owner.
    pub fn id(&self) -> OwnerId {
        match self {
            PageOwner::None => OwnerId::None,
            PageOwner::Anon(vma) => OwnerId::Anon(vma.id()),
            PageOwner::File(mapping) => OwnerId::File(mapping.id()),
        }
    }

    /// The owning address space, if file-backed.
    pub fn address_space(&self) -> Option<&Arc<AddressSpace>> {
        match self {
            PageOwner::File(mapping) => Some(mapping),
            _ => None,
        }
    }

    /// Whether this is a file-backed owner.
    pub fn is_file(&self) -> bool {
        matches!(self, PageOwner::File(_))
    }
}

impl fmt::Debug for PageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.id(), f)
    }
}

/// Comparable identity of a page owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnerId {
    /// No owner.
    None,
    /// Anonymous anchor.
    Anon(AnonVmaId),
    /// File-backed address space.
    File(MappingId),
}

/// Slot identity of a page: who owns it and at which index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageIdentity {
    /// Owner of the slot.
    pub owner: OwnerId,
    /// Index of the slot inside its owner.
    pub index: u64,
}

/// Mutable page metadata. Mutation requires the page lock.
#[derive(Clone, Debug)]
pub struct PageMeta {
    /// Status bits.
    pub flags: PageFlags,
    /// Last accessing CPU/PID hint, `-1` when unset.
    pub numa_hint: i32,
    /// Accounting group charged for the page.
    pub cgroup: Option<CgroupId>,
    /// Slot owner.
    pub owner: PageOwner,
    /// Slot index inside the owner.
    pub index: u64,
    /// Attached private data.
    pub private: Option<PrivateData>,
}

impl Default for PageMeta {
    fn default() -> Self {
        Self {
            flags: PageFlags::empty(),
            numa_hint: -1,
            cgroup: None,
            owner: PageOwner::None,
            index: 0,
            private: None,
        }
    }
}

impl PageMeta {
    /// Slot identity snapshot.
    pub fn identity(&self) -> PageIdentity {
        PageIdentity {
            owner: self.owner.id(),
            index: self.index,
        }
    }

    /// Whether private data is attached.
    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }
}

/// One physical page, possibly spanning several frames.
pub struct Page {
    frame: FrameId,
    node: NodeId,
    zone: ZoneId,
    kind: PageKind,
    nr_frames: usize,
    refs: RefCount,
    locked: Mutex<bool>,
    unlocked: Condvar,
    meta: Mutex<PageMeta>,
    writeback_done: Condvar,
    data: RwLock<Box<[u8]>>,
}

/// Builder for [`Page`].
#[derive(Clone, Debug)]
pub struct PageBuilder {
    frame: FrameId,
    node: NodeId,
    zone: ZoneId,
    kind: PageKind,
    nr_frames: usize,
    frame_size: usize,
    refs: u32,
    meta: PageMeta,
}

impl PageBuilder {
    /// Locality domain of the page.
    pub fn node(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    /// Zone of the page inside its node.
    pub fn zone(mut self, zone: ZoneId) -> Self {
        self.zone = zone;
        self
    }

    /// Makes the page span `nr_frames` frames.
    pub fn huge(mut self, kind: PageKind, nr_frames: usize) -> Self {
        self.kind = kind;
        self.nr_frames = nr_frames.max(1);
        self
    }

    /// Size of one frame in bytes.
    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Initial reference count.
    pub fn refs(mut self, refs: u32) -> Self {
        self.refs = refs;
        self
    }

    /// Initial metadata.
    pub fn meta(mut self, meta: PageMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Builds the page with zeroed content.
    pub fn build(self) -> Arc<Page> {
        let len = self.frame_size * self.nr_frames;
        Arc::new(Page {
            frame: self.frame,
            node: self.node,
            zone: self.zone,
            kind: self.kind,
            nr_frames: self.nr_frames,
            refs: RefCount::new(self.refs),
            locked: Mutex::new(false),
            unlocked: Condvar::new(),
            meta: Mutex::new(self.meta),
            writeback_done: Condvar::new(),
            data: RwLock::new(vec![0u8; len].into_boxed_slice()),
        })
    }
}

impl Page {
    /// Starts building a page backed by `frame`.
    pub fn builder(frame: FrameId) -> PageBuilder {
        PageBuilder {
            frame,
            node: NodeId::default(),
            zone: ZoneId::default(),
            kind: PageKind::Base,
            nr_frames: 1,
            frame_size: DEFAULT_FRAME_SIZE,
            refs: 1,
            meta: PageMeta::default(),
        }
    }

    /// First frame backing the page.
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Locality domain of the page.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Zone of the page.
    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    /// Shape of the page.
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Number of frames spanned.
    pub fn nr_frames(&self) -> usize {
        self.nr_frames
    }

    /// Whether the page spans more than one frame.
    pub fn is_huge(&self) -> bool {
        self.kind != PageKind::Base
    }

    /// Whether the page is a hugetlb page.
    pub fn is_hugetlb(&self) -> bool {
        self.kind == PageKind::HugeTlb
    }

    /// Content length in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.read().len()
    }

    /// Reference count of the page.
    pub fn refs(&self) -> &RefCount {
        &self.refs
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    /// Locks the metadata.
    pub fn meta(&self) -> MutexGuard<'_, PageMeta> {
        self.meta.lock()
    }

    /// Current status bits.
    pub fn flags(&self) -> PageFlags {
        self.meta.lock().flags
    }

    /// Sets status bits.
    pub fn set_flags(&self, flags: PageFlags) {
        self.meta.lock().flags.insert(flags);
    }

    /// Clears status bits.
    pub fn clear_flags(&self, flags: PageFlags) {
        self.meta.lock().flags.remove(flags);
    }

    /// Slot identity snapshot.
    pub fn identity(&self) -> PageIdentity {
        self.meta.lock().identity()
    }

    /// Owning address space, if file-backed.
    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.meta.lock().owner.address_space().cloned()
    }

    /// Read access to the content.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the content.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Copies `bytes` into the content at `offset`, clamped to the page.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write();
        if offset >= data.len() {
            return;
        }
        let end = (offset + bytes.len()).min(data.len());
        data[offset..end].copy_from_slice(&bytes[..end - offset]);
    }

    /// Fingerprint of the current content.
    pub fn fingerprint(&self) -> u32 {
        page_fingerprint(&self.data.read())
    }

    /// Attempts to take the page lock without waiting.
    pub fn try_lock(self: &Arc<Self>) -> Option<PageLock> {
        let mut locked = self.locked.lock();
        if *locked {
            return None;
        }
        *locked = true;
        Some(PageLock {
            page: Arc::clone(self),
        })
    }

    /// Takes the page lock, waiting for the current holder.
    pub fn lock(self: &Arc<Self>) -> PageLock {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
        *locked = true;
        PageLock {
            page: Arc::clone(self),
        }
    }

    /// Whether the page lock is held.
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        debug_assert!(*locked, "unlock of an unlocked page");
        *locked = false;
        self.unlocked.notify_one();
    }

    /// Marks write-back as started.
    pub fn start_writeback(&self) {
        self.meta.lock().flags.insert(PageFlags::WRITEBACK);
    }

    /// Marks write-back as finished and wakes waiters.
    pub fn end_writeback(&self) {
        let mut meta = self.meta.lock();
        meta.flags.remove(PageFlags::WRITEBACK);
        self.writeback_done.notify_all();
    }

    /// Whether write-back is in flight.
    pub fn under_writeback(&self) -> bool {
        self.meta.lock().flags.contains(PageFlags::WRITEBACK)
    }

    /// Blocks until in-flight write-back finishes.
    pub fn wait_on_writeback(&self) {
        let mut meta = self.meta.lock();
        while meta.flags.contains(PageFlags::WRITEBACK) {
            self.writeback_done.wait(&mut meta);
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("frame", &self.frame)
            .field("node", &self.node)
            .field("kind", &self.kind)
            .field("nr_frames", &self.nr_frames)
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// Locks the metadata of two distinct pages in frame order.
///
/// Returns the guards in argument order.
pub fn lock_meta_pair<'a>(
    a: &'a Page,
    b: &'a Page,
) -> (MutexGuard<'a, PageMeta>, MutexGuard<'a, PageMeta>) {
    debug_assert!(!std::ptr::eq(a, b), "metadata pair on one page");
    if a.frame <= b.frame {
        let ga = a.meta.lock();
        let gb = b.meta.lock();
        (ga, gb)
    } else {
        let gb = b.meta.lock();
        let ga = a.meta.lock();
        (ga, gb)
    }
}

/// Held page lock. Dropping it unlocks the page.
pub struct PageLock {
    page: Arc<Page>,
}

impl PageLock {
    /// The locked page.
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        self.page.unlock();
    }
}

/// Page lock plus the reverse-mapping handle pinned while the page's
/// translations are suspended.
///
/// The handle is dropped no later than the lock.
pub struct PageGuard {
    rmap: Option<RmapHandle>,
    lock: PageLock,
}

impl PageGuard {
    /// Wraps a held page lock.
    pub fn new(lock: PageLock) -> Self {
        Self { rmap: None, lock }
    }

    /// The locked page.
    pub fn page(&self) -> &Arc<Page> {
        self.lock.page()
    }

    /// Locks the page metadata.
    pub fn meta(&self) -> MutexGuard<'_, PageMeta> {
        self.lock.page().meta()
    }

    /// Pins the anonymous anchor until the guard is released.
    pub fn capture_rmap(&mut self) {
        let handle = match &self.lock.page().meta().owner {
            PageOwner::Anon(vma) => Some(vma.pin()),
            _ => None,
        };
        self.rmap = handle;
    }

    /// Drops the reverse-mapping handle, keeping the lock.
    pub fn release_rmap(&mut self) {
        self.rmap = None;
    }

    /// Whether a reverse-mapping handle is held.
    pub fn has_rmap(&self) -> bool {
        self.rmap.is_some()
    }
}

/// Counted reference taken with get-if-nonzero semantics.
pub struct PageRef {
    page: Arc<Page>,
}

impl PageRef {
    /// Takes a reference unless the count is frozen or zero.
    pub fn try_get(page: &Arc<Page>) -> Option<Self> {
        page.refs.try_get().then(|| Self {
            page: Arc::clone(page),
        })
    }

    /// The referenced page.
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.page.refs.put();
    }
}

/// Two isolated pages to exchange.
#[derive(Clone)]
pub struct PagePair {
    /// Page whose contents move to `to`'s location.
    pub from: Arc<Page>,
    /// Page whose contents move to `from`'s location.
    pub to: Arc<Page>,
}

impl PagePair {
    /// Pairs two isolated pages.
    pub fn new(from: Arc<Page>, to: Arc<Page>) -> Self {
        Self { from, to }
    }

    /// Whether either page spans more than one frame.
    pub fn is_huge(&self) -> bool {
        self.from.is_huge() || self.to.is_huge()
    }

    /// Whether both pages span the same number of frames.
    pub fn orders_match(&self) -> bool {
        self.from.nr_frames() == self.to.nr_frames()
    }

    /// Whether both pages hold the same number of bytes.
    pub fn sizes_match(&self) -> bool {
        self.from.byte_len() == self.to.byte_len()
    }

    /// Whether both sides are the same page.
    pub fn is_self_pair(&self) -> bool {
        Arc::ptr_eq(&self.from, &self.to)
    }
}

impl fmt::Debug for PagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePair")
            .field("from", &self.from.frame())
            .field("to", &self.to.frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn base_page(frame: u64) -> Arc<Page> {
        Page::builder(FrameId(frame)).frame_size(64).build()
    }

    #[test]
    fn try_lock_reports_contention() {
        let page = base_page(1);
        let held = page.try_lock().expect("first lock");
        assert!(page.is_locked());
        assert!(page.try_lock().is_none());
        drop(held);
        assert!(!page.is_locked());
        assert!(page.try_lock().is_some());
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        let page = base_page(2);
        let held = page.lock();
        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let page = Arc::clone(&page);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lock = page.lock();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_releases_rmap_with_lock() {
        let vma = AnonVma::new(AnonVmaId(7));
        let page = base_page(3);
        page.meta().owner = PageOwner::Anon(Arc::clone(&vma));
        let mut guard = PageGuard::new(page.lock());
        guard.capture_rmap();
        assert!(guard.has_rmap());
        assert_eq!(vma.pins(), 1);
        guard.release_rmap();
        assert!(!guard.has_rmap());
        assert_eq!(vma.pins(), 0);
        guard.capture_rmap();
        drop(guard);
        assert_eq!(vma.pins(), 0);
        assert!(!page.is_locked());
    }

    #[test]
    fn writeback_waiters_wake_on_completion() {
        let page = base_page(4);
        page.start_writeback();
        let handle = {
            let page = Arc::clone(&page);
            thread::spawn(move || page.wait_on_writeback())
        };
        thread::sleep(Duration::from_millis(20));
        page.end_writeback();
        handle.join().unwrap();
        assert!(!page.under_writeback());
    }

    #[test]
    fn page_ref_respects_frozen_count() {
        let page = base_page(5);
        let frozen = page.refs().try_freeze(1).expect("freeze");
        assert!(PageRef::try_get(&page).is_none());
        frozen.unfreeze(1);
        let r = PageRef::try_get(&page).expect("ref after unfreeze");
        assert_eq!(r.ref_count(), 2);
        drop(r);
        assert_eq!(page.ref_count(), 1);
    }

    #[test]
    fn huge_builder_sizes_content() {
        let page = Page::builder(FrameId(9))
            .frame_size(128)
            .huge(PageKind::TransHuge, 4)
            .build();
        assert!(page.is_huge());
        assert_eq!(page.byte_len(), 512);
        page.write_at(500, &[0xAA; 32]);
        assert_eq!(page.data()[511], 0xAA);
    }
}
