//! In-memory host environment.
//!
//! Implements every collaborator trait from [`crate::env`] over plain data
//! structures: page tables with migration placeholders, per-node LRU lists,
//! vmstat counters, a budgeted bookkeeping allocator, a fingerprint dedup
//! index and a software copy device with fault injection. [`SimSystem`]
//! ties them together and allocates, maps and isolates pages.
//!
//! Reference model: an anonymous page holds one reference per present
//! translation, a page cache holds one per frame, and isolation holds one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::env::{
    BookkeepingAllocator, DedupIndex, DmaChannel, DmaCookie, DmaDescriptor, DmaDevice,
    DmaDirection, DmaError, DmaRegion, MemoryEnv, NodeStat, PagePool, ReverseMap, Topology,
    ZoneAccounting,
};
use crate::primitives::mapping::{AddressSpace, AnonVma, Mm};
use crate::primitives::page::{Page, PageFlags, PageKind, PageMeta, PageOwner, DEFAULT_FRAME_SIZE};
use crate::types::{AllocSite, AnonVmaId, FrameId, MappingId, MmId, NodeId, ZoneId};

/// One page-table entry.
#[derive(Clone)]
pub enum Pte {
    /// Live translation.
    Present(Arc<Page>),
    /// Suspended translation left by an unmap.
    Migration(Arc<Page>),
}

/// Page tables of every simulated process.
#[derive(Default)]
pub struct SimRmap {
    ptes: Mutex<HashMap<(MmId, u64), Pte>>,
    pinned: Mutex<HashSet<FrameId>>,
}

impl SimRmap {
    /// Adds a translation of `page` at `vaddr`, taking a reference.
    pub fn map(&self, mm: MmId, vaddr: u64, page: &Arc<Page>) {
        page.refs().inc();
        self.ptes
            .lock()
            .insert((mm, vaddr), Pte::Present(Arc::clone(page)));
    }

    fn install(&self, mm: MmId, vaddr: u64, page: &Arc<Page>) {
        self.ptes
            .lock()
            .insert((mm, vaddr), Pte::Present(Arc::clone(page)));
    }

    /// Removes the translation at `vaddr`, dropping its reference.
    pub fn zap(&self, mm: MmId, vaddr: u64) -> bool {
        match self.ptes.lock().remove(&(mm, vaddr)) {
            Some(Pte::Present(page)) => {
                page.refs().put();
                true
            }
            Some(Pte::Migration(_)) => true,
            None => false,
        }
    }

    /// Page a live translation at `vaddr` points at.
    pub fn translate(&self, mm: MmId, vaddr: u64) -> Option<Arc<Page>> {
        match self.ptes.lock().get(&(mm, vaddr)) {
            Some(Pte::Present(page)) => Some(Arc::clone(page)),
            _ => None,
        }
    }

    /// Makes every unmap of `frame` fail until [`SimRmap::unpin`].
    pub fn pin(&self, frame: FrameId) {
        self.pinned.lock().insert(frame);
    }

    /// Lifts a [`SimRmap::pin`].
    pub fn unpin(&self, frame: FrameId) {
        self.pinned.lock().remove(&frame);
    }

    /// Number of suspended translations.
    pub fn migration_entries(&self) -> usize {
        self.ptes
            .lock()
            .values()
            .filter(|pte| matches!(pte, Pte::Migration(_)))
            .count()
    }
}

impl ReverseMap for SimRmap {
    fn mapcount(&self, page: &Page) -> usize {
        self.ptes
            .lock()
            .values()
            .filter(|pte| matches!(pte, Pte::Present(p) if std::ptr::eq(Arc::as_ptr(p), page)))
            .count()
    }

    fn try_to_unmap(&self, page: &Arc<Page>) -> bool {
        if self.pinned.lock().contains(&page.frame()) {
            return false;
        }
        let mut ptes = self.ptes.lock();
        for pte in ptes.values_mut() {
            if let Pte::Present(p) = pte {
                if Arc::ptr_eq(p, page) {
                    *pte = Pte::Migration(Arc::clone(page));
                    page.refs().put();
                }
            }
        }
        true
    }

    fn remove_migration_entries(&self, old: &Arc<Page>, new: &Arc<Page>) {
        let mut ptes = self.ptes.lock();
        for pte in ptes.values_mut() {
            if matches!(pte, Pte::Migration(p) if Arc::ptr_eq(p, old)) {
                new.refs().inc();
                *pte = Pte::Present(Arc::clone(new));
            }
        }
    }
}

/// LRU list a page sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LruList {
    /// Not recently used.
    Inactive,
    /// Recently used.
    Active,
    /// Never reclaimed.
    Unevictable,
}

impl LruList {
    fn for_flags(flags: PageFlags) -> Self {
        if flags.contains(PageFlags::UNEVICTABLE) {
            LruList::Unevictable
        } else if flags.contains(PageFlags::ACTIVE) {
            LruList::Active
        } else {
            LruList::Inactive
        }
    }
}

/// Per-node LRU lists.
#[derive(Default)]
pub struct SimLru {
    lists: Mutex<BTreeMap<(NodeId, LruList), Vec<Arc<Page>>>>,
    freed: Mutex<Vec<Arc<Page>>>,
    putbacks: AtomicUsize,
}

impl SimLru {
    /// Links `page` on the list its flags select.
    pub fn add(&self, page: &Arc<Page>) {
        page.set_flags(PageFlags::LRU);
        let list = LruList::for_flags(page.flags());
        self.lists
            .lock()
            .entry((page.node(), list))
            .or_default()
            .push(Arc::clone(page));
    }

    /// Takes `page` off its list with an isolation reference.
    pub fn isolate(&self, page: &Arc<Page>) -> bool {
        let mut lists = self.lists.lock();
        for members in lists.values_mut() {
            if let Some(pos) = members.iter().position(|p| Arc::ptr_eq(p, page)) {
                members.swap_remove(pos);
                page.refs().inc();
                page.clear_flags(PageFlags::LRU);
                return true;
            }
        }
        false
    }

    /// List `page` is linked on.
    pub fn list_of(&self, page: &Arc<Page>) -> Option<(NodeId, LruList)> {
        self.lists.lock().iter().find_map(|(key, members)| {
            members
                .iter()
                .any(|p| Arc::ptr_eq(p, page))
                .then_some(*key)
        })
    }

    /// Pages on one list.
    pub fn len(&self, node: NodeId, list: LruList) -> usize {
        self.lists.lock().get(&(node, list)).map_or(0, Vec::len)
    }

    /// Whether every list is empty.
    pub fn is_empty(&self) -> bool {
        self.lists.lock().values().all(Vec::is_empty)
    }

    /// Pages whose last reference went away on put-back.
    pub fn freed(&self) -> usize {
        self.freed.lock().len()
    }

    /// Put-backs performed.
    pub fn putbacks(&self) -> usize {
        self.putbacks.load(Ordering::Relaxed)
    }
}

impl PagePool for SimLru {
    fn putback(&self, page: &Arc<Page>) {
        self.putbacks.fetch_add(1, Ordering::Relaxed);
        if page.refs().put() == 0 {
            trace!(frame = %page.frame(), "page freed on put-back");
            self.freed.lock().push(Arc::clone(page));
            return;
        }
        self.add(page);
    }
}

/// Node and zone counters.
#[derive(Default)]
pub struct VmStat {
    nodes: Mutex<BTreeMap<(NodeId, NodeStat), i64>>,
    zones: Mutex<BTreeMap<(NodeId, ZoneId, NodeStat), i64>>,
}

impl VmStat {
    /// Node counter value.
    pub fn node(&self, node: NodeId, stat: NodeStat) -> i64 {
        self.nodes.lock().get(&(node, stat)).copied().unwrap_or(0)
    }

    /// Zone counter value.
    pub fn zone(&self, node: NodeId, zone: ZoneId, stat: NodeStat) -> i64 {
        self.zones
            .lock()
            .get(&(node, zone, stat))
            .copied()
            .unwrap_or(0)
    }
}

impl ZoneAccounting for VmStat {
    fn mod_node_state(&self, node: NodeId, stat: NodeStat, delta: i64) {
        *self.nodes.lock().entry((node, stat)).or_insert(0) += delta;
    }

    fn mod_zone_state(&self, node: NodeId, zone: ZoneId, stat: NodeStat, delta: i64) {
        *self.zones.lock().entry((node, zone, stat)).or_insert(0) += delta;
    }
}

/// Allocator that refuses a site once its call budget is spent.
#[derive(Default)]
pub struct BudgetAllocator {
    budgets: Mutex<HashMap<AllocSite, usize>>,
    refused: AtomicUsize,
}

impl BudgetAllocator {
    /// Lets `calls` more reservations at `site` succeed, then refuses.
    pub fn fail_after(&self, site: AllocSite, calls: usize) {
        self.budgets.lock().insert(site, calls);
    }

    /// Removes the budget for `site`.
    pub fn unlimited(&self, site: AllocSite) {
        self.budgets.lock().remove(&site);
    }

    /// Reservations refused so far.
    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::Relaxed)
    }
}

impl BookkeepingAllocator for BudgetAllocator {
    fn try_reserve(&self, site: AllocSite, _count: usize) -> bool {
        let mut budgets = self.budgets.lock();
        match budgets.get_mut(&site) {
            None => true,
            Some(0) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

/// Content fingerprint to page index.
#[derive(Default)]
pub struct FingerprintIndex {
    entries: Mutex<HashMap<u32, FrameId>>,
    exchanges: AtomicUsize,
}

impl FingerprintIndex {
    /// Records the current content of `page`.
    pub fn insert(&self, page: &Page) -> u32 {
        let fingerprint = page.fingerprint();
        self.entries.lock().insert(fingerprint, page.frame());
        fingerprint
    }

    /// Page recorded for `fingerprint`.
    pub fn lookup(&self, fingerprint: u32) -> Option<FrameId> {
        self.entries.lock().get(&fingerprint).copied()
    }

    /// Exchanges reported so far.
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::Relaxed)
    }
}

impl DedupIndex for FingerprintIndex {
    fn exchange(&self, a: &Page, b: &Page) {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        for frame in self.entries.lock().values_mut() {
            if *frame == a.frame() {
                *frame = b.frame();
            } else if *frame == b.frame() {
                *frame = a.frame();
            }
        }
    }
}

#[derive(Default)]
struct DmaShared {
    free: Mutex<Vec<usize>>,
    fault: Mutex<Option<DmaError>>,
    mapped: AtomicUsize,
    pending: Mutex<HashMap<u64, DmaDescriptor>>,
    next_cookie: AtomicU64,
    copies: AtomicU64,
    leased: AtomicUsize,
    peak_leased: AtomicUsize,
}

impl DmaShared {
    fn take_fault(&self, stage: DmaError) -> bool {
        let mut fault = self.fault.lock();
        if *fault == Some(stage) {
            *fault = None;
            true
        } else {
            false
        }
    }

    fn check(&self, stage: DmaError) -> Result<(), DmaError> {
        if self.take_fault(stage) {
            Err(stage)
        } else {
            Ok(())
        }
    }
}

/// Software copy device. Copies happen when a descriptor is waited on.
pub struct SoftDmaDevice {
    name: String,
    shared: Arc<DmaShared>,
}

impl SoftDmaDevice {
    /// Device with `channels` memcpy channels.
    pub fn new(name: impl Into<String>, channels: usize) -> Arc<Self> {
        let shared = DmaShared::default();
        *shared.free.lock() = (0..channels).rev().collect();
        Arc::new(Self {
            name: name.into(),
            shared: Arc::new(shared),
        })
    }

    /// Makes the next operation of the matching stage fail once.
    /// `NoChannel` fails the next channel request.
    pub fn inject_fault(&self, stage: DmaError) {
        *self.shared.fault.lock() = Some(stage);
    }

    /// Live device mappings.
    pub fn outstanding_mappings(&self) -> usize {
        self.shared.mapped.load(Ordering::Acquire)
    }

    /// Channels not handed out.
    pub fn free_channels(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Completed copies.
    pub fn copies(&self) -> u64 {
        self.shared.copies.load(Ordering::Relaxed)
    }

    /// Most channels handed out at the same time.
    pub fn peak_leased(&self) -> usize {
        self.shared.peak_leased.load(Ordering::Relaxed)
    }
}

impl DmaDevice for SoftDmaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_channel(&self) -> Result<Arc<dyn DmaChannel>, DmaError> {
        self.shared.check(DmaError::NoChannel)?;
        let id = self.shared.free.lock().pop().ok_or(DmaError::NoChannel)?;
        let leased = self.shared.leased.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.peak_leased.fetch_max(leased, Ordering::Relaxed);
        Ok(Arc::new(SoftChannel {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn release_channel(&self, channel: Arc<dyn DmaChannel>) {
        self.shared.leased.fetch_sub(1, Ordering::AcqRel);
        self.shared.free.lock().push(channel.id());
    }
}

struct SoftChannel {
    id: usize,
    shared: Arc<DmaShared>,
}

struct SoftRegion {
    page: Arc<Page>,
    offset: usize,
    len: usize,
    shared: Arc<DmaShared>,
}

impl DmaRegion for SoftRegion {
    fn page(&self) -> &Arc<Page> {
        &self.page
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SoftRegion {
    fn drop(&mut self) {
        self.shared.mapped.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DmaChannel for SoftChannel {
    fn id(&self) -> usize {
        self.id
    }

    fn map(
        &self,
        page: &Arc<Page>,
        offset: usize,
        len: usize,
        _dir: DmaDirection,
    ) -> Result<Box<dyn DmaRegion>, DmaError> {
        self.shared.check(DmaError::Map)?;
        if offset + len > page.byte_len() {
            return Err(DmaError::Map);
        }
        self.shared.mapped.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SoftRegion {
            page: Arc::clone(page),
            offset,
            len,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn prep_memcpy(
        &self,
        dst: &dyn DmaRegion,
        src: &dyn DmaRegion,
    ) -> Result<DmaDescriptor, DmaError> {
        self.shared.check(DmaError::Prep)?;
        if dst.len() != src.len() {
            return Err(DmaError::Prep);
        }
        Ok(DmaDescriptor {
            dst: Arc::clone(dst.page()),
            dst_offset: dst.offset(),
            src: Arc::clone(src.page()),
            src_offset: src.offset(),
            len: src.len(),
        })
    }

    fn submit(&self, desc: DmaDescriptor) -> Result<DmaCookie, DmaError> {
        self.shared.check(DmaError::Submit)?;
        let cookie = self.shared.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.lock().insert(cookie, desc);
        Ok(DmaCookie(cookie))
    }

    fn wait(&self, cookie: DmaCookie) -> Result<(), DmaError> {
        let desc = self
            .shared
            .pending
            .lock()
            .remove(&cookie.0)
            .ok_or(DmaError::Completion)?;
        self.shared.check(DmaError::Completion)?;
        let bytes = desc.src.data()[desc.src_offset..desc.src_offset + desc.len].to_vec();
        desc.dst.data_mut()[desc.dst_offset..desc.dst_offset + desc.len].copy_from_slice(&bytes);
        self.shared.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Builder for [`SimSystem`].
#[derive(Clone, Debug)]
pub struct SimBuilder {
    nodes: usize,
    cpus: usize,
    frame_size: usize,
    dma_channels: Option<usize>,
}

impl SimBuilder {
    /// Number of nodes.
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes.max(1);
        self
    }

    /// CPUs per node.
    pub fn cpus_per_node(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// Frame size in bytes.
    pub fn frame_size(mut self, bytes: usize) -> Self {
        self.frame_size = bytes;
        self
    }

    /// Attaches a software copy device with `channels` channels.
    pub fn dma_channels(mut self, channels: usize) -> Self {
        self.dma_channels = Some(channels);
        self
    }

    /// Builds the system.
    pub fn build(self) -> SimSystem {
        SimSystem {
            frame_size: self.frame_size,
            topology: Topology::uniform(self.nodes, self.cpus),
            rmap: Arc::new(SimRmap::default()),
            lru: Arc::new(SimLru::default()),
            vmstat: Arc::new(VmStat::default()),
            alloc: Arc::new(BudgetAllocator::default()),
            dedup: Arc::new(FingerprintIndex::default()),
            dma: self
                .dma_channels
                .map(|channels| SoftDmaDevice::new("soft-dma", channels)),
            next_frame: AtomicU64::new(0x1000),
            next_id: AtomicU64::new(1),
        }
    }
}

/// A simulated machine.
pub struct SimSystem {
    frame_size: usize,
    topology: Topology,
    rmap: Arc<SimRmap>,
    lru: Arc<SimLru>,
    vmstat: Arc<VmStat>,
    alloc: Arc<BudgetAllocator>,
    dedup: Arc<FingerprintIndex>,
    dma: Option<Arc<SoftDmaDevice>>,
    next_frame: AtomicU64,
    next_id: AtomicU64,
}

impl SimSystem {
    /// Starts building a system: one node, four CPUs, 4 KiB frames.
    pub fn builder() -> SimBuilder {
        SimBuilder {
            nodes: 1,
            cpus: 4,
            frame_size: DEFAULT_FRAME_SIZE,
            dma_channels: None,
        }
    }

    /// Collaborators for an [`crate::exchange::Exchanger`].
    pub fn env(&self) -> MemoryEnv {
        let rmap: Arc<dyn ReverseMap> = self.rmap.clone();
        let pool: Arc<dyn PagePool> = self.lru.clone();
        let accounting: Arc<dyn ZoneAccounting> = self.vmstat.clone();
        let mut env = MemoryEnv::new(rmap, pool, accounting)
            .with_allocator(self.alloc.clone())
            .with_dedup(self.dedup.clone())
            .with_topology(self.topology.clone());
        if let Some(dma) = &self.dma {
            env = env.with_dma(dma.clone());
        }
        env
    }

    /// Frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Page tables.
    pub fn rmap(&self) -> &Arc<SimRmap> {
        &self.rmap
    }

    /// LRU lists.
    pub fn lru(&self) -> &Arc<SimLru> {
        &self.lru
    }

    /// Counters.
    pub fn vmstat(&self) -> &Arc<VmStat> {
        &self.vmstat
    }

    /// Bookkeeping allocator.
    pub fn alloc(&self) -> &Arc<BudgetAllocator> {
        &self.alloc
    }

    /// Dedup index.
    pub fn dedup(&self) -> &Arc<FingerprintIndex> {
        &self.dedup
    }

    /// Copy device, if attached.
    pub fn dma(&self) -> Option<&Arc<SoftDmaDevice>> {
        self.dma.as_ref()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_frames(&self, nr: usize) -> FrameId {
        FrameId(self.next_frame.fetch_add(nr as u64, Ordering::Relaxed))
    }

    /// New process memory domain.
    pub fn new_mm(&self) -> Arc<Mm> {
        Mm::new(MmId(self.next_id()))
    }

    /// New anonymous anchor.
    pub fn new_anon_vma(&self) -> Arc<AnonVma> {
        AnonVma::new(AnonVmaId(self.next_id()))
    }

    /// New file address space.
    pub fn new_address_space(&self, shmem: bool) -> Arc<AddressSpace> {
        AddressSpace::with_options(MappingId(self.next_id()), shmem, true)
    }

    /// Allocates a base anonymous page mapped at `vaddr` and puts it on LRU.
    pub fn alloc_anon_page(&self, mm: &Mm, vma: &Arc<AnonVma>, vaddr: u64, node: NodeId) -> Arc<Page> {
        self.alloc_anon(mm, vma, vaddr, node, PageKind::Base, 1)
    }

    /// Allocates a multi-frame anonymous page mapped at `vaddr`.
    pub fn alloc_huge_anon_page(
        &self,
        mm: &Mm,
        vma: &Arc<AnonVma>,
        vaddr: u64,
        node: NodeId,
        nr_frames: usize,
    ) -> Arc<Page> {
        self.alloc_anon(mm, vma, vaddr, node, PageKind::TransHuge, nr_frames)
    }

    fn alloc_anon(
        &self,
        mm: &Mm,
        vma: &Arc<AnonVma>,
        vaddr: u64,
        node: NodeId,
        kind: PageKind,
        nr: usize,
    ) -> Arc<Page> {
        let meta = PageMeta {
            flags: PageFlags::SWAP_BACKED | PageFlags::UPTODATE,
            owner: PageOwner::Anon(Arc::clone(vma)),
            index: vaddr / self.frame_size as u64,
            ..PageMeta::default()
        };
        let page = Page::builder(self.next_frames(nr))
            .node(node)
            .frame_size(self.frame_size)
            .huge(kind, nr)
            .refs(1)
            .meta(meta)
            .build();
        self.rmap.install(mm.id(), vaddr, &page);
        self.lru.add(&page);
        page
    }

    /// Allocates a page-cache page at `index` of `mapping`.
    pub fn alloc_file_page(&self, mapping: &Arc<AddressSpace>, index: u64, node: NodeId) -> Arc<Page> {
        let mut flags = PageFlags::UPTODATE;
        if mapping.is_shmem() {
            flags |= PageFlags::SWAP_BACKED;
        }
        let meta = PageMeta {
            flags,
            owner: PageOwner::File(Arc::clone(mapping)),
            index,
            ..PageMeta::default()
        };
        let page = Page::builder(self.next_frames(1))
            .node(node)
            .frame_size(self.frame_size)
            .refs(0)
            .meta(meta)
            .build();
        mapping.insert(index, &page);
        self.vmstat.mod_node_state(node, NodeStat::FilePages, 1);
        if mapping.is_shmem() {
            self.vmstat.mod_node_state(node, NodeStat::Shmem, 1);
        }
        self.lru.add(&page);
        page
    }

    /// Places a free page in `mapping` at `index`, as a cache fill would.
    /// The cache takes its references; the caller keeps its own.
    pub fn adopt_into_cache(&self, page: &Arc<Page>, mapping: &Arc<AddressSpace>, index: u64) -> bool {
        if !mapping.insert(index, page) {
            return false;
        }
        {
            let mut meta = page.meta();
            meta.owner = PageOwner::File(Arc::clone(mapping));
            meta.index = index;
            meta.flags.insert(PageFlags::UPTODATE);
            if mapping.is_shmem() {
                meta.flags.insert(PageFlags::SWAP_BACKED);
            }
        }
        let nr = page.nr_frames() as i64;
        self.vmstat.mod_node_state(page.node(), NodeStat::FilePages, nr);
        if mapping.is_shmem() {
            self.vmstat.mod_node_state(page.node(), NodeStat::Shmem, nr);
        }
        trace!(frame = %page.frame(), mapping = mapping.id().0, index, "page adopted by cache");
        true
    }

    /// Takes `page` off its LRU list.
    pub fn isolate(&self, page: &Arc<Page>) -> bool {
        self.lru.isolate(page)
    }

    /// Removes the translation at `vaddr`.
    pub fn zap(&self, mm: &Mm, vaddr: u64) -> bool {
        self.rmap.zap(mm.id(), vaddr)
    }

    /// Fills `page` with a pattern derived from `seed`.
    pub fn fill(&self, page: &Page, seed: u64) {
        let mut data = page.data_mut();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (seed.wrapping_mul(131).wrapping_add(i as u64) % 251) as u8;
        }
    }
}
