//! Capabilities the host environment lends to the exchange core.
//!
//! Page tables, LRU lists, zone statistics, bookkeeping allocation, the dedup
//! index and copy hardware are all owned by the host. The core reaches them
//! only through the traits below, bundled in a [`MemoryEnv`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::primitives::page::Page;
use crate::types::{AllocSite, NodeId, ZoneId};

/// Reverse mapping: every translation pointing at a page.
pub trait ReverseMap: Send + Sync {
    /// Number of live translations of `page`.
    fn mapcount(&self, page: &Page) -> usize;

    /// Replaces every live translation of `page` with a migration
    /// placeholder, dropping the reference each translation held.
    ///
    /// Returns false if some translation could not be suspended; the
    /// translations already suspended stay suspended.
    fn try_to_unmap(&self, page: &Arc<Page>) -> bool;

    /// Turns placeholders left for `old` into live translations of `new`,
    /// taking one reference on `new` per translation.
    fn remove_migration_entries(&self, old: &Arc<Page>, new: &Arc<Page>);
}

/// LRU lists pages are isolated from and returned to.
pub trait PagePool: Send + Sync {
    /// Returns an isolated page to its list, dropping the isolation reference.
    fn putback(&self, page: &Arc<Page>);
}

/// Page-category counters kept per node and per zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeStat {
    /// Pages in a page cache.
    FilePages,
    /// Shared-memory pages.
    Shmem,
    /// Dirty page-cache pages.
    FileDirty,
    /// Pages awaiting write-back.
    WritePending,
}

impl NodeStat {
    /// Short name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStat::FilePages => "nr_file_pages",
            NodeStat::Shmem => "nr_shmem",
            NodeStat::FileDirty => "nr_file_dirty",
            NodeStat::WritePending => "nr_zone_write_pending",
        }
    }
}

/// Per-node and per-zone page accounting ledger.
pub trait ZoneAccounting: Send + Sync {
    /// Adjusts a node counter.
    fn mod_node_state(&self, node: NodeId, stat: NodeStat, delta: i64);

    /// Adjusts a zone counter.
    fn mod_zone_state(&self, node: NodeId, zone: ZoneId, stat: NodeStat, delta: i64);
}

/// Fallible allocator for the core's internal bookkeeping.
pub trait BookkeepingAllocator: Send + Sync {
    /// Reserves room for `count` entries at `site`. False means out of memory.
    fn try_reserve(&self, site: AllocSite, count: usize) -> bool;
}

/// Allocator that never fails.
#[derive(Default, Debug, Clone, Copy)]
pub struct UnboundedAllocator;

impl BookkeepingAllocator for UnboundedAllocator {
    fn try_reserve(&self, _site: AllocSite, _count: usize) -> bool {
        true
    }
}

/// Index from content fingerprint to the page holding that content.
pub trait DedupIndex: Send + Sync {
    /// Re-points entries after the contents of `a` and `b` were exchanged.
    fn exchange(&self, a: &Page, b: &Page);
}

/// Errors raised by copy hardware.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No channel could be acquired.
    #[error("no copy channel available")]
    NoChannel,
    /// Memory could not be mapped for device access.
    #[error("failed to map memory for device access")]
    Map,
    /// A copy descriptor could not be prepared.
    #[error("failed to prepare copy descriptor")]
    Prep,
    /// The descriptor was rejected on submission.
    #[error("failed to submit copy descriptor")]
    Submit,
    /// The device reported a failed transfer.
    #[error("copy did not complete")]
    Completion,
}

/// Transfer direction of a device mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads the memory.
    ToDevice,
    /// Device writes the memory.
    FromDevice,
}

/// Memory range mapped for device access; unmapped on drop.
pub trait DmaRegion: Send + Sync {
    /// Page the range belongs to.
    fn page(&self) -> &Arc<Page>;
    /// Start of the range inside the page.
    fn offset(&self) -> usize;
    /// Length of the range.
    fn len(&self) -> usize;
    /// Whether the range is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prepared copy between two mapped ranges.
#[derive(Clone)]
pub struct DmaDescriptor {
    /// Destination page.
    pub dst: Arc<Page>,
    /// Offset into the destination.
    pub dst_offset: usize,
    /// Source page.
    pub src: Arc<Page>,
    /// Offset into the source.
    pub src_offset: usize,
    /// Bytes to copy.
    pub len: usize,
}

impl fmt::Debug for DmaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaDescriptor")
            .field("dst", &self.dst.frame())
            .field("dst_offset", &self.dst_offset)
            .field("src", &self.src.frame())
            .field("src_offset", &self.src_offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Ticket for a submitted descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DmaCookie(pub u64);

/// One hardware copy channel.
pub trait DmaChannel: Send + Sync {
    /// Channel number on its device.
    fn id(&self) -> usize;

    /// Maps `len` bytes of `page` starting at `offset`.
    fn map(
        &self,
        page: &Arc<Page>,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Box<dyn DmaRegion>, DmaError>;

    /// Prepares a copy from `src` to `dst`.
    fn prep_memcpy(&self, dst: &dyn DmaRegion, src: &dyn DmaRegion)
        -> Result<DmaDescriptor, DmaError>;

    /// Queues a prepared descriptor.
    fn submit(&self, desc: DmaDescriptor) -> Result<DmaCookie, DmaError>;

    /// Waits for a submitted descriptor to finish.
    fn wait(&self, cookie: DmaCookie) -> Result<(), DmaError>;
}

/// Copy-offload device exposing memcpy channels.
pub trait DmaDevice: Send + Sync {
    /// Device name for logs.
    fn name(&self) -> &str;

    /// Acquires a free channel.
    fn request_channel(&self) -> Result<Arc<dyn DmaChannel>, DmaError>;

    /// Returns a channel to the device.
    fn release_channel(&self, channel: Arc<dyn DmaChannel>);
}

/// CPUs available for copy work on each node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    cpus_per_node: Vec<usize>,
}

impl Topology {
    /// Topology with an explicit CPU count per node.
    pub fn new(cpus_per_node: Vec<usize>) -> Self {
        Self { cpus_per_node }
    }

    /// `nodes` nodes with `cpus` CPUs each.
    pub fn uniform(nodes: usize, cpus: usize) -> Self {
        Self::new(vec![cpus; nodes])
    }

    /// Single node sized to the host's available parallelism.
    pub fn host() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::uniform(1, cpus)
    }

    /// Number of nodes.
    pub fn nodes(&self) -> usize {
        self.cpus_per_node.len()
    }

    /// CPUs on `node`; zero for unknown nodes.
    pub fn cpus_on(&self, node: NodeId) -> usize {
        self.cpus_per_node
            .get(node.0 as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::host()
    }
}

/// Everything the exchange core borrows from its host.
#[derive(Clone)]
pub struct MemoryEnv {
    /// Reverse mapping.
    pub rmap: Arc<dyn ReverseMap>,
    /// LRU lists.
    pub pool: Arc<dyn PagePool>,
    /// Zone statistics.
    pub accounting: Arc<dyn ZoneAccounting>,
    /// Bookkeeping allocator.
    pub alloc: Arc<dyn BookkeepingAllocator>,
    /// Optional dedup index.
    pub dedup: Option<Arc<dyn DedupIndex>>,
    /// Copy hardware, if any.
    pub dma: Option<Arc<dyn DmaDevice>>,
    /// CPU layout.
    pub topology: Topology,
}

impl MemoryEnv {
    /// Bundles the mandatory collaborators with an unbounded allocator and
    /// the host topology.
    pub fn new(
        rmap: Arc<dyn ReverseMap>,
        pool: Arc<dyn PagePool>,
        accounting: Arc<dyn ZoneAccounting>,
    ) -> Self {
        Self {
            rmap,
            pool,
            accounting,
            alloc: Arc::new(UnboundedAllocator),
            dedup: None,
            dma: None,
            topology: Topology::host(),
        }
    }

    /// Replaces the bookkeeping allocator.
    pub fn with_allocator(mut self, alloc: Arc<dyn BookkeepingAllocator>) -> Self {
        self.alloc = alloc;
        self
    }

    /// Installs a dedup index.
    pub fn with_dedup(mut self, dedup: Arc<dyn DedupIndex>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Installs copy hardware.
    pub fn with_dma(mut self, dma: Arc<dyn DmaDevice>) -> Self {
        self.dma = Some(dma);
        self
    }

    /// Replaces the CPU layout.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_reports_unknown_nodes_as_empty() {
        let topo = Topology::new(vec![4, 2]);
        assert_eq!(topo.nodes(), 2);
        assert_eq!(topo.cpus_on(NodeId(0)), 4);
        assert_eq!(topo.cpus_on(NodeId(1)), 2);
        assert_eq!(topo.cpus_on(NodeId(5)), 0);
        assert!(Topology::host().cpus_on(NodeId(0)) >= 1);
    }

    #[test]
    fn unbounded_allocator_always_reserves() {
        let alloc = UnboundedAllocator;
        assert!(alloc.try_reserve(AllocSite::CopyJobs, usize::MAX));
    }
}
