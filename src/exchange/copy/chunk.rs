use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLockWriteGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace};

use super::{chunk_len, swap_words, BulkCopy, CopyError, ExchangeJob};
use crate::env::{BookkeepingAllocator, Topology};
use crate::exchange::options::{even_workers, MAX_WORKERS};
use crate::primitives::page::Page;
use crate::types::{AllocSite, NodeId};

type DataGuard<'a> = RwLockWriteGuard<'a, Box<[u8]>>;
type LockedPair<'a> = (usize, DataGuard<'a>, DataGuard<'a>);
type FrameSlices<'a> = (usize, &'a mut [u8], &'a mut [u8]);

/// Parallel copy engine backed by one worker pool per node.
///
/// A single-pair call splits the page into as many contiguous chunks as there
/// are workers. A batch call groups pairs by destination node, splits every
/// pair into frame-sized units and spreads each group over its node's pool.
pub struct ChunkCopyEngine {
    limit: usize,
    topology: Topology,
    alloc: Arc<dyn BookkeepingAllocator>,
    pools: Mutex<HashMap<(NodeId, usize), Arc<ThreadPool>>>,
}

impl ChunkCopyEngine {
    /// Creates an engine using at most `limit` workers per call.
    pub fn new(limit: usize, topology: Topology, alloc: Arc<dyn BookkeepingAllocator>) -> Self {
        Self {
            limit: limit.min(MAX_WORKERS),
            topology,
            alloc,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Workers used for copies landing on `node`.
    pub fn workers_for(&self, node: NodeId) -> usize {
        even_workers(self.limit.min(self.topology.cpus_on(node)))
    }

    fn pool(&self, node: NodeId, workers: usize) -> Result<Arc<ThreadPool>, CopyError> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&(node, workers)) {
            return Ok(Arc::clone(pool));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("pagex-copy-{}-{}", node.0, i))
            .build()
            .map_err(|err| {
                debug!(%node, workers, error = %err, "failed to start copy workers");
                CopyError::Unavailable
            })?;
        let pool = Arc::new(pool);
        pools.insert((node, workers), Arc::clone(&pool));
        Ok(pool)
    }

    fn prepare(&self, node: NodeId, units: usize) -> Result<(Arc<ThreadPool>, usize), CopyError> {
        let workers = self.workers_for(node);
        if workers == 0 {
            return Err(CopyError::Unavailable);
        }
        if !self.alloc.try_reserve(AllocSite::CopyJobs, units.max(workers)) {
            return Err(CopyError::OutOfMemory);
        }
        Ok((self.pool(node, workers)?, workers))
    }
}

impl BulkCopy for ChunkCopyEngine {
    fn name(&self) -> &'static str {
        "worker-pool"
    }

    fn exchange(&self, to: &Arc<Page>, from: &Arc<Page>) -> Result<(), CopyError> {
        if Arc::ptr_eq(to, from) {
            return Ok(());
        }
        let (pool, workers) = self.prepare(to.node(), 1)?;
        let mut a = to.data_mut();
        let mut b = from.data_mut();
        if a.len() != b.len() {
            return Err(CopyError::Misaligned);
        }
        let chunk = chunk_len(a.len(), workers);
        trace!(frame = %to.frame(), workers, chunk, "parallel exchange");
        let (sa, sb): (&mut [u8], &mut [u8]) = (&mut a[..], &mut b[..]);
        pool.scope(move |s| {
            for (ca, cb) in sa.chunks_mut(chunk).zip(sb.chunks_mut(chunk)) {
                s.spawn(move |_| swap_words(ca, cb));
            }
        });
        Ok(())
    }

    fn exchange_batch(&self, jobs: &[ExchangeJob]) -> Result<(), CopyError> {
        let mut by_node: BTreeMap<NodeId, Vec<&ExchangeJob>> = BTreeMap::new();
        for job in jobs.iter().filter(|job| !Arc::ptr_eq(&job.to, &job.from)) {
            by_node.entry(job.to.node()).or_default().push(job);
        }
        let mut pools = Vec::with_capacity(by_node.len());
        for (node, group) in &by_node {
            let units: usize = group.iter().map(|job| job.to.nr_frames()).sum();
            let (pool, workers) = self.prepare(*node, units)?;
            trace!(%node, pairs = group.len(), units, workers, "parallel batch exchange");
            pools.push(pool);
        }

        let mut locked: Vec<(Arc<ThreadPool>, Vec<LockedPair<'_>>)> = Vec::with_capacity(pools.len());
        for (pool, group) in pools.into_iter().zip(by_node.values()) {
            let mut pairs = Vec::with_capacity(group.len());
            for job in group {
                let a = job.to.data_mut();
                let b = job.from.data_mut();
                if a.len() != b.len() {
                    return Err(CopyError::Misaligned);
                }
                let frame = (a.len() / job.to.nr_frames().max(1)).max(1);
                pairs.push((frame, a, b));
            }
            locked.push((pool, pairs));
        }

        let mut groups: Vec<(Arc<ThreadPool>, Vec<FrameSlices<'_>>)> = locked
            .iter_mut()
            .map(|(pool, pairs)| {
                let slices = pairs
                    .iter_mut()
                    .map(|(frame, a, b)| (*frame, &mut a[..], &mut b[..]))
                    .collect();
                (Arc::clone(pool), slices)
            })
            .collect();
        if groups.len() == 1 {
            if let Some((pool, slices)) = groups.pop() {
                swap_frames(&pool, slices);
            }
            return Ok(());
        }
        thread::scope(|s| {
            for (pool, slices) in groups {
                s.spawn(move || swap_frames(&pool, slices));
            }
        });
        Ok(())
    }

    fn copy(&self, dst: &Arc<Page>, src: &Arc<Page>) -> Result<(), CopyError> {
        if Arc::ptr_eq(dst, src) {
            return Ok(());
        }
        let (pool, workers) = self.prepare(dst.node(), 1)?;
        let s_buf = src.data();
        let mut d_buf = dst.data_mut();
        if s_buf.len() != d_buf.len() {
            return Err(CopyError::Misaligned);
        }
        let chunk = chunk_len(d_buf.len(), workers);
        let (sd, ss): (&mut [u8], &[u8]) = (&mut d_buf[..], &s_buf[..]);
        pool.scope(move |s| {
            for (cd, cs) in sd.chunks_mut(chunk).zip(ss.chunks(chunk)) {
                s.spawn(move |_| cd.copy_from_slice(cs));
            }
        });
        Ok(())
    }
}

/// Swaps every pair frame by frame on `pool`.
fn swap_frames(pool: &ThreadPool, slices: Vec<FrameSlices<'_>>) {
    pool.scope(move |s| {
        for (frame, sa, sb) in slices {
            for (ca, cb) in sa.chunks_mut(frame).zip(sb.chunks_mut(frame)) {
                s.spawn(move |_| swap_words(ca, cb));
            }
        }
    });
}
