//! Content movement between pages.
//!
//! Every engine implements [`BulkCopy`]. [`CopyEngines`] strings the
//! configured engines together so that a failing engine hands the work to
//! the next one, ending with [`SerialCopy`], which cannot fail.

mod chunk;
mod dma;
mod serial;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::env::{DmaError, MemoryEnv};
use crate::exchange::metrics::ExchangeMetrics;
use crate::exchange::options::{CopyBackend, ExchangeOptions};
use crate::primitives::page::Page;

pub use chunk::ChunkCopyEngine;
pub use dma::{DmaCopyOffload, DmaMode};
pub use serial::SerialCopy;

/// Bytes moved per step of a word-wise exchange.
pub const WORD: usize = std::mem::size_of::<u64>();

/// Errors raised by a copy engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// The engine cannot serve this call; use another one.
    #[error("copy engine unavailable")]
    Unavailable,
    /// Building the work list failed.
    #[error("out of memory building copy work")]
    OutOfMemory,
    /// The transfer cannot be split evenly across channels.
    #[error("transfer length does not divide across channels")]
    Misaligned,
    /// The copy hardware failed.
    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// One pair of equally sized pages whose contents are swapped.
#[derive(Clone)]
pub struct ExchangeJob {
    /// Destination side; its node selects the workers.
    pub to: Arc<Page>,
    /// Other side.
    pub from: Arc<Page>,
}

impl ExchangeJob {
    /// Creates a job.
    pub fn new(to: Arc<Page>, from: Arc<Page>) -> Self {
        Self { to, from }
    }
}

/// Copy engine interface.
pub trait BulkCopy: Send + Sync {
    /// Engine name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Swaps the contents of two equally sized pages.
    fn exchange(&self, to: &Arc<Page>, from: &Arc<Page>) -> Result<(), CopyError>;

    /// Swaps the contents of every job. Either all jobs are exchanged or
    /// none is.
    fn exchange_batch(&self, jobs: &[ExchangeJob]) -> Result<(), CopyError>;

    /// Copies `src` into `dst`.
    fn copy(&self, dst: &Arc<Page>, src: &Arc<Page>) -> Result<(), CopyError>;
}

/// Swaps two buffers one word at a time.
pub(crate) fn swap_words(a: &mut [u8], b: &mut [u8]) {
    debug_assert_eq!(a.len(), b.len());
    let mut wa = a.chunks_exact_mut(WORD);
    let mut wb = b.chunks_exact_mut(WORD);
    for (x, y) in (&mut wa).zip(&mut wb) {
        x.swap_with_slice(y);
    }
    let (ra, rb) = (wa.into_remainder(), wb.into_remainder());
    let n = ra.len().min(rb.len());
    ra[..n].swap_with_slice(&mut rb[..n]);
}

/// Chunk length for splitting `len` bytes across `parts`, word aligned.
pub(crate) fn chunk_len(len: usize, parts: usize) -> usize {
    let per = len.div_ceil(parts.max(1));
    per.div_ceil(WORD).max(1) * WORD
}

/// The configured engines in fallback order.
pub struct CopyEngines {
    dma: Option<Arc<dyn BulkCopy>>,
    pool: Option<Arc<dyn BulkCopy>>,
    serial: SerialCopy,
    metrics: Option<Arc<dyn ExchangeMetrics>>,
}

impl CopyEngines {
    /// Builds the engines selected by `options`.
    pub fn from_options(options: &ExchangeOptions, env: &MemoryEnv) -> Self {
        let pool = || -> Arc<dyn BulkCopy> {
            Arc::new(ChunkCopyEngine::new(
                options.effective_workers(),
                env.topology.clone(),
                Arc::clone(&env.alloc),
            ))
        };
        let (dma, pool) = match options.copy_backend {
            CopyBackend::Serial => (None, None),
            CopyBackend::WorkerPool => (None, Some(pool())),
            CopyBackend::HardwareChannel => {
                let dma = match &env.dma {
                    Some(device) => {
                        let mode = if options.reserve_channels {
                            DmaMode::Reserved
                        } else {
                            DmaMode::OnDemand
                        };
                        match DmaCopyOffload::new(
                            Arc::clone(device),
                            mode,
                            options.channel_count,
                            Arc::clone(&env.alloc),
                        ) {
                            Ok(engine) => Some(Arc::new(engine) as Arc<dyn BulkCopy>),
                            Err(err) => {
                                warn!(device = device.name(), error = %err, "copy channels unavailable, using worker pool");
                                None
                            }
                        }
                    }
                    None => {
                        warn!("no copy device present, using worker pool");
                        None
                    }
                };
                (dma, Some(pool()))
            }
        };
        Self {
            dma,
            pool,
            serial: SerialCopy,
            metrics: options.metrics.clone(),
        }
    }

    /// Engines with only the serial copy.
    pub fn serial_only() -> Self {
        Self {
            dma: None,
            pool: None,
            serial: SerialCopy,
            metrics: None,
        }
    }

    /// Name of the first engine in line for a call.
    pub fn primary_name(&self, allow_dma: bool) -> &'static str {
        self.candidates(allow_dma)
            .next()
            .map(|engine| engine.name())
            .unwrap_or_else(|| self.serial.name())
    }

    fn candidates(&self, allow_dma: bool) -> impl Iterator<Item = &Arc<dyn BulkCopy>> {
        self.dma
            .iter()
            .filter(move |_| allow_dma)
            .chain(self.pool.iter())
    }

    /// Swaps one pair. Hardware channels are skipped for multi-frame pages.
    pub fn exchange_pair(&self, to: &Arc<Page>, from: &Arc<Page>) {
        let allow_dma = !to.is_huge() && !from.is_huge();
        let bytes = to.byte_len() as u64;
        for engine in self.candidates(allow_dma) {
            match engine.exchange(to, from) {
                Ok(()) => {
                    self.record(engine.name(), bytes);
                    return;
                }
                Err(err) => self.fallback(engine.name(), err),
            }
        }
        self.serial.exchange_now(to, from);
        self.record(self.serial.name(), bytes);
    }

    /// Swaps every job in one call.
    pub fn exchange_jobs(&self, jobs: &[ExchangeJob]) {
        if jobs.is_empty() {
            return;
        }
        let bytes = jobs.iter().map(|job| job.to.byte_len() as u64).sum();
        for engine in self.candidates(true) {
            match engine.exchange_batch(jobs) {
                Ok(()) => {
                    self.record(engine.name(), bytes);
                    return;
                }
                Err(err) => self.fallback(engine.name(), err),
            }
        }
        for job in jobs {
            self.serial.exchange_now(&job.to, &job.from);
        }
        self.record(self.serial.name(), bytes);
    }

    fn record(&self, engine: &'static str, bytes: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.copy_call(engine);
            metrics.bytes_exchanged(bytes);
        }
    }

    fn fallback(&self, engine: &'static str, err: CopyError) {
        match err {
            CopyError::Unavailable => debug!(engine, "copy engine unavailable, falling back"),
            _ => warn!(engine, error = %err, "copy engine failed, falling back"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.copy_fallback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_words_handles_tail_bytes() {
        let mut a: Vec<u8> = (0..21).collect();
        let mut b: Vec<u8> = (100..121).collect();
        swap_words(&mut a, &mut b);
        assert_eq!(a, (100..121).collect::<Vec<u8>>());
        assert_eq!(b, (0..21).collect::<Vec<u8>>());
    }

    #[test]
    fn chunk_len_is_word_aligned_and_covers_input() {
        assert_eq!(chunk_len(4096, 4), 1024);
        assert_eq!(chunk_len(4096, 6), 688);
        assert!(chunk_len(4096, 6) * 6 >= 4096);
        assert_eq!(chunk_len(10, 8), 8);
        assert_eq!(chunk_len(0, 4), 8);
    }
}
