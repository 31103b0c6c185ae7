use std::sync::Arc;

use super::{swap_words, BulkCopy, CopyError, ExchangeJob};
use crate::primitives::page::Page;

/// Word-at-a-time copy on the calling thread. Never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialCopy;

impl SerialCopy {
    /// Swaps the contents of two pages frame by frame.
    pub fn exchange_now(&self, to: &Page, from: &Page) {
        if std::ptr::eq(to, from) {
            return;
        }
        let mut a = to.data_mut();
        let mut b = from.data_mut();
        let frame = (a.len() / to.nr_frames().max(1)).max(1);
        for (fa, fb) in a.chunks_mut(frame).zip(b.chunks_mut(frame)) {
            swap_words(fa, fb);
        }
    }

    /// Copies `src` into `dst`.
    pub fn copy_now(&self, dst: &Page, src: &Page) {
        if std::ptr::eq(dst, src) {
            return;
        }
        let s = src.data();
        let mut d = dst.data_mut();
        let n = s.len().min(d.len());
        d[..n].copy_from_slice(&s[..n]);
    }
}

impl BulkCopy for SerialCopy {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn exchange(&self, to: &Arc<Page>, from: &Arc<Page>) -> Result<(), CopyError> {
        self.exchange_now(to, from);
        Ok(())
    }

    fn exchange_batch(&self, jobs: &[ExchangeJob]) -> Result<(), CopyError> {
        for job in jobs {
            self.exchange_now(&job.to, &job.from);
        }
        Ok(())
    }

    fn copy(&self, dst: &Arc<Page>, src: &Arc<Page>) -> Result<(), CopyError> {
        self.copy_now(dst, src);
        Ok(())
    }
}
