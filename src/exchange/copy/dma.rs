use std::sync::Arc;
use std::thread;

use tracing::{debug, info};

use super::{BulkCopy, CopyError, ExchangeJob, SerialCopy};
use crate::env::{BookkeepingAllocator, DmaChannel, DmaDevice, DmaDirection, DmaError};
use crate::primitives::page::Page;
use crate::types::{AllocSite, FrameId};

/// How channels are obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaMode {
    /// Acquire one channel per call and release it afterwards.
    OnDemand,
    /// Hold a channel pool for the engine's lifetime and split every single
    /// transfer across it. Batches place whole pages on the channels.
    Reserved,
}

/// Copy engine that moves content through hardware copy channels.
///
/// Channels only copy one way, so an exchange goes through a bounce page:
/// `bounce <- to`, `to <- from`, `from <- bounce`. A failed step restores
/// both pages before the error is returned. A batch runs each step for all
/// pairs at once, spread over every channel it holds or can lease.
pub struct DmaCopyOffload {
    device: Arc<dyn DmaDevice>,
    mode: DmaMode,
    reserved: Vec<Arc<dyn DmaChannel>>,
    active: usize,
    alloc: Arc<dyn BookkeepingAllocator>,
}

impl DmaCopyOffload {
    /// Creates the engine. In [`DmaMode::Reserved`] up to `channels`
    /// channels are acquired now; the largest power of two of them is used.
    pub fn new(
        device: Arc<dyn DmaDevice>,
        mode: DmaMode,
        channels: usize,
        alloc: Arc<dyn BookkeepingAllocator>,
    ) -> Result<Self, CopyError> {
        let mut engine = Self {
            device,
            mode,
            reserved: Vec::new(),
            active: 1,
            alloc,
        };
        if mode == DmaMode::Reserved {
            for _ in 0..channels.max(1) {
                match engine.device.request_channel() {
                    Ok(channel) => engine.reserved.push(channel),
                    Err(err) if engine.reserved.is_empty() => return Err(err.into()),
                    Err(_) => break,
                }
            }
            engine.active = prev_power_of_two(engine.reserved.len());
            info!(
                device = engine.device.name(),
                reserved = engine.reserved.len(),
                active = engine.active,
                "reserved copy channels"
            );
        }
        Ok(engine)
    }

    /// Channel acquisition mode.
    pub fn mode(&self) -> DmaMode {
        self.mode
    }

    /// Channels each transfer is split across.
    pub fn active_channels(&self) -> usize {
        self.active
    }

    /// Leases up to `wanted` channels; fails only if none is free.
    fn lease_channels(&self, wanted: usize) -> Result<Vec<ChannelLease<'_>>, CopyError> {
        let mut leases = Vec::with_capacity(wanted);
        while leases.len() < wanted {
            match ChannelLease::acquire(self.device.as_ref()) {
                Ok(lease) => leases.push(lease),
                Err(err) if leases.is_empty() => return Err(err.into()),
                Err(_) => break,
            }
        }
        Ok(leases)
    }

    fn check_len(&self, len: usize) -> Result<(), CopyError> {
        if self.mode == DmaMode::Reserved && len % self.active != 0 {
            return Err(CopyError::Misaligned);
        }
        Ok(())
    }

    fn transfer(&self, dst: &Arc<Page>, src: &Arc<Page>) -> Result<(), CopyError> {
        let len = dst.byte_len();
        match self.mode {
            DmaMode::OnDemand => {
                let lease = ChannelLease::acquire(self.device.as_ref())?;
                copy_on(lease.channel(), dst, src, 0, len)
            }
            DmaMode::Reserved => {
                self.check_len(len)?;
                let share = len / self.active;
                let channels = &self.reserved[..self.active];
                let results: Vec<Result<(), CopyError>> = thread::scope(|s| {
                    let handles: Vec<_> = channels
                        .iter()
                        .enumerate()
                        .map(|(i, channel)| {
                            s.spawn(move || copy_on(channel.as_ref(), dst, src, i * share, share))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().unwrap_or(Err(CopyError::Dma(DmaError::Completion))))
                        .collect()
                });
                results.into_iter().collect()
            }
        }
    }
}

impl Drop for DmaCopyOffload {
    fn drop(&mut self) {
        for channel in self.reserved.drain(..) {
            self.device.release_channel(channel);
        }
    }
}

impl BulkCopy for DmaCopyOffload {
    fn name(&self) -> &'static str {
        "hardware-channel"
    }

    fn exchange(&self, to: &Arc<Page>, from: &Arc<Page>) -> Result<(), CopyError> {
        if Arc::ptr_eq(to, from) {
            return Ok(());
        }
        let len = to.byte_len();
        if from.byte_len() != len {
            return Err(CopyError::Misaligned);
        }
        self.check_len(len)?;
        if !self.alloc.try_reserve(AllocSite::BounceBuffer, 1) {
            return Err(CopyError::OutOfMemory);
        }
        let bounce = bounce_for(to);
        self.transfer(&bounce, to)?;
        if let Err(err) = self.transfer(to, from) {
            SerialCopy.copy_now(to, &bounce);
            return Err(err);
        }
        if let Err(err) = self.transfer(from, &bounce) {
            SerialCopy.copy_now(from, to);
            SerialCopy.copy_now(to, &bounce);
            return Err(err);
        }
        debug!(to = %to.frame(), from = %from.frame(), len, "exchanged through copy channels");
        Ok(())
    }

    fn exchange_batch(&self, jobs: &[ExchangeJob]) -> Result<(), CopyError> {
        let jobs: Vec<&ExchangeJob> = jobs
            .iter()
            .filter(|job| !Arc::ptr_eq(&job.to, &job.from))
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }
        if jobs.iter().any(|job| job.to.byte_len() != job.from.byte_len()) {
            return Err(CopyError::Misaligned);
        }
        if !self.alloc.try_reserve(AllocSite::BounceBuffer, jobs.len()) {
            return Err(CopyError::OutOfMemory);
        }
        let leases;
        let channels: Vec<&dyn DmaChannel> = match self.mode {
            DmaMode::OnDemand => {
                leases = self.lease_channels(jobs.len())?;
                leases.iter().map(|lease| lease.channel()).collect()
            }
            DmaMode::Reserved => self.reserved[..self.active]
                .iter()
                .map(|channel| channel.as_ref())
                .collect(),
        };
        let bounces: Vec<Arc<Page>> = jobs.iter().map(|job| bounce_for(&job.to)).collect();

        let save: Vec<_> = jobs.iter().zip(&bounces).map(|(job, b)| (b, &job.to)).collect();
        run_phase(&channels, &save)?;
        let forward: Vec<_> = jobs.iter().map(|job| (&job.to, &job.from)).collect();
        if let Err(err) = run_phase(&channels, &forward) {
            for (job, bounce) in jobs.iter().zip(&bounces) {
                SerialCopy.copy_now(&job.to, bounce);
            }
            return Err(err);
        }
        let back: Vec<_> = jobs.iter().zip(&bounces).map(|(job, b)| (&job.from, b)).collect();
        if let Err(err) = run_phase(&channels, &back) {
            for (job, bounce) in jobs.iter().zip(&bounces) {
                SerialCopy.copy_now(&job.from, &job.to);
                SerialCopy.copy_now(&job.to, bounce);
            }
            return Err(err);
        }
        debug!(pairs = jobs.len(), channels = channels.len(), "batch exchanged through copy channels");
        Ok(())
    }

    fn copy(&self, dst: &Arc<Page>, src: &Arc<Page>) -> Result<(), CopyError> {
        if Arc::ptr_eq(dst, src) {
            return Ok(());
        }
        if dst.byte_len() != src.byte_len() {
            return Err(CopyError::Misaligned);
        }
        self.transfer(dst, src)
    }
}

/// Channel borrowed for one call.
struct ChannelLease<'a> {
    device: &'a dyn DmaDevice,
    channel: Arc<dyn DmaChannel>,
}

impl<'a> ChannelLease<'a> {
    fn acquire(device: &'a dyn DmaDevice) -> Result<Self, DmaError> {
        let channel = device.request_channel()?;
        Ok(Self { device, channel })
    }

    fn channel(&self) -> &dyn DmaChannel {
        self.channel.as_ref()
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        self.device.release_channel(Arc::clone(&self.channel));
    }
}

/// Copies `len` bytes at `offset` from `src` to `dst` on one channel.
/// Mappings are released on every exit path.
fn copy_on(
    channel: &dyn DmaChannel,
    dst: &Arc<Page>,
    src: &Arc<Page>,
    offset: usize,
    len: usize,
) -> Result<(), CopyError> {
    let s = channel.map(src, offset, len, DmaDirection::ToDevice)?;
    let d = channel.map(dst, offset, len, DmaDirection::FromDevice)?;
    let desc = channel.prep_memcpy(d.as_ref(), s.as_ref())?;
    let cookie = channel.submit(desc)?;
    channel.wait(cookie)?;
    Ok(())
}

fn bounce_for(page: &Page) -> Arc<Page> {
    Page::builder(FrameId(u64::MAX))
        .node(page.node())
        .frame_size(page.byte_len())
        .build()
}

/// Runs `transfers` (destination, source) round-robin over `channels`, one
/// thread per channel, and returns the first failure.
fn run_phase(
    channels: &[&dyn DmaChannel],
    transfers: &[(&Arc<Page>, &Arc<Page>)],
) -> Result<(), CopyError> {
    let lanes = channels.len().min(transfers.len());
    let results: Vec<Result<(), CopyError>> = thread::scope(|s| {
        let handles: Vec<_> = channels[..lanes]
            .iter()
            .enumerate()
            .map(|(lane, channel)| {
                s.spawn(move || {
                    transfers
                        .iter()
                        .skip(lane)
                        .step_by(lanes)
                        .try_for_each(|(dst, src)| copy_on(*channel, dst, src, 0, dst.byte_len()))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(CopyError::Dma(DmaError::Completion))))
            .collect()
    });
    results.into_iter().collect()
}

fn prev_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_floor() {
        assert_eq!(prev_power_of_two(0), 0);
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(4), 4);
        assert_eq!(prev_power_of_two(7), 4);
        assert_eq!(prev_power_of_two(9), 8);
    }
}
