use std::sync::atomic::Ordering;
use std::sync::Arc;

use pagex::env::DmaError;
use pagex::exchange::copy::ExchangeJob;
use pagex::exchange::{BulkCopy, CopyBackend, CopyError, CounterMetrics, DmaCopyOffload, DmaMode};
use pagex::sim::SimSystem;
use pagex::types::{AllocSite, FrameId, NodeId};
use pagex::{ExchangeOptions, Exchanger, Page, PagePair, PairStatus};

const FRAME: usize = 256;

fn sim_with_channels(channels: usize) -> SimSystem {
    SimSystem::builder()
        .nodes(2)
        .cpus_per_node(2)
        .frame_size(FRAME)
        .dma_channels(channels)
        .build()
}

fn dma_options(metrics: &Arc<CounterMetrics>) -> ExchangeOptions {
    ExchangeOptions::new()
        .frame_size(FRAME)
        .copy_backend(CopyBackend::HardwareChannel)
        .worker_count(2)
        .metrics(metrics.clone())
}

fn isolated_pairs(sim: &SimSystem, count: u64) -> (Arc<pagex::primitives::mapping::Mm>, Vec<PagePair>) {
    let mm = sim.new_mm();
    let vma = sim.new_anon_vma();
    let pairs = (0..count)
        .map(|i| {
            let from = sim.alloc_anon_page(&mm, &vma, i * FRAME as u64, NodeId(1));
            let to = sim.alloc_anon_page(&mm, &vma, (count + i) * FRAME as u64, NodeId(0));
            sim.fill(&from, 3 * i + 1);
            sim.fill(&to, 3 * i + 2);
            sim.isolate(&from);
            sim.isolate(&to);
            PagePair::new(from, to)
        })
        .collect();
    (mm, pairs)
}

fn fingerprints(pairs: &[PagePair]) -> Vec<(u32, u32)> {
    pairs
        .iter()
        .map(|p| (p.from.fingerprint(), p.to.fingerprint()))
        .collect()
}

fn assert_swapped(pairs: &[PagePair], before: &[(u32, u32)]) {
    for (pair, (from_fp, to_fp)) in pairs.iter().zip(before) {
        assert_eq!(pair.to.fingerprint(), *from_fp);
        assert_eq!(pair.from.fingerprint(), *to_fp);
    }
}

#[test]
fn channels_serve_the_batch_copy() {
    let sim = sim_with_channels(2);
    let (mm, pairs) = isolated_pairs(&sim, 4);
    let before = fingerprints(&pairs);
    let metrics = Arc::new(CounterMetrics::default());
    let exchanger = Exchanger::new(sim.env(), dma_options(&metrics));
    assert_eq!(exchanger.copy_engine(), "hardware-channel");

    let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
    assert_eq!(report.exchanged, 4);
    assert_swapped(&pairs, &before);

    let device = sim.dma().unwrap();
    assert_eq!(device.copies(), 4 * 3);
    assert_eq!(device.outstanding_mappings(), 0);
    assert_eq!(device.free_channels(), 2);
    assert_eq!(metrics.copy_calls_dma.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.copy_fallbacks.load(Ordering::Relaxed), 0);
}

#[test]
fn device_faults_fall_back_to_the_worker_pool() {
    for fault in [
        DmaError::NoChannel,
        DmaError::Map,
        DmaError::Prep,
        DmaError::Submit,
        DmaError::Completion,
    ] {
        let sim = sim_with_channels(2);
        let (mm, pairs) = isolated_pairs(&sim, 3);
        let before = fingerprints(&pairs);
        let metrics = Arc::new(CounterMetrics::default());
        let exchanger = Exchanger::new(sim.env(), dma_options(&metrics));
        let device = sim.dma().unwrap();
        device.inject_fault(fault);

        let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
        assert_eq!(report.statuses, vec![PairStatus::Exchanged; 3], "{fault:?}");
        assert_swapped(&pairs, &before);
        assert_eq!(device.outstanding_mappings(), 0, "{fault:?}");
        assert_eq!(device.free_channels(), 2, "{fault:?}");
        assert_eq!(metrics.copy_fallbacks.load(Ordering::Relaxed), 1, "{fault:?}");
        assert_eq!(metrics.copy_calls_pool.load(Ordering::Relaxed), 1, "{fault:?}");
    }
}

#[test]
fn bounce_allocation_failure_falls_back() {
    let sim = sim_with_channels(1);
    let (mm, pairs) = isolated_pairs(&sim, 2);
    let before = fingerprints(&pairs);
    sim.alloc().fail_after(AllocSite::BounceBuffer, 0);
    let metrics = Arc::new(CounterMetrics::default());
    let exchanger = Exchanger::new(sim.env(), dma_options(&metrics));

    let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
    assert_eq!(report.exchanged, 2);
    assert_swapped(&pairs, &before);
    assert_eq!(sim.dma().unwrap().copies(), 0);
    assert_eq!(metrics.copy_fallbacks.load(Ordering::Relaxed), 1);
}

#[test]
fn multi_frame_pages_bypass_channels() {
    let sim = sim_with_channels(2);
    let mm = sim.new_mm();
    let vma = sim.new_anon_vma();
    let from = sim.alloc_huge_anon_page(&mm, &vma, 0, NodeId(1), 4);
    let to = sim.alloc_huge_anon_page(&mm, &vma, 8 * FRAME as u64, NodeId(0), 4);
    sim.fill(&from, 9);
    let fp = from.fingerprint();
    sim.isolate(&from);
    sim.isolate(&to);

    let metrics = Arc::new(CounterMetrics::default());
    let exchanger = Exchanger::new(sim.env(), dma_options(&metrics));
    let report = exchanger.exchange(&mm, vec![PagePair::new(from, to.clone())]).unwrap();
    assert_eq!(report.exchanged, 1);
    assert_eq!(to.fingerprint(), fp);
    assert_eq!(sim.dma().unwrap().copies(), 0);
    assert_eq!(metrics.copy_calls_pool.load(Ordering::Relaxed), 1);
}

#[test]
fn reserved_channels_split_transfers() {
    let sim = sim_with_channels(3);
    let device = Arc::clone(sim.dma().unwrap());
    let engine = DmaCopyOffload::new(device.clone(), DmaMode::Reserved, 3, sim.alloc().clone()).unwrap();
    assert_eq!(engine.mode(), DmaMode::Reserved);
    assert_eq!(engine.active_channels(), 2);
    assert_eq!(device.free_channels(), 0);

    let a = Page::builder(FrameId(1)).frame_size(FRAME).build();
    let b = Page::builder(FrameId(2)).frame_size(FRAME).build();
    sim.fill(&a, 1);
    sim.fill(&b, 2);
    let (fa, fb) = (a.fingerprint(), b.fingerprint());
    engine.exchange(&a, &b).unwrap();
    assert_eq!((a.fingerprint(), b.fingerprint()), (fb, fa));
    assert_eq!(device.copies(), 3 * 2);

    let odd_a = Page::builder(FrameId(3)).frame_size(FRAME - 1).build();
    let odd_b = Page::builder(FrameId(4)).frame_size(FRAME - 1).build();
    assert_eq!(engine.exchange(&odd_a, &odd_b), Err(CopyError::Misaligned));
    assert_eq!(engine.copy(&odd_a, &odd_b), Err(CopyError::Misaligned));

    engine.copy(&b, &a).unwrap();
    assert_eq!(b.fingerprint(), a.fingerprint());

    drop(engine);
    assert_eq!(device.free_channels(), 3);
    assert_eq!(device.outstanding_mappings(), 0);
}

#[test]
fn reservation_without_channels_uses_the_pool() {
    let sim = sim_with_channels(1);
    let device = sim.dma().unwrap();
    device.inject_fault(DmaError::NoChannel);
    assert_eq!(
        DmaCopyOffload::new(device.clone(), DmaMode::Reserved, 2, sim.alloc().clone()).err(),
        Some(CopyError::Dma(DmaError::NoChannel))
    );

    device.inject_fault(DmaError::NoChannel);
    let exchanger = Exchanger::new(
        sim.env(),
        ExchangeOptions::new()
            .frame_size(FRAME)
            .copy_backend(CopyBackend::HardwareChannel)
            .reserve_channels(true),
    );
    assert_eq!(exchanger.copy_engine(), "worker-pool");
    assert_eq!(device.free_channels(), 1);
}

#[test]
fn on_demand_without_free_channel_is_an_error() {
    let sim = sim_with_channels(0);
    let engine = DmaCopyOffload::new(
        sim.dma().unwrap().clone(),
        DmaMode::OnDemand,
        1,
        sim.alloc().clone(),
    )
    .unwrap();
    let a = Page::builder(FrameId(1)).frame_size(FRAME).build();
    let b = Page::builder(FrameId(2)).frame_size(FRAME).build();
    sim.fill(&a, 4);
    let fa = a.fingerprint();
    assert_eq!(engine.exchange(&a, &b), Err(CopyError::Dma(DmaError::NoChannel)));
    assert_eq!(a.fingerprint(), fa);
}

#[test]
fn batch_leases_every_free_channel() {
    let sim = sim_with_channels(3);
    let (mm, pairs) = isolated_pairs(&sim, 6);
    let before = fingerprints(&pairs);
    let metrics = Arc::new(CounterMetrics::default());
    let exchanger = Exchanger::new(sim.env(), dma_options(&metrics));

    let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
    assert_eq!(report.exchanged, 6);
    assert_swapped(&pairs, &before);

    let device = sim.dma().unwrap();
    assert_eq!(device.peak_leased(), 3);
    assert_eq!(device.copies(), 6 * 3);
    assert_eq!(device.free_channels(), 3);
    assert_eq!(device.outstanding_mappings(), 0);
}

#[test]
fn reserved_batch_spreads_whole_pages() {
    let sim = sim_with_channels(2);
    let device = Arc::clone(sim.dma().unwrap());
    let engine = DmaCopyOffload::new(device.clone(), DmaMode::Reserved, 2, sim.alloc().clone()).unwrap();
    let pages: Vec<_> = (0..10u64)
        .map(|i| {
            let page = Page::builder(FrameId(i + 1)).frame_size(FRAME - 1).build();
            sim.fill(&page, i);
            page
        })
        .collect();
    let jobs: Vec<_> = pages
        .chunks(2)
        .map(|pair| ExchangeJob::new(Arc::clone(&pair[0]), Arc::clone(&pair[1])))
        .collect();
    let before: Vec<u32> = pages.iter().map(|p| p.fingerprint()).collect();

    engine.exchange_batch(&jobs).unwrap();
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(page.fingerprint(), before[i ^ 1]);
    }
    assert_eq!(device.copies(), 5 * 3);

    device.inject_fault(DmaError::Completion);
    assert_eq!(
        engine.exchange_batch(&jobs),
        Err(CopyError::Dma(DmaError::Completion))
    );
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(page.fingerprint(), before[i ^ 1]);
    }
    assert_eq!(device.outstanding_mappings(), 0);
}
