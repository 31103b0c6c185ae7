#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagex::env::{Topology, UnboundedAllocator};
use pagex::exchange::copy::ExchangeJob;
use pagex::exchange::{
    BulkCopy, ChunkCopyEngine, CopyBackend, DmaCopyOffload, DmaMode, SerialCopy,
};
use pagex::primitives::page::PageKind;
use pagex::sim::{SimSystem, SoftDmaDevice};
use pagex::types::{FrameId, NodeId};
use pagex::{ExchangeOptions, Exchanger, Page, PagePair};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const FRAME: usize = 4096;
const PAIRS_PER_BATCH: usize = 64;

fn random_page(rng: &mut ChaCha8Rng, frame: u64, nr: usize) -> Arc<Page> {
    let mut builder = Page::builder(FrameId(frame)).frame_size(FRAME);
    if nr > 1 {
        builder = builder.huge(PageKind::TransHuge, nr);
    }
    let page = builder.build();
    rng.fill_bytes(&mut page.data_mut());
    page
}

fn engines() -> Vec<(&'static str, Box<dyn BulkCopy>)> {
    let topology = Topology::uniform(1, 8);
    let device = SoftDmaDevice::new("bench-dma", 4);
    let mut out: Vec<(&'static str, Box<dyn BulkCopy>)> = vec![("serial", Box::new(SerialCopy))];
    for workers in [2usize, 4, 8] {
        let name: &'static str = match workers {
            2 => "pool-2",
            4 => "pool-4",
            _ => "pool-8",
        };
        out.push((
            name,
            Box::new(ChunkCopyEngine::new(
                workers,
                topology.clone(),
                Arc::new(UnboundedAllocator),
            )),
        ));
    }
    if let Ok(engine) = DmaCopyOffload::new(device, DmaMode::Reserved, 4, Arc::new(UnboundedAllocator)) {
        out.push(("dma-reserved-4", Box::new(engine)));
    }
    out
}

fn single_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy/exchange");
    group.sample_size(30);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    for nr in [1usize, 16] {
        let a = random_page(&mut rng, 1, nr);
        let b = random_page(&mut rng, 2, nr);
        group.throughput(Throughput::Bytes((FRAME * nr) as u64));
        for (name, engine) in engines() {
            group.bench_with_input(BenchmarkId::new(name, nr), &nr, |bench, _| {
                bench.iter(|| engine.exchange(&a, &b).unwrap());
            });
        }
    }
    group.finish();
}

fn batch_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy/exchange_batch");
    group.sample_size(20);
    let mut rng = ChaCha8Rng::seed_from_u64(0xba7c);
    let jobs: Vec<_> = (0..PAIRS_PER_BATCH as u64)
        .map(|i| {
            ExchangeJob::new(
                random_page(&mut rng, 2 * i, 1),
                random_page(&mut rng, 2 * i + 1, 1),
            )
        })
        .collect();
    group.throughput(Throughput::Bytes((FRAME * PAIRS_PER_BATCH) as u64));
    for (name, engine) in engines() {
        group.bench_function(name, |bench| {
            bench.iter(|| engine.exchange_batch(&jobs).unwrap());
        });
    }
    group.finish();
}

fn end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("exchange/batch");
    group.sample_size(10);
    group.throughput(Throughput::Elements(PAIRS_PER_BATCH as u64));
    for backend in [
        CopyBackend::Serial,
        CopyBackend::WorkerPool,
        CopyBackend::HardwareChannel,
    ] {
        let sim = SimSystem::builder()
            .nodes(2)
            .cpus_per_node(8)
            .frame_size(FRAME)
            .dma_channels(4)
            .build();
        let mm = sim.new_mm();
        let vma = sim.new_anon_vma();
        let pairs: Vec<_> = (0..PAIRS_PER_BATCH as u64)
            .map(|i| {
                let from = sim.alloc_anon_page(&mm, &vma, i * FRAME as u64, NodeId(1));
                let to = sim.alloc_anon_page(
                    &mm,
                    &vma,
                    (PAIRS_PER_BATCH as u64 + i) * FRAME as u64,
                    NodeId(0),
                );
                sim.fill(&from, i);
                PagePair::new(from, to)
            })
            .collect();
        let exchanger = Exchanger::new(
            sim.env(),
            ExchangeOptions::new()
                .frame_size(FRAME)
                .copy_backend(backend)
                .worker_count(8),
        );
        group.bench_function(backend.as_str(), |bench| {
            bench.iter(|| {
                for pair in &pairs {
                    sim.isolate(&pair.from);
                    sim.isolate(&pair.to);
                }
                let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
                assert_eq!(report.exchanged, PAIRS_PER_BATCH);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, single_exchange, batch_exchange, end_to_end);
criterion_main!(benches);
