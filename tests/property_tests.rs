use std::sync::Arc;

use proptest::prelude::*;

use pagex::env::{Topology, UnboundedAllocator};
use pagex::exchange::copy::ExchangeJob;
use pagex::exchange::{transfer_metadata, BulkCopy, ChunkCopyEngine, CopyBackend, SerialCopy};
use pagex::primitives::page::{PageFlags, PageKind};
use pagex::sim::SimSystem;
use pagex::types::{FrameId, NodeId};
use pagex::{ExchangeOptions, Exchanger, Page, PagePair};

const CARRIED: PageFlags = PageFlags::ERROR
    .union(PageFlags::REFERENCED)
    .union(PageFlags::UPTODATE)
    .union(PageFlags::CHECKED)
    .union(PageFlags::MAPPED_TO_DISK)
    .union(PageFlags::DIRTY)
    .union(PageFlags::YOUNG)
    .union(PageFlags::IDLE);

const SLOT_BITS: PageFlags = PageFlags::PRIVATE
    .union(PageFlags::SWAP_BACKED)
    .union(PageFlags::LRU);

fn arb_flags() -> impl Strategy<Value = PageFlags> {
    any::<u32>().prop_map(PageFlags::from_bits_truncate)
}

fn page_with(frame: u64, flags: PageFlags) -> Arc<Page> {
    let page = Page::builder(FrameId(frame)).frame_size(32).build();
    page.meta().flags = flags;
    page
}

fn filled(frame: u64, frame_size: usize, nr: usize, bytes: &[u8]) -> Arc<Page> {
    let mut builder = Page::builder(FrameId(frame)).frame_size(frame_size);
    if nr > 1 {
        builder = builder.huge(PageKind::TransHuge, nr);
    }
    let page = builder.build();
    page.write_at(0, &bytes[..frame_size * nr]);
    page
}

fn bytes(page: &Page) -> Vec<u8> {
    page.data().to_vec()
}

fn settled(flags: PageFlags) -> PageFlags {
    let mut out = flags - PageFlags::WRITEBACK;
    if out.contains(PageFlags::ACTIVE) {
        out.remove(PageFlags::UNEVICTABLE);
    }
    out
}

proptest! {
    #[test]
    fn prop_metadata_moves_content_bits_and_keeps_slot_bits(a in arb_flags(), b in arb_flags()) {
        let pa = page_with(1, a);
        let pb = page_with(2, b);
        transfer_metadata(&pa, &pb, None);
        let (fa, fb) = (pa.flags(), pb.flags());

        for f in [fa, fb] {
            prop_assert!(!f.contains(PageFlags::ACTIVE | PageFlags::UNEVICTABLE));
            prop_assert!(!f.contains(PageFlags::WRITEBACK));
        }
        prop_assert_eq!(fa & CARRIED, b & CARRIED);
        prop_assert_eq!(fb & CARRIED, a & CARRIED);
        prop_assert_eq!(fa & SLOT_BITS, a & SLOT_BITS);
        prop_assert_eq!(fb & SLOT_BITS, b & SLOT_BITS);
        prop_assert_eq!(fa.contains(PageFlags::SWAP_CACHE), b.contains(PageFlags::SWAP_CACHE));
        prop_assert_eq!(fb.contains(PageFlags::SWAP_CACHE), a.contains(PageFlags::SWAP_CACHE));

        transfer_metadata(&pa, &pb, None);
        prop_assert_eq!(pa.flags(), settled(a));
        prop_assert_eq!(pb.flags(), settled(b));
    }

    #[test]
    fn prop_chunked_exchange_matches_serial(
        workers in prop::sample::select(vec![1usize, 2, 4, 8]),
        frame_size in prop::sample::select(vec![64usize, 100, 256]),
        nr in 1usize..4,
        seed_a in prop::collection::vec(any::<u8>(), 1024),
        seed_b in prop::collection::vec(any::<u8>(), 1024),
    ) {
        let engine = ChunkCopyEngine::new(
            workers,
            Topology::uniform(1, 8),
            Arc::new(UnboundedAllocator),
        );
        let (a, b) = (filled(1, frame_size, nr, &seed_a), filled(2, frame_size, nr, &seed_b));
        let (ra, rb) = (filled(3, frame_size, nr, &seed_a), filled(4, frame_size, nr, &seed_b));

        engine.exchange(&a, &b).unwrap();
        SerialCopy.exchange_now(&ra, &rb);
        prop_assert_eq!(bytes(&a), bytes(&ra));
        prop_assert_eq!(bytes(&b), bytes(&rb));
        prop_assert_eq!(bytes(&a), seed_b[..frame_size * nr].to_vec());

        let jobs = vec![ExchangeJob::new(a.clone(), b.clone()), ExchangeJob::new(ra.clone(), rb.clone())];
        engine.exchange_batch(&jobs).unwrap();
        prop_assert_eq!(bytes(&a), seed_a[..frame_size * nr].to_vec());
        prop_assert_eq!(bytes(&rb), seed_b[..frame_size * nr].to_vec());

        engine.copy(&b, &a).unwrap();
        prop_assert_eq!(bytes(&b), bytes(&a));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_pair_ends_swapped(
        seeds in prop::collection::vec(any::<u64>(), 1..24),
        backend in prop::sample::select(vec![
            CopyBackend::WorkerPool,
            CopyBackend::HardwareChannel,
            CopyBackend::Serial,
        ]),
        batch_size in -2i64..8,
        workers in 0usize..6,
        concurrent in any::<bool>(),
    ) {
        let sim = SimSystem::builder()
            .nodes(2)
            .cpus_per_node(4)
            .frame_size(64)
            .dma_channels(2)
            .build();
        let mm = sim.new_mm();
        let vma = sim.new_anon_vma();
        let n = seeds.len() as u64;
        let pairs: Vec<_> = seeds
            .iter()
            .enumerate()
            .map(|(i, seed)| {
                let i = i as u64;
                let from = sim.alloc_anon_page(&mm, &vma, i * 64, NodeId(1));
                let to = sim.alloc_anon_page(&mm, &vma, (n + i) * 64, NodeId(0));
                sim.fill(&from, *seed);
                sim.fill(&to, seed.wrapping_add(1));
                sim.isolate(&from);
                sim.isolate(&to);
                PagePair::new(from, to)
            })
            .collect();
        let before: Vec<_> = pairs
            .iter()
            .map(|p| (bytes(&p.from), bytes(&p.to)))
            .collect();

        let exchanger = Exchanger::new(
            sim.env(),
            ExchangeOptions::new()
                .frame_size(64)
                .copy_backend(backend)
                .batch_size(batch_size)
                .worker_count(workers)
                .concurrent_batching(concurrent),
        );
        let report = exchanger.exchange(&mm, pairs.clone()).unwrap();
        prop_assert_eq!(report.exchanged, pairs.len());

        for (pair, (from_bytes, to_bytes)) in pairs.iter().zip(before) {
            prop_assert_eq!(bytes(&pair.to), from_bytes);
            prop_assert_eq!(bytes(&pair.from), to_bytes);
            prop_assert_eq!(pair.from.ref_count(), 1);
            prop_assert_eq!(pair.to.ref_count(), 1);
        }
        prop_assert_eq!(sim.rmap().migration_entries(), 0);
        prop_assert_eq!(sim.dma().unwrap().outstanding_mappings(), 0);
    }
}
