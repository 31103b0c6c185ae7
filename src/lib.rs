//! In-place exchange of equally sized memory pages.
//!
//! Two isolated pages trade their slot identities, contents and metadata so
//! that every owner ends up with the same logical page backed by the other
//! physical frame. Content moves through a per-node worker pool, hardware
//! copy channels or the calling thread. Batches run through a phase-batched
//! scheduler with a serialized fallback for pairs it cannot finish.
//!
//! The host memory system is reached only through [`env::MemoryEnv`];
//! [`sim`] provides an in-memory host for tests, benches and the CLI.

pub mod env;
pub mod exchange;
pub mod primitives;
pub mod sim;
pub mod types;

pub use env::MemoryEnv;
pub use exchange::{
    BatchReport, CopyBackend, ExchangeOptions, Exchanger, OrderMismatchPolicy, PairStatus,
};
pub use primitives::page::{Page, PagePair};
pub use types::{BlockingMode, ExchangeError, Result};
