//! Identifiers, the crate error type and shared enums.

mod fingerprint;

use std::fmt;

use thiserror::Error;

pub use fingerprint::page_fingerprint;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Physical frame number of the first frame backing a page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

/// Locality domain (NUMA node).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u16);

/// Memory zone inside a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneId(pub u8);

/// Accounting group owning a page's charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CgroupId(pub u32);

/// Identity of an anonymous reverse-mapping root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnonVmaId(pub u64);

/// Identity of a file-backed address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub u64);

/// Identity of a process memory domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Where a bookkeeping allocation was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocSite {
    /// Per-pair state captured while suspending translations.
    UnmapBookkeeping,
    /// Job lists built for a bulk content copy.
    CopyJobs,
    /// Bounce buffer used to exchange through one-way copy channels.
    BounceBuffer,
}

impl AllocSite {
    /// Returns a short label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AllocSite::UnmapBookkeeping => "unmap-bookkeeping",
            AllocSite::CopyJobs => "copy-jobs",
            AllocSite::BounceBuffer => "bounce-buffer",
        }
    }
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while exchanging pages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// A page lock was contended and the mode forbids blocking.
    #[error("page lock contended")]
    Busy,
    /// Reference counts did not match; the exchange may be retried.
    #[error("unexpected page references, retry")]
    Retry,
    /// Retries were exhausted.
    #[error("gave up after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
    /// The pair stopped qualifying for the batched path after it was
    /// selected; it is finished on the serialized path instead.
    #[error("pair not eligible for this exchange path")]
    Unavailable,
    /// A bookkeeping allocation failed.
    #[error("out of memory allocating {0}")]
    OutOfMemory(AllocSite),
    /// Private data attached to an orphaned page could not be released.
    #[error("private page data is busy")]
    PrivateBusy,
    /// Both pages belong to an address space.
    #[error("both pages are owned by an address space")]
    BothMapped,
    /// The two pages span a different number of frames.
    #[error("frame count mismatch: {from} vs {to}")]
    OrderMismatch {
        /// Frames spanned by the `from` page.
        from: usize,
        /// Frames spanned by the `to` page.
        to: usize,
    },
    /// The two pages hold a different number of bytes.
    #[error("page size mismatch: {from} vs {to} bytes")]
    SizeMismatch {
        /// Bytes held by the `from` page.
        from: usize,
        /// Bytes held by the `to` page.
        to: usize,
    },
    /// Another top-level exchange is running on the same memory domain.
    #[error("an exchange batch is already in progress")]
    BatchInProgress,
    /// A page is under writeback and the mode forbids waiting.
    #[error("page under writeback")]
    Writeback,
    /// The request is malformed.
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    /// A caller contract was violated.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl ExchangeError {
    /// Returns true when a later attempt may succeed without outside help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Busy | ExchangeError::Retry | ExchangeError::Writeback
        )
    }
}

/// How patient lock acquisition and writeback waits may be.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum BlockingMode {
    /// Never block; contention fails the attempt.
    NonBlocking,
    /// Block on page locks but not on writeback.
    LightSync,
    /// Block on page locks and wait for writeback.
    #[default]
    FullSync,
}

impl BlockingMode {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockingMode::NonBlocking => "non-blocking",
            BlockingMode::LightSync => "light-sync",
            BlockingMode::FullSync => "full-sync",
        }
    }

    /// Parses a mode from a string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "non-blocking" | "async" => Some(BlockingMode::NonBlocking),
            "light-sync" | "sync-light" => Some(BlockingMode::LightSync),
            "full-sync" | "sync" => Some(BlockingMode::FullSync),
            _ => None,
        }
    }

    /// Whether page locks may be waited on.
    pub fn may_block(self) -> bool {
        !matches!(self, BlockingMode::NonBlocking)
    }

    /// Whether in-flight writeback may be waited on.
    pub fn waits_for_writeback(self) -> bool {
        matches!(self, BlockingMode::FullSync)
    }
}
