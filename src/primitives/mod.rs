//! Low-level building blocks for the exchange core.
//!
//! Includes the reference-count fencing type, the page record with its lock,
//! and the slot owners pages live in.

/// Fencing and exclusion primitives.
///
/// Reference-count freeze tokens and the per-domain run gate.
pub mod concurrency;

/// Slot owners.
///
/// Address spaces, anonymous anchors and process memory domains.
pub mod mapping;

/// Page records.
///
/// Page identity, content, metadata, lock and guards.
pub mod page;
