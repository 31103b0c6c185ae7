//! Fencing and exclusion primitives used by the exchange core.
//!
//! [`RefCount`] is a page reference count that can be *frozen*: pinned to zero
//! after a compare-exchange against an exact expected value, rejecting every
//! speculative increment until it is unfrozen to a new value. [`RunGate`]
//! admits one top-level exchange per memory domain at a time.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Reference count that supports freeze/unfreeze fencing.
///
/// While frozen the stored value is zero, so [`RefCount::try_get`] fails and
/// lookups that take a reference before checking identity have to retry.
pub struct RefCount {
    value: AtomicU32,
}

impl RefCount {
    /// Creates a count holding `value` references.
    pub fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    /// Current value. Zero means frozen or free.
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Takes a reference the caller already knows to be safe to take
    /// (the caller holds another reference on the same page).
    pub fn inc(&self) {
        let prev = self.value.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "increment of a frozen or free count");
    }

    /// Adds `n` references held by the caller's context.
    pub fn add(&self, n: u32) {
        if n > 0 {
            self.value.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Takes a reference unless the count is zero.
    pub fn try_get(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.value.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops one reference and returns the remaining count.
    pub fn put(&self) -> u32 {
        self.sub(1)
    }

    /// Drops `n` references and returns the remaining count.
    pub fn sub(&self, n: u32) -> u32 {
        let prev = self.value.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "reference count underflow");
        prev.saturating_sub(n)
    }

    /// Pins the count to zero if it currently equals `expected`.
    ///
    /// The returned token must be consumed with [`Frozen::unfreeze`]; dropping
    /// it unconsumed restores `expected`.
    pub fn try_freeze(&self, expected: u32) -> Option<Frozen<'_>> {
        if expected == 0 {
            return None;
        }
        self.value
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Frozen {
                count: self,
                expected,
                armed: true,
            })
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// Proof that a [`RefCount`] is frozen.
#[must_use = "a frozen count must be unfrozen"]
pub struct Frozen<'a> {
    count: &'a RefCount,
    expected: u32,
    armed: bool,
}

impl Frozen<'_> {
    /// Value the count held when it was frozen.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Releases the pin, publishing `value` as the new count.
    pub fn unfreeze(mut self, value: u32) {
        self.count.value.store(value, Ordering::Release);
        self.armed = false;
    }
}

impl Drop for Frozen<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.count.value.store(self.expected, Ordering::Release);
        }
    }
}

/// Admits one top-level exchange run at a time.
#[derive(Clone, Default)]
pub struct RunGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
}

#[derive(Default, Debug)]
struct GateState {
    running: bool,
    completed: u64,
}

/// Snapshot of gate state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    /// Whether a run currently holds the gate.
    pub running: bool,
    /// Number of runs that have released the gate.
    pub completed: u64,
}

/// Token held for the duration of one run. Dropping it reopens the gate.
pub struct RunToken {
    inner: Arc<GateInner>,
}

impl RunGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the gate without waiting. Returns `None` if a run is active.
    pub fn try_acquire(&self) -> Option<RunToken> {
        let mut state = self.inner.state.lock();
        if state.running {
            return None;
        }
        state.running = true;
        Some(RunToken {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns a snapshot of the gate state.
    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.inner.state.lock();
        GateSnapshot {
            running: state.running,
            completed: state.completed,
        }
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        state.completed = state.completed.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn freeze_requires_exact_expected_value() {
        let count = RefCount::new(3);
        assert!(count.try_freeze(2).is_none());
        assert_eq!(count.get(), 3);
        let frozen = count.try_freeze(3).expect("freeze at expected value");
        assert_eq!(count.get(), 0);
        assert!(!count.try_get(), "frozen count rejects speculative refs");
        frozen.unfreeze(5);
        assert_eq!(count.get(), 5);
        assert!(count.try_get());
        assert_eq!(count.get(), 6);
    }

    #[test]
    fn dropped_freeze_restores_expected() {
        let count = RefCount::new(2);
        {
            let _frozen = count.try_freeze(2).expect("freeze");
            assert_eq!(count.get(), 0);
        }
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn zero_count_is_never_frozen() {
        let count = RefCount::new(0);
        assert!(count.try_freeze(0).is_none());
        assert!(!count.try_get());
    }

    #[test]
    fn frozen_count_fences_concurrent_getters() {
        let count = Arc::new(RefCount::new(1));
        let barrier = Arc::new(Barrier::new(2));
        let stop = Arc::new(AtomicBool::new(false));
        let frozen = count.try_freeze(1).expect("freeze");

        let handle = {
            let count = Arc::clone(&count);
            let barrier = Arc::clone(&barrier);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                barrier.wait();
                let mut rejected = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    if count.try_get() {
                        return (rejected, true);
                    }
                    rejected += 1;
                    thread::yield_now();
                }
                (rejected, false)
            })
        };
        barrier.wait();
        thread::sleep(std::time::Duration::from_millis(20));
        frozen.unfreeze(4);
        let (_, acquired) = handle.join().unwrap();
        stop.store(true, Ordering::SeqCst);
        assert!(acquired);
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn gate_admits_one_run() {
        let gate = RunGate::new();
        let token = gate.try_acquire().expect("first run");
        assert!(gate.try_acquire().is_none());
        assert!(gate.snapshot().running);
        drop(token);
        let snap = gate.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.completed, 1);
        assert!(gate.clone().try_acquire().is_some());
    }
}
