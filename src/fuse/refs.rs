// Inode reference tracker
//
// Counts the lookups the kernel holds for each inode. A successful lookup
// vends one reference; forget returns any number of them. The tracker never
// reclaims anything itself, it only reports when a count reaches zero.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of returning references for an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefChange {
    /// References remain outstanding
    Held(u64),
    /// The count just reached zero
    Released,
    /// The inode had no outstanding references
    Untracked,
}

/// Per-inode lookup counts shared by all in-flight requests
#[derive(Debug, Default)]
pub struct InodeRefs {
    counts: Mutex<HashMap<u64, u64>>,
}

impl InodeRefs {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<u64, u64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one reference and return the new count
    pub fn increment(&self, ino: u64) -> u64 {
        let mut counts = self.counts();
        let count = counts.entry(ino).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop `n` references
    ///
    /// Returning more references than are held saturates at zero.
    pub fn decrement(&self, ino: u64, n: u64) -> RefChange {
        let mut counts = self.counts();
        let Some(count) = counts.get_mut(&ino) else {
            if n > 0 {
                tracing::warn!(ino, n, "forget for inode with no outstanding references");
            }
            return RefChange::Untracked;
        };

        if n > *count {
            tracing::warn!(ino, n, held = *count, "forget exceeds outstanding references");
        }
        *count = count.saturating_sub(n);

        if *count == 0 {
            counts.remove(&ino);
            RefChange::Released
        } else {
            RefChange::Held(*count)
        }
    }

    /// Outstanding references for `ino`
    pub fn count(&self, ino: u64) -> u64 {
        self.counts().get(&ino).copied().unwrap_or(0)
    }

    /// Number of inodes with outstanding references
    pub fn len(&self) -> usize {
        self.counts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts().is_empty()
    }

    /// First phase of handing a reference to the kernel
    ///
    /// The reference is counted immediately. The caller settles it with
    /// [`Vended::confirm`] once the reply is delivered, or
    /// [`Vended::compensate`] if the kernel abandoned the request.
    pub fn vend(&self, ino: u64) -> Vended<'_> {
        self.increment(ino);
        Vended { refs: self, ino }
    }
}

/// A reference handed out while its reply is in flight
#[must_use = "a vended reference must be confirmed or compensated"]
#[derive(Debug)]
pub struct Vended<'a> {
    refs: &'a InodeRefs,
    ino: u64,
}

impl Vended<'_> {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// The kernel received the reference
    pub fn confirm(self) -> u64 {
        self.refs.count(self.ino)
    }

    /// The kernel never saw the reference; take it back
    pub fn compensate(self) -> RefChange {
        self.refs.decrement(self.ino, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_and_decrement() {
        let refs = InodeRefs::new();
        assert_eq!(refs.increment(42), 1);
        assert_eq!(refs.increment(42), 2);
        assert_eq!(refs.decrement(42, 1), RefChange::Held(1));
        assert_eq!(refs.decrement(42, 1), RefChange::Released);
        assert_eq!(refs.count(42), 0);
        assert!(refs.is_empty());
    }

    #[test]
    fn test_decrement_untracked_inode() {
        let refs = InodeRefs::new();
        assert_eq!(refs.decrement(7, 3), RefChange::Untracked);
        assert_eq!(refs.count(7), 0);
    }

    #[test]
    fn test_over_forget_saturates_at_zero() {
        let refs = InodeRefs::new();
        refs.increment(5);
        assert_eq!(refs.decrement(5, 10), RefChange::Released);
        assert_eq!(refs.count(5), 0);
        assert_eq!(refs.len(), 0);
    }

    #[test]
    fn test_vend_confirm_keeps_reference() {
        let refs = InodeRefs::new();
        let vended = refs.vend(42);
        assert_eq!(vended.ino(), 42);
        assert_eq!(vended.confirm(), 1);
        assert_eq!(refs.count(42), 1);
    }

    #[test]
    fn test_vend_compensate_returns_reference() {
        let refs = InodeRefs::new();
        refs.increment(42);
        let vended = refs.vend(42);
        assert_eq!(vended.compensate(), RefChange::Held(1));
        assert_eq!(refs.count(42), 1);
    }

    #[test]
    fn test_inodes_are_independent() {
        let refs = InodeRefs::new();
        refs.increment(1);
        refs.increment(2);
        refs.increment(2);
        assert_eq!(refs.decrement(1, 1), RefChange::Released);
        assert_eq!(refs.count(2), 2);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let refs = Arc::new(InodeRefs::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let refs = Arc::clone(&refs);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        refs.increment(9);
                    }
                    for _ in 0..500 {
                        refs.decrement(9, 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(refs.count(9), 8 * 500);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Lookup,
        AbortedLookup,
        Forget(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Lookup), Just(Op::AbortedLookup), (1u64..4).prop_map(Op::Forget)]
    }

    proptest! {
        #[test]
        fn prop_count_matches_lookups_minus_forgets(ops in proptest::collection::vec(op(), 0..200)) {
            let refs = InodeRefs::new();
            let mut delivered = 0u64;
            let mut forgotten = 0u64;

            for op in ops {
                match op {
                    Op::Lookup => {
                        refs.vend(42).confirm();
                        delivered += 1;
                    }
                    Op::AbortedLookup => {
                        let _ = refs.vend(42).compensate();
                    }
                    Op::Forget(n) => {
                        // The kernel only forgets references it holds.
                        let n = n.min(delivered - forgotten);
                        refs.decrement(42, n);
                        forgotten += n;
                    }
                }
                prop_assert_eq!(refs.count(42), delivered - forgotten);
            }
        }
    }
}
