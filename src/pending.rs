use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// A call that missed the cache and awaits execution on a backend.
///
/// Carries everything a worker needs to invoke the function standalone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    /// The cache key the result is written to.
    pub fingerprint: Fingerprint,
    /// The registered name of the tracked function.
    pub function: Arc<str>,
    /// The canonically encoded arguments.
    pub args: Vec<u8>,
    /// Calls with equal groups are run together in one grid job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u64>,
    /// The store holds an entry for this call that no longer decodes, so
    /// workers must overwrite it instead of skipping the call.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

/// Records and deduplicates the misses of a pass.
#[derive(Default)]
pub struct PendingSet(Mutex<Inner>);

#[derive(Default)]
struct Inner {
    /// The calls in order of first appearance.
    vec: Vec<PendingCall>,
    /// The fingerprints already present in `vec`.
    seen: FxHashSet<Fingerprint>,
}

impl PendingSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a call. Returns `false` if its fingerprint is already pending.
    pub fn insert(&self, call: PendingCall) -> bool {
        let mut inner = self.0.lock();
        if inner.seen.insert(call.fingerprint) {
            inner.vec.push(call);
            true
        } else {
            false
        }
    }

    /// The number of distinct pending calls.
    pub fn len(&self) -> usize {
        self.0.lock().vec.len()
    }

    /// Whether no call is pending.
    pub fn is_empty(&self) -> bool {
        self.0.lock().vec.is_empty()
    }

    /// Remove all calls, returning them in order of first appearance.
    pub fn take(&self) -> Vec<PendingCall> {
        let mut inner = self.0.lock();
        inner.seen.clear();
        std::mem::take(&mut inner.vec)
    }

    /// Forget all calls.
    pub fn clear(&self) {
        self.take();
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    fn call(n: u8) -> PendingCall {
        PendingCall {
            fingerprint: Fingerprint::of("f", &[n]),
            function: "f".into(),
            args: vec![n],
            group: None,
            stale: false,
        }
    }

    #[test]
    fn test_deduplicates() {
        let set = PendingSet::new();
        assert!(set.insert(call(1)));
        assert!(set.insert(call(2)));
        assert!(!set.insert(call(1)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.take(), vec![call(1), call(2)]);
        assert!(set.is_empty());
        assert!(set.insert(call(1)));
    }

    #[quickcheck]
    fn prop_order_of_first_appearance(ns: Vec<u8>) -> bool {
        let set = PendingSet::new();
        for &n in &ns {
            set.insert(call(n));
        }

        let mut expected = vec![];
        for n in ns {
            if !expected.contains(&n) {
                expected.push(n);
            }
        }

        set.take() == expected.into_iter().map(call).collect::<Vec<_>>()
    }
}
