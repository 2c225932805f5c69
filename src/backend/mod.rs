//! Executors for the misses of a pass.

mod batch;
mod cluster;
mod pbs;
mod pool;

pub use self::batch::{BatchBackend, BatchConfig, JobId, JobScript};
pub use self::cluster::{AsyncMap, ClusterBackend, Completer, Controller, LocalCluster};
pub use self::pbs::Pbs;
pub use self::pool::LocalPool;

use std::sync::Arc;

use crate::codec::Record;
use crate::error::BackendError;
use crate::pending::PendingCall;
use crate::registry::Registry;
use crate::store::Store;

/// Turns a batch of pending calls into cached results.
///
/// When `execute` returns successfully, the result of every call in the batch
/// is in the store. A call that fails is not an error of the batch: its
/// failure is cached as its result and surfaces when the fingerprint is looked
/// up. Only infrastructure failures (an unwritable cache, an unreachable
/// cluster, a stuck scheduler) abort the batch. Results cached before such an
/// abort stay valid.
///
/// Backends are reusable across batches and environments.
pub trait Backend: Send + Sync {
    /// A short name for diagnostics.
    fn name(&self) -> &str;

    /// Execute all calls, blocking until they are cached.
    fn execute(&self, batch: &[PendingCall], store: &Arc<dyn Store>) -> Result<(), BackendError>;
}

/// Execute a single call and cache its record.
///
/// Calls with a readable record already in the store are skipped, so
/// re-submitting a call is harmless. Stale calls are always recomputed.
pub fn execute_call(
    registry: &Registry,
    store: &dyn Store,
    call: &PendingCall,
) -> Result<(), BackendError> {
    if !call.stale && is_cached(store, call) {
        tracing::debug!(fingerprint = %call.fingerprint, "already cached, skipping");
        return Ok(());
    }

    let record = registry.invoke(call);
    if let Record::Failure(message) = &record {
        tracing::warn!(
            function = %call.function,
            fingerprint = %call.fingerprint,
            %message,
            "tracked call failed",
        );
    }

    store.set(call.fingerprint, &record.to_bytes()?)?;
    Ok(())
}

/// Whether the store holds a readable record for the call. Read errors count
/// as misses.
fn is_cached(store: &dyn Store, call: &PendingCall) -> bool {
    match store.get(call.fingerprint) {
        Ok(bytes) => bytes.is_some_and(|bytes| Record::from_bytes(&bytes).is_ok()),
        Err(err) => {
            tracing::warn!(
                fingerprint = %call.fingerprint,
                %err,
                "cache read failed, recomputing",
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use parking_lot::Mutex;

    use super::*;
    use crate::codec;
    use crate::error::StoreError;
    use crate::fingerprint::Fingerprint;
    use crate::store::MemoryStore;

    fn call(registry: &mut Registry, invocations: &Arc<Mutex<usize>>) -> PendingCall {
        let counter = invocations.clone();
        registry.track("triple", move |x: u32| {
            *counter.lock() += 1;
            u64::from(x) * 3
        });

        PendingCall {
            fingerprint: Fingerprint::of("triple", &7u32),
            function: "triple".into(),
            args: codec::encode(&7u32).unwrap(),
            group: None,
            stale: false,
        }
    }

    fn value(store: &dyn Store, fingerprint: Fingerprint) -> Record {
        Record::from_bytes(&store.get(fingerprint).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_cached_calls_are_skipped_unless_stale() {
        let invocations = Arc::new(Mutex::new(0));
        let mut registry = Registry::new();
        let mut call = call(&mut registry, &invocations);
        let store = MemoryStore::new();

        // A readable record of the wrong type.
        let old = Record::Value(vec![1, 2]);
        store.set(call.fingerprint, &old.to_bytes().unwrap()).unwrap();

        execute_call(&registry, &store, &call).unwrap();
        assert_eq!(*invocations.lock(), 0);
        assert_eq!(value(&store, call.fingerprint), old);

        call.stale = true;
        execute_call(&registry, &store, &call).unwrap();
        assert_eq!(*invocations.lock(), 1);
        assert_eq!(
            value(&store, call.fingerprint),
            Record::Value(codec::encode(&21u64).unwrap())
        );
    }

    /// Fails every read, stores writes in memory.
    struct Unreadable(MemoryStore);

    impl Store for Unreadable {
        fn get(&self, _: Fingerprint) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Io {
                path: PathBuf::from("unreadable"),
                source: std::io::Error::other("disk on fire"),
            })
        }

        fn set(&self, key: Fingerprint, value: &[u8]) -> Result<(), StoreError> {
            self.0.set(key, value)
        }
    }

    #[test]
    fn test_read_errors_are_recomputed() {
        let invocations = Arc::new(Mutex::new(0));
        let mut registry = Registry::new();
        let call = call(&mut registry, &invocations);
        let store = Unreadable(MemoryStore::new());

        execute_call(&registry, &store, &call).unwrap();
        assert_eq!(*invocations.lock(), 1);
        assert_eq!(
            value(&store.0, call.fingerprint),
            Record::Value(codec::encode(&21u64).unwrap())
        );
    }
}
