use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use super::{Backend, execute_call};
use crate::error::BackendError;
use crate::pending::PendingCall;
use crate::registry::Registry;
use crate::store::Store;

/// Executes batches on a fixed number of worker threads of this process.
///
/// The thread calling [`execute`](Backend::execute) only waits; it never runs
/// a call itself.
pub struct LocalPool {
    workers: NonZeroUsize,
    registry: Arc<Registry>,
}

impl LocalPool {
    /// Create a pool with `workers` threads. Zero picks the available
    /// parallelism of the machine.
    pub fn new(workers: usize, registry: Arc<Registry>) -> Self {
        let workers = NonZeroUsize::new(workers)
            .or_else(|| thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::MIN);
        Self { workers, registry }
    }

    /// The number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.get()
    }
}

impl Backend for LocalPool {
    fn name(&self) -> &str {
        "local-pool"
    }

    fn execute(&self, batch: &[PendingCall], store: &Arc<dyn Store>) -> Result<(), BackendError> {
        let cursor = AtomicUsize::new(0);
        let failure = Mutex::new(None);
        let count = self.workers.get().min(batch.len());

        thread::scope(|scope| {
            for i in 0..count {
                let work = || {
                    while let Some(call) = batch.get(cursor.fetch_add(1, Ordering::Relaxed)) {
                        if let Err(err) = execute_call(&self.registry, store.as_ref(), call) {
                            // Drain the cursor so the other workers stop, too.
                            cursor.store(batch.len(), Ordering::Relaxed);
                            failure.lock().get_or_insert(err);
                            break;
                        }
                    }
                };

                if let Err(err) = thread::Builder::new()
                    .name(format!("parmemo-worker-{i}"))
                    .spawn_scoped(scope, work)
                {
                    cursor.store(batch.len(), Ordering::Relaxed);
                    failure.lock().get_or_insert(BackendError::Spawn(err));
                    break;
                }
            }
        });

        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
