use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use super::{Backend, execute_call};
use crate::error::{BackendError, ClusterError};
use crate::pending::PendingCall;
use crate::registry::Registry;
use crate::store::Store;

/// The controller of an interactive cluster of pre-connected engines.
///
/// This is the transport seam: implementations forward maps to wherever the
/// engines live. Engines resolve calls through their own [`Registry`] and
/// write results to the given store.
pub trait Controller: Send + Sync {
    /// The number of engines currently connected. Fails if the controller
    /// cannot be reached.
    fn engines(&self) -> Result<usize, ClusterError>;

    /// Start a load-balanced map of `calls` over the engines.
    fn map_async(
        &self,
        calls: Vec<PendingCall>,
        store: Arc<dyn Store>,
    ) -> Result<AsyncMap, ClusterError>;
}

/// Dispatches batches to an interactive cluster and waits for the map to
/// complete.
pub struct ClusterBackend {
    controller: Arc<dyn Controller>,
}

impl ClusterBackend {
    /// Connect to a cluster. Fails if the controller is unreachable or has no
    /// engines, so callers can fall back to another backend.
    pub fn connect(controller: Arc<dyn Controller>) -> Result<Self, ClusterError> {
        match controller.engines()? {
            0 => Err(ClusterError::NoEngines),
            engines => {
                tracing::info!(engines, "connected to cluster");
                Ok(Self { controller })
            }
        }
    }
}

impl Backend for ClusterBackend {
    fn name(&self) -> &str {
        "cluster"
    }

    fn execute(&self, batch: &[PendingCall], store: &Arc<dyn Store>) -> Result<(), BackendError> {
        let map = self.controller.map_async(batch.to_vec(), store.clone())?;
        map.wait()?;
        Ok(())
    }
}

/// The completion future of a map started with [`Controller::map_async`].
pub struct AsyncMap(Arc<MapState>);

/// Reports task completions to an [`AsyncMap`].
#[derive(Clone)]
pub struct Completer(Arc<MapState>);

struct MapState {
    progress: Mutex<Progress>,
    changed: Condvar,
}

struct Progress {
    remaining: usize,
    lost: usize,
    errors: Vec<String>,
}

impl AsyncMap {
    /// Create a future awaiting `tasks` completions.
    pub fn new(tasks: usize) -> (Self, Completer) {
        let state = Arc::new(MapState {
            progress: Mutex::new(Progress { remaining: tasks, lost: 0, errors: vec![] }),
            changed: Condvar::new(),
        });
        (Self(state.clone()), Completer(state))
    }

    /// Whether every task has completed.
    pub fn is_ready(&self) -> bool {
        self.0.progress.lock().remaining == 0
    }

    /// Block until every task has completed.
    pub fn wait(self) -> Result<(), ClusterError> {
        let mut progress = self.0.progress.lock();
        while progress.remaining > 0 {
            self.0.changed.wait(&mut progress);
        }

        if progress.lost > 0 {
            return Err(ClusterError::Lost(progress.lost));
        }

        match progress.errors.first() {
            Some(error) => Err(ClusterError::Engine(error.clone())),
            None => Ok(()),
        }
    }
}

impl Completer {
    /// Report a finished task. Returns whether it was the last one.
    pub fn complete(&self, result: Result<(), String>) -> bool {
        self.settle(|progress| {
            if let Err(error) = result {
                progress.errors.push(error);
            }
        })
    }

    /// Report a task that will never finish.
    pub fn lose(&self) -> bool {
        self.settle(|progress| progress.lost += 1)
    }

    fn settle(&self, f: impl FnOnce(&mut Progress)) -> bool {
        let mut progress = self.0.progress.lock();
        f(&mut progress);
        progress.remaining = progress.remaining.saturating_sub(1);
        let last = progress.remaining == 0;
        if last {
            self.0.changed.notify_all();
        }
        last
    }
}

/// A cluster of engine threads in this process.
///
/// Engines pull tasks from a shared queue, so work is load-balanced across
/// them. Maps in flight are kept in a handle table until their last task
/// settles.
pub struct LocalCluster {
    shared: Arc<Shared>,
    engines: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    registry: Arc<Registry>,
    queue: Mutex<Queue>,
    available: Condvar,
}

struct Queue {
    running: bool,
    tasks: VecDeque<Task>,
    maps: Slab<InFlight>,
}

struct Task {
    map: usize,
    call: PendingCall,
}

struct InFlight {
    store: Arc<dyn Store>,
    completer: Completer,
}

impl LocalCluster {
    /// Start `engines` engine threads resolving calls through `registry`.
    pub fn start(engines: usize, registry: Arc<Registry>) -> Result<Self, ClusterError> {
        let shared = Arc::new(Shared {
            registry,
            queue: Mutex::new(Queue {
                running: true,
                tasks: VecDeque::new(),
                maps: Slab::new(),
            }),
            available: Condvar::new(),
        });

        let cluster = Self { shared, engines: Mutex::new(Vec::with_capacity(engines)) };
        for i in 0..engines {
            let shared = cluster.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("parmemo-engine-{i}"))
                .spawn(move || engine(&shared))
                .map_err(|err| ClusterError::Unreachable(err.to_string()))?;
            cluster.engines.lock().push(handle);
        }

        Ok(cluster)
    }

    /// Stop all engines. Queued tasks are reported as lost and the cluster
    /// becomes unreachable.
    pub fn shutdown(&self) {
        let lost = {
            let mut queue = self.shared.queue.lock();
            if !queue.running {
                return;
            }
            queue.running = false;
            std::mem::take(&mut queue.tasks)
        };

        self.shared.available.notify_all();
        for task in lost {
            settle(&self.shared, task.map, Settlement::Lost);
        }

        for handle in self.engines.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("cluster engine panicked");
            }
        }
    }
}

impl Controller for LocalCluster {
    fn engines(&self) -> Result<usize, ClusterError> {
        if !self.shared.queue.lock().running {
            return Err(ClusterError::Unreachable("cluster is shut down".into()));
        }
        Ok(self.engines.lock().len())
    }

    fn map_async(
        &self,
        calls: Vec<PendingCall>,
        store: Arc<dyn Store>,
    ) -> Result<AsyncMap, ClusterError> {
        let (map, completer) = AsyncMap::new(calls.len());

        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return Err(ClusterError::Unreachable("cluster is shut down".into()));
        }

        if calls.is_empty() {
            return Ok(map);
        }

        let key = queue.maps.insert(InFlight { store, completer });
        queue.tasks.extend(calls.into_iter().map(|call| Task { map: key, call }));
        drop(queue);

        self.shared.available.notify_all();
        Ok(map)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The main loop of an engine thread.
fn engine(shared: &Shared) {
    loop {
        let (task, store) = {
            let mut queue = shared.queue.lock();
            loop {
                if !queue.running {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    let store = queue.maps[task.map].store.clone();
                    break (task, store);
                }
                shared.available.wait(&mut queue);
            }
        };

        // Function panics are caught by the registry. A panic here comes from
        // the store and loses the task, but the map must still settle.
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            execute_call(&shared.registry, store.as_ref(), &task.call)
        }));

        let settlement = match result {
            Ok(Ok(())) => Settlement::Done(Ok(())),
            Ok(Err(err)) => Settlement::Done(Err(err.to_string())),
            Err(_) => {
                tracing::error!(fingerprint = %task.call.fingerprint, "engine task panicked");
                Settlement::Lost
            }
        };
        settle(shared, task.map, settlement);
    }
}

enum Settlement {
    Done(Result<(), String>),
    Lost,
}

/// Settle a task of a map and release the map's handle after its last task.
fn settle(shared: &Shared, map: usize, settlement: Settlement) {
    let mut queue = shared.queue.lock();
    let Some(entry) = queue.maps.get(map) else { return };
    let last = match settlement {
        Settlement::Done(result) => entry.completer.complete(result),
        Settlement::Lost => entry.completer.lose(),
    };
    if last {
        queue.maps.remove(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::error::StoreError;
    use crate::fingerprint::Fingerprint;
    use crate::store::MemoryStore;

    #[test]
    fn test_connect_requires_engines() {
        let registry = Arc::new(Registry::new());
        let empty = Arc::new(LocalCluster::start(0, registry.clone()).unwrap());
        assert!(matches!(ClusterBackend::connect(empty), Err(ClusterError::NoEngines)));

        let cluster = Arc::new(LocalCluster::start(2, registry).unwrap());
        assert_eq!(cluster.engines().unwrap(), 2);
        cluster.shutdown();
        assert!(matches!(
            ClusterBackend::connect(cluster),
            Err(ClusterError::Unreachable(_))
        ));
    }

    #[test]
    fn test_async_map_waits_for_every_task() {
        let (map, completer) = AsyncMap::new(2);
        assert!(!map.is_ready());
        assert!(!completer.complete(Ok(())));
        assert!(completer.complete(Err("disk full".into())));
        assert!(map.is_ready());
        assert!(matches!(map.wait(), Err(ClusterError::Engine(msg)) if msg == "disk full"));
    }

    /// Panics on every write.
    struct Brittle;

    impl Store for Brittle {
        fn get(&self, _: Fingerprint) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn set(&self, _: Fingerprint, _: &[u8]) -> Result<(), StoreError> {
            panic!("store broke")
        }
    }

    #[test]
    fn test_panicking_task_is_lost() {
        let mut registry = Registry::new();
        registry.track("id", |x: u8| x);
        let cluster = LocalCluster::start(1, Arc::new(registry)).unwrap();

        let args = codec::encode(&1u8).unwrap();
        let call = PendingCall {
            fingerprint: Fingerprint::of("id", &1u8),
            function: "id".into(),
            args,
            group: None,
            stale: false,
        };

        let map = cluster.map_async(vec![call.clone()], Arc::new(Brittle)).unwrap();
        assert!(matches!(map.wait(), Err(ClusterError::Lost(1))));

        // The engine survives the panic.
        let store = Arc::new(MemoryStore::new());
        cluster.map_async(vec![call], store.clone()).unwrap().wait().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_map_is_ready() {
        let cluster = LocalCluster::start(1, Arc::new(Registry::new())).unwrap();
        let map = cluster.map_async(vec![], Arc::new(MemoryStore::new())).unwrap();
        assert!(map.is_ready());
        map.wait().unwrap();
    }
}
