//! Transparent parallelization through multi-pass memoization.
//!
//! Sequential code calls [tracked functions](TrackedFunction) inside the loop
//! of an [`Environment`]. On each pass, calls that hit the persistent cache
//! return their result; misses are recorded and, once the pass is over,
//! executed in parallel by a [`Backend`](backend::Backend). The loop ends with
//! the first pass that does not miss, so its values are final:
//!
//! ```
//! use std::sync::Arc;
//! use parmemo::{Environment, MemoryStore, Registry, backend::LocalPool};
//!
//! let mut registry = Registry::new();
//! let add = registry.track("add", |(a, b): (i64, i64)| a + b);
//!
//! let pool = LocalPool::new(2, Arc::new(registry));
//! let mut env = Environment::new(Arc::new(pool), Arc::new(MemoryStore::new()));
//!
//! let (mut x, mut y) = (None, None);
//! while env.run()? {
//!     x = add.call(&env, (1, 2))?;
//!     y = add.call(&env, (3, 4))?;
//! }
//!
//! assert_eq!((x, y), (Some(3), Some(7)));
//! # Ok::<(), parmemo::Error>(())
//! ```
//!
//! Tracked functions never run in the calling thread. They run on the
//! backend's workers: threads of a [local pool](backend::LocalPool), engines of
//! an [interactive cluster](backend::ClusterBackend), or [grid
//! jobs](backend::BatchBackend) that deliver their results through a shared
//! [`FsStore`].

pub mod backend;
mod codec;
mod environment;
mod error;
mod fingerprint;
pub mod job;
mod pending;
mod registry;
mod store;
mod track;

#[cfg(feature = "testing")]
pub mod testing;

pub use crate::codec::Record;
pub use crate::environment::{Environment, State};
pub use crate::error::{
    BackendError, BatchError, ClusterError, CodecError, Error, JobError, Result,
    SchedulerError, StoreError,
};
pub use crate::fingerprint::{Fingerprint, ParseFingerprintError};
pub use crate::pending::{PendingCall, PendingSet};
pub use crate::registry::Registry;
pub use crate::store::{FsStore, Locator, MemoryStore, Store};
pub use crate::track::TrackedFunction;
