use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::backend::Backend;
use crate::codec::Record;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::pending::{PendingCall, PendingSet};
use crate::store::Store;

/// The lifecycle of an [`Environment`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// `run` was not called yet.
    Idle,
    /// The caller's body is executing and tracked calls are recorded.
    RunningPass,
    /// The backend is executing the misses of the last pass.
    AwaitingBackend,
    /// All calls resolved, or the environment failed.
    Done,
}

/// Drives sequential code through repeated passes until every tracked call it
/// makes is served from the cache.
///
/// ```ignore
/// let mut env = Environment::new(backend, store);
/// let (mut x, mut y) = (None, None);
/// while env.run()? {
///     x = add.call(&env, (1, 2))?;
///     y = add.call(&env, (3, 4))?;
/// }
/// assert_eq!((x, y), (Some(3), Some(7)));
/// ```
///
/// The body is re-executed from the top on every pass. It must make the same
/// sequence of tracked calls on every pass: results are provisional until the
/// final pass, so branching on them is not allowed.
pub struct Environment {
    backend: Arc<dyn Backend>,
    store: Arc<dyn Store>,
    state: State,
    /// The misses of the current pass.
    pending: PendingSet,
    /// Everything handed to the backend so far. None of it may become
    /// pending again.
    dispatched: FxHashSet<Fingerprint>,
    /// The first cached failure hit during the current pass.
    failure: Mutex<Option<Failure>>,
    passes: usize,
    max_passes: Option<usize>,
}

struct Failure {
    function: String,
    fingerprint: Fingerprint,
    message: String,
}

impl Environment {
    /// Create an environment executing misses on `backend` and caching the
    /// results in `store`.
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn Store>) -> Self {
        Self {
            backend,
            store,
            state: State::Idle,
            pending: PendingSet::new(),
            dispatched: FxHashSet::default(),
            failure: Mutex::new(None),
            passes: 0,
            max_passes: None,
        }
    }

    /// Fail instead of starting more than `max` passes.
    pub fn with_max_passes(mut self, max: usize) -> Self {
        self.max_passes = Some(max);
        self
    }

    /// Advance the pass protocol by one step.
    ///
    /// Returns `true` if the body must run (again). Between two passes, this
    /// blocks until the backend has computed and cached every miss of the
    /// previous pass. Once a pass completes without misses, returns `false`
    /// and the values from that pass are final.
    pub fn run(&mut self) -> Result<bool> {
        match self.state {
            State::Done => Ok(false),
            State::Idle => {
                self.pending.clear();
                self.begin_pass()?;
                Ok(true)
            }
            State::RunningPass => self.finish_pass(),
            State::AwaitingBackend => {
                self.state = State::Done;
                Err(Error::Interrupted)
            }
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The number of passes started so far.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// The cache that results are read from.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The number of distinct misses recorded in the current pass.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn begin_pass(&mut self) -> Result<()> {
        if let Some(max) = self.max_passes.filter(|&max| self.passes >= max) {
            self.state = State::Done;
            return Err(Error::TooManyPasses(max));
        }

        self.passes += 1;
        self.state = State::RunningPass;
        tracing::debug!(pass = self.passes, "starting pass");
        Ok(())
    }

    fn finish_pass(&mut self) -> Result<bool> {
        let batch = self.pending.take();

        if let Some(failure) = self.failure.lock().take() {
            self.state = State::Done;
            return Err(Error::Call {
                function: failure.function,
                fingerprint: failure.fingerprint,
                message: failure.message,
            });
        }

        if batch.is_empty() {
            self.state = State::Done;
            tracing::info!(passes = self.passes, "all tracked calls resolved");
            return Ok(false);
        }

        if let Some(call) = batch.iter().find(|call| self.dispatched.contains(&call.fingerprint)) {
            self.state = State::Done;
            return Err(Error::Unresolved {
                function: call.function.to_string(),
                fingerprint: call.fingerprint,
            });
        }

        self.state = State::AwaitingBackend;
        tracing::info!(
            pass = self.passes,
            calls = batch.len(),
            backend = self.backend.name(),
            "dispatching batch",
        );

        if let Err(err) = self.backend.execute(&batch, &self.store) {
            self.state = State::Done;
            return Err(err.into());
        }

        self.dispatched.extend(batch.iter().map(|call| call.fingerprint));
        self.begin_pass()?;
        Ok(true)
    }

    /// Whether tracked calls can be recorded right now.
    pub(crate) fn is_recording(&self) -> bool {
        self.state == State::RunningPass
    }

    /// Look up a fingerprint. Unreadable entries count as misses.
    pub(crate) fn lookup(&self, fingerprint: Fingerprint) -> Option<Record> {
        let bytes = match self.store.get(fingerprint) {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::warn!(%fingerprint, %err, "cache read failed, treating as miss");
                return None;
            }
        };

        match Record::from_bytes(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(%fingerprint, %err, "cache entry is corrupt, treating as miss");
                None
            }
        }
    }

    /// Register a miss. Returns `false` if it was already pending.
    pub(crate) fn record(&self, call: PendingCall) -> bool {
        self.pending.insert(call)
    }

    /// Remember a cached failure so that `run` surfaces it.
    pub(crate) fn fail(&self, function: &str, fingerprint: Fingerprint, message: &str) {
        self.failure.lock().get_or_insert_with(|| Failure {
            function: function.into(),
            fingerprint,
            message: message.into(),
        });
    }
}
