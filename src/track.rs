use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use siphasher::sip::SipHasher13;

use crate::codec::{self, Record};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::pending::PendingCall;

/// Computes the grid job group of a call from its arguments.
type Grouper<A> = Arc<dyn Fn(&A) -> u64 + Send + Sync>;

/// A function whose calls are recorded by an [`Environment`] instead of being
/// executed.
///
/// Created by [`Registry::track`](crate::Registry::track). Calling it looks
/// the call up in the environment's cache: a hit yields the cached result, a
/// miss registers the call for the next batch and yields `None`. The wrapped
/// function itself never runs in the calling process.
pub struct TrackedFunction<A, R> {
    /// The registered name, which is the function's identity.
    name: Arc<str>,
    /// Groups calls into grid jobs.
    group: Option<Grouper<A>>,
    marker: PhantomData<fn(A) -> R>,
}

impl<A, R> TrackedFunction<A, R> {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self { name, group: None, marker: PhantomData }
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run calls whose arguments map to equal keys in the same grid job.
    ///
    /// Useful when calls sharing some input profit from running on the same
    /// node, e.g. because they read the same file.
    pub fn grouped_by<K, F>(mut self, key: F) -> Self
    where
        K: Hash,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        let group: Grouper<A> = Arc::new(move |args: &A| {
            let mut state = SipHasher13::new();
            key(args).hash(&mut state);
            state.finish()
        });
        self.group = Some(group);
        self
    }
}

impl<A, R> TrackedFunction<A, R>
where
    A: Hash + Serialize,
    R: DeserializeOwned,
{
    /// Call the function inside a running pass of `env`.
    ///
    /// Returns `Ok(None)` while the result is not yet available. Results of
    /// non-final passes are provisional and must not influence which tracked
    /// calls the pass makes.
    ///
    /// Arguments are identified through their [`Hash`] implementation, so
    /// unordered containers cannot be passed:
    ///
    /// ```compile_fail
    /// # use std::collections::HashSet;
    /// # use std::sync::Arc;
    /// # use parmemo::{Environment, MemoryStore, Registry, backend::LocalPool};
    /// let mut registry = Registry::new();
    /// let len = registry.track("len", |set: HashSet<u32>| set.len());
    /// let pool = Arc::new(LocalPool::new(1, Arc::new(Registry::new())));
    /// let mut env = Environment::new(pool, Arc::new(MemoryStore::new()));
    /// while env.run().unwrap() {
    ///     len.call(&env, HashSet::from([1, 2])).unwrap();
    /// }
    /// ```
    pub fn call(&self, env: &Environment, args: A) -> Result<Option<R>> {
        if !env.is_recording() {
            return Err(Error::Inactive { function: self.name.to_string() });
        }

        let fingerprint = Fingerprint::of(&self.name, &args);
        let mut stale = false;

        match env.lookup(fingerprint) {
            Some(Record::Value(value)) => match codec::decode(&value) {
                Ok(output) => {
                    tracing::debug!(function = %self.name, %fingerprint, "hit");
                    #[cfg(feature = "testing")]
                    crate::testing::register_hit();
                    return Ok(Some(output));
                }
                Err(err) => {
                    tracing::warn!(
                        function = %self.name,
                        %fingerprint,
                        %err,
                        "cached result is undecodable, recomputing",
                    );
                    stale = true;
                }
            },
            Some(Record::Failure(message)) => {
                env.fail(&self.name, fingerprint, &message);
                return Err(Error::Call {
                    function: self.name.to_string(),
                    fingerprint,
                    message,
                });
            }
            None => {}
        }

        let group = self.group.as_ref().map(|group| group(&args));
        let fresh = env.record(PendingCall {
            fingerprint,
            function: self.name.clone(),
            args: codec::encode(&args)?,
            group,
            stale,
        });

        if fresh {
            tracing::debug!(function = %self.name, %fingerprint, "miss");
        }

        #[cfg(feature = "testing")]
        crate::testing::register_miss();

        Ok(None)
    }

    /// The cache key of a call with these arguments.
    pub fn fingerprint(&self, args: &A) -> Fingerprint {
        Fingerprint::of(&self.name, args)
    }

    /// Like [`call`](Self::call), but substitutes `placeholder` for a result
    /// that is not yet available.
    pub fn call_or(&self, env: &Environment, args: A, placeholder: R) -> Result<R> {
        Ok(self.call(env, args)?.unwrap_or(placeholder))
    }
}

impl<A, R> Clone for TrackedFunction<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            group: self.group.clone(),
            marker: PhantomData,
        }
    }
}

impl<A, R> Debug for TrackedFunction<A, R> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "TrackedFunction({})", self.name)
    }
}
