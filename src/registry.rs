use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{self, Record};
use crate::pending::PendingCall;
use crate::track::TrackedFunction;

/// A type-erased function: encoded arguments in, encoded result or failure
/// message out.
type Invoker = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// The functions that workers can execute by name.
///
/// Every process that executes pending calls (the environment's own process
/// for the local pool, cluster engines, grid jobs) must build a registry with
/// the same names bound to the same functions.
#[derive(Default, Clone)]
pub struct Registry {
    functions: FxHashMap<Arc<str>, Invoker>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a unique name and return its tracked handle.
    pub fn track<A, R, F>(&mut self, name: &str, func: F) -> TrackedFunction<A, R>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.track_fallible(name, move |args| Ok::<_, std::convert::Infallible>(func(args)))
    }

    /// Register a function that may fail. Its error message is cached in place
    /// of a result.
    pub fn track_fallible<A, R, E, F>(&mut self, name: &str, func: F) -> TrackedFunction<A, R>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Display,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let name: Arc<str> = name.into();
        let invoker: Invoker = Arc::new(move |bytes: &[u8]| {
            let args: A = codec::decode(bytes).map_err(|err| err.to_string())?;
            let output = func(args).map_err(|err| err.to_string())?;
            codec::encode(&output).map_err(|err| err.to_string())
        });

        let conflict = self.functions.insert(name.clone(), invoker);
        debug_assert!(conflict.is_none(), "parmemo: `{name}` is registered twice");

        TrackedFunction::new(name)
    }

    /// Whether a function is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Execute a pending call and produce the record to cache for it.
    ///
    /// Unknown functions, undecodable arguments, returned errors and panics all
    /// become failure records.
    pub fn invoke(&self, call: &PendingCall) -> Record {
        let Some(invoker) = self.functions.get(&call.function) else {
            return Record::Failure(format!("unknown function `{}`", call.function));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| invoker(&call.args))) {
            Ok(Ok(bytes)) => Record::Value(bytes),
            Ok(Err(message)) => Record::Failure(message),
            Err(payload) => Record::Failure(format!("panicked: {}", panic_message(&*payload))),
        }
    }
}

/// Extract the message of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
