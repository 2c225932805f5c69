//! Grid jobs.
//!
//! A grid job runs in a separate process, possibly on another machine and
//! possibly much later than it was submitted. It receives its calls through a
//! [`JobSpec`] file and delivers results only through the shared store.
//!
//! Binaries that drive a [`BatchBackend`](crate::backend::BatchBackend) must
//! also act as the job worker. They do so by calling [`dispatch`] before
//! anything else:
//!
//! ```ignore
//! fn main() {
//!     let registry = build_registry();
//!     if let Some(result) = parmemo::job::dispatch(&registry) {
//!         std::process::exit(if result.is_ok() { 0 } else { 1 });
//!     }
//!     // ... drive the environment ...
//! }
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::execute_call;
use crate::error::{CodecError, JobError};
use crate::pending::PendingCall;
use crate::registry::Registry;
use crate::store::Locator;

/// The command line flag that turns a process into a grid job worker.
pub const JOB_FLAG: &str = "--parmemo-job";

/// Everything a grid job needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Where to cache results.
    pub store: Locator,
    /// The calls to execute, in order.
    pub calls: Vec<PendingCall>,
}

impl JobSpec {
    /// Serialize the specification.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a specification from a file.
    pub fn read(path: &Path) -> Result<Self, JobError> {
        let text = fs::read_to_string(path)
            .map_err(|source| JobError::Read { path: path.into(), source })?;
        Ok(serde_json::from_str(&text).map_err(CodecError::from)?)
    }
}

/// Execute the job described by the specification at `path`.
///
/// Returns the number of calls in the job.
pub fn run(path: &Path, registry: &Registry) -> Result<usize, JobError> {
    let spec = JobSpec::read(path)?;
    let store = spec.store.open()?;

    tracing::info!(calls = spec.calls.len(), spec = ?path, "running grid job");
    for call in &spec.calls {
        execute_call(registry, store.as_ref(), call)?;
    }

    Ok(spec.calls.len())
}

/// Run a grid job if this process was started as one.
///
/// Returns `None` if the command line does not start with [`JOB_FLAG`].
pub fn dispatch(registry: &Registry) -> Option<Result<usize, JobError>> {
    dispatch_args(std::env::args_os().skip(1), registry)
}

/// Like [`dispatch`], but for explicit arguments (without the program name).
pub fn dispatch_args<I>(args: I, registry: &Registry) -> Option<Result<usize, JobError>>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    if args.next()? != JOB_FLAG {
        return None;
    }

    Some(match args.next() {
        Some(path) => run(&PathBuf::from(path), registry),
        None => Err(JobError::MissingSpec(JOB_FLAG)),
    })
}
