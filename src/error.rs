//! Error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// A specialized result type for parallelized environments.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to code running inside a parallelized environment.
#[derive(Debug, Error)]
pub enum Error {
    /// A tracked function was called while no pass was running.
    #[error("tracked function `{function}` called outside of a running pass")]
    Inactive {
        /// The name of the tracked function.
        function: String,
    },

    /// A tracked call failed on a backend and its failure is cached.
    #[error("call to `{function}` ({fingerprint}) failed: {message}")]
    Call {
        /// The name of the tracked function.
        function: String,
        /// The fingerprint of the failed call.
        fingerprint: Fingerprint,
        /// The failure message recorded by the worker.
        message: String,
    },

    /// A call was dispatched but is still missing from the cache afterwards.
    #[error("call to `{function}` ({fingerprint}) is still pending after its batch completed")]
    Unresolved {
        /// The name of the tracked function.
        function: String,
        /// The fingerprint of the unresolved call.
        fingerprint: Fingerprint,
    },

    /// The environment exceeded its configured pass limit.
    #[error("exceeded the maximum of {0} passes")]
    TooManyPasses(usize),

    /// The previous pass was interrupted while the backend was executing.
    #[error("environment was interrupted while awaiting its backend")]
    Interrupted,

    /// The arguments of a tracked call could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The backend failed to execute a batch.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failures to encode or decode cached data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bincode rejected a value.
    #[error("binary encoding failed: {0}")]
    Binary(#[from] bincode::Error),

    /// A job specification could not be read or written.
    #[error("job specification is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of a persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing an entry failed.
    #[error("cache entry {path:?} is inaccessible: {source}")]
    Io {
        /// The path of the entry.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The store directory exists but is not a directory.
    #[error("cache path {0:?} exists and is not a directory")]
    NotADirectory(PathBuf),
}

/// Failures to run a batch on a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The cache could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A local worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// The interactive cluster failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The grid backend failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Failures of an interactive cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The controller could not be reached.
    #[error("cluster controller is unreachable: {0}")]
    Unreachable(String),

    /// The controller is reachable but has no engines registered.
    #[error("cluster has no engines")]
    NoEngines,

    /// An engine failed to cache a result.
    #[error("engine failed: {0}")]
    Engine(String),

    /// The controller dropped a map before it completed.
    #[error("cluster lost {0} task(s) of a map")]
    Lost(usize),
}

/// Failures of the grid backend.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The work directory could not be prepared or written.
    #[error("work directory {path:?} is unusable: {source}")]
    WorkDir {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The work path exists but is not a directory.
    #[error("work path {0:?} exists and is not a directory")]
    NotADirectory(PathBuf),

    /// The worker program for grid jobs could not be determined.
    #[error("cannot determine the worker program: {0}")]
    NoWorker(#[source] io::Error),

    /// The store cannot be reached from grid jobs.
    #[error("the cache cannot be shared with grid jobs")]
    StoreNotShareable,

    /// A job specification could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The scheduler kept failing.
    #[error("scheduler failed after {attempts} attempt(s): {source}")]
    Scheduler {
        /// How often the operation was tried.
        attempts: u32,
        /// The last error.
        #[source]
        source: SchedulerError,
    },

    /// Jobs did not complete within the poll limit.
    #[error("{} job(s) still running after {polls} polls", .jobs.len())]
    TimedOut {
        /// The number of polls performed.
        polls: u32,
        /// The jobs that never reported completion.
        jobs: Vec<String>,
    },

    /// Jobs completed without writing their results.
    #[error("{} result(s) missing after completion, see job logs in {work_dir:?}", .missing.len())]
    MissingResults {
        /// The work directory holding the job logs.
        work_dir: PathBuf,
        /// The fingerprints without a cached result.
        missing: Vec<Fingerprint>,
    },

    /// Reading the store failed while verifying results.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the external scheduler primitives.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler command could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// The command.
        command: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The scheduler command exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    Status {
        /// The command.
        command: String,
        /// The exit status.
        status: std::process::ExitStatus,
        /// Captured standard error.
        stderr: String,
    },

    /// Any other failure reported by a custom primitive.
    #[error("{0}")]
    Other(String),
}

/// Failures of a grid job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job flag was given without a specification path.
    #[error("missing job specification path after `{0}`")]
    MissingSpec(&'static str),

    /// The specification could not be read.
    #[error("cannot read job specification {path:?}: {source}")]
    Read {
        /// The specification path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The specification is malformed.
    #[error(transparent)]
    Spec(#[from] CodecError),

    /// The store named by the specification is unavailable.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A result could not be cached.
    #[error(transparent)]
    Execute(#[from] BackendError),
}
