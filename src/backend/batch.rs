use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustc_hash::FxHashMap;

use super::Backend;
use crate::codec::Record;
use crate::error::{BackendError, BatchError, SchedulerError};
use crate::fingerprint::Fingerprint;
use crate::job::{JOB_FLAG, JobSpec};
use crate::pending::PendingCall;
use crate::store::{Locator, Store};

/// The identifier a scheduler assigns to a submitted job.
pub type JobId = String;

/// Submits a job to the scheduler.
type Submit = Box<dyn Fn(&JobScript) -> Result<JobId, SchedulerError> + Send + Sync>;

/// Checks whether a job has completed.
type Monitor = Box<dyn Fn(&str) -> Result<bool, SchedulerError> + Send + Sync>;

/// A job written to the work directory and ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    /// The directory the job runs in.
    pub work_dir: PathBuf,
    /// The executable shell script to submit.
    pub script: PathBuf,
    /// The job specification the script passes to the worker.
    pub spec: PathBuf,
    /// Where the worker's standard output goes.
    pub stdout: PathBuf,
    /// Where the worker's standard error goes.
    pub stderr: PathBuf,
}

/// Polling and retry behavior of a [`BatchBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// The time between two checks of the outstanding jobs.
    pub poll_interval: Duration,
    /// Give up after this many polls. `None` waits forever.
    pub max_polls: Option<u32>,
    /// How often a failing submit or monitor call is retried before the
    /// batch fails.
    pub max_retries: u32,
    /// The pause before the first retry. It doubles with every further
    /// attempt.
    pub retry_delay: Duration,
}

impl BatchConfig {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the number of polls.
    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.max_polls = Some(polls);
        self
    }

    /// Set the number of retries of scheduler operations.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the pause before the first retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The pause after the given number of failed attempts.
    fn backoff(&self, attempts: u32) -> Duration {
        self.retry_delay.saturating_mul(1 << attempts.saturating_sub(1).min(10))
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_polls: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Executes batches as jobs of an external grid scheduler.
///
/// Every job is a self-contained script that re-invokes a worker program (by
/// default the current executable) with [`JOB_FLAG`]; the worker writes the
/// results straight into the shared store. This backend only submits the jobs
/// and polls until the scheduler reports all of them as completed.
pub struct BatchBackend {
    work_dir: PathBuf,
    submit: Submit,
    monitor: Monitor,
    config: BatchConfig,
    worker: PathBuf,
}

impl BatchBackend {
    /// Create a backend keeping job files in `work_dir`.
    ///
    /// The directory is created if it does not exist and made absolute, so
    /// that the job scripts work from any working directory.
    pub fn new<S, M>(
        work_dir: impl Into<PathBuf>,
        submit: S,
        monitor: M,
        poll_interval: Duration,
    ) -> Result<Self, BatchError>
    where
        S: Fn(&JobScript) -> Result<JobId, SchedulerError> + Send + Sync + 'static,
        M: Fn(&str) -> Result<bool, SchedulerError> + Send + Sync + 'static,
    {
        let path = work_dir.into();
        if path.exists() {
            if !path.is_dir() {
                return Err(BatchError::NotADirectory(path));
            }
        } else {
            fs::create_dir_all(&path)
                .map_err(|source| BatchError::WorkDir { path: path.clone(), source })?;
        }

        let work_dir = fs::canonicalize(&path)
            .map_err(|source| BatchError::WorkDir { path, source })?;

        let worker = std::env::current_exe().map_err(BatchError::NoWorker)?;

        Ok(Self {
            work_dir,
            submit: Box::new(submit),
            monitor: Box::new(monitor),
            config: BatchConfig::default().with_poll_interval(poll_interval),
            worker,
        })
    }

    /// Replace the polling and retry configuration.
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Run jobs with another worker program.
    pub fn with_worker(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker = program.into();
        self
    }

    /// The directory holding job files and logs.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The polling and retry configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Write the files of a job: its specification and its script.
    fn prepare(&self, locator: &Locator, calls: Vec<PendingCall>) -> Result<JobScript, BatchError> {
        // Fingerprints are unique within a batch, so the first one names the job.
        let name = calls.first().map(|call| call.fingerprint.to_string()).unwrap_or_default();
        let job = JobScript {
            work_dir: self.work_dir.clone(),
            script: self.work_dir.join(format!("{name}.sh")),
            spec: self.work_dir.join(format!("{name}.json")),
            stdout: self.work_dir.join(format!("{name}.out")),
            stderr: self.work_dir.join(format!("{name}.err")),
        };

        let spec = JobSpec { store: locator.clone(), calls };
        self.write(&job.spec, spec.to_json()?)?;
        self.write(&job.script, self.script(&job))?;
        make_executable(&job.script)
            .map_err(|source| BatchError::WorkDir { path: job.script.clone(), source })?;

        Ok(job)
    }

    /// Render the shell script of a job.
    fn script(&self, job: &JobScript) -> String {
        format!(
            "#!/bin/sh\nexec {} {} {} >{} 2>{}\n",
            quote(&self.worker),
            JOB_FLAG,
            quote(&job.spec),
            quote(&job.stdout),
            quote(&job.stderr),
        )
    }

    fn write(&self, path: &Path, contents: String) -> Result<(), BatchError> {
        fs::write(path, contents)
            .map_err(|source| BatchError::WorkDir { path: path.into(), source })
    }

    /// Call a scheduler operation, retrying failures.
    fn retry<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T, SchedulerError>,
    ) -> Result<T, BatchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match f() {
                Ok(value) => return Ok(value),
                Err(source) if attempts > self.config.max_retries => {
                    return Err(BatchError::Scheduler { attempts, source });
                }
                Err(err) => {
                    let delay = self.config.backoff(attempts);
                    tracing::warn!(%err, attempts, ?delay, "{what} failed, retrying");
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Poll until every job has completed.
    fn await_jobs(&self, mut unfinished: Vec<JobId>) -> Result<(), BatchError> {
        let mut polls = 0;
        while !unfinished.is_empty() {
            if self.config.max_polls.is_some_and(|max| polls >= max) {
                return Err(BatchError::TimedOut { polls, jobs: unfinished });
            }

            thread::sleep(self.config.poll_interval);
            polls += 1;

            let mut still = Vec::with_capacity(unfinished.len());
            for id in unfinished {
                if !self.retry("monitor", || (self.monitor)(id.as_str()))? {
                    still.push(id);
                }
            }

            tracing::debug!(polls, remaining = still.len(), "polled grid jobs");
            unfinished = still;
        }
        Ok(())
    }
}

impl Backend for BatchBackend {
    fn name(&self) -> &str {
        "batch"
    }

    fn execute(&self, batch: &[PendingCall], store: &Arc<dyn Store>) -> Result<(), BackendError> {
        let locator = store.locator().ok_or(BatchError::StoreNotShareable)?;

        let mut ids = Vec::new();
        for calls in group(batch) {
            let job = self.prepare(&locator, calls)?;
            let id = self.retry("submit", || (self.submit)(&job))?;
            tracing::debug!(job = %id, script = ?job.script, "submitted grid job");
            ids.push(id);
        }

        tracing::info!(jobs = ids.len(), "waiting for grid jobs");
        self.await_jobs(ids)?;

        // Jobs that crashed or were killed still count as completed.
        let mut missing = vec![];
        for call in batch {
            if !is_cached(store.as_ref(), call.fingerprint)? {
                missing.push(call.fingerprint);
            }
        }

        if !missing.is_empty() {
            return Err(BatchError::MissingResults { work_dir: self.work_dir.clone(), missing }.into());
        }

        Ok(())
    }
}

/// Split a batch into jobs. Calls sharing a group form one job, the others
/// get a job of their own. Jobs are ordered by their first call.
fn group(batch: &[PendingCall]) -> Vec<Vec<PendingCall>> {
    let mut jobs: Vec<Vec<PendingCall>> = vec![];
    let mut groups = FxHashMap::default();
    for call in batch {
        match call.group {
            Some(key) => {
                let index = *groups.entry(key).or_insert_with(|| {
                    jobs.push(vec![]);
                    jobs.len() - 1
                });
                jobs[index].push(call.clone());
            }
            None => jobs.push(vec![call.clone()]),
        }
    }
    jobs
}

fn is_cached(store: &dyn Store, fingerprint: Fingerprint) -> Result<bool, BatchError> {
    Ok(store
        .get(fingerprint)?
        .is_some_and(|bytes| Record::from_bytes(&bytes).is_ok()))
}

/// Quote a path for a POSIX shell.
fn quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::store::{FsStore, MemoryStore};

    fn call(n: u8, group: Option<u64>) -> PendingCall {
        PendingCall {
            fingerprint: Fingerprint::of("f", &[n]),
            function: "f".into(),
            args: vec![n],
            group,
            stale: false,
        }
    }

    fn never(_: &JobScript) -> Result<JobId, SchedulerError> {
        Err(SchedulerError::Other("scheduler is down".into()))
    }

    #[test]
    fn test_grouping() {
        let batch = [call(0, Some(1)), call(1, None), call(2, Some(1)), call(3, Some(2))];
        let jobs = group(&batch);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0], vec![batch[0].clone(), batch[2].clone()]);
        assert_eq!(jobs[1], vec![batch[1].clone()]);
        assert_eq!(jobs[2], vec![batch[3].clone()]);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(Path::new("/a b/c")), "'/a b/c'");
        assert_eq!(quote(Path::new("it's")), r"'it'\''s'");
    }

    #[test]
    fn test_work_dir_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = BatchBackend::new(file.path(), never, |_| Ok(true), Duration::ZERO);
        assert!(matches!(result, Err(BatchError::NotADirectory(_))));

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        BatchBackend::new(&nested, never, |_| Ok(true), Duration::ZERO).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_memory_store_is_not_shareable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BatchBackend::new(dir.path(), never, |_| Ok(true), Duration::ZERO).unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(matches!(
            backend.execute(&[call(0, None)], &store),
            Err(BackendError::Batch(BatchError::StoreNotShareable))
        ));
    }

    #[test]
    fn test_submit_is_retried_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FsStore::open(dir.path().join("cache")).unwrap());
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        let submit = move |job: &JobScript| -> Result<JobId, SchedulerError> {
            *counter.lock() += 1;
            never(job)
        };

        let backend = BatchBackend::new(dir.path().join("work"), submit, |_| Ok(true), Duration::ZERO)
            .unwrap()
            .with_config(
                BatchConfig::default()
                    .with_max_retries(2)
                    .with_retry_delay(Duration::ZERO),
            );

        let err = backend.execute(&[call(0, None)], &store).unwrap_err();
        assert!(matches!(err, BackendError::Batch(BatchError::Scheduler { attempts: 3, .. })));
        assert_eq!(*attempts.lock(), 3);
    }

    #[test]
    fn test_submit_recovers_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FsStore::open(dir.path().join("cache")).unwrap());
        let attempts = Arc::new(Mutex::new(vec![]));
        let log = attempts.clone();
        let submit = move |job: &JobScript| -> Result<JobId, SchedulerError> {
            let mut attempts = log.lock();
            attempts.push(Instant::now());
            match attempts.len() {
                1 | 2 => never(job),
                _ => Ok("17.grid".to_string()),
            }
        };

        let backend = BatchBackend::new(dir.path().join("work"), submit, |_| Ok(true), Duration::ZERO)
            .unwrap()
            .with_config(
                BatchConfig::default()
                    .with_poll_interval(Duration::ZERO)
                    .with_retry_delay(Duration::from_millis(20)),
            );

        // The submission goes through. Nothing ran, so the results are missing.
        let err = backend.execute(&[call(0, None)], &store).unwrap_err();
        assert!(matches!(err, BackendError::Batch(BatchError::MissingResults { .. })));

        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 3);
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(20));
        assert!(attempts[2] - attempts[1] >= Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = BatchConfig::default().with_retry_delay(Duration::from_millis(5));
        assert_eq!(config.backoff(1), Duration::from_millis(5));
        assert_eq!(config.backoff(2), Duration::from_millis(10));
        assert_eq!(config.backoff(4), Duration::from_millis(40));
        assert_eq!(config.backoff(100), Duration::from_millis(5 << 10));
    }

    #[test]
    fn test_lost_jobs_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FsStore::open(dir.path().join("cache")).unwrap());
        let backend = BatchBackend::new(
            dir.path().join("work"),
            |_: &JobScript| Ok("lost.1".to_string()),
            |_| Ok(false),
            Duration::from_millis(1),
        )
        .unwrap()
        .with_config(
            BatchConfig::default()
                .with_poll_interval(Duration::from_millis(1))
                .with_max_polls(3),
        );

        match backend.execute(&[call(0, None)], &store) {
            Err(BackendError::Batch(BatchError::TimedOut { polls, jobs })) => {
                assert_eq!(polls, 3);
                assert_eq!(jobs, vec!["lost.1".to_string()]);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_completed_jobs_without_results() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FsStore::open(dir.path().join("cache")).unwrap());
        let submitted = Arc::new(Mutex::new(vec![]));
        let log = submitted.clone();
        let backend = BatchBackend::new(
            dir.path().join("work"),
            move |job: &JobScript| {
                log.lock().push(job.clone());
                Ok("crashed.1".to_string())
            },
            |_| Ok(true),
            Duration::ZERO,
        )
        .unwrap()
        .with_worker("/opt/worker");

        let batch = [call(7, None)];
        let err = backend.execute(&batch, &store).unwrap_err();
        assert!(matches!(
            err,
            BackendError::Batch(BatchError::MissingResults { ref missing, .. })
                if *missing == vec![batch[0].fingerprint]
        ));

        let jobs = submitted.lock();
        assert_eq!(jobs.len(), 1);
        let script = fs::read_to_string(&jobs[0].script).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("'/opt/worker' --parmemo-job"));
        assert!(script.contains(&format!("{}.json", batch[0].fingerprint)));

        let spec = JobSpec::read(&jobs[0].spec).unwrap();
        assert_eq!(spec.calls, batch);
        assert_eq!(spec.store, store.locator().unwrap());
    }
}
