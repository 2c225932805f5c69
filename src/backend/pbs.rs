use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use super::batch::{BatchBackend, JobId, JobScript};
use crate::error::{BatchError, SchedulerError};

/// Submission and monitoring through the commands of a portable batch system
/// (`qsub` and `qstat`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pbs {
    qsub: PathBuf,
    qstat: PathBuf,
}

impl Pbs {
    /// Use `qsub` and `qstat` from the `PATH`.
    pub fn new() -> Self {
        Self::with_commands("qsub", "qstat")
    }

    /// Use other submission and status commands.
    pub fn with_commands(qsub: impl Into<PathBuf>, qstat: impl Into<PathBuf>) -> Self {
        Self { qsub: qsub.into(), qstat: qstat.into() }
    }

    /// Check that the scheduler answers.
    pub fn probe(&self) -> Result<(), SchedulerError> {
        let output = run(Command::new(&self.qstat), &self.qstat)?;
        check(&output, &self.qstat)
    }

    /// Submit a job script, returning the job id printed by `qsub`.
    pub fn submit(&self, job: &JobScript) -> Result<JobId, SchedulerError> {
        let mut command = Command::new(&self.qsub);
        command.arg(&job.script).current_dir(&job.work_dir);
        let output = run(command, &self.qsub)?;
        check(&output, &self.qsub)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether a job has left the queue.
    ///
    /// `qstat` succeeds for jobs that are queued or running and fails for
    /// unknown ones, so a failure is taken to mean that the job finished.
    /// Whether it finished successfully is only visible in the cache.
    pub fn monitor(&self, id: &str) -> Result<bool, SchedulerError> {
        let mut command = Command::new(&self.qstat);
        command.arg(id);
        Ok(!run(command, &self.qstat)?.status.success())
    }

    /// Create a grid backend submitting through this scheduler.
    pub fn backend(
        self,
        work_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Result<BatchBackend, BatchError> {
        let monitor = self.clone();
        BatchBackend::new(
            work_dir,
            move |job: &JobScript| self.submit(job),
            move |id: &str| monitor.monitor(id),
            poll_interval,
        )
    }
}

impl Default for Pbs {
    fn default() -> Self {
        Self::new()
    }
}

fn run(mut command: Command, program: &Path) -> Result<Output, SchedulerError> {
    command.output().map_err(|source| SchedulerError::Spawn {
        command: program.display().to_string(),
        source,
    })
}

fn check(output: &Output, program: &Path) -> Result<(), SchedulerError> {
    if output.status.success() {
        return Ok(());
    }

    Err(SchedulerError::Status {
        command: program.display().to_string(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_pbs_commands() {
        let dir = tempfile::tempdir().unwrap();
        let qsub = script(dir.path(), "qsub", r#"test -f "$1" && echo "17.grid""#);
        let qstat = script(
            dir.path(),
            "qstat",
            r#"case "$1" in ""|17.grid) exit 0;; *) echo "unknown job" >&2; exit 153;; esac"#,
        );

        let pbs = Pbs::with_commands(&qsub, &qstat);
        pbs.probe().unwrap();

        let job = JobScript {
            work_dir: dir.path().into(),
            script: qsub.clone(),
            spec: dir.path().join("job.json"),
            stdout: dir.path().join("job.out"),
            stderr: dir.path().join("job.err"),
        };
        assert_eq!(pbs.submit(&job).unwrap(), "17.grid");
        assert!(!pbs.monitor("17.grid").unwrap());
        assert!(pbs.monitor("18.grid").unwrap());

        let missing = Pbs::with_commands(dir.path().join("nope"), dir.path().join("nope"));
        assert!(matches!(missing.probe(), Err(SchedulerError::Spawn { .. })));

        let failing = Pbs::with_commands(&qstat, &qsub);
        assert!(matches!(failing.probe(), Err(SchedulerError::Status { .. })));
    }
}
