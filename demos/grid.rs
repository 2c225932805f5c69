//! Memoize a slow computation on a PBS grid, or on local threads when no
//! scheduler is around.
//!
//! The binary doubles as the grid worker: jobs re-invoke it with
//! `--parmemo-job <spec>`.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parmemo::backend::{Backend, LocalPool, Pbs};
use parmemo::{Environment, FsStore, Registry, TrackedFunction};
use tracing_subscriber::EnvFilter;

fn tracked() -> (Registry, TrackedFunction<u64, u64>) {
    let mut registry = Registry::new();
    let square = registry
        .track("slow-square", |x: u64| {
            thread::sleep(Duration::from_millis(200));
            x * x
        })
        .grouped_by(|&x: &u64| x % 4);
    (registry, square)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (registry, square) = tracked();
    if let Some(result) = parmemo::job::dispatch(&registry) {
        return match result {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                tracing::error!(%err, "grid job failed");
                ExitCode::FAILURE
            }
        };
    }

    match drive(registry, &square) {
        Ok(sum) => {
            println!("sum of squares: {sum}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn drive(registry: Registry, square: &TrackedFunction<u64, u64>) -> Result<u64, Box<dyn Error>> {
    let root = PathBuf::from("parmemo-grid");
    let store = Arc::new(FsStore::open(root.join("cache"))?);

    let pbs = Pbs::new();
    let backend: Arc<dyn Backend> = match pbs.probe() {
        Ok(()) => Arc::new(pbs.backend(root.join("jobs"), Duration::from_secs(10))?),
        Err(err) => {
            tracing::warn!(%err, "no grid scheduler, using local threads");
            Arc::new(LocalPool::new(0, Arc::new(registry)))
        }
    };

    let mut env = Environment::new(backend, store);
    let mut sum = 0;
    while env.run()? {
        sum = 0;
        for x in 0..16 {
            sum += square.call_or(&env, x, 0)?;
        }
    }

    Ok(sum)
}
