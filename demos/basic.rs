//! Memoize a few additions on a local thread pool.
//!
//! Run with `RUST_LOG=debug cargo run --example basic` to watch the passes.

use std::sync::Arc;

use parmemo::backend::LocalPool;
use parmemo::{Environment, MemoryStore, Registry};
use tracing_subscriber::EnvFilter;

fn main() -> parmemo::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut registry = Registry::new();
    let add = registry.track("add", |(a, b): (i64, i64)| a + b);

    let pool = Arc::new(LocalPool::new(0, Arc::new(registry)));
    let mut env = Environment::new(pool, Arc::new(MemoryStore::new()));

    let (mut x, mut y, mut z) = (None, None, None);
    while env.run()? {
        x = add.call(&env, (1, 2))?;
        y = add.call(&env, (3, 4))?;
        z = add.call(&env, (5, 6))?;
    }

    println!("x = {x:?}, y = {y:?}, z = {z:?} after {} passes", env.passes());
    Ok(())
}
