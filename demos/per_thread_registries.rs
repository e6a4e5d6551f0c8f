//! Example running one registry per thread.
//!
//! A registry and its tools live on a single thread. To use several cores,
//! build an independent registry inside each worker.
//!
//! Run with: cargo run --example per_thread_registries

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pybox::prelude::*;

const WORKERS: usize = 4;
const JOBS_PER_WORKER: usize = 5;

fn run_worker(worker: usize, tool_calls: &AtomicUsize) -> Result<Vec<i64>> {
    let config = SandboxConfig::builder().default_fuel(100_000).build();
    let mut registry = Registry::new(config)?;
    let tick = registry.register_tool("tick", move |_, _| {
        Ok(Transfer::Int(worker as i64))
    })?;
    registry.init_local("shared", None)?;
    registry.exec("shared", &tick.stub())?;
    registry.protect("shared", "tick")?;

    let mut results = Vec::with_capacity(JOBS_PER_WORKER);
    for job in 0..JOBS_PER_WORKER {
        let id = format!("job{job}");
        registry.init_local(&id, Some("shared"))?;
        let code = format!("sum(range({})) + tick()", (job + 1) * 10);
        let result = registry.exec(&id, &code)?;
        tool_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(Transfer::Int(n)) = result.value {
            results.push(n);
        }
        registry.destroy(&id, false)?;
    }
    Ok(results)
}

fn main() -> Result<()> {
    println!("=== Per-Thread Registries Example ===\n");

    let tool_calls = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let tool_calls = Arc::clone(&tool_calls);
            thread::spawn(move || run_worker(worker, &tool_calls))
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(results)) => println!("worker {worker}: {results:?}"),
            Ok(Err(e)) => eprintln!("worker {worker} failed: {e}"),
            Err(_) => eprintln!("worker {worker} panicked"),
        }
    }

    println!("\ntotal tool calls: {}", tool_calls.load(Ordering::Relaxed));
    Ok(())
}
