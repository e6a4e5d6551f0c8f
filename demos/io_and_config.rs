//! Example demonstrating configuration, tools and persistence.
//!
//! This example shows how to:
//! - Build a configuration and enable structured logging
//! - Declare tools with signatures and docstrings
//! - Move data in and out of a context
//! - Persist a context with snapshots and roll the instance back
//!
//! Run with: RUST_LOG=pybox=debug cargo run --example io_and_config

use pybox::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== I/O and Configuration Example ===\n");

    let config = SandboxConfig::builder()
        .max_call_depth(8)
        .default_fuel(1_000_000)
        .max_output_bytes(64 * 1024)
        .build();
    let mut registry = Registry::new(config)?;
    registry.init_local("agent", None)?;

    // Example 1: Declared tools
    println!("--- Test 1: Declared Tools ---");
    {
        let def = ToolDef::new("weather")
            .params(["city", "unit='C'"])
            .doc("Current temperature for a city.");
        let weather = registry.register_tool_def(def, |_, call| {
            let city = call.str_arg(0)?;
            let unit = call.get(1, "unit").and_then(Transfer::as_str).unwrap_or("C");
            let temp = if unit == "F" { 68 } else { 20 };
            Ok(Transfer::from(format!("{city}: {temp}°{unit}")))
        })?;
        println!("Declaration shown to the model:\n{}", weather.decl());
        registry.exec("agent", &weather.stub())?;
        registry.protect("agent", "weather")?;

        let result = registry.exec("agent", "print(weather('Oslo'))\nweather('Austin', unit='F')")?;
        print!("{}", result.output);
        println!("value: {:?}", result.value);
    }
    println!();

    // Example 2: Host data in and out
    println!("--- Test 2: Assign and Fetch ---");
    {
        let rows = Transfer::from(vec![
            Transfer::from(vec![Transfer::from("apples"), Transfer::Int(3)]),
            Transfer::from(vec![Transfer::from("pears"), Transfer::Int(5)]),
        ]);
        registry.assign("agent", "rows", rows)?;
        registry.exec("agent", "total = sum([row[1] for row in rows])")?;
        println!("total = {:?}", registry.fetch("agent", "total")?);
    }
    println!();

    // Example 3: Snapshots
    println!("--- Test 3: Snapshots ---");
    {
        let snapshot = registry.snapshot("agent")?;
        let bytes = snapshot.to_bytes()?;
        println!(
            "snapshot of '{}' is {} bytes, {} names kept by reference",
            snapshot.context_id(),
            bytes.len(),
            snapshot.retained_names().count()
        );

        registry.exec("agent", "total = -1")?;
        registry.restore(&Snapshot::from_bytes(&bytes)?)?;
        println!("restored total = {:?}", registry.fetch("agent", "total")?);
    }
    println!();

    // Example 4: Checkpoints
    println!("--- Test 4: Checkpoint and Rollback ---");
    {
        let checkpoint = registry.checkpoint()?;
        registry.init_local("scratch", Some("agent"))?;
        registry.exec("scratch", "notes = ['temporary']")?;
        registry.exec("agent", "total = 0")?;

        registry.rollback(&checkpoint)?;
        println!(
            "contexts after rollback: {:?}",
            registry.contexts().map(|c| c.id()).collect::<Vec<_>>()
        );
        println!("total = {:?}", registry.fetch("agent", "total")?);
    }

    println!("\n=== I/O and Configuration Example Complete ===");
    Ok(())
}
