//! Example demonstrating resource limiting capabilities.
//!
//! This example shows how to configure and handle:
//! - Step budgets (fuel) for long-running code
//! - Fuel shared between a caller and the execs its tools start
//! - Collection size, recursion depth and output limits
//!
//! Run with: cargo run --example resource_limits

use pybox::prelude::*;

fn main() -> Result<()> {
    println!("=== Resource Limits Example ===\n");

    // Example 1: Fuel
    println!("--- Test 1: Fuel Exhaustion ---");
    {
        let mut registry = Registry::new(SandboxConfig::default())?;
        registry.init_local("main", None)?;

        let result = registry.exec_with_fuel("main", "n = 0\nwhile True:\n    n += 1", 10_000)?;
        println!(
            "fuel exhausted: {}, consumed: {:?}, n reached {:?}",
            result.is_fuel_exhausted(),
            result.fuel_consumed,
            registry.fetch("main", "n")?
        );

        let result = registry.exec_with_fuel("main", "sum(range(100))", 10_000)?;
        println!("small job: {:?} using {:?} steps", result.value, result.fuel_consumed);
    }
    println!();

    // Example 2: Default fuel and nested budgets
    println!("--- Test 2: Nested Budgets ---");
    {
        let config = SandboxConfig::builder().default_fuel(5_000).build();
        let mut registry = Registry::new(config)?;
        registry.init_local("agent", None)?;
        registry.init_local("worker", None)?;
        let delegate = registry.register_tool("delegate", |session, call| {
            let code = call.str_arg(0)?.to_string();
            // Capped by what the caller has left.
            let result = session.exec_with_fuel("worker", &code, 1_000_000)?;
            Ok(Transfer::from(result.fuel_consumed.map(|n| n as i64)))
        })?;
        registry.exec("agent", &delegate.stub())?;

        let result = registry.exec("agent", "used = delegate('while True:\\n    pass')\nafter = 1")?;
        println!(
            "outer fuel exhausted: {}, consumed: {:?}",
            result.is_fuel_exhausted(),
            result.fuel_consumed
        );
    }
    println!();

    // Example 3: Collection limits
    println!("--- Test 3: Collection Limits ---");
    {
        let config = SandboxConfig::builder().max_collection_len(100_000).build();
        let mut registry = Registry::new(config)?;
        registry.init_local("main", None)?;
        let result = registry.exec("main", "big = [0] * 10_000_000")?;
        if let Some(error) = result.error {
            println!("refused: {error}");
        }
    }
    println!();

    // Example 4: Recursion depth
    println!("--- Test 4: Recursion Depth ---");
    {
        let config = SandboxConfig::builder().max_recursion_depth(30).build();
        let mut registry = Registry::new(config)?;
        registry.init_local("main", None)?;
        let code = "def fact(n):\n    return 1 if n <= 1 else n * fact(n - 1)\nfact(50)";
        let result = registry.exec("main", code)?;
        if let Some(error) = result.error {
            println!("stopped: {error}");
        }
    }
    println!();

    // Example 5: Output limits
    println!("--- Test 5: Output Limits ---");
    {
        let config = SandboxConfig::builder().max_output_bytes(80).build();
        let mut registry = Registry::new(config)?;
        registry.init_local("main", None)?;
        let result = registry.exec("main", "for i in range(100):\n    print('line', i)")?;
        println!("{} bytes captured:\n{}", result.output.len(), result.output);
    }

    println!("\n=== Resource Limits Example Complete ===");
    Ok(())
}
