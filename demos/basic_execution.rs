//! Basic example of running code in isolated and nested contexts.
//!
//! Run with: cargo run --example basic_execution

use pybox::prelude::*;

fn main() -> Result<()> {
    let config = SandboxConfig::default();
    println!("Creating registry with config: {:?}", config);
    let mut registry = Registry::new(config)?;

    // Execute simple arithmetic
    println!("\n=== Test 1: Simple arithmetic ===");
    registry.init_local("main", None)?;
    let result = registry.exec("main", "print(1 + 1)\n40 + 2")?;
    println!("output: {}", result.output.trim_end());
    println!("value: {:?}", result.value);
    println!("display: {:?}", result.display);

    // Separate contexts share nothing
    println!("\n=== Test 2: Isolated contexts ===");
    registry.init_local("alice", None)?;
    registry.init_local("bob", None)?;
    registry.exec("alice", "secret = 'alice only'")?;
    let result = registry.exec("bob", "secret")?;
    if let Some(error) = result.error {
        println!("bob cannot see alice's names: {}", error);
    }

    // A child reads through to its parent but writes locally
    println!("\n=== Test 3: Parent fallthrough ===");
    registry.init_local("session", None)?;
    registry.exec("session", "def shout(s):\n    return s.upper() + '!'\nprefix = 'hi'")?;
    registry.init_local("task", Some("session"))?;
    let result = registry.exec("task", "prefix = 'bye'\nshout(prefix)")?;
    println!("task result: {:?}", result.value);
    println!("session still has prefix = {:?}", registry.fetch("session", "prefix")?);

    // Loop output
    println!("\n=== Test 4: Loop execution ===");
    let code = r#"
for i in range(5):
    print(f"Count: {i}")
"#;
    let result = registry.exec("main", code)?;
    println!("output:\n{}", result.output);

    // Tear down the session and its task
    println!("\n=== Test 5: Cascading destroy ===");
    let destroyed = registry.destroy("session", true)?;
    println!("destroyed: {:?}", destroyed);
    println!(
        "remaining: {:?}",
        registry.contexts().map(|c| c.id()).collect::<Vec<_>>()
    );

    Ok(())
}
