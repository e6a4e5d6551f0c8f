//! Example demonstrating error handling patterns.
//!
//! This example shows how to handle various types of errors:
//! - Exceptions raised by sandboxed code
//! - Protection violations
//! - Errors raised and aborts signalled by tools
//! - Host-side registry errors
//!
//! Run with: cargo run --example error_handling

use pybox::prelude::*;
use pybox::ErrorKind;

fn report(label: &str, result: &ExecResult) {
    match &result.error {
        None => println!("{label}: ok, value = {:?}", result.value),
        Some(error) => {
            println!("{label}: {error}");
            println!("  kind: {:?}, catchable: {}", error.kind, error.is_catchable());
            if let Some(tb) = &error.traceback {
                println!("  traceback: {} lines", tb.lines().count());
            }
        }
    }
}

fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let mut registry = Registry::new(SandboxConfig::default())?;
    registry.init_local("main", None)?;

    // Example 1: ValueError
    println!("--- Test 1: ValueError ---");
    let result = registry.exec("main", "int('not a number')")?;
    report("int()", &result);
    println!();

    // Example 2: Errors in nested calls keep earlier writes
    println!("--- Test 2: Traceback and partial writes ---");
    let code = r#"
done = 'first step'
def divide(a, b):
    return a / b
divide(1, 0)
"#;
    let result = registry.exec("main", code)?;
    report("divide", &result);
    if let Some(tb) = result.error.as_ref().and_then(|e| e.traceback.as_deref()) {
        println!("{tb}");
    }
    println!("done = {:?}", registry.fetch("main", "done")?);
    println!();

    // Example 3: Protected names
    println!("--- Test 3: Protection violations ---");
    registry.assign("main", "api_key", "k-123")?;
    registry.protect("main", "api_key")?;
    report("rebind", &registry.exec("main", "api_key = 'stolen'")?);
    let code = r#"
try:
    del api_key
except ProtectionViolation as e:
    print('caught:', e)
"#;
    let result = registry.exec("main", code)?;
    print!("{}", result.output);
    println!();

    // Example 4: Tool errors
    println!("--- Test 4: Tool errors ---");
    let parse = registry.register_tool("parse_port", |_, call| {
        let text = call.str_arg(0)?;
        text.parse::<i64>()
            .map(Transfer::Int)
            .map_err(|e| ToolError::raise("ValueError", format!("bad port {text:?}: {e}")))
    })?;
    let shutdown = registry.register_tool("shutdown", |session, _| {
        // Running code in a missing context aborts the whole call tree.
        session.exec("does_not_exist", "pass")?;
        Ok(Transfer::None)
    })?;
    registry.exec("main", &parse.stub())?;
    registry.exec("main", &shutdown.stub())?;

    report("parse_port('80')", &registry.exec("main", "parse_port('80')")?);
    report("parse_port('http')", &registry.exec("main", "parse_port('http')")?);
    let result = registry.exec("main", "try:\n    shutdown()\nexcept Exception:\n    pass")?;
    report("shutdown()", &result);
    assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Host));
    println!();

    // Example 5: Host-side errors
    println!("--- Test 5: Registry errors ---");
    let errors = [
        registry.init_local("main", None).unwrap_err(),
        registry.init_local("orphan", Some("nobody")).unwrap_err(),
        registry.exec("ghost", "1").unwrap_err(),
        registry.assign("main", "not a name", 1i64).unwrap_err(),
    ];
    for error in errors {
        println!("{error}");
    }

    println!("\n=== Error Handling Example Complete ===");
    Ok(())
}
