//! Tool bindings, the dispatch bridge and nested execution.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pretty_assertions::assert_eq;
use pybox::prelude::*;
use pybox::ErrorKind;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Registry {
    init_tracing();
    Registry::new(SandboxConfig::default()).unwrap()
}

/// A registry with a `greet` tool installed and protected in context `agent`.
fn greeter() -> Registry {
    let mut reg = registry();
    let greet = reg
        .register_tool("greet", |_, call| {
            let name = call.str_arg(0)?;
            Ok(Transfer::from(format!("Hello {name}")))
        })
        .unwrap();
    reg.init_local("agent", None).unwrap();
    reg.exec("agent", &greet.stub()).unwrap();
    reg.protect("agent", "greet").unwrap();
    reg
}

#[test]
fn test_tool_call_returns_host_value() {
    let mut reg = greeter();
    let result = reg.exec("agent", "greet('world')").unwrap();
    assert!(result.is_success());
    assert_eq!(result.value, Some(Transfer::from("Hello world")));
}

#[test]
fn test_protected_tool_cannot_be_replaced() {
    let mut reg = greeter();
    let result = reg.exec("agent", "def greet(name):\n    return 'pwned'").unwrap();
    assert!(result.is_protection_violation());

    let result = reg.exec("agent", "greet('again')").unwrap();
    assert_eq!(result.value, Some(Transfer::from("Hello again")));
}

#[test]
fn test_duplicate_tool_is_rejected() {
    let mut reg = greeter();
    let err = reg
        .register_tool("greet", |_, _| Ok(Transfer::None))
        .unwrap_err();
    assert!(matches!(err, SandboxError::DuplicateBinding(name) if name == "greet"));
}

#[test]
fn test_tools_belong_to_one_registry() {
    let reg = greeter();
    let stub = reg.tool("greet").unwrap().stub();

    let mut other = registry();
    other.init_local("agent", None).unwrap();
    other.exec("agent", &stub).unwrap();
    let error = other.exec("agent", "greet('x')").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "NameError");
    assert_eq!(error.message, "tool 'greet' is not registered");
}

#[test]
fn test_raised_tool_error_is_catchable() {
    let mut reg = greeter();
    let code = "\
try:
    greet(42)
except TypeError as e:
    caught = str(e)
caught";
    let result = reg.exec("agent", code).unwrap();
    assert_eq!(
        result.value,
        Some(Transfer::from("greet() argument 1 must be str"))
    );
}

#[test]
fn test_custom_exception_type_from_tool() {
    let mut reg = registry();
    let lookup = reg
        .register_tool("lookup", |_, call| {
            Err(ToolError::raise("KeyError", format!("{:?}", call.arg(0))))
        })
        .unwrap();
    reg.init_local("a", None).unwrap();
    reg.exec("a", &lookup.stub()).unwrap();
    let error = reg.exec("a", "lookup('k')").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "KeyError");
    assert_eq!(error.kind, ErrorKind::Execution);
}

#[test]
fn test_abort_unwinds_past_except() {
    let mut reg = registry();
    let fail = reg
        .register_tool("fail", |session, _| {
            session.exec("missing", "1")?;
            Ok(Transfer::None)
        })
        .unwrap();
    reg.init_local("a", None).unwrap();
    reg.exec("a", &fail.stub()).unwrap();

    let code = "\
try:
    fail()
except Exception:
    caught = True";
    let result = reg.exec("a", code).unwrap();
    let error = result.error.expect("abort");
    assert_eq!(error.kind, ErrorKind::Host);
    assert_eq!(error.message, "no such context: 'missing'");
    assert_eq!(reg.fetch("a", "caught").unwrap(), None);
}

#[test]
fn test_unregistered_tool_raises_name_error() {
    let mut reg = greeter();
    assert!(reg.unregister_tool("greet"));
    assert!(reg.tool("greet").is_none());
    let error = reg.exec("agent", "greet('x')").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "NameError");
}

#[test]
fn test_default_stub_forwards_keywords() {
    let mut reg = registry();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    let record = reg
        .register_tool("record", move |_, call| {
            seen.borrow_mut().push(call);
            Ok(Transfer::Bool(true))
        })
        .unwrap();
    reg.init_local("a", None).unwrap();
    reg.exec("a", &record.stub()).unwrap();
    reg.exec("a", "record(1, 'two', mode='fast', retries=3)").unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "record");
    assert_eq!(calls[0].args, vec![Transfer::Int(1), Transfer::from("two")]);
    assert_eq!(
        calls[0].kwargs.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["mode", "retries"]
    );
    assert_eq!(calls[0].kwarg("retries"), Some(&Transfer::Int(3)));
}

#[test]
fn test_declared_signature_applies_defaults() {
    let mut reg = registry();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&calls);
    let def = ToolDef::new("read")
        .params(["path", "mode='r'", "**options"])
        .doc("Read a file.");
    let read = reg
        .register_tool_def(def, move |_, call| {
            seen.borrow_mut().push(call);
            Ok(Transfer::from("contents"))
        })
        .unwrap();
    assert_eq!(
        read.decl(),
        "def read(path, mode='r', **options):\n    \"\"\"Read a file.\"\"\"\n"
    );

    reg.init_local("a", None).unwrap();
    reg.exec("a", &read.stub()).unwrap();
    let result = reg.exec("a", "read('notes.txt', binary=True)").unwrap();
    assert_eq!(result.value, Some(Transfer::from("contents")));

    let result = reg.exec("a", "read()").unwrap();
    assert_eq!(result.error.unwrap().exception_type, "TypeError");

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec![Transfer::from("notes.txt"), Transfer::from("r")]);
    assert_eq!(calls[0].kwarg("binary"), Some(&Transfer::Bool(true)));
}

#[test]
fn test_untransferable_argument_is_a_type_error() {
    let mut reg = greeter();
    let error = reg.exec("agent", "greet(lambda: 1)").unwrap().error.unwrap();
    assert_eq!(error.exception_type, "TypeError");
    assert_eq!(error.kind, ErrorKind::Execution);
}

#[test]
fn test_reentrant_exec_keeps_output_separate() {
    let mut reg = registry();
    let helper = reg
        .register_tool("helper", |session, _| {
            assert_eq!(session.depth(), 1);
            let inner = session.exec("worker", "print('inner')\n7")?;
            assert_eq!(inner.value, Some(Transfer::Int(7)));
            Ok(Transfer::from(inner.output))
        })
        .unwrap();
    reg.init_local("agent", None).unwrap();
    reg.init_local("worker", None).unwrap();
    reg.exec("agent", &helper.stub()).unwrap();

    let result = reg
        .exec("agent", "print('outer')\ncaptured = helper()\ncaptured")
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.output, "outer\n");
    assert_eq!(result.value, Some(Transfer::from("inner\n")));
    assert_eq!(reg.call_depth(), 0);
}

#[test]
fn test_callback_sees_the_caller() {
    let mut reg = registry();
    let whoami = reg
        .register_tool("whoami", |session, _| {
            let caller = session.caller().to_string();
            let secret = session.fetch(&caller, "secret")?;
            Ok(Transfer::from(vec![Transfer::from(caller), Transfer::from(secret)]))
        })
        .unwrap();
    reg.init_local("p", None).unwrap();
    reg.exec("p", &whoami.stub()).unwrap();
    reg.exec("p", "secret = 41").unwrap();
    reg.init_local("c", Some("p")).unwrap();

    let result = reg.exec("c", "whoami()").unwrap();
    assert_eq!(
        result.value,
        Some(Transfer::from(vec![Transfer::from("c"), Transfer::Int(41)]))
    );
}

#[test]
fn test_running_context_cannot_be_destroyed() {
    let mut reg = registry();
    let outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    let teardown = reg
        .register_tool("teardown", move |session, _| {
            let caller = session.caller().to_string();
            *slot.borrow_mut() = Some(session.destroy(&caller, false));
            Ok(Transfer::None)
        })
        .unwrap();
    reg.init_local("a", None).unwrap();
    reg.exec("a", &teardown.stub()).unwrap();
    reg.exec("a", "teardown()").unwrap();

    let outcome = outcome.borrow_mut().take().unwrap();
    assert!(matches!(outcome, Err(SandboxError::ContextRunning(id)) if id == "a"));
    assert!(reg.context("a").is_some());
}

#[test]
fn test_unbounded_reentry_hits_the_depth_limit() {
    init_tracing();
    let config = SandboxConfig::builder().max_call_depth(4).build();
    let mut reg = Registry::new(config).unwrap();
    let deepest = Rc::new(Cell::new(0));
    let depth = Rc::clone(&deepest);
    let again = reg
        .register_tool("again", move |session, _| {
            depth.set(depth.get().max(session.depth()));
            let caller = session.caller().to_string();
            session.exec(&caller, "again()")?;
            Ok(Transfer::None)
        })
        .unwrap();
    reg.init_local("a", None).unwrap();
    reg.exec("a", &again.stub()).unwrap();

    let code = "\
try:
    again()
except Exception:
    caught = True";
    let result = reg.exec("a", code).unwrap();
    let error = result.error.expect("recursion limit");
    assert_eq!(error.kind, ErrorKind::RecursionLimit);
    assert!(error.is_recursion_limit());
    assert_eq!(deepest.get(), 4);
    assert_eq!(reg.fetch("a", "caught").unwrap(), None);
    assert_eq!(reg.call_depth(), 0);

    assert!(reg.exec("a", "1 + 1").unwrap().is_success());
}

#[test]
fn test_shared_registry_is_busy_inside_callbacks() {
    let shared = SharedRegistry::new(registry());
    let handle = shared.clone();
    let stub = shared
        .with(|reg| {
            let binding = reg.register_tool("sneak", move |_, _| {
                handle.exec("a", "1")?;
                Ok(Transfer::None)
            })?;
            Ok(binding.stub())
        })
        .unwrap();
    shared.init_local("a", None).unwrap();
    shared.exec("a", &stub).unwrap();

    let error = shared.exec("a", "sneak()").unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::InstanceBusy);
    assert!(shared.exec("a", "2").unwrap().is_success());
}

#[test]
fn test_nested_fuel_is_capped_and_charged() {
    let mut reg = registry();
    let inner_used = Rc::new(Cell::new(None));
    let used = Rc::clone(&inner_used);
    let spin = reg
        .register_tool("spin", move |session, _| {
            let result = session.exec_with_fuel("worker", "while True:\n    pass", 10)?;
            assert!(result.is_fuel_exhausted());
            used.set(result.fuel_consumed);
            Ok(Transfer::None)
        })
        .unwrap();
    reg.init_local("agent", None).unwrap();
    reg.init_local("worker", None).unwrap();
    reg.exec("agent", &spin.stub()).unwrap();

    let result = reg.exec_with_fuel("agent", "spin()\ndone = True", 1000).unwrap();
    assert!(result.is_success());
    assert_eq!(inner_used.get(), Some(10));
    let outer = result.fuel_consumed.unwrap();
    assert!(outer > 10 && outer < 1000, "outer consumed {outer}");
}

#[test]
fn test_nested_fuel_never_exceeds_the_caller() {
    let mut reg = registry();
    let spin = reg
        .register_tool("spin", |session, _| {
            let result = session.exec_with_fuel("worker", "while True:\n    pass", 1_000_000)?;
            Ok(Transfer::from(result.fuel_consumed.map(|n| n as i64)))
        })
        .unwrap();
    reg.init_local("agent", None).unwrap();
    reg.init_local("worker", None).unwrap();
    reg.exec("agent", &spin.stub()).unwrap();

    let result = reg.exec_with_fuel("agent", "spin()\nafter = True", 200).unwrap();
    assert!(result.is_fuel_exhausted());
    assert_eq!(result.fuel_consumed, Some(200));
    assert_eq!(reg.fetch("agent", "after").unwrap(), None);
}
