//! Context snapshots and whole-instance checkpoints.

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use pybox::prelude::*;
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

#[test]
fn test_restore_replaces_the_namespace() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "x = 1\nitems = [1, 2]").unwrap();
    let snap = reg.snapshot("a").unwrap();

    reg.exec("a", "x = 2\nitems.append(3)\nextra = 'new'").unwrap();
    reg.restore(&snap).unwrap();

    assert_eq!(reg.fetch("a", "x").unwrap(), Some(Transfer::Int(1)));
    assert_eq!(reg.fetch("a", "items").unwrap(), Some(Transfer::from(vec![1i64, 2])));
    assert_eq!(reg.fetch("a", "extra").unwrap(), None);
}

#[test]
fn test_snapshot_is_independent_of_later_mutation() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "data = {'k': [1]}").unwrap();
    let snap = reg.snapshot("a").unwrap();
    reg.exec("a", "data['k'].append(2)").unwrap();

    let mut expected = IndexMap::new();
    expected.insert("k".to_string(), Transfer::from(vec![1i64]));
    assert_eq!(snap.namespace().get("data"), Some(&Transfer::Map(expected)));

    reg.restore(&snap).unwrap();
    reg.exec("a", "data['k'].append(5)").unwrap();
    reg.restore(&snap).unwrap();
    assert_eq!(reg.exec("a", "len(data['k'])").unwrap().value, Some(Transfer::Int(1)));
}

#[test]
fn test_retained_containers_are_independent_of_later_mutation() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "def f():\n    return 1\nx = [f]\nd = {'fs': x}\nx.append(d)").unwrap();
    let snap = reg.snapshot("a").unwrap();
    let mut retained: Vec<&str> = snap.retained_names().collect();
    retained.sort_unstable();
    assert_eq!(retained, vec!["d", "f", "x"]);

    reg.exec("a", "x.append(2)\nd['new'] = 1").unwrap();
    reg.restore(&snap).unwrap();
    let result = reg.exec("a", "[len(x), len(d), x[0](), d['fs'] is x, x[1] is d]").unwrap();
    assert_eq!(
        result.value,
        Some(Transfer::from(vec![
            Transfer::Int(2),
            Transfer::Int(1),
            Transfer::Int(1),
            Transfer::Bool(true),
            Transfer::Bool(true),
        ]))
    );

    // A restored container does not write through to the snapshot either.
    reg.exec("a", "x.append(3)").unwrap();
    reg.restore(&snap).unwrap();
    assert_eq!(reg.exec("a", "len(x)").unwrap().value, Some(Transfer::Int(2)));
    reg.exec("a", "x = 0\nd = 0").unwrap();
}

#[test]
fn test_checkpoint_retained_containers_survive_repeated_rollback() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "def f():\n    return 1\nx = [f]").unwrap();
    let checkpoint = reg.checkpoint().unwrap();
    for _ in 0..3 {
        reg.exec("a", "x.append(2)").unwrap();
        reg.rollback(&checkpoint).unwrap();
        assert_eq!(reg.exec("a", "len(x)").unwrap().value, Some(Transfer::Int(1)));
    }
}

#[test]
fn test_restore_brings_back_protection() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "key = 'k'").unwrap();
    reg.protect("a", "key").unwrap();
    let snap = reg.snapshot("a").unwrap();
    assert_eq!(snap.protected_names().to_vec(), vec!["key".to_string()]);

    reg.unprotect("a", "key").unwrap();
    reg.protect("a", "other").unwrap();
    reg.restore(&snap).unwrap();

    let ctx = reg.context("a").unwrap();
    assert!(ctx.is_protected("key"));
    assert!(!ctx.is_protected("other"));
    assert!(reg.exec("a", "key = 'changed'").unwrap().is_protection_violation());
}

#[test]
fn test_restore_recreates_a_destroyed_context() {
    let mut reg = registry();
    reg.init_local("p", None).unwrap();
    reg.init_local("c", Some("p")).unwrap();
    reg.exec("c", "local = 3").unwrap();
    let parent = reg.snapshot("p").unwrap();
    let child = reg.snapshot("c").unwrap();
    assert_eq!(child.parent_id(), Some("p"));

    reg.destroy("p", true).unwrap();
    assert!(matches!(
        reg.restore(&child),
        Err(SandboxError::NoSuchParent(id)) if id == "p"
    ));

    reg.restore(&parent).unwrap();
    reg.restore(&child).unwrap();
    assert_eq!(reg.context("c").and_then(|c| c.parent()), Some("p"));
    assert_eq!(reg.fetch("c", "local").unwrap(), Some(Transfer::Int(3)));
}

#[test]
fn test_functions_survive_restore_in_the_same_registry() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "def square(n):\n    return n * n").unwrap();
    let snap = reg.snapshot("a").unwrap();
    assert_eq!(snap.retained_names().collect::<Vec<_>>(), vec!["square"]);

    reg.exec("a", "del square").unwrap();
    reg.restore(&snap).unwrap();
    assert_eq!(reg.exec("a", "square(9)").unwrap().value, Some(Transfer::Int(81)));
}

#[test]
fn test_snapshot_is_refused_by_another_registry() {
    let mut first = registry();
    let mut second = registry();
    first.init_local("a", None).unwrap();
    second.init_local("a", None).unwrap();
    let snap = first.snapshot("a").unwrap();

    let err = second.restore(&snap).unwrap_err();
    assert!(err.is_version_mismatch());
    assert!(matches!(
        err,
        SandboxError::VersionMismatch { expected, found }
            if expected == second.generation() && found == first.generation()
    ));
}

#[test]
fn test_serialized_snapshot_restores() {
    let mut reg = registry();
    reg.init_local("a", None).unwrap();
    reg.exec("a", "name = 'pybox'\nratio = 0.5\nflags = [True, None]").unwrap();
    let bytes = reg.snapshot("a").unwrap().to_bytes().unwrap();

    let decoded = Snapshot::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.context_id(), "a");
    assert_eq!(decoded.generation(), reg.generation());
    assert_eq!(decoded.format(), pybox::SNAPSHOT_FORMAT);

    reg.exec("a", "name = 'changed'").unwrap();
    reg.restore(&decoded).unwrap();
    assert_eq!(reg.fetch("a", "name").unwrap(), Some(Transfer::from("pybox")));
    assert_eq!(reg.fetch("a", "ratio").unwrap(), Some(Transfer::Float(0.5)));
}

#[test]
fn test_malformed_record_is_rejected() {
    assert!(Snapshot::from_bytes(b"{not json").is_err());
}

#[test]
fn test_snapshot_of_missing_context() {
    let mut reg = registry();
    assert!(reg.snapshot("ghost").unwrap_err().is_missing_context());
}

#[test]
fn test_rollback_restores_every_context() {
    let mut reg = registry();
    reg.init_local("keep", None).unwrap();
    reg.init_local("doomed", None).unwrap();
    reg.exec("keep", "counter = 1").unwrap();
    reg.exec("doomed", "value = 'before'").unwrap();
    let checkpoint = reg.checkpoint().unwrap();
    assert_eq!(checkpoint.contexts().len(), 2);
    assert_eq!(checkpoint.generation(), reg.generation());

    reg.exec("keep", "counter = 2").unwrap();
    reg.destroy("doomed", false).unwrap();
    reg.init_local("later", None).unwrap();
    reg.protect("keep", "counter").unwrap();

    reg.rollback(&checkpoint).unwrap();
    assert_eq!(
        reg.contexts().map(|c| c.id()).collect::<Vec<_>>(),
        vec!["keep", "doomed"]
    );
    assert_eq!(reg.fetch("keep", "counter").unwrap(), Some(Transfer::Int(1)));
    assert_eq!(reg.fetch("doomed", "value").unwrap(), Some(Transfer::from("before")));
    assert!(!reg.context("keep").unwrap().is_protected("counter"));
    assert!(reg.context("later").is_none());
}

#[test]
fn test_rollback_forgets_later_retirements() {
    let mut reg = registry();
    let checkpoint = reg.checkpoint().unwrap();
    reg.init_local("tmp", None).unwrap();
    reg.destroy("tmp", false).unwrap();
    assert!(reg.init_local("tmp", None).is_err());

    reg.rollback(&checkpoint).unwrap();
    reg.init_local("tmp", None).unwrap();
}

#[test]
fn test_rollback_checks_the_generation() {
    let mut first = registry();
    let mut second = registry();
    let checkpoint = first.checkpoint().unwrap();
    assert!(second.rollback(&checkpoint).unwrap_err().is_version_mismatch());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_restore_returns_assigned_values(
        entries in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..6),
        overwrite in any::<i64>(),
    ) {
        let mut reg = Registry::new(SandboxConfig::default()).unwrap();
        reg.init_local("p", None).unwrap();
        let names: Vec<String> = entries
            .keys()
            .map(|name| format!("v_{name}"))
            .collect();
        for (name, value) in names.iter().zip(entries.values()) {
            reg.assign("p", name, *value).unwrap();
        }
        let snap = reg.snapshot("p").unwrap();
        for name in &names {
            reg.assign("p", name, overwrite).unwrap();
        }
        reg.restore(&snap).unwrap();
        for (name, value) in names.iter().zip(entries.values()) {
            prop_assert_eq!(reg.fetch("p", name).unwrap(), Some(Transfer::Int(*value)));
        }
    }
}
