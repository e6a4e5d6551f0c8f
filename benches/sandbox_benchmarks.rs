//! Benchmarks for context registries.
//!
//! Run with: cargo bench
//!
//! The wasm benchmarks require a reactor module at assets/pybox-reactor.wasm
//! and are skipped without one.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pybox::prelude::*;
use pybox::global_cache;

/// Get the path to the reactor module, checking if it exists.
fn get_interpreter_path() -> Option<std::path::PathBuf> {
    let path = std::path::PathBuf::from("assets/pybox-reactor.wasm");
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn script_registry() -> Registry {
    let mut reg = Registry::new(SandboxConfig::default()).unwrap();
    reg.init_local("main", None).unwrap();
    reg
}

/// Benchmark top-level execution of small snippets.
fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");

    let snippets = [
        ("simple_expression", "1 + 1"),
        ("assignment", "x = 42"),
        ("loop_100", "total = 0\nfor i in range(100):\n    total += i"),
        ("function_call", "def f(n):\n    return n * 2\nf(21)"),
        ("comprehension", "[i * i for i in range(100)]"),
    ];

    for (name, code) in snippets {
        let mut reg = script_registry();
        group.bench_with_input(BenchmarkId::new("script", name), &code, |b, code| {
            b.iter(|| black_box(reg.exec("main", code).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark name resolution through a chain of parents.
fn bench_fallthrough(c: &mut Criterion) {
    let mut group = c.benchmark_group("fallthrough");

    for depth in [1usize, 4, 16] {
        let mut reg = Registry::new(SandboxConfig::default()).unwrap();
        reg.init_local("c0", None).unwrap();
        reg.exec("c0", "base = 1").unwrap();
        for level in 1..depth {
            reg.init_local(&format!("c{level}"), Some(&format!("c{}", level - 1)))
                .unwrap();
        }
        let leaf = format!("c{}", depth - 1);
        group.bench_with_input(BenchmarkId::new("depth", depth), &leaf, |b, leaf| {
            b.iter(|| black_box(reg.exec(leaf, "base + 1").unwrap()));
        });
    }

    group.finish();
}

/// Benchmark a round trip through the tool bridge.
fn bench_tool_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("tool_dispatch");

    let mut reg = script_registry();
    let echo = reg
        .register_tool("echo", |_, call| {
            Ok(call.arg(0).cloned().unwrap_or(Transfer::None))
        })
        .unwrap();
    reg.exec("main", &echo.stub()).unwrap();
    reg.protect("main", "echo").unwrap();

    group.bench_function("echo_int", |b| {
        b.iter(|| black_box(reg.exec("main", "echo(1)").unwrap()));
    });
    group.bench_function("echo_list", |b| {
        b.iter(|| black_box(reg.exec("main", "echo(list(range(50)))").unwrap()));
    });

    let nested = reg
        .register_tool("nested", |session, _| {
            let result = session.exec("worker", "1 + 1")?;
            Ok(result.value.unwrap_or(Transfer::None))
        })
        .unwrap();
    reg.init_local("worker", None).unwrap();
    reg.exec("main", &nested.stub()).unwrap();
    group.bench_function("nested_exec", |b| {
        b.iter(|| black_box(reg.exec("main", "nested()").unwrap()));
    });

    group.finish();
}

/// Benchmark snapshot and restore by namespace size.
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [10i64, 100, 1000] {
        let mut reg = script_registry();
        for i in 0..size {
            reg.assign("main", &format!("v{i}"), i).unwrap();
        }
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("take", size), &size, |b, _| {
            b.iter(|| black_box(reg.snapshot("main").unwrap()));
        });

        let snap = reg.snapshot("main").unwrap();
        group.bench_with_input(BenchmarkId::new("restore", size), &size, |b, _| {
            b.iter(|| reg.restore(black_box(&snap)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("serialize", size), &size, |b, _| {
            b.iter(|| black_box(snap.to_bytes().unwrap()));
        });
    }

    group.finish();
}

/// Benchmark step budget overhead.
fn bench_fuel(c: &mut Criterion) {
    let mut group = c.benchmark_group("fuel");
    let code = "total = 0\nfor i in range(1000):\n    total += i";

    let mut reg = script_registry();
    group.bench_function("unmetered", |b| {
        b.iter(|| black_box(reg.exec("main", code).unwrap()));
    });
    group.bench_function("metered", |b| {
        b.iter(|| black_box(reg.exec_with_fuel("main", code, 1_000_000).unwrap()));
    });

    group.finish();
}

/// Benchmark wasm interpreter startup and execution.
fn bench_wasm(c: &mut Criterion) {
    let Some(interpreter_path) = get_interpreter_path() else {
        eprintln!("Skipping wasm benchmarks: pybox-reactor.wasm not found");
        return;
    };
    let config = SandboxConfig::builder()
        .interpreter_path(&interpreter_path)
        .max_memory(64 * 1024 * 1024)
        .build();

    let mut group = c.benchmark_group("wasm");
    group.sample_size(10);

    group.bench_function("cold_start", |b| {
        b.iter(|| {
            global_cache().clear();
            black_box(Registry::wasm(config.clone()).unwrap())
        });
    });

    // Pre-warm the cache
    let _ = Registry::wasm(config.clone()).unwrap();
    group.bench_function("warm_start", |b| {
        b.iter(|| black_box(Registry::wasm(config.clone()).unwrap()));
    });

    let mut reg = Registry::wasm(config.clone()).unwrap();
    reg.init_local("main", None).unwrap();
    group.bench_function("simple_expression", |b| {
        b.iter(|| black_box(reg.exec("main", "1 + 1").unwrap()));
    });
    group.bench_function("checkpoint", |b| {
        b.iter(|| black_box(reg.checkpoint().unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_execution,
    bench_fallthrough,
    bench_tool_dispatch,
    bench_snapshot,
    bench_fuel,
    bench_wasm,
);

criterion_main!(benches);
