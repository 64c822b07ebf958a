//! Dispatch Hot Path Benchmarks
//!
//! Measures the per-call cost of the dispatcher on its common paths:
//! - passthrough with interception disabled
//! - cache hit at the front of the chain
//! - cache hit deep in a long chain, with and without promotion
//! - skipped unit
//!
//! Run with:
//!   cargo bench --bench dispatch_hot_path

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use evalhook::config::DispatchConfig;
use evalhook::dispatch::{Callback, Dispatcher, ExecStrategy, LocalValue, LocalsSnapshot};
use evalhook::sim::{Program, SimVm, TypeSpecializingCompiler};
use std::sync::Arc;

fn vm(config: DispatchConfig) -> SimVm {
    let mut program = Program::new();
    program.define("f", &[]);
    SimVm::new(Arc::new(program), Arc::new(Dispatcher::new(config)))
}

fn locals(n: usize) -> LocalsSnapshot {
    LocalsSnapshot::new().with(
        "x",
        LocalValue::Object {
            type_name: Arc::from(format!("T{}", n).as_str()),
            id: n as u64,
        },
    )
}

fn bench_passthrough(c: &mut Criterion) {
    let vm = vm(DispatchConfig::default());
    let args = locals(0);
    c.bench_function("passthrough_disabled", |b| {
        b.iter(|| {
            let _ = vm.take_events();
            black_box(vm.call("f", black_box(args.clone())).ok())
        })
    });
}

fn bench_front_hit(c: &mut Criterion) {
    let vm = vm(DispatchConfig::default());
    vm.set_callback(Callback::compile(TypeSpecializingCompiler::new("bench")));
    let args = locals(0);
    let _ = vm.call("f", args.clone());

    c.bench_function("hit_front_of_chain", |b| {
        b.iter(|| {
            let _ = vm.take_events();
            black_box(vm.call("f", black_box(args.clone())).ok())
        })
    });
}

fn bench_deep_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("hit_deep_in_chain");

    for depth in [4usize, 16, 64] {
        for promote in [false, true] {
            let config = DispatchConfig {
                promote_on_hit: promote,
                ..DispatchConfig::default()
            };
            let vm = vm(config);
            vm.set_callback(Callback::compile(
                TypeSpecializingCompiler::new("bench").with_cache_size_limit(depth as u64),
            ));
            for n in 0..depth {
                let _ = vm.call("f", locals(n));
            }
            let oldest = locals(0);
            let id = BenchmarkId::new(if promote { "promote" } else { "fixed" }, depth);

            group.bench_with_input(id, &oldest, |b, args| {
                b.iter(|| {
                    let _ = vm.take_events();
                    black_box(vm.call("f", black_box(args.clone())).ok())
                })
            });
        }
    }

    group.finish();
}

fn bench_skipped(c: &mut Criterion) {
    let vm = vm(DispatchConfig::default());
    vm.set_callback(Callback::compile(TypeSpecializingCompiler::new("bench")));
    let f = vm.program().get("f").map(|f| f.code().clone());
    if let Some(code) = f {
        vm.dispatcher().set_code_strategy(&code, ExecStrategy::SKIP_SELF);
    }
    let args = locals(0);

    c.bench_function("skipped_unit", |b| {
        b.iter(|| {
            let _ = vm.take_events();
            black_box(vm.call("f", black_box(args.clone())).ok())
        })
    });
}

criterion_group!(
    benches,
    bench_passthrough,
    bench_front_hit,
    bench_deep_hit,
    bench_skipped
);
criterion_main!(benches);
