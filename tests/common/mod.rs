//! Shared utilities for dispatch integration tests
//!
//! Builds reference-host VMs over small call graphs and checks the frame
//! bookkeeping every test relies on.
#![allow(dead_code)]

use std::sync::Arc;

use evalhook::config::DispatchConfig;
use evalhook::dispatch::{CodeUnit, Dispatcher, LocalValue, LocalsSnapshot};
use evalhook::sim::{Program, SimVm};

/// Locals `{x: n}`
pub fn int(n: i64) -> LocalsSnapshot {
    LocalsSnapshot::new().with("x", LocalValue::Int(n))
}

/// Locals `{x: s}`
pub fn text(s: &str) -> LocalsSnapshot {
    LocalsSnapshot::new().with("x", LocalValue::Str(Arc::from(s)))
}

/// Locals `{x: v}`
pub fn float(v: f64) -> LocalsSnapshot {
    LocalsSnapshot::new().with("x", LocalValue::Float(v))
}

pub fn program(functions: &[(&str, &[&str])]) -> Program {
    let mut program = Program::new();
    for (name, calls) in functions {
        program.define(name, calls);
    }
    program
}

/// A VM over `functions` with its own default dispatcher
pub fn vm(functions: &[(&str, &[&str])]) -> SimVm {
    vm_with_config(functions, DispatchConfig::default())
}

pub fn vm_with_config(functions: &[(&str, &[&str])], config: DispatchConfig) -> SimVm {
    SimVm::new(
        Arc::new(program(functions)),
        Arc::new(Dispatcher::new(config)),
    )
}

/// Code unit of a function defined in the VM's program
pub fn code(vm: &SimVm, name: &str) -> CodeUnit {
    vm.program()
        .get(name)
        .unwrap_or_else(|| panic!("function {} is not defined", name))
        .code()
        .clone()
}

/// Labels of a unit's cache entries, in lookup order
pub fn labels(vm: &SimVm, name: &str) -> Vec<String> {
    vm.dispatcher()
        .cache_entries(code(vm, name).id())
        .iter()
        .map(|e| e.trace_label().to_string())
        .collect()
}

/// Every frame handed to the dispatcher was finalized exactly once
pub fn assert_frames_balanced(vm: &SimVm) {
    let counts = vm.frame_counts();
    assert_eq!(
        counts.created,
        counts.finalized(),
        "frames created vs finalized: {:?}",
        counts
    );
}
