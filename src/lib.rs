//! evalhook - Guarded Frame Dispatch
//!
//! This library provides the call-path hook of a specializing interpreter:
//! every invocation of an interpreted code unit passes through a
//! [`Dispatcher`], which decides whether to interpret it, run a cached
//! specialized artifact whose guard holds, or ask a compiler for a new one.
//!
//! # Architecture
//!
//! 1. **Host boundary** (`dispatch::host`)
//!    - The [`Host`] trait is all the dispatcher knows about the interpreter:
//!      frames, locals snapshots, default and specialized evaluation
//!    - Frames are passed by value, so each is finalized exactly once
//!
//! 2. **Dispatch** (`dispatch`)
//!    - Per-unit state: a guarded cache chain, an execution strategy and the
//!      compiler's recompilation bookkeeping
//!    - A per-thread ambient [`Callback`]: disabled, restricted replay, or a
//!      compiler
//!    - Interception is suspended while guards and the compiler run
//!
//! 3. **Reference host** (`sim`)
//!    - A small interpreter and a type-specializing compiler that exercise
//!      every dispatch path, driven from TOML scenarios by the CLI
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use evalhook::dispatch::{Callback, Dispatcher, LocalValue, LocalsSnapshot};
//! use evalhook::sim::{ExecPath, Program, SimVm, TypeSpecializingCompiler};
//!
//! let mut program = Program::new();
//! program.define("double", &[]);
//!
//! let vm = SimVm::new(Arc::new(program), Arc::new(Dispatcher::default()));
//! vm.set_callback(Callback::compile(TypeSpecializingCompiler::new("doc")));
//!
//! let locals = LocalsSnapshot::new().with("x", LocalValue::Int(21));
//! let first = vm.call("double", locals.clone()).unwrap();
//! let second = vm.call("double", locals).unwrap();
//!
//! assert_eq!(first, ExecPath::Specialized("doc:double:1".to_string()));
//! assert_eq!(second, first);
//! assert_eq!(vm.dispatcher().stats().compiles, 1);
//! ```

pub mod config;
pub mod dispatch;
pub mod sim;

pub use config::{ConfigError, DispatchConfig};
pub use dispatch::{
    Callback, CodeId, CodeUnit, DispatchError, DispatchStats, Dispatcher, ExecStrategy,
    FrameAction, FrameCompiler, Host, LocalValue, LocalsSnapshot,
};
