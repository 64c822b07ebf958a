//! Per-unit dispatch state
//!
//! Every code unit that has been intercepted with interception enabled gets
//! one [`ExtraState`]: its cache chain, its execution strategy and the
//! compiler's recompilation bookkeeping. The state is shared by every frame
//! running that unit, on every thread, through an `Arc`.
//!
//! The table is a `DashMap` keyed by code id, so lookups from concurrent
//! callers of different units never contend on one lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::cache::CacheChain;
use super::host::{CodeId, CodeUnit, Host};
use super::strategy::{AtomicStrategy, ExecStrategy};

/// Compiler-owned history for one code unit.
///
/// The dispatcher stores and forwards this record but never reads it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecompileBookkeeping {
    counters: HashMap<String, u64>,
    history: Vec<String>,
}

impl RecompileBookkeeping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named counter, returning its new value
    pub fn bump(&mut self, key: &str) -> u64 {
        let counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Append a free-form note, e.g. why a recompile happened
    pub fn record(&mut self, note: impl Into<String>) {
        self.history.push(note.into());
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Mutable dispatch state attached to one code unit
pub struct ExtraState<H: Host> {
    code: CodeUnit,
    chain: CacheChain<H>,
    strategy: AtomicStrategy,
    bookkeeping: Mutex<RecompileBookkeeping>,
}

impl<H: Host> ExtraState<H> {
    pub fn new(code: CodeUnit) -> Self {
        ExtraState {
            code,
            chain: CacheChain::new(),
            strategy: AtomicStrategy::default(),
            bookkeeping: Mutex::new(RecompileBookkeeping::new()),
        }
    }

    #[inline]
    pub fn code(&self) -> &CodeUnit {
        &self.code
    }

    #[inline]
    pub fn chain(&self) -> &CacheChain<H> {
        &self.chain
    }

    #[inline]
    pub fn strategy(&self) -> ExecStrategy {
        self.strategy.load()
    }

    /// Replace the strategy, returning the previous one
    pub fn set_strategy(&self, strategy: ExecStrategy) -> ExecStrategy {
        self.strategy.swap(strategy)
    }

    /// Exclusive access to the bookkeeping record
    pub fn bookkeeping(&self) -> parking_lot::MutexGuard<'_, RecompileBookkeeping> {
        self.bookkeeping.lock()
    }
}

impl<H: Host> fmt::Debug for ExtraState<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraState")
            .field("code", &self.code)
            .field("strategy", &self.strategy())
            .field("entries", &self.chain.len())
            .finish()
    }
}

/// All per-unit states, keyed by code id
pub struct ExtraStateTable<H: Host> {
    states: DashMap<CodeId, Arc<ExtraState<H>>>,
    created: AtomicU64,
}

impl<H: Host> ExtraStateTable<H> {
    pub fn new() -> Self {
        ExtraStateTable {
            states: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    /// State for a unit, if it has ever been intercepted
    pub fn get(&self, id: CodeId) -> Option<Arc<ExtraState<H>>> {
        self.states.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// State for a unit, created on first use
    pub fn get_or_create(&self, code: &CodeUnit) -> Arc<ExtraState<H>> {
        // Fast path: already created
        if let Some(state) = self.states.get(&code.id()) {
            return Arc::clone(state.value());
        }

        // Slow path: the entry API makes concurrent creators agree on one state
        let entry = self.states.entry(code.id()).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(ExtraState::new(code.clone()))
        });
        Arc::clone(entry.value())
    }

    /// Drop a unit's state; the next interception starts from scratch
    pub fn remove(&self, id: CodeId) -> Option<Arc<ExtraState<H>>> {
        self.states.remove(&id).map(|(_, state)| state)
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of states ever created, including removed ones
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Code units currently tracked
    pub fn units(&self) -> Vec<CodeUnit> {
        self.states.iter().map(|e| e.value().code().clone()).collect()
    }
}

impl<H: Host> Default for ExtraStateTable<H> {
    fn default() -> Self {
        ExtraStateTable::new()
    }
}
