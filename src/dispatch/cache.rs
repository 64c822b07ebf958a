//! Guarded cache chain
//!
//! Each code unit owns an ordered chain of compiled artifacts. A lookup walks
//! the chain front to back and runs the first entry whose backend matches
//! and whose guard holds for the call's locals:
//!
//! ```text
//! chain:  [ e3 | e2 | e1 ]      most recent first
//!           │    │
//!           │    └─ guard(locals) == true  -> HIT e2, promote to front
//!           └────── backend mismatch       -> skip
//! ```
//!
//! The first guard that raises ends the walk and the error is returned; a
//! raising guard is never treated as a miss.
//!
//! Readers take a snapshot of the chain (a vector of `Arc`s) under a short
//! read lock and evaluate guards without holding it. Guards may run
//! interpreted code, so no lock is held while they execute.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use super::backend::{BackendId, BackendMatch};
use super::compiler::CompiledArtifact;
use super::error::GuardError;
use super::host::{Host, LocalsSnapshot};

/// A predicate over a call's locals that decides whether an artifact applies.
///
/// Closures of the shape `Fn(&H, &LocalsSnapshot) -> Result<bool, GuardError>`
/// implement this directly.
pub trait GuardPredicate<H: Host>: Send + Sync {
    fn check(&self, host: &H, locals: &LocalsSnapshot) -> Result<bool, GuardError>;
}

impl<H, F> GuardPredicate<H> for F
where
    H: Host,
    F: Fn(&H, &LocalsSnapshot) -> Result<bool, GuardError> + Send + Sync,
{
    fn check(&self, host: &H, locals: &LocalsSnapshot) -> Result<bool, GuardError> {
        self(host, locals)
    }
}

/// Where new entries go in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainOrder {
    /// Newest entry is checked first
    #[default]
    MostRecentFirst,
    /// Entries are checked in the order they were compiled
    InsertionOrder,
}

/// Which guard of an entry a lookup evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStance {
    /// Evaluate the full guard
    Full,
    /// Evaluate the diff guard where an entry has one
    SkipUnsafe,
}

/// One compiled artifact and the conditions under which it may run
pub struct CacheEntry<H: Host> {
    code: H::Code,
    guard: Arc<dyn GuardPredicate<H>>,
    diff_guard: Option<Arc<dyn GuardPredicate<H>>>,
    backend: BackendId,
    trace_label: Arc<str>,
    valid: AtomicBool,
}

impl<H: Host> CacheEntry<H> {
    pub fn new(artifact: CompiledArtifact<H>, backend: BackendId) -> Self {
        CacheEntry {
            code: artifact.code,
            guard: artifact.guard,
            diff_guard: artifact.diff_guard,
            backend,
            trace_label: artifact.trace_label.into(),
            valid: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn code(&self) -> &H::Code {
        &self.code
    }

    #[inline]
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    #[inline]
    pub fn trace_label(&self) -> &str {
        &self.trace_label
    }

    pub fn has_diff_guard(&self) -> bool {
        self.diff_guard.is_some()
    }

    /// Permanently retire this entry; it will never match again
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Decide whether this entry may run for a call
    pub fn matches(
        &self,
        host: &H,
        locals: &LocalsSnapshot,
        backend: BackendMatch,
        stance: GuardStance,
    ) -> Result<bool, GuardError> {
        if !self.is_valid() || !backend.accepts(self.backend) {
            return Ok(false);
        }
        let guard = match (stance, &self.diff_guard) {
            (GuardStance::SkipUnsafe, Some(diff)) => diff,
            _ => &self.guard,
        };
        guard.check(host, locals)
    }
}

impl<H: Host> fmt::Debug for CacheEntry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("backend", &self.backend)
            .field("trace_label", &self.trace_label)
            .field("valid", &self.is_valid())
            .field("diff_guard", &self.diff_guard.is_some())
            .finish()
    }
}

/// Ordered chain of cache entries for one code unit
pub struct CacheChain<H: Host> {
    entries: RwLock<Vec<Arc<CacheEntry<H>>>>,
}

impl<H: Host> CacheChain<H> {
    pub fn new() -> Self {
        CacheChain {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the chain in lookup order
    pub fn entries(&self) -> Vec<Arc<CacheEntry<H>>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Add an entry, dropping invalidated ones on the way
    pub fn insert(&self, entry: CacheEntry<H>, order: ChainOrder) -> Arc<CacheEntry<H>> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.write();
        entries.retain(|e| e.is_valid());
        match order {
            ChainOrder::MostRecentFirst => entries.insert(0, Arc::clone(&entry)),
            ChainOrder::InsertionOrder => entries.push(Arc::clone(&entry)),
        }
        entry
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Find the first entry that may run for this call.
    ///
    /// `Ok(None)` is a miss. On a hit with `promote` set, the entry is moved
    /// to the front of the chain.
    pub fn lookup(
        &self,
        host: &H,
        locals: &LocalsSnapshot,
        backend: BackendMatch,
        stance: GuardStance,
        promote: bool,
    ) -> Result<Option<Arc<CacheEntry<H>>>, GuardError> {
        let snapshot = self.entries();

        for (index, entry) in snapshot.iter().enumerate() {
            if entry.matches(host, locals, backend, stance)? {
                if promote && index > 0 {
                    self.move_to_front(entry);
                }
                return Ok(Some(Arc::clone(entry)));
            }
        }

        Ok(None)
    }

    fn move_to_front(&self, entry: &Arc<CacheEntry<H>>) {
        let mut entries = self.entries.write();
        // Another thread may have reordered or purged the chain meanwhile
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            entries[..=pos].rotate_right(1);
        }
    }
}

impl<H: Host> Default for CacheChain<H> {
    fn default() -> Self {
        CacheChain::new()
    }
}

impl<H: Host> fmt::Debug for CacheChain<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::host::LocalValue;
    use crate::sim::{SimCode, SimVm};

    fn artifact(label: &str, guard: impl GuardPredicate<SimVm> + 'static) -> CompiledArtifact<SimVm> {
        CompiledArtifact::new(SimCode::new(label, Vec::new()), guard, label)
    }

    fn x_is(n: i64) -> impl GuardPredicate<SimVm> + 'static {
        move |_: &SimVm, locals: &LocalsSnapshot| -> Result<bool, GuardError> {
            Ok(locals.get("x") == Some(&LocalValue::Int(n)))
        }
    }

    fn labels(chain: &CacheChain<SimVm>) -> Vec<String> {
        chain
            .entries()
            .iter()
            .map(|e| e.trace_label().to_string())
            .collect()
    }

    #[test]
    fn test_most_recent_first_insertion() {
        let backend = BackendId::intern("cache-test");
        let chain = CacheChain::new();
        chain.insert(CacheEntry::new(artifact("a", x_is(1)), backend), ChainOrder::MostRecentFirst);
        chain.insert(CacheEntry::new(artifact("b", x_is(2)), backend), ChainOrder::MostRecentFirst);
        assert_eq!(labels(&chain), vec!["b", "a"]);

        let chain = CacheChain::new();
        chain.insert(CacheEntry::new(artifact("a", x_is(1)), backend), ChainOrder::InsertionOrder);
        chain.insert(CacheEntry::new(artifact("b", x_is(2)), backend), ChainOrder::InsertionOrder);
        assert_eq!(labels(&chain), vec!["a", "b"]);
    }

    #[test]
    fn test_first_match_wins_and_is_promoted() {
        let vm = SimVm::standalone();
        let backend = BackendId::intern("cache-test");
        let chain = CacheChain::new();
        chain.insert(CacheEntry::new(artifact("old", x_is(1)), backend), ChainOrder::MostRecentFirst);
        chain.insert(CacheEntry::new(artifact("new", x_is(9)), backend), ChainOrder::MostRecentFirst);
        let also_one = |_: &SimVm, locals: &LocalsSnapshot| -> Result<bool, GuardError> {
            Ok(locals.get("x") == Some(&LocalValue::Int(1)))
        };
        chain.insert(CacheEntry::new(artifact("overlap", also_one), backend), ChainOrder::InsertionOrder);
        assert_eq!(labels(&chain), vec!["new", "old", "overlap"]);

        // "old" and "overlap" both hold; the earlier one wins and moves up
        let locals = LocalsSnapshot::new().with("x", LocalValue::Int(1));
        let hit = chain
            .lookup(&vm, &locals, BackendMatch::Exact(backend), GuardStance::Full, true)
            .unwrap()
            .unwrap();
        assert_eq!(hit.trace_label(), "old");
        assert_eq!(labels(&chain), vec!["old", "new", "overlap"]);

        // Without promotion the order is left alone
        let locals = LocalsSnapshot::new().with("x", LocalValue::Int(9));
        let hit = chain
            .lookup(&vm, &locals, BackendMatch::Exact(backend), GuardStance::Full, false)
            .unwrap()
            .unwrap();
        assert_eq!(hit.trace_label(), "new");
        assert_eq!(labels(&chain), vec!["old", "new", "overlap"]);
    }

    #[test]
    fn test_backend_is_part_of_the_key() {
        let vm = SimVm::standalone();
        let a = BackendId::intern("cache-test-a");
        let b = BackendId::intern("cache-test-b");
        let chain = CacheChain::new();
        let always = |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> { Ok(true) };
        chain.insert(CacheEntry::new(artifact("from-a", always), a), ChainOrder::MostRecentFirst);

        let locals = LocalsSnapshot::new();
        let miss = chain
            .lookup(&vm, &locals, BackendMatch::Exact(b), GuardStance::Full, true)
            .unwrap();
        assert!(miss.is_none());

        let hit = chain
            .lookup(&vm, &locals, BackendMatch::Any, GuardStance::Full, true)
            .unwrap();
        assert_eq!(hit.unwrap().trace_label(), "from-a");
    }

    #[test]
    fn test_guard_error_stops_the_walk() {
        let vm = SimVm::standalone();
        let backend = BackendId::intern("cache-test");
        let chain = CacheChain::new();
        let later_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&later_ran);
        let later = move |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> {
            flag.store(true, Ordering::SeqCst);
            Ok(true)
        };
        let raising = |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> {
            Err(GuardError::new("attribute missing"))
        };
        chain.insert(CacheEntry::new(artifact("later", later), backend), ChainOrder::MostRecentFirst);
        chain.insert(CacheEntry::new(artifact("raising", raising), backend), ChainOrder::MostRecentFirst);

        let err = chain
            .lookup(&vm, &LocalsSnapshot::new(), BackendMatch::Exact(backend), GuardStance::Full, true)
            .unwrap_err();
        assert_eq!(err.message(), "attribute missing");
        assert!(!later_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalidated_entries_never_match_and_are_purged() {
        let vm = SimVm::standalone();
        let backend = BackendId::intern("cache-test");
        let chain = CacheChain::new();
        let always = |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> { Ok(true) };
        let entry = chain.insert(CacheEntry::new(artifact("gone", always), backend), ChainOrder::MostRecentFirst);
        entry.invalidate();

        let miss = chain
            .lookup(&vm, &LocalsSnapshot::new(), BackendMatch::Any, GuardStance::Full, true)
            .unwrap();
        assert!(miss.is_none());
        assert_eq!(chain.len(), 1);

        chain.insert(CacheEntry::new(artifact("fresh", x_is(1)), backend), ChainOrder::MostRecentFirst);
        assert_eq!(labels(&chain), vec!["fresh"]);
    }

    #[test]
    fn test_skip_unsafe_stance_uses_diff_guard() {
        let vm = SimVm::standalone();
        let backend = BackendId::intern("cache-test");
        let chain = CacheChain::new();
        let never = |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> { Ok(false) };
        let always = |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> { Ok(true) };
        chain.insert(
            CacheEntry::new(artifact("diffed", never).with_diff_guard(always), backend),
            ChainOrder::MostRecentFirst,
        );

        let locals = LocalsSnapshot::new();
        let full = chain
            .lookup(&vm, &locals, BackendMatch::Exact(backend), GuardStance::Full, true)
            .unwrap();
        assert!(full.is_none());

        let unsafe_hit = chain
            .lookup(&vm, &locals, BackendMatch::Exact(backend), GuardStance::SkipUnsafe, true)
            .unwrap();
        assert_eq!(unsafe_hit.unwrap().trace_label(), "diffed");
    }
}
