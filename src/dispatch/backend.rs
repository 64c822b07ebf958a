//! Backend Identity Interning
//!
//! Cached artifacts remember which compiler backend produced them, and a
//! lookup only accepts entries from the backend currently active. Backends
//! are interned by name so the comparison on the hot path is a `u32` compare.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use parking_lot::RwLock;

/// Interned identity of a compiler backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(u32);

struct BackendRegistry {
    ids: DashMap<Arc<str>, BackendId>,
    names: RwLock<Vec<Arc<str>>>,
    next: AtomicU32,
}

static GLOBAL_BACKENDS: LazyLock<BackendRegistry> = LazyLock::new(|| BackendRegistry {
    ids: DashMap::new(),
    names: RwLock::new(Vec::new()),
    next: AtomicU32::new(0),
});

impl BackendId {
    /// Intern a backend name, returning the same id for equal names
    pub fn intern(name: &str) -> Self {
        let registry = &*GLOBAL_BACKENDS;

        if let Some(id) = registry.ids.get(name) {
            return *id.value();
        }

        *registry
            .ids
            .entry(Arc::from(name))
            .or_insert_with(|| {
                // The names vector is indexed by id, so allocate under its lock
                let mut names = registry.names.write();
                let id = BackendId(registry.next.fetch_add(1, Ordering::Relaxed));
                names.push(Arc::from(name));
                id
            })
            .value()
    }

    /// The name this id was interned from
    pub fn name(&self) -> Arc<str> {
        GLOBAL_BACKENDS
            .names
            .read()
            .get(self.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("<unknown>"))
    }

    #[inline]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Backend part of a cache lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMatch {
    /// Only entries produced by this backend are eligible
    Exact(BackendId),
    /// Replay-only lookups accept an entry from any backend
    Any,
}

impl BackendMatch {
    #[inline]
    pub fn accepts(&self, backend: BackendId) -> bool {
        match self {
            BackendMatch::Exact(id) => *id == backend,
            BackendMatch::Any => true,
        }
    }
}
