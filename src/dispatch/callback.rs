//! Ambient interception callback
//!
//! Every call into the dispatcher consults the callback currently installed
//! on the calling thread. Besides a real compiler there are two reserved
//! values: `Disabled` turns interception off, `Restricted` replays cached
//! artifacts but never compiles.
//!
//! The dispatcher narrows the callback for the calls it makes (children of a
//! skipped unit, guard evaluation) through [`CallbackScope`], which puts the
//! caller's callback back when it is dropped, on success and error alike.
//! A failed dispatch disarms its suspension instead, so interception stays
//! off on that thread until the host installs a callback again.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use super::backend::{BackendId, BackendMatch};
use super::compiler::FrameCompiler;
use super::host::Host;

/// The interception policy in effect for a call
pub enum Callback<H: Host> {
    /// No interception: always run default interpretation
    Disabled,
    /// Replay cached artifacts only, never compile
    Restricted,
    /// Intercept and compile on a miss
    Compile(Arc<dyn FrameCompiler<H>>),
}

impl<H: Host> Callback<H> {
    pub fn compile(compiler: impl FrameCompiler<H> + 'static) -> Self {
        Callback::Compile(Arc::new(compiler))
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Callback::Disabled)
    }

    #[inline]
    pub fn is_restricted(&self) -> bool {
        matches!(self, Callback::Restricted)
    }

    /// Identity comparison; compilers compare by allocation
    pub fn same_as(&self, other: &Callback<H>) -> bool {
        match (self, other) {
            (Callback::Disabled, Callback::Disabled) => true,
            (Callback::Restricted, Callback::Restricted) => true,
            (Callback::Compile(a), Callback::Compile(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Backend of the installed compiler, if any
    pub fn backend(&self) -> Option<BackendId> {
        match self {
            Callback::Compile(c) => Some(c.backend()),
            _ => None,
        }
    }

    /// Which cache entries this callback may run
    pub fn backend_match(&self) -> BackendMatch {
        match self {
            Callback::Compile(c) => BackendMatch::Exact(c.backend()),
            Callback::Disabled | Callback::Restricted => BackendMatch::Any,
        }
    }
}

impl<H: Host> Clone for Callback<H> {
    fn clone(&self) -> Self {
        match self {
            Callback::Disabled => Callback::Disabled,
            Callback::Restricted => Callback::Restricted,
            Callback::Compile(c) => Callback::Compile(Arc::clone(c)),
        }
    }
}

impl<H: Host> fmt::Debug for Callback<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Disabled => write!(f, "Disabled"),
            Callback::Restricted => write!(f, "Restricted"),
            Callback::Compile(c) => write!(f, "Compile({})", c.backend()),
        }
    }
}

/// Per-thread slot holding the active callback.
///
/// A host keeps one of these per thread of execution and passes it down its
/// call path; it is deliberately not `Sync`.
pub struct Interception<H: Host> {
    active: RefCell<Callback<H>>,
}

impl<H: Host> Interception<H> {
    pub fn new(callback: Callback<H>) -> Self {
        Interception {
            active: RefCell::new(callback),
        }
    }

    /// The callback in effect right now
    pub fn current(&self) -> Callback<H> {
        self.active.borrow().clone()
    }

    /// Install a callback, returning the previous one
    pub fn set(&self, callback: Callback<H>) -> Callback<H> {
        self.active.replace(callback)
    }

    /// Install `inner` for the lifetime of the returned scope.
    ///
    /// When `inner` is the caller's own callback nothing is installed and
    /// nothing is restored, so a frame that changes the callback itself keeps
    /// its change.
    #[must_use = "the callback is restored when the scope is dropped"]
    pub fn install(&self, outer: &Callback<H>, inner: &Callback<H>) -> CallbackScope<'_, H> {
        if inner.same_as(outer) {
            return CallbackScope {
                slot: self,
                restore: None,
            };
        }
        self.set(inner.clone());
        CallbackScope {
            slot: self,
            restore: Some(outer.clone()),
        }
    }

    /// Disable interception until the scope is dropped
    #[must_use = "interception is re-enabled when the scope is dropped"]
    pub fn suspend(&self) -> CallbackScope<'_, H> {
        let previous = self.set(Callback::Disabled);
        CallbackScope {
            slot: self,
            restore: Some(previous),
        }
    }
}

impl<H: Host> Default for Interception<H> {
    fn default() -> Self {
        Interception::new(Callback::Disabled)
    }
}

impl<H: Host> fmt::Debug for Interception<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interception")
            .field("active", &*self.active.borrow())
            .finish()
    }
}

/// Restores a callback when dropped
pub struct CallbackScope<'a, H: Host> {
    slot: &'a Interception<H>,
    restore: Option<Callback<H>>,
}

impl<H: Host> CallbackScope<'_, H> {
    /// End the scope without restoring, leaving its callback installed
    pub fn disarm(mut self) {
        self.restore = None;
    }
}

impl<H: Host> Drop for CallbackScope<'_, H> {
    fn drop(&mut self) {
        if let Some(callback) = self.restore.take() {
            self.slot.set(callback);
        }
    }
}
