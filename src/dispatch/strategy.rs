//! Per-unit execution strategy
//!
//! Each code unit carries a pair of actions: one for calls to the unit itself
//! and one inherited by the calls it makes. The pair is packed into a single
//! byte so readers always observe both halves from the same write.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// What to do with a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FrameAction {
    /// Look up the cache and compile on a miss
    #[default]
    Default = 0,
    /// Interpret normally, no lookup and no compilation
    Skip = 1,
    /// Look up the cache but never compile
    RestrictedReplay = 2,
}

impl From<u8> for FrameAction {
    fn from(v: u8) -> Self {
        match v {
            0 => FrameAction::Default,
            1 => FrameAction::Skip,
            2 => FrameAction::RestrictedReplay,
            _ => FrameAction::Default,
        }
    }
}

impl fmt::Display for FrameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameAction::Default => write!(f, "default"),
            FrameAction::Skip => write!(f, "skip"),
            FrameAction::RestrictedReplay => write!(f, "restricted-replay"),
        }
    }
}

/// Action for the unit itself and for everything it calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExecStrategy {
    pub current: FrameAction,
    pub recursive: FrameAction,
}

impl ExecStrategy {
    pub const DEFAULT: ExecStrategy = ExecStrategy::new(FrameAction::Default, FrameAction::Default);

    /// Set when the compiler asks to skip the unit and its callees
    pub const SKIP_RECURSIVE: ExecStrategy = ExecStrategy::new(FrameAction::Skip, FrameAction::Skip);

    /// Set when the compiler reports the unit's cache is full
    pub const CACHE_LIMIT: ExecStrategy =
        ExecStrategy::new(FrameAction::RestrictedReplay, FrameAction::RestrictedReplay);

    /// Set when the compiler produced nothing for this unit
    pub const SKIP_SELF: ExecStrategy = ExecStrategy::new(FrameAction::Skip, FrameAction::Default);

    pub const fn new(current: FrameAction, recursive: FrameAction) -> Self {
        ExecStrategy { current, recursive }
    }

    #[inline]
    fn pack(self) -> u8 {
        (self.current as u8) | ((self.recursive as u8) << 4)
    }

    #[inline]
    fn unpack(bits: u8) -> Self {
        ExecStrategy {
            current: FrameAction::from(bits & 0x0f),
            recursive: FrameAction::from(bits >> 4),
        }
    }
}

impl fmt::Display for ExecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.current, self.recursive)
    }
}

/// Tear-free shared cell for an [`ExecStrategy`]
#[derive(Debug)]
pub struct AtomicStrategy(AtomicU8);

impl AtomicStrategy {
    pub fn new(strategy: ExecStrategy) -> Self {
        AtomicStrategy(AtomicU8::new(strategy.pack()))
    }

    #[inline]
    pub fn load(&self) -> ExecStrategy {
        ExecStrategy::unpack(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, strategy: ExecStrategy) {
        self.0.store(strategy.pack(), Ordering::Release);
    }

    /// Store a new strategy, returning the previous one
    pub fn swap(&self, strategy: ExecStrategy) -> ExecStrategy {
        ExecStrategy::unpack(self.0.swap(strategy.pack(), Ordering::AcqRel))
    }
}

impl Default for AtomicStrategy {
    fn default() -> Self {
        AtomicStrategy::new(ExecStrategy::DEFAULT)
    }
}
