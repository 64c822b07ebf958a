//! Dispatch statistics
//!
//! Counters are plain relaxed atomics so recording them on the hot path never
//! contends; [`DispatchStats`] is a point-in-time copy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for frame dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Calls that entered the dispatcher
    pub calls: u64,
    /// Calls made while unwinding, passed straight through
    pub unwinds: u64,
    /// Calls with interception disabled or nothing to replay
    pub passthroughs: u64,
    /// Calls skipped by the unit's strategy
    pub skips: u64,
    /// Guard lookups performed
    pub lookups: u64,
    /// Lookups that found an artifact
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Misses that fell back to default interpretation under restricted replay
    pub replay_fallbacks: u64,
    /// Compiler invocations
    pub compiles: u64,
    /// Artifacts added to a cache chain
    pub artifacts: u64,
    /// Skip-recursive signals from the compiler
    pub skip_recursive: u64,
    /// Cache-limit signals from the compiler
    pub cache_limits: u64,
    /// No-action results from the compiler
    pub no_actions: u64,
    /// Guards that raised
    pub guard_errors: u64,
    /// Compiler internal failures
    pub compiler_errors: u64,
    /// Misses under the skip-guard-eval-unsafe stance
    pub stale_warmups: u64,
}

impl DispatchStats {
    /// Hit rate as a percentage of lookups
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / self.lookups as f64) * 100.0
        }
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "calls:            {}", self.calls)?;
        writeln!(f, "unwinds:          {}", self.unwinds)?;
        writeln!(f, "passthroughs:     {}", self.passthroughs)?;
        writeln!(f, "skips:            {}", self.skips)?;
        writeln!(f, "lookups:          {}", self.lookups)?;
        writeln!(f, "hits:             {} ({:.1}%)", self.hits, self.hit_rate())?;
        writeln!(f, "misses:           {}", self.misses)?;
        writeln!(f, "replay fallbacks: {}", self.replay_fallbacks)?;
        writeln!(f, "compiles:         {}", self.compiles)?;
        writeln!(f, "artifacts:        {}", self.artifacts)?;
        writeln!(f, "skip recursive:   {}", self.skip_recursive)?;
        writeln!(f, "cache limits:     {}", self.cache_limits)?;
        writeln!(f, "no actions:       {}", self.no_actions)?;
        writeln!(f, "guard errors:     {}", self.guard_errors)?;
        writeln!(f, "compiler errors:  {}", self.compiler_errors)?;
        write!(f, "stale warmups:    {}", self.stale_warmups)
    }
}

/// Which counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Call,
    Unwind,
    Passthrough,
    Skip,
    Lookup,
    Hit,
    Miss,
    ReplayFallback,
    Compile,
    Artifact,
    SkipRecursive,
    CacheLimit,
    NoAction,
    GuardError,
    CompilerError,
    StaleWarmup,
}

const EVENT_COUNT: usize = 16;

/// Lock-free counters behind [`DispatchStats`]
#[derive(Debug)]
pub(crate) struct DispatchCounters {
    counters: [AtomicU64; EVENT_COUNT],
}

impl DispatchCounters {
    pub(crate) fn new() -> Self {
        DispatchCounters {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub(crate) fn record(&self, event: Event) {
        self.counters[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self, event: Event) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            calls: self.get(Event::Call),
            unwinds: self.get(Event::Unwind),
            passthroughs: self.get(Event::Passthrough),
            skips: self.get(Event::Skip),
            lookups: self.get(Event::Lookup),
            hits: self.get(Event::Hit),
            misses: self.get(Event::Miss),
            replay_fallbacks: self.get(Event::ReplayFallback),
            compiles: self.get(Event::Compile),
            artifacts: self.get(Event::Artifact),
            skip_recursive: self.get(Event::SkipRecursive),
            cache_limits: self.get(Event::CacheLimit),
            no_actions: self.get(Event::NoAction),
            guard_errors: self.get(Event::GuardError),
            compiler_errors: self.get(Event::CompilerError),
            stale_warmups: self.get(Event::StaleWarmup),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for DispatchCounters {
    fn default() -> Self {
        DispatchCounters::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot_and_reset() {
        let counters = DispatchCounters::new();
        counters.record(Event::Call);
        counters.record(Event::Lookup);
        counters.record(Event::Lookup);
        counters.record(Event::Hit);
        counters.record(Event::StaleWarmup);

        let stats = counters.snapshot();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stale_warmups, 1);
        assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);

        counters.reset();
        assert_eq!(counters.snapshot(), DispatchStats::default());
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert_eq!(DispatchStats::default().hit_rate(), 0.0);
    }
}
