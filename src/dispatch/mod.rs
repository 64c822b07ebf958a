//! Frame Dispatch
//!
//! The [`Dispatcher`] is installed into a host's function-call path and runs
//! on every invocation of an interpreted code unit. For each call it decides
//! between ordinary interpretation, running a cached specialized artifact,
//! and asking the compiler for a new artifact:
//!
//! ```text
//!  eval_frame(frame)
//!    │
//!    ├─ unwinding? ───────────────────────────────▶ default
//!    ├─ disabled, or restricted with no state? ───▶ default
//!    ├─ strategy.current == Skip? ────────────────▶ default (children narrowed)
//!    │
//!    ├─ [interception suspended]
//!    │    lookup(chain, locals, backend)
//!    │      ├─ guard raised ──────────────────────▶ release, GuardEvaluation
//!    │      ├─ hit ───────────────────────────────▶ specialized
//!    │      └─ miss
//!    │           ├─ skip-guard-eval-unsafe ───────▶ release, StaleWarmup
//!    │           ├─ restricted replay ────────────▶ default
//!    │           └─ compile
//!    │                ├─ error ───────────────────▶ release, CompilerInternal
//!    │                ├─ SkipRecursive ───────────▶ {Skip, Skip}, default
//!    │                ├─ CacheLimitHit ───────────▶ {Replay, Replay}, default
//!    │                ├─ NoAction ────────────────▶ {Skip, Default}, default
//!    │                └─ Compiled ────────────────▶ insert entry, specialized
//!    └─ [caller's callback restored, or left disabled on failure]
//! ```
//!
//! ## Invariants
//!
//! - An artifact only runs when its guard held for this call's locals and
//!   its backend matched the active one.
//! - While guards and the compiler run, the ambient callback is `Disabled`,
//!   so anything they call is interpreted and never re-enters the dispatcher.
//! - Every frame is consumed exactly once: by `Host::eval_default`, or by
//!   `Host::release_frame` after specialized execution or a failure.
//! - A compiler error leaves the unit's strategy untouched; a broken compiler
//!   is not silently turned into a skip.
//! - A failed call (guard error, stale warmup, compiler error) leaves the
//!   thread's callback `Disabled`. Nothing is compiled or replayed on that
//!   thread again until the host installs a callback.

pub mod backend;
pub mod cache;
pub mod callback;
pub mod compiler;
pub mod error;
pub mod extra_state;
pub mod host;
pub mod stats;
pub mod strategy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, trace_span, warn};

pub use backend::{BackendId, BackendMatch};
pub use cache::{CacheChain, CacheEntry, ChainOrder, GuardPredicate, GuardStance};
pub use callback::{Callback, CallbackScope, Interception};
pub use compiler::{CompileOutcome, CompileRequest, CompiledArtifact, FrameCompiler};
pub use error::{CompilerError, DispatchError, GuardError};
pub use extra_state::{ExtraState, ExtraStateTable, RecompileBookkeeping};
pub use host::{CodeId, CodeUnit, FrameView, Host, LocalValue, LocalsSnapshot};
pub use stats::DispatchStats;
pub use strategy::{ExecStrategy, FrameAction};

use crate::config::DispatchConfig;
use stats::{DispatchCounters, Event};

/// What to do with a frame once lookup and compilation are over
enum Decision<H: Host> {
    Default,
    Specialized(Arc<CacheEntry<H>>),
    Fail(DispatchError),
}

/// Call-path hook deciding how each code unit invocation runs.
///
/// One dispatcher is shared by every thread of a host; the ambient callback
/// lives with the host, per thread.
pub struct Dispatcher<H: Host> {
    states: ExtraStateTable<H>,
    skip_guard_eval_unsafe: AtomicBool,
    chain_order: ChainOrder,
    promote_on_hit: bool,
    counters: DispatchCounters,
}

impl<H: Host> Dispatcher<H> {
    pub fn new(config: DispatchConfig) -> Self {
        Dispatcher {
            states: ExtraStateTable::new(),
            skip_guard_eval_unsafe: AtomicBool::new(config.skip_guard_eval_unsafe),
            chain_order: config.chain_order,
            promote_on_hit: config.promote_on_hit,
            counters: DispatchCounters::new(),
        }
    }

    /// Run one call of a code unit.
    ///
    /// `unwinding` is set when the host is propagating an exception through
    /// the frame; such calls are always default-evaluated.
    pub fn eval_frame(
        &self,
        host: &H,
        frame: H::Frame,
        unwinding: bool,
    ) -> Result<H::Value, H::Error> {
        self.counters.record(Event::Call);

        if unwinding {
            trace!(code = %frame.code(), "unwinding, running default");
            self.counters.record(Event::Unwind);
            return host.eval_default(frame, unwinding);
        }

        let callback = host.interception().current();
        let code = frame.code().clone();
        let existing = self.states.get(code.id());

        if callback.is_disabled() || (callback.is_restricted() && existing.is_none()) {
            trace!(code = %code, ?callback, "nothing to intercept, running default");
            self.counters.record(Event::Passthrough);
            return host.eval_default(frame, unwinding);
        }

        let extra = match existing {
            Some(extra) => extra,
            None => self.states.get_or_create(&code),
        };

        let strategy = extra.strategy();
        let mut recursive = callback.clone();
        if strategy.current != FrameAction::Default {
            match strategy.recursive {
                FrameAction::Skip => recursive = Callback::Disabled,
                FrameAction::RestrictedReplay => recursive = Callback::Restricted,
                FrameAction::Default => {}
            }
        }

        if strategy.current == FrameAction::Skip {
            trace!(code = %code, %strategy, "skip");
            self.counters.record(Event::Skip);
            return self.run_default(host, frame, unwinding, &callback, &recursive);
        }

        let locals = frame.locals();
        let suspended = host.interception().suspend();
        let decision =
            self.decide(host, &frame, &extra, &locals, &callback, strategy, &mut recursive);

        match decision {
            Decision::Default => {
                drop(suspended);
                self.run_default(host, frame, unwinding, &callback, &recursive)
            }
            Decision::Specialized(entry) => {
                drop(suspended);
                self.run_specialized(host, frame, unwinding, &entry, &callback, &recursive)
            }
            Decision::Fail(err) => {
                suspended.disarm();
                debug!(code = %code, "interception left disabled after failure");
                host.release_frame(frame);
                Err(err.into())
            }
        }
    }

    /// Lookup, then on a miss either refuse, replay or compile.
    ///
    /// Runs with interception suspended.
    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        host: &H,
        frame: &H::Frame,
        extra: &ExtraState<H>,
        locals: &LocalsSnapshot,
        callback: &Callback<H>,
        strategy: ExecStrategy,
        recursive: &mut Callback<H>,
    ) -> Decision<H> {
        let code = extra.code();
        let stance = self.guard_stance();

        self.counters.record(Event::Lookup);
        let found = {
            let _span = trace_span!("cache_lookup", code = %code.name()).entered();
            extra.chain().lookup(
                host,
                locals,
                callback.backend_match(),
                stance,
                self.promote_on_hit,
            )
        };

        match found {
            Err(e) => {
                warn!(code = %code, error = %e, "guard evaluation failed");
                self.counters.record(Event::GuardError);
                return Decision::Fail(DispatchError::GuardEvaluation(e));
            }
            Ok(Some(entry)) => {
                trace!(code = %code, label = entry.trace_label(), "cache hit");
                self.counters.record(Event::Hit);
                return Decision::Specialized(entry);
            }
            Ok(None) => {
                trace!(code = %code, entries = extra.chain().len(), "cache miss");
                self.counters.record(Event::Miss);
            }
        }

        if stance == GuardStance::SkipUnsafe {
            warn!(code = %code, "recompilation under skip_guard_eval_unsafe");
            self.counters.record(Event::StaleWarmup);
            return Decision::Fail(DispatchError::StaleWarmup {
                code: code.name().to_string(),
            });
        }

        let run_only =
            strategy.current == FrameAction::RestrictedReplay || callback.is_restricted();
        if run_only {
            trace!(code = %code, "restricted replay, running default");
            self.counters.record(Event::ReplayFallback);
            return Decision::Default;
        }

        let compiler = match callback {
            Callback::Compile(compiler) => compiler,
            // Disabled returned before lookup and Restricted stopped at run_only
            Callback::Disabled | Callback::Restricted => return Decision::Default,
        };

        self.counters.record(Event::Compile);
        // Interception is suspended, so this thread cannot re-enter the same
        // unit while holding its bookkeeping. The lock is held until the new
        // entry is inserted, so concurrent compiles of a unit see each
        // other's entries.
        let mut bookkeeping = extra.bookkeeping();
        let cache = extra.chain().entries();
        let outcome = compiler.compile(
            host,
            CompileRequest {
                frame,
                locals,
                cache: &cache,
                bookkeeping: &mut *bookkeeping,
            },
        );

        match outcome {
            Err(e) => {
                warn!(code = %code, error = %e, "compiler failed");
                self.counters.record(Event::CompilerError);
                Decision::Fail(DispatchError::CompilerInternal(e))
            }
            Ok(CompileOutcome::SkipRecursive) => {
                debug!(code = %code, "skip recursive");
                self.counters.record(Event::SkipRecursive);
                extra.set_strategy(ExecStrategy::SKIP_RECURSIVE);
                if strategy.recursive == FrameAction::Default {
                    *recursive = Callback::Disabled;
                }
                Decision::Default
            }
            Ok(CompileOutcome::CacheLimitHit) => {
                debug!(code = %code, "cache limit hit");
                self.counters.record(Event::CacheLimit);
                extra.set_strategy(ExecStrategy::CACHE_LIMIT);
                if strategy.recursive == FrameAction::Default {
                    *recursive = Callback::Restricted;
                }
                Decision::Default
            }
            Ok(CompileOutcome::NoAction) => {
                debug!(code = %code, "nothing compiled, skipping unit");
                self.counters.record(Event::NoAction);
                extra.set_strategy(ExecStrategy::SKIP_SELF);
                Decision::Default
            }
            Ok(CompileOutcome::Compiled(artifact)) => {
                let entry = extra
                    .chain()
                    .insert(CacheEntry::new(artifact, compiler.backend()), self.chain_order);
                debug!(code = %code, label = entry.trace_label(), "cache entry created");
                self.counters.record(Event::Artifact);
                Decision::Specialized(entry)
            }
        }
    }

    fn run_default(
        &self,
        host: &H,
        frame: H::Frame,
        unwinding: bool,
        callback: &Callback<H>,
        recursive: &Callback<H>,
    ) -> Result<H::Value, H::Error> {
        let _scope = host.interception().install(callback, recursive);
        host.eval_default(frame, unwinding)
    }

    fn run_specialized(
        &self,
        host: &H,
        mut frame: H::Frame,
        unwinding: bool,
        entry: &CacheEntry<H>,
        callback: &Callback<H>,
        recursive: &Callback<H>,
    ) -> Result<H::Value, H::Error> {
        let result = {
            let _scope = host.interception().install(callback, recursive);
            host.eval_specialized(&mut frame, entry.code(), entry.trace_label(), unwinding)
        };
        // The original frame was superseded; finalize it whatever the outcome
        host.release_frame(frame);
        result
    }

    fn guard_stance(&self) -> GuardStance {
        if self.skip_guard_eval_unsafe() {
            GuardStance::SkipUnsafe
        } else {
            GuardStance::Full
        }
    }

    /// Whether a cache miss is currently treated as an error
    pub fn skip_guard_eval_unsafe(&self) -> bool {
        self.skip_guard_eval_unsafe.load(Ordering::Acquire)
    }

    /// Switch the skip-guard-eval-unsafe stance, returning the previous value
    pub fn set_skip_guard_eval_unsafe(&self, enabled: bool) -> bool {
        self.skip_guard_eval_unsafe.swap(enabled, Ordering::AcqRel)
    }

    pub fn chain_order(&self) -> ChainOrder {
        self.chain_order
    }

    /// State of a unit, if it has been intercepted
    pub fn extra_state(&self, id: CodeId) -> Option<Arc<ExtraState<H>>> {
        self.states.get(id)
    }

    pub fn code_strategy(&self, id: CodeId) -> Option<ExecStrategy> {
        self.states.get(id).map(|extra| extra.strategy())
    }

    /// Override a unit's strategy, returning the previous one
    pub fn set_code_strategy(&self, code: &CodeUnit, strategy: ExecStrategy) -> ExecStrategy {
        debug!(code = %code, %strategy, "strategy set externally");
        self.states.get_or_create(code).set_strategy(strategy)
    }

    /// Forget everything about a unit: cache, strategy and bookkeeping
    pub fn reset_code(&self, id: CodeId) -> bool {
        self.states.remove(id).is_some()
    }

    /// The unit's cache chain in lookup order
    pub fn cache_entries(&self, id: CodeId) -> Vec<Arc<CacheEntry<H>>> {
        self.states
            .get(id)
            .map(|extra| extra.chain().entries())
            .unwrap_or_default()
    }

    pub fn tracked_units(&self) -> Vec<CodeUnit> {
        self.states.units()
    }

    /// Drop the state of every unit
    pub fn clear(&self) {
        self.states.clear();
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}

impl<H: Host> Default for Dispatcher<H> {
    fn default() -> Self {
        Dispatcher::new(DispatchConfig::default())
    }
}
