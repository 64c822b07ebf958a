//! Compiler callback boundary
//!
//! On a cache miss the dispatcher hands the frame to a [`FrameCompiler`]. The
//! compiler answers with a tagged [`CompileOutcome`]: either a new artifact
//! with the guard that protects it, or a control signal that changes how the
//! unit is treated from now on. Internal failures come back as `Err`.

use std::fmt;
use std::sync::Arc;

use super::backend::BackendId;
use super::cache::{CacheEntry, GuardPredicate};
use super::error::CompilerError;
use super::extra_state::RecompileBookkeeping;
use super::host::{Host, LocalsSnapshot};

/// Everything the compiler may look at for one miss
pub struct CompileRequest<'a, H: Host> {
    /// The frame being intercepted
    pub frame: &'a H::Frame,
    /// Snapshot of the frame's locals, the same one the guards just saw
    pub locals: &'a LocalsSnapshot,
    /// Current cache chain of the unit, in lookup order
    pub cache: &'a [Arc<CacheEntry<H>>],
    /// Compiler-owned history for this unit
    pub bookkeeping: &'a mut RecompileBookkeeping,
}

/// A freshly compiled artifact and its guards
pub struct CompiledArtifact<H: Host> {
    /// Code to run in place of the unit
    pub code: H::Code,
    /// Must hold for the artifact to be valid for a call
    pub guard: Arc<dyn GuardPredicate<H>>,
    /// Cheaper check used under the skip-guard-eval-unsafe stance
    pub diff_guard: Option<Arc<dyn GuardPredicate<H>>>,
    /// Label handed to the host when the artifact runs
    pub trace_label: String,
}

impl<H: Host> CompiledArtifact<H> {
    pub fn new(
        code: H::Code,
        guard: impl GuardPredicate<H> + 'static,
        trace_label: impl Into<String>,
    ) -> Self {
        CompiledArtifact {
            code,
            guard: Arc::new(guard),
            diff_guard: None,
            trace_label: trace_label.into(),
        }
    }

    pub fn with_diff_guard(mut self, guard: impl GuardPredicate<H> + 'static) -> Self {
        self.diff_guard = Some(Arc::new(guard));
        self
    }
}

/// What the compiler decided for a missed call
pub enum CompileOutcome<H: Host> {
    /// Cache this artifact and run it now
    Compiled(CompiledArtifact<H>),
    /// Never intercept this unit or anything it calls again
    SkipRecursive,
    /// The unit has been recompiled too often; only replay from now on
    CacheLimitHit,
    /// Nothing worth compiling in this unit itself
    NoAction,
}

impl<H: Host> fmt::Debug for CompileOutcome<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileOutcome::Compiled(a) => write!(f, "Compiled({:?})", a.trace_label),
            CompileOutcome::SkipRecursive => write!(f, "SkipRecursive"),
            CompileOutcome::CacheLimitHit => write!(f, "CacheLimitHit"),
            CompileOutcome::NoAction => write!(f, "NoAction"),
        }
    }
}

/// An external compiler backend.
///
/// Compilation is synchronous: the intercepted call waits for the outcome.
/// Interception is disabled on the calling thread while `compile` runs.
pub trait FrameCompiler<H: Host>: Send + Sync {
    /// Identity stamped on every artifact this compiler produces
    fn backend(&self) -> BackendId;

    fn compile(
        &self,
        host: &H,
        request: CompileRequest<'_, H>,
    ) -> Result<CompileOutcome<H>, CompilerError>;
}
