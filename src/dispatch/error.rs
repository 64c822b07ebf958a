//! Error types for frame dispatch.

use std::fmt;

/// A guard predicate raised while being evaluated
#[derive(Debug, Clone, PartialEq)]
pub struct GuardError {
    message: String,
}

impl GuardError {
    pub fn new(message: impl Into<String>) -> Self {
        GuardError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard evaluation failed: {}", self.message)
    }
}

impl std::error::Error for GuardError {}

/// The external compiler failed internally
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerError {
    message: String,
}

impl CompilerError {
    pub fn new(message: impl Into<String>) -> Self {
        CompilerError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compiler internal error: {}", self.message)
    }
}

impl std::error::Error for CompilerError {}

/// Failures surfaced to the host's call machinery.
///
/// None of these are retried. Falling back to default interpretation on a
/// miss is policy, not recovery, and never produces an error.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// A guard predicate raised during cache lookup
    GuardEvaluation(GuardError),
    /// The compiler callback failed; interception state is left as it was
    CompilerInternal(CompilerError),
    /// A cache miss happened while recompilation was asserted not to happen
    StaleWarmup { code: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuardEvaluation(e) => write!(f, "{}", e),
            Self::CompilerInternal(e) => write!(f, "{}", e),
            Self::StaleWarmup { code } => write!(
                f,
                "{}: Recompilation triggered with skip_guard_eval_unsafe stance. \
                 This usually means that you have not warmed up your model \
                 with enough inputs such that you can guarantee no more recompilations.",
                code
            ),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::GuardEvaluation(e) => Some(e),
            Self::CompilerInternal(e) => Some(e),
            Self::StaleWarmup { .. } => None,
        }
    }
}

impl From<GuardError> for DispatchError {
    fn from(e: GuardError) -> Self {
        DispatchError::GuardEvaluation(e)
    }
}

impl From<CompilerError> for DispatchError {
    fn from(e: CompilerError) -> Self {
        DispatchError::CompilerInternal(e)
    }
}
