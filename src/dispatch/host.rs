//! Host Runtime Boundary
//!
//! The dispatcher never looks inside a stack frame. Everything it needs from
//! the virtual machine goes through the [`Host`] trait:
//!
//! ```text
//! eval_default(frame)        ordinary interpretation, consumes the frame
//! eval_specialized(frame)    run a cached artifact in place of the unit
//! release_frame(frame)       finalize a frame that was superseded or failed
//! interception()             the per-thread ambient callback slot
//! ```
//!
//! Frames are handed to the dispatcher by value. Every exit path gives the
//! frame back to exactly one of `eval_default` or `release_frame`, so call
//! stack bookkeeping is finalized once and only once.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::callback::Interception;
use super::error::DispatchError;

/// Stable identity of a code unit, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(u64);

impl CodeId {
    /// Create a code id from a raw u64
    pub const fn from_raw(id: u64) -> Self {
        CodeId(id)
    }

    /// Get the raw u64 value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable, addressable block of interpretable logic.
///
/// Cloning is cheap: the name is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeUnit {
    id: CodeId,
    name: Arc<str>,
}

impl CodeUnit {
    pub fn new(id: CodeId, name: impl Into<Arc<str>>) -> Self {
        CodeUnit {
            id,
            name: name.into(),
        }
    }

    #[inline]
    pub fn id(&self) -> CodeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// A single local binding value as seen by guards and compilers.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Opaque host object, identified by its type and address
    Object { type_name: Arc<str>, id: u64 },
}

impl LocalValue {
    /// Name of the runtime type of this value
    pub fn type_name(&self) -> &str {
        match self {
            LocalValue::None => "none",
            LocalValue::Bool(_) => "bool",
            LocalValue::Int(_) => "int",
            LocalValue::Float(_) => "float",
            LocalValue::Str(_) => "str",
            LocalValue::Object { type_name, .. } => type_name,
        }
    }
}

impl fmt::Display for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalValue::None => write!(f, "None"),
            LocalValue::Bool(b) => write!(f, "{}", b),
            LocalValue::Int(n) => write!(f, "{}", n),
            LocalValue::Float(x) => write!(f, "{}", x),
            LocalValue::Str(s) => write!(f, "{:?}", s),
            LocalValue::Object { type_name, id } => write!(f, "<{} @{:#x}>", type_name, id),
        }
    }
}

/// Read-only view of a frame's local bindings.
///
/// Built once per intercepted call and shared by guard evaluation and the
/// compiler. It is a copy, so nothing done through it reaches the live frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalsSnapshot {
    bindings: SmallVec<[(Arc<str>, LocalValue); 8]>,
}

impl LocalsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding, replacing an earlier binding with the same name
    pub fn with(mut self, name: impl Into<Arc<str>>, value: LocalValue) -> Self {
        let name = name.into();
        match self.bindings.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.bindings.push((name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&LocalValue> {
        self.bindings
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }

    /// Bindings in frame order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LocalValue)> {
        self.bindings.iter().map(|(n, v)| (&**n, v))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl FromIterator<(Arc<str>, LocalValue)> for LocalsSnapshot {
    fn from_iter<I: IntoIterator<Item = (Arc<str>, LocalValue)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(LocalsSnapshot::new(), |snap, (n, v)| snap.with(n, v))
    }
}

/// What the dispatcher needs to see of a live call frame.
pub trait FrameView {
    /// The code unit this frame is executing
    fn code(&self) -> &CodeUnit;

    /// Build a snapshot of the frame's locals
    fn locals(&self) -> LocalsSnapshot;
}

/// The virtual machine the dispatcher is installed into.
pub trait Host: Sized + 'static {
    /// A pending call frame, owned by the dispatcher while it decides
    type Frame: FrameView;

    /// Specialized code produced by a compiler
    type Code: Send + Sync + 'static;

    /// Result of running a frame
    type Value;

    /// The host's own error type, able to carry dispatcher failures
    type Error: From<DispatchError>;

    /// The per-thread ambient callback consulted on every call
    fn interception(&self) -> &Interception<Self>;

    /// Run the frame under ordinary interpretation.
    ///
    /// Consumes the frame: default interpretation finalizes it.
    fn eval_default(&self, frame: Self::Frame, unwinding: bool)
        -> Result<Self::Value, Self::Error>;

    /// Run specialized code in place of the frame's own code unit.
    ///
    /// The frame stays with the dispatcher, which releases it afterwards.
    fn eval_specialized(
        &self,
        frame: &mut Self::Frame,
        code: &Self::Code,
        trace_label: &str,
        unwinding: bool,
    ) -> Result<Self::Value, Self::Error>;

    /// Finalize call-stack bookkeeping for a frame that was not default-evaluated
    fn release_frame(&self, frame: Self::Frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locals_snapshot_replaces_duplicate_names() {
        let snap = LocalsSnapshot::new()
            .with("x", LocalValue::Int(1))
            .with("y", LocalValue::Bool(true))
            .with("x", LocalValue::Int(2));

        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("x"), Some(&LocalValue::Int(2)));
        let names: Vec<&str> = snap.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_local_value_type_names() {
        assert_eq!(LocalValue::Int(3).type_name(), "int");
        assert_eq!(LocalValue::Str("a".into()).type_name(), "str");
        let obj = LocalValue::Object {
            type_name: "Tensor".into(),
            id: 0x10,
        };
        assert_eq!(obj.type_name(), "Tensor");
        assert_eq!(obj.to_string(), "<Tensor @0x10>");
    }

    #[test]
    fn test_code_unit_display() {
        let code = CodeUnit::new(CodeId::from_raw(7), "forward");
        assert_eq!(code.to_string(), "forward (#7)");
        assert_eq!(code.id().as_u64(), 7);
    }
}
