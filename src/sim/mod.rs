//! Reference host
//!
//! A deliberately small interpreter that implements [`Host`] so the
//! dispatcher can be exercised end to end: named functions that call other
//! functions, a per-thread ambient callback, an execution log and frame
//! counters for checking cleanup.
//!
//! ```ignore
//! let mut program = Program::new();
//! program.define("outer", &["inner"]);
//! program.define("inner", &[]);
//!
//! let vm = SimVm::new(Arc::new(program), Arc::new(Dispatcher::default()));
//! vm.set_callback(Callback::compile(TypeSpecializingCompiler::new("eager")));
//! vm.call("outer", LocalsSnapshot::new().with("x", LocalValue::Int(1)))?;
//! ```

pub mod compiler;
pub mod scenario;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::{
    Callback, CodeId, CodeUnit, DispatchError, Dispatcher, FrameView, Host, Interception,
    LocalsSnapshot,
};

pub use compiler::TypeSpecializingCompiler;
pub use scenario::{CallReport, Scenario, ScenarioReport};

/// A function of the simulated program
#[derive(Debug)]
pub struct SimFunction {
    code: CodeUnit,
    calls: Vec<String>,
}

impl SimFunction {
    pub fn code(&self) -> &CodeUnit {
        &self.code
    }

    /// Functions called, in order, every time this one runs
    pub fn calls(&self) -> &[String] {
        &self.calls
    }
}

/// The functions a [`SimVm`] can run
#[derive(Debug, Default)]
pub struct Program {
    functions: HashMap<String, Arc<SimFunction>>,
    next_id: u64,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a function, returning its code unit.
    ///
    /// Redefinition gets a fresh code id, like recompiling source would.
    pub fn define(&mut self, name: &str, calls: &[&str]) -> CodeUnit {
        self.next_id += 1;
        let code = CodeUnit::new(CodeId::from_raw(self.next_id), name);
        let function = SimFunction {
            code: code.clone(),
            calls: calls.iter().map(|c| c.to_string()).collect(),
        };
        self.functions.insert(name.to_string(), Arc::new(function));
        code
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SimFunction>> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Check that every called function is defined
    pub fn validate(&self) -> Result<(), SimError> {
        for function in self.functions.values() {
            for callee in &function.calls {
                if !self.functions.contains_key(callee) {
                    return Err(SimError::UnknownFunction(callee.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Specialized code produced by [`TypeSpecializingCompiler`]
#[derive(Debug, Clone)]
pub struct SimCode {
    label: String,
    signature: Vec<(String, String)>,
    /// Locals telling this code apart from its siblings in the cache, shared
    /// with the artifact's diff guard and rewritten whenever a sibling is added
    distinguishing: Arc<RwLock<Vec<(String, String)>>>,
}

impl SimCode {
    pub fn new(label: impl Into<String>, signature: Vec<(String, String)>) -> Self {
        SimCode {
            label: label.into(),
            signature,
            distinguishing: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Local names and the types this code was specialized for
    pub fn signature(&self) -> &[(String, String)] {
        &self.signature
    }

    pub fn type_of(&self, local: &str) -> Option<&str> {
        self.signature
            .iter()
            .find(|(name, _)| name == local)
            .map(|(_, ty)| ty.as_str())
    }

    /// Locals the diff guard checks; empty means the whole signature
    pub fn distinguishing(&self) -> Vec<(String, String)> {
        self.distinguishing.read().clone()
    }

    pub(crate) fn set_distinguishing(&self, locals: Vec<(String, String)>) {
        *self.distinguishing.write() = locals;
    }

    pub(crate) fn distinguishing_cell(&self) -> Arc<RwLock<Vec<(String, String)>>> {
        Arc::clone(&self.distinguishing)
    }
}

/// A pending call
#[derive(Debug)]
pub struct SimFrame {
    function: Arc<SimFunction>,
    locals: LocalsSnapshot,
}

impl FrameView for SimFrame {
    fn code(&self) -> &CodeUnit {
        &self.function.code
    }

    fn locals(&self) -> LocalsSnapshot {
        self.locals.clone()
    }
}

/// How a frame ended up running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecPath {
    Interpreted,
    Specialized(String),
}

impl fmt::Display for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecPath::Interpreted => write!(f, "interpreted"),
            ExecPath::Specialized(label) => write!(f, "specialized {}", label),
        }
    }
}

/// One executed frame, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub function: String,
    pub path: ExecPath,
    pub depth: usize,
}

/// Frame lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    /// Frames handed to the dispatcher
    pub created: u64,
    /// Frames finalized by default interpretation
    pub defaulted: u64,
    /// Frames finalized by `release_frame`
    pub released: u64,
}

impl FrameCounts {
    /// Frames finalized one way or the other
    pub fn finalized(&self) -> u64 {
        self.defaulted + self.released
    }
}

/// Errors raised by the reference host
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    UnknownFunction(String),
    Dispatch(DispatchError),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "Unknown function: {}", name),
            Self::Dispatch(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(e) => Some(e),
            Self::UnknownFunction(_) => None,
        }
    }
}

impl From<DispatchError> for SimError {
    fn from(e: DispatchError) -> Self {
        SimError::Dispatch(e)
    }
}

/// One thread of the simulated interpreter
pub struct SimVm {
    program: Arc<Program>,
    dispatcher: Arc<Dispatcher<SimVm>>,
    interception: Interception<SimVm>,
    events: RefCell<Vec<ExecEvent>>,
    depth: Cell<usize>,
    frames: Cell<FrameCounts>,
}

impl SimVm {
    pub fn new(program: Arc<Program>, dispatcher: Arc<Dispatcher<SimVm>>) -> Self {
        SimVm {
            program,
            dispatcher,
            interception: Interception::default(),
            events: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            frames: Cell::new(FrameCounts::default()),
        }
    }

    /// A VM with no functions and its own dispatcher
    pub fn standalone() -> Self {
        SimVm::new(Arc::new(Program::new()), Arc::new(Dispatcher::default()))
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<SimVm>> {
        &self.dispatcher
    }

    /// Install the ambient callback, returning the previous one
    pub fn set_callback(&self, callback: Callback<SimVm>) -> Callback<SimVm> {
        self.interception.set(callback)
    }

    /// Call a function through the dispatcher
    pub fn call(&self, name: &str, locals: LocalsSnapshot) -> Result<ExecPath, SimError> {
        self.call_with(name, locals, false)
    }

    /// Call a function while an exception is propagating through it
    pub fn call_unwinding(&self, name: &str, locals: LocalsSnapshot) -> Result<ExecPath, SimError> {
        self.call_with(name, locals, true)
    }

    pub fn call_with(
        &self,
        name: &str,
        locals: LocalsSnapshot,
        unwinding: bool,
    ) -> Result<ExecPath, SimError> {
        let function = self
            .program
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::UnknownFunction(name.to_string()))?;
        self.bump(|c| c.created += 1);

        let frame = SimFrame { function, locals };
        self.depth.set(self.depth.get() + 1);
        let result = self.dispatcher.eval_frame(self, frame, unwinding);
        self.depth.set(self.depth.get() - 1);
        result
    }

    /// Executed frames so far
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.borrow().clone()
    }

    /// Executed frames so far, clearing the log
    pub fn take_events(&self) -> Vec<ExecEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn frame_counts(&self) -> FrameCounts {
        self.frames.get()
    }

    fn bump(&self, update: impl FnOnce(&mut FrameCounts)) {
        let mut counts = self.frames.get();
        update(&mut counts);
        self.frames.set(counts);
    }

    fn run_body(&self, frame: &SimFrame, path: ExecPath) -> Result<ExecPath, SimError> {
        self.events.borrow_mut().push(ExecEvent {
            function: frame.function.code.name().to_string(),
            path: path.clone(),
            depth: self.depth.get(),
        });
        for callee in &frame.function.calls {
            self.call(callee, frame.locals.clone())?;
        }
        Ok(path)
    }
}

impl Host for SimVm {
    type Frame = SimFrame;
    type Code = SimCode;
    type Value = ExecPath;
    type Error = SimError;

    fn interception(&self) -> &Interception<Self> {
        &self.interception
    }

    fn eval_default(&self, frame: SimFrame, _unwinding: bool) -> Result<ExecPath, SimError> {
        self.bump(|c| c.defaulted += 1);
        self.run_body(&frame, ExecPath::Interpreted)
    }

    fn eval_specialized(
        &self,
        frame: &mut SimFrame,
        code: &SimCode,
        trace_label: &str,
        _unwinding: bool,
    ) -> Result<ExecPath, SimError> {
        debug_assert_eq!(code.label(), trace_label);
        self.run_body(frame, ExecPath::Specialized(trace_label.to_string()))
    }

    fn release_frame(&self, _frame: SimFrame) {
        self.bump(|c| c.released += 1);
    }
}

impl fmt::Debug for SimVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimVm")
            .field("interception", &self.interception)
            .field("frames", &self.frames.get())
            .finish()
    }
}
