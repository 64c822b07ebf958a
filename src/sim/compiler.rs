//! Type-specializing compiler for the reference host
//!
//! Specializes a unit on the runtime types of its locals. The guard of each
//! artifact checks that every local still has the type it was compiled for.
//! Per-unit behaviour (skip, no action, internal failure, raising guards)
//! is configured by unit name so tests and scenarios can drive every outcome
//! of the dispatcher.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{SimCode, SimVm};
use crate::dispatch::{
    BackendId, CacheEntry, CompileOutcome, CompileRequest, CompiledArtifact, CompilerError,
    FrameCompiler, FrameView, GuardError, LocalsSnapshot,
};

/// Default number of artifacts per unit before the compiler gives up
pub const DEFAULT_CACHE_SIZE_LIMIT: u64 = 8;

/// Bookkeeping counter of compiled artifacts
const COMPILES: &str = "compiles";

type Signature = Vec<(String, String)>;

/// Compiler that specializes units on the types of their locals
pub struct TypeSpecializingCompiler {
    backend: BackendId,
    cache_size_limit: u64,
    diff_guards: bool,
    skip_recursive: HashSet<String>,
    no_action: HashSet<String>,
    failing: HashSet<String>,
    raising_guards: HashSet<String>,
    guard_calls: HashMap<String, String>,
    invocations: AtomicU64,
}

impl TypeSpecializingCompiler {
    pub fn new(backend: &str) -> Self {
        TypeSpecializingCompiler {
            backend: BackendId::intern(backend),
            cache_size_limit: DEFAULT_CACHE_SIZE_LIMIT,
            diff_guards: false,
            skip_recursive: HashSet::new(),
            no_action: HashSet::new(),
            failing: HashSet::new(),
            raising_guards: HashSet::new(),
            guard_calls: HashMap::new(),
            invocations: AtomicU64::new(0),
        }
    }

    /// Artifacts per unit before answering `CacheLimitHit`
    pub fn with_cache_size_limit(mut self, limit: u64) -> Self {
        self.cache_size_limit = limit;
        self
    }

    /// Attach a diff guard to every artifact
    pub fn with_diff_guards(mut self) -> Self {
        self.diff_guards = true;
        self
    }

    /// Answer `SkipRecursive` for this unit
    pub fn skip(mut self, unit: &str) -> Self {
        self.skip_recursive.insert(unit.to_string());
        self
    }

    /// Answer `NoAction` for this unit
    pub fn no_action(mut self, unit: &str) -> Self {
        self.no_action.insert(unit.to_string());
        self
    }

    /// Fail internally when asked to compile this unit
    pub fn fail(mut self, unit: &str) -> Self {
        self.failing.insert(unit.to_string());
        self
    }

    /// Artifacts of this unit get a guard that raises
    pub fn raise_in_guard(mut self, unit: &str) -> Self {
        self.raising_guards.insert(unit.to_string());
        self
    }

    /// Artifacts of `unit` get a guard that calls `callee` before checking
    pub fn guard_calls(mut self, unit: &str, callee: &str) -> Self {
        self.guard_calls.insert(unit.to_string(), callee.to_string());
        self
    }

    /// Times `compile` has been called
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn build(
        &self,
        unit: &str,
        signature: Signature,
        cache: &[Arc<CacheEntry<SimVm>>],
        label: String,
    ) -> CompiledArtifact<SimVm> {
        let code = SimCode::new(label.clone(), signature.clone());

        let mut artifact = if self.raising_guards.contains(unit) {
            let message = format!("guard of {} raised", label);
            CompiledArtifact::new(
                code,
                move |_: &SimVm, _: &LocalsSnapshot| -> Result<bool, GuardError> {
                    Err(GuardError::new(message.clone()))
                },
                label,
            )
        } else if let Some(callee) = self.guard_calls.get(unit).cloned() {
            let expected = signature.clone();
            CompiledArtifact::new(
                code,
                move |vm: &SimVm, locals: &LocalsSnapshot| -> Result<bool, GuardError> {
                    vm.call(&callee, locals.clone())
                        .map_err(|e| GuardError::new(e.to_string()))?;
                    Ok(signature_holds(&expected, locals))
                },
                label,
            )
        } else {
            let expected = signature.clone();
            CompiledArtifact::new(
                code,
                move |_: &SimVm, locals: &LocalsSnapshot| -> Result<bool, GuardError> {
                    Ok(signature_holds(&expected, locals))
                },
                label,
            )
        };

        if self.diff_guards {
            let cell = artifact.code.distinguishing_cell();
            artifact = artifact.with_diff_guard(
                move |_: &SimVm, locals: &LocalsSnapshot| -> Result<bool, GuardError> {
                    let distinguishing = cell.read();
                    if distinguishing.is_empty() {
                        Ok(signature_holds(&signature, locals))
                    } else {
                        Ok(signature_holds_partially(&distinguishing, locals))
                    }
                },
            );
            rebuild_diff_guards(&artifact.code, cache);
        }

        artifact
    }
}

impl FrameCompiler<SimVm> for TypeSpecializingCompiler {
    fn backend(&self) -> BackendId {
        self.backend
    }

    fn compile(
        &self,
        _host: &SimVm,
        request: CompileRequest<'_, SimVm>,
    ) -> Result<CompileOutcome<SimVm>, CompilerError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let unit = request.frame.code().name().to_string();

        if self.failing.contains(&unit) {
            return Err(CompilerError::new(format!("cannot compile {}", unit)));
        }
        if self.skip_recursive.contains(&unit) {
            return Ok(CompileOutcome::SkipRecursive);
        }
        if self.no_action.contains(&unit) {
            return Ok(CompileOutcome::NoAction);
        }
        if request.bookkeeping.count(COMPILES) >= self.cache_size_limit {
            request
                .bookkeeping
                .record(format!("cache size limit {} reached", self.cache_size_limit));
            return Ok(CompileOutcome::CacheLimitHit);
        }

        let signature: Signature = request
            .locals
            .iter()
            .map(|(name, value)| (name.to_string(), value.type_name().to_string()))
            .collect();
        if let Some(reason) = recompile_reason(&signature, request.cache) {
            debug!(unit = %unit, reason = %reason, "recompiling");
            request.bookkeeping.record(reason);
        }

        let n = request.bookkeeping.bump(COMPILES);
        let label = format!("{}:{}:{}", self.backend.name(), unit, n);
        Ok(CompileOutcome::Compiled(self.build(
            &unit,
            signature,
            request.cache,
            label,
        )))
    }
}

impl fmt::Debug for TypeSpecializingCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeSpecializingCompiler")
            .field("backend", &self.backend)
            .field("cache_size_limit", &self.cache_size_limit)
            .field("invocations", &self.invocations())
            .finish()
    }
}

/// Every local has exactly the expected type and no local is missing or extra
fn signature_holds(expected: &[(String, String)], locals: &LocalsSnapshot) -> bool {
    locals.len() == expected.len() && signature_holds_partially(expected, locals)
}

fn signature_holds_partially(expected: &[(String, String)], locals: &LocalsSnapshot) -> bool {
    expected.iter().all(|(name, ty)| {
        locals
            .get(name)
            .is_some_and(|value| value.type_name() == ty)
    })
}

/// Locals whose type tells `code` apart from at least one of `siblings`
fn distinguishing_locals<'a>(code: &SimCode, siblings: impl Iterator<Item = &'a SimCode>) -> Signature {
    let siblings: Vec<&SimCode> = siblings.collect();
    code.signature()
        .iter()
        .filter(|(name, ty)| {
            siblings
                .iter()
                .any(|sibling| sibling.type_of(name) != Some(ty.as_str()))
        })
        .cloned()
        .collect()
}

/// Recompute the distinguishing locals of every entry once `added` joins the
/// chain. A lone entry, or one no local sets apart, keeps an empty set and so
/// falls back to its full signature.
fn rebuild_diff_guards(added: &SimCode, cache: &[Arc<CacheEntry<SimVm>>]) {
    let chain: Vec<&SimCode> = cache
        .iter()
        .filter(|entry| entry.is_valid())
        .map(|entry| entry.code())
        .chain(std::iter::once(added))
        .collect();
    for (i, code) in chain.iter().enumerate() {
        let siblings = chain
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, sibling)| *sibling);
        code.set_distinguishing(distinguishing_locals(code, siblings));
    }
}

fn recompile_reason(signature: &[(String, String)], cache: &[Arc<CacheEntry<SimVm>>]) -> Option<String> {
    let newest = cache.first()?;
    let changed: Vec<String> = signature
        .iter()
        .filter_map(|(name, ty)| match newest.code().type_of(name) {
            Some(old) if old != ty => Some(format!("{}: {} -> {}", name, old, ty)),
            None => Some(format!("{}: new local", name)),
            Some(_) => None,
        })
        .collect();
    if changed.is_empty() {
        Some("guard failed".to_string())
    } else {
        Some(changed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BackendMatch, Callback, Dispatcher, GuardStance, LocalValue};
    use crate::sim::{ExecPath, Program};

    fn typed(value: LocalValue) -> LocalsSnapshot {
        LocalsSnapshot::new().with("x", value)
    }

    fn vm() -> SimVm {
        let mut program = Program::new();
        program.define("f", &[]);
        SimVm::new(Arc::new(program), Arc::new(Dispatcher::default()))
    }

    #[test]
    fn test_signature_holds() {
        let expected = vec![("x".to_string(), "int".to_string())];
        assert!(signature_holds(&expected, &typed(LocalValue::Int(3))));
        assert!(!signature_holds(&expected, &typed(LocalValue::Float(3.0))));
        let extra = typed(LocalValue::Int(3)).with("y", LocalValue::None);
        assert!(!signature_holds(&expected, &extra));
        assert!(signature_holds_partially(&expected, &extra));
    }

    #[test]
    fn test_type_change_recompiles_with_history() {
        let vm = vm();
        let compiler = Arc::new(TypeSpecializingCompiler::new("sim-types"));
        vm.set_callback(Callback::Compile(compiler.clone()));

        assert_eq!(
            vm.call("f", typed(LocalValue::Int(1))).unwrap(),
            ExecPath::Specialized("sim-types:f:1".to_string())
        );
        assert_eq!(
            vm.call("f", typed(LocalValue::Int(2))).unwrap(),
            ExecPath::Specialized("sim-types:f:1".to_string())
        );
        assert_eq!(
            vm.call("f", typed(LocalValue::Str("a".into()))).unwrap(),
            ExecPath::Specialized("sim-types:f:2".to_string())
        );
        assert_eq!(compiler.invocations(), 2);

        let f = vm.program().get("f").unwrap().code().id();
        let extra = vm.dispatcher().extra_state(f).unwrap();
        assert_eq!(extra.bookkeeping().history(), ["x: int -> str".to_string()]);
    }

    #[test]
    fn test_cache_size_limit() {
        let vm = vm();
        let compiler = TypeSpecializingCompiler::new("sim-limit").with_cache_size_limit(1);
        vm.set_callback(Callback::compile(compiler));

        assert!(matches!(
            vm.call("f", typed(LocalValue::Int(1))).unwrap(),
            ExecPath::Specialized(_)
        ));
        assert_eq!(
            vm.call("f", typed(LocalValue::Bool(true))).unwrap(),
            ExecPath::Interpreted
        );
        assert_eq!(vm.dispatcher().stats().cache_limits, 1);
    }

    #[test]
    fn test_distinguishing_locals_rebuilt_for_every_entry() {
        let vm = vm();
        let compiler = Arc::new(TypeSpecializingCompiler::new("sim-diff").with_diff_guards());
        vm.set_callback(Callback::Compile(compiler.clone()));
        let two = |x: LocalValue| typed(x).with("y", LocalValue::Int(0));
        let f = vm.program().get("f").unwrap().code().id();

        vm.call("f", two(LocalValue::Int(1))).unwrap();
        let first = vm.dispatcher().cache_entries(f)[0].clone();
        assert!(first.code().distinguishing().is_empty());

        vm.call("f", two(LocalValue::Float(1.0))).unwrap();
        let entries = vm.dispatcher().cache_entries(f);
        assert_eq!(
            entries[0].code().distinguishing(),
            vec![("x".to_string(), "float".to_string())]
        );
        // The older entry learns what sets it apart from the newcomer
        assert_eq!(
            first.code().distinguishing(),
            vec![("x".to_string(), "int".to_string())]
        );
    }

    #[test]
    fn test_lone_diff_guard_checks_full_signature() {
        let vm = vm();
        let compiler = TypeSpecializingCompiler::new("sim-lone").with_diff_guards();
        vm.set_callback(Callback::compile(compiler));
        let f = vm.program().get("f").unwrap().code().id();

        vm.call("f", typed(LocalValue::Int(1))).unwrap();
        let entry = vm.dispatcher().cache_entries(f)[0].clone();
        let stance = GuardStance::SkipUnsafe;
        let any = BackendMatch::Any;
        assert!(entry.matches(&vm, &typed(LocalValue::Int(5)), any, stance).unwrap());
        assert!(!entry.matches(&vm, &typed(LocalValue::Float(5.0)), any, stance).unwrap());
    }
}
