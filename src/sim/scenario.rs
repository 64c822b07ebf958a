//! Scripted dispatch scenarios
//!
//! A scenario is a TOML document describing a program, a compiler and a
//! sequence of calls. Running it reports how each call was executed and the
//! dispatcher's statistics at the end.
//!
//! ```toml
//! [dispatch]
//! chain_order = "most-recent-first"
//!
//! [compiler]
//! backend = "eager"
//! cache_size_limit = 4
//! skip = ["logging"]
//!
//! [[function]]
//! name = "step"
//! calls = ["logging"]
//!
//! [[function]]
//! name = "logging"
//!
//! [[call]]
//! function = "step"
//! locals = { x = 1, scale = 0.5 }
//!
//! [[call]]
//! function = "step"
//! callback = "restricted"
//! locals = { x = "one", scale = 0.5, seed = { none = true } }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{de, Deserialize, Deserializer};
use tracing::info;

use super::compiler::{TypeSpecializingCompiler, DEFAULT_CACHE_SIZE_LIMIT};
use super::{ExecEvent, ExecPath, Program, SimError, SimVm};
use crate::config::{ConfigError, DispatchConfig};
use crate::dispatch::{Callback, DispatchStats, Dispatcher, LocalValue, LocalsSnapshot};

/// Compiler settings of a scenario
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerSpec {
    pub backend: String,
    pub cache_size_limit: u64,
    pub diff_guards: bool,
    pub skip: Vec<String>,
    pub no_action: Vec<String>,
    pub fail: Vec<String>,
    pub raise_in_guard: Vec<String>,
}

impl Default for CompilerSpec {
    fn default() -> Self {
        CompilerSpec {
            backend: "eager".to_string(),
            cache_size_limit: DEFAULT_CACHE_SIZE_LIMIT,
            diff_guards: false,
            skip: Vec::new(),
            no_action: Vec::new(),
            fail: Vec::new(),
            raise_in_guard: Vec::new(),
        }
    }
}

impl CompilerSpec {
    pub fn build(&self) -> TypeSpecializingCompiler {
        let mut compiler = TypeSpecializingCompiler::new(&self.backend)
            .with_cache_size_limit(self.cache_size_limit);
        if self.diff_guards {
            compiler = compiler.with_diff_guards();
        }
        for unit in &self.skip {
            compiler = compiler.skip(unit);
        }
        for unit in &self.no_action {
            compiler = compiler.no_action(unit);
        }
        for unit in &self.fail {
            compiler = compiler.fail(unit);
        }
        for unit in &self.raise_in_guard {
            compiler = compiler.raise_in_guard(unit);
        }
        compiler
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub calls: Vec<String>,
}

/// Which callback a call runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallbackKind {
    #[default]
    Compile,
    Restricted,
    Disabled,
}

/// A local binding as written in a scenario.
///
/// Strings are always strings; the absent value is spelled `{ none = true }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LocalSpec {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null {
        none: NoneMarker,
    },
    Object {
        #[serde(rename = "type")]
        type_name: String,
        #[serde(default)]
        id: u64,
    },
}

/// The `true` of `{ none = true }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoneMarker;

impl<'de> Deserialize<'de> for NoneMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(NoneMarker)
        } else {
            Err(de::Error::custom("`none` can only be true"))
        }
    }
}

impl From<&LocalSpec> for LocalValue {
    fn from(spec: &LocalSpec) -> Self {
        match spec {
            LocalSpec::Bool(b) => LocalValue::Bool(*b),
            LocalSpec::Int(n) => LocalValue::Int(*n),
            LocalSpec::Float(x) => LocalValue::Float(*x),
            LocalSpec::Str(s) => LocalValue::Str(Arc::from(s.as_str())),
            LocalSpec::Null { .. } => LocalValue::None,
            LocalSpec::Object { type_name, id } => LocalValue::Object {
                type_name: Arc::from(type_name.as_str()),
                id: *id,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub function: String,
    #[serde(default)]
    pub callback: CallbackKind,
    #[serde(default)]
    pub unwinding: bool,
    /// Switch the skip-guard-eval-unsafe stance before this call
    #[serde(default)]
    pub skip_guard_eval_unsafe: Option<bool>,
    /// Forget the unit's dispatch state before this call
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub locals: BTreeMap<String, LocalSpec>,
}

impl CallSpec {
    pub fn locals(&self) -> LocalsSnapshot {
        self.locals
            .iter()
            .map(|(name, spec)| (Arc::from(name.as_str()), LocalValue::from(spec)))
            .collect()
    }
}

/// A scripted run
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    pub dispatch: DispatchConfig,
    pub compiler: CompilerSpec,
    #[serde(rename = "function")]
    pub functions: Vec<FunctionSpec>,
    #[serde(rename = "call")]
    pub calls: Vec<CallSpec>,
}

impl Scenario {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Replace the dispatcher settings, e.g. with a separately loaded config
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn program(&self) -> Result<Program, SimError> {
        let mut program = Program::new();
        for function in &self.functions {
            let calls: Vec<&str> = function.calls.iter().map(String::as_str).collect();
            program.define(&function.name, &calls);
        }
        program.validate()?;
        Ok(program)
    }

    /// Run every call in order.
    ///
    /// Dispatch failures are part of the report; only an invalid program
    /// stops the run.
    pub fn run(&self) -> Result<ScenarioReport, SimError> {
        let program = Arc::new(self.program()?);
        let dispatcher = Arc::new(Dispatcher::new(self.dispatch.clone()));
        let vm = SimVm::new(program, Arc::clone(&dispatcher));
        let compile = Callback::compile(self.compiler.build());

        let mut calls = Vec::with_capacity(self.calls.len());
        for (index, call) in self.calls.iter().enumerate() {
            if call.reset {
                if let Some(function) = vm.program().get(&call.function) {
                    dispatcher.reset_code(function.code().id());
                }
            }
            if let Some(enabled) = call.skip_guard_eval_unsafe {
                dispatcher.set_skip_guard_eval_unsafe(enabled);
            }
            vm.set_callback(match call.callback {
                CallbackKind::Compile => compile.clone(),
                CallbackKind::Restricted => Callback::Restricted,
                CallbackKind::Disabled => Callback::Disabled,
            });

            let result = vm.call_with(&call.function, call.locals(), call.unwinding);
            let report = CallReport {
                index,
                function: call.function.clone(),
                outcome: result.map_err(|e| e.to_string()),
                events: vm.take_events(),
            };
            info!(call = index, function = %report.function, "{}", report.summary());
            calls.push(report);
        }

        Ok(ScenarioReport {
            calls,
            stats: dispatcher.stats(),
        })
    }
}

/// How one scripted call went
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub index: usize,
    pub function: String,
    pub outcome: Result<ExecPath, String>,
    /// Every frame executed during the call, the called one first
    pub events: Vec<ExecEvent>,
}

impl CallReport {
    fn summary(&self) -> String {
        match &self.outcome {
            Ok(path) => path.to_string(),
            Err(e) => format!("error: {}", e),
        }
    }
}

impl fmt::Display for CallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.index, self.function, self.summary())?;
        for event in self.events.iter().skip(1) {
            write!(
                f,
                "\n{:indent$}{}: {}",
                "",
                event.function,
                event.path,
                indent = 2 + 2 * event.depth.saturating_sub(1)
            )?;
        }
        Ok(())
    }
}

/// Result of a scenario run
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub calls: Vec<CallReport>,
    pub stats: DispatchStats,
}

impl ScenarioReport {
    pub fn failures(&self) -> usize {
        self.calls.iter().filter(|c| c.outcome.is_err()).count()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for call in &self.calls {
            writeln!(f, "{}", call)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        [compiler]
        backend = "scenario-test"
        skip = ["log"]

        [[function]]
        name = "step"
        calls = ["log"]

        [[function]]
        name = "log"

        [[call]]
        function = "step"
        locals = { x = 1 }

        [[call]]
        function = "step"
        locals = { x = 2 }

        [[call]]
        function = "step"
        callback = "restricted"
        locals = { x = "two" }
    "#;

    #[test]
    fn test_parse_locals() {
        let scenario = Scenario::from_toml_str(
            r#"
            [[call]]
            function = "f"
            locals = { a = true, b = 2, c = 0.5, d = "s", e = { none = true }, t = { type = "Tensor", id = 7 } }
            "#,
        )
        .unwrap();
        let locals = scenario.calls[0].locals();
        assert_eq!(locals.get("a"), Some(&LocalValue::Bool(true)));
        assert_eq!(locals.get("b"), Some(&LocalValue::Int(2)));
        assert_eq!(locals.get("c"), Some(&LocalValue::Float(0.5)));
        assert_eq!(locals.get("d"), Some(&LocalValue::Str(Arc::from("s"))));
        assert_eq!(locals.get("e"), Some(&LocalValue::None));
        assert_eq!(locals.get("t").map(|v| v.type_name()), Some("Tensor"));
    }

    #[test]
    fn test_none_string_stays_a_string() {
        let scenario = Scenario::from_toml_str(
            r#"
            [[call]]
            function = "f"
            locals = { s = "None" }
            "#,
        )
        .unwrap();
        let locals = scenario.calls[0].locals();
        assert_eq!(locals.get("s"), Some(&LocalValue::Str(Arc::from("None"))));
        assert_eq!(locals.get("s").map(|v| v.type_name()), Some("str"));

        let rejected = Scenario::from_toml_str(
            r#"
            [[call]]
            function = "f"
            locals = { s = { none = false } }
            "#,
        );
        assert!(rejected.is_err());
    }

    #[test]
    fn test_run_reports_each_call() {
        let report = Scenario::from_toml_str(SCENARIO).unwrap().run().unwrap();

        let paths: Vec<_> = report.calls.iter().map(|c| c.outcome.clone()).collect();
        assert_eq!(
            paths,
            vec![
                Ok(ExecPath::Specialized("scenario-test:step:1".to_string())),
                Ok(ExecPath::Specialized("scenario-test:step:1".to_string())),
                Ok(ExecPath::Interpreted),
            ]
        );
        // log was skipped recursively on its first call
        assert_eq!(report.calls[1].events[1].path, ExecPath::Interpreted);
        assert_eq!(report.stats.skip_recursive, 1);
        assert_eq!(report.stats.compiles, 2);
        assert_eq!(report.failures(), 0);
    }

    #[test]
    fn test_undefined_callee_is_rejected() {
        let scenario = Scenario::from_toml_str(
            r#"
            [[function]]
            name = "f"
            calls = ["g"]
            "#,
        )
        .unwrap();
        assert_eq!(
            scenario.run().unwrap_err(),
            SimError::UnknownFunction("g".to_string())
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Scenario::from_toml_str("[compiler]\nbackends = []").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
