//! Table-driven evaluator fixture.
//!
//! Understands just enough of a command language to drive the runtime's
//! tests: `set`/`$var` substitution, the `append` output builtin,
//! `sleep`, `error` and `timeout`, plus canned outcomes for exact script
//! strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    CompiledScript, Evaluator, EvaluatorFactory, InterruptHandle, OutputSink, ScriptError,
    ScriptOrigin, ScriptResult,
};

/// Outcome table shared by all evaluators of one factory.
#[derive(Debug, Default)]
struct Canned {
    outcomes: HashMap<String, Outcome>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Value(String),
    Fail(ScriptError),
    SleepThen(Duration, String),
}

/// Factory producing [`ScriptedEvaluator`] instances.
#[derive(Debug, Default)]
pub struct ScriptedEvaluatorFactory {
    canned: Canned,
}

impl ScriptedEvaluatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed successful result for an exact script string.
    pub fn with_result(mut self, script: impl Into<String>, value: impl Into<String>) -> Self {
        self.canned
            .outcomes
            .insert(script.into(), Outcome::Value(value.into()));
        self
    }

    /// Fixed failure for an exact script string.
    pub fn with_error(mut self, script: impl Into<String>, error: ScriptError) -> Self {
        self.canned
            .outcomes
            .insert(script.into(), Outcome::Fail(error));
        self
    }

    /// Sleep (interruptibly), then succeed with `value`.
    pub fn with_sleep(
        mut self,
        script: impl Into<String>,
        delay: Duration,
        value: impl Into<String>,
    ) -> Self {
        self.canned
            .outcomes
            .insert(script.into(), Outcome::SleepThen(delay, value.into()));
        self
    }

    pub fn build(self) -> Arc<SharedFactory> {
        Arc::new(SharedFactory {
            canned: Arc::new(self.canned),
        })
    }
}

/// Factory handle cloned into every spawning subsystem.
#[derive(Debug)]
pub struct SharedFactory {
    canned: Arc<Canned>,
}

impl EvaluatorFactory for SharedFactory {
    fn create(&self) -> Box<dyn Evaluator> {
        Box::new(ScriptedEvaluator {
            canned: Arc::clone(&self.canned),
            vars: HashMap::new(),
            sink: None,
            interrupt: InterruptHandle::new(),
        })
    }
}

/// The fixture evaluator itself.
#[derive(Debug)]
pub struct ScriptedEvaluator {
    canned: Arc<Canned>,
    vars: HashMap<String, String>,
    sink: Option<OutputSink>,
    interrupt: InterruptHandle,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        ScriptedEvaluator {
            canned: Arc::new(Canned::default()),
            vars: HashMap::new(),
            sink: None,
            interrupt: InterruptHandle::new(),
        }
    }

    fn run_outcome(&self, outcome: &Outcome) -> ScriptResult<String> {
        match outcome {
            Outcome::Value(v) => Ok(v.clone()),
            Outcome::Fail(e) => Err(e.clone()),
            Outcome::SleepThen(delay, v) => {
                self.interruptible_sleep(*delay)?;
                Ok(v.clone())
            }
        }
    }

    fn interruptible_sleep(&self, total: Duration) -> ScriptResult<()> {
        let step = Duration::from_millis(10);
        let mut remaining = total;
        while !remaining.is_zero() {
            self.interrupt.check()?;
            let chunk = remaining.min(step);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
        self.interrupt.check()
    }

    fn run_command(&mut self, command: &str) -> ScriptResult<String> {
        self.interrupt.check()?;
        let command = command.trim();
        if command.is_empty() {
            return Ok(String::new());
        }

        let (word, rest) = match command.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (command, ""),
        };
        match word {
            "set" => {
                let (name, value) = rest
                    .split_once(char::is_whitespace)
                    .map(|(n, v)| (n, v.trim()))
                    .unwrap_or((rest, ""));
                let value = self.substitute(value);
                self.vars.insert(name.to_string(), value.clone());
                Ok(value)
            }
            "append" | "adp_append" => {
                let text = self.substitute(&unquote(rest));
                if let Some(sink) = &self.sink {
                    sink.lock().push_str(&text);
                }
                Ok(String::new())
            }
            "sleep" => {
                let ms: u64 = rest
                    .parse()
                    .map_err(|_| ScriptError::error(format!("bad sleep argument {rest:?}")))?;
                self.interruptible_sleep(Duration::from_millis(ms))?;
                Ok(String::new())
            }
            "error" => Err(ScriptError::error(rest.to_string())),
            "timeout" => Err(ScriptError::timeout(rest.to_string())),
            _ => Ok(self.substitute(command).trim().to_string()),
        }
    }

    fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&(_, nc)) = chars.peek() {
                if nc.is_alphanumeric() || nc == '_' {
                    name.push(nc);
                    chars.next();
                } else {
                    break;
                }
            }
            match self.vars.get(&name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('$');
                    out.push_str(&name);
                }
            }
        }
        out
    }
}

impl Default for ScriptedEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn unquote(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        let inner = &trimmed[1..trimmed.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut escaped = false;
        for c in inner.chars() {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else {
                out.push(c);
            }
        }
        out
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug)]
struct ScriptedCompiled {
    script: String,
}

impl CompiledScript for ScriptedCompiled {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Evaluator for ScriptedEvaluator {
    fn eval(&mut self, script: &str, _origin: Option<&ScriptOrigin>) -> ScriptResult<String> {
        if let Some(outcome) = self.canned.outcomes.get(script).cloned() {
            return self.run_outcome(&outcome);
        }

        let mut result = String::new();
        for command in script.split(['\n', ';']) {
            result = self.run_command(command)?;
        }
        Ok(result)
    }

    fn compile(
        &mut self,
        script: &str,
        _origin: Option<&ScriptOrigin>,
    ) -> ScriptResult<Box<dyn CompiledScript>> {
        Ok(Box::new(ScriptedCompiled {
            script: script.to_string(),
        }))
    }

    fn eval_compiled(&mut self, script: &dyn CompiledScript) -> ScriptResult<String> {
        let compiled = script
            .as_any()
            .downcast_ref::<ScriptedCompiled>()
            .ok_or_else(|| ScriptError::error("foreign compiled script"))?;
        let text = compiled.script.clone();
        self.eval(&text, None)
    }

    fn set_var(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    fn get_var(&mut self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn set_output_sink(&mut self, sink: Option<OutputSink>) {
        self.sink = sink;
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}
