//! Interface to the embedded scripting evaluator.
//!
//! The server never implements a scripting language itself; it drives an
//! evaluator through this trait. Evaluators are allocated per worker
//! thread via an [`EvaluatorFactory`] and support asynchronous
//! cancellation through a thread-safe [`InterruptHandle`].

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Discriminates evaluator failures the runtime reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorCode {
    /// Ordinary script error.
    Error,
    /// The evaluation exceeded its allotted time.
    Timeout,
    /// The evaluation was cancelled from another thread.
    Cancelled,
}

/// An evaluator failure with its machine-readable code and the
/// evaluator's error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("script error: {info}")]
pub struct ScriptError {
    pub code: ScriptErrorCode,
    pub info: String,
}

impl ScriptError {
    pub fn error(info: impl Into<String>) -> Self {
        ScriptError {
            code: ScriptErrorCode::Error,
            info: info.into(),
        }
    }

    pub fn timeout(info: impl Into<String>) -> Self {
        ScriptError {
            code: ScriptErrorCode::Timeout,
            info: info.into(),
        }
    }

    pub fn cancelled() -> Self {
        ScriptError {
            code: ScriptErrorCode::Cancelled,
            info: "evaluation cancelled".to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ScriptErrorCode::Timeout
    }
}

/// File/line association for tracebacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOrigin {
    pub file: String,
    pub line: u32,
}

impl ScriptOrigin {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        ScriptOrigin {
            file: file.into(),
            line,
        }
    }
}

/// A pre-compiled script handle owned by the evaluator that produced it.
pub trait CompiledScript: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Sink for output produced by scripts through the append builtin.
pub type OutputSink = Arc<parking_lot::Mutex<String>>;

/// One embedded evaluator instance. Never shared across threads; each
/// worker allocates its own through the factory.
pub trait Evaluator: Send {
    /// Evaluate a script string, optionally associated with a file for
    /// tracebacks.
    fn eval(&mut self, script: &str, origin: Option<&ScriptOrigin>) -> ScriptResult<String>;

    /// Compile a script for repeated execution.
    fn compile(
        &mut self,
        script: &str,
        origin: Option<&ScriptOrigin>,
    ) -> ScriptResult<Box<dyn CompiledScript>>;

    /// Evaluate a handle previously produced by [`Evaluator::compile`].
    fn eval_compiled(&mut self, script: &dyn CompiledScript) -> ScriptResult<String>;

    fn set_var(&mut self, name: &str, value: &str);

    fn get_var(&mut self, name: &str) -> Option<String>;

    /// Route the append builtin's output; `None` discards it.
    fn set_output_sink(&mut self, sink: Option<OutputSink>);

    /// Handle for cancelling the current evaluation from another thread.
    fn interrupt_handle(&self) -> InterruptHandle;
}

/// Allocates evaluators for worker threads.
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Evaluator>;
}

/// One-shot cancellation flag checked by the evaluator at safepoints.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    cancelled: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the evaluation owning this handle.
    pub fn interrupt(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-arm the handle for the next evaluation.
    pub fn clear(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Safepoint check for evaluator implementations.
    pub fn check(&self) -> ScriptResult<()> {
        if self.is_interrupted() {
            Err(ScriptError::cancelled())
        } else {
            Ok(())
        }
    }
}
