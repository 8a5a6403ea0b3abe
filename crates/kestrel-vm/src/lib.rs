#![forbid(unsafe_code)]

//! The kestrel execution engine: a synchronous dispatch loop over a
//! compiled body's concretized instruction stream.
//!
//! Each invocation gets a value frame (transient, or the body's reusable
//! fixed frame for non-recursive functions) and a global-state array that
//! starts out fully unloaded. Errors are carried as an explicit `Result`
//! from the driver; there is no process-wide error flag.

use std::fmt;
use std::rc::Rc;

use kestrel_ast::{EventHandler, Expr};
use kestrel_code::CompiledBody;
use kestrel_value::{FuncHandle, Val};
use rustc_hash::FxHashMap;

mod exec;
mod metrics;

pub use exec::{execute, execute_from};
pub use metrics::ExecProfile;

/// A run-time failure. The dispatch loop stops at the first one; the caller
/// decides whether to propagate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub(crate) fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-time error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// How a body finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Return,
    HookBreak,
}

/// The result of a completed invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecOutcome {
    pub value: Option<Val>,
    pub flow: Flow,
}

/// Per-global run-time state. Every global starts unloaded; the first read
/// loads it, stores mark it dirty, and sync points flush dirty entries back
/// to the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalState {
    Unloaded,
    Clean,
    Dirty,
}

/// A deferred predicate handed across to the host trigger mechanism by a
/// `when` opcode. The engine does not suspend; the host re-enters the body
/// at `body_pc` (via [`Resumption`]) once the predicate holds.
#[derive(Clone, Debug)]
pub struct WhenSpec {
    pub cond: Rc<Expr>,
    pub body_pc: usize,
    /// Timeout interval and the timeout body's entry point.
    pub timeout: Option<(Val, usize)>,
    pub is_return: bool,
}

/// The host services generated code reaches at run time: script and
/// built-in functions, the logging and event subsystems, and the trigger
/// mechanism behind `when`.
pub trait Runtime {
    fn call(&mut self, name: &str, args: &[Val]) -> Result<Val, RuntimeError>;

    fn call_value(&mut self, func: &FuncHandle, args: &[Val]) -> Result<Val, RuntimeError> {
        self.call(&func.name, args)
    }

    fn log_write(&mut self, stream: &Val, columns: &Val) -> Result<bool, RuntimeError>;

    fn flush_logs(&mut self) -> Result<bool, RuntimeError>;

    fn raise_event(&mut self, handler: &EventHandler, args: Vec<Val>) -> Result<(), RuntimeError>;

    fn defer_when(&mut self, spec: WhenSpec) -> Result<(), RuntimeError>;

    fn reading_live_traffic(&self) -> bool {
        false
    }

    fn reading_traces(&self) -> bool {
        false
    }
}

/// The process-wide variable store, keyed by global name. Reads of unset
/// globals produce `Nil`.
#[derive(Debug, Default)]
pub struct GlobalStore {
    vals: FxHashMap<String, Val>,
}

impl GlobalStore {
    pub fn new() -> GlobalStore {
        GlobalStore::default()
    }

    pub fn get(&self, name: &str) -> Val {
        self.vals.get(name).cloned().unwrap_or(Val::Nil)
    }

    pub fn set(&mut self, name: &str, val: Val) {
        self.vals.insert(name.to_string(), val);
    }
}

/// Everything an invocation executes against.
pub struct ExecEnv<'r> {
    pub runtime: &'r mut dyn Runtime,
    pub globals: &'r mut GlobalStore,
    pub profile: Option<&'r mut ExecProfile>,
}

/// Re-enters a compiled body at a saved program counter, over the same
/// instruction stream. Used by the host trigger mechanism to run `when`
/// bodies.
pub struct Resumption<'b> {
    body: &'b CompiledBody,
    pub pc: usize,
}

impl<'b> Resumption<'b> {
    pub fn new(body: &'b CompiledBody, pc: usize) -> Resumption<'b> {
        Resumption { body, pc }
    }

    pub fn exec(
        &self,
        interp_frame: &mut [Val],
        env: &mut ExecEnv<'_>,
    ) -> Result<ExecOutcome, RuntimeError> {
        execute_from(self.body, self.pc, interp_frame, env)
    }
}
