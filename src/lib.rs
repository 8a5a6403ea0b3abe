#![forbid(unsafe_code)]

//! kestrel: a register-based compiler and execution engine for the
//! monitor's scripting language.
//!
//! Script bodies normally execute through a tree-walking interpreter over a
//! heap-allocated variable frame. This crate lowers a reduced form of those
//! bodies to a linear stream of typed instructions over a fixed-size value
//! frame, statically optimizes the stream, and executes it with a dense
//! dispatch loop.

use std::collections::HashMap;

use kestrel_ast::FuncInfo;
use kestrel_code::CompiledBody;

/// The reduced AST, script types, and front-end analysis products.
pub use kestrel_ast as ast;

/// Instruction set, instruction records, and the compiled-body container.
pub use kestrel_code as code;

/// Code generator and static optimizer.
pub use kestrel_compiler as compiler;

/// Runtime values.
pub use kestrel_value as value;

/// The execution engine.
pub use kestrel_vm as vm;

/// The original tree-walking evaluator, retained as the semantic reference
/// the compiled form is checked against.
pub mod interpreter;

pub use kestrel_compiler::{compile, CompileError, CompileOptions};
pub use kestrel_vm::{
    execute, execute_from, ExecEnv, ExecOutcome, ExecProfile, Flow, GlobalStore, Resumption,
    Runtime, RuntimeError, WhenSpec,
};

/// Renders a compiled body's frames, instruction streams, and jump tables.
pub fn dump(body: &CompiledBody) -> String {
    body.dump()
}

/// After every body has been compiled, fixes each function's interpreter
/// frame size to the maximum across all of its compiled bodies. Event
/// handlers and hooks have several bodies sharing one frame, so this cannot
/// happen per compilation.
pub fn finalize_frame_sizes(bodies: &[CompiledBody]) {
    let mut max_sizes: HashMap<*const FuncInfo, usize> = HashMap::new();

    for body in bodies {
        let key = std::rc::Rc::as_ptr(&body.func);
        let entry = max_sizes.entry(key).or_insert(0);
        *entry = (*entry).max(body.interp_frame_size);
    }

    for body in bodies {
        let key = std::rc::Rc::as_ptr(&body.func);
        if let Some(&size) = max_sizes.get(&key) {
            body.func.set_frame_size(size);
        }
    }
}
