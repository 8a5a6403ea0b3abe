#![forbid(unsafe_code)]

//! The kestrel instruction set and the compiled program container.
//!
//! The compiler produces two instruction vectors per function body: the
//! first-pass stream with label-valued branches (retained for debugging) and
//! the concretized stream the engine dispatches over, with branch targets
//! written as final instruction indices.

use std::cell::RefCell;
use std::collections::BTreeMap;

use kestrel_ast::{FuncRef, Ident};
use kestrel_value::Val;

mod dump;
mod instr;
mod op;
mod verify;

pub use instr::{AuxItem, Instr, InstrAux, IterInfo, Label, OperandForm};
pub use op::{assignment_flavor, assignmentless, Op};
pub use verify::{verify_body, VerifyError};

/// One process-wide variable the body reads or writes: its identifier and
/// the frame slot its in-frame copy lives in.
#[derive(Clone, Debug)]
pub struct GlobalInfo {
    pub id: Ident,
    pub slot: i32,
}

/// One post-optimization frame slot: the identifiers sharing it, where each
/// becomes live, the end of the current occupant's lifetime, and whether the
/// cohort is managed.
#[derive(Clone, Debug)]
pub struct FrameSharingInfo {
    pub ids: Vec<Ident>,
    pub id_start: Vec<usize>,
    pub scope_end: usize,
    pub is_managed: bool,
}

impl FrameSharingInfo {
    pub fn new(is_managed: bool) -> FrameSharingInfo {
        FrameSharingInfo {
            ids: Vec::new(),
            id_start: Vec::new(),
            scope_end: 0,
            is_managed,
        }
    }
}

/// Jump tables for the four switch-key families. Double keys match on their
/// exact bit pattern. Values are concretized instruction indices.
#[derive(Clone, Debug, Default)]
pub struct CaseTables {
    pub int_cases: Vec<BTreeMap<i64, u32>>,
    pub uint_cases: Vec<BTreeMap<u64, u32>>,
    pub double_cases: Vec<BTreeMap<u64, u32>>,
    pub str_cases: Vec<BTreeMap<String, u32>>,
}

impl CaseTables {
    pub fn total_entries(&self) -> usize {
        self.int_cases.iter().map(BTreeMap::len).sum::<usize>()
            + self.uint_cases.iter().map(BTreeMap::len).sum::<usize>()
            + self.double_cases.iter().map(BTreeMap::len).sum::<usize>()
            + self.str_cases.iter().map(BTreeMap::len).sum::<usize>()
    }
}

/// A compiled function body: the engine's execution unit and the host's
/// replacement for the original statement tree.
#[derive(Debug)]
pub struct CompiledBody {
    pub func: FuncRef,
    /// First-pass stream, pre-optimization. Dead instructions stay in place
    /// with `live` cleared.
    pub insts1: Vec<Instr>,
    /// Concretized stream the engine runs.
    pub insts2: Vec<Instr>,
    /// Value-frame size after remapping.
    pub frame_size: usize,
    /// Identifier for every first-pass slot, in slot order.
    pub frame_denizens: Vec<Ident>,
    /// Post-optimization slot descriptors, with starts renumbered into
    /// `insts2` indices.
    pub shared_frame: Vec<FrameSharingInfo>,
    /// Slots needing release on reassignment and teardown.
    pub managed_slots: Vec<usize>,
    pub globals: Vec<GlobalInfo>,
    pub cases: CaseTables,
    /// Reusable frame for functions known to be non-recursive. Borrowed for
    /// the duration of each invocation; re-entry is a caller error.
    pub fixed_frame: Option<RefCell<Vec<Val>>>,
    /// Whether the optimizer ran (and the frame was remapped).
    pub remapped: bool,
    /// Interpreter-frame size this body needs after remapping. A function's
    /// final size is the maximum over all of its bodies.
    pub interp_frame_size: usize,
    /// Non-fatal diagnostics produced during compilation.
    pub warnings: Vec<String>,
}

impl CompiledBody {
    /// Renders the frame layouts, both instruction streams, and the jump
    /// tables.
    pub fn dump(&self) -> String {
        dump::dump_body(self)
    }
}
