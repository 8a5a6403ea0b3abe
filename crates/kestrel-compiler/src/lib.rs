#![forbid(unsafe_code)]

//! Lowers a reduced function body to a linear instruction stream and
//! optimizes it.
//!
//! Lowering is single-pass: structured control flow emits branches with
//! unresolved destinations and patches them once the enclosed code has been
//! generated. The optimizer then removes dead code, collapses branch chains,
//! prunes unused assignments, and remaps the value frame so variables with
//! disjoint lifetimes share slots. Finally the surviving instructions are
//! renumbered densely and every branch destination is written into its
//! designated integer operand.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use kestrel_ast::{Analyses, FuncBody, FuncFlavor, FuncRef, Ident};
use kestrel_code::{
    CaseTables, CompiledBody, FrameSharingInfo, GlobalInfo, Instr, Label, Op, OperandForm,
};
use kestrel_value::Val;
use rustc_hash::{FxHashMap, FxHashSet};

mod expr;
mod frame;
mod opt;
mod stmt;

/// Compilation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A source-level problem; compilation of this body is abandoned but
    /// the caller may continue with other functions.
    Source { message: String },
    /// A compiler inconsistency.
    Internal { message: String },
}

impl CompileError {
    pub(crate) fn source(message: impl Into<String>) -> CompileError {
        CompileError::Source {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> CompileError {
        CompileError::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Source { message } => write!(f, "compile error: {message}"),
            CompileError::Internal { message } => {
                write!(f, "internal compiler error: {message}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Knobs for a single compilation.
#[derive(Debug, Default)]
pub struct CompileOptions {
    /// Skip the optimizer and frame remapping entirely.
    pub no_optimize: bool,
    /// Functions a whole-program analysis found to be non-recursive; their
    /// bodies get a single reusable value frame.
    pub non_recursive: FxHashSet<String>,
}

/// Compiles one reduced function body against its analysis products.
pub fn compile(
    func: FuncRef,
    body: &FuncBody,
    analyses: &Analyses,
    options: &CompileOptions,
) -> Result<CompiledBody, CompileError> {
    let mut g = Generator::new(func, body, analyses, options);
    g.init()?;
    g.compile_body()
}

pub(crate) struct Generator<'a> {
    pub(crate) func: FuncRef,
    body: &'a FuncBody,
    pub(crate) analyses: &'a Analyses,
    options: &'a CompileOptions,

    pub(crate) insts1: Vec<Instr>,
    pub(crate) frame_layout1: FxHashMap<Ident, usize>,
    pub(crate) frame_denizens: Vec<Ident>,
    pub(crate) managed_slots: Vec<usize>,
    pub(crate) globals: Vec<GlobalInfo>,
    pub(crate) global_id_to_info: FxHashMap<Ident, usize>,
    pub(crate) modified_globals: FxHashSet<Ident>,
    pub(crate) interpreter_locals: FxHashSet<Ident>,
    /// Pending dirty-global marker to append after the next instruction.
    pub(crate) mark_dirty: Option<usize>,

    pub(crate) breaks: Vec<Vec<usize>>,
    pub(crate) nexts: Vec<Vec<usize>>,
    pub(crate) fallthroughs: Vec<Vec<usize>>,
    pub(crate) catches: Vec<Vec<usize>>,
    pub(crate) retvars: Vec<Option<Ident>>,

    pub(crate) int_cases: Vec<BTreeMap<i64, Label>>,
    pub(crate) uint_cases: Vec<BTreeMap<u64, Label>>,
    pub(crate) double_cases: Vec<BTreeMap<u64, Label>>,
    pub(crate) str_cases: Vec<BTreeMap<String, Label>>,

    // Lifetime analysis state, rebuilt on every optimizer round.
    pub(crate) denizen_beginning: FxHashMap<usize, usize>,
    pub(crate) denizen_ending: FxHashMap<usize, usize>,
    pub(crate) inst_beginnings: FxHashMap<usize, Vec<Ident>>,
    pub(crate) inst_endings: FxHashMap<usize, Vec<Ident>>,
    pub(crate) shared_frame_denizens: Vec<FrameSharingInfo>,
    pub(crate) frame1_to_frame2: Vec<i32>,
    pub(crate) interp_frame_size: usize,

    pub(crate) warnings: Vec<String>,
    non_recursive: bool,
    remapped: bool,
}

impl<'a> Generator<'a> {
    fn new(
        func: FuncRef,
        body: &'a FuncBody,
        analyses: &'a Analyses,
        options: &'a CompileOptions,
    ) -> Generator<'a> {
        let interp_frame_size = func.frame_size();
        let non_recursive = options.non_recursive.contains(&func.name);
        Generator {
            func,
            body,
            analyses,
            options,
            insts1: Vec::new(),
            frame_layout1: FxHashMap::default(),
            frame_denizens: Vec::new(),
            managed_slots: Vec::new(),
            globals: Vec::new(),
            global_id_to_info: FxHashMap::default(),
            modified_globals: FxHashSet::default(),
            interpreter_locals: FxHashSet::default(),
            mark_dirty: None,
            breaks: Vec::new(),
            nexts: Vec::new(),
            fallthroughs: Vec::new(),
            catches: Vec::new(),
            retvars: Vec::new(),
            int_cases: Vec::new(),
            uint_cases: Vec::new(),
            double_cases: Vec::new(),
            str_cases: Vec::new(),
            denizen_beginning: FxHashMap::default(),
            denizen_ending: FxHashMap::default(),
            inst_beginnings: FxHashMap::default(),
            inst_endings: FxHashMap::default(),
            shared_frame_denizens: Vec::new(),
            frame1_to_frame2: Vec::new(),
            interp_frame_size,
            warnings: Vec::new(),
            non_recursive,
            remapped: false,
        }
    }

    /// Populates the frame: globals first, then used parameters, then
    /// locals; classifies the managed slots.
    fn init(&mut self) -> Result<(), CompileError> {
        for g in &self.analyses.profile.globals {
            let slot = self.add_to_frame(g);
            self.global_id_to_info.insert(g.clone(), self.globals.len());
            self.globals.push(GlobalInfo {
                id: g.clone(),
                slot: slot as i32,
            });
        }

        let params = self.func.params.clone();
        for param in &params {
            if self.analyses.usedefs.has_id(self.body.id, param) {
                self.load_param(param);
            }
        }

        let locals = self.analyses.profile.locals.clone();
        for l in &locals {
            if !self.has_frame_slot(l) {
                self.add_to_frame(l);
            }
        }

        for init in &self.analyses.profile.inits {
            if !self.analyses.profile.locals.contains(init) {
                self.warnings.push(format!("{init} unused"));
            }
        }

        for (slot, id) in self.frame_denizens.clone().iter().enumerate() {
            if id.ty().is_managed() {
                self.managed_slots.push(slot);
            }
        }

        Ok(())
    }

    fn compile_body(mut self) -> Result<CompiledBody, CompileError> {
        if self.func.flavor == FuncFlavor::Hook {
            self.push_breaks();
        }

        let body_stmt = self.body.stmt.clone();
        self.compile_stmt(&body_stmt)?;

        if !self.body.stmt.ends_in_return() {
            self.sync_globals();
        }

        self.resolve_dangling()?;
        self.compute_loop_depths();

        if !self.options.no_optimize {
            self.optimize()?;
            self.remapped = true;
        } else {
            // Without remapping, the managed set must still cover temporary
            // slots created during lowering.
            self.managed_slots = self
                .frame_denizens
                .iter()
                .enumerate()
                .filter(|(_, id)| id.ty().is_managed())
                .map(|(slot, _)| slot)
                .collect();
        }

        self.concretize()
    }

    /// Checks the pending-patch stacks once the whole body is lowered.
    /// Dangling breaks in a hook body become hook-break instructions.
    fn resolve_dangling(&mut self) -> Result<(), CompileError> {
        if self.func.flavor == FuncFlavor::Hook {
            let dangling = self.breaks.pop().unwrap_or_default();
            for b in dangling {
                self.insts1[b] = Instr::new(Op::HookBreakX);
            }
        }

        if !self.breaks.is_empty() {
            return Err(CompileError::source(
                "\"break\" used without an enclosing \"for\" or \"switch\"",
            ));
        }
        if !self.nexts.is_empty() {
            return Err(CompileError::source(
                "\"next\" used without an enclosing \"for\"",
            ));
        }
        if !self.fallthroughs.is_empty() {
            return Err(CompileError::source(
                "\"fallthrough\" used without an enclosing \"switch\"",
            ));
        }
        if !self.catches.is_empty() {
            return Err(CompileError::internal("untargeted inline return"));
        }
        Ok(())
    }

    /// Finds backward branches and bumps the loop depth of every
    /// instruction in the region they span. Computed once; invariant
    /// afterwards.
    fn compute_loop_depths(&mut self) {
        let len = self.insts1.len();
        for i in 0..len {
            self.insts1[i].inst_num = i;
        }

        for i in 0..len {
            let Some(target) = self.insts1[i].target else {
                continue;
            };
            if target.0 >= len {
                continue;
            }

            if target.0 < i {
                let t = target.0;
                let mut j = t;

                if !self.insts1[t].loop_start {
                    self.insts1[t].loop_start = true;
                } else {
                    // Extending a loop already discovered; find its current
                    // end.
                    let depth = self.insts1[t].loop_depth;
                    while j < i && self.insts1[j].loop_depth == depth {
                        j += 1;
                    }
                }

                while j <= i {
                    self.insts1[j].loop_depth += 1;
                    j += 1;
                }
            }

            debug_assert!(self.insts1[i].target2.map_or(true, |t2| t2.0 > i));
        }
    }

    /// Builds the final instruction stream: forwards branches over dead
    /// code, renumbers densely, and writes concrete branch operands.
    fn concretize(mut self) -> Result<CompiledBody, CompileError> {
        let len1 = self.insts1.len();

        for i in 0..len1 {
            if !self.insts1[i].live {
                continue;
            }
            if let Some(t) = self.insts1[i].target {
                self.insts1[i].target = Some(self.find_live_target(t));
            }
            if let Some(t2) = self.insts1[i].target2 {
                self.insts1[i].target2 = Some(self.find_live_target(t2));
            }
        }

        let mut inst1_to_inst2: Vec<i32> = Vec::with_capacity(len1);
        let mut insts2: Vec<Instr> = Vec::new();
        for z in &self.insts1 {
            if z.live {
                inst1_to_inst2.push(insts2.len() as i32);
                insts2.push(z.clone());
            } else {
                inst1_to_inst2.push(-1);
            }
        }

        for (i, z) in insts2.iter_mut().enumerate() {
            z.inst_num = i;
        }

        let len2 = insts2.len();
        let concrete_pc = |label: Label| -> i32 {
            if label.0 >= len1 {
                len2 as i32
            } else {
                inst1_to_inst2[label.0]
            }
        };

        for z in insts2.iter_mut() {
            if let Some(t) = z.target {
                let pc = concrete_pc(t);
                debug_assert!(pc >= 0);
                z.set_branch_operand(z.target_slot, pc);
                if let Some(t2) = z.target2 {
                    let pc2 = concrete_pc(t2);
                    debug_assert!(pc2 >= 0);
                    z.set_branch_operand(z.target2_slot, pc2);
                }
            }
        }

        // Jump tables: resolve labels to final indices, forwarding over any
        // entries whose instruction died.
        let mut cases = CaseTables::default();
        let resolve = |g: &Generator<'_>, label: Label| -> u32 {
            let live = g.find_live_target(label);
            if live.0 >= len1 {
                len2 as u32
            } else {
                inst1_to_inst2[live.0] as u32
            }
        };
        for tbl in &self.int_cases {
            cases
                .int_cases
                .push(tbl.iter().map(|(k, l)| (*k, resolve(&self, *l))).collect());
        }
        for tbl in &self.uint_cases {
            cases
                .uint_cases
                .push(tbl.iter().map(|(k, l)| (*k, resolve(&self, *l))).collect());
        }
        for tbl in &self.double_cases {
            cases
                .double_cases
                .push(tbl.iter().map(|(k, l)| (*k, resolve(&self, *l))).collect());
        }
        for tbl in &self.str_cases {
            cases.str_cases.push(
                tbl.iter()
                    .map(|(k, l)| (k.clone(), resolve(&self, *l)))
                    .collect(),
            );
        }

        let mut shared_frame = std::mem::take(&mut self.shared_frame_denizens);
        for info in &mut shared_frame {
            for start in &mut info.id_start {
                let live = self.find_live_target(Label(*start));
                *start = if live.0 >= len1 {
                    len2
                } else {
                    inst1_to_inst2[live.0] as usize
                };
            }
        }

        let frame_size = if self.remapped {
            shared_frame.len()
        } else {
            self.frame_denizens.len()
        };

        let fixed_frame = self
            .non_recursive
            .then(|| RefCell::new(vec![Val::Nil; frame_size]));

        Ok(CompiledBody {
            func: self.func,
            insts1: self.insts1,
            insts2,
            frame_size,
            frame_denizens: self.frame_denizens,
            shared_frame,
            managed_slots: self.managed_slots,
            globals: self.globals,
            cases,
            fixed_frame,
            remapped: self.remapped,
            interp_frame_size: self.interp_frame_size,
            warnings: self.warnings,
        })
    }

    // ---- instruction emission ------------------------------------------

    /// Appends an instruction, appending a pending dirty-global marker
    /// behind it. Returns the index of the last instruction added.
    pub(crate) fn add_inst(&mut self, z: Instr) -> usize {
        self.insts1.push(z);
        let top = self.insts1.len() - 1;

        let Some(dirty_global) = self.mark_dirty.take() else {
            return top;
        };

        let marker = Instr::v(Op::DirtyGlobalV, dirty_global as i32);
        self.insts1.push(marker);
        self.insts1.len() - 1
    }

    // ---- labels and patching -------------------------------------------

    /// The label of the instruction at `idx`.
    pub(crate) fn label_of(&self, idx: usize) -> Label {
        Label(idx)
    }

    /// The label one past `idx`: the next instruction to be emitted there,
    /// or the end of the program if none ever is.
    pub(crate) fn label_beyond(&self, idx: usize) -> Label {
        Label(idx + 1)
    }

    /// The label of the next instruction to be emitted.
    pub(crate) fn here(&self) -> Label {
        Label(self.insts1.len())
    }

    fn set_target(&mut self, idx: usize, label: Label, slot: u8) {
        let z = &mut self.insts1[idx];
        if z.target.is_none() {
            z.target = Some(label);
            z.target_slot = slot;
        } else {
            debug_assert!(z.target2.is_none());
            z.target2 = Some(label);
            z.target2_slot = slot;
        }
    }

    pub(crate) fn set_v1(&mut self, idx: usize, label: Label) {
        self.set_target(idx, label, 1);
        let z = &mut self.insts1[idx];
        if z.op_type == OperandForm::V {
            z.op_type = OperandForm::V_I1;
        }
    }

    pub(crate) fn set_v2(&mut self, idx: usize, label: Label) {
        self.set_target(idx, label, 2);
        let z = &mut self.insts1[idx];
        z.op_type = match z.op_type {
            OperandForm::VV => OperandForm::VV_I2,
            OperandForm::VVC => OperandForm::VVC_I2,
            OperandForm::VVA => OperandForm::VVA_I2,
            other => other,
        };
    }

    pub(crate) fn set_v3(&mut self, idx: usize, label: Label) {
        self.set_target(idx, label, 3);
        let z = &mut self.insts1[idx];
        z.op_type = match z.op_type {
            OperandForm::VVV => OperandForm::VVV_I3,
            other => other,
        };
    }

    /// Patches a conditional's branch through the operand slot the cond
    /// generator designated.
    pub(crate) fn set_v(&mut self, idx: usize, label: Label, branch_v: u8) {
        match branch_v {
            1 => self.set_v1(idx, label),
            2 => self.set_v2(idx, label),
            _ => self.set_v3(idx, label),
        }
    }

    // ---- goto bookkeeping ----------------------------------------------

    pub(crate) fn goto_stub(&mut self) -> usize {
        self.add_inst(Instr::new(Op::GotoV))
    }

    pub(crate) fn goto_to(&mut self, label: Label) -> usize {
        let idx = self.add_inst(Instr::new(Op::GotoV));
        self.set_v1(idx, label);
        idx
    }

    pub(crate) fn push_breaks(&mut self) {
        self.breaks.push(Vec::new());
    }

    pub(crate) fn push_nexts(&mut self) {
        self.nexts.push(Vec::new());
    }

    pub(crate) fn push_fallthroughs(&mut self) {
        self.fallthroughs.push(Vec::new());
    }

    pub(crate) fn push_catches(&mut self) {
        self.catches.push(Vec::new());
    }

    pub(crate) fn resolve_breaks(&mut self, label: Label) {
        if let Some(gotos) = self.breaks.pop() {
            for g in gotos {
                self.set_v1(g, label);
            }
        }
    }

    pub(crate) fn resolve_nexts(&mut self, label: Label) {
        if let Some(gotos) = self.nexts.pop() {
            for g in gotos {
                self.set_v1(g, label);
            }
        }
    }

    pub(crate) fn resolve_fallthroughs(&mut self, label: Label) {
        if let Some(gotos) = self.fallthroughs.pop() {
            for g in gotos {
                self.set_v1(g, label);
            }
        }
    }

    pub(crate) fn resolve_catches(&mut self, label: Label) {
        if let Some(gotos) = self.catches.pop() {
            for g in gotos {
                self.set_v1(g, label);
            }
        }
    }

    // ---- optimizer support ---------------------------------------------

    /// Walks forward from a branch destination to the first live
    /// instruction, or the end of the program.
    pub(crate) fn find_live_target(&self, label: Label) -> Label {
        let len = self.insts1.len();
        let mut idx = label.0;
        while idx < len && !self.insts1[idx].live {
            idx += 1;
        }
        Label(idx)
    }

    pub(crate) fn kill_inst(&mut self, idx: usize) {
        let (target, target2) = {
            let z = &mut self.insts1[idx];
            z.live = false;
            (z.target, z.target2)
        };
        for t in [target, target2].into_iter().flatten() {
            if t.0 < self.insts1.len() {
                self.insts1[t.0].num_labels = self.insts1[t.0].num_labels.saturating_sub(1);
            }
        }
    }
}
