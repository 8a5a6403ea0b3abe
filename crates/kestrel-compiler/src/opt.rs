use kestrel_ast::Ident;
use kestrel_code::{assignmentless, FrameSharingInfo, Label, Op, OperandForm};
use rustc_hash::FxHashMap;

use crate::{CompileError, Generator};

impl Generator<'_> {
    /// The optimization driver: repeats dead-code removal, branch
    /// collapsing, lifetime analysis, and assignment pruning until a full
    /// round changes nothing, then remaps the value frame and the
    /// interpreter frame.
    pub(crate) fn optimize(&mut self) -> Result<(), CompileError> {
        // Account for targeted instructions.
        let len = self.insts1.len();
        for i in 0..len {
            for t in [self.insts1[i].target, self.insts1[i].target2]
                .into_iter()
                .flatten()
            {
                if t.0 < len && self.insts1[t.0].live {
                    self.insts1[t.0].num_labels += 1;
                }
            }
        }

        let mut switch_targets: Vec<Label> = Vec::new();
        switch_targets.extend(self.int_cases.iter().flatten().map(|(_, l)| *l));
        switch_targets.extend(self.uint_cases.iter().flatten().map(|(_, l)| *l));
        switch_targets.extend(self.double_cases.iter().flatten().map(|(_, l)| *l));
        switch_targets.extend(self.str_cases.iter().flatten().map(|(_, l)| *l));
        for t in switch_targets {
            if t.0 < len {
                self.insts1[t.0].num_labels += 1;
            }
        }

        loop {
            let mut something_changed = false;

            while self.remove_dead_code() {
                something_changed = true;
            }

            while self.collapse_gotos() {
                something_changed = true;
            }

            self.compute_frame_lifetimes();

            if self.prune_unused()? {
                something_changed = true;
            }

            if !something_changed {
                break;
            }
        }

        self.remap_frame();
        self.remap_interpreter_frame();
        Ok(())
    }

    /// Kills instructions that follow a non-continuing instruction and have
    /// no incoming labels.
    fn remove_dead_code(&mut self) -> bool {
        let mut did_removal = false;
        let len = self.insts1.len();
        if len < 2 {
            return false;
        }

        for i in 0..len - 1 {
            let i0 = &self.insts1[i];
            let i1 = &self.insts1[i + 1];

            if i0.live
                && i1.live
                && i0.op.does_not_continue()
                && i0.target != Some(Label(i + 1))
                && i1.num_labels == 0
            {
                did_removal = true;
                self.kill_inst(i + 1);
            }
        }

        did_removal
    }

    /// Collapses branch-to-branch chains and branches to the next live
    /// instruction.
    fn collapse_gotos(&mut self) -> bool {
        let mut did_collapse = false;
        let len = self.insts1.len();

        for i in 0..len {
            if !self.insts1[i].live {
                continue;
            }
            let Some(mut t) = self.insts1[i].target else {
                continue;
            };

            // Secondary targets are rare enough not to bother with.

            let chains_to_goto = |g: &Generator<'_>, l: Label| {
                l.0 < len
                    && l.0 != i
                    && g.insts1[l.0].live
                    && g.insts1[l.0].op.is_unconditional_branch()
                    && g.insts1[l.0].target.is_some()
            };

            if chains_to_goto(self, t) {
                // Branch to branch: skip through the chain.
                did_collapse = true;
                loop {
                    self.insts1[t.0].num_labels =
                        self.insts1[t.0].num_labels.saturating_sub(1);

                    let next = self.insts1[t.0].target.unwrap_or(t);
                    t = next;
                    self.insts1[i].target = Some(t);

                    if t.0 < len {
                        self.insts1[t.0].num_labels += 1;
                        if chains_to_goto(self, t) {
                            continue;
                        }
                    }
                    break;
                }
            }

            // Branch to the next live instruction, accounting for dead code
            // in between.
            let mut j = i + 1;
            let mut branches_into_dead = false;
            while j < len && !self.insts1[j].live {
                if t == Label(j) {
                    branches_into_dead = true;
                }
                j += 1;
            }

            if branches_into_dead || t == Label(j) || (j == len && t.0 >= len) {
                if t.0 < len {
                    self.insts1[t.0].num_labels -= 1;
                }

                if self.insts1[i].op.is_unconditional_branch() {
                    // No point keeping the branch. Label counts are already
                    // adjusted, so clear liveness directly.
                    self.insts1[i].live = false;
                    did_collapse = true;
                } else if j < len {
                    self.insts1[i].target = Some(Label(j));
                    self.insts1[j].num_labels += 1;
                }
            }
        }

        did_collapse
    }

    /// Kills or re-flavors assignments whose destination is never used.
    fn prune_unused(&mut self) -> Result<bool, CompileError> {
        let mut did_prune = false;

        for i in 0..self.insts1.len() {
            let z = &self.insts1[i];
            if !z.live {
                continue;
            }

            if z.op.is_frame_store() && !self.var_is_assigned(z.v1) {
                did_prune = true;
                self.kill_inst(i);
                continue;
            }

            if (z.op.is_frame_load() || z.op.is_global_load()) && !self.var_is_used(z.v1) {
                did_prune = true;
                self.kill_inst(i);
                continue;
            }

            if !z.op.assigns_to_slot1() {
                continue;
            }

            // Branching assigners are loop heads; their assignment is part
            // of the iteration protocol and never prunable.
            if z.target.is_some() {
                continue;
            }

            let slot = z.v1 as usize;
            if self.denizen_ending.contains_key(&slot) || self.frame_denizens[slot].is_global() {
                continue;
            }

            // An assignment to a local that is never otherwise used.
            if !z.op.side_effects() {
                did_prune = true;
                self.kill_inst(i);
                continue;
            }

            let Some((bare_op, bare_form)) = assignmentless(z.op) else {
                return Err(CompileError::internal(
                    "inconsistency in re-flavoring instruction with side effects",
                ));
            };

            let z = &mut self.insts1[i];
            z.op = bare_op;
            z.op_type = bare_form;
            z.v1 = z.v2;
            z.v2 = z.v3;
            z.v3 = z.v4;

            // The instruction survives but its assignment is gone, so
            // lifetimes deserve another look.
            did_prune = true;
        }

        Ok(did_prune)
    }

    fn var_is_assigned(&self, slot: i32) -> bool {
        self.insts1.iter().any(|z| {
            if !z.live {
                return false;
            }
            if matches!(z.op, Op::NextTableIterVVA | Op::NextTableIterValVarVVVA) {
                if let Some(iter) = z.aux.as_ref().and_then(|aux| aux.iter.as_ref()) {
                    if iter.loop_vars.contains(&slot) {
                        return true;
                    }
                }
                if z.op == Op::NextTableIterVVA {
                    return false;
                }
            }
            if z.op_type == OperandForm::VVFrame {
                // Loads materialize interpreter values; they do not count as
                // modifying the variable.
                return false;
            }
            z.op.assigns_to_slot1() && z.v1 == slot
        })
    }

    fn var_is_used(&self, slot: i32) -> bool {
        self.insts1.iter().any(|z| {
            if !z.live {
                return false;
            }
            if z.uses_slot(slot) {
                return true;
            }
            z.aux
                .as_ref()
                .is_some_and(|aux| aux.items.iter().any(|item| item.slot == slot))
        })
    }

    /// Builds, from scratch, where each frame denizen's lifetime begins and
    /// ends. Non-temporaries are widened to enclosing loop boundaries since
    /// their values may flow around the back edge.
    fn compute_frame_lifetimes(&mut self) {
        self.inst_beginnings.clear();
        self.inst_endings.clear();
        self.denizen_beginning.clear();
        self.denizen_ending.clear();

        let len = self.insts1.len();
        for i in 0..len {
            if !self.insts1[i].live {
                continue;
            }

            if self.insts1[i].op.assigns_to_slot1() {
                let v1 = self.insts1[i].v1;
                self.check_slot_assignment(v1 as usize, i);
            }

            match self.insts1[i].op {
                Op::NextTableIterVVA | Op::NextTableIterValVarVVVA => {
                    // These assign to an arbitrarily long list of loop
                    // variables, and those must stay distinct for the whole
                    // loop even when unused inside it.
                    let depth = self.insts1[i].loop_depth;
                    let loop_vars: Vec<i32> = self.insts1[i]
                        .aux
                        .as_ref()
                        .and_then(|aux| aux.iter.as_ref())
                        .map(|iter| iter.loop_vars.to_vec())
                        .unwrap_or_default();
                    let end = self.end_of_loop(i, depth.max(1));
                    for v in loop_vars {
                        self.check_slot_assignment(v as usize, i);
                        self.extend_lifetime(v as usize, end);
                    }
                    if self.insts1[i].op == Op::NextTableIterValVarVVVA {
                        let v1 = self.insts1[i].v1 as usize;
                        self.extend_lifetime(v1, end);
                    }
                }

                Op::SyncGlobalsX => {
                    // Extend the lifetime of any modified globals: to the
                    // end of the enclosing loop, or of the function when
                    // there is none.
                    let modified: Vec<Ident> =
                        self.modified_globals.iter().cloned().collect();
                    let end = if self.insts1[i].loop_depth >= 1 {
                        self.end_of_loop(i, 1)
                    } else {
                        self.last_live_inst(i)
                    };
                    for g in modified {
                        let Some(&gs) = self.frame_layout1.get(&g) else {
                            continue;
                        };
                        if self.denizen_beginning.contains_key(&gs) {
                            self.extend_lifetime(gs, end);
                        }
                    }
                }

                Op::InitTableLoopVVA | Op::InitVectorLoopVV | Op::InitStringLoopVV => {
                    // The looped-over aggregate is needed for the whole
                    // loop, not just the initializer.
                    let mut succ = i + 1;
                    while succ < len && !self.insts1[succ].live {
                        succ += 1;
                    }
                    if succ < len {
                        let depth = self.insts1[succ].loop_depth;
                        let v2 = self.insts1[i].v2 as usize;
                        let end = self.end_of_loop(succ, depth.max(1));
                        self.extend_lifetime(v2, end);
                    }
                    // The aggregate's lifetime is already set; skip the
                    // generic use scan to keep the extension consistent.
                    continue;
                }

                _ => {
                    if let Some(aux) = &self.insts1[i].aux {
                        let slots: Vec<i32> =
                            aux.items.iter().map(|item| item.slot).collect();
                        let end = self.end_of_loop(i, 1);
                        for s in slots {
                            if s >= 0 {
                                self.extend_lifetime(s as usize, end);
                            }
                        }
                    }
                }
            }

            let used = self.insts1[i].used_slots();
            for s in used {
                self.check_slot_use(s, i);
            }
        }
    }

    fn check_slot_assignment(&mut self, slot: usize, inst: usize) {
        debug_assert!(slot < self.frame_denizens.len());

        // Temporaries are built so their values are never used earlier than
        // their definitions in loop bodies; everything else gets its
        // beginning widened to the start of any enclosing loop.
        let inst = if self
            .analyses
            .reducer
            .is_temporary(&self.frame_denizens[slot])
        {
            inst
        } else {
            self.beginning_of_loop(inst, 1)
        };

        self.set_lifetime_start(slot, inst);
    }

    fn set_lifetime_start(&mut self, slot: usize, inst: usize) {
        if let Some(&beginning) = self.denizen_beginning.get(&slot) {
            debug_assert!(beginning <= inst);
            return;
        }

        self.denizen_beginning.insert(slot, inst);
        let id = self.frame_denizens[slot].clone();
        self.inst_beginnings.entry(inst).or_default().push(id);
    }

    fn check_slot_use(&mut self, slot: i32, inst: usize) {
        if slot < 0 {
            return;
        }
        let slot = slot as usize;
        debug_assert!(slot < self.frame_denizens.len());

        let inst = if self
            .analyses
            .reducer
            .is_temporary(&self.frame_denizens[slot])
        {
            // A temporary used deeper than its definition must live to the
            // end of that deeper loop.
            let defn_depth = self
                .denizen_beginning
                .get(&slot)
                .map(|&b| self.insts1[b].loop_depth)
                .unwrap_or(0);
            if self.insts1[inst].loop_depth > defn_depth {
                self.end_of_loop(inst, self.insts1[inst].loop_depth)
            } else {
                inst
            }
        } else {
            self.end_of_loop(inst, 1)
        };

        self.extend_lifetime(slot, inst);
    }

    fn extend_lifetime(&mut self, slot: usize, inst: usize) {
        let id = self.frame_denizens[slot].clone();

        if let Some(&old_inst) = self.denizen_ending.get(&slot) {
            if self.insts1[inst].loop_depth > 0
                && self.analyses.reducer.is_temporary(&id)
                && old_inst >= inst
            {
                // Already extended past here, e.g. a loop-over target.
                return;
            }

            if old_inst < inst {
                if let Some(ids) = self.inst_endings.get_mut(&old_inst) {
                    ids.retain(|other| other != &id);
                }
                self.inst_endings.entry(inst).or_default().push(id);
                self.denizen_ending.insert(slot, inst);
            }
        } else {
            self.denizen_ending.insert(slot, inst);
            self.inst_endings.entry(inst).or_default().push(id);
        }
    }

    /// The first live instruction of the outermost loop region at `depth`
    /// enclosing `inst`, or `inst` itself if it is not in such a region.
    fn beginning_of_loop(&self, inst: usize, depth: u32) -> usize {
        let mut i = inst as i64;
        while i >= 0 && self.insts1[i as usize].loop_depth >= depth {
            i -= 1;
        }

        if i == inst as i64 {
            return inst;
        }

        let mut i = (i + 1) as usize;
        while i != inst && !self.insts1[i].live {
            i += 1;
        }
        i
    }

    /// The last live instruction of the body, never earlier than `floor`.
    fn last_live_inst(&self, floor: usize) -> usize {
        let mut i = self.insts1.len() - 1;
        while i > floor && !self.insts1[i].live {
            i -= 1;
        }
        i
    }

    /// The last live instruction of the loop region at `depth` enclosing
    /// `inst`.
    fn end_of_loop(&self, inst: usize, depth: u32) -> usize {
        let len = self.insts1.len();
        let mut i = inst;
        while i < len && self.insts1[i].loop_depth >= depth {
            i += 1;
        }

        if i == inst {
            return inst;
        }

        let mut i = i - 1;
        while i != inst && !self.insts1[i].live {
            i -= 1;
        }
        i
    }

    /// Walks the instructions in order, assigning each denizen whose
    /// lifetime begins there to a compatible post-optimization slot.
    fn remap_frame(&mut self) {
        self.frame1_to_frame2 = vec![-1; self.frame_denizens.len()];
        self.managed_slots.clear();

        for i in 0..self.insts1.len() {
            let Some(vars) = self.inst_beginnings.get(&i).cloned() else {
                continue;
            };
            for v in vars {
                // Denizens whose values are never used don't get a slot.
                let slot = self.frame_layout1[&v];
                if self.denizen_ending.contains_key(&slot) {
                    self.remap_var(&v, slot, i);
                }
            }
        }

        // Prune globals that didn't wind up being used.
        let mut used_globals = Vec::new();
        let mut remapped_globals: Vec<i32> = Vec::with_capacity(self.globals.len());
        for g in &self.globals {
            let new_slot = self.frame1_to_frame2[g.slot as usize];
            if new_slot >= 0 {
                remapped_globals.push(used_globals.len() as i32);
                let mut g = g.clone();
                g.slot = new_slot;
                used_globals.push(g);
            } else {
                remapped_globals.push(-1);
            }
        }
        self.globals = used_globals;

        // Rewrite every live instruction's slot usage. Direct assignments
        // that collapse to <slot-n> = <slot-n> disappear.
        let map = self.frame1_to_frame2.clone();
        for i in 0..self.insts1.len() {
            if !self.insts1[i].live {
                continue;
            }

            match self.insts1[i].op {
                Op::NextTableIterVVA | Op::NextTableIterValVarVVVA => {
                    let z = &mut self.insts1[i];
                    if let Some(iter) =
                        z.aux.as_mut().and_then(|aux| aux.iter.as_mut())
                    {
                        for v in iter.loop_vars.iter_mut() {
                            debug_assert!(*v >= 0 && (*v as usize) < map.len());
                            *v = map[*v as usize];
                        }
                    }
                    self.insts1[i].update_slots(&map);
                    continue;
                }

                Op::DirtyGlobalV => {
                    // The operand indexes the globals table, not the frame.
                    // A marker for a global that lost its slot (nothing
                    // keeps its value alive) has nothing left to mark.
                    let g = self.insts1[i].v1 as usize;
                    if remapped_globals[g] < 0 {
                        self.kill_inst(i);
                    } else {
                        self.insts1[i].v1 = remapped_globals[g];
                    }
                    continue;
                }

                Op::LoadGlobalVC => {
                    // v2 indexes the globals table.
                    let z = &mut self.insts1[i];
                    let g = z.v2 as usize;
                    debug_assert!(remapped_globals[g] >= 0);
                    z.v2 = remapped_globals[g];
                    z.v1 = map[z.v1 as usize];
                    continue;
                }

                _ => {
                    if let Some(aux) = self.insts1[i].aux.as_mut() {
                        for item in aux.items.iter_mut() {
                            if item.slot >= 0 {
                                item.slot = map[item.slot as usize];
                            }
                        }
                    }
                }
            }

            self.insts1[i].update_slots(&map);

            let z = &self.insts1[i];
            if z.op.is_direct_assignment() && z.v1 == z.v2 {
                self.kill_inst(i);
            }
        }
    }

    /// Finds a post-optimization slot for one denizen: greedily, with a
    /// preference for a slot whose current scope ends exactly where this
    /// lifetime starts. That case is common for parameter copies introduced
    /// by inlining, and sharing the slot lets the copy collapse away.
    fn remap_var(&mut self, id: &Ident, slot: usize, inst: usize) {
        let is_managed = id.ty().is_managed();

        let mut apt_slot: Option<usize> = None;
        for (i, s) in self.shared_frame_denizens.iter().enumerate() {
            // scope_end <= inst rather than <: instructions read their
            // operands before writing their destination, so a lifetime may
            // begin at the instruction where another ends.
            if s.scope_end <= inst && s.is_managed == is_managed {
                if s.scope_end == inst {
                    apt_slot = Some(i);
                    break;
                }
                if apt_slot.is_none() {
                    apt_slot = Some(i);
                }
            }
        }

        let scope_end = self.denizen_ending[&slot];

        let apt_slot = match apt_slot {
            Some(s) => s,
            None => {
                let s = self.shared_frame_denizens.len();
                self.shared_frame_denizens
                    .push(FrameSharingInfo::new(is_managed));
                if is_managed {
                    self.managed_slots.push(s);
                }
                s
            }
        };

        let s = &mut self.shared_frame_denizens[apt_slot];
        s.ids.push(id.clone());
        s.id_start.push(inst);
        s.scope_end = scope_end;

        self.frame1_to_frame2[slot] = apt_slot as i32;
    }

    /// Remaps the host interpreter's frame: parameters keep their leading
    /// offsets, every cohort that still materializes values there shares a
    /// single slot, and frame-typed instructions get their offsets
    /// rewritten.
    fn remap_interpreter_frame(&mut self) {
        let mut interpreter_slots: FxHashMap<Ident, usize> = FxHashMap::default();
        let mut old_to_new: FxHashMap<usize, usize> = FxHashMap::default();
        let mut next_interp_slot = 0usize;

        for param in &self.func.params {
            debug_assert_eq!(param.offset(), next_interp_slot);
            interpreter_slots.insert(param.clone(), next_interp_slot);
            old_to_new.insert(param.offset(), next_interp_slot);
            next_interp_slot += 1;
        }

        for sf in &self.shared_frame_denizens {
            let mut cohort_slot: Option<usize> = None;

            for id in &sf.ids {
                if let Some(&s) = interpreter_slots.get(id) {
                    debug_assert!(cohort_slot.is_none());
                    cohort_slot = Some(s);
                }
            }

            for id in &sf.ids {
                if !self.interpreter_locals.contains(id) {
                    continue;
                }
                if interpreter_slots.contains_key(id) {
                    continue;
                }

                let slot = match cohort_slot {
                    Some(s) => s,
                    None => {
                        let s = next_interp_slot;
                        next_interp_slot += 1;
                        cohort_slot = Some(s);
                        s
                    }
                };

                interpreter_slots.insert(id.clone(), slot);
                old_to_new.insert(id.offset(), slot);
                id.set_offset(slot);
            }
        }

        // Locals that only ever live in interpreter-land.
        for id in &self.interpreter_locals {
            if !interpreter_slots.contains_key(id) {
                interpreter_slots.insert(id.clone(), next_interp_slot);
                next_interp_slot += 1;
            }
        }

        self.interp_frame_size = next_interp_slot;

        for z in self.insts1.iter_mut() {
            if !z.live {
                continue;
            }
            if z.op_type == OperandForm::VVFrame {
                if let Some(&new) = old_to_new.get(&(z.v2 as usize)) {
                    z.v2 = new as i32;
                }
            }
        }
    }
}
