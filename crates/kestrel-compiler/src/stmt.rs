use kestrel_ast::{
    expr_ids, normalized_tag, AssignLhs, ConstVal, Expr, Ident, Operand, Stmt, SwitchCase,
    TypeTag, WhenClause,
};
use kestrel_code::{Instr, InstrAux, IterInfo, Label, Op, OperandForm};

use crate::{CompileError, Generator};

impl Generator<'_> {
    pub(crate) fn compile_stmt(&mut self, s: &Stmt) -> Result<(), CompileError> {
        match s {
            Stmt::Null => Ok(()),
            Stmt::List(stmts) => {
                for st in stmts {
                    self.compile_stmt(st)?;
                }
                Ok(())
            }
            Stmt::Expr(e) => self.compile_expr_stmt(e),
            Stmt::Assign { lhs, rhs } => self.compile_assign(lhs, rhs),
            Stmt::Init(id) => self.compile_init(id),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.compile_if(cond, then_branch.as_deref(), else_branch.as_deref()),
            Stmt::While {
                cond_prologue,
                cond,
                body,
            } => self.compile_while(cond_prologue.as_deref(), cond, body),
            Stmt::Loop { body } => self.compile_loop(body),
            Stmt::For {
                loop_vars,
                value_var,
                aggr,
                body,
            } => self.compile_for(loop_vars, value_var.as_ref(), aggr, body),
            Stmt::Switch { on, cases, default } => self.compile_switch(on, cases, *default),
            Stmt::Return(value) => self.compile_return(value.as_ref()),
            Stmt::CatchReturn { block, ret_var } => {
                self.compile_catch_return(block, ret_var.as_ref())
            }
            Stmt::Break => self.compile_break(),
            Stmt::Next => self.compile_next(),
            Stmt::FallThrough => self.compile_fallthrough(),
            Stmt::When(clause) => self.compile_when(clause),
            Stmt::Event { handler, args } => {
                let mut z = Instr::new(Op::EventA);
                z.aux = Some(self.build_operand_aux(args)?);
                z.event = Some(handler.clone());
                self.add_inst(z);
                Ok(())
            }
        }
    }

    fn compile_expr_stmt(&mut self, e: &Expr) -> Result<(), CompileError> {
        match e {
            Expr::Call(call) => {
                if self.lower_intrinsic(call, None)? {
                    return Ok(());
                }
                self.do_call(call, None)
            }
            _ => Err(CompileError::internal(
                "expression statement is not a call",
            )),
        }
    }

    fn compile_assign(&mut self, lhs: &AssignLhs, rhs: &Expr) -> Result<(), CompileError> {
        match lhs {
            AssignLhs::Name(id) => {
                if let Expr::Call(call) = rhs {
                    if self.lower_intrinsic(call, Some(id))? {
                        return Ok(());
                    }
                    return self.do_call(call, Some(id));
                }
                self.lower_assign_to_name(id, rhs)
            }
            AssignLhs::Index { aggr, indexes } => match aggr.ty().tag() {
                TypeTag::Vector => self.assign_vec_elems(aggr, indexes, rhs),
                TypeTag::Table => self.assign_table_elem(aggr, indexes, rhs),
                _ => Err(CompileError::internal(
                    "bad aggregate type in indexed assignment",
                )),
            },
            AssignLhs::Field { record, field } => self.assign_field(record, *field, rhs),
        }
    }

    fn compile_init(&mut self, id: &Ident) -> Result<(), CompileError> {
        let op = match id.ty().tag() {
            TypeTag::Record => Op::InitRecordV,
            TypeTag::Vector => Op::InitVectorV,
            TypeTag::Table => Op::InitTableV,
            _ => {
                return Err(CompileError::internal(
                    "aggregate initialization of a non-aggregate",
                ))
            }
        };
        let slot = self.frame_slot(id)?;
        let mut z = Instr::v(op, slot);
        z.t = Some(id.ty().clone());
        z.check_if_managed(id.ty());
        self.add_inst(z);
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        s1: Option<&Stmt>,
        s2: Option<&Stmt>,
    ) -> Result<(), CompileError> {
        let (cond_idx, branch_v, from_gen_cond) = if let Expr::Name(n) = cond {
            let op = if s1.is_some() && s2.is_some() {
                Op::IfElseVV
            } else if s1.is_some() {
                Op::IfVV
            } else {
                Op::IfNotVV
            };
            let slot = self.frame_slot(n)?;
            let idx = self.add_inst(Instr::vv(op, slot, 0));
            (idx, 2u8, false)
        } else {
            let (idx, branch_v) = self.gen_cond(cond)?;
            (idx, branch_v, true)
        };

        if let Some(s1) = s1 {
            self.compile_stmt(s1)?;
            if let Some(s2) = s2 {
                let branch_after_s1 = self.goto_stub();
                self.compile_stmt(s2)?;
                self.set_v(cond_idx, self.label_beyond(branch_after_s1), branch_v);
                self.set_v1(branch_after_s1, self.here());
            } else {
                self.set_v(cond_idx, self.here(), branch_v);
            }
        } else if let Some(s2) = s2 {
            self.compile_stmt(s2)?;
            // The conditional was generated for "if (cond) ..."; an
            // else-only statement runs its block when the predicate fails,
            // so invert the sense.
            if from_gen_cond {
                self.invert_cond(cond_idx)?;
            }
            self.set_v(cond_idx, self.here(), branch_v);
        }
        Ok(())
    }

    fn invert_cond(&mut self, idx: usize) -> Result<(), CompileError> {
        let z = &mut self.insts1[idx];
        z.op = match z.op {
            Op::IfVV => Op::IfNotVV,
            Op::IfNotVV => Op::IfVV,
            Op::IfElseVV => Op::IfElseVV,
            other => other.negated_cond().ok_or_else(|| {
                CompileError::internal("inconsistency inverting a conditional")
            })?,
        };
        Ok(())
    }

    fn compile_while(
        &mut self,
        cond_prologue: Option<&Stmt>,
        cond: &Expr,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        let head = self.here();

        if let Some(p) = cond_prologue {
            self.compile_stmt(p)?;
        }

        let (cond_idx, branch_v) = if let Expr::Name(n) = cond {
            let slot = self.frame_slot(n)?;
            (self.add_inst(Instr::vv(Op::IfVV, slot, 0)), 2u8)
        } else {
            self.gen_cond(cond)?
        };

        self.push_nexts();
        self.push_breaks();

        if !matches!(body, Stmt::Null) {
            self.compile_stmt(body)?;
        }

        self.goto_to(head);
        let beyond_tail = self.here();
        self.set_v(cond_idx, beyond_tail, branch_v);

        self.resolve_nexts(head);
        self.resolve_breaks(beyond_tail);
        Ok(())
    }

    fn compile_loop(&mut self, body: &Stmt) -> Result<(), CompileError> {
        self.push_nexts();
        self.push_breaks();

        let head = self.here();
        self.compile_stmt(body)?;
        self.goto_to(head);

        self.resolve_nexts(head);
        self.resolve_breaks(self.here());
        Ok(())
    }

    fn compile_for(
        &mut self,
        loop_vars: &[Ident],
        value_var: Option<&Ident>,
        aggr: &Ident,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        self.push_nexts();
        self.push_breaks();

        match aggr.ty().tag() {
            TypeTag::Table => self.loop_over_table(loop_vars, value_var, aggr, body),
            TypeTag::Vector => self.loop_over_vector(loop_vars, aggr, body),
            TypeTag::Str => self.loop_over_string(loop_vars, aggr, body),
            _ => Err(CompileError::internal(
                "bad \"for\" loop-over value when compiling",
            )),
        }
    }

    fn loop_over_table(
        &mut self,
        loop_vars: &[Ident],
        value_var: Option<&Ident>,
        aggr: &Ident,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        let aggr_slot = self.frame_slot(aggr)?;

        let mut iter_info = IterInfo::default();
        for id in loop_vars {
            iter_info.loop_vars.push(self.frame_slot(id)?);
            iter_info.loop_var_types.push(id.ty().clone());
        }

        let info = self.new_slot(false);
        let mut init = Instr::vv(Op::InitTableLoopVVA, info, aggr_slot);
        let mut init_aux = InstrAux::default();
        init_aux.iter = Some(IterInfo::default());
        init.aux = Some(Box::new(init_aux));
        init.t = value_var.map(|vv| vv.ty().clone());
        self.add_inst(init);

        let iter_head = self.here();
        let next = if let Some(vv) = value_var {
            let vv_slot = self.frame_slot(vv)?;
            let mut z = Instr::vvv(Op::NextTableIterValVarVVVA, vv_slot, info, 0);
            let mut aux = InstrAux::default();
            aux.iter = Some(iter_info);
            z.aux = Some(Box::new(aux));
            z.check_if_managed(vv.ty());
            z
        } else {
            let mut z = Instr::vv(Op::NextTableIterVVA, info, 0);
            let mut aux = InstrAux::default();
            aux.iter = Some(iter_info);
            z.aux = Some(Box::new(aux));
            z
        };

        self.finish_loop(iter_head, next, body, info)
    }

    fn loop_over_vector(
        &mut self,
        loop_vars: &[Ident],
        aggr: &Ident,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        let loop_var = &loop_vars[0];
        let aggr_slot = self.frame_slot(aggr)?;

        let mut init = Instr::vv(Op::InitVectorLoopVV, self.new_slot(false), aggr_slot);
        let info = init.v1;
        let mut aux = InstrAux::default();
        aux.iter = Some(IterInfo {
            vec_type: Some(aggr.ty().clone()),
            yield_type: aggr.ty().yield_type().cloned(),
            ..IterInfo::default()
        });
        init.aux = Some(Box::new(aux));
        self.add_inst(init);

        let iter_head = self.here();
        let next = Instr::vvv(Op::NextVectorIterVVV, self.frame_slot(loop_var)?, info, 0);

        self.finish_loop(iter_head, next, body, info)
    }

    fn loop_over_string(
        &mut self,
        loop_vars: &[Ident],
        aggr: &Ident,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        let loop_var = &loop_vars[0];
        let aggr_slot = self.frame_slot(aggr)?;

        let info = self.new_slot(false);
        self.add_inst(Instr::vv(Op::InitStringLoopVV, info, aggr_slot));

        let iter_head = self.here();
        let mut next = Instr::vvv(Op::NextStringIterVVV, self.frame_slot(loop_var)?, info, 0);
        next.check_if_managed(loop_var.ty());

        self.finish_loop(iter_head, next, body, info)
    }

    fn finish_loop(
        &mut self,
        iter_head: Label,
        iter_stmt: Instr,
        body: &Stmt,
        info: i32,
    ) -> Result<(), CompileError> {
        let loop_iter = self.add_inst(iter_stmt);
        self.compile_stmt(body)?;

        self.goto_to(iter_head);
        let final_stmt = self.add_inst(Instr::v(Op::EndLoopV, info));
        let final_label = self.label_of(final_stmt);

        if self.insts1[loop_iter].op_type == OperandForm::VVA_I2 {
            self.set_v2(loop_iter, final_label);
        } else {
            self.set_v3(loop_iter, final_label);
        }

        self.resolve_nexts(iter_head);
        self.resolve_breaks(final_label);
        Ok(())
    }

    fn compile_switch(
        &mut self,
        on: &Operand,
        cases: &[SwitchCase],
        default: Option<usize>,
    ) -> Result<(), CompileError> {
        self.push_breaks();

        let slot = match on {
            Operand::Name(n) => self.frame_slot(n)?,
            Operand::Const(c) => {
                // A constant switch expression is odd enough that it is not
                // worth specializing; park it in a temporary.
                let tmp = self.new_slot(c.ty.is_managed());
                let mut z = Instr::vc(Op::AssignVC, tmp, c.clone());
                z.check_if_managed(&c.ty);
                self.add_inst(z);
                tmp
            }
        };

        let tag = normalized_tag(on.ty().tag());
        let (op, tbl) = match tag {
            TypeTag::Int => (Op::SwitchIntVVV, self.int_cases.len()),
            TypeTag::Count => (Op::SwitchCountVVV, self.uint_cases.len()),
            TypeTag::Double => (Op::SwitchDoubleVVV, self.double_cases.len()),
            TypeTag::Str | TypeTag::Addr | TypeTag::Subnet => {
                (Op::SwitchStrVVV, self.str_cases.len())
            }
            _ => return Err(CompileError::internal("bad switch type")),
        };

        let sw_head = self.add_inst(Instr::vvv(op, slot, tbl as i32, 0));

        let mut case_start: Vec<Label> = Vec::with_capacity(cases.len());
        self.push_fallthroughs();
        for case in cases {
            let start = self.here();
            self.resolve_fallthroughs(start);
            case_start.push(start);
            self.push_fallthroughs();
            self.compile_stmt(&case.body)?;
        }

        let sw_end = self.here();
        self.resolve_fallthroughs(sw_end);
        self.resolve_breaks(sw_end);

        match default {
            Some(d) => self.set_v3(sw_head, case_start[d]),
            None => self.set_v3(sw_head, sw_end),
        }

        self.fill_case_table(tag, cases, &case_start)
    }

    fn fill_case_table(
        &mut self,
        tag: TypeTag,
        cases: &[SwitchCase],
        case_start: &[Label],
    ) -> Result<(), CompileError> {
        match tag {
            TypeTag::Int => {
                let mut table = std::collections::BTreeMap::new();
                for (i, case) in cases.iter().enumerate() {
                    for v in &case.vals {
                        table.insert(case_key_int(v)?, case_start[i]);
                    }
                }
                self.int_cases.push(table);
            }
            TypeTag::Count => {
                let mut table = std::collections::BTreeMap::new();
                for (i, case) in cases.iter().enumerate() {
                    for v in &case.vals {
                        let key = v.val.as_count().ok_or_else(bad_case_value)?;
                        table.insert(key, case_start[i]);
                    }
                }
                self.uint_cases.push(table);
            }
            TypeTag::Double => {
                let mut table = std::collections::BTreeMap::new();
                for (i, case) in cases.iter().enumerate() {
                    for v in &case.vals {
                        let key = v.val.as_double().ok_or_else(bad_case_value)?;
                        table.insert(key.to_bits(), case_start[i]);
                    }
                }
                self.double_cases.push(table);
            }
            TypeTag::Str | TypeTag::Addr | TypeTag::Subnet => {
                let mut table = std::collections::BTreeMap::new();
                for (i, case) in cases.iter().enumerate() {
                    for v in &case.vals {
                        table.insert(case_key_str(v)?, case_start[i]);
                    }
                }
                self.str_cases.push(table);
            }
            _ => return Err(CompileError::internal("bad switch type")),
        }
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Operand>) -> Result<(), CompileError> {
        // Sync here rather than deferring; this also opens up frame-slot
        // sharing for the globals involved.
        self.sync_globals();

        if self.retvars.is_empty() {
            match value {
                Some(Operand::Name(n)) => {
                    let slot = self.frame_slot(n)?;
                    self.add_inst(Instr::v(Op::ReturnV, slot));
                }
                Some(Operand::Const(c)) => {
                    let mut z = Instr::new(Op::ReturnC);
                    z.c = Some(c.clone());
                    self.add_inst(z);
                }
                None => {
                    self.add_inst(Instr::new(Op::ReturnX));
                }
            }
            return Ok(());
        }

        let rv = self.retvars.last().cloned().unwrap_or(None);
        match (&value, &rv) {
            (Some(_), None) => {
                return Err(CompileError::internal(
                    "unexpected returned value inside inlined block",
                ))
            }
            (None, Some(_)) => {
                return Err(CompileError::internal(
                    "expected returned value inside inlined block but none provided",
                ))
            }
            (Some(op), Some(rv)) => {
                let rv = rv.clone();
                self.assign_operand_to(&rv, op)?;
            }
            (None, None) => {}
        }

        let g = self.goto_stub();
        self.catches
            .last_mut()
            .ok_or_else(|| CompileError::internal("untargeted inline return"))?
            .push(g);
        Ok(())
    }

    fn compile_catch_return(
        &mut self,
        block: &Stmt,
        ret_var: Option<&Ident>,
    ) -> Result<(), CompileError> {
        self.retvars.push(ret_var.cloned());
        self.push_catches();

        self.compile_stmt(block)?;
        self.retvars.pop();

        self.resolve_catches(self.here());
        Ok(())
    }

    fn compile_break(&mut self) -> Result<(), CompileError> {
        if self.breaks.is_empty() {
            return Err(CompileError::source(
                "\"break\" used without an enclosing \"for\" or \"switch\"",
            ));
        }
        let g = self.goto_stub();
        self.breaks.last_mut().unwrap().push(g);
        Ok(())
    }

    fn compile_next(&mut self) -> Result<(), CompileError> {
        if self.nexts.is_empty() {
            return Err(CompileError::source(
                "\"next\" used without an enclosing \"for\"",
            ));
        }
        let g = self.goto_stub();
        self.nexts.last_mut().unwrap().push(g);
        Ok(())
    }

    fn compile_fallthrough(&mut self) -> Result<(), CompileError> {
        if self.fallthroughs.is_empty() {
            return Err(CompileError::source(
                "\"fallthrough\" used without an enclosing \"switch\"",
            ));
        }
        let g = self.goto_stub();
        self.fallthroughs.last_mut().unwrap().push(g);
        Ok(())
    }

    fn compile_when(&mut self, clause: &WhenClause) -> Result<(), CompileError> {
        // The predicate is evaluated by the host against the interpreter
        // frame, so locals it reads must be materialized there and dirty
        // globals flushed.
        self.sync_globals();
        let mut flushed: Vec<Ident> = Vec::new();
        for id in expr_ids(&clause.cond) {
            if !id.is_global() && !flushed.contains(&id) && self.has_frame_slot(&id) {
                self.store_local(&id)?;
                flushed.push(id);
            }
        }

        match &clause.timeout {
            None => {
                let mut z = Instr::new(Op::WhenVV);
                z.v1 = clause.is_return as i32;
                z.deferred_expr = Some(clause.cond.clone());
                let when_eval = self.add_inst(z);

                let branch_past_blocks = self.goto_stub();
                self.compile_stmt(&clause.body)?;
                let when_done = self.add_inst(Instr::new(Op::ReturnX));

                self.set_v2(when_eval, self.label_beyond(branch_past_blocks));
                self.set_v1(branch_past_blocks, self.label_beyond(when_done));
            }
            Some((timeout, timeout_body)) => {
                let mut z;
                let timeout_is_const = timeout.as_const().is_some();
                match timeout {
                    Operand::Const(c) => {
                        z = Instr::new(Op::WhenTimeoutVVVC);
                        z.v3 = clause.is_return as i32;
                        z.c = Some(c.clone());
                    }
                    Operand::Name(n) => {
                        z = Instr::new(Op::WhenTimeoutVVVV);
                        z.v1 = self.frame_slot(n)?;
                        z.v4 = clause.is_return as i32;
                    }
                }
                z.deferred_expr = Some(clause.cond.clone());
                let when_eval = self.add_inst(z);

                let branch_past_blocks = self.goto_stub();
                self.compile_stmt(&clause.body)?;
                let when_done = self.add_inst(Instr::new(Op::ReturnX));

                self.compile_stmt(timeout_body)?;
                let t_done = self.add_inst(Instr::new(Op::ReturnX));

                if timeout_is_const {
                    self.set_v1(when_eval, self.label_beyond(branch_past_blocks));
                    self.set_v2(when_eval, self.label_beyond(when_done));
                } else {
                    self.set_v2(when_eval, self.label_beyond(branch_past_blocks));
                    self.set_v3(when_eval, self.label_beyond(when_done));
                }

                self.set_v1(branch_past_blocks, self.label_beyond(t_done));
            }
        }
        Ok(())
    }
}

fn bad_case_value() -> CompileError {
    CompileError::internal("bad case value when compiling switch")
}

fn case_key_int(v: &ConstVal) -> Result<i64, CompileError> {
    v.val.as_int().ok_or_else(bad_case_value)
}

fn case_key_str(v: &ConstVal) -> Result<String, CompileError> {
    use kestrel_value::Val;
    match &v.val {
        Val::Str(s) => Ok(s.as_ref().clone()),
        Val::Addr(a) => Ok(a.to_string()),
        Val::Subnet(s) => Ok(s.to_string()),
        _ => Err(bad_case_value()),
    }
}
