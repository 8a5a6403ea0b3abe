use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use kestrel_ast::{ConstVal, Type};
use kestrel_code::{CompiledBody, Instr, InstrAux, Op};
use kestrel_value::{release, IterVal, TableKey, TableVal, Val};

use crate::{ExecEnv, ExecOutcome, Flow, GlobalState, RuntimeError, WhenSpec};

/// Transport protocol lives in the high bits of a port value.
const PORT_PROTO_SHIFT: u32 = 16;

/// Runs a compiled body from its entry point.
pub fn execute(
    body: &CompiledBody,
    interp_frame: &mut [Val],
    env: &mut ExecEnv<'_>,
) -> Result<ExecOutcome, RuntimeError> {
    execute_from(body, 0, interp_frame, env)
}

/// Runs a compiled body from a saved program counter.
pub fn execute_from(
    body: &CompiledBody,
    start_pc: usize,
    interp_frame: &mut [Val],
    env: &mut ExecEnv<'_>,
) -> Result<ExecOutcome, RuntimeError> {
    match &body.fixed_frame {
        Some(cell) => {
            let mut frame = cell.try_borrow_mut().map_err(|_| {
                RuntimeError::new("non-recursive function re-entered while its frame is in use")
            })?;
            run(body, start_pc, &mut frame, interp_frame, env)
        }
        None => {
            let mut frame = vec![Val::Nil; body.frame_size];
            run(body, start_pc, &mut frame, interp_frame, env)
        }
    }
}

/// Dispatch plus teardown: managed slots are released on every exit path,
/// error or not.
fn run(
    body: &CompiledBody,
    start_pc: usize,
    frame: &mut [Val],
    interp_frame: &mut [Val],
    env: &mut ExecEnv<'_>,
) -> Result<ExecOutcome, RuntimeError> {
    let result = dispatch(body, start_pc, frame, interp_frame, env);
    for &s in &body.managed_slots {
        release(&mut frame[s]);
    }
    result
}

enum Ctrl {
    Next,
    Jump(usize),
    Finish(Flow),
}

fn dispatch(
    body: &CompiledBody,
    start_pc: usize,
    frame: &mut [Val],
    interp_frame: &mut [Val],
    env: &mut ExecEnv<'_>,
) -> Result<ExecOutcome, RuntimeError> {
    let mut global_state = vec![GlobalState::Unloaded; body.globals.len()];
    let mut pc = start_pc;
    let end_pc = body.insts2.len();
    let mut ret: Option<Val> = None;

    if let Some(p) = env.profile.as_deref_mut() {
        p.ensure_len(end_pc);
    }

    let invocation_start = env.profile.is_some().then(Instant::now);

    while pc < end_pc {
        let z = &body.insts2[pc];
        let inst_start = env.profile.is_some().then(Instant::now);

        let ctrl = step(body, z, frame, interp_frame, env, &mut global_state, &mut ret)?;

        if let (Some(p), Some(t0)) = (env.profile.as_deref_mut(), inst_start) {
            p.record(z.op, pc, t0.elapsed());
        }

        match ctrl {
            Ctrl::Next => pc += 1,
            Ctrl::Jump(target) => pc = target,
            Ctrl::Finish(flow) => {
                if let (Some(p), Some(t0)) = (env.profile.as_deref_mut(), invocation_start) {
                    p.cpu_time += t0.elapsed();
                }
                return Ok(ExecOutcome { value: ret, flow });
            }
        }
    }

    if let (Some(p), Some(t0)) = (env.profile.as_deref_mut(), invocation_start) {
        p.cpu_time += t0.elapsed();
    }

    Ok(ExecOutcome {
        value: ret,
        flow: Flow::Return,
    })
}

fn step(
    body: &CompiledBody,
    z: &Instr,
    frame: &mut [Val],
    interp_frame: &mut [Val],
    env: &mut ExecEnv<'_>,
    global_state: &mut [GlobalState],
    ret: &mut Option<Val>,
) -> Result<Ctrl, RuntimeError> {
    let ctrl = match z.op {
        Op::Nop => Ctrl::Next,

        // ---- moves ------------------------------------------------------
        Op::AssignVV => {
            let v = frame[z.v2 as usize].clone();
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AssignVC => {
            let v = const_of(z)?.val.clone();
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- interpreter frame and globals ------------------------------
        Op::LoadValVV => {
            let v = interp_frame[z.v2 as usize].clone();
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::StoreValVV => {
            interp_frame[z.v2 as usize] = frame[z.v1 as usize].clone();
            Ctrl::Next
        }
        Op::LoadGlobalVC => {
            let g = z.v2 as usize;
            if global_state[g] == GlobalState::Unloaded {
                let v = env.globals.get(body.globals[g].id.name());
                assign(frame, z, v);
                global_state[g] = GlobalState::Clean;
            }
            Ctrl::Next
        }
        Op::DirtyGlobalV => {
            global_state[z.v1 as usize] = GlobalState::Dirty;
            Ctrl::Next
        }
        Op::SyncGlobalsX => {
            sync_globals(body, frame, env, global_state);
            Ctrl::Next
        }

        // ---- control ----------------------------------------------------
        Op::GotoV => Ctrl::Jump(z.v1 as usize),
        Op::IfVV | Op::IfElseVV => {
            if frame[z.v1 as usize].truthy() {
                Ctrl::Next
            } else {
                Ctrl::Jump(z.v2 as usize)
            }
        }
        Op::IfNotVV => {
            if frame[z.v1 as usize].truthy() {
                Ctrl::Jump(z.v2 as usize)
            } else {
                Ctrl::Next
            }
        }
        Op::HasFieldCondVVV | Op::NotHasFieldCondVVV => {
            let rec = want_record(&frame[z.v1 as usize])?;
            let has = rec
                .borrow()
                .get(z.v2 as usize)
                .is_some_and(|f| !f.is_nil());
            let wanted = z.op == Op::HasFieldCondVVV;
            if has == wanted {
                Ctrl::Next
            } else {
                Ctrl::Jump(z.v3 as usize)
            }
        }
        Op::ValIsInTableCondVVV | Op::ValIsNotInTableCondVVV => {
            let key = table_key(std::slice::from_ref(&frame[z.v1 as usize]))?;
            let tbl = want_table(&frame[z.v2 as usize])?;
            let found = tbl.borrow().contains(&key);
            let wanted = z.op == Op::ValIsInTableCondVVV;
            if found == wanted {
                Ctrl::Next
            } else {
                Ctrl::Jump(z.v3 as usize)
            }
        }
        Op::ConstIsInTableCondVVC | Op::ConstIsNotInTableCondVVC => {
            let key = table_key(std::slice::from_ref(&const_of(z)?.val))?;
            let tbl = want_table(&frame[z.v1 as usize])?;
            let found = tbl.borrow().contains(&key);
            let wanted = z.op == Op::ConstIsInTableCondVVC;
            if found == wanted {
                Ctrl::Next
            } else {
                Ctrl::Jump(z.v2 as usize)
            }
        }

        // ---- switches ---------------------------------------------------
        Op::SwitchIntVVV => {
            let key = want_int(&frame[z.v1 as usize])?;
            let tbl = &body.cases.int_cases[z.v2 as usize];
            Ctrl::Jump(tbl.get(&key).copied().unwrap_or(z.v3 as u32) as usize)
        }
        Op::SwitchCountVVV => {
            let key = want_count(&frame[z.v1 as usize])?;
            let tbl = &body.cases.uint_cases[z.v2 as usize];
            Ctrl::Jump(tbl.get(&key).copied().unwrap_or(z.v3 as u32) as usize)
        }
        Op::SwitchDoubleVVV => {
            let key = want_double(&frame[z.v1 as usize])?.to_bits();
            let tbl = &body.cases.double_cases[z.v2 as usize];
            Ctrl::Jump(tbl.get(&key).copied().unwrap_or(z.v3 as u32) as usize)
        }
        Op::SwitchStrVVV => {
            let key = switch_str_key(&frame[z.v1 as usize])?;
            let tbl = &body.cases.str_cases[z.v2 as usize];
            Ctrl::Jump(tbl.get(&key).copied().unwrap_or(z.v3 as u32) as usize)
        }

        // ---- returns ----------------------------------------------------
        Op::ReturnV => {
            *ret = Some(frame[z.v1 as usize].clone());
            Ctrl::Finish(Flow::Return)
        }
        Op::ReturnC => {
            *ret = Some(const_of(z)?.val.clone());
            Ctrl::Finish(Flow::Return)
        }
        Op::ReturnX => Ctrl::Finish(Flow::Return),
        Op::HookBreakX => Ctrl::Finish(Flow::HookBreak),

        // ---- when -------------------------------------------------------
        Op::WhenVV => {
            let spec = WhenSpec {
                cond: deferred_of(z)?,
                body_pc: z.v2 as usize,
                timeout: None,
                is_return: z.v1 != 0,
            };
            env.runtime.defer_when(spec)?;
            Ctrl::Next
        }
        Op::WhenTimeoutVVVC => {
            let spec = WhenSpec {
                cond: deferred_of(z)?,
                body_pc: z.v1 as usize,
                timeout: Some((const_of(z)?.val.clone(), z.v2 as usize)),
                is_return: z.v3 != 0,
            };
            env.runtime.defer_when(spec)?;
            Ctrl::Next
        }
        Op::WhenTimeoutVVVV => {
            let spec = WhenSpec {
                cond: deferred_of(z)?,
                body_pc: z.v2 as usize,
                timeout: Some((frame[z.v1 as usize].clone(), z.v3 as usize)),
                is_return: z.v4 != 0,
            };
            env.runtime.defer_when(spec)?;
            Ctrl::Next
        }

        // ---- int arithmetic ---------------------------------------------
        Op::AddIntVVV | Op::SubIntVVV | Op::MulIntVVV | Op::DivIntVVV | Op::ModIntVVV => {
            let a = want_int(&frame[z.v2 as usize])?;
            let b = want_int(&frame[z.v3 as usize])?;
            let v = Val::Int(int_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AddIntVVC | Op::SubIntVVC | Op::MulIntVVC | Op::DivIntVVC | Op::ModIntVVC => {
            let a = want_int(&frame[z.v2 as usize])?;
            let b = want_int(&const_of(z)?.val)?;
            let v = Val::Int(int_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::SubIntVCV | Op::DivIntVCV | Op::ModIntVCV => {
            let a = want_int(&const_of(z)?.val)?;
            let b = want_int(&frame[z.v2 as usize])?;
            let v = Val::Int(int_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- count arithmetic -------------------------------------------
        Op::AddCountVVV | Op::SubCountVVV | Op::MulCountVVV | Op::DivCountVVV
        | Op::ModCountVVV => {
            let a = want_count(&frame[z.v2 as usize])?;
            let b = want_count(&frame[z.v3 as usize])?;
            let v = Val::Count(count_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AddCountVVC | Op::SubCountVVC | Op::MulCountVVC | Op::DivCountVVC
        | Op::ModCountVVC => {
            let a = want_count(&frame[z.v2 as usize])?;
            let b = want_count(&const_of(z)?.val)?;
            let v = Val::Count(count_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::SubCountVCV | Op::DivCountVCV | Op::ModCountVCV => {
            let a = want_count(&const_of(z)?.val)?;
            let b = want_count(&frame[z.v2 as usize])?;
            let v = Val::Count(count_arith(z.op, a, b)?);
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- double arithmetic ------------------------------------------
        Op::AddDoubleVVV | Op::SubDoubleVVV | Op::MulDoubleVVV | Op::DivDoubleVVV => {
            let a = want_double(&frame[z.v2 as usize])?;
            let b = want_double(&frame[z.v3 as usize])?;
            let v = Val::Double(double_arith(z.op, a, b));
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AddDoubleVVC | Op::SubDoubleVVC | Op::MulDoubleVVC | Op::DivDoubleVVC => {
            let a = want_double(&frame[z.v2 as usize])?;
            let b = want_double(&const_of(z)?.val)?;
            let v = Val::Double(double_arith(z.op, a, b));
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::SubDoubleVCV | Op::DivDoubleVCV => {
            let a = want_double(&const_of(z)?.val)?;
            let b = want_double(&frame[z.v2 as usize])?;
            let v = Val::Double(double_arith(z.op, a, b));
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- string concatenation ---------------------------------------
        Op::AddStrVVV => {
            let a = want_str(&frame[z.v2 as usize])?.clone();
            let b = want_str(&frame[z.v3 as usize])?.clone();
            let v = concat_strs(&a, &b);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AddStrVVC => {
            let a = want_str(&frame[z.v2 as usize])?.clone();
            let b = want_str(&const_of(z)?.val)?.clone();
            let v = concat_strs(&a, &b);
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AddStrVCV => {
            let a = want_str(&const_of(z)?.val)?.clone();
            let b = want_str(&frame[z.v2 as usize])?.clone();
            let v = concat_strs(&a, &b);
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- unary ------------------------------------------------------
        Op::NegIntVV => {
            let a = want_int(&frame[z.v2 as usize])?;
            assign(frame, z, Val::Int(a.wrapping_neg()));
            Ctrl::Next
        }
        Op::NegDoubleVV => {
            let a = want_double(&frame[z.v2 as usize])?;
            assign(frame, z, Val::Double(-a));
            Ctrl::Next
        }
        Op::NotVV => {
            let a = frame[z.v2 as usize].truthy();
            assign(frame, z, Val::Bool(!a));
            Ctrl::Next
        }

        // ---- comparisons ------------------------------------------------
        Op::EqIntVVV | Op::NeIntVVV | Op::LtIntVVV | Op::LeIntVVV | Op::GtIntVVV
        | Op::GeIntVVV => {
            let a = want_int(&frame[z.v2 as usize])?;
            let b = want_int(&frame[z.v3 as usize])?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqIntVVC | Op::NeIntVVC | Op::LtIntVVC | Op::LeIntVVC | Op::GtIntVVC
        | Op::GeIntVVC => {
            let a = want_int(&frame[z.v2 as usize])?;
            let b = want_int(&const_of(z)?.val)?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqCountVVV | Op::NeCountVVV | Op::LtCountVVV | Op::LeCountVVV | Op::GtCountVVV
        | Op::GeCountVVV => {
            let a = want_count(&frame[z.v2 as usize])?;
            let b = want_count(&frame[z.v3 as usize])?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqCountVVC | Op::NeCountVVC | Op::LtCountVVC | Op::LeCountVVC | Op::GtCountVVC
        | Op::GeCountVVC => {
            let a = want_count(&frame[z.v2 as usize])?;
            let b = want_count(&const_of(z)?.val)?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqDoubleVVV | Op::NeDoubleVVV | Op::LtDoubleVVV | Op::LeDoubleVVV
        | Op::GtDoubleVVV | Op::GeDoubleVVV => {
            let a = want_double(&frame[z.v2 as usize])?;
            let b = want_double(&frame[z.v3 as usize])?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqDoubleVVC | Op::NeDoubleVVC | Op::LtDoubleVVC | Op::LeDoubleVVC
        | Op::GtDoubleVVC | Op::GeDoubleVVC => {
            let a = want_double(&frame[z.v2 as usize])?;
            let b = want_double(&const_of(z)?.val)?;
            assign(frame, z, Val::Bool(compare(z.op, &a, &b)));
            Ctrl::Next
        }
        Op::EqStrVVV | Op::NeStrVVV | Op::LtStrVVV | Op::LeStrVVV | Op::GtStrVVV
        | Op::GeStrVVV => {
            let a = want_str(&frame[z.v2 as usize])?.clone();
            let b = want_str(&frame[z.v3 as usize])?.clone();
            assign(frame, z, Val::Bool(compare(z.op, a.as_ref(), b.as_ref())));
            Ctrl::Next
        }
        Op::EqStrVVC | Op::NeStrVVC | Op::LtStrVVC | Op::LeStrVVC | Op::GtStrVVC
        | Op::GeStrVVC => {
            let a = want_str(&frame[z.v2 as usize])?.clone();
            let b = want_str(&const_of(z)?.val)?.clone();
            assign(frame, z, Val::Bool(compare(z.op, a.as_ref(), b.as_ref())));
            Ctrl::Next
        }
        Op::EqAddrVVV | Op::NeAddrVVV => {
            let a = want_addr(&frame[z.v2 as usize])?;
            let b = want_addr(&frame[z.v3 as usize])?;
            let eq = a == b;
            assign(
                frame,
                z,
                Val::Bool(if z.op == Op::EqAddrVVV { eq } else { !eq }),
            );
            Ctrl::Next
        }

        // ---- vectorized arithmetic --------------------------------------
        Op::AddVecVVV | Op::SubVecVVV | Op::MulVecVVV | Op::DivVecVVV => {
            let a = want_vector(&frame[z.v2 as usize])?.clone();
            let b = want_vector(&frame[z.v3 as usize])?.clone();
            let v = vec_arith(z.op, &a.borrow(), &b.borrow())?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::NegVecVV => {
            let a = want_vector(&frame[z.v2 as usize])?.clone();
            let mut out = Vec::with_capacity(a.borrow().len());
            for e in a.borrow().iter() {
                out.push(match e {
                    Val::Int(n) => Val::Int(n.wrapping_neg()),
                    Val::Double(x) => Val::Double(-x),
                    _ => return Err(type_clash()),
                });
            }
            assign(frame, z, Val::Vector(Rc::new(RefCell::new(out))));
            Ctrl::Next
        }

        // ---- coercions --------------------------------------------------
        Op::CoerceIUVV | Op::CoerceIDVV | Op::CoerceUIVV | Op::CoerceUDVV | Op::CoerceDIVV
        | Op::CoerceDUVV => {
            let v = coerce_scalar(z.op, &frame[z.v2 as usize])?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::CoerceVecIUVV | Op::CoerceVecIDVV | Op::CoerceVecUIVV | Op::CoerceVecUDVV
        | Op::CoerceVecDIVV | Op::CoerceVecDUVV => {
            let scalar_op = match z.op {
                Op::CoerceVecIUVV => Op::CoerceIUVV,
                Op::CoerceVecIDVV => Op::CoerceIDVV,
                Op::CoerceVecUIVV => Op::CoerceUIVV,
                Op::CoerceVecUDVV => Op::CoerceUDVV,
                Op::CoerceVecDIVV => Op::CoerceDIVV,
                _ => Op::CoerceDUVV,
            };
            let src = want_vector(&frame[z.v2 as usize])?.clone();
            let mut out = Vec::with_capacity(src.borrow().len());
            for e in src.borrow().iter() {
                out.push(coerce_scalar(scalar_op, e)?);
            }
            assign(frame, z, Val::Vector(Rc::new(RefCell::new(out))));
            Ctrl::Next
        }

        // ---- aggregate reads --------------------------------------------
        Op::TableIndex1VVV => {
            let key = table_key(std::slice::from_ref(&frame[z.v3 as usize]))?;
            let v = table_lookup(&frame[z.v2 as usize], &key)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::TableIndex1VVC => {
            let key = table_key(std::slice::from_ref(&const_of(z)?.val))?;
            let v = table_lookup(&frame[z.v2 as usize], &key)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::TableIndexVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let key = table_key(&vals)?;
            let v = table_lookup(&frame[z.v2 as usize], &key)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::IndexVecVVV | Op::IndexVecVVi => {
            let idx = if z.op == Op::IndexVecVVV {
                want_count(&frame[z.v3 as usize])? as usize
            } else {
                z.v3 as usize
            };
            let vec = want_vector(&frame[z.v2 as usize])?.clone();
            let v = vec
                .borrow()
                .get(idx)
                .cloned()
                .ok_or_else(|| RuntimeError::new("index out of range"))?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::IndexVecSliceVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let (start, end) = slice_bounds(&vals)?;
            let vec = want_vector(&frame[z.v2 as usize])?.clone();
            let src = vec.borrow();
            let end = end.min(src.len());
            let start = start.min(end);
            let out: Vec<Val> = src[start..end].to_vec();
            drop(src);
            assign(frame, z, Val::Vector(Rc::new(RefCell::new(out))));
            Ctrl::Next
        }
        Op::IndexStringVVV | Op::IndexStringVVi => {
            let idx = if z.op == Op::IndexStringVVV {
                want_count(&frame[z.v3 as usize])? as usize
            } else {
                z.v3 as usize
            };
            let s = want_str(&frame[z.v2 as usize])?.clone();
            let b = *s
                .as_bytes()
                .get(idx)
                .ok_or_else(|| RuntimeError::new("index out of range"))?;
            assign(frame, z, Val::Str(Rc::new((b as char).to_string())));
            Ctrl::Next
        }
        Op::IndexStringSliceVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let (start, end) = slice_bounds(&vals)?;
            let s = want_str(&frame[z.v2 as usize])?.clone();
            let bytes = s.as_bytes();
            let end = end.min(bytes.len());
            let start = start.min(end);
            let out = String::from_utf8_lossy(&bytes[start..end]).into_owned();
            assign(frame, z, Val::Str(Rc::new(out)));
            Ctrl::Next
        }
        Op::FieldVVi => {
            let rec = want_record(&frame[z.v2 as usize])?.clone();
            let v = rec
                .borrow()
                .get(z.v3 as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::new("no such field"))?;
            if v.is_nil() {
                return Err(RuntimeError::new("field value missing"));
            }
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::HasFieldVVi => {
            let rec = want_record(&frame[z.v2 as usize])?.clone();
            let has = rec
                .borrow()
                .get(z.v3 as usize)
                .is_some_and(|f| !f.is_nil());
            assign(frame, z, Val::Bool(has));
            Ctrl::Next
        }
        Op::SizeVV => {
            let n = match &frame[z.v2 as usize] {
                Val::Str(s) => s.len(),
                Val::Table(t) => t.borrow().len(),
                Val::Vector(v) => v.borrow().len(),
                Val::List(l) => l.len(),
                _ => return Err(type_clash()),
            };
            assign(frame, z, Val::Count(n as u64));
            Ctrl::Next
        }

        // ---- aggregate writes -------------------------------------------
        Op::TableElemAssignVVA | Op::TableElemAssignVCA => {
            let val = if z.op == Op::TableElemAssignVVA {
                frame[z.v2 as usize].clone()
            } else {
                const_of(z)?.val.clone()
            };
            let vals = aux_vals(frame, aux_of(z)?);
            let key = table_key(&vals)?;
            let tbl = want_table(&frame[z.v1 as usize])?.clone();
            tbl.borrow_mut().insert(key, val);
            Ctrl::Next
        }
        Op::VectorElemAssignVVV | Op::VectorElemAssignVVC => {
            let idx = want_count(&frame[z.v2 as usize])? as usize;
            let val = if z.op == Op::VectorElemAssignVVV {
                frame[z.v3 as usize].clone()
            } else {
                const_of(z)?.val.clone()
            };
            vector_elem_store(&frame[z.v1 as usize], idx, val)?;
            Ctrl::Next
        }
        Op::VectorElemAssignVVi => {
            let val = frame[z.v2 as usize].clone();
            vector_elem_store(&frame[z.v1 as usize], z.v3 as usize, val)?;
            Ctrl::Next
        }
        Op::VectorSliceAssignVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let (start, end) = slice_bounds(&vals)?;
            let src = want_vector(&frame[z.v2 as usize])?.clone();
            let dst = want_vector(&frame[z.v1 as usize])?.clone();
            let replacement: Vec<Val> = src.borrow().clone();
            let mut dst = dst.borrow_mut();
            let end = end.min(dst.len());
            let start = start.min(end);
            dst.splice(start..end, replacement);
            Ctrl::Next
        }
        Op::FieldAssignVVi | Op::FieldAssignVCi => {
            let (field, val) = if z.op == Op::FieldAssignVVi {
                (z.v3 as usize, frame[z.v2 as usize].clone())
            } else {
                (z.v2 as usize, const_of(z)?.val.clone())
            };
            let rec = want_record(&frame[z.v1 as usize])?.clone();
            let mut rec = rec.borrow_mut();
            if field >= rec.len() {
                return Err(RuntimeError::new("no such field"));
            }
            rec[field] = val;
            Ctrl::Next
        }

        // ---- membership -------------------------------------------------
        Op::ValIsInTableVVV => {
            let key = table_key(std::slice::from_ref(&frame[z.v2 as usize]))?;
            let tbl = want_table(&frame[z.v3 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::ConstIsInTableVCV => {
            let key = table_key(std::slice::from_ref(&const_of(z)?.val))?;
            let tbl = want_table(&frame[z.v2 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::Val2IsInTableVVVV => {
            let key = table_key(&[
                frame[z.v2 as usize].clone(),
                frame[z.v3 as usize].clone(),
            ])?;
            let tbl = want_table(&frame[z.v4 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::Val2IsInTableVVVC => {
            let key = table_key(&[
                frame[z.v2 as usize].clone(),
                const_of(z)?.val.clone(),
            ])?;
            let tbl = want_table(&frame[z.v3 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::Val2IsInTableVVCV => {
            let key = table_key(&[
                const_of(z)?.val.clone(),
                frame[z.v2 as usize].clone(),
            ])?;
            let tbl = want_table(&frame[z.v3 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::ListIsInTableVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let key = table_key(&vals)?;
            let tbl = want_table(&frame[z.v2 as usize])?;
            let found = tbl.borrow().contains(&key);
            assign(frame, z, Val::Bool(found));
            Ctrl::Next
        }
        Op::IndexIsInVectorVVA => {
            let vals = aux_vals(frame, aux_of(z)?);
            let idx = want_count(vals.first().ok_or_else(type_clash)?)? as usize;
            let vec = want_vector(&frame[z.v2 as usize])?;
            let present = vec.borrow().get(idx).is_some_and(|e| !e.is_nil());
            assign(frame, z, Val::Bool(present));
            Ctrl::Next
        }
        Op::StrInStrVVV | Op::StrInStrVVC | Op::StrInStrVCV => {
            let (needle, hay) = match z.op {
                Op::StrInStrVVV => (
                    want_str(&frame[z.v2 as usize])?.clone(),
                    want_str(&frame[z.v3 as usize])?.clone(),
                ),
                Op::StrInStrVVC => (
                    want_str(&frame[z.v2 as usize])?.clone(),
                    want_str(&const_of(z)?.val)?.clone(),
                ),
                _ => (
                    want_str(&const_of(z)?.val)?.clone(),
                    want_str(&frame[z.v2 as usize])?.clone(),
                ),
            };
            assign(frame, z, Val::Bool(hay.contains(needle.as_str())));
            Ctrl::Next
        }
        Op::PatInStrVVV | Op::PatInStrVVC | Op::PatInStrVCV => {
            let (pat, hay) = match z.op {
                Op::PatInStrVVV => (
                    want_pattern(&frame[z.v2 as usize])?.clone(),
                    want_str(&frame[z.v3 as usize])?.clone(),
                ),
                Op::PatInStrVVC => (
                    want_pattern(&frame[z.v2 as usize])?.clone(),
                    want_str(&const_of(z)?.val)?.clone(),
                ),
                _ => (
                    want_pattern(&const_of(z)?.val)?.clone(),
                    want_str(&frame[z.v2 as usize])?.clone(),
                ),
            };
            assign(frame, z, Val::Bool(pat.is_match(&hay)));
            Ctrl::Next
        }
        Op::AddrInSubnetVVV | Op::AddrInSubnetVVC | Op::AddrInSubnetVCV => {
            let (addr, net) = match z.op {
                Op::AddrInSubnetVVV => (
                    want_addr(&frame[z.v2 as usize])?,
                    *want_subnet(&frame[z.v3 as usize])?,
                ),
                Op::AddrInSubnetVVC => (
                    want_addr(&frame[z.v2 as usize])?,
                    *want_subnet(&const_of(z)?.val)?,
                ),
                _ => (
                    want_addr(&const_of(z)?.val)?,
                    *want_subnet(&frame[z.v2 as usize])?,
                ),
            };
            assign(frame, z, Val::Bool(net.contains(&addr)));
            Ctrl::Next
        }

        // ---- constructors and aggregate init ----------------------------
        Op::ConstructTableVA => {
            let v = construct_table(z, frame, false)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::ConstructSetVA => {
            let v = construct_table(z, frame, true)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::ConstructRecordVA => {
            let n_fields = record_field_count(z)?;
            let mut fields = aux_vals(frame, aux_of(z)?);
            fields.resize(n_fields.max(fields.len()), Val::Nil);
            assign(frame, z, Val::Record(Rc::new(RefCell::new(fields))));
            Ctrl::Next
        }
        Op::ConstructVectorVA => {
            let items = aux_vals(frame, aux_of(z)?);
            assign(frame, z, Val::Vector(Rc::new(RefCell::new(items))));
            Ctrl::Next
        }
        Op::InitRecordV => {
            let n_fields = record_field_count(z)?;
            assign(
                frame,
                z,
                Val::Record(Rc::new(RefCell::new(vec![Val::Nil; n_fields]))),
            );
            Ctrl::Next
        }
        Op::InitVectorV => {
            assign(frame, z, Val::Vector(Rc::new(RefCell::new(Vec::new()))));
            Ctrl::Next
        }
        Op::InitTableV => {
            assign(frame, z, Val::Table(Rc::new(RefCell::new(TableVal::new()))));
            Ctrl::Next
        }

        // ---- iteration --------------------------------------------------
        Op::InitTableLoopVVA => {
            let tbl = want_table(&frame[z.v2 as usize])?.clone();
            let entries: Vec<(Vec<Val>, Val)> = tbl
                .borrow()
                .entries
                .iter()
                .map(|(k, v)| (k.to_vals(), v.clone()))
                .collect();
            frame[z.v1 as usize] =
                Val::Iter(Rc::new(RefCell::new(IterVal::Table { entries, pos: 0 })));
            Ctrl::Next
        }
        Op::InitVectorLoopVV => {
            let vec = want_vector(&frame[z.v2 as usize])?.clone();
            frame[z.v1 as usize] =
                Val::Iter(Rc::new(RefCell::new(IterVal::Vector { vec, pos: 0 })));
            Ctrl::Next
        }
        Op::InitStringLoopVV => {
            let s = want_str(&frame[z.v2 as usize])?.clone();
            frame[z.v1 as usize] = Val::Iter(Rc::new(RefCell::new(IterVal::Str { s, pos: 0 })));
            Ctrl::Next
        }
        Op::NextTableIterVVA | Op::NextTableIterValVarVVVA => {
            let val_var = z.op == Op::NextTableIterValVarVVVA;
            let info_slot = if val_var { z.v2 } else { z.v1 } as usize;
            let exit_pc = if val_var { z.v3 } else { z.v2 } as usize;

            let it = want_iter(&frame[info_slot])?.clone();
            let next = it.borrow_mut().next_table();
            match next {
                Some((keys, val)) => {
                    let loop_vars = aux_of(z)?
                        .iter
                        .as_ref()
                        .ok_or_else(|| RuntimeError::new("loop instruction without iteration info"))?
                        .loop_vars
                        .clone();
                    if keys.len() != loop_vars.len() {
                        return Err(RuntimeError::new("loop variable arity mismatch"));
                    }
                    for (slot, key) in loop_vars.iter().zip(keys) {
                        frame[*slot as usize] = key;
                    }
                    if val_var {
                        assign(frame, z, val);
                    }
                    Ctrl::Next
                }
                None => Ctrl::Jump(exit_pc),
            }
        }
        Op::NextVectorIterVVV => {
            let it = want_iter(&frame[z.v2 as usize])?.clone();
            let next = it.borrow_mut().next_vector();
            match next {
                Some(idx) => {
                    assign(frame, z, Val::Count(idx));
                    Ctrl::Next
                }
                None => Ctrl::Jump(z.v3 as usize),
            }
        }
        Op::NextStringIterVVV => {
            let it = want_iter(&frame[z.v2 as usize])?.clone();
            let next = it.borrow_mut().next_str();
            match next {
                Some(ch) => {
                    assign(frame, z, ch);
                    Ctrl::Next
                }
                None => Ctrl::Jump(z.v3 as usize),
            }
        }
        Op::EndLoopV => {
            release(&mut frame[z.v1 as usize]);
            Ctrl::Next
        }

        // ---- calls ------------------------------------------------------
        Op::Call0X => {
            call_direct(z, env, &[])?;
            Ctrl::Next
        }
        Op::AssignCall0V => {
            let v = call_direct(z, env, &[])?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::Call1V => {
            let arg = frame[z.v1 as usize].clone();
            call_direct(z, env, &[arg])?;
            Ctrl::Next
        }
        Op::Call1C => {
            let arg = const_of(z)?.val.clone();
            call_direct(z, env, &[arg])?;
            Ctrl::Next
        }
        Op::AssignCall1VV => {
            let arg = frame[z.v2 as usize].clone();
            let v = call_direct(z, env, &[arg])?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::AssignCall1VC => {
            let arg = const_of(z)?.val.clone();
            let v = call_direct(z, env, &[arg])?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::Call2A | Op::Call3A | Op::Call4A | Op::Call5A | Op::CallNA => {
            let args = aux_vals(frame, aux_of(z)?);
            call_direct(z, env, &args)?;
            Ctrl::Next
        }
        Op::AssignCall2VA | Op::AssignCall3VA | Op::AssignCall4VA | Op::AssignCall5VA
        | Op::AssignCallNVA => {
            let args = aux_vals(frame, aux_of(z)?);
            let v = call_direct(z, env, &args)?;
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::IndCallNVA => {
            let func = want_func(&frame[z.v1 as usize])?.clone();
            let args = aux_vals(frame, aux_of(z)?);
            env.runtime.call_value(&func, &args)?;
            Ctrl::Next
        }
        Op::AssignIndCallNVVA => {
            let func = want_func(&frame[z.v2 as usize])?.clone();
            let args = aux_vals(frame, aux_of(z)?);
            let v = env.runtime.call_value(&func, &args)?;
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- built-in intrinsics ----------------------------------------
        Op::ToLowerVV => {
            let s = want_str(&frame[z.v2 as usize])?.clone();
            assign(frame, z, Val::Str(Rc::new(s.to_ascii_lowercase())));
            Ctrl::Next
        }
        Op::SubBytesVVVV => {
            let s = want_str(&frame[z.v2 as usize])?.clone();
            let start = want_count(&frame[z.v3 as usize])?;
            let n = want_int(&frame[z.v4 as usize])?;
            assign(frame, z, sub_bytes(&s, start, n));
            Ctrl::Next
        }
        Op::StrStrVVV | Op::StrStrVVC | Op::StrStrVCV => {
            let (big, little) = match z.op {
                Op::StrStrVVV => (
                    want_str(&frame[z.v2 as usize])?.clone(),
                    want_str(&frame[z.v3 as usize])?.clone(),
                ),
                Op::StrStrVVC => (
                    want_str(&frame[z.v2 as usize])?.clone(),
                    want_str(&const_of(z)?.val)?.clone(),
                ),
                _ => (
                    want_str(&const_of(z)?.val)?.clone(),
                    want_str(&frame[z.v2 as usize])?.clone(),
                ),
            };
            let pos = big
                .find(little.as_str())
                .map(|p| p as u64 + 1)
                .unwrap_or(0);
            assign(frame, z, Val::Count(pos));
            Ctrl::Next
        }
        Op::LogWriteVVV => {
            let ok = env
                .runtime
                .log_write(&frame[z.v2 as usize], &frame[z.v3 as usize])?;
            assign(frame, z, Val::Bool(ok));
            Ctrl::Next
        }
        Op::LogWriteVV => {
            env.runtime
                .log_write(&frame[z.v1 as usize], &frame[z.v2 as usize])?;
            Ctrl::Next
        }
        Op::LogFlushV => {
            let ok = env.runtime.flush_logs()?;
            assign(frame, z, Val::Bool(ok));
            Ctrl::Next
        }
        Op::LogFlushX => {
            env.runtime.flush_logs()?;
            Ctrl::Next
        }
        Op::PortProtoVV => {
            let port = want_count(&frame[z.v2 as usize])?;
            assign(frame, z, Val::Int((port >> PORT_PROTO_SHIFT) as i64));
            Ctrl::Next
        }
        Op::ReadingLiveTrafficV => {
            let v = Val::Bool(env.runtime.reading_live_traffic());
            assign(frame, z, v);
            Ctrl::Next
        }
        Op::ReadingTracesV => {
            let v = Val::Bool(env.runtime.reading_traces());
            assign(frame, z, v);
            Ctrl::Next
        }

        // ---- events -----------------------------------------------------
        Op::EventA => {
            let handler = z
                .event
                .as_ref()
                .ok_or_else(|| RuntimeError::new("event instruction without a handler"))?
                .clone();
            let args = aux_vals(frame, aux_of(z)?);
            env.runtime.raise_event(&handler, args)?;
            Ctrl::Next
        }

        // Generic opcodes are resolved through the assignment-flavor table
        // during lowering and must never reach dispatch.
        _ => {
            return Err(RuntimeError::new(format!(
                "unexecutable opcode {}",
                z.op.name()
            )))
        }
    };

    Ok(ctrl)
}

// ---- slot and operand helpers ------------------------------------------

/// Stores into the instruction's destination slot. The new value is fully
/// latched before the old one drops, so reassigning a slot from itself is
/// safe.
fn assign(frame: &mut [Val], z: &Instr, v: Val) {
    frame[z.v1 as usize] = v;
}

fn const_of(z: &Instr) -> Result<&ConstVal, RuntimeError> {
    z.c.as_ref()
        .ok_or_else(|| RuntimeError::new("instruction is missing its constant"))
}

fn aux_of(z: &Instr) -> Result<&InstrAux, RuntimeError> {
    z.aux
        .as_deref()
        .ok_or_else(|| RuntimeError::new("instruction is missing its aux block"))
}

fn deferred_of(z: &Instr) -> Result<Rc<kestrel_ast::Expr>, RuntimeError> {
    z.deferred_expr
        .clone()
        .ok_or_else(|| RuntimeError::new("trigger instruction without a predicate"))
}

fn aux_vals(frame: &[Val], aux: &InstrAux) -> Vec<Val> {
    aux.items
        .iter()
        .map(|item| match &item.constant {
            Some(c) => c.val.clone(),
            None => frame[item.slot as usize].clone(),
        })
        .collect()
}

fn type_clash() -> RuntimeError {
    RuntimeError::new("run-time type clash")
}

fn want_int(v: &Val) -> Result<i64, RuntimeError> {
    v.as_int().ok_or_else(type_clash)
}

fn want_count(v: &Val) -> Result<u64, RuntimeError> {
    v.as_count().ok_or_else(type_clash)
}

fn want_double(v: &Val) -> Result<f64, RuntimeError> {
    v.as_double().ok_or_else(type_clash)
}

fn want_str(v: &Val) -> Result<&Rc<String>, RuntimeError> {
    v.as_str().ok_or_else(type_clash)
}

fn want_pattern(v: &Val) -> Result<&Rc<kestrel_value::PatternVal>, RuntimeError> {
    v.as_pattern().ok_or_else(type_clash)
}

fn want_addr(v: &Val) -> Result<std::net::IpAddr, RuntimeError> {
    v.as_addr().ok_or_else(type_clash)
}

fn want_subnet(v: &Val) -> Result<&kestrel_value::Subnet, RuntimeError> {
    v.as_subnet().ok_or_else(type_clash)
}

fn want_record(v: &Val) -> Result<&Rc<RefCell<Vec<Val>>>, RuntimeError> {
    v.as_record().ok_or_else(type_clash)
}

fn want_table(v: &Val) -> Result<&Rc<RefCell<TableVal>>, RuntimeError> {
    v.as_table().ok_or_else(type_clash)
}

fn want_vector(v: &Val) -> Result<&Rc<RefCell<Vec<Val>>>, RuntimeError> {
    v.as_vector().ok_or_else(type_clash)
}

fn want_iter(v: &Val) -> Result<&Rc<RefCell<IterVal>>, RuntimeError> {
    v.as_iter().ok_or_else(type_clash)
}

fn want_func(v: &Val) -> Result<&Rc<kestrel_value::FuncHandle>, RuntimeError> {
    v.as_func().ok_or_else(type_clash)
}

// ---- arithmetic helpers -------------------------------------------------

fn int_arith(op: Op, a: i64, b: i64) -> Result<i64, RuntimeError> {
    Ok(match op {
        Op::AddIntVVV | Op::AddIntVVC => a.wrapping_add(b),
        Op::SubIntVVV | Op::SubIntVVC | Op::SubIntVCV => a.wrapping_sub(b),
        Op::MulIntVVV | Op::MulIntVVC => a.wrapping_mul(b),
        Op::DivIntVVV | Op::DivIntVVC | Op::DivIntVCV => {
            if b == 0 {
                return Err(RuntimeError::new("division by zero"));
            }
            a.wrapping_div(b)
        }
        _ => {
            if b == 0 {
                return Err(RuntimeError::new("modulo by zero"));
            }
            a.wrapping_rem(b)
        }
    })
}

fn count_arith(op: Op, a: u64, b: u64) -> Result<u64, RuntimeError> {
    Ok(match op {
        Op::AddCountVVV | Op::AddCountVVC => a.wrapping_add(b),
        Op::SubCountVVV | Op::SubCountVVC | Op::SubCountVCV => a.wrapping_sub(b),
        Op::MulCountVVV | Op::MulCountVVC => a.wrapping_mul(b),
        Op::DivCountVVV | Op::DivCountVVC | Op::DivCountVCV => {
            if b == 0 {
                return Err(RuntimeError::new("division by zero"));
            }
            a / b
        }
        _ => {
            if b == 0 {
                return Err(RuntimeError::new("modulo by zero"));
            }
            a % b
        }
    })
}

fn double_arith(op: Op, a: f64, b: f64) -> f64 {
    match op {
        Op::AddDoubleVVV | Op::AddDoubleVVC => a + b,
        Op::SubDoubleVVV | Op::SubDoubleVVC | Op::SubDoubleVCV => a - b,
        Op::MulDoubleVVV | Op::MulDoubleVVC => a * b,
        _ => a / b,
    }
}

fn compare<T: PartialOrd + ?Sized>(op: Op, a: &T, b: &T) -> bool {
    let name = op.name();
    if name.starts_with("eq_") {
        a == b
    } else if name.starts_with("ne_") {
        a != b
    } else if name.starts_with("lt_") {
        a < b
    } else if name.starts_with("le_") {
        a <= b
    } else if name.starts_with("gt_") {
        a > b
    } else {
        a >= b
    }
}

fn concat_strs(a: &Rc<String>, b: &Rc<String>) -> Val {
    let mut s = String::with_capacity(a.len() + b.len());
    s.push_str(a);
    s.push_str(b);
    Val::Str(Rc::new(s))
}

fn coerce_scalar(op: Op, v: &Val) -> Result<Val, RuntimeError> {
    Ok(match op {
        Op::CoerceIUVV => Val::Int(want_count(v)? as i64),
        Op::CoerceIDVV => Val::Int(want_double(v)? as i64),
        Op::CoerceUIVV => Val::Count(want_int(v)? as u64),
        Op::CoerceUDVV => Val::Count(want_double(v)? as u64),
        Op::CoerceDIVV => Val::Double(want_int(v)? as f64),
        _ => Val::Double(want_count(v)? as f64),
    })
}

fn vec_arith(op: Op, a: &[Val], b: &[Val]) -> Result<Val, RuntimeError> {
    if a.len() != b.len() {
        return Err(RuntimeError::new("vector operands of different lengths"));
    }
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.iter().zip(b) {
        let v = match (x, y) {
            (Val::Int(x), Val::Int(y)) => Val::Int(match op {
                Op::AddVecVVV => x.wrapping_add(*y),
                Op::SubVecVVV => x.wrapping_sub(*y),
                Op::MulVecVVV => x.wrapping_mul(*y),
                _ => {
                    if *y == 0 {
                        return Err(RuntimeError::new("division by zero"));
                    }
                    x.wrapping_div(*y)
                }
            }),
            (Val::Count(x), Val::Count(y)) => Val::Count(match op {
                Op::AddVecVVV => x.wrapping_add(*y),
                Op::SubVecVVV => x.wrapping_sub(*y),
                Op::MulVecVVV => x.wrapping_mul(*y),
                _ => {
                    if *y == 0 {
                        return Err(RuntimeError::new("division by zero"));
                    }
                    x / y
                }
            }),
            (Val::Double(x), Val::Double(y)) => Val::Double(match op {
                Op::AddVecVVV => x + y,
                Op::SubVecVVV => x - y,
                Op::MulVecVVV => x * y,
                _ => x / y,
            }),
            _ => return Err(type_clash()),
        };
        out.push(v);
    }
    Ok(Val::Vector(Rc::new(RefCell::new(out))))
}

// ---- aggregate helpers --------------------------------------------------

fn table_key(vals: &[Val]) -> Result<TableKey, RuntimeError> {
    TableKey::from_vals(vals).ok_or_else(|| RuntimeError::new("bad table index type"))
}

fn table_lookup(table: &Val, key: &TableKey) -> Result<Val, RuntimeError> {
    let tbl = want_table(table)?;
    tbl.borrow()
        .get(key)
        .cloned()
        .ok_or_else(|| RuntimeError::new("no such index"))
}

fn switch_str_key(v: &Val) -> Result<String, RuntimeError> {
    match v {
        Val::Str(s) => Ok(s.as_ref().clone()),
        Val::Addr(a) => Ok(a.to_string()),
        Val::Subnet(s) => Ok(s.to_string()),
        _ => Err(RuntimeError::new("bad switch key type")),
    }
}

fn slice_bounds(vals: &[Val]) -> Result<(usize, usize), RuntimeError> {
    if vals.len() != 2 {
        return Err(RuntimeError::new("slice takes a start and an end index"));
    }
    Ok((
        want_count(&vals[0])? as usize,
        want_count(&vals[1])? as usize,
    ))
}

/// Writes a vector element, growing the vector with holes as needed.
fn vector_elem_store(vec: &Val, idx: usize, val: Val) -> Result<(), RuntimeError> {
    let vec = want_vector(vec)?;
    let mut vec = vec.borrow_mut();
    if idx >= vec.len() {
        vec.resize(idx + 1, Val::Nil);
    }
    vec[idx] = val;
    Ok(())
}

fn type_of(z: &Instr) -> Result<&Type, RuntimeError> {
    z.t.as_deref()
        .ok_or_else(|| RuntimeError::new("constructor instruction without a type"))
}

fn record_field_count(z: &Instr) -> Result<usize, RuntimeError> {
    match type_of(z)? {
        Type::Record(fields) => Ok(fields.len()),
        _ => Err(type_clash()),
    }
}

fn construct_table(z: &Instr, frame: &[Val], is_set: bool) -> Result<Val, RuntimeError> {
    let width = match type_of(z)? {
        Type::Table { index, .. } => index.len().max(1),
        _ => return Err(type_clash()),
    };

    let items = aux_vals(frame, aux_of(z)?);
    let stride = if is_set { width } else { width + 1 };
    if items.len() % stride != 0 {
        return Err(RuntimeError::new("malformed constructor element list"));
    }

    let mut tbl = TableVal::new();
    for chunk in items.chunks(stride) {
        let (key_vals, val) = if is_set {
            (chunk, Val::Nil)
        } else {
            (&chunk[..width], chunk[width].clone())
        };
        tbl.insert(table_key(key_vals)?, val);
    }
    Ok(Val::Table(Rc::new(RefCell::new(tbl))))
}

fn sub_bytes(s: &Rc<String>, start: u64, n: i64) -> Val {
    // Script-level positions are 1-based.
    let start = start.saturating_sub(1) as usize;
    let bytes = s.as_bytes();
    let start = start.min(bytes.len());
    let end = if n < 0 {
        bytes.len()
    } else {
        start.saturating_add(n as usize).min(bytes.len())
    };
    Val::Str(Rc::new(
        String::from_utf8_lossy(&bytes[start..end]).into_owned(),
    ))
}

fn call_direct(z: &Instr, env: &mut ExecEnv<'_>, args: &[Val]) -> Result<Val, RuntimeError> {
    let callee = z
        .callee
        .as_ref()
        .ok_or_else(|| RuntimeError::new("call instruction without a callee"))?;
    env.runtime.call(callee.name(), args)
}

fn sync_globals(
    body: &CompiledBody,
    frame: &[Val],
    env: &mut ExecEnv<'_>,
    global_state: &mut [GlobalState],
) {
    for (g, state) in global_state.iter_mut().enumerate() {
        if *state == GlobalState::Dirty {
            let info = &body.globals[g];
            env.globals
                .set(info.id.name(), frame[info.slot as usize].clone());
            *state = GlobalState::Clean;
        }
    }
}
