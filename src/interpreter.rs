//! The tree-walking evaluator for reduced function bodies.
//!
//! This is the execution model the compiled form replaces: statements are
//! walked directly and variables live in a by-name frame. It stays around
//! as the semantic reference; the test suite checks compiled bodies against
//! it input-for-input.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kestrel_ast::{
    normalized_tag, AssignLhs, BinOp, CallExpr, ConstructElem, ConstructKind, Expr, Ident,
    InIndex, Operand, Stmt, SwitchCase, TypeRef, TypeTag, UnOp,
};
use kestrel_value::{IterVal, TableKey, TableVal, Val};
use kestrel_vm::{Flow, GlobalStore, Runtime, RuntimeError};

/// The interpreter's heap-allocated variable frame.
pub type Env = HashMap<Ident, Val>;

enum Signal {
    Normal,
    Return(Option<Val>),
    Break,
    Next,
    FallThrough,
}

pub struct Interpreter<'r> {
    pub runtime: &'r mut dyn Runtime,
    pub globals: &'r mut GlobalStore,
}

fn err(msg: &str) -> RuntimeError {
    RuntimeError {
        message: msg.to_string(),
    }
}

impl<'r> Interpreter<'r> {
    pub fn new(runtime: &'r mut dyn Runtime, globals: &'r mut GlobalStore) -> Interpreter<'r> {
        Interpreter { runtime, globals }
    }

    /// Runs a body to completion against a pre-populated frame.
    pub fn run(&mut self, body: &Stmt, env: &mut Env) -> Result<(Option<Val>, Flow), RuntimeError> {
        match self.exec(body, env)? {
            Signal::Return(v) => Ok((v, Flow::Return)),
            Signal::Break => Ok((None, Flow::HookBreak)),
            _ => Ok((None, Flow::Return)),
        }
    }

    fn exec(&mut self, s: &Stmt, env: &mut Env) -> Result<Signal, RuntimeError> {
        match s {
            Stmt::Null => Ok(Signal::Normal),
            Stmt::List(stmts) => {
                for st in stmts {
                    match self.exec(st, env)? {
                        Signal::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(Signal::Normal)
            }
            Stmt::Expr(e) => {
                self.eval(e, env)?;
                Ok(Signal::Normal)
            }
            Stmt::Assign { lhs, rhs } => {
                let v = self.eval(rhs, env)?;
                self.store(lhs, v, env)?;
                Ok(Signal::Normal)
            }
            Stmt::Init(id) => {
                let v = init_aggregate(id.ty())?;
                self.write_name(id, v, env);
                Ok(Signal::Normal)
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if self.eval(cond, env)?.truthy() {
                    match then_branch {
                        Some(b) => self.exec(b, env),
                        None => Ok(Signal::Normal),
                    }
                } else {
                    match else_branch {
                        Some(b) => self.exec(b, env),
                        None => Ok(Signal::Normal),
                    }
                }
            }
            Stmt::While {
                cond_prologue,
                cond,
                body,
            } => {
                loop {
                    if let Some(p) = cond_prologue {
                        match self.exec(p, env)? {
                            Signal::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    if !self.eval(cond, env)?.truthy() {
                        break;
                    }
                    match self.exec(body, env)? {
                        Signal::Normal | Signal::Next => {}
                        Signal::Break => break,
                        other => return Ok(other),
                    }
                }
                Ok(Signal::Normal)
            }
            Stmt::Loop { body } => {
                loop {
                    match self.exec(body, env)? {
                        Signal::Normal | Signal::Next => {}
                        Signal::Break => break,
                        other => return Ok(other),
                    }
                }
                Ok(Signal::Normal)
            }
            Stmt::For {
                loop_vars,
                value_var,
                aggr,
                body,
            } => self.exec_for(loop_vars, value_var.as_ref(), aggr, body, env),
            Stmt::Switch { on, cases, default } => self.exec_switch(on, cases, *default, env),
            Stmt::Return(value) => {
                let v = match value {
                    Some(op) => Some(self.operand(op, env)?),
                    None => None,
                };
                Ok(Signal::Return(v))
            }
            Stmt::CatchReturn { block, ret_var } => {
                match self.exec(block, env)? {
                    Signal::Return(v) => {
                        if let (Some(rv), Some(v)) = (ret_var, v) {
                            self.write_name(rv, v, env);
                        }
                        Ok(Signal::Normal)
                    }
                    other => Ok(other),
                }
            }
            Stmt::Break => Ok(Signal::Break),
            Stmt::Next => Ok(Signal::Next),
            Stmt::FallThrough => Ok(Signal::FallThrough),
            Stmt::When(_) => Err(err("\"when\" requires the trigger subsystem")),
            Stmt::Event { handler, args } => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.operand(a, env)?);
                }
                self.runtime.raise_event(handler, vals)?;
                Ok(Signal::Normal)
            }
        }
    }

    fn exec_for(
        &mut self,
        loop_vars: &[Ident],
        value_var: Option<&Ident>,
        aggr: &Ident,
        body: &Stmt,
        env: &mut Env,
    ) -> Result<Signal, RuntimeError> {
        let aggr_val = self.read_name(aggr, env)?;

        match &aggr_val {
            Val::Table(t) => {
                let entries: Vec<(Vec<Val>, Val)> = t
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| (k.to_vals(), v.clone()))
                    .collect();
                for (keys, val) in entries {
                    for (id, key) in loop_vars.iter().zip(keys) {
                        self.write_name(id, key, env);
                    }
                    if let Some(vv) = value_var {
                        self.write_name(vv, val, env);
                    }
                    match self.exec(body, env)? {
                        Signal::Normal | Signal::Next => {}
                        Signal::Break => break,
                        other => return Ok(other),
                    }
                }
            }
            Val::Vector(vec) => {
                let mut it = IterVal::Vector {
                    vec: vec.clone(),
                    pos: 0,
                };
                while let Some(idx) = it.next_vector() {
                    self.write_name(&loop_vars[0], Val::Count(idx), env);
                    match self.exec(body, env)? {
                        Signal::Normal | Signal::Next => {}
                        Signal::Break => break,
                        other => return Ok(other),
                    }
                }
            }
            Val::Str(s) => {
                let mut it = IterVal::Str {
                    s: s.clone(),
                    pos: 0,
                };
                while let Some(ch) = it.next_str() {
                    self.write_name(&loop_vars[0], ch, env);
                    match self.exec(body, env)? {
                        Signal::Normal | Signal::Next => {}
                        Signal::Break => break,
                        other => return Ok(other),
                    }
                }
            }
            _ => return Err(err("bad \"for\" loop-over value")),
        }

        Ok(Signal::Normal)
    }

    fn exec_switch(
        &mut self,
        on: &Operand,
        cases: &[SwitchCase],
        default: Option<usize>,
        env: &mut Env,
    ) -> Result<Signal, RuntimeError> {
        let key = self.operand(on, env)?;

        let mut matched = None;
        'outer: for (i, case) in cases.iter().enumerate() {
            for v in &case.vals {
                if v.val == key {
                    matched = Some(i);
                    break 'outer;
                }
            }
        }
        let Some(start) = matched.or(default) else {
            return Ok(Signal::Normal);
        };

        for case in &cases[start..] {
            match self.exec(&case.body, env)? {
                Signal::FallThrough => continue,
                Signal::Break | Signal::Normal => break,
                other => return Ok(other),
            }
        }
        Ok(Signal::Normal)
    }

    // ---- expressions ----------------------------------------------------

    fn eval(&mut self, e: &Expr, env: &Env) -> Result<Val, RuntimeError> {
        match e {
            Expr::Name(id) => self.read_name(id, env),
            Expr::Const(c) => Ok(c.val.clone()),
            Expr::Binary { op, lhs, rhs } => {
                let a = self.operand(lhs, env)?;
                let b = self.operand(rhs, env)?;
                binary(*op, &a, &b)
            }
            Expr::Unary { op, operand } => {
                let v = self.operand(operand, env)?;
                match op {
                    UnOp::Not => Ok(Val::Bool(!v.truthy())),
                    UnOp::Neg => match v {
                        Val::Int(n) => Ok(Val::Int(n.wrapping_neg())),
                        Val::Double(x) => Ok(Val::Double(-x)),
                        Val::Vector(src) => {
                            let mut out = Vec::with_capacity(src.borrow().len());
                            for e in src.borrow().iter() {
                                out.push(match e {
                                    Val::Int(n) => Val::Int(n.wrapping_neg()),
                                    Val::Double(x) => Val::Double(-x),
                                    _ => return Err(err("run-time type clash")),
                                });
                            }
                            Ok(Val::Vector(Rc::new(RefCell::new(out))))
                        }
                        _ => Err(err("run-time type clash")),
                    },
                }
            }
            Expr::Coerce { target, operand } => {
                let v = self.operand(operand, env)?;
                coerce(target, &v)
            }
            Expr::Index { aggr, indexes } => {
                let aggr_val = self.read_name(aggr, env)?;
                let mut ix = Vec::with_capacity(indexes.len());
                for i in indexes {
                    ix.push(self.operand(i, env)?);
                }
                index_aggregate(&aggr_val, &ix)
            }
            Expr::Field { record, field } => {
                let rec = self.read_name(record, env)?;
                let rec = rec.as_record().ok_or_else(|| err("run-time type clash"))?;
                let v = rec
                    .borrow()
                    .get(*field)
                    .cloned()
                    .ok_or_else(|| err("no such field"))?;
                if v.is_nil() {
                    return Err(err("field value missing"));
                }
                Ok(v)
            }
            Expr::HasField { record, field } => {
                let rec = self.read_name(record, env)?;
                let rec = rec.as_record().ok_or_else(|| err("run-time type clash"))?;
                let has = rec.borrow().get(*field).is_some_and(|f| !f.is_nil());
                Ok(Val::Bool(has))
            }
            Expr::In { item, aggr } => {
                let aggr_val = self.operand(aggr, env)?;
                let mut items = Vec::new();
                match item {
                    InIndex::One(op) => items.push(self.operand(op, env)?),
                    InIndex::Two(a, b) => {
                        items.push(self.operand(a, env)?);
                        items.push(self.operand(b, env)?);
                    }
                    InIndex::List(ops) => {
                        for op in ops {
                            items.push(self.operand(op, env)?);
                        }
                    }
                }
                in_test(&items, &aggr_val)
            }
            Expr::Size { aggr } => {
                let v = self.operand(aggr, env)?;
                let n = match &v {
                    Val::Str(s) => s.len(),
                    Val::Table(t) => t.borrow().len(),
                    Val::Vector(v) => v.borrow().len(),
                    Val::List(l) => l.len(),
                    _ => return Err(err("run-time type clash")),
                };
                Ok(Val::Count(n as u64))
            }
            Expr::Call(call) => self.eval_call(call, env),
            Expr::Construct { kind, ty, elems } => self.construct(*kind, ty, elems, env),
        }
    }

    fn eval_call(&mut self, call: &CallExpr, env: &Env) -> Result<Val, RuntimeError> {
        let mut args = Vec::with_capacity(call.args.len());
        for a in &call.args {
            args.push(self.operand(a, env)?);
        }

        if call.callee.is_global() {
            // The built-ins the compiler turns into intrinsics evaluate
            // natively here so both execution models agree.
            match call.callee.name() {
                "to_lower" => {
                    let s = args[0].as_str().ok_or_else(|| err("run-time type clash"))?;
                    return Ok(Val::Str(Rc::new(s.to_ascii_lowercase())));
                }
                "sub_bytes" => {
                    let s = args[0].as_str().ok_or_else(|| err("run-time type clash"))?;
                    let start = args[1]
                        .as_count()
                        .ok_or_else(|| err("run-time type clash"))?;
                    let n = args[2].as_int().ok_or_else(|| err("run-time type clash"))?;
                    let start = start.saturating_sub(1) as usize;
                    let bytes = s.as_bytes();
                    let start = start.min(bytes.len());
                    let end = if n < 0 {
                        bytes.len()
                    } else {
                        start.saturating_add(n as usize).min(bytes.len())
                    };
                    return Ok(Val::Str(Rc::new(
                        String::from_utf8_lossy(&bytes[start..end]).into_owned(),
                    )));
                }
                "strstr" => {
                    let big = args[0].as_str().ok_or_else(|| err("run-time type clash"))?;
                    let little = args[1].as_str().ok_or_else(|| err("run-time type clash"))?;
                    let pos = big
                        .find(little.as_str())
                        .map(|p| p as u64 + 1)
                        .unwrap_or(0);
                    return Ok(Val::Count(pos));
                }
                "get_port_transport_proto" => {
                    let p = args[0]
                        .as_count()
                        .ok_or_else(|| err("run-time type clash"))?;
                    return Ok(Val::Int((p >> 16) as i64));
                }
                "Log::write" => {
                    let ok = self.runtime.log_write(&args[0], &args[1])?;
                    return Ok(Val::Bool(ok));
                }
                "Log::flush" => {
                    let ok = self.runtime.flush_logs()?;
                    return Ok(Val::Bool(ok));
                }
                "reading_live_traffic" => {
                    return Ok(Val::Bool(self.runtime.reading_live_traffic()));
                }
                "reading_traces" => {
                    return Ok(Val::Bool(self.runtime.reading_traces()));
                }
                _ => {}
            }
            return self.runtime.call(call.callee.name(), &args);
        }

        let func = self.read_name(&call.callee, env)?;
        let func = func.as_func().ok_or_else(|| err("run-time type clash"))?;
        self.runtime.call_value(func, &args)
    }

    fn construct(
        &mut self,
        kind: ConstructKind,
        ty: &TypeRef,
        elems: &[ConstructElem],
        env: &Env,
    ) -> Result<Val, RuntimeError> {
        match kind {
            ConstructKind::Record => {
                let n_fields = ty.record_fields().map_or(0, <[_]>::len);
                let mut fields = Vec::new();
                for elem in elems {
                    if let ConstructElem::Positional(op) = elem {
                        fields.push(self.operand(op, env)?);
                    }
                }
                fields.resize(n_fields.max(fields.len()), Val::Nil);
                Ok(Val::Record(Rc::new(RefCell::new(fields))))
            }
            ConstructKind::Vector => {
                let mut items = Vec::new();
                for elem in elems {
                    if let ConstructElem::Positional(op) = elem {
                        items.push(self.operand(op, env)?);
                    }
                }
                Ok(Val::Vector(Rc::new(RefCell::new(items))))
            }
            ConstructKind::Table | ConstructKind::Set => {
                let mut tbl = TableVal::new();
                for elem in elems {
                    match elem {
                        ConstructElem::Keyed { indexes, val } => {
                            let mut key_vals = Vec::with_capacity(indexes.len());
                            for ix in indexes {
                                key_vals.push(self.operand(ix, env)?);
                            }
                            let key = TableKey::from_vals(&key_vals)
                                .ok_or_else(|| err("bad table index type"))?;
                            tbl.insert(key, self.operand(val, env)?);
                        }
                        ConstructElem::Positional(op) => {
                            let v = self.operand(op, env)?;
                            let key = TableKey::from_vals(std::slice::from_ref(&v))
                                .ok_or_else(|| err("bad table index type"))?;
                            tbl.insert(key, Val::Nil);
                        }
                    }
                }
                Ok(Val::Table(Rc::new(RefCell::new(tbl))))
            }
        }
    }

    // ---- names and stores -----------------------------------------------

    fn operand(&mut self, op: &Operand, env: &Env) -> Result<Val, RuntimeError> {
        match op {
            Operand::Name(id) => {
                if id.is_global() {
                    Ok(self.globals.get(id.name()))
                } else {
                    env.get(id)
                        .cloned()
                        .ok_or_else(|| err("use of uninitialized variable"))
                }
            }
            Operand::Const(c) => Ok(c.val.clone()),
        }
    }

    fn read_name(&mut self, id: &Ident, env: &Env) -> Result<Val, RuntimeError> {
        if id.is_global() {
            Ok(self.globals.get(id.name()))
        } else {
            env.get(id)
                .cloned()
                .ok_or_else(|| err("use of uninitialized variable"))
        }
    }

    fn store(&mut self, lhs: &AssignLhs, v: Val, env: &mut Env) -> Result<(), RuntimeError> {
        match lhs {
            AssignLhs::Name(id) => {
                self.write_name(id, v, env);
                Ok(())
            }
            AssignLhs::Index { aggr, indexes } => {
                let aggr_val = self.read_name(aggr, env)?;
                let mut ix = Vec::with_capacity(indexes.len());
                for i in indexes {
                    ix.push(self.operand(i, env)?);
                }
                store_indexed(&aggr_val, &ix, v)
            }
            AssignLhs::Field { record, field } => {
                let rec_val = self.read_name(record, env)?;
                let rec = rec_val
                    .as_record()
                    .ok_or_else(|| err("run-time type clash"))?;
                let mut rec = rec.borrow_mut();
                if *field >= rec.len() {
                    return Err(err("no such field"));
                }
                rec[*field] = v;
                Ok(())
            }
        }
    }

    fn write_name(&mut self, id: &Ident, v: Val, env: &mut Env) {
        if id.is_global() {
            self.globals.set(id.name(), v);
        } else {
            env.insert(id.clone(), v);
        }
    }
}

fn init_aggregate(ty: &TypeRef) -> Result<Val, RuntimeError> {
    match ty.tag() {
        TypeTag::Record => {
            let n = ty.record_fields().map_or(0, <[_]>::len);
            Ok(Val::Record(Rc::new(RefCell::new(vec![Val::Nil; n]))))
        }
        TypeTag::Vector => Ok(Val::Vector(Rc::new(RefCell::new(Vec::new())))),
        TypeTag::Table => Ok(Val::Table(Rc::new(RefCell::new(TableVal::new())))),
        _ => Err(err("aggregate initialization of a non-aggregate")),
    }
}

fn binary(op: BinOp, a: &Val, b: &Val) -> Result<Val, RuntimeError> {
    use BinOp::*;

    if let (Val::Vector(x), Val::Vector(y)) = (a, b) {
        let x = x.borrow();
        let y = y.borrow();
        if x.len() != y.len() {
            return Err(err("vector operands of different lengths"));
        }
        let mut out = Vec::with_capacity(x.len());
        for (xa, ya) in x.iter().zip(y.iter()) {
            out.push(binary(op, xa, ya)?);
        }
        return Ok(Val::Vector(Rc::new(RefCell::new(out))));
    }

    let v = match (op, a, b) {
        (Add, Val::Int(a), Val::Int(b)) => Val::Int(a.wrapping_add(*b)),
        (Sub, Val::Int(a), Val::Int(b)) => Val::Int(a.wrapping_sub(*b)),
        (Mul, Val::Int(a), Val::Int(b)) => Val::Int(a.wrapping_mul(*b)),
        (Div, Val::Int(a), Val::Int(b)) => {
            if *b == 0 {
                return Err(err("division by zero"));
            }
            Val::Int(a.wrapping_div(*b))
        }
        (Mod, Val::Int(a), Val::Int(b)) => {
            if *b == 0 {
                return Err(err("modulo by zero"));
            }
            Val::Int(a.wrapping_rem(*b))
        }
        (Add, Val::Count(a), Val::Count(b)) => Val::Count(a.wrapping_add(*b)),
        (Sub, Val::Count(a), Val::Count(b)) => Val::Count(a.wrapping_sub(*b)),
        (Mul, Val::Count(a), Val::Count(b)) => Val::Count(a.wrapping_mul(*b)),
        (Div, Val::Count(a), Val::Count(b)) => {
            if *b == 0 {
                return Err(err("division by zero"));
            }
            Val::Count(a / b)
        }
        (Mod, Val::Count(a), Val::Count(b)) => {
            if *b == 0 {
                return Err(err("modulo by zero"));
            }
            Val::Count(a % b)
        }
        (Add, Val::Double(a), Val::Double(b)) => Val::Double(a + b),
        (Sub, Val::Double(a), Val::Double(b)) => Val::Double(a - b),
        (Mul, Val::Double(a), Val::Double(b)) => Val::Double(a * b),
        (Div, Val::Double(a), Val::Double(b)) => Val::Double(a / b),
        (Add, Val::Str(a), Val::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Val::Str(Rc::new(s))
        }
        (Eq, _, _) => Val::Bool(a == b),
        (Ne, _, _) => Val::Bool(a != b),
        (Lt, Val::Int(a), Val::Int(b)) => Val::Bool(a < b),
        (Le, Val::Int(a), Val::Int(b)) => Val::Bool(a <= b),
        (Gt, Val::Int(a), Val::Int(b)) => Val::Bool(a > b),
        (Ge, Val::Int(a), Val::Int(b)) => Val::Bool(a >= b),
        (Lt, Val::Count(a), Val::Count(b)) => Val::Bool(a < b),
        (Le, Val::Count(a), Val::Count(b)) => Val::Bool(a <= b),
        (Gt, Val::Count(a), Val::Count(b)) => Val::Bool(a > b),
        (Ge, Val::Count(a), Val::Count(b)) => Val::Bool(a >= b),
        (Lt, Val::Double(a), Val::Double(b)) => Val::Bool(a < b),
        (Le, Val::Double(a), Val::Double(b)) => Val::Bool(a <= b),
        (Gt, Val::Double(a), Val::Double(b)) => Val::Bool(a > b),
        (Ge, Val::Double(a), Val::Double(b)) => Val::Bool(a >= b),
        (Lt, Val::Str(a), Val::Str(b)) => Val::Bool(a < b),
        (Le, Val::Str(a), Val::Str(b)) => Val::Bool(a <= b),
        (Gt, Val::Str(a), Val::Str(b)) => Val::Bool(a > b),
        (Ge, Val::Str(a), Val::Str(b)) => Val::Bool(a >= b),
        _ => return Err(err("run-time type clash")),
    };
    Ok(v)
}

fn coerce(target: &TypeRef, v: &Val) -> Result<Val, RuntimeError> {
    if let (Some(elem), Val::Vector(src)) = (target.yield_type(), v) {
        let mut out = Vec::with_capacity(src.borrow().len());
        for e in src.borrow().iter() {
            out.push(coerce(elem, e)?);
        }
        return Ok(Val::Vector(Rc::new(RefCell::new(out))));
    }

    let v = match (normalized_tag(target.tag()), v) {
        (TypeTag::Int, Val::Count(n)) => Val::Int(*n as i64),
        (TypeTag::Int, Val::Double(x)) => Val::Int(*x as i64),
        (TypeTag::Int, Val::Int(n)) => Val::Int(*n),
        (TypeTag::Count, Val::Int(n)) => Val::Count(*n as u64),
        (TypeTag::Count, Val::Double(x)) => Val::Count(*x as u64),
        (TypeTag::Count, Val::Count(n)) => Val::Count(*n),
        (TypeTag::Double, Val::Int(n)) => Val::Double(*n as f64),
        (TypeTag::Double, Val::Count(n)) => Val::Double(*n as f64),
        (TypeTag::Double, Val::Double(x)) => Val::Double(*x),
        _ => return Err(err("unknown coercion target")),
    };
    Ok(v)
}

fn index_aggregate(aggr: &Val, ix: &[Val]) -> Result<Val, RuntimeError> {
    match aggr {
        Val::Table(t) => {
            let key = TableKey::from_vals(ix).ok_or_else(|| err("bad table index type"))?;
            t.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| err("no such index"))
        }
        Val::Vector(v) => {
            if ix.len() == 1 {
                let idx = ix[0].as_count().ok_or_else(|| err("run-time type clash"))? as usize;
                v.borrow()
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| err("index out of range"))
            } else {
                let (start, end) = slice_bounds(ix)?;
                let src = v.borrow();
                let end = end.min(src.len());
                let start = start.min(end);
                Ok(Val::Vector(Rc::new(RefCell::new(src[start..end].to_vec()))))
            }
        }
        Val::Str(s) => {
            if ix.len() == 1 {
                let idx = ix[0].as_count().ok_or_else(|| err("run-time type clash"))? as usize;
                let b = *s
                    .as_bytes()
                    .get(idx)
                    .ok_or_else(|| err("index out of range"))?;
                Ok(Val::Str(Rc::new((b as char).to_string())))
            } else {
                let (start, end) = slice_bounds(ix)?;
                let bytes = s.as_bytes();
                let end = end.min(bytes.len());
                let start = start.min(end);
                Ok(Val::Str(Rc::new(
                    String::from_utf8_lossy(&bytes[start..end]).into_owned(),
                )))
            }
        }
        _ => Err(err("run-time type clash")),
    }
}

fn slice_bounds(ix: &[Val]) -> Result<(usize, usize), RuntimeError> {
    if ix.len() != 2 {
        return Err(err("slice takes a start and an end index"));
    }
    let start = ix[0].as_count().ok_or_else(|| err("run-time type clash"))? as usize;
    let end = ix[1].as_count().ok_or_else(|| err("run-time type clash"))? as usize;
    Ok((start, end))
}

fn store_indexed(aggr: &Val, ix: &[Val], v: Val) -> Result<(), RuntimeError> {
    match aggr {
        Val::Table(t) => {
            let key = TableKey::from_vals(ix).ok_or_else(|| err("bad table index type"))?;
            t.borrow_mut().insert(key, v);
            Ok(())
        }
        Val::Vector(vec) => {
            if ix.len() == 1 {
                let idx = ix[0].as_count().ok_or_else(|| err("run-time type clash"))? as usize;
                let mut vec = vec.borrow_mut();
                if idx >= vec.len() {
                    vec.resize(idx + 1, Val::Nil);
                }
                vec[idx] = v;
                Ok(())
            } else {
                let (start, end) = slice_bounds(ix)?;
                let src = v.as_vector().ok_or_else(|| err("run-time type clash"))?;
                let replacement: Vec<Val> = src.borrow().clone();
                let mut dst = vec.borrow_mut();
                let end = end.min(dst.len());
                let start = start.min(end);
                dst.splice(start..end, replacement);
                Ok(())
            }
        }
        _ => Err(err("run-time type clash")),
    }
}

fn in_test(items: &[Val], aggr: &Val) -> Result<Val, RuntimeError> {
    let found = match aggr {
        Val::Table(t) => {
            let key = TableKey::from_vals(items).ok_or_else(|| err("bad table index type"))?;
            t.borrow().contains(&key)
        }
        Val::Vector(v) => {
            let idx = items
                .first()
                .and_then(Val::as_count)
                .ok_or_else(|| err("run-time type clash"))? as usize;
            v.borrow().get(idx).is_some_and(|e| !e.is_nil())
        }
        Val::Str(hay) => match items {
            [Val::Str(needle)] => hay.contains(needle.as_str()),
            [Val::Pattern(p)] => p.is_match(hay),
            _ => return Err(err("run-time type clash")),
        },
        Val::Subnet(net) => {
            let addr = items
                .first()
                .and_then(Val::as_addr)
                .ok_or_else(|| err("run-time type clash"))?;
            net.contains(&addr)
        }
        _ => return Err(err("run-time type clash")),
    };
    Ok(Val::Bool(found))
}
