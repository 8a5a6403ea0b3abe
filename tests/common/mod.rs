#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;

use kestrel::ast::{
    base_type, expr_ids, Analyses, ConstVal, Expr, FuncBody, FuncFlavor, FuncInfo, FuncRef,
    IdScope, Ident, Operand, ProfileFunc, Reducer, Stmt, StmtId, TypeRef, TypeTag, UseDefs,
};
use kestrel::code::CompiledBody;
use kestrel::value::Val;
use kestrel::{
    compile, execute, CompileOptions, ExecEnv, ExecOutcome, GlobalStore, Runtime, RuntimeError,
    WhenSpec,
};

/// Builds one function body with its analysis products the way the front
/// end would hand them over.
pub struct FnBuilder {
    name: String,
    flavor: FuncFlavor,
    ret: Option<TypeRef>,
    params: Vec<Ident>,
    locals: Vec<Ident>,
    globals: Vec<Ident>,
    inits: Vec<Ident>,
    temps: Vec<Ident>,
}

impl FnBuilder {
    pub fn new(name: &str) -> FnBuilder {
        FnBuilder {
            name: name.to_string(),
            flavor: FuncFlavor::Function,
            ret: None,
            params: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            inits: Vec::new(),
            temps: Vec::new(),
        }
    }

    pub fn hook(mut self) -> FnBuilder {
        self.flavor = FuncFlavor::Hook;
        self
    }

    pub fn returns(mut self, tag: TypeTag) -> FnBuilder {
        self.ret = Some(base_type(tag));
        self
    }

    pub fn param(&mut self, name: &str, tag: TypeTag) -> Ident {
        self.param_typed(name, base_type(tag))
    }

    pub fn param_typed(&mut self, name: &str, ty: TypeRef) -> Ident {
        let id = Ident::new(name, ty, IdScope::Param, self.params.len());
        self.params.push(id.clone());
        id
    }

    pub fn local(&mut self, name: &str, tag: TypeTag) -> Ident {
        self.local_typed(name, base_type(tag))
    }

    pub fn local_typed(&mut self, name: &str, ty: TypeRef) -> Ident {
        let offset = self.params.len() + self.locals.len();
        let id = Ident::new(name, ty, IdScope::Local, offset);
        self.locals.push(id.clone());
        id
    }

    /// A reducer-synthesized temporary: a local the lifetime analysis may
    /// treat as loop-body-scoped.
    pub fn temp(&mut self, name: &str, tag: TypeTag) -> Ident {
        let id = self.local(name, tag);
        self.temps.push(id.clone());
        id
    }

    pub fn global(&mut self, name: &str, tag: TypeTag) -> Ident {
        self.global_typed(name, base_type(tag))
    }

    pub fn global_typed(&mut self, name: &str, ty: TypeRef) -> Ident {
        let id = Ident::new(name, ty, IdScope::Global, 0);
        self.globals.push(id.clone());
        id
    }

    /// A local aggregate carrying an initializer.
    pub fn init_local(&mut self, name: &str, ty: TypeRef) -> Ident {
        let id = self.local_typed(name, ty);
        self.inits.push(id.clone());
        id
    }

    pub fn build(self, stmt: Stmt) -> (FuncRef, FuncBody, Analyses) {
        let func = Rc::new(FuncInfo::new(
            self.name,
            self.flavor,
            self.params.clone(),
            self.ret,
        ));
        func.set_frame_size(self.params.len() + self.locals.len());

        let body = FuncBody {
            id: StmtId(1),
            stmt,
        };

        let mut usedefs = UseDefs::new();
        usedefs.set_usage(body.id, stmt_ids(&body.stmt));

        let mut reducer = Reducer::new();
        for t in self.temps {
            reducer.mark_temporary(t);
        }

        let profile = ProfileFunc {
            globals: self.globals,
            locals: self.locals,
            inits: self.inits,
        };

        let analyses = Analyses {
            reducer,
            usedefs,
            profile,
        };

        (func, body, analyses)
    }
}

/// Every identifier a statement tree references, for the use-def summary.
pub fn stmt_ids(s: &Stmt) -> Vec<Ident> {
    let mut out = Vec::new();
    collect_stmt_ids(s, &mut out);
    out
}

fn collect_operand(op: &Operand, out: &mut Vec<Ident>) {
    if let Operand::Name(id) = op {
        out.push(id.clone());
    }
}

fn collect_stmt_ids(s: &Stmt, out: &mut Vec<Ident>) {
    match s {
        Stmt::Null | Stmt::Break | Stmt::Next | Stmt::FallThrough => {}
        Stmt::List(stmts) => {
            for st in stmts {
                collect_stmt_ids(st, out);
            }
        }
        Stmt::Expr(e) => out.extend(expr_ids(e)),
        Stmt::Assign { lhs, rhs } => {
            match lhs {
                kestrel::ast::AssignLhs::Name(_) => {}
                kestrel::ast::AssignLhs::Index { aggr, indexes } => {
                    out.push(aggr.clone());
                    for ix in indexes {
                        collect_operand(ix, out);
                    }
                }
                kestrel::ast::AssignLhs::Field { record, .. } => out.push(record.clone()),
            }
            out.extend(expr_ids(rhs));
        }
        Stmt::Init(_) => {}
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            out.extend(expr_ids(cond));
            if let Some(b) = then_branch {
                collect_stmt_ids(b, out);
            }
            if let Some(b) = else_branch {
                collect_stmt_ids(b, out);
            }
        }
        Stmt::While {
            cond_prologue,
            cond,
            body,
        } => {
            if let Some(p) = cond_prologue {
                collect_stmt_ids(p, out);
            }
            out.extend(expr_ids(cond));
            collect_stmt_ids(body, out);
        }
        Stmt::Loop { body } => collect_stmt_ids(body, out),
        Stmt::For { aggr, body, .. } => {
            out.push(aggr.clone());
            collect_stmt_ids(body, out);
        }
        Stmt::Switch { on, cases, .. } => {
            collect_operand(on, out);
            for case in cases {
                collect_stmt_ids(&case.body, out);
            }
        }
        Stmt::Return(value) => {
            if let Some(op) = value {
                collect_operand(op, out);
            }
        }
        Stmt::CatchReturn { block, .. } => collect_stmt_ids(block, out),
        Stmt::When(clause) => {
            out.extend(expr_ids(&clause.cond));
            collect_stmt_ids(&clause.body, out);
            if let Some((t, tb)) = &clause.timeout {
                collect_operand(t, out);
                collect_stmt_ids(tb, out);
            }
        }
        Stmt::Event { args, .. } => {
            for a in args {
                collect_operand(a, out);
            }
        }
    }
}

// ---- expression shorthand -----------------------------------------------

pub fn name(id: &Ident) -> Operand {
    Operand::Name(id.clone())
}

pub fn cval(v: Val, tag: TypeTag) -> ConstVal {
    ConstVal::new(v, base_type(tag))
}

pub fn c_count(n: u64) -> Operand {
    Operand::Const(cval(Val::Count(n), TypeTag::Count))
}

pub fn c_int(n: i64) -> Operand {
    Operand::Const(cval(Val::Int(n), TypeTag::Int))
}

pub fn c_double(x: f64) -> Operand {
    Operand::Const(cval(Val::Double(x), TypeTag::Double))
}

pub fn c_str(s: &str) -> Operand {
    Operand::Const(cval(Val::Str(Rc::new(s.to_string())), TypeTag::Str))
}

pub fn c_bool(b: bool) -> Operand {
    Operand::Const(cval(Val::Bool(b), TypeTag::Bool))
}

pub fn assign(id: &Ident, rhs: Expr) -> Stmt {
    Stmt::Assign {
        lhs: kestrel::ast::AssignLhs::Name(id.clone()),
        rhs,
    }
}

pub fn ret(op: Operand) -> Stmt {
    Stmt::Return(Some(op))
}

// ---- runtime and execution ----------------------------------------------

type HostFn = Box<dyn FnMut(&[Val]) -> Result<Val, RuntimeError>>;

/// A recording host runtime for tests.
#[derive(Default)]
pub struct TestRuntime {
    pub calls: Vec<(String, Vec<Val>)>,
    pub log_lines: Vec<(String, String)>,
    pub flushes: usize,
    pub events: Vec<(String, Vec<Val>)>,
    pub whens: Vec<WhenSpec>,
    fns: HashMap<String, HostFn>,
}

impl TestRuntime {
    pub fn new() -> TestRuntime {
        TestRuntime::default()
    }

    pub fn define(
        &mut self,
        name: &str,
        f: impl FnMut(&[Val]) -> Result<Val, RuntimeError> + 'static,
    ) {
        self.fns.insert(name.to_string(), Box::new(f));
    }
}

impl Runtime for TestRuntime {
    fn call(&mut self, fn_name: &str, args: &[Val]) -> Result<Val, RuntimeError> {
        self.calls.push((fn_name.to_string(), args.to_vec()));
        match self.fns.get_mut(fn_name) {
            Some(f) => f(args),
            None => Ok(Val::Nil),
        }
    }

    fn log_write(&mut self, stream: &Val, columns: &Val) -> Result<bool, RuntimeError> {
        self.log_lines.push((stream.to_string(), columns.to_string()));
        Ok(true)
    }

    fn flush_logs(&mut self) -> Result<bool, RuntimeError> {
        self.flushes += 1;
        Ok(true)
    }

    fn raise_event(
        &mut self,
        handler: &kestrel::ast::EventHandler,
        args: Vec<Val>,
    ) -> Result<(), RuntimeError> {
        self.events.push((handler.name.clone(), args));
        Ok(())
    }

    fn defer_when(&mut self, spec: WhenSpec) -> Result<(), RuntimeError> {
        self.whens.push(spec);
        Ok(())
    }
}

pub fn compile_fn(
    func: FuncRef,
    body: &FuncBody,
    analyses: &Analyses,
) -> CompiledBody {
    compile(func, body, analyses, &CompileOptions::default()).expect("compilation failed")
}

pub fn compile_fn_with(
    func: FuncRef,
    body: &FuncBody,
    analyses: &Analyses,
    options: &CompileOptions,
) -> CompiledBody {
    compile(func, body, analyses, options).expect("compilation failed")
}

/// Runs a compiled body with arguments in the interpreter frame.
pub fn run_compiled(body: &CompiledBody, args: &[Val]) -> ExecOutcome {
    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_compiled_in(body, args, &mut runtime, &mut globals)
}

pub fn run_compiled_in(
    body: &CompiledBody,
    args: &[Val],
    runtime: &mut TestRuntime,
    globals: &mut GlobalStore,
) -> ExecOutcome {
    let size = body
        .func
        .frame_size()
        .max(body.interp_frame_size)
        .max(args.len());
    let mut frame = vec![Val::Nil; size];
    frame[..args.len()].clone_from_slice(args);
    let mut env = ExecEnv {
        runtime,
        globals,
        profile: None,
    };
    execute(body, &mut frame, &mut env).expect("execution failed")
}

/// Runs the reference interpreter over the same body and arguments.
pub fn run_interp(
    func: &FuncRef,
    body: &FuncBody,
    args: &[Val],
) -> (Option<Val>, kestrel::Flow) {
    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_interp_in(func, body, args, &mut runtime, &mut globals)
}

pub fn run_interp_in(
    func: &FuncRef,
    body: &FuncBody,
    args: &[Val],
    runtime: &mut TestRuntime,
    globals: &mut GlobalStore,
) -> (Option<Val>, kestrel::Flow) {
    let mut env = kestrel::interpreter::Env::new();
    for (param, arg) in func.params.iter().zip(args) {
        env.insert(param.clone(), arg.clone());
    }
    let mut interp = kestrel::interpreter::Interpreter::new(runtime, globals);
    interp.run(&body.stmt, &mut env).expect("interpretation failed")
}

/// Compiles, runs both execution models, and checks they agree.
pub fn check_equivalence(
    func: FuncRef,
    body: &FuncBody,
    analyses: &Analyses,
    args: &[Val],
) -> Option<Val> {
    let compiled = compile_fn(Rc::clone(&func), body, analyses);
    let outcome = run_compiled(&compiled, args);
    let (oracle, oracle_flow) = run_interp(&func, body, args);
    assert_eq!(outcome.value, oracle, "compiled and interpreted results differ");
    assert_eq!(outcome.flow, oracle_flow);
    outcome.value
}
