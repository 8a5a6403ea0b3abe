use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion};

use kestrel::ast::{
    base_type, Analyses, BinOp, ConstVal, Expr, FuncBody, FuncFlavor, FuncInfo, IdScope, Ident,
    Operand, ProfileFunc, Reducer, Stmt, StmtId, TypeTag, UseDefs,
};
use kestrel::value::Val;
use kestrel::{compile, execute, CompileOptions, ExecEnv, GlobalStore, Runtime, RuntimeError};

struct NullRuntime;

impl Runtime for NullRuntime {
    fn call(&mut self, _name: &str, _args: &[Val]) -> Result<Val, RuntimeError> {
        Ok(Val::Nil)
    }

    fn log_write(&mut self, _stream: &Val, _columns: &Val) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    fn flush_logs(&mut self) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    fn raise_event(
        &mut self,
        _handler: &kestrel::ast::EventHandler,
        _args: Vec<Val>,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn defer_when(&mut self, _spec: kestrel::WhenSpec) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// `while (i < n) { i += 1; sum += i; } return sum;`
fn counting_loop() -> (Rc<FuncInfo>, FuncBody, Analyses) {
    let n = Ident::new("n", base_type(TypeTag::Count), IdScope::Param, 0);
    let i = Ident::new("i", base_type(TypeTag::Count), IdScope::Local, 1);
    let sum = Ident::new("sum", base_type(TypeTag::Count), IdScope::Local, 2);
    let cond = Ident::new("#cond", base_type(TypeTag::Bool), IdScope::Local, 3);

    let assign = |id: &Ident, rhs: Expr| Stmt::Assign {
        lhs: kestrel::ast::AssignLhs::Name(id.clone()),
        rhs,
    };
    let zero = || Expr::Const(ConstVal::new(Val::Count(0), base_type(TypeTag::Count)));

    let body_stmt = Stmt::List(vec![
        assign(&i, zero()),
        assign(&sum, zero()),
        Stmt::While {
            cond_prologue: Some(Box::new(assign(
                &cond,
                Expr::Binary {
                    op: BinOp::Lt,
                    lhs: Operand::Name(i.clone()),
                    rhs: Operand::Name(n.clone()),
                },
            ))),
            cond: Expr::Name(cond.clone()),
            body: Box::new(Stmt::List(vec![
                assign(
                    &i,
                    Expr::Binary {
                        op: BinOp::Add,
                        lhs: Operand::Name(i.clone()),
                        rhs: Operand::Const(ConstVal::new(
                            Val::Count(1),
                            base_type(TypeTag::Count),
                        )),
                    },
                ),
                assign(
                    &sum,
                    Expr::Binary {
                        op: BinOp::Add,
                        lhs: Operand::Name(sum.clone()),
                        rhs: Operand::Name(i.clone()),
                    },
                ),
            ])),
        },
        Stmt::Return(Some(Operand::Name(sum.clone()))),
    ]);

    let func = Rc::new(FuncInfo::new(
        "sum_to",
        FuncFlavor::Function,
        vec![n.clone()],
        Some(base_type(TypeTag::Count)),
    ));
    func.set_frame_size(4);

    let body = FuncBody {
        id: StmtId(1),
        stmt: body_stmt,
    };

    let mut usedefs = UseDefs::new();
    usedefs.set_usage(
        body.id,
        [n.clone(), i.clone(), sum.clone(), cond.clone()],
    );

    let mut reducer = Reducer::new();
    reducer.mark_temporary(cond.clone());

    let analyses = Analyses {
        reducer,
        usedefs,
        profile: ProfileFunc {
            globals: Vec::new(),
            locals: vec![i, sum, cond],
            inits: Vec::new(),
        },
    };

    (func, body, analyses)
}

fn bench_dispatch(c: &mut Criterion) {
    let (func, body, analyses) = counting_loop();
    let compiled = compile(func, &body, &analyses, &CompileOptions::default()).unwrap();

    c.bench_function("sum_to_1000", |b| {
        b.iter(|| {
            let mut runtime = NullRuntime;
            let mut globals = GlobalStore::new();
            let mut env = ExecEnv {
                runtime: &mut runtime,
                globals: &mut globals,
                profile: None,
            };
            let mut frame = vec![Val::Count(1000), Val::Nil, Val::Nil, Val::Nil];
            execute(&compiled, &mut frame, &mut env).unwrap()
        })
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
