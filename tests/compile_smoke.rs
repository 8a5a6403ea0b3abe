mod common;

use std::rc::Rc;

use common::*;
use kestrel::ast::{BinOp, Expr, TypeTag};
use kestrel::code::{verify_body, Op};
use kestrel::value::Val;

/// `function f(x: count): count { return x + 1; }`
fn increment_body() -> (kestrel::ast::FuncRef, kestrel::ast::FuncBody, kestrel::ast::Analyses) {
    let mut b = FnBuilder::new("f");
    let x = b.param("x", TypeTag::Count);
    let tmp = b.temp("#0", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = kestrel::ast::Stmt::List(vec![
        assign(
            &tmp,
            Expr::Binary {
                op: BinOp::Add,
                lhs: name(&x),
                rhs: c_count(1),
            },
        ),
        ret(name(&tmp)),
    ]);

    b.build(body)
}

#[test]
fn increment_returns_42() {
    let (func, body, analyses) = increment_body();
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);
    let outcome = run_compiled(&compiled, &[Val::Count(41)]);
    assert_eq!(outcome.value, Some(Val::Count(42)));
}

#[test]
fn increment_compiles_to_one_add_and_a_return() {
    let (func, body, analyses) = increment_body();
    let compiled = compile_fn(func, &body, &analyses);

    let adds: Vec<Op> = compiled
        .insts2
        .iter()
        .map(|z| z.op)
        .filter(|op| op.name().starts_with("add_"))
        .collect();
    assert_eq!(adds, vec![Op::AddCountVVC]);

    let returns = compiled
        .insts2
        .iter()
        .filter(|z| matches!(z.op, Op::ReturnV | Op::ReturnC | Op::ReturnX))
        .count();
    assert_eq!(returns, 1);
}

#[test]
fn increment_matches_the_interpreter() {
    let (func, body, analyses) = increment_body();
    for n in [0u64, 1, 41, u64::MAX] {
        check_equivalence(Rc::clone(&func), &body, &analyses, &[Val::Count(n)]);
    }
}

#[test]
fn compiled_bodies_verify() {
    let (func, body, analyses) = increment_body();
    let compiled = compile_fn(func, &body, &analyses);
    verify_body(&compiled).expect("structural invariants");
}

#[test]
fn unoptimized_and_optimized_agree() {
    let (func, body, analyses) = increment_body();
    let options = kestrel::CompileOptions {
        no_optimize: true,
        ..Default::default()
    };
    let plain = compile_fn_with(Rc::clone(&func), &body, &analyses, &options);
    let optimized = compile_fn(func, &body, &analyses);

    let a = run_compiled(&plain, &[Val::Count(6)]);
    let b = run_compiled(&optimized, &[Val::Count(6)]);
    assert_eq!(a.value, b.value);
    assert!(optimized.insts2.len() <= plain.insts2.len());
}

#[test]
fn frame_is_no_larger_after_remapping() {
    let (func, body, analyses) = increment_body();
    let compiled = compile_fn(func, &body, &analyses);
    assert!(compiled.remapped);
    assert!(compiled.frame_size <= compiled.frame_denizens.len());
    assert!(compiled.frame_size >= 1);
}

#[test]
fn profiled_runs_count_every_dispatched_opcode() {
    let (func, body, analyses) = increment_body();
    let compiled = compile_fn(func, &body, &analyses);

    let mut profile = kestrel::ExecProfile::new();
    let mut runtime = TestRuntime::new();
    let mut globals = kestrel::GlobalStore::new();
    let mut frame = vec![Val::Count(41)];
    let mut env = kestrel::ExecEnv {
        runtime: &mut runtime,
        globals: &mut globals,
        profile: Some(&mut profile),
    };
    kestrel::execute(&compiled, &mut frame, &mut env).expect("execution");

    assert_eq!(
        profile.executed_instructions(),
        compiled.insts2.len() as u64
    );
    assert_eq!(profile.op_count(Op::AddCountVVC), 1);
    assert!(profile.report().contains("add_count_vvc"));
}

#[test]
fn empty_body_compiles_and_runs() {
    let b = FnBuilder::new("noop");
    let (func, body, analyses) = b.build(kestrel::ast::Stmt::Null);
    let compiled = compile_fn(func, &body, &analyses);
    let outcome = run_compiled(&compiled, &[]);
    assert_eq!(outcome.value, None);
    assert_eq!(outcome.flow, kestrel::Flow::Return);
}
