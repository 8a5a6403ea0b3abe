mod common;

use std::rc::Rc;

use common::*;
use kestrel::ast::{BinOp, Expr, Stmt, TypeTag};
use kestrel::code::Op;
use kestrel::value::Val;

/// `function g(): count { local a = 1; local b = 2; local c = a + b;
/// return c; }`
fn three_locals() -> (kestrel::ast::FuncRef, kestrel::ast::FuncBody, kestrel::ast::Analyses) {
    let mut b = FnBuilder::new("g");
    let a = b.local("a", TypeTag::Count);
    let bb = b.local("b", TypeTag::Count);
    let c = b.local("c", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(&a, Expr::Const(cval(Val::Count(1), TypeTag::Count))),
        assign(&bb, Expr::Const(cval(Val::Count(2), TypeTag::Count))),
        assign(
            &c,
            Expr::Binary {
                op: BinOp::Add,
                lhs: name(&a),
                rhs: name(&bb),
            },
        ),
        ret(name(&c)),
    ]);

    b.build(body)
}

#[test]
fn locals_with_disjoint_lifetimes_share_slots() {
    let (func, body, analyses) = three_locals();
    let compiled = compile_fn(func, &body, &analyses);
    // `a` dies computing `c`, so the three locals need at most two slots.
    assert!(compiled.frame_size <= 2, "frame = {}", compiled.frame_size);

    let outcome = run_compiled(&compiled, &[]);
    assert_eq!(outcome.value, Some(Val::Count(3)));
}

#[test]
fn three_locals_match_the_interpreter() {
    let (func, body, analyses) = three_locals();
    check_equivalence(func, &body, &analyses, &[]);
}

#[test]
fn unused_assignments_are_pruned() {
    let mut b = FnBuilder::new("wasted");
    let dead = b.local("dead", TypeTag::Count);
    let b = b.returns(TypeTag::Count);
    let body = Stmt::List(vec![
        assign(&dead, Expr::Const(cval(Val::Count(9), TypeTag::Count))),
        ret(c_count(5)),
    ]);
    let (func, body, analyses) = b.build(body);

    let compiled = compile_fn(func, &body, &analyses);
    assert!(
        !compiled.insts2.iter().any(|z| z.op == Op::AssignVC),
        "dead assignment survived optimization"
    );
    assert_eq!(run_compiled(&compiled, &[]).value, Some(Val::Count(5)));
}

#[test]
fn code_after_a_return_is_removed() {
    let mut b = FnBuilder::new("early");
    let x = b.param("x", TypeTag::Count);
    let b = b.returns(TypeTag::Count);
    let body = Stmt::List(vec![ret(name(&x)), ret(c_count(0))]);
    let (func, body, analyses) = b.build(body);

    let compiled = compile_fn(func, &body, &analyses);
    let returns = compiled
        .insts2
        .iter()
        .filter(|z| matches!(z.op, Op::ReturnV | Op::ReturnC))
        .count();
    assert_eq!(returns, 1);
    assert!(compiled.insts1.iter().any(|z| !z.live));
}

#[test]
fn branch_operands_are_concretized_to_live_targets() {
    let mut b = FnBuilder::new("branches");
    let x = b.param("x", TypeTag::Bool);
    let out = b.local("out", TypeTag::Count);
    let b = b.returns(TypeTag::Count);
    let body = Stmt::List(vec![
        Stmt::If {
            cond: Expr::Name(x.clone()),
            then_branch: Some(Box::new(assign(
                &out,
                Expr::Const(cval(Val::Count(1), TypeTag::Count)),
            ))),
            else_branch: Some(Box::new(assign(
                &out,
                Expr::Const(cval(Val::Count(2), TypeTag::Count)),
            ))),
        },
        ret(name(&out)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    let len = compiled.insts2.len();
    for (i, z) in compiled.insts2.iter().enumerate() {
        assert_eq!(z.inst_num, i);
        if z.target.is_some() {
            let pc = z.branch_operand(z.target_slot);
            assert!(pc >= 0 && (pc as usize) <= len, "bad branch operand {pc}");
        }
    }

    assert_eq!(
        run_compiled(&compiled, &[Val::Bool(true)]).value,
        Some(Val::Count(1))
    );
    assert_eq!(
        run_compiled(&compiled, &[Val::Bool(false)]).value,
        Some(Val::Count(2))
    );
}

#[test]
fn label_accounting_matches_incoming_branches() {
    let (func, body, analyses) = three_locals();
    let compiled = compile_fn(func, &body, &analyses);

    let total_labels: u32 = compiled
        .insts1
        .iter()
        .filter(|z| z.live)
        .map(|z| z.num_labels)
        .sum();

    let mut incoming = 0u32;
    let len = compiled.insts1.len();
    for z in compiled.insts1.iter().filter(|z| z.live) {
        for t in [z.target, z.target2].into_iter().flatten() {
            if t.0 < len && compiled.insts1[t.0].live {
                incoming += 1;
            }
        }
    }
    incoming += compiled.cases.total_entries() as u32;

    assert_eq!(total_labels, incoming);
}

#[test]
fn optimization_is_idempotent() {
    let (func, body, analyses) = three_locals();
    let first = compile_fn(Rc::clone(&func), &body, &analyses);
    let second = compile_fn(func, &body, &analyses);

    let ops1: Vec<_> = first
        .insts2
        .iter()
        .map(|z| (z.op, z.v1, z.v2, z.v3, z.v4))
        .collect();
    let ops2: Vec<_> = second
        .insts2
        .iter()
        .map(|z| (z.op, z.v1, z.v2, z.v3, z.v4))
        .collect();
    assert_eq!(ops1, ops2);
}
