mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;
use kestrel::ast::{BinOp, Expr, Stmt, Type, TypeTag};
use kestrel::code::Op;
use kestrel::value::{TableKey, TableVal, Val};

fn table_of_counts(entries: &[(u64, u64)]) -> Val {
    let mut t = TableVal::new();
    for (k, v) in entries {
        t.insert(
            TableKey::from_vals(&[Val::Count(*k)]).unwrap(),
            Val::Count(*v),
        );
    }
    Val::Table(Rc::new(RefCell::new(t)))
}

fn count_table_type() -> Rc<Type> {
    Rc::new(Type::Table {
        index: vec![kestrel::ast::base_type(TypeTag::Count)],
        yield_ty: Some(kestrel::ast::base_type(TypeTag::Count)),
    })
}

/// `for (k, v) in t { sum += v; }` followed by `return sum;`
fn table_sum() -> (kestrel::ast::FuncRef, kestrel::ast::FuncBody, kestrel::ast::Analyses) {
    let mut b = FnBuilder::new("sum_table");
    let t = b.param_typed("t", count_table_type());
    let k = b.local("k", TypeTag::Count);
    let v = b.local("v", TypeTag::Count);
    let sum = b.local("sum", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(&sum, Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        Stmt::For {
            loop_vars: vec![k.clone()],
            value_var: Some(v.clone()),
            aggr: t.clone(),
            body: Box::new(assign(
                &sum,
                Expr::Binary {
                    op: BinOp::Add,
                    lhs: name(&sum),
                    rhs: name(&v),
                },
            )),
        },
        ret(name(&sum)),
    ]);

    b.build(body)
}

#[test]
fn table_iteration_sums_values() {
    let (func, body, analyses) = table_sum();
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    let t = table_of_counts(&[(1, 10), (2, 20), (3, 30)]);
    let outcome = run_compiled(&compiled, &[t]);
    assert_eq!(outcome.value, Some(Val::Count(60)));
}

#[test]
fn table_iteration_matches_the_interpreter() {
    let (func, body, analyses) = table_sum();
    let t = table_of_counts(&[(7, 1), (8, 2)]);
    check_equivalence(func, &body, &analyses, &[t]);
}

#[test]
fn table_loops_bracket_iteration_state() {
    let (func, body, analyses) = table_sum();
    let compiled = compile_fn(func, &body, &analyses);

    let init = compiled
        .insts2
        .iter()
        .position(|z| z.op == Op::InitTableLoopVVA)
        .expect("loop init");
    let next = compiled
        .insts2
        .iter()
        .position(|z| z.op == Op::NextTableIterValVarVVVA)
        .expect("loop next");
    let end = compiled
        .insts2
        .iter()
        .position(|z| z.op == Op::EndLoopV)
        .expect("loop end");
    assert!(init < next && next < end);

    // The iterator's exit branch lands past the loop closer.
    let exit = compiled.insts2[next].branch_operand(compiled.insts2[next].target_slot);
    assert_eq!(exit as usize, end);
}

#[test]
fn loop_variable_lifetimes_span_the_body() {
    let (func, body, analyses) = table_sum();
    let compiled = compile_fn(func, &body, &analyses);

    // `k` is never read in the body, yet it must keep a distinct slot for
    // the whole loop; no other identifier may share it inside the loop.
    let k_info = compiled
        .shared_frame
        .iter()
        .find(|info| info.ids.iter().any(|id| id.name() == "k"))
        .expect("k was remapped");
    assert_eq!(k_info.ids.len(), 1);
}

#[test]
fn vector_iteration_yields_indices() {
    let mut b = FnBuilder::new("sum_vec");
    let vec_ty = Rc::new(Type::Vector(kestrel::ast::base_type(TypeTag::Count)));
    let v = b.param_typed("v", vec_ty);
    let i = b.local("i", TypeTag::Count);
    let sum = b.local("sum", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(&sum, Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        Stmt::For {
            loop_vars: vec![i.clone()],
            value_var: None,
            aggr: v.clone(),
            body: Box::new(assign(
                &sum,
                Expr::Binary {
                    op: BinOp::Add,
                    lhs: name(&sum),
                    rhs: name(&i),
                },
            )),
        },
        ret(name(&sum)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    let vec = Val::Vector(Rc::new(RefCell::new(vec![
        Val::Count(5),
        Val::Count(6),
        Val::Count(7),
    ])));
    // Indices 0 + 1 + 2.
    assert_eq!(run_compiled(&compiled, &[vec.clone()]).value, Some(Val::Count(3)));
    check_equivalence(func, &body, &analyses, &[vec]);
}

#[test]
fn string_iteration_walks_bytes() {
    let mut b = FnBuilder::new("count_a");
    let s = b.param("s", TypeTag::Str);
    let ch = b.local("ch", TypeTag::Str);
    let n = b.local("n", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(&n, Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        Stmt::For {
            loop_vars: vec![ch.clone()],
            value_var: None,
            aggr: s.clone(),
            body: Box::new(Stmt::If {
                cond: Expr::Binary {
                    op: BinOp::Eq,
                    lhs: name(&ch),
                    rhs: c_str("a"),
                },
                then_branch: Some(Box::new(assign(
                    &n,
                    Expr::Binary {
                        op: BinOp::Add,
                        lhs: name(&n),
                        rhs: c_count(1),
                    },
                ))),
                else_branch: None,
            }),
        },
        ret(name(&n)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    let input = Val::Str(Rc::new("banana".to_string()));
    assert_eq!(run_compiled(&compiled, &[input.clone()]).value, Some(Val::Count(3)));
    check_equivalence(func, &body, &analyses, &[input]);
}

#[test]
fn while_with_break_and_next() {
    let mut b = FnBuilder::new("evens");
    let limit = b.param("limit", TypeTag::Count);
    let i = b.local("i", TypeTag::Count);
    let sum = b.local("sum", TypeTag::Count);
    let odd = b.temp("#odd", TypeTag::Count);
    let cond = b.temp("#cond", TypeTag::Bool);
    let b = b.returns(TypeTag::Count);

    // while (T) { i += 1; if (i > limit) break; if (i % 2 == 1) next;
    // sum += i; }
    let body = Stmt::List(vec![
        assign(&i, Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        assign(&sum, Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        Stmt::While {
            cond_prologue: None,
            cond: Expr::Const(cval(Val::Bool(true), TypeTag::Bool)),
            body: Box::new(Stmt::List(vec![
                assign(
                    &i,
                    Expr::Binary {
                        op: BinOp::Add,
                        lhs: name(&i),
                        rhs: c_count(1),
                    },
                ),
                assign(
                    &cond,
                    Expr::Binary {
                        op: BinOp::Gt,
                        lhs: name(&i),
                        rhs: name(&limit),
                    },
                ),
                Stmt::If {
                    cond: Expr::Name(cond.clone()),
                    then_branch: Some(Box::new(Stmt::Break)),
                    else_branch: None,
                },
                assign(
                    &odd,
                    Expr::Binary {
                        op: BinOp::Mod,
                        lhs: name(&i),
                        rhs: c_count(2),
                    },
                ),
                assign(
                    &cond,
                    Expr::Binary {
                        op: BinOp::Eq,
                        lhs: name(&odd),
                        rhs: c_count(1),
                    },
                ),
                Stmt::If {
                    cond: Expr::Name(cond.clone()),
                    then_branch: Some(Box::new(Stmt::Next)),
                    else_branch: None,
                },
                assign(
                    &sum,
                    Expr::Binary {
                        op: BinOp::Add,
                        lhs: name(&sum),
                        rhs: name(&i),
                    },
                ),
            ])),
        },
        ret(name(&sum)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    // 2 + 4 + 6 = 12.
    assert_eq!(
        run_compiled(&compiled, &[Val::Count(6)]).value,
        Some(Val::Count(12))
    );
    check_equivalence(func, &body, &analyses, &[Val::Count(6)]);
}
