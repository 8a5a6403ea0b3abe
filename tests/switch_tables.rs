mod common;

use std::rc::Rc;

use common::*;
use kestrel::ast::{Stmt, SwitchCase, TypeTag};
use kestrel::code::Op;
use kestrel::value::Val;

/// `switch x { case 1: return "a"; case 2: return "b"; default:
/// return "z"; }`
fn int_switch() -> (kestrel::ast::FuncRef, kestrel::ast::FuncBody, kestrel::ast::Analyses) {
    let mut b = FnBuilder::new("pick");
    let x = b.param("x", TypeTag::Int);
    let b = b.returns(TypeTag::Str);

    let body = Stmt::Switch {
        on: name(&x),
        cases: vec![
            SwitchCase {
                vals: vec![cval(Val::Int(1), TypeTag::Int)],
                body: ret(c_str("a")),
            },
            SwitchCase {
                vals: vec![cval(Val::Int(2), TypeTag::Int)],
                body: ret(c_str("b")),
            },
            SwitchCase {
                vals: vec![],
                body: ret(c_str("z")),
            },
        ],
        default: Some(2),
    };

    b.build(body)
}

#[test]
fn int_switch_builds_a_two_entry_jump_table() {
    let (func, body, analyses) = int_switch();
    let compiled = compile_fn(func, &body, &analyses);

    assert_eq!(compiled.cases.int_cases.len(), 1);
    assert_eq!(compiled.cases.int_cases[0].len(), 2);
    assert!(compiled
        .insts2
        .iter()
        .any(|z| z.op == Op::SwitchIntVVV));
}

#[test]
fn int_switch_selects_cases_and_default() {
    let (func, body, analyses) = int_switch();
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);

    let expect = [(1, "a"), (2, "b"), (3, "z")];
    for (input, want) in expect {
        let outcome = run_compiled(&compiled, &[Val::Int(input)]);
        assert_eq!(outcome.value, Some(Val::Str(Rc::new(want.to_string()))));
    }
}

#[test]
fn int_switch_matches_the_interpreter() {
    let (func, body, analyses) = int_switch();
    for input in [0, 1, 2, 3, -1] {
        check_equivalence(Rc::clone(&func), &body, &analyses, &[Val::Int(input)]);
    }
}

#[test]
fn string_switch_dispatches_through_the_string_table() {
    let mut b = FnBuilder::new("proto");
    let s = b.param("s", TypeTag::Str);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::Switch {
        on: name(&s),
        cases: vec![
            SwitchCase {
                vals: vec![cval(Val::Str(Rc::new("tcp".into())), TypeTag::Str)],
                body: ret(c_count(6)),
            },
            SwitchCase {
                vals: vec![cval(Val::Str(Rc::new("udp".into())), TypeTag::Str)],
                body: ret(c_count(17)),
            },
        ],
        default: None,
    };
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    assert_eq!(compiled.cases.str_cases.len(), 1);
    assert_eq!(
        run_compiled(&compiled, &[Val::Str(Rc::new("udp".into()))]).value,
        Some(Val::Count(17))
    );
    assert_eq!(
        run_compiled(&compiled, &[Val::Str(Rc::new("icmp".into()))]).value,
        None
    );
}

#[test]
fn fallthrough_runs_into_the_next_case() {
    let mut b = FnBuilder::new("ft");
    let x = b.param("x", TypeTag::Int);
    let acc = b.local("acc", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    // case 1 falls through into case 2; case 2 breaks.
    let body = Stmt::List(vec![
        assign(&acc, kestrel::ast::Expr::Const(cval(Val::Count(0), TypeTag::Count))),
        Stmt::Switch {
            on: name(&x),
            cases: vec![
                SwitchCase {
                    vals: vec![cval(Val::Int(1), TypeTag::Int)],
                    body: Stmt::List(vec![
                        assign(
                            &acc,
                            kestrel::ast::Expr::Binary {
                                op: kestrel::ast::BinOp::Add,
                                lhs: name(&acc),
                                rhs: c_count(1),
                            },
                        ),
                        Stmt::FallThrough,
                    ]),
                },
                SwitchCase {
                    vals: vec![cval(Val::Int(2), TypeTag::Int)],
                    body: Stmt::List(vec![
                        assign(
                            &acc,
                            kestrel::ast::Expr::Binary {
                                op: kestrel::ast::BinOp::Add,
                                lhs: name(&acc),
                                rhs: c_count(10),
                            },
                        ),
                        Stmt::Break,
                    ]),
                },
            ],
            default: None,
        },
        ret(name(&acc)),
    ]);
    let (func, body, analyses) = b.build(body);

    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);
    assert_eq!(
        run_compiled(&compiled, &[Val::Int(1)]).value,
        Some(Val::Count(11))
    );
    assert_eq!(
        run_compiled(&compiled, &[Val::Int(2)]).value,
        Some(Val::Count(10))
    );
    assert_eq!(
        run_compiled(&compiled, &[Val::Int(7)]).value,
        Some(Val::Count(0))
    );

    for input in [1, 2, 7] {
        check_equivalence(Rc::clone(&func), &body, &analyses, &[Val::Int(input)]);
    }
}

#[test]
fn break_outside_loop_or_switch_is_a_source_error() {
    let b = FnBuilder::new("loose");
    let (func, body, analyses) = b.build(Stmt::Break);
    let got = kestrel::compile(func, &body, &analyses, &Default::default());
    match got {
        Err(kestrel::CompileError::Source { message }) => {
            assert!(message.contains("break"));
        }
        other => panic!("expected a source error, got {other:?}"),
    }
}

#[test]
fn hook_breaks_become_hook_break_instructions() {
    let b = FnBuilder::new("h").hook();
    let (func, body, analyses) = b.build(Stmt::Break);
    let compiled = compile_fn(func, &body, &analyses);
    assert!(compiled.insts2.iter().any(|z| z.op == Op::HookBreakX));

    let outcome = run_compiled(&compiled, &[]);
    assert_eq!(outcome.flow, kestrel::Flow::HookBreak);
}
