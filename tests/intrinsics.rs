mod common;

use std::rc::Rc;

use common::*;
use kestrel::ast::{CallExpr, Expr, IdScope, Ident, Stmt, TypeTag};
use kestrel::code::Op;
use kestrel::value::Val;
use kestrel::GlobalStore;

fn builtin(name: &str) -> Ident {
    Ident::new(
        name,
        kestrel::ast::base_type(TypeTag::Func),
        IdScope::Global,
        0,
    )
}

#[test]
fn to_lower_lowers_to_its_intrinsic() {
    let mut b = FnBuilder::new("lower");
    let s = b.param("s", TypeTag::Str);
    let out = b.local("out", TypeTag::Str);
    let b = b.returns(TypeTag::Str);

    let body = Stmt::List(vec![
        assign(
            &out,
            Expr::Call(CallExpr {
                callee: builtin("to_lower"),
                args: vec![name(&s)],
            }),
        ),
        ret(name(&out)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    assert!(compiled.insts2.iter().any(|z| z.op == Op::ToLowerVV));
    assert!(
        !compiled
            .insts2
            .iter()
            .any(|z| z.op.name().starts_with("assign_call")),
        "to_lower must not lower to a generic call"
    );

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    let outcome = run_compiled_in(
        &compiled,
        &[Val::Str(Rc::new("ABC".to_string()))],
        &mut runtime,
        &mut globals,
    );
    assert_eq!(outcome.value, Some(Val::Str(Rc::new("abc".to_string()))));
    assert!(runtime.calls.is_empty(), "no host call for an intrinsic");
}

#[test]
fn sub_bytes_extracts_a_substring() {
    let mut b = FnBuilder::new("cut");
    let s = b.param("s", TypeTag::Str);
    let out = b.local("out", TypeTag::Str);
    let b = b.returns(TypeTag::Str);

    let body = Stmt::List(vec![
        assign(
            &out,
            Expr::Call(CallExpr {
                callee: builtin("sub_bytes"),
                args: vec![name(&s), c_count(2), c_int(3)],
            }),
        ),
        ret(name(&out)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);
    assert!(compiled.insts2.iter().any(|z| z.op == Op::SubBytesVVVV));

    let input = Val::Str(Rc::new("kestrel".to_string()));
    let outcome = run_compiled(&compiled, &[input.clone()]);
    assert_eq!(outcome.value, Some(Val::Str(Rc::new("est".to_string()))));

    check_equivalence(func, &body, &analyses, &[input]);
}

#[test]
fn strstr_reports_one_based_positions() {
    let mut b = FnBuilder::new("find");
    let hay = b.param("hay", TypeTag::Str);
    let pos = b.local("pos", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(
            &pos,
            Expr::Call(CallExpr {
                callee: builtin("strstr"),
                args: vec![name(&hay), c_str("str")],
            }),
        ),
        ret(name(&pos)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(Rc::clone(&func), &body, &analyses);
    assert!(compiled.insts2.iter().any(|z| z.op == Op::StrStrVVC));

    let outcome = run_compiled(&compiled, &[Val::Str(Rc::new("kestrel".to_string()))]);
    assert_eq!(outcome.value, Some(Val::Count(3)));
    let outcome = run_compiled(&compiled, &[Val::Str(Rc::new("zzz".to_string()))]);
    assert_eq!(outcome.value, Some(Val::Count(0)));

    check_equivalence(
        func,
        &body,
        &analyses,
        &[Val::Str(Rc::new("kestrel".to_string()))],
    );
}

#[test]
fn log_write_reaches_the_log_subsystem() {
    let mut b = FnBuilder::new("log_it");
    let cols = b.param("cols", TypeTag::Str);
    let ok = b.local("ok", TypeTag::Bool);

    let body = Stmt::List(vec![
        assign(
            &ok,
            Expr::Call(CallExpr {
                callee: builtin("Log::write"),
                args: vec![c_str("conn"), name(&cols)],
            }),
        ),
        Stmt::Return(Some(name(&ok))),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);
    assert!(compiled.insts2.iter().any(|z| z.op == Op::LogWriteVVV));

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    let outcome = run_compiled_in(
        &compiled,
        &[Val::Str(Rc::new("line".to_string()))],
        &mut runtime,
        &mut globals,
    );
    assert_eq!(outcome.value, Some(Val::Bool(true)));
    assert_eq!(runtime.log_lines, vec![("conn".to_string(), "line".to_string())]);
}

#[test]
fn unused_log_write_result_reflavors_to_the_assignmentless_form() {
    let mut b = FnBuilder::new("log_quietly");
    let cols = b.param("cols", TypeTag::Str);
    let ok = b.local("ok", TypeTag::Bool);

    // `ok` is never read again, so the assignment half of the write is
    // pruned while the side effect survives.
    let body = assign(
        &ok,
        Expr::Call(CallExpr {
            callee: builtin("Log::write"),
            args: vec![c_str("conn"), name(&cols)],
        }),
    );
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    assert!(compiled.insts2.iter().any(|z| z.op == Op::LogWriteVV));
    assert!(!compiled.insts2.iter().any(|z| z.op == Op::LogWriteVVV));

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_compiled_in(
        &compiled,
        &[Val::Str(Rc::new("line".to_string()))],
        &mut runtime,
        &mut globals,
    );
    assert_eq!(runtime.log_lines.len(), 1);
}

#[test]
fn unused_call_result_reflavors_to_the_bare_call() {
    let mut b = FnBuilder::new("fire_and_forget");
    let x = b.param("x", TypeTag::Count);
    let unused = b.local("unused", TypeTag::Count);

    let body = assign(
        &unused,
        Expr::Call(CallExpr {
            callee: builtin("side_effect"),
            args: vec![name(&x)],
        }),
    );
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    assert!(compiled.insts2.iter().any(|z| z.op == Op::Call1V));
    assert!(!compiled.insts2.iter().any(|z| z.op == Op::AssignCall1VV));

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_compiled_in(&compiled, &[Val::Count(4)], &mut runtime, &mut globals);
    assert_eq!(runtime.calls, vec![("side_effect".to_string(), vec![Val::Count(4)])]);
}

#[test]
fn generic_calls_cover_all_specialized_arities() {
    let mut b = FnBuilder::new("caller");
    let out = b.local("out", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let call_n = |n: usize| {
        Expr::Call(CallExpr {
            callee: builtin("acc"),
            args: (0..n).map(|i| c_count(i as u64)).collect(),
        })
    };

    let body = Stmt::List(vec![
        Stmt::Expr(call_n(0)),
        Stmt::Expr(call_n(2)),
        Stmt::Expr(call_n(5)),
        assign(&out, call_n(6)),
        ret(name(&out)),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    for op in [Op::Call0X, Op::Call2A, Op::Call5A, Op::AssignCallNVA] {
        assert!(
            compiled.insts2.iter().any(|z| z.op == op),
            "missing {}",
            op.name()
        );
    }

    let mut runtime = TestRuntime::new();
    runtime.define("acc", |args| {
        Ok(Val::Count(args.iter().filter_map(Val::as_count).sum()))
    });
    let mut globals = GlobalStore::new();
    let outcome = run_compiled_in(&compiled, &[], &mut runtime, &mut globals);
    assert_eq!(outcome.value, Some(Val::Count(15)));
    assert_eq!(runtime.calls.len(), 4);
}

#[test]
fn events_carry_their_arguments() {
    let mut b = FnBuilder::new("notify");
    let x = b.param("x", TypeTag::Count);

    let handler = Rc::new(kestrel::ast::EventHandler {
        name: "connection_seen".to_string(),
    });
    let body = Stmt::Event {
        handler,
        args: vec![name(&x), c_str("tcp")],
    };
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);
    assert!(compiled.insts2.iter().any(|z| z.op == Op::EventA));

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_compiled_in(&compiled, &[Val::Count(9)], &mut runtime, &mut globals);
    assert_eq!(runtime.events.len(), 1);
    assert_eq!(runtime.events[0].0, "connection_seen");
    assert_eq!(runtime.events[0].1[0], Val::Count(9));
}

#[test]
fn when_defers_its_predicate_to_the_host() {
    let mut b = FnBuilder::new("waiter");
    let flag = b.local("flag", TypeTag::Bool);

    let clause = kestrel::ast::WhenClause {
        cond: Rc::new(Expr::Name(flag.clone())),
        body: Rc::new(Stmt::Return(None)),
        timeout: None,
        is_return: false,
    };
    let body = Stmt::List(vec![
        assign(&flag, Expr::Const(cval(Val::Bool(false), TypeTag::Bool))),
        Stmt::When(clause),
    ]);
    let (func, body, analyses) = b.build(body);
    let compiled = compile_fn(func, &body, &analyses);

    assert!(compiled.insts2.iter().any(|z| z.op == Op::WhenVV));
    assert!(compiled.insts2.iter().any(|z| z.op == Op::StoreValVV));

    let mut runtime = TestRuntime::new();
    let mut globals = GlobalStore::new();
    run_compiled_in(&compiled, &[], &mut runtime, &mut globals);
    assert_eq!(runtime.whens.len(), 1);
    let body_pc = runtime.whens[0].body_pc;
    assert!(body_pc < compiled.insts2.len());

    // Once the host decides the predicate holds, it re-enters the body at
    // the saved program counter.
    let resumption = kestrel::Resumption::new(&compiled, body_pc);
    let mut frame = vec![kestrel::value::Val::Nil; compiled.interp_frame_size.max(1)];
    let mut env = kestrel::ExecEnv {
        runtime: &mut runtime,
        globals: &mut globals,
        profile: None,
    };
    let outcome = resumption.exec(&mut frame, &mut env).expect("resumption");
    assert_eq!(outcome.flow, kestrel::Flow::Return);
}
