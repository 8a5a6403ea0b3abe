mod common;

use common::*;
use kestrel::ast::{BinOp, Expr, Stmt, TypeTag};
use kestrel::code::Op;
use kestrel::value::Val;

fn sample_body() -> kestrel::code::CompiledBody {
    let mut b = FnBuilder::new("sample");
    let x = b.param("x", TypeTag::Count);
    let y = b.local("y", TypeTag::Count);
    let b = b.returns(TypeTag::Count);

    let body = Stmt::List(vec![
        assign(
            &y,
            Expr::Binary {
                op: BinOp::Mul,
                lhs: name(&x),
                rhs: c_count(3),
            },
        ),
        Stmt::If {
            cond: Expr::Binary {
                op: BinOp::Gt,
                lhs: name(&y),
                rhs: c_count(10),
            },
            then_branch: Some(Box::new(ret(name(&y)))),
            else_branch: None,
        },
        ret(c_count(0)),
    ]);
    let (func, body, analyses) = b.build(body);
    compile_fn(func, &body, &analyses)
}

#[test]
fn dump_covers_frames_and_both_streams() {
    let compiled = sample_body();
    let text = compiled.dump();

    assert!(text.contains("Original frame:"));
    assert!(text.contains("Final frame:"));
    assert!(text.contains("Pre-removal of dead code:"));
    assert!(text.contains("Final code:"));
    assert!(text.contains("frame[0] = x"));
}

#[test]
fn dump_mnemonics_round_trip_to_opcodes() {
    let compiled = sample_body();
    let text = compiled.dump();

    let mut in_final = false;
    let mut seen = 0;
    for line in text.lines() {
        if line == "Final code:" {
            in_final = true;
            continue;
        }
        if !in_final {
            continue;
        }
        let Some((_, rest)) = line.split_once(": ") else {
            continue;
        };
        let mnemonic = rest.split_whitespace().next().expect("mnemonic");
        let op = Op::from_name(mnemonic)
            .unwrap_or_else(|| panic!("dump produced unknown mnemonic {mnemonic}"));
        assert_eq!(op.name(), mnemonic);
        seen += 1;
    }
    assert_eq!(seen, compiled.insts2.len());
}

#[test]
fn every_mnemonic_round_trips() {
    for op in Op::ALL {
        assert_eq!(Op::from_name(op.name()), Some(*op));
    }
}

#[test]
fn dumped_program_still_runs() {
    let compiled = sample_body();
    let _ = compiled.dump();
    assert_eq!(
        run_compiled(&compiled, &[Val::Count(5)]).value,
        Some(Val::Count(15))
    );
    assert_eq!(
        run_compiled(&compiled, &[Val::Count(2)]).value,
        Some(Val::Count(0))
    );
}
