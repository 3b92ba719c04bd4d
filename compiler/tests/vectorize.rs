// Integration tests for the vectorize pass.
//
// The pass is driven directly on hand-built loops for the shape of its
// output, and end to end through `lower` for agreement with scalar code on
// divergent control flow, both on a plain host (scalarization) and on a
// target with masked stores (predication).

use lnc::demos::Demo;
use lnc::interp::{Buffer, Interpreter};
use lnc::ir::{DeviceApi, Expr, ForType, Stmt, Type};
use lnc::lower::vectorize::Vectorize;
use lnc::lower::LowerContext;
use lnc::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn load(buf: &str, index: Expr) -> Expr {
    Expr::load(Type::i32(), buf, index, Expr::bool(true))
}

fn vloop(extent: Expr, body: Stmt) -> Stmt {
    Stmt::for_loop("x", Expr::int(0), extent, ForType::Vectorized, DeviceApi::None, body)
}

fn vectorize(s: Stmt, target: &str) -> Result<Stmt> {
    let mut ctx = LowerContext::new(LowerOptions::for_target(target.parse().unwrap()));
    Vectorize.run(s, &mut ctx)
}

fn interpret(s: &Stmt, a: &[i64]) -> Vec<f64> {
    let mut it = Interpreter::new();
    let n = a.len() as i64;
    it.set_buffer("a", Buffer::from_fn(Type::i32(), &[n], |c| a[c[0] as usize] as f64));
    it.set_buffer("c", Buffer::new(Type::i32(), &[n]));
    it.exec(s).unwrap_or_else(|e| panic!("{}\n{}", e, s));
    it.take_buffer("c").unwrap().data
}

// ── Shape ───────────────────────────────────────────────────────────────────

#[test]
fn constant_extent_becomes_a_full_width_ramp() {
    let x = Expr::var("x");
    let body = Stmt::store("c", load("a", x.clone()) * 2, x, Expr::bool(true));
    let out = vectorize(vloop(Expr::int(8), body), "host").unwrap();
    let text = out.to_string();
    assert!(text.contains("ramp(0, 1, 8)"), "{}", text);
    assert!(!text.contains("for ("), "{}", text);
}

#[test]
fn unit_or_symbolic_extent_is_an_error() {
    let x = Expr::var("x");
    let body = Stmt::store("c", x.clone(), x, Expr::bool(true));
    for extent in [Expr::int(1), Expr::var("n")] {
        let err = vectorize(vloop(extent, body.clone()), "host").unwrap_err();
        assert_eq!(err.code(), Some("E0401"));
    }
}

#[test]
fn serial_loops_are_left_alone() {
    let x = Expr::var("x");
    let s = Stmt::for_loop(
        "x",
        Expr::int(0),
        Expr::int(8),
        ForType::Serial,
        DeviceApi::None,
        Stmt::store("c", x.clone(), x, Expr::bool(true)),
    );
    assert_eq!(vectorize(s.clone(), "host").unwrap(), s);
}

// ── Agreement with scalar code ──────────────────────────────────────────────

fn abs_loop(for_type: ForType) -> Stmt {
    let x = Expr::var("x");
    let a = load("a", x.clone());
    Stmt::for_loop(
        "x",
        Expr::int(0),
        Expr::int(8),
        for_type,
        DeviceApi::None,
        Stmt::if_then_else(
            Expr::gt(a.clone(), Expr::int(0)),
            Stmt::store("c", a.clone(), x.clone(), Expr::bool(true)),
            Some(Stmt::store("c", Expr::int(0) - a, x, Expr::bool(true))),
        ),
    )
}

#[test]
fn divergent_branch_matches_scalar_loop() {
    let a = [3, -1, 0, 7, -8, 2, -2, 5];
    let expected = interpret(&abs_loop(ForType::Serial), &a);
    assert_eq!(expected, vec![3.0, 1.0, 0.0, 7.0, 8.0, 2.0, 2.0, 5.0]);
    for target in ["host", "hexagon-32-noos-hvx"] {
        let v = vectorize(abs_loop(ForType::Vectorized), target).unwrap();
        assert_eq!(interpret(&v, &a), expected, "{}\n{}", target, v);
    }
}

#[test]
fn divergent_demo_matches_reference() {
    let reference = |v: i64| if v > 0 { v } else { -v };
    for target in ["host", "hexagon-32-noos-hvx"] {
        let demo = Demo::by_name("divergent").unwrap().unwrap();
        let options = LowerOptions::for_target(target.parse().unwrap());
        let module = lower(&demo.pipeline, &demo.outputs, &demo.args, &options, Vec::new())
            .unwrap_or_else(|e| panic!("{}: {}", target, e));

        let mut it = Interpreter::new();
        demo.bind(&mut it);
        let input: Vec<i64> = it
            .buffer("input")
            .unwrap()
            .data
            .iter()
            .map(|v| *v as i64)
            .collect();
        it.run(&module)
            .unwrap_or_else(|e| panic!("{}: {}\n{}", target, e, module.functions[0].body));
        let out = it.take_buffer("out").unwrap().data;
        let expected: Vec<f64> = input.iter().map(|v| reference(*v) as f64).collect();
        assert_eq!(out, expected, "{}", target);
    }
}
