// Integration tests for rfactor.
//
// A factored reduction must produce exactly what the original reduction
// produces: both versions are lowered, interpreted on the same input, and
// compared against a reference computed directly.

use lnc::interp::{Buffer, Interpreter};
use lnc::ir::{Expr, Type};
use lnc::*;

fn input() -> Buffer {
    Buffer::from_fn(Type::i32(), &[4, 8], |c| ((c[0] * 13 + c[1] * 7) % 19 - 9) as f64)
}

/// `f(x) = x; f(x) += in(r.x, r.y)` over `r` in [0, 4) x [0, 8).
fn sum_pipeline() -> (Pipeline, FuncId, RDom) {
    let mut p = Pipeline::new();
    let im = p.image_param("in", Type::i32(), 2).unwrap();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
    let r = RDom::new("r", [(0, 4), (0, 8)]);
    p.sum_into(f, vec![x.expr()], im.at(vec![r.x().expr(), r.y().expr()]), &r)
        .unwrap();
    (p, f, r)
}

fn lower_and_run(p: &Pipeline, f: FuncId, extent: i64) -> (Module, Vec<f64>) {
    let args: Vec<Argument> = p.images().map(Argument::from).collect();
    let module = lower(p, &[f], &args, &LowerOptions::default(), Vec::new())
        .unwrap_or_else(|e| panic!("lowering failed: {}", e));
    let mut it = Interpreter::new();
    it.set_buffer("in", input());
    it.set_buffer("f", Buffer::new(Type::i32(), &[extent]));
    it.run(&module)
        .unwrap_or_else(|e| panic!("interpretation failed: {}\n{}", e, module.functions[0].body));
    let data = it.take_buffer("f").unwrap().data;
    (module, data)
}

fn reference(extent: i64) -> Vec<f64> {
    let b = input();
    let total: f64 = (0..8)
        .flat_map(|y| (0..4).map(move |x| (x, y)))
        .map(|(x, y)| b.get(&[x, y]).unwrap())
        .sum();
    (0..extent).map(|x| x as f64 + total).collect()
}

#[test]
fn unfactored_sum_matches_reference() {
    let (p, f, _) = sum_pipeline();
    let (_, out) = lower_and_run(&p, f, 5);
    assert_eq!(out, reference(5));
}

#[test]
fn factoring_the_outer_rvar_preserves_the_sum() {
    let (mut p, f, r) = sum_pipeline();
    let u = Var::new("u");
    let intm = p.stage(f, 1).unwrap().rfactor(&[(r.y(), u)]).unwrap();
    assert_eq!(p.function(intm).name, "f_intm");

    let (module, out) = lower_and_run(&p, f, 5);
    assert_eq!(out, reference(5));
    let body = module.entry().unwrap().body.to_string();
    assert!(body.contains("f_intm"), "{}", body);
}

#[test]
fn factoring_the_inner_rvar_preserves_the_sum() {
    let (mut p, f, r) = sum_pipeline();
    let v = Var::new("v");
    p.stage(f, 1).unwrap().rfactor(&[(r.x(), v)]).unwrap();
    let (_, out) = lower_and_run(&p, f, 3);
    assert_eq!(out, reference(3));
}

#[test]
fn split_rvar_can_be_factored() {
    let (mut p, f, r) = sum_pipeline();
    let mut s = p.stage(f, 1).unwrap();
    s.split(&r.y(), "ryo", "ryi", 4, TailStrategy::Auto).unwrap();
    let ryi = RVar::new(format!("{}.ryi", r.y().name()));
    let intm = s.rfactor(&[(ryi, Var::new("w"))]).unwrap();
    p.stage(intm, 0)
        .unwrap()
        .vectorize_by(&Var::new("w"), 4, TailStrategy::RoundUp)
        .unwrap();
    let (_, out) = lower_and_run(&p, f, 4);
    assert_eq!(out, reference(4));
}

#[test]
fn non_associative_update_cannot_be_factored() {
    let mut p = Pipeline::new();
    let x = Var::new("x");
    let r = RDom::new("r", [(0, 4)]);
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![Expr::int(0)]).unwrap();
    let prev = p.call(f, vec![x.expr()]).unwrap();
    // f = f * 2 + r: not a single associative operator.
    p.update_with_domain(f, vec![x.expr()], vec![prev * 2 + r.x().expr()], &r)
        .unwrap();
    let err = p
        .stage(f, 1)
        .unwrap()
        .rfactor(&[(r.x(), Var::new("u"))])
        .unwrap_err();
    assert_eq!(err.code(), Some("E0107"));
}
