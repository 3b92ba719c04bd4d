// Integration tests for stage scheduling primitives.
//
// Two halves:
// 1. Schedule shape: the dim list after split/fuse/reorder/tile, and the
//    error codes for illegal requests (a failed call leaves the schedule
//    untouched).
// 2. Semantics: a scheduled pipeline lowered and interpreted gives the
//    same output as the unscheduled one.

use lnc::func::{LoopLevel, OUTERMOST};
use lnc::interp::{Buffer, Interpreter};
use lnc::ir::{Expr, Type};
use lnc::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn two_d() -> (Pipeline, FuncId, Var, Var) {
    let mut p = Pipeline::new();
    let (x, y) = (Var::new("x"), Var::new("y"));
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr() * 10])
        .unwrap();
    (p, f, x, y)
}

fn dims(p: &mut Pipeline, f: FuncId, stage: usize) -> Vec<String> {
    p.stage(f, stage).unwrap().dims().unwrap()
}

fn code_of<T>(r: Result<T>) -> Option<&'static str> {
    match r {
        Ok(_) => None,
        Err(e) => e.code(),
    }
}

/// Lower `f`, run it on an output of `shape`, return the output data.
fn run(p: &Pipeline, f: FuncId, shape: &[i64], inputs: Vec<(&str, Buffer)>) -> Vec<f64> {
    let mut args: Vec<Argument> = p.params().map(Argument::from).collect();
    args.extend(p.images().map(Argument::from));
    let module = lower(p, &[f], &args, &LowerOptions::default(), Vec::new())
        .unwrap_or_else(|e| panic!("lowering failed: {}", e));
    let name = p.function(f).name.clone();
    let mut it = Interpreter::new();
    for (n, b) in inputs {
        it.set_buffer(n, b);
    }
    it.set_buffer(name.clone(), Buffer::new(Type::i32(), shape));
    it.run(&module)
        .unwrap_or_else(|e| panic!("interpretation failed: {}\n{}", e, module.functions[0].body));
    it.take_buffer(&name).unwrap().data
}

// ── Schedule shape ──────────────────────────────────────────────────────────

#[test]
fn split_replaces_dim_with_inner_and_outer() {
    let (mut p, f, x, _) = two_d();
    p.stage(f, 0)
        .unwrap()
        .split(&x, "xo", "xi", 4, TailStrategy::Auto)
        .unwrap();
    assert_eq!(dims(&mut p, f, 0), vec!["x.xi", "x.xo", "y", OUTERMOST]);
}

#[test]
fn split_errors() {
    let (mut p, f, x, y) = two_d();
    let mut s = p.stage(f, 0).unwrap();
    assert_eq!(code_of(s.split("z", "zo", "zi", 4, TailStrategy::Auto)), Some("E0101"));
    assert_eq!(code_of(s.split(&x, "y", "xi", 4, TailStrategy::Auto)), Some("E0102"));
    assert_eq!(code_of(s.split(&x, "a", "a", 4, TailStrategy::Auto)), Some("E0102"));
    assert_eq!(code_of(s.split(&y, "yo", "yi", 0, TailStrategy::Auto)), Some("E0103"));
    drop(s);
    // Nothing was committed.
    assert_eq!(dims(&mut p, f, 0), vec!["x", "y", OUTERMOST]);
}

#[test]
fn fuse_needs_adjacent_dims() {
    let (mut p, f, x, y) = two_d();
    let mut s = p.stage(f, 0).unwrap();
    assert_eq!(code_of(s.fuse(&y, &x, "t")), Some("E0105"));
    s.fuse(&x, &y, "t").unwrap();
    assert_eq!(s.dims().unwrap(), vec!["x.t", OUTERMOST]);
}

#[test]
fn reorder_permutes_named_dims() {
    let (mut p, f, x, y) = two_d();
    let mut s = p.stage(f, 0).unwrap();
    s.reorder(&[&y, &x]).unwrap();
    assert_eq!(s.dims().unwrap(), vec!["y", "x", OUTERMOST]);
    assert_eq!(code_of(s.reorder(&[&x, &x])), Some("E0106"));
    assert_eq!(s.dims().unwrap(), vec!["y", "x", OUTERMOST]);
}

#[test]
fn tile_puts_inners_inside_outers() {
    let (mut p, f, x, y) = two_d();
    p.stage(f, 0)
        .unwrap()
        .tile(&x, &y, "xo", "yo", "xi", "yi", 4, 2, TailStrategy::Auto)
        .unwrap();
    assert_eq!(
        dims(&mut p, f, 0),
        vec!["x.xi", "y.yi", "x.xo", "y.yo", OUTERMOST]
    );
}

#[test]
fn one_vectorized_dim_per_stage() {
    let (mut p, f, x, y) = two_d();
    let mut s = p.stage(f, 0).unwrap();
    s.vectorize(&x).unwrap();
    assert_eq!(code_of(s.vectorize(&y)), Some("E0109"));
}

#[test]
fn reduction_dims_are_protected() {
    let mut p = Pipeline::new();
    let input = p.image_param("in", Type::i32(), 1).unwrap();
    let x = Var::new("x");
    let r = RDom::new("r", [(0, 10)]);
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![Expr::int(0)]).unwrap();
    p.sum_into(f, vec![x.expr()], input.at(vec![r.x().expr()]), &r)
        .unwrap();

    let mut s = p.stage(f, 1).unwrap();
    // Splitting an rvar must not change its trip count.
    assert_eq!(
        code_of(s.split(&r.x(), "ro", "ri", 4, TailStrategy::RoundUp)),
        Some("E0104")
    );
    // Parallel reduction without atomic() races.
    assert_eq!(code_of(s.parallel(&r.x())), Some("E0108"));
    // ShiftInwards would recompute points of an update.
    assert_eq!(
        code_of(s.split(&x, "xo", "xi", 4, TailStrategy::ShiftInwards)),
        Some("E0104")
    );
    s.split(&r.x(), "ro", "ri", 4, TailStrategy::Auto).unwrap();
    assert!(s.dims().unwrap().iter().any(|d| d.ends_with(".ri")));
}

#[test]
fn stage_index_out_of_range() {
    let (mut p, f, _, _) = two_d();
    assert_eq!(code_of(p.stage(f, 3)), Some("E0207"));
}

// ── Semantics ───────────────────────────────────────────────────────────────

fn one_d(tail: Option<TailStrategy>) -> (Pipeline, FuncId) {
    let mut p = Pipeline::new();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr() * 3 + 1]).unwrap();
    if let Some(tail) = tail {
        p.stage(f, 0)
            .unwrap()
            .split(&x, "xo", "xi", 4, tail)
            .unwrap();
    }
    (p, f)
}

#[test]
fn tail_strategies_compute_the_same_values() {
    let expected: Vec<f64> = (0..10).map(|x| (x * 3 + 1) as f64).collect();
    let (p, f) = one_d(None);
    assert_eq!(run(&p, f, &[10], vec![]), expected);
    for tail in [TailStrategy::GuardWithIf, TailStrategy::ShiftInwards] {
        let (p, f) = one_d(Some(tail));
        assert_eq!(run(&p, f, &[10], vec![]), expected, "{:?}", tail);
    }
}

#[test]
fn tiled_and_fused_schedules_agree() {
    let (p, f, _, _) = two_d();
    let expected = run(&p, f, &[8, 6], vec![]);

    let (mut p, f, x, y) = two_d();
    p.stage(f, 0)
        .unwrap()
        .tile(&x, &y, "xo", "yo", "xi", "yi", 4, 3, TailStrategy::GuardWithIf)
        .unwrap();
    assert_eq!(run(&p, f, &[8, 6], vec![]), expected);

    let (mut p, f, x, y) = two_d();
    p.stage(f, 0).unwrap().fuse(&x, &y, "t").unwrap();
    assert_eq!(run(&p, f, &[8, 6], vec![]), expected);
}

#[test]
fn compute_at_matches_compute_root() {
    let build = |at: bool| {
        let mut p = Pipeline::new();
        let input = p.image_param("in", Type::i32(), 1).unwrap();
        let x = Var::new("x");
        let g = p.func("g").unwrap();
        p.define(g, &[x.clone()], vec![input.at(vec![x.expr()]) * 2])
            .unwrap();
        let f = p.func("f").unwrap();
        let v = p.call(g, vec![x.expr()]).unwrap() + p.call(g, vec![x.expr() + 1]).unwrap();
        p.define(f, &[x.clone()], vec![v]).unwrap();
        p.stage(f, 0)
            .unwrap()
            .split(&x, "xo", "xi", 4, TailStrategy::GuardWithIf)
            .unwrap();
        if at {
            let level = p.at(f, "xo");
            p.compute_at(g, level);
        } else {
            p.compute_root(g);
        }
        (p, f)
    };
    let input = || Buffer::from_fn(Type::i32(), &[16], |c| (c[0] * c[0] % 7) as f64);
    let expected: Vec<f64> = (0..10)
        .map(|x| (2 * (x * x % 7) + 2 * ((x + 1) * (x + 1) % 7)) as f64)
        .collect();

    let (p, f) = build(false);
    assert_eq!(run(&p, f, &[10], vec![("in", input())]), expected);
    let (p, f) = build(true);
    assert_eq!(run(&p, f, &[10], vec![("in", input())]), expected);
}

// ── compute_with and reorder ────────────────────────────────────────────────

/// `h(x, y) = f(x, y) + g(x, y)` with `f` and `g` at root and `g`'s loops
/// fused into `f`'s down to `f.y`.
fn fused_pair() -> (Pipeline, FuncId, FuncId) {
    let mut p = Pipeline::new();
    let (x, y) = (Var::new("x"), Var::new("y"));
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr() * 10])
        .unwrap();
    let g = p.func("g").unwrap();
    p.define(g, &[x.clone(), y.clone()], vec![x.expr() * 3 - y.expr()])
        .unwrap();
    let h = p.func("h").unwrap();
    let args = vec![x.expr(), y.expr()];
    let v = p.call(f, args.clone()).unwrap() + p.call(g, args).unwrap();
    p.define(h, &[x, y], vec![v]).unwrap();
    p.compute_root(f).compute_root(g);
    p.stage(g, 0)
        .unwrap()
        .compute_with(LoopLevel::at_stage("f", 0, "y"), &[])
        .unwrap();
    (p, g, h)
}

fn pin(p: &Pipeline, f: FuncId) -> Option<String> {
    let def = p.function(f).definition(0)?;
    def.schedule.fuse_level.level.var().map(str::to_string)
}

fn fused_reference(w: i64, h: i64) -> Vec<f64> {
    let mut out = Vec::new();
    for y in 0..h {
        for x in 0..w {
            out.push(((x + y * 10) + (x * 3 - y)) as f64);
        }
    }
    out
}

#[test]
fn compute_with_values_match() {
    let (p, _, h) = fused_pair();
    assert_eq!(run(&p, h, &[4, 4], vec![]), fused_reference(4, 4));
}

#[test]
fn reorder_keeps_the_compute_with_depth() {
    let (mut p, g, h) = fused_pair();
    assert_eq!(pin(&p, g).as_deref(), Some("y"));

    // `y` sat at position 1; after the swap `x` occupies that slot.
    p.stage(g, 0).unwrap().reorder(&["y", "x"]).unwrap();
    assert_eq!(dims(&mut p, g, 0), vec!["y", "x", OUTERMOST]);
    assert_eq!(pin(&p, g).as_deref(), Some("x"));
    assert_eq!(run(&p, h, &[4, 4], vec![]), fused_reference(4, 4));
}

#[test]
fn reorder_of_unpinned_dims_leaves_the_pin() {
    let (mut p, g, _) = fused_pair();
    p.stage(g, 0)
        .unwrap()
        .split("x", "xo", "xi", 2, TailStrategy::GuardWithIf)
        .unwrap()
        .reorder(&["xo", "xi"])
        .unwrap();
    assert_eq!(pin(&p, g).as_deref(), Some("y"));
}

#[test]
fn compute_with_rejects_itself_and_unknown_loops() {
    let (mut p, g, _) = fused_pair();
    let mut s = p.stage(g, 0).unwrap();
    assert_eq!(
        code_of(s.compute_with(LoopLevel::at_stage("g", 0, "x"), &[])),
        Some("E0112")
    );
    assert_eq!(
        code_of(s.compute_with(LoopLevel::at_stage("f", 0, "zz"), &[])),
        Some("E0101")
    );
    drop(s);
    assert_eq!(pin(&p, g).as_deref(), Some("y"));
}

// ── Associativity gates ─────────────────────────────────────────────────────

/// `f(x) = 0` followed by an update folding `in(r.x, r.y)` into `f(x)`
/// with `op`.
fn two_rvar_update(op: fn(Expr, Expr) -> Expr) -> (Pipeline, FuncId) {
    let mut p = Pipeline::new();
    let input = p.image_param("in", Type::i32(), 2).unwrap();
    let x = Var::new("x");
    let r = RDom::new("r", [(0, 4), (0, 3)]);
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![Expr::int(0)]).unwrap();
    let value = op(
        p.call(f, vec![x.expr()]).unwrap(),
        input.at(vec![r.x().expr() + x.expr(), r.y().expr()]),
    );
    p.update_with_domain(f, vec![x.expr()], vec![value], &r).unwrap();
    (p, f)
}

#[test]
fn reordering_rvars_needs_a_commutative_update() {
    let (mut p, f) = two_rvar_update(|a, b| a - b);
    let before = dims(&mut p, f, 1);
    assert_eq!(
        code_of(p.stage(f, 1).unwrap().reorder(&["r$y", "r$x"])),
        Some("E0107")
    );
    assert_eq!(dims(&mut p, f, 1), before);
    // Listing the rvars in their current order moves nothing.
    p.stage(f, 1).unwrap().reorder(&["r$x", "r$y"]).unwrap();

    let (mut p, f) = two_rvar_update(|a, b| a + b);
    p.stage(f, 1).unwrap().reorder(&["r$y", "r$x"]).unwrap();
    assert_eq!(&dims(&mut p, f, 1)[..2], &["r$y", "r$x"]);
}

#[test]
fn reordered_sum_matches_the_original_order() {
    let input = || Buffer::from_fn(Type::i32(), &[8, 3], |c| (c[0] * 3 + c[1] * 5) as f64);
    let (p, f) = two_rvar_update(|a, b| a + b);
    let expected = run(&p, f, &[4], vec![("in", input())]);
    let (mut p, f) = two_rvar_update(|a, b| a + b);
    p.stage(f, 1).unwrap().reorder(&["r$y", "r$x"]).unwrap();
    assert_eq!(run(&p, f, &[4], vec![("in", input())]), expected);
}

// ── Atomic updates ──────────────────────────────────────────────────────────

#[test]
fn atomic_parallel_histogram() {
    let mut p = Pipeline::new();
    let input = p.image_param("in", Type::i32(), 1).unwrap();
    let b = Var::new("b");
    let r = RDom::new("r", [(0, 16)]);
    let h = p.func("h").unwrap();
    p.define(h, &[b.clone()], vec![Expr::int(0)]).unwrap();
    let bin = Expr::min(Expr::max(input.at(vec![r.x().expr()]), Expr::int(0)), Expr::int(7));
    p.sum_into(h, vec![bin], Expr::int(1), &r).unwrap();
    p.stage(h, 1)
        .unwrap()
        .atomic(false)
        .unwrap()
        .parallel(&r.x())
        .unwrap();

    let args = vec![Argument::from(&input)];
    let m = lower(&p, &[h], &args, &LowerOptions::default(), Vec::new()).unwrap();
    let body = m.entry().unwrap().body.to_string();
    let parallel = body.find("parallel (h.s1.r$x").unwrap_or_else(|| panic!("{}", body));
    let atomic = body.find("atomic {").unwrap_or_else(|| panic!("{}", body));
    assert!(parallel < atomic, "{}", body);

    let data = |c: &[i64]| (c[0] * 5 % 11) as f64;
    let mut expected = vec![0.0; 8];
    for i in 0..16 {
        expected[(data(&[i]) as usize).min(7)] += 1.0;
    }
    let got = run(&p, h, &[8], vec![("in", Buffer::from_fn(Type::i32(), &[16], data))]);
    assert_eq!(got, expected);
}

// ── Specialization ──────────────────────────────────────────────────────────

/// `f(x) = x * k` for a scalar parameter `k`.
fn scaled() -> (Pipeline, FuncId, Param, Var) {
    let mut p = Pipeline::new();
    let k = p.param("k", Type::i32()).unwrap();
    let x = Var::new("x");
    let f = p.func("f").unwrap();
    p.define(f, &[x.clone()], vec![x.expr() * k.expr()]).unwrap();
    (p, f, k, x)
}

fn run_scaled(p: &Pipeline, f: FuncId, k: &Param, value: i64) -> Result<Vec<f64>> {
    let args = vec![Argument::from(k)];
    let m = lower(p, &[f], &args, &LowerOptions::default(), Vec::new())?;
    let mut it = Interpreter::new();
    it.set_scalar("k", lnc::interp::Value::int(value));
    it.set_buffer("f", Buffer::new(Type::i32(), &[6]));
    it.run(&m)?;
    Ok(it.take_buffer("f").unwrap().data)
}

#[test]
fn specialization_lowers_to_a_branch() {
    let (mut p, f, k, x) = scaled();
    p.stage(f, 0)
        .unwrap()
        .specialize(Expr::eq(k.expr(), Expr::int(1)))
        .unwrap()
        .split(&x, "xo", "xi", 4, TailStrategy::GuardWithIf)
        .unwrap();
    // The generic stage is untouched.
    assert_eq!(dims(&mut p, f, 0), vec!["x", OUTERMOST]);

    let args = vec![Argument::from(&k)];
    let m = lower(&p, &[f], &args, &LowerOptions::default(), Vec::new()).unwrap();
    let body = m.entry().unwrap().body.to_string();
    assert!(body.contains("} else {"), "{}", body);
    assert!(body.contains("f.s0.x.xo"), "{}", body);

    for value in [1, 3] {
        let expected: Vec<f64> = (0..6).map(|i| (i * value) as f64).collect();
        assert_eq!(run_scaled(&p, f, &k, value).unwrap(), expected, "k = {}", value);
    }
}

#[test]
fn specialize_fail_reports_at_run_time() {
    let (mut p, f, k, _) = scaled();
    p.stage(f, 0)
        .unwrap()
        .specialize(Expr::gt(k.expr(), Expr::int(0)))
        .unwrap();
    p.stage(f, 0).unwrap().specialize_fail("k must be positive").unwrap();
    // No specialization may follow the failure case.
    assert_eq!(
        code_of(p.stage(f, 0).unwrap().specialize(Expr::eq(k.expr(), Expr::int(7)))),
        Some("E0111")
    );

    assert_eq!(run_scaled(&p, f, &k, 2).unwrap(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    let err = run_scaled(&p, f, &k, 0).unwrap_err();
    assert_eq!(err.code(), Some("E0601"));
    assert!(err.to_string().contains("k must be positive"), "{}", err);
}

#[test]
fn specialization_conditions_may_not_use_dims() {
    let (mut p, f, k, x) = scaled();
    let mut s = p.stage(f, 0).unwrap();
    assert_eq!(code_of(s.specialize(Expr::lt(x.expr(), Expr::int(4)))), Some("E0111"));
    assert_eq!(code_of(s.specialize(k.expr())), Some("E0111"));
    assert_eq!(code_of(s.specialize_fail("")), Some("E0111"));
    drop(s);
    assert!(p.function(f).definition(0).unwrap().specializations.is_empty());
}

#[test]
fn compute_with_rejects_specialized_stages() {
    // The stage being fused into is specialized.
    let (mut p, g, _) = fused_pair();
    let f = p.id_of("f").unwrap();
    let gate = Expr::gt(Expr::var("n"), Expr::int(0));
    p.stage(f, 0).unwrap().specialize(gate.clone()).unwrap();
    assert_eq!(
        code_of(p.stage(g, 0).unwrap().compute_with(LoopLevel::at_stage("f", 0, "y"), &[])),
        Some("E0112")
    );

    // The fused stage itself is specialized.
    let (mut p, g, _) = fused_pair();
    p.stage(g, 0).unwrap().specialize(gate).unwrap();
    assert_eq!(
        code_of(p.stage(g, 0).unwrap().compute_with(LoopLevel::at_stage("f", 0, "x"), &[])),
        Some("E0112")
    );
}
