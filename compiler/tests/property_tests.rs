// Property-based tests for compiler invariants.
//
// Three categories:
// 1. Loop transformations: a split (any factor, any legal tail strategy)
//    or a fuse computes exactly what the untransformed loop computes.
// 2. Reorder: applying the same reorder twice changes nothing.
// 3. Interval soundness: the bounds of an expression over a variable range
//    contain every value the expression takes on that range.
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use lnc::interp::{Buffer, Interpreter, Value};
use lnc::ir::{bounds_of_expr_in_scope, const_int_value, Expr, Interval, Scope, Type};
use lnc::*;
use proptest::prelude::*;

// ── Test helpers ────────────────────────────────────────────────────────────

fn run_1d(p: &Pipeline, f: FuncId, extent: i64) -> Vec<f64> {
    let m = lower(p, &[f], &[], &LowerOptions::default(), Vec::new())
        .unwrap_or_else(|e| panic!("lowering failed: {}", e));
    let mut it = Interpreter::new();
    it.set_buffer("f", Buffer::new(Type::i32(), &[extent]));
    it.run(&m)
        .unwrap_or_else(|e| panic!("interpretation failed: {}\n{}", e, m.functions[0].body));
    it.take_buffer("f").unwrap().data
}

fn run_2d(p: &Pipeline, f: FuncId, w: i64, h: i64) -> Vec<f64> {
    let m = lower(p, &[f], &[], &LowerOptions::default(), Vec::new())
        .unwrap_or_else(|e| panic!("lowering failed: {}", e));
    let mut it = Interpreter::new();
    it.set_buffer("f", Buffer::new(Type::i32(), &[w, h]));
    it.run(&m)
        .unwrap_or_else(|e| panic!("interpretation failed: {}\n{}", e, m.functions[0].body));
    it.take_buffer("f").unwrap().data
}

// ── Loop transformations ────────────────────────────────────────────────────

fn arb_tail() -> impl Strategy<Value = TailStrategy> {
    prop_oneof![Just(TailStrategy::GuardWithIf), Just(TailStrategy::ShiftInwards)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn split_preserves_values(extent in 1i64..24, factor in 1i32..9, tail in arb_tail()) {
        // ShiftInwards needs at least one full inner loop.
        prop_assume!(tail != TailStrategy::ShiftInwards || factor as i64 <= extent);

        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() * 7 + 3]).unwrap();
        p.stage(f, 0).unwrap().split(&x, "xo", "xi", factor, tail).unwrap();

        let expected: Vec<f64> = (0..extent).map(|x| (x * 7 + 3) as f64).collect();
        prop_assert_eq!(run_1d(&p, f, extent), expected);
    }

    #[test]
    fn fuse_preserves_values(w in 1i64..9, h in 1i64..9, split_first in any::<bool>()) {
        let mut p = Pipeline::new();
        let (x, y) = (Var::new("x"), Var::new("y"));
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr() * 100]).unwrap();
        let mut s = p.stage(f, 0).unwrap();
        if split_first {
            // Fuse the split halves back together: the inverse of the split.
            s.split(&x, "xo", "xi", 3, TailStrategy::GuardWithIf).unwrap();
            s.fuse("xi", "xo", "xf").unwrap();
        } else {
            s.fuse(&x, &y, "t").unwrap();
        }
        drop(s);

        let mut expected = Vec::new();
        for yy in 0..h {
            for xx in 0..w {
                expected.push((xx + yy * 100) as f64);
            }
        }
        prop_assert_eq!(run_2d(&p, f, w, h), expected);
    }
}

// ── Reorder ─────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn reorder_is_idempotent(perm in Just(vec![0usize, 1, 2]).prop_shuffle()) {
        let names = ["x", "y", "z"];
        let vars: Vec<Var> = names.iter().map(|n| Var::new(*n)).collect();
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        p.define(f, &vars, vec![vars[0].expr() + vars[1].expr() + vars[2].expr()]).unwrap();

        let order: Vec<&str> = perm.iter().map(|i| names[*i]).collect();
        let mut s = p.stage(f, 0).unwrap();
        s.reorder(&order).unwrap();
        let once = s.dims().unwrap();
        s.reorder(&order).unwrap();
        let twice = s.dims().unwrap();

        prop_assert_eq!(&once[..3], &order[..]);
        prop_assert_eq!(once, twice);
    }
}

// ── Interval soundness ──────────────────────────────────────────────────────

/// Integer expressions over one variable `x`. Products are by constants only
/// so values stay well inside 32 bits.
#[derive(Debug, Clone)]
enum Ast {
    X,
    Const(i64),
    Add(Box<Ast>, Box<Ast>),
    Sub(Box<Ast>, Box<Ast>),
    MulConst(Box<Ast>, i64),
    Min(Box<Ast>, Box<Ast>),
    Max(Box<Ast>, Box<Ast>),
}

impl Ast {
    fn expr(&self) -> Expr {
        match self {
            Ast::X => Expr::var("x"),
            Ast::Const(c) => Expr::int(*c),
            Ast::Add(a, b) => a.expr() + b.expr(),
            Ast::Sub(a, b) => a.expr() - b.expr(),
            Ast::MulConst(a, c) => a.expr() * Expr::int(*c),
            Ast::Min(a, b) => Expr::min(a.expr(), b.expr()),
            Ast::Max(a, b) => Expr::max(a.expr(), b.expr()),
        }
    }

    fn eval(&self, x: i64) -> i64 {
        match self {
            Ast::X => x,
            Ast::Const(c) => *c,
            Ast::Add(a, b) => a.eval(x) + b.eval(x),
            Ast::Sub(a, b) => a.eval(x) - b.eval(x),
            Ast::MulConst(a, c) => a.eval(x) * c,
            Ast::Min(a, b) => a.eval(x).min(b.eval(x)),
            Ast::Max(a, b) => a.eval(x).max(b.eval(x)),
        }
    }
}

fn arb_ast() -> impl Strategy<Value = Ast> {
    let leaf = prop_oneof![Just(Ast::X), (-9i64..10).prop_map(Ast::Const)];
    leaf.prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Ast::Add(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Ast::Sub(Box::new(a), Box::new(b))),
            (inner.clone(), -4i64..5).prop_map(|(a, c)| Ast::MulConst(Box::new(a), c)),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Ast::Min(Box::new(a), Box::new(b))),
            (inner.clone(), inner).prop_map(|(a, b)| Ast::Max(Box::new(a), Box::new(b))),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn bounds_contain_every_value(ast in arb_ast(), lo in -20i64..20, len in 0i64..16) {
        let hi = lo + len;
        let mut scope = Scope::new();
        scope.push("x", Interval::new(Expr::int(lo), Expr::int(hi)));
        let b = bounds_of_expr_in_scope(&ast.expr(), &scope);
        let min = b.min.as_ref().and_then(const_int_value);
        let max = b.max.as_ref().and_then(const_int_value);
        prop_assert!(min.is_some() && max.is_some(), "unbounded: {:?}", b);
        let (min, max) = (min.unwrap(), max.unwrap());

        let e = ast.expr();
        for x in lo..=hi {
            let v = ast.eval(x);
            prop_assert!(min <= v && v <= max, "{} at x={} is {}, outside [{}, {}]", e, x, v, min, max);

            // The interpreter agrees with the direct evaluation.
            let mut it = Interpreter::new();
            it.set_scalar("x", Value::int(x));
            prop_assert_eq!(it.eval(&e).unwrap().as_i64(), Some(v));
        }
    }
}
