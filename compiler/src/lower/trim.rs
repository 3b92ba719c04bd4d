// trim.rs - Trim loops to the range where they do something
//
// A statement is a no-op when it has no effect: an evaluate of a constant, a
// store of a value just loaded from the same element, or any let, branch,
// block or loop made only of those. No-ops are removed. A host loop whose
// body is a single guard comparing the loop variable against loop-invariant
// limits is shrunk to the range where the guard can hold; the guard stays,
// so trimming only drops iterations that would have done nothing.

use std::collections::BTreeSet;

use tracing::trace;

use crate::error::Result;
use crate::ir::{
    expr_uses_vars, mutate_stmt_children, simplify, CmpOp, DeviceApi, Expr, ExprNode, ForType,
    IrMutator, Stmt, StmtNode,
};

use super::pass::{LowerContext, LoweringPass};

pub(crate) fn is_no_op(s: &Stmt) -> bool {
    match s.node() {
        StmtNode::NoOp => true,
        StmtNode::Evaluate { value } => value.is_const(),
        StmtNode::Store {
            name,
            value,
            index,
            predicate,
        } => matches!(
            value.node(),
            ExprNode::Load { name: n, index: i, predicate: p, .. }
                if n == name && i == index && p == predicate
        ),
        StmtNode::Block { first, rest } => is_no_op(first) && is_no_op(rest),
        StmtNode::LetStmt { body, .. } => is_no_op(body),
        StmtNode::IfThenElse {
            then_case,
            else_case,
            ..
        } => is_no_op(then_case) && else_case.as_ref().map_or(true, is_no_op),
        StmtNode::For { body, .. } => is_no_op(body),
        _ => false,
    }
}

// ── Loop ranges ────────────────────────────────────────────────────────────

/// Limits on `var` implied by `cond`: (lower bounds, upper bounds), both
/// inclusive. Only conjuncts whose other side avoids `avoid` count.
fn limits(cond: &Expr, var: &str, avoid: &BTreeSet<String>, lo: &mut Vec<Expr>, hi: &mut Vec<Expr>) {
    let cond = cond.as_likely().unwrap_or(cond);
    match cond.node() {
        ExprNode::And { a, b } => {
            limits(a, var, avoid, lo, hi);
            limits(b, var, avoid, lo, hi);
        }
        ExprNode::Cmp { op, a, b } => {
            let (op, other) = if a.as_variable() == Some(var) {
                (*op, b)
            } else if b.as_variable() == Some(var) {
                let flipped = match op {
                    CmpOp::Lt => CmpOp::Gt,
                    CmpOp::Le => CmpOp::Ge,
                    CmpOp::Gt => CmpOp::Lt,
                    CmpOp::Ge => CmpOp::Le,
                    other => *other,
                };
                (flipped, a)
            } else {
                return;
            };
            if expr_uses_vars(other, avoid) {
                return;
            }
            match op {
                CmpOp::Lt => hi.push(other.clone() - 1),
                CmpOp::Le => hi.push(other.clone()),
                CmpOp::Gt => lo.push(other.clone() + 1),
                CmpOp::Ge => lo.push(other.clone()),
                CmpOp::Eq => {
                    lo.push(other.clone());
                    hi.push(other.clone());
                }
                CmpOp::Ne => {}
            }
        }
        _ => {}
    }
}

/// The loop `s` restricted to the iterations its guard allows, or `None`
/// when the body is not a single guard on the loop variable.
fn trim_loop(s: &Stmt) -> Option<Stmt> {
    let StmtNode::For {
        name,
        min,
        extent,
        for_type,
        device_api,
        body,
    } = s.node()
    else {
        return None;
    };
    if !matches!(for_type, ForType::Serial | ForType::Parallel)
        || !matches!(device_api, DeviceApi::None | DeviceApi::Host)
    {
        return None;
    }
    let mut avoid = BTreeSet::from([name.clone()]);
    let mut inner = body;
    while let StmtNode::LetStmt { name, body, .. } = inner.node() {
        avoid.insert(name.clone());
        inner = body;
    }
    let StmtNode::IfThenElse {
        condition,
        else_case: None,
        ..
    } = inner.node()
    else {
        return None;
    };
    let (mut lo, mut hi) = (Vec::new(), Vec::new());
    limits(condition, name, &avoid, &mut lo, &mut hi);
    if lo.is_empty() && hi.is_empty() {
        return None;
    }
    let new_min = lo.into_iter().fold(min.clone(), Expr::max);
    let new_max = hi
        .into_iter()
        .fold(min.clone() + extent.clone() - 1, Expr::min);
    let new_extent = Expr::max(new_max - new_min.clone() + 1, Expr::int(0));
    let (new_min, new_extent) = (simplify(&new_min), simplify(&new_extent));
    if new_min == *min && new_extent == *extent {
        return None;
    }
    trace!(var = %name, min = %new_min, extent = %new_extent, "trimmed loop");
    Some(Stmt::for_loop(
        name.clone(),
        new_min,
        new_extent,
        *for_type,
        *device_api,
        body.clone(),
    ))
}

struct Trim;

impl IrMutator for Trim {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        if is_no_op(&s) {
            return Stmt::no_op();
        }
        trim_loop(&s).unwrap_or(s)
    }
}

pub struct TrimNoOps;

impl LoweringPass for TrimNoOps {
    fn name(&self) -> &str {
        "trim_no_ops"
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        Ok(Trim.mutate_stmt(&stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Buffer, Interpreter};
    use crate::ir::Type;
    use crate::options::LowerOptions;

    fn trim(s: Stmt) -> Stmt {
        let mut ctx = LowerContext::new(LowerOptions::default());
        TrimNoOps.run(s, &mut ctx).unwrap()
    }

    fn store(buf: &str, value: Expr, index: Expr) -> Stmt {
        Stmt::store(buf, value, index, Expr::bool(true))
    }

    fn guarded_loop(cond: Expr, for_type: ForType, device_api: DeviceApi) -> Stmt {
        let x = Expr::var("x");
        let body = Stmt::if_then_else(Expr::likely(cond), store("f", x.clone() * 2, x), None);
        Stmt::for_loop("x", Expr::int(0), Expr::int(16), for_type, device_api, body)
    }

    #[test]
    fn guarded_loop_shrinks_to_its_guard() {
        let x = Expr::var("x");
        let cond = Expr::and(Expr::ge(x.clone(), Expr::int(4)), Expr::lt(x, Expr::int(10)));
        let out = trim(guarded_loop(cond, ForType::Serial, DeviceApi::None));
        assert!(out.to_string().starts_with("for (x, 4, 6)"), "{}", out);

        let mut it = Interpreter::new();
        it.set_buffer("f", Buffer::new(Type::i32(), &[16]));
        it.exec(&out).unwrap();
        let f = it.buffer("f").unwrap();
        assert_eq!(f.get(&[3]), Some(0.0));
        assert_eq!(f.get(&[4]), Some(8.0));
        assert_eq!(f.get(&[9]), Some(18.0));
        assert_eq!(f.get(&[10]), Some(0.0));
    }

    #[test]
    fn symbolic_limit_clamps_the_extent() {
        let x = Expr::var("x");
        let out = trim(guarded_loop(Expr::lt(x, Expr::var("n")), ForType::Parallel, DeviceApi::None));
        let text = out.to_string();
        assert!(text.starts_with("parallel (x, 0, "), "{}", text);
        assert!(text.contains('n'), "{}", text);

        let mut it = Interpreter::new();
        it.set_buffer("f", Buffer::new(Type::i32(), &[16]));
        it.set_scalar("n", crate::interp::Value::int(-3));
        it.exec(&out).unwrap();
        assert!(it.buffer("f").unwrap().data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn guard_on_a_let_keeps_the_loop() {
        let x = Expr::var("x");
        let t = Expr::var("t");
        let body = Stmt::let_stmt(
            "t",
            x.clone() * 2,
            Stmt::if_then_else(Expr::lt(t, Expr::int(4)), store("f", x.clone(), x), None),
        );
        let s = Stmt::for_loop("x", Expr::int(0), Expr::int(16), ForType::Serial, DeviceApi::None, body);
        assert_eq!(trim(s.clone()), s);
    }

    #[test]
    fn device_loops_are_left_alone() {
        let x = Expr::var("x");
        let s = guarded_loop(Expr::lt(x, Expr::int(4)), ForType::GpuBlock, DeviceApi::Cuda);
        assert_eq!(trim(s.clone()), s);
    }

    #[test]
    fn self_assignments_and_empty_loops_disappear() {
        let x = Expr::var("x");
        let copy = store("f", Expr::load(Type::i32(), "f", x.clone(), Expr::bool(true)), x.clone());
        let useful = store("g", x.clone(), x.clone());
        let s = Stmt::block_of([
            Stmt::for_loop("x", Expr::int(0), Expr::int(8), ForType::Serial, DeviceApi::None, copy),
            Stmt::evaluate(Expr::int(0)),
            Stmt::for_loop("x", Expr::int(0), Expr::int(8), ForType::Serial, DeviceApi::None, useful.clone()),
        ]);
        let out = trim(s);
        assert_eq!(
            out,
            Stmt::for_loop("x", Expr::int(0), Expr::int(8), ForType::Serial, DeviceApi::None, useful)
        );
        assert!(is_no_op(&Stmt::if_then_else(Expr::var("c"), Stmt::no_op(), None)));
    }
}
