// vectorize.rs - Replace vectorized loops by vector arithmetic
//
// A `Vectorized` loop of constant extent `n` disappears: its variable is
// replaced by `ramp(min, 1, n)` and every expression that depends on it is
// widened lane by lane. Constructs that have no vector form are handled in
// one of three ways:
//
//   * predication: on targets with masked loads and stores, a branch on a
//     vector condition that only moves data runs unconditionally with the
//     condition folded into the store and load predicates;
//   * the all-lanes fast path: a `likely` vector condition is first tested
//     on all lanes at once (using the lane bounds of the condition) and the
//     vector branch runs when every lane agrees;
//   * scalarization: the statement is copied once per lane with every
//     vector-valued variable replaced by its scalar lane value.
//
// Allocations inside the loop get an innermost dimension of `n` lanes so
// that each lane keeps its own copy of the buffer.

use std::collections::BTreeMap;

use crate::diag::{codes, Diagnostic};
use crate::error::{Error, Result};
use crate::ir::{
    mutate_expr_children, mutate_stmt_children, simplify, stmt_uses_var, substitute_map_stmt,
    substitute_stmt, BinOp, CmpOp, Expr, ExprNode, ForType, IrMutator, Scope, Stmt, StmtNode,
    Type,
};
use crate::target::Target;

use super::pass::{LowerContext, LoweringPass};

// ── Lane bounds ────────────────────────────────────────────────────────────

/// Scalar bounds over every lane of a vector expression. For booleans `min`
/// holds when all lanes are true and `max` when any lane is.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LaneBounds {
    pub min: Expr,
    pub max: Expr,
}

impl LaneBounds {
    fn point(e: Expr) -> Self {
        LaneBounds {
            min: e.clone(),
            max: e,
        }
    }

    fn new(min: Expr, max: Expr) -> Self {
        LaneBounds { min, max }
    }
}

fn extract_lane(e: &Expr, lane: u16) -> Expr {
    Expr::shuffle(vec![e.clone()], vec![lane])
}

/// The fallback: reduce the lanes one by one.
fn reduce_lanes(e: &Expr) -> LaneBounds {
    let lanes = e.ty().lanes;
    let boolean = e.ty().is_bool();
    let first = extract_lane(e, 0);
    let mut out = LaneBounds::point(first);
    for i in 1..lanes {
        let lane = extract_lane(e, i);
        out = if boolean {
            LaneBounds::new(Expr::and(out.min, lane.clone()), Expr::or(out.max, lane))
        } else {
            LaneBounds::new(Expr::min(out.min, lane.clone()), Expr::max(out.max, lane))
        };
    }
    out
}

fn broadcast_sign(e: &Expr) -> Option<f64> {
    match e.node() {
        ExprNode::Broadcast { value, .. } => value.as_float(),
        _ => None,
    }
}

/// Casts that keep the order of their operand.
fn is_monotonic_cast(to: Type, from: Type) -> bool {
    to.is_float() || (to.code == from.code && to.bits >= from.bits)
}

/// `vector_vars` maps the name a vector variable carries in the widened IR
/// to the prefix of its `.min_lane` / `.max_lane` symbols.
pub(crate) fn lane_bounds(e: &Expr, vector_vars: &BTreeMap<String, String>) -> LaneBounds {
    let ty = e.ty();
    if ty.is_scalar() {
        return LaneBounds::point(e.clone());
    }
    let elem = ty.element_of();
    let of = |x: &Expr| lane_bounds(x, vector_vars);
    match e.node() {
        ExprNode::Broadcast { value, .. } => LaneBounds::point(value.clone()),
        ExprNode::Ramp {
            base,
            stride,
            lanes,
        } => {
            let last = base.clone() + stride.clone() * Expr::make_const(stride.ty(), *lanes as i64 - 1);
            match stride.as_float() {
                Some(s) if s >= 0.0 => LaneBounds::new(base.clone(), last),
                Some(_) => LaneBounds::new(last, base.clone()),
                None => LaneBounds::new(
                    Expr::min(base.clone(), last.clone()),
                    Expr::max(base.clone(), last),
                ),
            }
        }
        ExprNode::Variable { name, .. } => match vector_vars.get(name) {
            Some(prefix) => LaneBounds::new(
                Expr::var_of(elem, format!("{}.min_lane", prefix)),
                Expr::var_of(elem, format!("{}.max_lane", prefix)),
            ),
            None => reduce_lanes(e),
        },
        ExprNode::Binary { op, a, b } => {
            let (x, y) = (of(a), of(b));
            match op {
                BinOp::Add => LaneBounds::new(x.min + y.min, x.max + y.max),
                BinOp::Sub => LaneBounds::new(x.min - y.max, x.max - y.min),
                BinOp::Mul | BinOp::Div => match broadcast_sign(b) {
                    Some(k) if k > 0.0 || (k == 0.0 && *op == BinOp::Mul) => LaneBounds::new(
                        Expr::binary(*op, x.min, y.min),
                        Expr::binary(*op, x.max, y.max),
                    ),
                    Some(k) if k < 0.0 => LaneBounds::new(
                        Expr::binary(*op, x.max, y.min),
                        Expr::binary(*op, x.min, y.max),
                    ),
                    _ => reduce_lanes(e),
                },
                BinOp::Min => LaneBounds::new(Expr::min(x.min, y.min), Expr::min(x.max, y.max)),
                BinOp::Max => LaneBounds::new(Expr::max(x.min, y.min), Expr::max(x.max, y.max)),
                BinOp::Mod => reduce_lanes(e),
            }
        }
        ExprNode::And { a, b } => {
            let (x, y) = (of(a), of(b));
            LaneBounds::new(Expr::and(x.min, y.min), Expr::and(x.max, y.max))
        }
        ExprNode::Or { a, b } => {
            let (x, y) = (of(a), of(b));
            LaneBounds::new(Expr::or(x.min, y.min), Expr::or(x.max, y.max))
        }
        ExprNode::Not { a } => {
            let x = of(a);
            LaneBounds::new(Expr::not(x.max), Expr::not(x.min))
        }
        ExprNode::Cmp { op, a, b } => {
            let (x, y) = (of(a), of(b));
            match op {
                CmpOp::Lt => LaneBounds::new(Expr::lt(x.max, y.min), Expr::lt(x.min, y.max)),
                CmpOp::Le => LaneBounds::new(Expr::le(x.max, y.min), Expr::le(x.min, y.max)),
                CmpOp::Gt => LaneBounds::new(Expr::gt(x.min, y.max), Expr::gt(x.max, y.min)),
                CmpOp::Ge => LaneBounds::new(Expr::ge(x.min, y.max), Expr::ge(x.max, y.min)),
                CmpOp::Eq | CmpOp::Ne => reduce_lanes(e),
            }
        }
        ExprNode::Let { name, value, body } => {
            if value.ty().is_scalar() {
                let b = of(body);
                return LaneBounds::new(
                    Expr::let_in(name.clone(), value.clone(), b.min),
                    Expr::let_in(name.clone(), value.clone(), b.max),
                );
            }
            let v = of(value);
            let mut inner = vector_vars.clone();
            inner.insert(name.clone(), name.clone());
            let b = lane_bounds(body, &inner);
            let wrap = |x: Expr| {
                let x = Expr::let_in(format!("{}.max_lane", name), v.max.clone(), x);
                let x = Expr::let_in(format!("{}.min_lane", name), v.min.clone(), x);
                Expr::let_in(name.clone(), value.clone(), x)
            };
            LaneBounds::new(wrap(b.min), wrap(b.max))
        }
        ExprNode::Cast { ty, value } if is_monotonic_cast(*ty, value.ty()) => {
            let x = of(value);
            LaneBounds::new(Expr::cast(elem, x.min), Expr::cast(elem, x.max))
        }
        ExprNode::Call { args, .. } if e.as_likely().is_some() => of(&args[0]),
        _ => reduce_lanes(e),
    }
}

// ── Vector substitution ────────────────────────────────────────────────────

fn widen(e: Expr, lanes: u16) -> Expr {
    if e.ty().lanes == lanes {
        e
    } else {
        Expr::broadcast(e, lanes)
    }
}

/// A vector-valued binding in scope: its name in the widened IR and type.
#[derive(Debug, Clone)]
struct VectorBinding {
    widened: String,
    ty: Type,
}

struct VectorSubs<'a> {
    var: String,
    /// The loop's `min`, for scalar lane copies.
    base: Expr,
    lanes: u16,
    target: &'a Target,
    /// `None` marks a scalar binding that shadows a vector one.
    scope: Scope<Option<VectorBinding>>,
    /// Widened name to original name, for lane-bound symbols.
    lane_names: BTreeMap<String, String>,
    /// Allocations that gained a lanes dimension.
    widened_allocs: Scope<()>,
    /// Set when an impure call receives vector arguments.
    impure: bool,
}

impl VectorSubs<'_> {
    fn replacement(&self) -> Expr {
        Expr::ramp(self.base.clone(), Expr::int(1), self.lanes)
    }

    fn bounds(&self, e: &Expr) -> LaneBounds {
        lane_bounds(e, &self.lane_names)
    }

    fn lane_index(&self, index: Expr) -> Expr {
        let lanes = self.lanes as i64;
        index * Expr::int(lanes) + Expr::ramp(Expr::int(0), Expr::int(1), self.lanes)
    }

    fn vector_bindings(&self) -> Vec<(String, VectorBinding)> {
        self.scope
            .names()
            .filter_map(|n| match self.scope.get(n) {
                Some(Some(b)) => Some((n.to_string(), b.clone())),
                _ => None,
            })
            .collect()
    }

    fn bind_vector(&mut self, name: &str, ty: Type) -> String {
        let widened = format!("{}.x{}", name, ty.lanes);
        self.scope.push(
            name,
            Some(VectorBinding {
                widened: widened.clone(),
                ty,
            }),
        );
        self.lane_names.insert(widened.clone(), name.to_string());
        widened
    }

    /// Mutate `s`, falling back to per-lane copies when a piece of it has no
    /// vector form.
    fn vectorize_or_scalarize(&mut self, s: &Stmt, f: impl FnOnce(&mut Self) -> Stmt) -> Stmt {
        let saved = std::mem::replace(&mut self.impure, false);
        let out = f(self);
        let impure = std::mem::replace(&mut self.impure, saved);
        if impure {
            self.scalarize(s)
        } else {
            out
        }
    }

    /// One copy of `s` per lane, in lane order.
    fn scalarize(&mut self, s: &Stmt) -> Stmt {
        let bindings = self.vector_bindings();
        let widened: Vec<String> = self.widened_allocs.names().map(String::from).collect();
        let mut copies = Vec::with_capacity(self.lanes as usize);
        for lane in 0..self.lanes {
            let mut map = BTreeMap::new();
            map.insert(self.var.clone(), simplify(&(self.base.clone() + Expr::int(lane as i64))));
            for (name, b) in &bindings {
                map.insert(
                    name.clone(),
                    Expr::var_of(b.ty.element_of(), format!("{}.lane.{}", name, lane)),
                );
            }
            let copy = substitute_map_stmt(&map, s);
            let mut copy = LaneAccess {
                buffers: &widened,
                lane,
                lanes: self.lanes,
            }
            .mutate_stmt(&copy);
            for (name, b) in &bindings {
                let lane_name = format!("{}.lane.{}", name, lane);
                if stmt_uses_var(&copy, &lane_name) {
                    let value = extract_lane(&Expr::var_of(b.ty, b.widened.clone()), lane);
                    copy = Stmt::let_stmt(lane_name, value, copy);
                }
            }
            copies.push(copy);
        }
        Stmt::block_of(copies)
    }

    fn vector_if(&mut self, condition: &Expr, then_case: &Stmt, else_case: Option<&Stmt>) -> Stmt {
        let cond = self.mutate_expr(condition);
        let likely = cond.as_likely().cloned();
        let mask = likely.clone().unwrap_or_else(|| cond.clone());
        let masked = self.masked_if(&mask, then_case, else_case);
        let slow = match masked {
            Some(m) => m,
            None => {
                // Lanes test the condition one at a time; the hint only
                // applies to the vector test.
                let plain = condition.as_likely().unwrap_or(condition);
                let per_lane = Stmt::if_then_else(plain.clone(), then_case.clone(), else_case.cloned());
                self.scalarize(&per_lane)
            }
        };
        match likely {
            Some(inner) => {
                let all_true = self.bounds(&inner).min;
                let fast = self.mutate_stmt(then_case);
                Stmt::if_then_else(Expr::likely(all_true), fast, Some(slow))
            }
            None => slow,
        }
    }

    /// Both branches under a lane mask, where the target has masked loads
    /// and stores and the branches only load and store.
    fn masked_if(&mut self, mask: &Expr, then_case: &Stmt, else_case: Option<&Stmt>) -> Option<Stmt> {
        if !self.target.supports_predicated_memory() {
            return None;
        }
        let then_v = self.mutate_stmt(then_case);
        let else_v = else_case.map(|e| self.mutate_stmt(e));
        let then_p = predicate(&then_v, mask)?;
        let else_p = match &else_v {
            Some(e) => predicate(e, &Expr::not(mask.clone()))?,
            None => Stmt::no_op(),
        };
        Some(Stmt::block(then_p, else_p))
    }

    /// A serial (or demoted) loop inside the vectorized one. A vector `min`
    /// is rebased to zero; a vector `extent` runs to its largest lane with a
    /// per-lane guard.
    fn nested_for(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::For {
            name,
            min,
            extent,
            for_type,
            device_api,
            body,
        } = s.node()
        else {
            return s.clone();
        };
        let vmin = self.mutate_expr(min);
        let vextent = self.mutate_expr(extent);
        if self.impure {
            return s.clone();
        }
        let loop_var = Expr::var_of(Type::i32(), name.clone());
        let mut body = body.clone();
        let mut new_min = vmin.clone();
        let mut new_extent = vextent.clone();
        if vmin.ty().is_vector() {
            body = substitute_stmt(name, &(min.clone() + loop_var.clone()), &body);
            new_min = Expr::int(0);
        }
        if vextent.ty().is_vector() {
            new_extent = self.bounds(&vextent).max;
            body = Stmt::if_then_else(Expr::likely(Expr::lt(loop_var, extent.clone())), body, None);
        }
        let for_type = match for_type {
            ForType::Vectorized => ForType::Serial,
            other => *other,
        };
        self.scope.push(name.clone(), None);
        let body = self.mutate_stmt(&body);
        self.scope.pop(name);
        Stmt::for_loop(name.clone(), new_min, new_extent, for_type, *device_api, body)
    }

    fn let_stmt(&mut self, name: &str, value: &Expr, body: &Stmt) -> Stmt {
        let v = self.mutate_expr(value);
        if v.ty().is_scalar() {
            self.scope.push(name, None);
            let b = self.mutate_stmt(body);
            self.scope.pop(name);
            return Stmt::let_stmt(name, v, b);
        }
        let widened = self.bind_vector(name, v.ty());
        let mut b = self.mutate_stmt(body);
        self.scope.pop(name);
        let min_name = format!("{}.min_lane", name);
        let max_name = format!("{}.max_lane", name);
        let uses_max = stmt_uses_var(&b, &max_name);
        let uses_min = stmt_uses_var(&b, &min_name);
        if uses_max || uses_min {
            let lb = self.bounds(&v);
            if uses_max {
                b = Stmt::let_stmt(max_name, lb.max, b);
            }
            if uses_min {
                b = Stmt::let_stmt(min_name, lb.min, b);
            }
        }
        Stmt::let_stmt(widened, v, b)
    }
}

impl IrMutator for VectorSubs<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.node() {
            ExprNode::Variable { name, .. } if *name == self.var => self.replacement(),
            ExprNode::Variable { name, .. } => match self.scope.get(name) {
                Some(Some(b)) => Expr::var_of(b.ty, b.widened.clone()),
                _ => e.clone(),
            },
            ExprNode::Let { name, value, body } => {
                let v = self.mutate_expr(value);
                if v.ty().is_scalar() {
                    self.scope.push(name, None);
                    let b = self.mutate_expr(body);
                    self.scope.pop(name);
                    return Expr::let_in(name.clone(), v, b);
                }
                let widened = self.bind_vector(name, v.ty());
                let b = self.mutate_expr(body);
                self.scope.pop(name);
                Expr::let_in(widened, v, b)
            }
            ExprNode::Cast { ty, value } => {
                let v = self.mutate_expr(value);
                Expr::cast(ty.with_lanes(v.ty().lanes), v)
            }
            ExprNode::Load {
                ty,
                name,
                index,
                predicate,
            } => {
                let mut i = self.mutate_expr(index);
                let p = self.mutate_expr(predicate);
                if self.widened_allocs.contains(name) {
                    i = self.lane_index(i);
                }
                let lanes = i.ty().lanes.max(p.ty().lanes);
                Expr::load(ty.with_lanes(lanes), name.clone(), widen(i, lanes), widen(p, lanes))
            }
            ExprNode::Call {
                ty,
                name,
                args,
                call_type,
                value_index,
            } => {
                let new_args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let lanes = new_args.iter().map(|a| a.ty().lanes).max().unwrap_or(1);
                if lanes == 1 {
                    return Expr::call(*ty, name.clone(), new_args, *call_type, *value_index);
                }
                if !call_type.is_pure() {
                    self.impure = true;
                    return e.clone();
                }
                let new_args = new_args.into_iter().map(|a| widen(a, lanes)).collect();
                Expr::call(ty.with_lanes(lanes), name.clone(), new_args, *call_type, *value_index)
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::Store {
                name,
                value,
                index,
                predicate,
            } => self.vectorize_or_scalarize(s, |m| {
                let v = m.mutate_expr(value);
                let mut i = m.mutate_expr(index);
                let p = m.mutate_expr(predicate);
                if m.widened_allocs.contains(name) {
                    i = m.lane_index(i);
                } else if i.ty().is_scalar() && (v.ty().is_vector() || p.ty().is_vector()) {
                    // Every lane writes the same element.
                    m.impure = true;
                    return s.clone();
                }
                let lanes = v.ty().lanes.max(i.ty().lanes).max(p.ty().lanes);
                Stmt::store(name.clone(), widen(v, lanes), widen(i, lanes), widen(p, lanes))
            }),
            StmtNode::Evaluate { value } => self.vectorize_or_scalarize(s, |m| {
                Stmt::evaluate(m.mutate_expr(value))
            }),
            StmtNode::AssertStmt { condition, message } => self.vectorize_or_scalarize(s, |m| {
                let c = m.mutate_expr(condition);
                if c.ty().is_vector() {
                    m.impure = true;
                    return s.clone();
                }
                Stmt::assert(c, message.clone())
            }),
            StmtNode::Atomic { body, .. } => self.vectorize_or_scalarize(s, |m| {
                let b = m.mutate_stmt(body);
                if !b.same_as(body) {
                    m.impure = true;
                }
                s.clone()
            }),
            StmtNode::LetStmt { name, value, body } => {
                self.vectorize_or_scalarize(s, |m| m.let_stmt(name, value, body))
            }
            StmtNode::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                let saved = std::mem::replace(&mut self.impure, false);
                let c = self.mutate_expr(condition);
                let impure = std::mem::replace(&mut self.impure, saved);
                if impure {
                    return self.scalarize(s);
                }
                if c.ty().is_vector() {
                    return self.vector_if(condition, then_case, else_case.as_ref());
                }
                let t = self.mutate_stmt(then_case);
                let e = else_case.as_ref().map(|e| self.mutate_stmt(e));
                Stmt::if_then_else(c, t, e)
            }
            StmtNode::For { .. } => self.vectorize_or_scalarize(s, |m| m.nested_for(s)),
            StmtNode::Allocate {
                name,
                ty,
                memory_type,
                extents,
                condition,
                body,
            } => {
                let mut new_extents = vec![Expr::int(self.lanes as i64)];
                new_extents.extend(extents.iter().map(|e| self.mutate_expr(e)));
                self.widened_allocs.push(name, ());
                let b = self.mutate_stmt(body);
                self.widened_allocs.pop(name);
                StmtNode::Allocate {
                    name: name.clone(),
                    ty: *ty,
                    memory_type: *memory_type,
                    extents: new_extents,
                    condition: self.mutate_expr(condition),
                    body: b,
                }
                .into()
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

/// Scalar accesses to widened allocations, for the lane copy `lane`.
struct LaneAccess<'a> {
    buffers: &'a [String],
    lane: u16,
    lanes: u16,
}

impl LaneAccess<'_> {
    fn index(&self, i: Expr) -> Expr {
        i * Expr::int(self.lanes as i64) + Expr::int(self.lane as i64)
    }
}

impl IrMutator for LaneAccess<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Load {
                ty,
                name,
                index,
                predicate,
            } if self.buffers.contains(name) => {
                Expr::load(*ty, name.clone(), self.index(index.clone()), predicate.clone())
            }
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        match s.node() {
            StmtNode::Store {
                name,
                value,
                index,
                predicate,
            } if self.buffers.contains(name) => Stmt::store(
                name.clone(),
                value.clone(),
                self.index(index.clone()),
                predicate.clone(),
            ),
            _ => s,
        }
    }
}

// ── Predication ────────────────────────────────────────────────────────────

/// Fold `cond` into every load and store of an already widened branch.
/// `None` when the branch does something a lane mask cannot express.
fn predicate(s: &Stmt, cond: &Expr) -> Option<Stmt> {
    let mut p = Predicate {
        cond,
        lanes: cond.ty().lanes,
        ok: true,
    };
    let out = p.mutate_stmt(s);
    p.ok.then_some(out)
}

struct Predicate<'a> {
    cond: &'a Expr,
    lanes: u16,
    ok: bool,
}

impl Predicate<'_> {
    fn masked(&mut self, lanes: u16, pred: &Expr) -> Expr {
        if lanes != self.lanes {
            self.ok = false;
            return pred.clone();
        }
        if pred.is_true() || pred == &Expr::broadcast(Expr::bool(true), lanes) {
            self.cond.clone()
        } else {
            Expr::and(pred.clone(), self.cond.clone())
        }
    }
}

impl IrMutator for Predicate<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Load {
                ty,
                name,
                index,
                predicate,
            } => {
                let p = self.masked(ty.lanes, predicate);
                Expr::load(*ty, name.clone(), index.clone(), p)
            }
            ExprNode::Call { call_type, .. } if !call_type.is_pure() => {
                self.ok = false;
                e
            }
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if !self.ok {
            return s.clone();
        }
        match s.node() {
            StmtNode::Store {
                name,
                value,
                index,
                predicate,
            } => {
                let v = self.mutate_expr(value);
                let p = self.masked(v.ty().lanes, predicate);
                Stmt::store(name.clone(), v, index.clone(), p)
            }
            StmtNode::LetStmt { .. } | StmtNode::Block { .. } | StmtNode::NoOp => {
                mutate_stmt_children(self, s)
            }
            StmtNode::Evaluate { .. } => mutate_stmt_children(self, s),
            _ => {
                self.ok = false;
                s.clone()
            }
        }
    }
}

// ── The pass ───────────────────────────────────────────────────────────────

/// Finds vectorized loops, outermost first.
struct VectorizeLoops<'a> {
    target: &'a Target,
    warnings: Vec<Diagnostic>,
    err: Option<Error>,
}

/// Demote vectorized loops nested in another vectorized loop.
struct DemoteNested<'a> {
    outer: &'a str,
    warnings: &'a mut Vec<Diagnostic>,
}

impl IrMutator for DemoteNested<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        match s.node() {
            StmtNode::For {
                name,
                min,
                extent,
                for_type: ForType::Vectorized,
                device_api,
                body,
            } => {
                self.warnings.push(
                    Diagnostic::warning(
                        codes::W0002_NESTED_VECTORIZE,
                        format!(
                            "loop `{}` is inside vectorized loop `{}` and runs serially",
                            name, self.outer
                        ),
                    )
                    .with_subject(name.clone()),
                );
                Stmt::for_loop(
                    name.clone(),
                    min.clone(),
                    extent.clone(),
                    ForType::Serial,
                    *device_api,
                    body.clone(),
                )
            }
            _ => s,
        }
    }
}

impl VectorizeLoops<'_> {
    fn vectorize_loop(&mut self, name: &str, min: &Expr, extent: &Expr, body: &Stmt) -> Result<Stmt> {
        let extent = simplify(extent);
        let lanes = match extent.as_int() {
            Some(n) if n > 1 && n <= u16::MAX as i64 => n as u16,
            _ => {
                return Err(LowerContext::user_error(
                    codes::E0401_VECTOR_EXTENT,
                    name,
                    format!(
                        "can't vectorize loop `{}`: its extent `{}` is not a constant greater than one",
                        name, extent
                    ),
                ))
            }
        };
        let body = DemoteNested {
            outer: name,
            warnings: &mut self.warnings,
        }
        .mutate_stmt(body);
        let mut subs = VectorSubs {
            var: name.to_string(),
            base: min.clone(),
            lanes,
            target: self.target,
            scope: Scope::new(),
            lane_names: BTreeMap::new(),
            widened_allocs: Scope::new(),
            impure: false,
        };
        let out = subs.mutate_stmt(&body);
        tracing::debug!(loop_var = name, lanes, "vectorized");
        Ok(out)
    }
}

impl IrMutator for VectorizeLoops<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        match s.node() {
            StmtNode::For {
                name,
                min,
                extent,
                for_type: ForType::Vectorized,
                body,
                ..
            } => match self.vectorize_loop(name, min, extent, body) {
                Ok(out) => out,
                Err(e) => {
                    self.err = Some(e);
                    s.clone()
                }
            },
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct Vectorize;

impl LoweringPass for Vectorize {
    fn name(&self) -> &str {
        "vectorize"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let target = ctx.target().clone();
        let mut m = VectorizeLoops {
            target: &target,
            warnings: Vec::new(),
            err: None,
        };
        let out = m.mutate_stmt(&stmt);
        for w in m.warnings {
            ctx.warn(w);
        }
        match m.err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}
