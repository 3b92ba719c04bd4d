// visit.rs - Structural traversal of the IR
//
// `IrMutator` and `IrVisitor` have default methods that recurse into every
// child. Implementors override the node kinds they care about and call the
// `*_children` helpers to continue. Mutation rebuilds a node only when one
// of its children actually changed, so untouched subtrees stay shared.

use std::collections::BTreeSet;

use super::expr::{Expr, ExprNode, Range};
use super::stmt::{Stmt, StmtNode};

pub trait IrMutator {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        mutate_expr_children(self, e)
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        mutate_stmt_children(self, s)
    }
}

pub trait IrVisitor {
    fn visit_expr(&mut self, e: &Expr) {
        visit_expr_children(self, e)
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        visit_stmt_children(self, s)
    }
}

fn same_all(a: &[Expr], b: &[Expr]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

fn mutate_all<M: IrMutator + ?Sized>(m: &mut M, es: &[Expr]) -> Vec<Expr> {
    es.iter().map(|e| m.mutate_expr(e)).collect()
}

pub fn mutate_expr_children<M: IrMutator + ?Sized>(m: &mut M, e: &Expr) -> Expr {
    match e.node() {
        ExprNode::IntImm { .. }
        | ExprNode::UIntImm { .. }
        | ExprNode::FloatImm { .. }
        | ExprNode::StringImm(_)
        | ExprNode::Variable { .. } => e.clone(),
        ExprNode::Cast { ty, value } => {
            let v = m.mutate_expr(value);
            if v.same_as(value) {
                e.clone()
            } else {
                Expr::cast(*ty, v)
            }
        }
        ExprNode::Binary { op, a, b } => {
            let (na, nb) = (m.mutate_expr(a), m.mutate_expr(b));
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::binary(*op, na, nb)
            }
        }
        ExprNode::Cmp { op, a, b } => {
            let (na, nb) = (m.mutate_expr(a), m.mutate_expr(b));
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::cmp(*op, na, nb)
            }
        }
        ExprNode::And { a, b } => {
            let (na, nb) = (m.mutate_expr(a), m.mutate_expr(b));
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::and(na, nb)
            }
        }
        ExprNode::Or { a, b } => {
            let (na, nb) = (m.mutate_expr(a), m.mutate_expr(b));
            if na.same_as(a) && nb.same_as(b) {
                e.clone()
            } else {
                Expr::or(na, nb)
            }
        }
        ExprNode::Not { a } => {
            let na = m.mutate_expr(a);
            if na.same_as(a) {
                e.clone()
            } else {
                Expr::not(na)
            }
        }
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        } => {
            let c = m.mutate_expr(condition);
            let t = m.mutate_expr(true_value);
            let f = m.mutate_expr(false_value);
            if c.same_as(condition) && t.same_as(true_value) && f.same_as(false_value) {
                e.clone()
            } else {
                Expr::select(c, t, f)
            }
        }
        ExprNode::Load {
            ty,
            name,
            index,
            predicate,
        } => {
            let i = m.mutate_expr(index);
            let p = m.mutate_expr(predicate);
            if i.same_as(index) && p.same_as(predicate) {
                e.clone()
            } else {
                let ty = ty.with_lanes(i.ty().lanes);
                Expr::load(ty, name.clone(), i, p)
            }
        }
        ExprNode::Ramp {
            base,
            stride,
            lanes,
        } => {
            let b = m.mutate_expr(base);
            let s = m.mutate_expr(stride);
            if b.same_as(base) && s.same_as(stride) {
                e.clone()
            } else {
                Expr::ramp(b, s, *lanes)
            }
        }
        ExprNode::Broadcast { value, lanes } => {
            let v = m.mutate_expr(value);
            if v.same_as(value) {
                e.clone()
            } else {
                Expr::broadcast(v, *lanes)
            }
        }
        ExprNode::Let { name, value, body } => {
            let v = m.mutate_expr(value);
            let b = m.mutate_expr(body);
            if v.same_as(value) && b.same_as(body) {
                e.clone()
            } else {
                Expr::let_in(name.clone(), v, b)
            }
        }
        ExprNode::Call {
            ty,
            name,
            args,
            call_type,
            value_index,
        } => {
            let new_args = mutate_all(m, args);
            if same_all(&new_args, args) {
                e.clone()
            } else {
                Expr::call(*ty, name.clone(), new_args, *call_type, *value_index)
            }
        }
        ExprNode::Shuffle { vectors, indices } => {
            let new_vectors = mutate_all(m, vectors);
            if same_all(&new_vectors, vectors) {
                e.clone()
            } else {
                Expr::shuffle(new_vectors, indices.clone())
            }
        }
    }
}

pub fn mutate_stmt_children<M: IrMutator + ?Sized>(m: &mut M, s: &Stmt) -> Stmt {
    match s.node() {
        StmtNode::LetStmt { name, value, body } => {
            let v = m.mutate_expr(value);
            let b = m.mutate_stmt(body);
            if v.same_as(value) && b.same_as(body) {
                s.clone()
            } else {
                Stmt::let_stmt(name.clone(), v, b)
            }
        }
        StmtNode::AssertStmt { condition, message } => {
            let c = m.mutate_expr(condition);
            let msg = m.mutate_expr(message);
            if c.same_as(condition) && msg.same_as(message) {
                s.clone()
            } else {
                Stmt::assert(c, msg)
            }
        }
        StmtNode::ProducerConsumer {
            name,
            is_producer,
            body,
        } => {
            let b = m.mutate_stmt(body);
            if b.same_as(body) {
                s.clone()
            } else {
                StmtNode::ProducerConsumer {
                    name: name.clone(),
                    is_producer: *is_producer,
                    body: b,
                }
                .into()
            }
        }
        StmtNode::For {
            name,
            min,
            extent,
            for_type,
            device_api,
            body,
        } => {
            let mn = m.mutate_expr(min);
            let ex = m.mutate_expr(extent);
            let b = m.mutate_stmt(body);
            if mn.same_as(min) && ex.same_as(extent) && b.same_as(body) {
                s.clone()
            } else {
                Stmt::for_loop(name.clone(), mn, ex, *for_type, *device_api, b)
            }
        }
        StmtNode::Store {
            name,
            value,
            index,
            predicate,
        } => {
            let v = m.mutate_expr(value);
            let i = m.mutate_expr(index);
            let p = m.mutate_expr(predicate);
            if v.same_as(value) && i.same_as(index) && p.same_as(predicate) {
                s.clone()
            } else {
                Stmt::store(name.clone(), v, i, p)
            }
        }
        StmtNode::Provide { name, values, args } => {
            let vs = mutate_all(m, values);
            let as_ = mutate_all(m, args);
            if same_all(&vs, values) && same_all(&as_, args) {
                s.clone()
            } else {
                Stmt::provide(name.clone(), vs, as_)
            }
        }
        StmtNode::Allocate {
            name,
            ty,
            memory_type,
            extents,
            condition,
            body,
        } => {
            let ex = mutate_all(m, extents);
            let c = m.mutate_expr(condition);
            let b = m.mutate_stmt(body);
            if same_all(&ex, extents) && c.same_as(condition) && b.same_as(body) {
                s.clone()
            } else {
                StmtNode::Allocate {
                    name: name.clone(),
                    ty: *ty,
                    memory_type: *memory_type,
                    extents: ex,
                    condition: c,
                    body: b,
                }
                .into()
            }
        }
        StmtNode::Free { .. } | StmtNode::NoOp => s.clone(),
        StmtNode::Realize {
            name,
            types,
            memory_type,
            bounds,
            condition,
            body,
        } => {
            let mut changed = false;
            let new_bounds: Vec<Range> = bounds
                .iter()
                .map(|r| {
                    let mn = m.mutate_expr(&r.min);
                    let ex = m.mutate_expr(&r.extent);
                    changed |= !mn.same_as(&r.min) || !ex.same_as(&r.extent);
                    Range::new(mn, ex)
                })
                .collect();
            let c = m.mutate_expr(condition);
            let b = m.mutate_stmt(body);
            if !changed && c.same_as(condition) && b.same_as(body) {
                s.clone()
            } else {
                StmtNode::Realize {
                    name: name.clone(),
                    types: types.clone(),
                    memory_type: *memory_type,
                    bounds: new_bounds,
                    condition: c,
                    body: b,
                }
                .into()
            }
        }
        StmtNode::Block { first, rest } => {
            let f = m.mutate_stmt(first);
            let r = m.mutate_stmt(rest);
            if f.same_as(first) && r.same_as(rest) {
                s.clone()
            } else {
                Stmt::block(f, r)
            }
        }
        StmtNode::Fork { first, rest } => {
            let f = m.mutate_stmt(first);
            let r = m.mutate_stmt(rest);
            if f.same_as(first) && r.same_as(rest) {
                s.clone()
            } else {
                Stmt::fork(f, r)
            }
        }
        StmtNode::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            let c = m.mutate_expr(condition);
            let t = m.mutate_stmt(then_case);
            let e = else_case.as_ref().map(|e| m.mutate_stmt(e));
            let else_same = match (&e, else_case) {
                (Some(a), Some(b)) => a.same_as(b),
                (None, None) => true,
                _ => false,
            };
            if c.same_as(condition) && t.same_as(then_case) && else_same {
                s.clone()
            } else {
                Stmt::if_then_else(c, t, e)
            }
        }
        StmtNode::Evaluate { value } => {
            let v = m.mutate_expr(value);
            if v.same_as(value) {
                s.clone()
            } else {
                Stmt::evaluate(v)
            }
        }
        StmtNode::Acquire {
            semaphore,
            count,
            body,
        } => {
            let sem = m.mutate_expr(semaphore);
            let c = m.mutate_expr(count);
            let b = m.mutate_stmt(body);
            if sem.same_as(semaphore) && c.same_as(count) && b.same_as(body) {
                s.clone()
            } else {
                Stmt::acquire(sem, c, b)
            }
        }
        StmtNode::Atomic {
            producer_name,
            mutex_name,
            body,
        } => {
            let b = m.mutate_stmt(body);
            if b.same_as(body) {
                s.clone()
            } else {
                Stmt::atomic(producer_name.clone(), mutex_name.clone(), b)
            }
        }
    }
}

pub fn visit_expr_children<V: IrVisitor + ?Sized>(v: &mut V, e: &Expr) {
    match e.node() {
        ExprNode::IntImm { .. }
        | ExprNode::UIntImm { .. }
        | ExprNode::FloatImm { .. }
        | ExprNode::StringImm(_)
        | ExprNode::Variable { .. } => {}
        ExprNode::Cast { value, .. } => v.visit_expr(value),
        ExprNode::Binary { a, b, .. }
        | ExprNode::Cmp { a, b, .. }
        | ExprNode::And { a, b }
        | ExprNode::Or { a, b } => {
            v.visit_expr(a);
            v.visit_expr(b);
        }
        ExprNode::Not { a } => v.visit_expr(a),
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        } => {
            v.visit_expr(condition);
            v.visit_expr(true_value);
            v.visit_expr(false_value);
        }
        ExprNode::Load {
            index, predicate, ..
        } => {
            v.visit_expr(index);
            v.visit_expr(predicate);
        }
        ExprNode::Ramp { base, stride, .. } => {
            v.visit_expr(base);
            v.visit_expr(stride);
        }
        ExprNode::Broadcast { value, .. } => v.visit_expr(value),
        ExprNode::Let { value, body, .. } => {
            v.visit_expr(value);
            v.visit_expr(body);
        }
        ExprNode::Call { args, .. } => args.iter().for_each(|a| v.visit_expr(a)),
        ExprNode::Shuffle { vectors, .. } => vectors.iter().for_each(|a| v.visit_expr(a)),
    }
}

pub fn visit_stmt_children<V: IrVisitor + ?Sized>(v: &mut V, s: &Stmt) {
    match s.node() {
        StmtNode::LetStmt { value, body, .. } => {
            v.visit_expr(value);
            v.visit_stmt(body);
        }
        StmtNode::AssertStmt { condition, message } => {
            v.visit_expr(condition);
            v.visit_expr(message);
        }
        StmtNode::ProducerConsumer { body, .. } | StmtNode::Atomic { body, .. } => {
            v.visit_stmt(body)
        }
        StmtNode::For {
            min, extent, body, ..
        } => {
            v.visit_expr(min);
            v.visit_expr(extent);
            v.visit_stmt(body);
        }
        StmtNode::Store {
            value,
            index,
            predicate,
            ..
        } => {
            v.visit_expr(value);
            v.visit_expr(index);
            v.visit_expr(predicate);
        }
        StmtNode::Provide { values, args, .. } => {
            values.iter().for_each(|e| v.visit_expr(e));
            args.iter().for_each(|e| v.visit_expr(e));
        }
        StmtNode::Allocate {
            extents,
            condition,
            body,
            ..
        } => {
            extents.iter().for_each(|e| v.visit_expr(e));
            v.visit_expr(condition);
            v.visit_stmt(body);
        }
        StmtNode::Free { .. } | StmtNode::NoOp => {}
        StmtNode::Realize {
            bounds,
            condition,
            body,
            ..
        } => {
            for r in bounds {
                v.visit_expr(&r.min);
                v.visit_expr(&r.extent);
            }
            v.visit_expr(condition);
            v.visit_stmt(body);
        }
        StmtNode::Block { first, rest } | StmtNode::Fork { first, rest } => {
            v.visit_stmt(first);
            v.visit_stmt(rest);
        }
        StmtNode::IfThenElse {
            condition,
            then_case,
            else_case,
        } => {
            v.visit_expr(condition);
            v.visit_stmt(then_case);
            if let Some(e) = else_case {
                v.visit_stmt(e);
            }
        }
        StmtNode::Evaluate { value } => v.visit_expr(value),
        StmtNode::Acquire {
            semaphore,
            count,
            body,
        } => {
            v.visit_expr(semaphore);
            v.visit_expr(count);
            v.visit_stmt(body);
        }
    }
}

// ── Common queries ─────────────────────────────────────────────────────────

/// Collects the names of variables referenced anywhere (bound or free).
struct VarNames<'a> {
    target: Option<&'a BTreeSet<String>>,
    found: BTreeSet<String>,
}

impl IrVisitor for VarNames<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprNode::Variable { name, .. } = e.node() {
            if self.target.map_or(true, |t| t.contains(name)) {
                self.found.insert(name.clone());
            }
        }
        visit_expr_children(self, e);
    }
}

pub fn expr_uses_var(e: &Expr, name: &str) -> bool {
    let target: BTreeSet<String> = [name.to_string()].into_iter().collect();
    expr_uses_vars(e, &target)
}

pub fn expr_uses_vars(e: &Expr, names: &BTreeSet<String>) -> bool {
    let mut v = VarNames {
        target: Some(names),
        found: BTreeSet::new(),
    };
    v.visit_expr(e);
    !v.found.is_empty()
}

pub fn stmt_uses_var(s: &Stmt, name: &str) -> bool {
    let target: BTreeSet<String> = [name.to_string()].into_iter().collect();
    let mut v = VarNames {
        target: Some(&target),
        found: BTreeSet::new(),
    };
    v.visit_stmt(s);
    !v.found.is_empty()
}

pub fn vars_in_expr(e: &Expr) -> BTreeSet<String> {
    let mut v = VarNames {
        target: None,
        found: BTreeSet::new(),
    };
    v.visit_expr(e);
    v.found
}

/// Names of every function or buffer called from `Call` nodes of the given
/// kinds.
struct CallNames {
    halide_only: bool,
    found: BTreeSet<String>,
}

impl IrVisitor for CallNames {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprNode::Call {
            name, call_type, ..
        } = e.node()
        {
            if !self.halide_only || *call_type == super::expr::CallType::Halide {
                self.found.insert(name.clone());
            }
        }
        visit_expr_children(self, e);
    }
}

pub fn halide_calls_in_expr(e: &Expr) -> BTreeSet<String> {
    let mut v = CallNames {
        halide_only: true,
        found: BTreeSet::new(),
    };
    v.visit_expr(e);
    v.found
}

pub fn halide_calls_in_stmt(s: &Stmt) -> BTreeSet<String> {
    let mut v = CallNames {
        halide_only: true,
        found: BTreeSet::new(),
    };
    v.visit_stmt(s);
    v.found
}

/// Does `s` touch buffer `name` through a load, store, call, provide or free?
pub fn stmt_uses_buffer(s: &Stmt, name: &str) -> bool {
    struct Uses<'a> {
        name: &'a str,
        found: bool,
    }
    impl IrVisitor for Uses<'_> {
        fn visit_expr(&mut self, e: &Expr) {
            match e.node() {
                ExprNode::Load { name, .. } | ExprNode::Call { name, .. } if name == self.name => {
                    self.found = true
                }
                ExprNode::Variable { name, .. } if is_buffer_field_of(name, self.name) => {
                    self.found = true
                }
                _ => visit_expr_children(self, e),
            }
        }
        fn visit_stmt(&mut self, s: &Stmt) {
            if self.found {
                return;
            }
            match s.node() {
                StmtNode::Store { name, .. }
                | StmtNode::Provide { name, .. }
                | StmtNode::Free { name }
                    if name == self.name =>
                {
                    self.found = true
                }
                _ => visit_stmt_children(self, s),
            }
        }
    }
    let mut u = Uses { name, found: false };
    u.visit_stmt(s);
    u.found
}

/// Is `var` one of the metadata symbols (`<buf>.min.<i>`, `<buf>.extent.<i>`,
/// `<buf>.stride.<i>`) of buffer `buffer`?
pub fn is_buffer_field_of(var: &str, buffer: &str) -> bool {
    split_buffer_field(var).is_some_and(|(b, _, _)| b == buffer)
}

/// Split `<buf>.<field>.<dim>` into its parts when `field` is one of
/// `min`, `extent` or `stride`.
pub fn split_buffer_field(var: &str) -> Option<(&str, &str, usize)> {
    let (rest, dim) = var.rsplit_once('.')?;
    let dim: usize = dim.parse().ok()?;
    let (buffer, field) = rest.rsplit_once('.')?;
    match field {
        "min" | "extent" | "stride" if !buffer.is_empty() => Some((buffer, field, dim)),
        _ => None,
    }
}
