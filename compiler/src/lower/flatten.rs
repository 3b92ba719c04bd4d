// flatten.rs - Storage flattening
//
// Multi-dimensional realizations become flat allocations. For a realization
// of `f` the pass binds `f.min.<i>`, `f.extent.<i>` and `f.stride.<i>` for
// every dimension (strides follow the function's storage order, innermost
// stride 1) and replaces the `Realize` with an `Allocate`. Provides become
// stores and function or image calls become loads, all at the flat index
//
//     sum over i of (arg_i - f.min.i) * f.stride.i
//
// Buffers that are not realized here (outputs and input images) keep their
// metadata symbols free; argument inference turns them into buffer
// arguments. Their innermost stride is assumed to be 1. Constant buffers
// are dense with constant strides and a zero origin.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::func::{ConstBuffer, Function};
use crate::ir::{
    mutate_expr_children, mutate_stmt_children, simplify, CallType, Expr, ExprNode, IrMutator,
    Stmt, StmtNode, Type,
};

use super::pass::{LowerContext, LoweringPass};

fn ivar(name: impl Into<String>) -> Expr {
    Expr::var_of(Type::i32(), name)
}

fn field(buffer: &str, field: &str, dim: usize) -> String {
    format!("{}.{}.{}", buffer, field, dim)
}

/// The function a buffer belongs to; `f.1` is component 1 of tuple `f`.
pub(crate) fn owner_of<'a>(ctx: &'a LowerContext, buffer: &str) -> Option<&'a Function> {
    ctx.env.get(buffer).or_else(|| {
        let (base, idx) = buffer.rsplit_once('.')?;
        idx.parse::<usize>().ok()?;
        ctx.env.get(base)
    })
}

/// Dimension indices, innermost storage dimension first.
fn storage_order(func: Option<&Function>, dims: usize) -> Vec<usize> {
    let Some(func) = func else {
        return (0..dims).collect();
    };
    let mut order: Vec<usize> = func
        .schedule
        .storage_dims
        .iter()
        .filter_map(|d| func.args.iter().position(|a| a == d))
        .collect();
    for i in 0..dims {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    order
}

fn const_strides(buffer: &ConstBuffer) -> Vec<i64> {
    let mut strides = Vec::with_capacity(buffer.extents.len());
    let mut s = 1i64;
    for e in &buffer.extents {
        strides.push(s);
        s *= *e as i64;
    }
    strides
}

struct Flatten<'a> {
    ctx: &'a LowerContext,
    /// Buffers allocated by an enclosing realization.
    realized: BTreeSet<String>,
    err: Option<Error>,
}

impl Flatten<'_> {
    fn flat_index(&self, buffer: &str, args: &[Expr]) -> Expr {
        if !self.realized.contains(buffer) {
            if let Some(c) = self.ctx.buffers.get(buffer) {
                let strides = const_strides(c);
                let index = args
                    .iter()
                    .zip(strides)
                    .fold(Expr::int(0), |acc, (a, s)| acc + a.clone() * Expr::int(s));
                return simplify(&index);
            }
        }
        let mut index = Expr::int(0);
        for (i, a) in args.iter().enumerate() {
            let offset = a.clone() - ivar(field(buffer, "min", i));
            let term = if i == 0 && !self.realized.contains(buffer) {
                offset
            } else {
                offset * ivar(field(buffer, "stride", i))
            };
            index = index + term;
        }
        simplify(&index)
    }

    fn allocate(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::Realize {
            name,
            types,
            memory_type,
            bounds,
            condition,
            body,
        } = s.node()
        else {
            return s.clone();
        };
        let [ty] = types.as_slice() else {
            self.err.get_or_insert(Error::internal(format!(
                "realization of `{}` still has {} values after tuple splitting",
                name,
                types.len()
            )));
            return s.clone();
        };
        let was_realized = !self.realized.insert(name.clone());
        let body = self.mutate_stmt(body);
        if !was_realized {
            self.realized.remove(name);
        }

        let order = storage_order(owner_of(self.ctx, name), bounds.len());
        let extents = order.iter().map(|i| ivar(field(name, "extent", *i))).collect();
        let mut out: Stmt = StmtNode::Allocate {
            name: name.clone(),
            ty: *ty,
            memory_type: *memory_type,
            extents,
            condition: condition.clone(),
            body,
        }
        .into();

        let mut lets: Vec<(String, Expr)> = Vec::new();
        for (i, r) in bounds.iter().enumerate() {
            lets.push((field(name, "min", i), r.min.clone()));
            lets.push((field(name, "extent", i), r.extent.clone()));
        }
        let mut prev: Option<usize> = None;
        for i in &order {
            let stride = match prev {
                None => Expr::int(1),
                Some(p) => ivar(field(name, "stride", p)) * ivar(field(name, "extent", p)),
            };
            lets.push((field(name, "stride", *i), stride));
            prev = Some(*i);
        }
        for (n, v) in lets.into_iter().rev() {
            out = Stmt::let_stmt(n, v, out);
        }
        out
    }
}

impl IrMutator for Flatten<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Call {
                ty,
                name,
                args,
                call_type: CallType::Halide | CallType::Image,
                ..
            } => {
                let index = self.flat_index(name, args);
                Expr::load(*ty, name.clone(), index, Expr::bool(true))
            }
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        match s.node() {
            StmtNode::Realize { .. } => self.allocate(s),
            StmtNode::Provide { name, values, args } => {
                let [value] = values.as_slice() else {
                    self.err.get_or_insert(Error::internal(format!(
                        "provide to `{}` still has {} values after tuple splitting",
                        name,
                        values.len()
                    )));
                    return s.clone();
                };
                let value = self.mutate_expr(value);
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let index = self.flat_index(name, &args);
                Stmt::store(name.clone(), value, index, Expr::bool(true))
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct StorageFlattening;

impl LoweringPass for StorageFlattening {
    fn name(&self) -> &str {
        "storage_flattening"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut f = Flatten {
            ctx,
            realized: BTreeSet::new(),
            err: None,
        };
        let out = f.mutate_stmt(&stmt);
        match f.err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}
