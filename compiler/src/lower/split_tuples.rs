// split_tuples.rs - One buffer per tuple component
//
// A tuple-valued function `f` is stored as buffers `f.0`, `f.1`, ...
// Realizations split into one nested realization per component, calls to
// component `i` become calls to `f.i`, and a tuple provide evaluates every
// value into a let before storing any of them, so a component that reads
// another component of the same site sees the old value.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::ir::{
    mutate_expr_children, mutate_stmt_children, CallType, Expr, ExprNode, IrMutator, Stmt,
    StmtNode,
};

use super::pass::{LowerContext, LoweringPass};

pub(crate) fn component_name(func: &str, i: usize) -> String {
    format!("{}.{}", func, i)
}

struct SplitTuples<'a> {
    tuples: &'a BTreeSet<String>,
}

impl IrMutator for SplitTuples<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Call {
                ty,
                name,
                args,
                call_type: CallType::Halide,
                value_index,
            } if self.tuples.contains(name) => Expr::call(
                *ty,
                component_name(name, *value_index),
                args.clone(),
                CallType::Halide,
                0,
            ),
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::Realize {
                name,
                types,
                memory_type,
                bounds,
                condition,
                body,
            } if self.tuples.contains(name) => {
                let body = self.mutate_stmt(body);
                types
                    .iter()
                    .enumerate()
                    .rev()
                    .fold(body, |acc, (i, ty)| {
                        StmtNode::Realize {
                            name: component_name(name, i),
                            types: vec![*ty],
                            memory_type: *memory_type,
                            bounds: bounds.clone(),
                            condition: condition.clone(),
                            body: acc,
                        }
                        .into()
                    })
            }
            StmtNode::Provide { name, values, args } if self.tuples.contains(name) => {
                let args: Vec<Expr> = args.iter().map(|a| self.mutate_expr(a)).collect();
                let mut lets = Vec::new();
                let mut stores = Vec::new();
                for (i, v) in values.iter().enumerate() {
                    let v = self.mutate_expr(v);
                    let tmp = format!("{}.value.{}", name, i);
                    stores.push(Stmt::provide(
                        component_name(name, i),
                        vec![Expr::var_of(v.ty(), tmp.clone())],
                        args.clone(),
                    ));
                    lets.push((tmp, v));
                }
                lets.into_iter()
                    .rev()
                    .fold(Stmt::block_of(stores), |acc, (n, v)| Stmt::let_stmt(n, v, acc))
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct SplitTuplesPass;

impl LoweringPass for SplitTuplesPass {
    fn name(&self) -> &str {
        "split_tuples"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let tuples: BTreeSet<String> = ctx
            .env
            .values()
            .filter(|f| f.is_tuple())
            .map(|f| f.name.clone())
            .collect();
        if tuples.is_empty() {
            return Ok(stmt);
        }
        Ok(SplitTuples { tuples: &tuples }.mutate_stmt(&stmt))
    }
}

#[cfg(test)]
mod tests {
    use crate::func::{Pipeline, Var};
    use crate::lower::testing::run_until;
    use crate::options::LowerOptions;

    #[test]
    fn tuple_becomes_one_buffer_per_component() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr(), x.expr() * 2]).unwrap();
        let g = p.func("g").unwrap();
        let a = p.call_value(f, vec![x.expr()], 0).unwrap();
        let b = p.call_value(f, vec![x.expr()], 1).unwrap();
        p.define(g, &[x.clone()], vec![a + b]).unwrap();
        p.compute_root(f);
        let (s, _) = run_until(&p, &["g"], LowerOptions::default(), "split_tuples").unwrap();
        let out = s.to_string();
        assert!(out.contains("realize f.0("), "{}", out);
        assert!(out.contains("realize f.1("), "{}", out);
        assert!(out.contains("let f.value.1 = (f.s0.x * 2)"), "{}", out);
        assert!(out.contains("f.1(f.s0.x) = f.value.1"), "{}", out);
        assert!(out.contains("(f.0(g.s0.x) + f.1(g.s0.x))"), "{}", out);
    }
}
