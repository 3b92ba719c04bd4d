// memoize.rs - Cache the realizations of memoized functions
//
// The producer of a memoized function runs only on a cache miss:
//
//     let f.cache_miss = halide_memoization_cache_lookup("f", key...)
//     if (f.cache_miss) { produce f { ... } }
//     halide_memoization_cache_store("f", key...)
//
// The key is the computed box (`f.s0.<v>.min/max` for every pure variable)
// followed by every scalar parameter the function's definitions read.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::func::Function;
use crate::ir::{intrinsics, mutate_stmt_children, vars_in_expr, Expr, IrMutator, Stmt, StmtNode, Type};

use super::pass::{LowerContext, LoweringPass};

fn cache_key(ctx: &LowerContext, func: &Function) -> Vec<Expr> {
    let mut key = vec![Expr::string(func.name.clone())];
    for a in &func.args {
        for field in ["min", "max"] {
            key.push(Expr::var_of(Type::i32(), format!("{}.s0.{}.{}", func.name, a, field)));
        }
    }
    let mut params = BTreeSet::new();
    for def in func.definitions() {
        def.for_each_expr(&mut |e| params.extend(vars_in_expr(e)));
    }
    for name in params {
        if let Some(p) = ctx.params.get(&name) {
            key.push(p.expr());
        }
    }
    key
}

struct Memoize<'a> {
    ctx: &'a LowerContext,
}

impl IrMutator for Memoize<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        let StmtNode::ProducerConsumer {
            name,
            is_producer: true,
            ..
        } = s.node()
        else {
            return s;
        };
        let Some(func) = self.ctx.env.get(name) else {
            return s;
        };
        if !func.schedule.memoized {
            return s;
        }
        let key = cache_key(self.ctx, func);
        let miss_name = format!("{}.cache_miss", name);
        let miss = Expr::var_of(Type::bool(), miss_name.clone());
        let lookup = Expr::intrinsic(Type::bool(), intrinsics::MEMOIZE_LOOKUP, key.clone());
        let store = Stmt::evaluate(Expr::intrinsic(Type::i32(), intrinsics::MEMOIZE_STORE, key));
        let body = Stmt::block(Stmt::if_then_else(miss, s.clone(), None), store);
        Stmt::let_stmt(miss_name, lookup, body)
    }
}

pub struct Memoization;

impl LoweringPass for Memoization {
    fn name(&self) -> &str {
        "memoization"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        if !ctx.env.values().any(|f| f.schedule.memoized) {
            return Ok(stmt);
        }
        Ok(Memoize { ctx }.mutate_stmt(&stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, Var};
    use crate::lower::testing::run_until;
    use crate::options::LowerOptions;

    #[test]
    fn memoized_producer_runs_on_a_miss() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let k = p.param("k", Type::i32()).unwrap();
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() * k.expr()]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx]).unwrap();
        p.compute_root(f).memoize(f);
        let (s, _) = run_until(&p, &["g"], LowerOptions::default(), "memoization").unwrap();
        let out = s.to_string();
        assert!(
            out.contains("let f.cache_miss = halide_memoization_cache_lookup(\"f\", f.s0.x.min, f.s0.x.max, k)"),
            "{}",
            out
        );
        assert!(out.contains("if (f.cache_miss) {"), "{}", out);
        assert!(out.contains("halide_memoization_cache_store(\"f\", f.s0.x.min, f.s0.x.max, k)"), "{}", out);
    }
}
