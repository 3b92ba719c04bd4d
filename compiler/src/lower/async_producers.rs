// async_producers.rs - Run async producers concurrently with their consumers
//
// `produce f; consume f` for an async `f` becomes a fork: one branch runs
// the producer and then releases a semaphore, the other acquires it before
// consuming. The semaphore is created by a let just outside the fork.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::ir::{intrinsics, mutate_stmt_children, Expr, IrMutator, Stmt, StmtNode, Type};

use super::pass::{LowerContext, LoweringPass};

fn semaphore_name(func: &str) -> String {
    format!("{}.semaphore", func)
}

struct ForkAsync<'a> {
    funcs: &'a BTreeSet<String>,
    forked: usize,
}

impl ForkAsync<'_> {
    fn fork(&mut self, func: &str, produce: Stmt, consume: Stmt) -> Stmt {
        self.forked += 1;
        let sem_name = semaphore_name(func);
        let sem = Expr::var_of(Type::handle(), sem_name.clone());
        let release = Stmt::evaluate(Expr::intrinsic(
            Type::i32(),
            intrinsics::SEMAPHORE_RELEASE,
            vec![sem.clone(), Expr::int(1)],
        ));
        let first = Stmt::block(produce, release);
        let rest = Stmt::acquire(sem, Expr::int(1), consume);
        let make = Expr::intrinsic(Type::handle(), intrinsics::MAKE_SEMAPHORE, vec![Expr::int(0)]);
        Stmt::let_stmt(sem_name, make, Stmt::fork(first, rest))
    }
}

impl IrMutator for ForkAsync<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if let StmtNode::Block { first, rest } = s.node() {
            if let (
                StmtNode::ProducerConsumer {
                    name: p,
                    is_producer: true,
                    ..
                },
                StmtNode::ProducerConsumer {
                    name: c,
                    is_producer: false,
                    ..
                },
            ) = (first.node(), rest.node())
            {
                if p == c && self.funcs.contains(p) {
                    let produce = self.mutate_stmt(first);
                    let consume = self.mutate_stmt(rest);
                    return self.fork(p, produce, consume);
                }
            }
        }
        mutate_stmt_children(self, s)
    }
}

pub struct AsyncProducers;

impl LoweringPass for AsyncProducers {
    fn name(&self) -> &str {
        "async_producers"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let funcs: BTreeSet<String> = ctx
            .env
            .values()
            .filter(|f| f.schedule.is_async && !ctx.is_output(&f.name))
            .map(|f| f.name.clone())
            .collect();
        if funcs.is_empty() {
            return Ok(stmt);
        }
        let mut m = ForkAsync { funcs: &funcs, forked: 0 };
        let out = m.mutate_stmt(&stmt);
        tracing::debug!(forked = m.forked, "async producers forked");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, Var};
    use crate::lower::testing::run_until;
    use crate::options::LowerOptions;

    #[test]
    fn async_producer_forks_with_a_semaphore() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() + 1]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx * 2]).unwrap();
        p.compute_root(f).async_(f);
        let (s, _) = run_until(&p, &["g"], LowerOptions::default(), "async_producers").unwrap();
        let out = s.to_string();
        assert!(out.contains("let f.semaphore = halide_make_semaphore(0)"), "{}", out);
        assert!(out.contains("fork {"), "{}", out);
        assert!(out.contains("halide_semaphore_release(f.semaphore, 1)"), "{}", out);
        assert!(out.contains("acquire (f.semaphore, 1) {"), "{}", out);
        let release = out.find("halide_semaphore_release").unwrap();
        assert!(out.find("produce f").unwrap() < release);
        assert!(out.find("consume f").unwrap() > out.find("acquire").unwrap());
    }
}
