// profiling.rs - Profiler instrumentation
//
// With the `profile` target feature the pipeline reports to the runtime
// profiler. Each function gets a stable id (its position in name order,
// starting at 1; id 0 is pipeline overhead). Every producer is bracketed by
// push and pop calls for its id, and the whole pipeline by start and end
// calls that share one profiler state handle.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::ir::{intrinsics, mutate_stmt_children, Expr, IrMutator, Stmt, StmtNode, Type};
use crate::target::{Feature, Target};

use super::pass::{LowerContext, LoweringPass};
use super::trace::pipeline_name;

const STATE: &str = "profiler_state";

fn state() -> Expr {
    Expr::var_of(Type::handle(), STATE)
}

struct Instrument<'a> {
    ids: &'a BTreeMap<String, i64>,
}

impl IrMutator for Instrument<'_> {
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
        let Some(id) = self.ids.get(name) else {
            return s;
        };
        let call = |which: &str| {
            Stmt::evaluate(Expr::intrinsic(
                Type::i32(),
                which,
                vec![state(), Expr::int(*id)],
            ))
        };
        Stmt::block_of(vec![
            call(intrinsics::PROFILING_PUSH),
            s.clone(),
            call(intrinsics::PROFILING_POP),
        ])
    }
}

pub struct Profiling;

impl LoweringPass for Profiling {
    fn name(&self) -> &str {
        "profiling"
    }

    fn gate(&self, target: &Target) -> bool {
        target.has_feature(Feature::Profile)
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let ids: BTreeMap<String, i64> = ctx
            .env
            .keys()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as i64 + 1))
            .collect();
        let body = Instrument { ids: &ids }.mutate_stmt(&stmt);
        let start = Expr::intrinsic(
            Type::handle(),
            intrinsics::PROFILING_START,
            vec![
                Expr::string(pipeline_name(ctx)),
                Expr::int(ids.len() as i64 + 1),
            ],
        );
        let end = Stmt::evaluate(Expr::intrinsic(
            Type::i32(),
            intrinsics::PROFILING_END,
            vec![state()],
        ));
        Ok(Stmt::let_stmt(STATE, start, Stmt::block(body, end)))
    }
}

#[cfg(test)]
mod tests {
    use crate::func::{Pipeline, Var};
    use crate::lower::testing::run_until;
    use crate::options::LowerOptions;

    #[test]
    fn producers_are_bracketed() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() + 1]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx]).unwrap();
        p.compute_root(f);
        let options = LowerOptions {
            target: "host-profile".parse().unwrap(),
            ..Default::default()
        };
        let (s, _) = run_until(&p, &["g"], options, "profiling").unwrap();
        let out = s.to_string();
        assert!(
            out.starts_with("let profiler_state = halide_profiler_pipeline_start(\"g\", 3)\n"),
            "{}",
            out
        );
        let push = out.find("halide_profiler_push(profiler_state, 1)").unwrap();
        assert!(push < out.find("produce f {").unwrap(), "{}", out);
        assert!(out.contains("halide_profiler_pop(profiler_state, 2)"), "{}", out);
        assert!(out.trim_end().ends_with("halide_profiler_pipeline_end(profiler_state)"), "{}", out);
    }
}
