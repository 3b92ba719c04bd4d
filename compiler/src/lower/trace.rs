// trace.rs - Trace event injection
//
// Functions marked with trace_loads / trace_stores / trace_realizations get
// `halide_trace` intrinsic calls around the matching accesses. A traced load
// wraps the loaded value (the intrinsic returns its value argument); a
// traced store evaluates the event just before the provide; a traced
// realization brackets the realization body. When anything is traced, or
// `trace_pipeline` is set, the whole pipeline is bracketed too.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::func::TraceFlags;
use crate::ir::{
    intrinsics, mutate_expr_children, mutate_stmt_children, CallType, Expr, ExprNode, IrMutator,
    Stmt, StmtNode, Type,
};

use super::pass::{LowerContext, LoweringPass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Load = 0,
    Store = 1,
    BeginRealization = 2,
    EndRealization = 3,
    BeginPipeline = 8,
    EndPipeline = 9,
}

/// `halide_trace(func, event, value_index, value, coords...)`.
pub fn trace_call(func: &str, event: TraceEvent, value_index: usize, value: Expr, coords: Vec<Expr>) -> Expr {
    let ty = value.ty();
    let mut args = vec![
        Expr::string(func),
        Expr::int(event as i64),
        Expr::int(value_index as i64),
        value,
    ];
    args.extend(coords);
    Expr::intrinsic(ty, intrinsics::TRACE, args)
}

struct InjectTracing<'a> {
    flags: &'a BTreeMap<String, TraceFlags>,
}

impl InjectTracing<'_> {
    fn flags(&self, func: &str) -> TraceFlags {
        self.flags.get(func).copied().unwrap_or_default()
    }
}

impl IrMutator for InjectTracing<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Call {
                name,
                args,
                call_type: CallType::Halide | CallType::Image,
                value_index,
                ..
            } if self.flags(name).loads => {
                trace_call(name, TraceEvent::Load, *value_index, e.clone(), args.clone())
            }
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::Provide { name, values, args } if self.flags(name).stores => {
                let s = mutate_stmt_children(self, s);
                let events = values.iter().enumerate().map(|(i, v)| {
                    let v = self.mutate_expr(v);
                    Stmt::evaluate(trace_call(name, TraceEvent::Store, i, v, args.clone()))
                });
                Stmt::block(Stmt::block_of(events), s)
            }
            StmtNode::Realize {
                name,
                types,
                memory_type,
                bounds,
                condition,
                body,
            } if self.flags(name).realizations => {
                let body = self.mutate_stmt(body);
                let coords: Vec<Expr> = bounds
                    .iter()
                    .flat_map(|r| [r.min.clone(), r.extent.clone()])
                    .collect();
                let zero = Expr::zero(types.first().copied().unwrap_or_else(Type::i32));
                let begin = trace_call(name, TraceEvent::BeginRealization, 0, zero.clone(), coords.clone());
                let end = trace_call(name, TraceEvent::EndRealization, 0, zero, coords);
                let body = Stmt::block_of([Stmt::evaluate(begin), body, Stmt::evaluate(end)]);
                StmtNode::Realize {
                    name: name.clone(),
                    types: types.clone(),
                    memory_type: *memory_type,
                    bounds: bounds.clone(),
                    condition: condition.clone(),
                    body,
                }
                .into()
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct InjectTracingPass;

impl LoweringPass for InjectTracingPass {
    fn name(&self) -> &str {
        "inject_tracing"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let flags: BTreeMap<String, TraceFlags> = ctx
            .env
            .values()
            .filter(|f| f.trace.any())
            .map(|f| (f.name.clone(), f.trace))
            .collect();
        if flags.is_empty() && !ctx.options.trace_pipeline {
            return Ok(stmt);
        }
        let body = InjectTracing { flags: &flags }.mutate_stmt(&stmt);
        let name = pipeline_name(ctx);
        let begin = trace_call(&name, TraceEvent::BeginPipeline, 0, Expr::int(0), Vec::new());
        let end = trace_call(&name, TraceEvent::EndPipeline, 0, Expr::int(0), Vec::new());
        Ok(Stmt::block_of([Stmt::evaluate(begin), body, Stmt::evaluate(end)]))
    }
}

/// The entry point name: the configured one or the first output's.
pub(crate) fn pipeline_name(ctx: &LowerContext) -> String {
    if ctx.options.pipeline_name.is_empty() {
        ctx.outputs.first().cloned().unwrap_or_else(|| "pipeline".to_string())
    } else {
        ctx.options.pipeline_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::func::{Pipeline, Var};
    use crate::lower::testing::run_until;
    use crate::options::LowerOptions;

    fn traced(on: bool) -> Pipeline {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() * 3]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx]).unwrap();
        p.compute_root(f);
        if on {
            p.trace_loads(f).trace_stores(f).trace_realizations(f);
        }
        p
    }

    #[test]
    fn traced_function_gets_events() {
        let (s, _) = run_until(&traced(true), &["g"], LowerOptions::default(), "inject_tracing").unwrap();
        let out = s.to_string();
        assert!(out.starts_with("halide_trace(\"g\", 8, 0, 0)"), "{}", out);
        assert!(out.contains("halide_trace(\"f\", 1, 0, (f.s0.x * 3), f.s0.x)"), "{}", out);
        assert!(out.contains("halide_trace(\"f\", 0, 0, f(g.s0.x), g.s0.x)"), "{}", out);
        assert!(out.contains("halide_trace(\"f\", 2, 0, 0,"), "{}", out);
        assert!(out.trim_end().ends_with("halide_trace(\"g\", 9, 0, 0)"), "{}", out);
    }

    #[test]
    fn untraced_pipeline_is_untouched() {
        let (s, _) = run_until(&traced(false), &["g"], LowerOptions::default(), "inject_tracing").unwrap();
        assert!(!s.to_string().contains("halide_trace"));
    }
}
