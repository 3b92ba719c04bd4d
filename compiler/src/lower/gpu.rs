// gpu.rs - GPU loop canonicalization and device API selection
//
// Device backends address GPU loops by fixed names. Block loops become
// `<name>.__block_id_<x|y|z>` and thread (and lane) loops become
// `<name>.__thread_id_<x|y|z>`, counting from the innermost loop of each
// kind outwards. A fourth nested loop of one kind has no hardware dimension
// left and is rejected.
//
// After vectorization and unrolling, loops still marked `DefaultGpu` take
// the target's concrete API.

use crate::diag::codes;
use crate::error::{Error, Result};
use crate::ir::{
    mutate_stmt_children, substitute_stmt, visit_stmt_children, DeviceApi, Expr, ForType,
    IrMutator, IrVisitor, Stmt, StmtNode, Type,
};
use crate::target::Target;

use super::pass::{LowerContext, LoweringPass};

const AXES: [char; 3] = ['x', 'y', 'z'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuKind {
    Block,
    Thread,
}

fn kind_of(for_type: ForType) -> Option<GpuKind> {
    match for_type {
        ForType::GpuBlock => Some(GpuKind::Block),
        ForType::GpuThread | ForType::GpuLane => Some(GpuKind::Thread),
        _ => None,
    }
}

/// Deepest chain of nested loops of `kind` in a statement.
struct NestDepth {
    kind: GpuKind,
    current: usize,
    deepest: usize,
}

impl IrVisitor for NestDepth {
    fn visit_stmt(&mut self, s: &Stmt) {
        if let StmtNode::For { for_type, .. } = s.node() {
            if kind_of(*for_type) == Some(self.kind) {
                self.current += 1;
                self.deepest = self.deepest.max(self.current);
                visit_stmt_children(self, s);
                self.current -= 1;
                return;
            }
        }
        visit_stmt_children(self, s);
    }
}

fn nest_depth(s: &Stmt, kind: GpuKind) -> usize {
    let mut v = NestDepth {
        kind,
        current: 0,
        deepest: 0,
    };
    v.visit_stmt(s);
    v.deepest
}

struct Canonicalize {
    err: Option<Error>,
}

impl IrMutator for Canonicalize {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        let StmtNode::For {
            name,
            min,
            extent,
            for_type,
            device_api,
            body,
        } = s.node()
        else {
            return mutate_stmt_children(self, s);
        };
        let Some(kind) = kind_of(*for_type) else {
            return mutate_stmt_children(self, s);
        };
        let body = self.mutate_stmt(body);
        let depth = nest_depth(&body, kind);
        let Some(axis) = AXES.get(depth) else {
            self.err.get_or_insert(LowerContext::user_error(
                codes::E0310_GPU_NESTING,
                name,
                format!(
                    "loop `{}` is nested inside {} other GPU {} loops; at most three are available",
                    name,
                    depth,
                    if kind == GpuKind::Block { "block" } else { "thread" }
                ),
            ));
            return s.clone();
        };
        let suffix = match kind {
            GpuKind::Block => "__block_id_",
            GpuKind::Thread => "__thread_id_",
        };
        let fresh = format!("{}.{}{}", name, suffix, axis);
        let body = substitute_stmt(name, &Expr::var_of(Type::i32(), fresh.clone()), &body);
        Stmt::for_loop(fresh, min.clone(), extent.clone(), *for_type, *device_api, body)
    }
}

pub struct CanonicalizeGpuVars;

impl LoweringPass for CanonicalizeGpuVars {
    fn name(&self) -> &str {
        "canonicalize_gpu_vars"
    }

    fn gate(&self, target: &Target) -> bool {
        target.has_gpu_feature()
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        let mut m = Canonicalize { err: None };
        let out = m.mutate_stmt(&stmt);
        match m.err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

struct SelectApi {
    api: DeviceApi,
}

impl IrMutator for SelectApi {
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
                for_type,
                device_api: DeviceApi::DefaultGpu,
                body,
            } => Stmt::for_loop(
                name.clone(),
                min.clone(),
                extent.clone(),
                *for_type,
                self.api,
                body.clone(),
            ),
            _ => s,
        }
    }
}

pub struct SelectGpuApi;

impl LoweringPass for SelectGpuApi {
    fn name(&self) -> &str {
        "select_gpu_api"
    }

    fn gate(&self, target: &Target) -> bool {
        target.has_gpu_feature()
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let Some(api) = ctx.target().default_gpu_api() else {
            return Err(LowerContext::user_error(
                codes::E0306_NO_GPU,
                "default_gpu",
                format!("target `{}` has no GPU API to run default GPU loops on", ctx.target()),
            ));
        };
        Ok(SelectApi { api }.mutate_stmt(&stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LowerOptions;

    fn cuda_ctx() -> LowerContext {
        LowerContext::new(LowerOptions {
            target: "host-cuda".parse().unwrap(),
            ..Default::default()
        })
    }

    fn gpu_loop(name: &str, for_type: ForType, body: Stmt) -> Stmt {
        Stmt::for_loop(name, Expr::int(0), Expr::int(16), for_type, DeviceApi::DefaultGpu, body)
    }

    fn store(vars: &[&str]) -> Stmt {
        let index = vars
            .iter()
            .map(|v| Expr::var(*v))
            .reduce(|acc, v| acc + v)
            .unwrap_or_else(|| Expr::int(0));
        Stmt::store("out", Expr::int(1), index, Expr::bool(true))
    }

    #[test]
    fn loops_are_named_innermost_first() {
        let s = gpu_loop(
            "by",
            ForType::GpuBlock,
            gpu_loop(
                "bx",
                ForType::GpuBlock,
                gpu_loop("tx", ForType::GpuThread, store(&["by", "bx", "tx"])),
            ),
        );
        let out = CanonicalizeGpuVars.run(s, &mut cuda_ctx()).unwrap().to_string();
        assert!(out.contains("gpu_block<DefaultGpu> (by.__block_id_y, 0, 16)"), "{}", out);
        assert!(out.contains("gpu_block<DefaultGpu> (bx.__block_id_x, 0, 16)"), "{}", out);
        assert!(out.contains("gpu_thread<DefaultGpu> (tx.__thread_id_x, 0, 16)"), "{}", out);
        assert!(out.contains("out[((by.__block_id_y + bx.__block_id_x) + tx.__thread_id_x)]"), "{}", out);
    }

    #[test]
    fn four_nested_block_loops_are_rejected() {
        let s = ["a", "b", "c", "d"]
            .iter()
            .fold(store(&[]), |acc, n| gpu_loop(n, ForType::GpuBlock, acc));
        let err = CanonicalizeGpuVars.run(s, &mut cuda_ctx()).unwrap_err();
        assert_eq!(err.code(), Some("E0310"));
    }

    #[test]
    fn default_gpu_resolves_to_the_target_api() {
        let s = gpu_loop("bx", ForType::GpuBlock, store(&["bx"]));
        let out = SelectGpuApi.run(s, &mut cuda_ctx()).unwrap().to_string();
        assert!(out.contains("<Cuda>"), "{}", out);
        assert!(!out.contains("DefaultGpu"), "{}", out);
    }
}
