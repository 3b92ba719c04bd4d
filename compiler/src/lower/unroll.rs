// unroll.rs - Expand unrolled loops
//
// An `Unrolled` loop becomes one copy of its body per iteration with the
// loop variable replaced by `min + i`. The extent must fold to a constant.

use crate::diag::codes;
use crate::error::{Error, Result};
use crate::ir::{
    mutate_stmt_children, simplify, substitute_stmt, Expr, ForType, IrMutator, Stmt, StmtNode,
};

use super::pass::{LowerContext, LoweringPass};

#[derive(Default)]
struct Unroll {
    err: Option<Error>,
    unrolled: usize,
}

impl IrMutator for Unroll {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        let s = mutate_stmt_children(self, s);
        let StmtNode::For {
            name,
            min,
            extent,
            for_type: ForType::Unrolled,
            body,
            ..
        } = s.node()
        else {
            return s;
        };
        let Some(n) = simplify(extent).as_int() else {
            self.err = Some(LowerContext::user_error(
                codes::E0307_UNROLL_EXTENT,
                name,
                format!(
                    "can't unroll loop `{}`: its extent `{}` is not a constant",
                    name, extent
                ),
            ));
            return s;
        };
        self.unrolled += 1;
        let copies = (0..n.max(0)).map(|i| {
            let value = simplify(&(min.clone() + Expr::int(i)));
            substitute_stmt(name, &value, body)
        });
        Stmt::block_of(copies.collect::<Vec<_>>())
    }
}

pub struct UnrollLoops;

impl LoweringPass for UnrollLoops {
    fn name(&self) -> &str {
        "unroll"
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        let mut m = Unroll::default();
        let out = m.mutate_stmt(&stmt);
        if let Some(e) = m.err {
            return Err(e);
        }
        if m.unrolled > 0 {
            tracing::debug!(loops = m.unrolled, "unrolled");
        }
        Ok(out)
    }
}
