// free.rs - Allocation lifetimes
//
// `EarlyFree` places a `Free` right after the last top-level statement of an
// allocation's body that touches the buffer, so memory is released before
// the rest of the consumer runs. `RemoveDeadAllocations` drops allocations
// that nothing loads from or stores to, along with their frees.

use crate::error::Result;
use crate::ir::{
    mutate_stmt_children, stmt_uses_buffer, visit_expr_children, visit_stmt_children, Expr,
    ExprNode, IrMutator, IrVisitor, Stmt, StmtNode,
};
use crate::target::Target;

use super::pass::{LowerContext, LoweringPass};

// ── Early free ─────────────────────────────────────────────────────────────

/// Insert `free name` after the last statement of `body` that uses it,
/// looking through the lets that wrap the body.
fn insert_free(name: &str, body: &Stmt) -> Stmt {
    if let StmtNode::LetStmt {
        name: let_name,
        value,
        body: inner,
    } = body.node()
    {
        return Stmt::let_stmt(let_name.clone(), value.clone(), insert_free(name, inner));
    }
    let mut stmts = body.flatten_block();
    let last_use = stmts.iter().rposition(|s| stmt_uses_buffer(s, name));
    let at = last_use.map_or(stmts.len(), |i| i + 1);
    stmts.insert(at, Stmt::free(name));
    Stmt::block_of(stmts)
}

struct InjectFrees;

impl IrMutator for InjectFrees {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        match s.node() {
            StmtNode::Allocate {
                name,
                ty,
                memory_type,
                extents,
                condition,
                body,
            } if !has_free(body, name) => StmtNode::Allocate {
                name: name.clone(),
                ty: *ty,
                memory_type: *memory_type,
                extents: extents.clone(),
                condition: condition.clone(),
                body: insert_free(name, body),
            }
            .into(),
            _ => s,
        }
    }
}

fn has_free(s: &Stmt, name: &str) -> bool {
    struct Finds<'a> {
        name: &'a str,
        found: bool,
    }
    impl IrVisitor for Finds<'_> {
        fn visit_expr(&mut self, _e: &Expr) {}
        fn visit_stmt(&mut self, s: &Stmt) {
            match s.node() {
                StmtNode::Free { name } if name == self.name => self.found = true,
                _ => visit_stmt_children(self, s),
            }
        }
    }
    let mut f = Finds { name, found: false };
    f.visit_stmt(s);
    f.found
}

pub struct EarlyFree;

impl LoweringPass for EarlyFree {
    fn name(&self) -> &str {
        "early_free"
    }

    fn gate(&self, target: &Target) -> bool {
        !target.is_fpga()
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        Ok(InjectFrees.mutate_stmt(&stmt))
    }
}

// ── Dead allocations ───────────────────────────────────────────────────────

/// Does anything load from or store to `name`?
fn is_accessed(s: &Stmt, name: &str) -> bool {
    struct Accesses<'a> {
        name: &'a str,
        found: bool,
    }
    impl IrVisitor for Accesses<'_> {
        fn visit_expr(&mut self, e: &Expr) {
            match e.node() {
                ExprNode::Load { name, .. } if name == self.name => self.found = true,
                // Device runs take the whole buffer.
                ExprNode::Variable { name, .. }
                    if name.strip_suffix(".buffer") == Some(self.name) =>
                {
                    self.found = true
                }
                _ => visit_expr_children(self, e),
            }
        }
        fn visit_stmt(&mut self, s: &Stmt) {
            match s.node() {
                StmtNode::Store { name, .. } if name == self.name => self.found = true,
                _ => visit_stmt_children(self, s),
            }
        }
    }
    let mut a = Accesses { name, found: false };
    a.visit_stmt(s);
    a.found
}

struct DropFree<'a> {
    name: &'a str,
}

impl IrMutator for DropFree<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::Free { name } if name == self.name => Stmt::no_op(),
            _ => mutate_stmt_children(self, s),
        }
    }
}

#[derive(Default)]
struct RemoveDead {
    removed: Vec<String>,
}

impl IrMutator for RemoveDead {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        match s.node() {
            StmtNode::Allocate { name, body, .. } if !is_accessed(body, name) => {
                self.removed.push(name.clone());
                DropFree { name }.mutate_stmt(body)
            }
            _ => s,
        }
    }
}

pub struct RemoveDeadAllocations;

impl LoweringPass for RemoveDeadAllocations {
    fn name(&self) -> &str {
        "remove_dead_allocations"
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        let mut m = RemoveDead::default();
        let out = m.mutate_stmt(&stmt);
        if !m.removed.is_empty() {
            tracing::debug!(buffers = ?m.removed, "removed dead allocations");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::options::LowerOptions;

    fn alloc(name: &str, body: Stmt) -> Stmt {
        Stmt::allocate(name, Type::i32(), Default::default(), vec![Expr::int(4)], body)
    }

    fn ctx() -> LowerContext {
        LowerContext::new(LowerOptions::default())
    }

    #[test]
    fn free_follows_the_last_use() {
        let body = Stmt::block_of(vec![
            Stmt::store("t", Expr::int(1), Expr::int(0), Expr::bool(true)),
            Stmt::store(
                "out",
                Expr::load(Type::i32(), "t", Expr::int(0), Expr::bool(true)),
                Expr::int(0),
                Expr::bool(true),
            ),
            Stmt::store("out", Expr::int(2), Expr::int(1), Expr::bool(true)),
        ]);
        let out = EarlyFree.run(alloc("t", body), &mut ctx()).unwrap().to_string();
        insta::assert_snapshot!(out, @r"
        allocate t[int32 * 4]
        t[0] = 1
        out[0] = t[0]
        free t
        out[1] = 2
        ");
    }

    #[test]
    fn fpga_targets_keep_their_buffers() {
        let fpga: Target = "x86-64-linux-intel_fpga".parse().unwrap();
        assert!(!EarlyFree.gate(&fpga));
        assert!(EarlyFree.gate(&Target::host()));
    }

    #[test]
    fn unused_allocation_is_removed() {
        let body = Stmt::block(
            Stmt::store("out", Expr::int(2), Expr::int(1), Expr::bool(true)),
            Stmt::free("t"),
        );
        let out = RemoveDeadAllocations.run(alloc("t", body), &mut ctx()).unwrap();
        assert_eq!(out.to_string(), "out[1] = 2\n");
    }
}
