// uniquify.rs - Give every binder a distinct name
//
// Later passes identify loops and lets by name, so a `Let`, `LetStmt` or
// `For` that rebinds a name already bound somewhere earlier in the tree is
// renamed `<name>.<n>` and its uses follow.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::ir::{
    mutate_expr_children, mutate_stmt_children, Expr, ExprNode, IrMutator, Scope, Stmt, StmtNode,
};

use super::pass::{LowerContext, LoweringPass};

#[derive(Default)]
struct Uniquify {
    seen: BTreeMap<String, usize>,
    renamed: Scope<String>,
}

impl Uniquify {
    /// Name to use for a new binding of `name`.
    fn bind(&mut self, name: &str) -> String {
        let count = self.seen.entry(name.to_string()).or_insert(0);
        *count += 1;
        let fresh = if *count == 1 {
            name.to_string()
        } else {
            format!("{}.{}", name, *count - 1)
        };
        self.renamed.push(name, fresh.clone());
        fresh
    }
}

impl IrMutator for Uniquify {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.node() {
            ExprNode::Variable { ty, name } => match self.renamed.get(name) {
                Some(n) if n != name => Expr::var_of(*ty, n.clone()),
                _ => e.clone(),
            },
            ExprNode::Let { name, value, body } => {
                let value = self.mutate_expr(value);
                let fresh = self.bind(name);
                let body = self.mutate_expr(body);
                self.renamed.pop(name);
                Expr::let_in(fresh, value, body)
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { name, value, body } => {
                let value = self.mutate_expr(value);
                let fresh = self.bind(name);
                let body = self.mutate_stmt(body);
                self.renamed.pop(name);
                Stmt::let_stmt(fresh, value, body)
            }
            StmtNode::For {
                name,
                min,
                extent,
                for_type,
                device_api,
                body,
            } => {
                let min = self.mutate_expr(min);
                let extent = self.mutate_expr(extent);
                let fresh = self.bind(name);
                let body = self.mutate_stmt(body);
                self.renamed.pop(name);
                Stmt::for_loop(fresh, min, extent, *for_type, *device_api, body)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct UniquifyNames;

impl LoweringPass for UniquifyNames {
    fn name(&self) -> &str {
        "uniquify_names"
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        Ok(Uniquify::default().mutate_stmt(&stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DeviceApi, ForType};

    fn store(i: &str) -> Stmt {
        Stmt::store("buf", Expr::var(i), Expr::var(i), Expr::bool(true))
    }

    #[test]
    fn second_binding_is_renamed() {
        let a = Stmt::let_stmt("t", Expr::int(1), store("t"));
        let b = Stmt::let_stmt("t", Expr::int(2), store("t"));
        let mut ctx = LowerContext::new(Default::default());
        let out = UniquifyNames.run(Stmt::block(a, b), &mut ctx).unwrap();
        let text = out.to_string();
        assert!(text.contains("let t = 1\nbuf[t] = t\n"), "{}", text);
        assert!(text.contains("let t.1 = 2\nbuf[t.1] = t.1\n"), "{}", text);
    }

    #[test]
    fn loops_and_lets_share_a_namespace() {
        let inner = Stmt::for_loop(
            "i",
            Expr::int(0),
            Expr::int(4),
            ForType::Serial,
            DeviceApi::None,
            store("i"),
        );
        let outer = Stmt::for_loop(
            "i",
            Expr::var("i"),
            Expr::int(2),
            ForType::Serial,
            DeviceApi::None,
            inner,
        );
        let mut ctx = LowerContext::new(Default::default());
        let text = UniquifyNames.run(outer, &mut ctx).unwrap().to_string();
        assert!(text.starts_with("for (i, i, 2) {"), "{}", text);
        assert!(text.contains("for (i.1, 0, 4) {"), "{}", text);
        assert!(text.contains("buf[i.1] = i.1"), "{}", text);
    }
}
