// substitute.rs - Replace free variables by expressions
//
// Substitution respects shadowing: a `Let`, `LetStmt` or `For` that rebinds
// a name hides it from the replacement map inside its body.

use std::collections::BTreeMap;

use super::expr::{Expr, ExprNode};
use super::stmt::{Stmt, StmtNode};
use super::visit::{mutate_expr_children, mutate_stmt_children, IrMutator};

struct Substitute<'a> {
    map: &'a BTreeMap<String, Expr>,
    hidden: Vec<String>,
}

impl Substitute<'_> {
    fn lookup(&self, name: &str) -> Option<&Expr> {
        if self.hidden.iter().any(|h| h == name) {
            return None;
        }
        self.map.get(name)
    }

    fn hides(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

impl IrMutator for Substitute<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.node() {
            ExprNode::Variable { name, .. } => match self.lookup(name) {
                Some(r) => r.clone(),
                None => e.clone(),
            },
            ExprNode::Let { name, value, body } if self.hides(name) => {
                let v = self.mutate_expr(value);
                self.hidden.push(name.clone());
                let b = self.mutate_expr(body);
                self.hidden.pop();
                if v.same_as(value) && b.same_as(body) {
                    e.clone()
                } else {
                    Expr::let_in(name.clone(), v, b)
                }
            }
            _ => mutate_expr_children(self, e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { name, value, body } if self.hides(name) => {
                let v = self.mutate_expr(value);
                self.hidden.push(name.clone());
                let b = self.mutate_stmt(body);
                self.hidden.pop();
                if v.same_as(value) && b.same_as(body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(name.clone(), v, b)
                }
            }
            StmtNode::For {
                name,
                min,
                extent,
                for_type,
                device_api,
                body,
            } if self.hides(name) => {
                let mn = self.mutate_expr(min);
                let ex = self.mutate_expr(extent);
                self.hidden.push(name.clone());
                let b = self.mutate_stmt(body);
                self.hidden.pop();
                Stmt::for_loop(name.clone(), mn, ex, *for_type, *device_api, b)
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub fn substitute(name: &str, replacement: &Expr, e: &Expr) -> Expr {
    let map: BTreeMap<String, Expr> = [(name.to_string(), replacement.clone())].into();
    substitute_map(&map, e)
}

pub fn substitute_map(map: &BTreeMap<String, Expr>, e: &Expr) -> Expr {
    if map.is_empty() {
        return e.clone();
    }
    Substitute {
        map,
        hidden: Vec::new(),
    }
    .mutate_expr(e)
}

pub fn substitute_stmt(name: &str, replacement: &Expr, s: &Stmt) -> Stmt {
    let map: BTreeMap<String, Expr> = [(name.to_string(), replacement.clone())].into();
    substitute_map_stmt(&map, s)
}

pub fn substitute_map_stmt(map: &BTreeMap<String, Expr>, s: &Stmt) -> Stmt {
    if map.is_empty() {
        return s.clone();
    }
    Substitute {
        map,
        hidden: Vec::new(),
    }
    .mutate_stmt(s)
}

/// Replace every occurrence of the subexpression `find` (structurally) by
/// `replacement`.
pub fn substitute_expr(find: &Expr, replacement: &Expr, e: &Expr) -> Expr {
    struct Graph<'a> {
        find: &'a Expr,
        replacement: &'a Expr,
    }
    impl IrMutator for Graph<'_> {
        fn mutate_expr(&mut self, e: &Expr) -> Expr {
            if e == self.find {
                self.replacement.clone()
            } else {
                mutate_expr_children(self, e)
            }
        }
    }
    Graph { find, replacement }.mutate_expr(e)
}

/// Rename every call to function `from` into a call to `to`.
pub fn rename_calls(from: &str, to: &str, e: &Expr) -> Expr {
    struct Rename<'a> {
        from: &'a str,
        to: &'a str,
    }
    impl IrMutator for Rename<'_> {
        fn mutate_expr(&mut self, e: &Expr) -> Expr {
            let e = mutate_expr_children(self, e);
            match e.node() {
                ExprNode::Call {
                    ty,
                    name,
                    args,
                    call_type,
                    value_index,
                } if name == self.from => {
                    Expr::call(*ty, self.to, args.clone(), *call_type, *value_index)
                }
                _ => e,
            }
        }
    }
    Rename { from, to }.mutate_expr(e)
}
