// associativity.rs - Proving that an update is an associative reduction
//
// An update `f(args) = values` is a reduction when each value combines the
// previous `f(args)` with a new term through an operator. The prover
// reports that operator as a pattern over placeholder variables `$xN`
// (the previous value of slot N) and `$yN` (the new term), with the
// operator's identity per slot. reorder, rfactor and atomic consult it.

use crate::ir::{
    substitute_map, visit_expr_children, BinOp, CallType, Expr, ExprNode, IrVisitor, Type,
};

/// A placeholder and the expression it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub var: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociativeOp {
    pub associative: bool,
    pub commutative: bool,
    pub identities: Vec<Expr>,
    /// Per slot, the operator in terms of `xs[i].var` and `ys[i].var`.
    pub ops: Vec<Expr>,
    /// Per slot, the self-reference. `var` is empty when the slot never
    /// reads the previous value.
    pub xs: Vec<Replacement>,
    pub ys: Vec<Replacement>,
}

impl AssociativeOp {
    pub fn not_proven() -> Self {
        AssociativeOp {
            associative: false,
            commutative: false,
            identities: Vec::new(),
            ops: Vec::new(),
            xs: Vec::new(),
            ys: Vec::new(),
        }
    }

    /// True when no slot reads the previous value of the function.
    pub fn has_no_self_reference(&self) -> bool {
        self.associative && self.xs.iter().all(|x| x.var.is_empty())
    }

    /// Instantiate slot `i`'s operator with concrete operands.
    pub fn apply(&self, i: usize, x: &Expr, y: &Expr) -> Option<Expr> {
        let op = self.ops.get(i)?;
        let mut map = std::collections::BTreeMap::new();
        if let Some(xv) = self.xs.get(i).filter(|r| !r.var.is_empty()) {
            map.insert(xv.var.clone(), x.clone());
        }
        map.insert(self.ys.get(i)?.var.clone(), y.clone());
        Some(substitute_map(&map, op))
    }
}

/// The associativity oracle. Proofs may be incomplete: `not_proven` means
/// "could not show it", never "shown to be non-associative".
pub trait AssociativityProver {
    fn prove(&self, func: &str, args: &[Expr], values: &[Expr]) -> AssociativeOp;
}

/// Recognises flattened chains of one commutative operator (`+`, `*`, `min`,
/// `max`, `&&`, `||`) with exactly one self-reference, and updates that do
/// not read the previous value at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternProver;

struct SelfCalls<'a> {
    func: &'a str,
    found: Vec<(Vec<Expr>, usize)>,
}

impl IrVisitor for SelfCalls<'_> {
    fn visit_expr(&mut self, e: &Expr) {
        if let ExprNode::Call {
            name,
            args,
            call_type: CallType::Halide,
            value_index,
            ..
        } = e.node()
        {
            if name == self.func {
                self.found.push((args.clone(), *value_index));
            }
        }
        visit_expr_children(self, e);
    }
}

fn self_calls(func: &str, e: &Expr) -> Vec<(Vec<Expr>, usize)> {
    let mut v = SelfCalls {
        func,
        found: Vec::new(),
    };
    v.visit_expr(e);
    v.found
}

/// The argument lists of every read of `func` in `values`.
pub fn self_call_args(func: &str, values: &[Expr]) -> Vec<Vec<Expr>> {
    values
        .iter()
        .flat_map(|v| self_calls(func, v))
        .map(|(args, _)| args)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChainOp {
    Bin(BinOp),
    And,
    Or,
}

impl ChainOp {
    fn of(e: &Expr) -> Option<ChainOp> {
        match e.node() {
            ExprNode::Binary { op, .. }
                if matches!(op, BinOp::Add | BinOp::Mul | BinOp::Min | BinOp::Max) =>
            {
                Some(ChainOp::Bin(*op))
            }
            ExprNode::And { .. } => Some(ChainOp::And),
            ExprNode::Or { .. } => Some(ChainOp::Or),
            _ => None,
        }
    }

    fn combine(self, a: Expr, b: Expr) -> Expr {
        match self {
            ChainOp::Bin(op) => Expr::binary(op, a, b),
            ChainOp::And => Expr::and(a, b),
            ChainOp::Or => Expr::or(a, b),
        }
    }

    fn identity(self, ty: Type) -> Expr {
        match self {
            ChainOp::Bin(BinOp::Add) => Expr::zero(ty),
            ChainOp::Bin(BinOp::Mul) => Expr::one(ty),
            ChainOp::Bin(BinOp::Min) => Expr::type_max(ty),
            ChainOp::Bin(BinOp::Max) => Expr::type_min(ty),
            ChainOp::And | ChainOp::Bin(_) => Expr::bool(true),
            ChainOp::Or => Expr::bool(false),
        }
    }
}

fn flatten(op: ChainOp, e: &Expr, out: &mut Vec<Expr>) {
    let (a, b) = match (op, e.node()) {
        (ChainOp::Bin(want), ExprNode::Binary { op, a, b }) if *op == want => (a, b),
        (ChainOp::And, ExprNode::And { a, b }) | (ChainOp::Or, ExprNode::Or { a, b }) => (a, b),
        _ => {
            out.push(e.clone());
            return;
        }
    };
    flatten(op, a, out);
    flatten(op, b, out);
}

struct Slot {
    op: Expr,
    x: Replacement,
    y: Replacement,
    identity: Expr,
    commutative: bool,
}

fn prove_slot(func: &str, args: &[Expr], i: usize, value: &Expr) -> Option<Slot> {
    let calls = self_calls(func, value);
    let ty = value.ty();
    let xname = format!("$x{}", i);
    let yname = format!("$y{}", i);
    let y = Expr::var_of(ty, yname.clone());
    if calls.is_empty() {
        return Some(Slot {
            op: y,
            x: Replacement {
                var: String::new(),
                expr: Expr::zero(ty),
            },
            y: Replacement {
                var: yname,
                expr: value.clone(),
            },
            identity: Expr::zero(ty),
            commutative: false,
        });
    }
    if calls.len() != 1 || calls[0].0.as_slice() != args || calls[0].1 != i {
        return None;
    }
    let op = ChainOp::of(value)?;
    let mut terms = Vec::new();
    flatten(op, value, &mut terms);
    let self_pos = terms.iter().position(|t| !self_calls(func, t).is_empty())?;
    let self_term = terms.remove(self_pos);
    if !matches!(self_term.node(), ExprNode::Call { name, .. } if name == func) {
        return None;
    }
    let rest = terms.into_iter().reduce(|a, b| op.combine(a, b))?;
    let x = Expr::var_of(ty, xname.clone());
    Some(Slot {
        op: op.combine(x, y),
        x: Replacement {
            var: xname,
            expr: self_term,
        },
        y: Replacement {
            var: yname,
            expr: rest,
        },
        identity: op.identity(ty),
        commutative: true,
    })
}

impl AssociativityProver for PatternProver {
    fn prove(&self, func: &str, args: &[Expr], values: &[Expr]) -> AssociativeOp {
        let mut out = AssociativeOp {
            associative: true,
            commutative: true,
            ..AssociativeOp::not_proven()
        };
        for (i, v) in values.iter().enumerate() {
            let Some(slot) = prove_slot(func, args, i, v) else {
                return AssociativeOp::not_proven();
            };
            out.commutative &= slot.commutative;
            out.ops.push(slot.op);
            out.xs.push(slot.x);
            out.ys.push(slot.y);
            out.identities.push(slot.identity);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f_at(args: &[Expr]) -> Expr {
        Expr::call(Type::i32(), "f", args.to_vec(), CallType::Halide, 0)
    }

    #[test]
    fn sum_chain_is_commutative() {
        let args = vec![Expr::var("x")];
        let v = Expr::var("a") + f_at(&args) + Expr::var("b");
        let op = PatternProver.prove("f", &args, &[v]);
        assert!(op.associative && op.commutative);
        assert!(op.identities[0].is_zero());
        assert_eq!(op.ys[0].expr.to_string(), "(a + b)");
        let applied = op.apply(0, &Expr::var("p"), &Expr::var("q")).unwrap();
        assert_eq!(applied.to_string(), "(p + q)");
    }

    #[test]
    fn min_identity_is_type_max() {
        let args = vec![Expr::var("x")];
        let v = Expr::min(f_at(&args), Expr::var("a"));
        let op = PatternProver.prove("f", &args, &[v]);
        assert!(op.associative);
        assert_eq!(op.identities[0].as_int(), Some(i32::MAX as i64));
    }

    #[test]
    fn subtraction_and_shifted_reads_are_not_proven() {
        let args = vec![Expr::var("x")];
        let sub = f_at(&args) - Expr::var("a");
        assert!(!PatternProver.prove("f", &args, &[sub]).associative);
        let shifted = f_at(&[Expr::var("x") - 1]) + Expr::var("a");
        assert!(!PatternProver.prove("f", &args, &[shifted]).associative);
        let twice = f_at(&args) + f_at(&args);
        assert!(!PatternProver.prove("f", &args, &[twice]).associative);
    }

    #[test]
    fn no_self_reference_is_last_write_wins() {
        let args = vec![Expr::var("x")];
        let op = PatternProver.prove("f", &args, &[Expr::var("a") * 2]);
        assert!(op.associative);
        assert!(!op.commutative);
        assert!(op.has_no_self_reference());
    }
}
