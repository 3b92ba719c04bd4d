// interval.rs - Symbolic interval arithmetic
//
// The bounds/value-range oracle used by bounds inference and by the
// scheduling checks. Bounds are expressions, possibly over free symbols;
// `None` means unbounded on that side. Results are sound, not tight.

use super::expr::{BinOp, Expr, ExprNode};
use super::scope::Scope;
use super::simplify::simplify;

#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

impl Interval {
    pub fn everything() -> Self {
        Interval {
            min: None,
            max: None,
        }
    }

    pub fn point(e: Expr) -> Self {
        Interval {
            min: Some(e.clone()),
            max: Some(e),
        }
    }

    pub fn new(min: Expr, max: Expr) -> Self {
        Interval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    pub fn is_single_point(&self) -> bool {
        matches!((&self.min, &self.max), (Some(a), Some(b)) if a == b)
    }

    /// Smallest interval containing both.
    pub fn union(&self, other: &Interval) -> Interval {
        Interval {
            min: both(&self.min, &other.min, Expr::min),
            max: both(&self.max, &other.max, Expr::max),
        }
    }

    pub fn simplified(self) -> Interval {
        Interval {
            min: self.min.map(|e| simplify(&e)),
            max: self.max.map(|e| simplify(&e)),
        }
    }
}

fn both(a: &Option<Expr>, b: &Option<Expr>, f: fn(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a.clone(), b.clone())),
        _ => None,
    }
}

/// Either side bounded is enough (used for the min of a min, the max of a max).
fn either(a: &Option<Expr>, b: &Option<Expr>, f: fn(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a.clone(), b.clone())),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

fn lift(a: &Option<Expr>, b: &Option<Expr>, op: BinOp) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Expr::binary(op, a.clone(), b.clone())),
        _ => None,
    }
}

/// Bounds of `e` given intervals for some of its free variables. Variables
/// not in `scope` are treated as single points.
pub fn bounds_of_expr_in_scope(e: &Expr, scope: &Scope<Interval>) -> Interval {
    let mut scope = scope.clone();
    bounds(e, &mut scope).simplified()
}

fn bounds(e: &Expr, scope: &mut Scope<Interval>) -> Interval {
    match e.node() {
        ExprNode::IntImm { .. }
        | ExprNode::UIntImm { .. }
        | ExprNode::FloatImm { .. }
        | ExprNode::StringImm(_) => Interval::point(e.clone()),
        ExprNode::Variable { name, .. } => match scope.get(name) {
            Some(i) => i.clone(),
            None => Interval::point(e.clone()),
        },
        ExprNode::Cast { ty, value } => {
            let i = bounds(value, scope);
            let narrowing = value.ty().is_int_or_uint()
                && ty.is_int_or_uint()
                && ty.bits < value.ty().bits;
            if narrowing {
                Interval::new(Expr::type_min(*ty), Expr::type_max(*ty))
            } else {
                Interval {
                    min: i.min.map(|m| Expr::cast(*ty, m)),
                    max: i.max.map(|m| Expr::cast(*ty, m)),
                }
            }
        }
        ExprNode::Binary { op, a, b } => {
            let ia = bounds(a, scope);
            let ib = bounds(b, scope);
            binary_bounds(*op, &ia, &ib, b)
        }
        ExprNode::Cmp { .. } | ExprNode::And { .. } | ExprNode::Or { .. } | ExprNode::Not { .. } => {
            let ty = e.ty();
            Interval::new(Expr::make_const(ty, 0), Expr::make_const(ty, 1))
        }
        ExprNode::Select {
            true_value,
            false_value,
            ..
        } => bounds(true_value, scope).union(&bounds(false_value, scope)),
        ExprNode::Shuffle { vectors, .. } => vectors
            .iter()
            .map(|v| bounds(v, scope))
            .reduce(|a, b| a.union(&b))
            .unwrap_or_else(Interval::everything),
        ExprNode::Load { .. } => type_bounds(e),
        ExprNode::Ramp {
            base,
            stride,
            lanes,
        } => {
            let last = base.clone() + stride.clone() * Expr::make_const(stride.ty(), *lanes as i64 - 1);
            bounds(base, scope).union(&bounds(&last, scope))
        }
        ExprNode::Broadcast { value, .. } => bounds(value, scope),
        ExprNode::Let { name, value, body } => {
            let iv = bounds(value, scope);
            scope.push(name.clone(), iv);
            let r = bounds(body, scope);
            scope.pop(name);
            r
        }
        ExprNode::Call { .. } => match e.as_likely() {
            Some(inner) => bounds(inner, scope),
            None => type_bounds(e),
        },
    }
}

/// The value range of an opaque narrow integer: anything its type can hold.
fn type_bounds(e: &Expr) -> Interval {
    let ty = e.ty();
    if ty.is_int_or_uint() && ty.bits < 32 {
        Interval::new(Expr::type_min(ty), Expr::type_max(ty))
    } else {
        Interval::everything()
    }
}

fn binary_bounds(op: BinOp, a: &Interval, b: &Interval, b_expr: &Expr) -> Interval {
    match op {
        BinOp::Add => Interval {
            min: lift(&a.min, &b.min, BinOp::Add),
            max: lift(&a.max, &b.max, BinOp::Add),
        },
        BinOp::Sub => Interval {
            min: lift(&a.min, &b.max, BinOp::Sub),
            max: lift(&a.max, &b.min, BinOp::Sub),
        },
        BinOp::Mul => {
            let scale = |k: i64, other: &Interval, c: &Expr| {
                if k >= 0 {
                    Interval {
                        min: other.min.clone().map(|m| m * c.clone()),
                        max: other.max.clone().map(|m| m * c.clone()),
                    }
                } else {
                    Interval {
                        min: other.max.clone().map(|m| m * c.clone()),
                        max: other.min.clone().map(|m| m * c.clone()),
                    }
                }
            };
            if let Some(k) = single_const(b) {
                return scale(k, a, b.min.as_ref().unwrap_or(b_expr));
            }
            if let Some(k) = single_const(a) {
                if let Some(c) = &a.min {
                    return scale(k, b, c);
                }
            }
            if a.is_single_point() && b.is_single_point() {
                return Interval {
                    min: lift(&a.min, &b.min, BinOp::Mul),
                    max: lift(&a.max, &b.max, BinOp::Mul),
                };
            }
            if a.is_bounded() && b.is_bounded() {
                let p = [
                    lift(&a.min, &b.min, BinOp::Mul),
                    lift(&a.min, &b.max, BinOp::Mul),
                    lift(&a.max, &b.min, BinOp::Mul),
                    lift(&a.max, &b.max, BinOp::Mul),
                ];
                let ps: Vec<Expr> = p.into_iter().flatten().collect();
                let lo = ps.iter().cloned().reduce(Expr::min);
                let hi = ps.into_iter().reduce(Expr::max);
                return Interval { min: lo, max: hi };
            }
            Interval::everything()
        }
        BinOp::Div => {
            if let Some(k) = single_const(b) {
                if k == 0 {
                    return Interval::point(Expr::zero(b_expr.ty()));
                }
                let c = b.min.clone().unwrap_or_else(|| b_expr.clone());
                return if k > 0 {
                    Interval {
                        min: a.min.clone().map(|m| m / c.clone()),
                        max: a.max.clone().map(|m| m / c.clone()),
                    }
                } else {
                    Interval {
                        min: a.max.clone().map(|m| m / c.clone()),
                        max: a.min.clone().map(|m| m / c.clone()),
                    }
                };
            }
            if a.is_single_point() && b.is_single_point() {
                return Interval {
                    min: lift(&a.min, &b.min, BinOp::Div),
                    max: lift(&a.max, &b.max, BinOp::Div),
                };
            }
            Interval::everything()
        }
        BinOp::Mod => {
            if let Some(k) = single_const(b) {
                if k > 0 && !b_expr.ty().is_float() {
                    let ty = b_expr.ty();
                    return Interval::new(Expr::zero(ty), Expr::make_const(ty, k - 1));
                }
            }
            if a.is_single_point() && b.is_single_point() {
                return Interval {
                    min: lift(&a.min, &b.min, BinOp::Mod),
                    max: lift(&a.max, &b.max, BinOp::Mod),
                };
            }
            Interval::everything()
        }
        BinOp::Min => Interval {
            min: both(&a.min, &b.min, Expr::min),
            max: either(&a.max, &b.max, Expr::min),
        },
        BinOp::Max => Interval {
            min: either(&a.min, &b.min, Expr::max),
            max: both(&a.max, &b.max, Expr::max),
        },
    }
}

fn single_const(i: &Interval) -> Option<i64> {
    if i.is_single_point() {
        i.min.as_ref().and_then(|e| simplify(e).as_int())
    } else {
        None
    }
}
