// simplify.rs - Constant folding and light algebraic canonicalisation
//
// Bottom-up, single pass. Integer Add/Sub/Mul-by-constant trees are
// normalised into a linear form (terms with coefficients plus a constant),
// which is what lets loop-bound expressions such as
// `((m + e) - 1) - m + 1` collapse to `e`. Comparisons, min and max of
// integers are decided when the difference of their operands folds to a
// constant. Nothing here is exhaustive; a rule that does not apply leaves
// the node as it is.

use super::expr::{BinOp, CallType, CmpOp, Expr, ExprNode};
use super::stmt::{DeviceApi, ForType, Stmt, StmtNode};
use super::substitute::{substitute, substitute_stmt};
use super::types::{Type, TypeCode};
use super::visit::{
    expr_uses_var, mutate_expr_children, mutate_stmt_children, stmt_uses_var, IrMutator,
};

pub fn simplify(e: &Expr) -> Expr {
    Simplifier.mutate_expr(e)
}

pub fn simplify_stmt(s: &Stmt) -> Stmt {
    Simplifier.mutate_stmt(s)
}

/// True when `e` simplifies to the boolean constant `true`.
pub fn can_prove(e: &Expr) -> bool {
    simplify(e).is_true()
}

/// Evaluate `e` to an integer if it folds to one.
pub fn const_int_value(e: &Expr) -> Option<i64> {
    simplify(e).as_int()
}

// ── Constant arithmetic ────────────────────────────────────────────────────

pub(crate) fn wrap(ty: Type, v: i64) -> i64 {
    match ty.code {
        TypeCode::Int if ty.bits < 64 => {
            let shift = 64 - ty.bits as u32;
            (v << shift) >> shift
        }
        TypeCode::UInt if ty.bits < 64 => v & ((1i64 << ty.bits) - 1),
        _ => v,
    }
}

pub(crate) fn fold_int(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                0
            } else {
                a.div_euclid(b)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                0
            } else {
                a.rem_euclid(b)
            }
        }
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
    }
}

pub(crate) fn fold_float(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Min => a.min(b),
        BinOp::Max => a.max(b),
    }
}

pub(crate) fn fold_cmp<T: PartialOrd>(op: CmpOp, a: T, b: T) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

fn float_const(e: &Expr) -> Option<f64> {
    match e.node() {
        ExprNode::FloatImm { value, .. } => Some(*value),
        _ => None,
    }
}

fn is_int_scalar(ty: Type) -> bool {
    ty.is_int() && ty.is_scalar()
}

// ── Linear forms ───────────────────────────────────────────────────────────

struct Linear {
    terms: Vec<(Expr, i64)>,
    constant: i64,
}

impl Linear {
    fn of(e: &Expr) -> Linear {
        let mut l = Linear {
            terms: Vec::new(),
            constant: 0,
        };
        l.collect(e, 1);
        l
    }

    fn collect(&mut self, e: &Expr, scale: i64) {
        if let Some(v) = e.as_int() {
            self.constant = self.constant.wrapping_add(v.wrapping_mul(scale));
            return;
        }
        match e.node() {
            ExprNode::Binary {
                op: BinOp::Add,
                a,
                b,
            } => {
                self.collect(a, scale);
                self.collect(b, scale);
            }
            ExprNode::Binary {
                op: BinOp::Sub,
                a,
                b,
            } => {
                self.collect(a, scale);
                self.collect(b, -scale);
            }
            ExprNode::Binary {
                op: BinOp::Mul,
                a,
                b,
            } if b.as_int().is_some() => {
                let k = b.as_int().unwrap_or(1);
                self.collect(a, scale.wrapping_mul(k));
            }
            ExprNode::Binary {
                op: BinOp::Mul,
                a,
                b,
            } if a.as_int().is_some() => {
                let k = a.as_int().unwrap_or(1);
                self.collect(b, scale.wrapping_mul(k));
            }
            _ => self.add_term(e, scale),
        }
    }

    fn add_term(&mut self, e: &Expr, coeff: i64) {
        if let Some(t) = self.terms.iter_mut().find(|(t, _)| t == e) {
            t.1 = t.1.wrapping_add(coeff);
        } else {
            self.terms.push((e.clone(), coeff));
        }
    }

    fn rebuild(&self, ty: Type) -> Expr {
        let mut acc: Option<Expr> = None;
        let mut constant = self.constant;
        for (t, c) in self.terms.iter().filter(|(_, c)| *c > 0) {
            let term = if *c == 1 {
                t.clone()
            } else {
                mk_bin(BinOp::Mul, t.clone(), Expr::make_const(ty, *c))
            };
            acc = Some(match acc {
                Some(a) => mk_bin(BinOp::Add, a, term),
                None => term,
            });
        }
        for (t, c) in self.terms.iter().filter(|(_, c)| *c < 0) {
            let term = if *c == -1 {
                t.clone()
            } else {
                mk_bin(BinOp::Mul, t.clone(), Expr::make_const(ty, -*c))
            };
            acc = Some(match acc {
                Some(a) => mk_bin(BinOp::Sub, a, term),
                None => {
                    let lhs = Expr::make_const(ty, constant);
                    constant = 0;
                    mk_bin(BinOp::Sub, lhs, term)
                }
            });
        }
        match acc {
            None => Expr::make_const(ty, wrap(ty, constant)),
            Some(a) if constant == 0 => a,
            Some(a) if constant > 0 => mk_bin(BinOp::Add, a, Expr::make_const(ty, constant)),
            Some(a) => mk_bin(BinOp::Sub, a, Expr::make_const(ty, constant.wrapping_neg())),
        }
    }
}

fn mk_bin(op: BinOp, a: Expr, b: Expr) -> Expr {
    ExprNode::Binary { op, a, b }.into()
}

/// `a - b` folded to a constant, for scalar integers.
fn const_difference(a: &Expr, b: &Expr) -> Option<i64> {
    if !is_int_scalar(a.ty()) || a.ty() != b.ty() {
        return None;
    }
    let mut l = Linear::of(a);
    l.collect(b, -1);
    if l.terms.iter().all(|(_, c)| *c == 0) {
        Some(l.constant)
    } else {
        None
    }
}

// ── The simplifier ─────────────────────────────────────────────────────────

struct Simplifier;

/// Lets whose values are cheap to duplicate get substituted away.
fn is_simple_let_value(e: &Expr) -> bool {
    match e.node() {
        ExprNode::IntImm { .. }
        | ExprNode::UIntImm { .. }
        | ExprNode::FloatImm { .. }
        | ExprNode::Variable { .. } => true,
        ExprNode::Broadcast { value, .. } => is_simple_let_value(value),
        ExprNode::Ramp { base, stride, .. } => {
            is_simple_let_value(base) && is_simple_let_value(stride)
        }
        _ => false,
    }
}

impl Simplifier {
    fn binary(&mut self, op: BinOp, a: Expr, b: Expr) -> Expr {
        let ty = a.ty();
        // Constant folding.
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            if ty.is_int_or_uint() {
                return Expr::make_const(ty, wrap(ty, fold_int(op, x, y)));
            }
        }
        if let (Some(x), Some(y)) = (float_const(&a), float_const(&b)) {
            let mut v = fold_float(op, x, y);
            if ty.bits == 32 {
                v = v as f32 as f64;
            }
            return Expr::make_float(ty, v);
        }
        // Vector forms.
        match (a.node(), b.node()) {
            (
                ExprNode::Broadcast { value: x, lanes },
                ExprNode::Broadcast { value: y, .. },
            ) => {
                let inner = self.binary(op, x.clone(), y.clone());
                return Expr::broadcast(inner, *lanes);
            }
            (
                ExprNode::Ramp {
                    base,
                    stride,
                    lanes,
                },
                ExprNode::Broadcast { value, .. },
            ) => match op {
                BinOp::Add | BinOp::Sub => {
                    let nb = self.binary(op, base.clone(), value.clone());
                    return Expr::ramp(nb, stride.clone(), *lanes);
                }
                BinOp::Mul => {
                    let nb = self.binary(op, base.clone(), value.clone());
                    let ns = self.binary(op, stride.clone(), value.clone());
                    return Expr::ramp(nb, ns, *lanes);
                }
                _ => {}
            },
            (
                ExprNode::Broadcast { value, .. },
                ExprNode::Ramp {
                    base,
                    stride,
                    lanes,
                },
            ) => match op {
                BinOp::Add => {
                    let nb = self.binary(op, value.clone(), base.clone());
                    return Expr::ramp(nb, stride.clone(), *lanes);
                }
                BinOp::Sub => {
                    let nb = self.binary(op, value.clone(), base.clone());
                    let zero = Expr::zero(stride.ty());
                    let ns = self.binary(BinOp::Sub, zero, stride.clone());
                    return Expr::ramp(nb, ns, *lanes);
                }
                BinOp::Mul => {
                    let nb = self.binary(op, value.clone(), base.clone());
                    let ns = self.binary(op, value.clone(), stride.clone());
                    return Expr::ramp(nb, ns, *lanes);
                }
                _ => {}
            },
            (
                ExprNode::Ramp {
                    base: b1,
                    stride: s1,
                    lanes,
                },
                ExprNode::Ramp {
                    base: b2,
                    stride: s2,
                    ..
                },
            ) if matches!(op, BinOp::Add | BinOp::Sub) => {
                let nb = self.binary(op, b1.clone(), b2.clone());
                let ns = self.binary(op, s1.clone(), s2.clone());
                return Expr::ramp(nb, ns, *lanes);
            }
            _ => {}
        }

        let int_scalar = is_int_scalar(ty);
        match op {
            BinOp::Add | BinOp::Sub if int_scalar => {
                Linear::of(&mk_bin(op, a, b)).rebuild(ty)
            }
            BinOp::Mul if int_scalar && (a.as_int().is_some() || b.as_int().is_some()) => {
                if a.is_zero() || b.is_zero() {
                    return Expr::zero(ty);
                }
                Linear::of(&mk_bin(op, a, b)).rebuild(ty)
            }
            BinOp::Add if b.is_zero() => a,
            BinOp::Add if a.is_zero() => b,
            BinOp::Sub if b.is_zero() => a,
            BinOp::Mul if b.is_one() => a,
            BinOp::Mul if a.is_one() => b,
            BinOp::Div if b.is_one() => a,
            BinOp::Div | BinOp::Mod if int_scalar && b.as_int().is_some_and(|k| k > 0) => {
                let k = b.as_int().unwrap_or(1);
                self.div_mod(op, &a, k, ty)
            }
            BinOp::Min | BinOp::Max => {
                if a == b {
                    return a;
                }
                if let Some(d) = const_difference(&a, &b) {
                    let a_wins = if op == BinOp::Min { d <= 0 } else { d >= 0 };
                    return if a_wins { a } else { b };
                }
                if op == BinOp::Min && b == Expr::type_max(ty) {
                    return a;
                }
                if op == BinOp::Max && b == Expr::type_min(ty) {
                    return a;
                }
                // Keep constants on the right.
                if a.is_const() && !b.is_const() {
                    return mk_bin(op, b, a);
                }
                mk_bin(op, a, b)
            }
            _ => mk_bin(op, a, b),
        }
    }

    fn div_mod(&mut self, op: BinOp, a: &Expr, k: i64, ty: Type) -> Expr {
        let lin = Linear::of(a);
        let mut quotient = Linear {
            terms: Vec::new(),
            constant: lin.constant.div_euclid(k),
        };
        let mut rest = Linear {
            terms: Vec::new(),
            constant: lin.constant.rem_euclid(k),
        };
        for (t, c) in &lin.terms {
            if c % k == 0 {
                quotient.terms.push((t.clone(), c / k));
            } else {
                rest.terms.push((t.clone(), *c));
            }
        }
        let rest_expr = rest.rebuild(ty);
        let kk = Expr::make_const(ty, k);
        if op == BinOp::Mod {
            return match rest_expr.as_int() {
                Some(v) => Expr::make_const(ty, v.rem_euclid(k)),
                None => mk_bin(BinOp::Mod, rest_expr, kk),
            };
        }
        let rest_div = match rest_expr.as_int() {
            Some(v) => Expr::make_const(ty, v.div_euclid(k)),
            None => mk_bin(BinOp::Div, rest_expr, kk),
        };
        if quotient.terms.is_empty() && quotient.constant == 0 {
            rest_div
        } else {
            let q = quotient.rebuild(ty);
            self.binary(BinOp::Add, q, rest_div)
        }
    }

    fn compare(&mut self, op: CmpOp, a: Expr, b: Expr) -> Expr {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Expr::bool(fold_cmp(op, x, y));
        }
        if let (Some(x), Some(y)) = (float_const(&a), float_const(&b)) {
            return Expr::bool(fold_cmp(op, x, y));
        }
        if let (
            ExprNode::Broadcast { value: x, lanes },
            ExprNode::Broadcast { value: y, .. },
        ) = (a.node(), b.node())
        {
            let inner = self.compare(op, x.clone(), y.clone());
            return Expr::broadcast(inner, *lanes);
        }
        if let Some(d) = const_difference(&a, &b) {
            return Expr::bool(fold_cmp(op, d, 0));
        }
        if a == b && !a.ty().is_float() {
            return Expr::bool(matches!(op, CmpOp::Eq | CmpOp::Le | CmpOp::Ge));
        }
        ExprNode::Cmp { op, a, b }.into()
    }
}

fn const_bool(e: &Expr) -> Option<bool> {
    match e.node() {
        ExprNode::UIntImm { ty, value } if ty.is_bool() => Some(*value != 0),
        ExprNode::Broadcast { value, .. } => const_bool(value),
        _ => None,
    }
}

impl IrMutator for Simplifier {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        // Lets are handled top-down so the substituted body is simplified
        // with the value in place.
        if let ExprNode::Let { name, value, body } = e.node() {
            let v = self.mutate_expr(value);
            if is_simple_let_value(&v) {
                return self.mutate_expr(&substitute(name, &v, body));
            }
            let b = self.mutate_expr(body);
            if !expr_uses_var(&b, name) {
                return b;
            }
            return Expr::let_in(name.clone(), v, b);
        }
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Binary { op, a, b } => self.binary(*op, a.clone(), b.clone()),
            ExprNode::Cmp { op, a, b } => self.compare(*op, a.clone(), b.clone()),
            ExprNode::And { a, b } => match (const_bool(a), const_bool(b)) {
                (Some(false), _) | (_, Some(false)) => Expr::make_const(e.ty(), 0),
                (Some(true), _) => b.clone(),
                (_, Some(true)) => a.clone(),
                _ if a == b => a.clone(),
                _ => e,
            },
            ExprNode::Or { a, b } => match (const_bool(a), const_bool(b)) {
                (Some(true), _) | (_, Some(true)) => Expr::make_const(e.ty(), 1),
                (Some(false), _) => b.clone(),
                (_, Some(false)) => a.clone(),
                _ if a == b => a.clone(),
                _ => e,
            },
            ExprNode::Not { a } => match (const_bool(a), a.node()) {
                (Some(v), _) => Expr::make_const(e.ty(), (!v) as i64),
                (_, ExprNode::Not { a: inner }) => inner.clone(),
                (_, ExprNode::Cmp { op, a: x, b: y }) => {
                    let inv = match op {
                        CmpOp::Eq => CmpOp::Ne,
                        CmpOp::Ne => CmpOp::Eq,
                        CmpOp::Lt => CmpOp::Ge,
                        CmpOp::Le => CmpOp::Gt,
                        CmpOp::Gt => CmpOp::Le,
                        CmpOp::Ge => CmpOp::Lt,
                    };
                    if x.ty().is_float() {
                        e
                    } else {
                        ExprNode::Cmp {
                            op: inv,
                            a: x.clone(),
                            b: y.clone(),
                        }
                        .into()
                    }
                }
                _ => e,
            },
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => match const_bool(condition) {
                Some(true) => true_value.clone(),
                Some(false) => false_value.clone(),
                None if true_value == false_value => true_value.clone(),
                None => e,
            },
            ExprNode::Cast { ty, value } => {
                let ty = *ty;
                if ty.is_scalar() {
                    if let Some(v) = value.as_int() {
                        return if ty.is_float() {
                            Expr::make_float(ty, v as f64)
                        } else {
                            Expr::make_const(ty, wrap(ty, v))
                        };
                    }
                    if let Some(v) = float_const(value) {
                        return if ty.is_float() {
                            let v = if ty.bits == 32 { v as f32 as f64 } else { v };
                            Expr::make_float(ty, v)
                        } else {
                            Expr::make_const(ty, wrap(ty, v.trunc() as i64))
                        };
                    }
                }
                if let ExprNode::Broadcast { value: inner, lanes } = value.node() {
                    let c = self.mutate_expr(&Expr::cast(ty.element_of(), inner.clone()));
                    return Expr::broadcast(c, *lanes);
                }
                e
            }
            ExprNode::Ramp {
                base,
                stride,
                lanes,
            } if stride.is_zero() => Expr::broadcast(base.clone(), *lanes),
            ExprNode::Call {
                args,
                call_type: CallType::PureIntrinsic,
                ..
            } if e.as_likely().is_some() && args[0].is_const() => args[0].clone(),
            ExprNode::Shuffle { vectors, indices } if vectors.len() == 1 && indices.len() == 1 => {
                let i = indices[0] as i64;
                match vectors[0].node() {
                    ExprNode::Ramp { base, stride, .. } => {
                        let off = self.binary(BinOp::Mul, stride.clone(), Expr::make_const(stride.ty(), i));
                        self.binary(BinOp::Add, base.clone(), off)
                    }
                    ExprNode::Broadcast { value, .. } => value.clone(),
                    _ => e,
                }
            }
            _ => e,
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { name, value, body } => {
                let v = self.mutate_expr(value);
                if is_simple_let_value(&v) {
                    return self.mutate_stmt(&substitute_stmt(name, &v, body));
                }
                let b = self.mutate_stmt(body);
                if !stmt_uses_var(&b, name) {
                    return b;
                }
                Stmt::let_stmt(name.clone(), v, b)
            }
            StmtNode::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                let c = self.mutate_expr(condition);
                let cond_value = c.as_likely().map_or(const_bool(&c), const_bool);
                match cond_value {
                    Some(true) => return self.mutate_stmt(then_case),
                    Some(false) => {
                        return match else_case {
                            Some(e) => self.mutate_stmt(e),
                            None => Stmt::no_op(),
                        }
                    }
                    None => {}
                }
                let t = self.mutate_stmt(then_case);
                let e = else_case
                    .as_ref()
                    .map(|e| self.mutate_stmt(e))
                    .filter(|e| !e.is_no_op());
                if t.is_no_op() && e.is_none() {
                    return Stmt::no_op();
                }
                Stmt::if_then_else(c, t, e)
            }
            StmtNode::For {
                name,
                min,
                extent,
                for_type,
                device_api,
                body,
            } => {
                let mn = self.mutate_expr(min);
                let ex = self.mutate_expr(extent);
                if ex.as_int().is_some_and(|v| v <= 0) {
                    return Stmt::no_op();
                }
                if ex.is_one()
                    && matches!(for_type, ForType::Serial | ForType::Unrolled | ForType::Parallel)
                    && matches!(device_api, DeviceApi::None | DeviceApi::Host)
                {
                    return self.mutate_stmt(&Stmt::let_stmt(name.clone(), mn, body.clone()));
                }
                let b = self.mutate_stmt(body);
                if b.is_no_op() {
                    return Stmt::no_op();
                }
                Stmt::for_loop(name.clone(), mn, ex, *for_type, *device_api, b)
            }
            StmtNode::AssertStmt { condition, message } => {
                let c = self.mutate_expr(condition);
                if const_bool(&c) == Some(true) {
                    Stmt::no_op()
                } else {
                    Stmt::assert(c, message.clone())
                }
            }
            StmtNode::Evaluate { value } => {
                let v = self.mutate_expr(value);
                if v.is_const() {
                    Stmt::no_op()
                } else {
                    Stmt::evaluate(v)
                }
            }
            _ => mutate_stmt_children(self, s),
        }
    }
}
