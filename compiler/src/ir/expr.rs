// expr.rs - Immutable expression nodes
//
// `Expr` is a cheap-to-clone handle (`Rc`) over an `ExprNode`. Nodes are
// never mutated after construction; rewrites build new nodes and share
// unchanged subtrees. Equality is structural with a pointer fast path.

use std::fmt;
use std::ops::{Add, Deref, Div, Mul, Neg, Rem, Sub};
use std::rc::Rc;

use super::types::{Type, TypeCode};

// ── Operators ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// What a `Call` node refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    /// A call to a pipeline function, by name.
    Halide,
    /// A read from an input image or constant buffer.
    Image,
    /// An external routine with possible side effects.
    Extern,
    /// An external routine known to be pure (sqrt, sin, ...).
    PureExtern,
    /// A compiler intrinsic with possible side effects.
    Intrinsic,
    /// A compiler intrinsic without side effects.
    PureIntrinsic,
}

impl CallType {
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            CallType::Halide | CallType::Image | CallType::PureExtern | CallType::PureIntrinsic
        )
    }
}

/// Names of intrinsics the lowering passes emit and recognise.
pub mod intrinsics {
    pub const LIKELY: &str = "likely";
    pub const LIKELY_IF_INNERMOST: &str = "likely_if_innermost";
    pub const TRACE: &str = "halide_trace";
    pub const MAKE_SEMAPHORE: &str = "halide_make_semaphore";
    pub const SEMAPHORE_RELEASE: &str = "halide_semaphore_release";
    pub const MEMOIZE_LOOKUP: &str = "halide_memoization_cache_lookup";
    pub const MEMOIZE_STORE: &str = "halide_memoization_cache_store";
    pub const PROFILING_PUSH: &str = "halide_profiler_push";
    pub const PROFILING_POP: &str = "halide_profiler_pop";
    pub const PROFILING_START: &str = "halide_profiler_pipeline_start";
    pub const PROFILING_END: &str = "halide_profiler_pipeline_end";
    pub const DEVICE_RUN: &str = "halide_device_run";
    pub const ERROR_SPECIALIZE_FAIL: &str = "halide_error_specialize_fail";
}

// ── Nodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    IntImm {
        ty: Type,
        value: i64,
    },
    UIntImm {
        ty: Type,
        value: u64,
    },
    FloatImm {
        ty: Type,
        value: f64,
    },
    StringImm(String),
    Cast {
        ty: Type,
        value: Expr,
    },
    Variable {
        ty: Type,
        name: String,
    },
    Binary {
        op: BinOp,
        a: Expr,
        b: Expr,
    },
    Cmp {
        op: CmpOp,
        a: Expr,
        b: Expr,
    },
    And {
        a: Expr,
        b: Expr,
    },
    Or {
        a: Expr,
        b: Expr,
    },
    Not {
        a: Expr,
    },
    Select {
        condition: Expr,
        true_value: Expr,
        false_value: Expr,
    },
    Load {
        ty: Type,
        name: String,
        index: Expr,
        predicate: Expr,
    },
    Ramp {
        base: Expr,
        stride: Expr,
        lanes: u16,
    },
    Broadcast {
        value: Expr,
        lanes: u16,
    },
    Let {
        name: String,
        value: Expr,
        body: Expr,
    },
    Call {
        ty: Type,
        name: String,
        args: Vec<Expr>,
        call_type: CallType,
        value_index: usize,
    },
    /// Concatenate `vectors` and pick lanes by `indices`.
    Shuffle {
        vectors: Vec<Expr>,
        indices: Vec<u16>,
    },
}

#[derive(Clone)]
pub struct Expr(Rc<ExprNode>);

impl Deref for Expr {
    type Target = ExprNode;

    fn deref(&self) -> &ExprNode {
        &self.0
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<ExprNode> for Expr {
    fn from(node: ExprNode) -> Self {
        Expr(Rc::new(node))
    }
}

/// A half-open interval given as (min, extent).
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: Expr, extent: Expr) -> Self {
        Range { min, extent }
    }
}

// ── Construction ───────────────────────────────────────────────────────────

impl Expr {
    pub fn node(&self) -> &ExprNode {
        &self.0
    }

    pub fn same_as(&self, other: &Expr) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn ty(&self) -> Type {
        match self.node() {
            ExprNode::IntImm { ty, .. }
            | ExprNode::UIntImm { ty, .. }
            | ExprNode::FloatImm { ty, .. }
            | ExprNode::Cast { ty, .. }
            | ExprNode::Variable { ty, .. }
            | ExprNode::Load { ty, .. }
            | ExprNode::Call { ty, .. } => *ty,
            ExprNode::StringImm(_) => Type::handle(),
            ExprNode::Binary { a, .. } => a.ty(),
            ExprNode::Cmp { a, .. } | ExprNode::And { a, .. } | ExprNode::Or { a, .. } => {
                Type::bool().with_lanes(a.ty().lanes)
            }
            ExprNode::Not { a } => Type::bool().with_lanes(a.ty().lanes),
            ExprNode::Select { true_value, .. } => true_value.ty(),
            ExprNode::Ramp { base, lanes, .. } => base.ty().with_lanes(*lanes),
            ExprNode::Broadcast { value, lanes } => value.ty().with_lanes(*lanes),
            ExprNode::Let { body, .. } => body.ty(),
            ExprNode::Shuffle { vectors, indices } => vectors
                .first()
                .map(|v| v.ty().with_lanes(indices.len() as u16))
                .unwrap_or_else(Type::i32),
        }
    }

    /// A 32-bit signed integer constant.
    pub fn int(value: i64) -> Expr {
        Expr::make_const(Type::i32(), value)
    }

    pub fn float(value: f64) -> Expr {
        Expr::make_float(Type::f32(), value)
    }

    pub fn bool(value: bool) -> Expr {
        ExprNode::UIntImm {
            ty: Type::bool(),
            value: value as u64,
        }
        .into()
    }

    pub fn string(value: impl Into<String>) -> Expr {
        ExprNode::StringImm(value.into()).into()
    }

    /// An integer-valued constant of any numeric type; vector types broadcast.
    pub fn make_const(ty: Type, value: i64) -> Expr {
        if ty.is_vector() {
            return Expr::broadcast(Expr::make_const(ty.element_of(), value), ty.lanes);
        }
        match ty.code {
            TypeCode::Int => ExprNode::IntImm { ty, value }.into(),
            TypeCode::UInt => ExprNode::UIntImm {
                ty,
                value: value.max(0) as u64,
            }
            .into(),
            TypeCode::Float => ExprNode::FloatImm {
                ty,
                value: value as f64,
            }
            .into(),
            TypeCode::Handle => ExprNode::UIntImm {
                ty,
                value: value as u64,
            }
            .into(),
        }
    }

    pub fn make_float(ty: Type, value: f64) -> Expr {
        if ty.is_vector() {
            return Expr::broadcast(Expr::make_float(ty.element_of(), value), ty.lanes);
        }
        if ty.is_float() {
            ExprNode::FloatImm { ty, value }.into()
        } else {
            Expr::make_const(ty, value as i64)
        }
    }

    pub fn zero(ty: Type) -> Expr {
        Expr::make_const(ty, 0)
    }

    pub fn one(ty: Type) -> Expr {
        Expr::make_const(ty, 1)
    }

    /// The largest value of `ty` (+inf for floats).
    pub fn type_max(ty: Type) -> Expr {
        if ty.is_float() {
            Expr::make_float(ty, f64::INFINITY)
        } else if ty.is_uint() && !ty.is_bool() && ty.bits >= 64 {
            ExprNode::UIntImm {
                ty,
                value: u64::MAX,
            }
            .into()
        } else {
            Expr::make_const(ty, ty.max_value() as i64)
        }
    }

    pub fn type_min(ty: Type) -> Expr {
        if ty.is_float() {
            Expr::make_float(ty, f64::NEG_INFINITY)
        } else {
            Expr::make_const(ty, ty.min_value() as i64)
        }
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::var_of(Type::i32(), name)
    }

    pub fn var_of(ty: Type, name: impl Into<String>) -> Expr {
        ExprNode::Variable {
            ty,
            name: name.into(),
        }
        .into()
    }

    pub fn cast(ty: Type, value: Expr) -> Expr {
        if value.ty() == ty {
            return value;
        }
        if ty.is_vector() && value.ty().is_scalar() {
            return Expr::broadcast(Expr::cast(ty.element_of(), value), ty.lanes);
        }
        ExprNode::Cast { ty, value }.into()
    }

    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        ExprNode::Binary { op, a, b }.into()
    }

    pub fn min(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinOp::Min, a, b)
    }

    pub fn max(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinOp::Max, a, b)
    }

    pub fn cmp(op: CmpOp, a: Expr, b: Expr) -> Expr {
        let (a, b) = match_types(a, b);
        ExprNode::Cmp { op, a, b }.into()
    }

    pub fn eq(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Eq, a, b)
    }

    pub fn ne(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Ne, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Lt, a, b)
    }

    pub fn le(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Le, a, b)
    }

    pub fn gt(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Gt, a, b)
    }

    pub fn ge(a: Expr, b: Expr) -> Expr {
        Expr::cmp(CmpOp::Ge, a, b)
    }

    pub fn and(a: Expr, b: Expr) -> Expr {
        let (a, b) = match_lanes(a, b);
        ExprNode::And { a, b }.into()
    }

    pub fn or(a: Expr, b: Expr) -> Expr {
        let (a, b) = match_lanes(a, b);
        ExprNode::Or { a, b }.into()
    }

    pub fn not(a: Expr) -> Expr {
        ExprNode::Not { a }.into()
    }

    pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
        let (true_value, false_value) = match_types(true_value, false_value);
        let lanes = true_value.ty().lanes.max(condition.ty().lanes);
        let condition = widen_to(condition, lanes);
        let true_value = widen_to(true_value, lanes);
        let false_value = widen_to(false_value, lanes);
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        }
        .into()
    }

    pub fn load(ty: Type, name: impl Into<String>, index: Expr, predicate: Expr) -> Expr {
        ExprNode::Load {
            ty,
            name: name.into(),
            index,
            predicate,
        }
        .into()
    }

    pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Expr {
        ExprNode::Ramp {
            base,
            stride,
            lanes,
        }
        .into()
    }

    pub fn broadcast(value: Expr, lanes: u16) -> Expr {
        ExprNode::Broadcast { value, lanes }.into()
    }

    pub fn let_in(name: impl Into<String>, value: Expr, body: Expr) -> Expr {
        ExprNode::Let {
            name: name.into(),
            value,
            body,
        }
        .into()
    }

    pub fn call(
        ty: Type,
        name: impl Into<String>,
        args: Vec<Expr>,
        call_type: CallType,
        value_index: usize,
    ) -> Expr {
        ExprNode::Call {
            ty,
            name: name.into(),
            args,
            call_type,
            value_index,
        }
        .into()
    }

    pub fn intrinsic(ty: Type, name: &str, args: Vec<Expr>) -> Expr {
        Expr::call(ty, name, args, CallType::Intrinsic, 0)
    }

    pub fn pure_intrinsic(ty: Type, name: &str, args: Vec<Expr>) -> Expr {
        Expr::call(ty, name, args, CallType::PureIntrinsic, 0)
    }

    /// Marks a condition as expected to hold.
    pub fn likely(e: Expr) -> Expr {
        let ty = e.ty();
        Expr::pure_intrinsic(ty, intrinsics::LIKELY, vec![e])
    }

    pub fn shuffle(vectors: Vec<Expr>, indices: Vec<u16>) -> Expr {
        ExprNode::Shuffle { vectors, indices }.into()
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn as_int(&self) -> Option<i64> {
        match self.node() {
            ExprNode::IntImm { value, .. } => Some(*value),
            ExprNode::UIntImm { value, .. } => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.node() {
            ExprNode::FloatImm { value, .. } => Some(*value),
            _ => self.as_int().map(|v| v as f64),
        }
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self.node() {
            ExprNode::Variable { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self.node(),
            ExprNode::IntImm { .. } | ExprNode::UIntImm { .. } | ExprNode::FloatImm { .. }
        )
    }

    pub fn is_const_value(&self, v: i64) -> bool {
        match self.node() {
            ExprNode::FloatImm { value, .. } => *value == v as f64,
            ExprNode::Broadcast { value, .. } => value.is_const_value(v),
            _ => self.as_int() == Some(v),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.is_const_value(0)
    }

    pub fn is_one(&self) -> bool {
        self.is_const_value(1)
    }

    pub fn is_true(&self) -> bool {
        self.ty().is_bool() && self.is_const_value(1)
    }

    pub fn is_false(&self) -> bool {
        self.ty().is_bool() && self.is_const_value(0)
    }

    /// Is this a `likely(...)` wrapper; returns the wrapped condition.
    pub fn as_likely(&self) -> Option<&Expr> {
        match self.node() {
            ExprNode::Call { name, args, .. }
                if (name == intrinsics::LIKELY || name == intrinsics::LIKELY_IF_INNERMOST)
                    && args.len() == 1 =>
            {
                Some(&args[0])
            }
            _ => None,
        }
    }
}

fn widen_to(e: Expr, lanes: u16) -> Expr {
    if e.ty().lanes == lanes || lanes == 1 {
        e
    } else {
        Expr::broadcast(e, lanes)
    }
}

fn match_lanes(a: Expr, b: Expr) -> (Expr, Expr) {
    let lanes = a.ty().lanes.max(b.ty().lanes);
    (widen_to(a, lanes), widen_to(b, lanes))
}

/// Coerce two operands to one type: constants adopt the other side's type,
/// ints meet floats as floats, narrower meets wider as wider, scalars
/// broadcast to vectors.
pub fn match_types(a: Expr, b: Expr) -> (Expr, Expr) {
    let (ta, tb) = (a.ty(), b.ty());
    if ta == tb {
        return (a, b);
    }
    let (ea, eb) = (ta.element_of(), tb.element_of());
    let (a, b) = if ea == eb {
        (a, b)
    } else if a.is_const() && !b.is_const() {
        (retype_const(&a, eb), b)
    } else if b.is_const() && !a.is_const() {
        let b = retype_const(&b, ea);
        (a, b)
    } else if ea.is_float() && !eb.is_float() {
        (a, Expr::cast(eb.with_lanes(tb.lanes).with_code_of(ea), b))
    } else if eb.is_float() && !ea.is_float() {
        (Expr::cast(ea.with_lanes(ta.lanes).with_code_of(eb), a), b)
    } else if ea.bits >= eb.bits {
        (a, Expr::cast(ea.with_lanes(tb.lanes), b))
    } else {
        (Expr::cast(eb.with_lanes(ta.lanes), a), b)
    };
    match_lanes(a, b)
}

fn retype_const(c: &Expr, ty: Type) -> Expr {
    match c.node() {
        ExprNode::FloatImm { value, .. } => Expr::make_float(ty, *value),
        _ => match c.as_int() {
            Some(v) => Expr::make_const(ty, v),
            None => Expr::cast(ty, c.clone()),
        },
    }
}

impl Type {
    fn with_code_of(self, other: Type) -> Type {
        Type {
            code: other.code,
            bits: other.bits,
            lanes: self.lanes,
        }
    }
}

// ── Operator overloads ─────────────────────────────────────────────────────

macro_rules! impl_arith {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs.clone())
            }
        }

        impl $trait<i32> for Expr {
            type Output = Expr;
            fn $method(self, rhs: i32) -> Expr {
                let rhs = Expr::int(rhs as i64);
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<f32> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f32) -> Expr {
                let rhs = Expr::float(rhs as f64);
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_arith!(Add, add, BinOp::Add);
impl_arith!(Sub, sub, BinOp::Sub);
impl_arith!(Mul, mul, BinOp::Mul);
impl_arith!(Div, div, BinOp::Div);
impl_arith!(Rem, rem, BinOp::Mod);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        let zero = Expr::zero(self.ty());
        Expr::binary(BinOp::Sub, zero, self)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::int(v as i64)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::float(v as f64)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::bool(v)
    }
}
