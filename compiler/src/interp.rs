// interp.rs - Reference interpreter for lowered IR
//
// Executes a flattened statement over in-memory buffers, one lane at a
// time. Lowered modules are checked against a scalar reference with it, so
// it follows the IR's arithmetic exactly: integer results wrap to their
// type's width, division and modulo are Euclidean with `x / 0 == 0`, and
// 32-bit float results are rounded through `f32`.
//
// Buffers are dense with dimension 0 innermost. The metadata symbols of a
// buffer (`b.min.0`, `b.extent.1`, `b.stride.1`, ...) resolve to the bound
// buffer unless a let shadows them. Runtime intrinsics are inert: tracing
// returns the traced value, memoization always misses, profiling and
// semaphores do nothing. A device run executes the kernel body in place.

use std::collections::BTreeMap;

use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::diag::{codes, Diagnostic};
use crate::error::{Error, Result};
use crate::func::ConstBuffer;
use crate::ir::simplify::{fold_cmp, fold_float, fold_int, wrap};
use crate::ir::{
    intrinsics, split_buffer_field, CallType, Expr, ExprNode, Scope, Stmt, StmtNode, Type,
};
use crate::lower::Module;

pub type Lanes<T> = SmallVec<[T; 8]>;

// ── Values ─────────────────────────────────────────────────────────────────

/// A scalar or vector runtime value. Booleans and handles are integers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(Lanes<i64>),
    Float(Lanes<f64>),
    Str(String),
}

impl Value {
    pub fn int(v: i64) -> Value {
        Value::Int(smallvec![v])
    }

    pub fn float(v: f64) -> Value {
        Value::Float(smallvec![v])
    }

    pub fn lanes(&self) -> usize {
        match self {
            Value::Int(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Str(_) => 1,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) if v.len() == 1 => Some(v[0] as f64),
            Value::Float(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    fn ints(&self) -> Result<Lanes<i64>> {
        match self {
            Value::Int(v) => Ok(v.clone()),
            Value::Float(v) => Ok(v.iter().map(|x| *x as i64).collect()),
            Value::Str(s) => Err(Error::internal(format!("string `{}` used as a number", s))),
        }
    }

    fn floats(&self) -> Result<Lanes<f64>> {
        match self {
            Value::Int(v) => Ok(v.iter().map(|x| *x as f64).collect()),
            Value::Float(v) => Ok(v.clone()),
            Value::Str(s) => Err(Error::internal(format!("string `{}` used as a number", s))),
        }
    }

    fn lane_f64(&self, i: usize) -> f64 {
        match self {
            Value::Int(v) => lane(v, i) as f64,
            Value::Float(v) => lane(v, i),
            Value::Str(_) => 0.0,
        }
    }
}

/// Lane `i`, reading scalars as if broadcast.
fn lane<T: Copy>(v: &[T], i: usize) -> T {
    if v.len() == 1 {
        v[0]
    } else {
        v[i]
    }
}

fn round_float(ty: Type, v: f64) -> f64 {
    if ty.bits == 32 {
        v as f32 as f64
    } else {
        v
    }
}

/// Build a value of type `ty` from per-lane numbers.
fn typed(ty: Type, lanes: impl Iterator<Item = f64>) -> Value {
    if ty.is_float() {
        Value::Float(lanes.map(|v| round_float(ty, v)).collect())
    } else {
        Value::Int(lanes.map(|v| wrap(ty, v as i64)).collect())
    }
}

fn bools(lanes: impl Iterator<Item = bool>) -> Value {
    Value::Int(lanes.map(i64::from).collect())
}

// ── Buffers ────────────────────────────────────────────────────────────────

/// A dense buffer of `ty` elements stored as `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub ty: Type,
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
    pub data: Vec<f64>,
}

impl Buffer {
    /// A zero-filled buffer with origin 0.
    pub fn new(ty: Type, extents: &[i64]) -> Self {
        let len = extents.iter().map(|e| (*e).max(0)).product::<i64>() as usize;
        Buffer {
            ty,
            mins: vec![0; extents.len()],
            extents: extents.to_vec(),
            data: vec![0.0; len],
        }
    }

    pub fn with_mins(mut self, mins: &[i64]) -> Self {
        self.mins = mins.to_vec();
        self
    }

    /// Fill from `f(coords)`, origin 0.
    pub fn from_fn(ty: Type, extents: &[i64], mut f: impl FnMut(&[i64]) -> f64) -> Self {
        let mut b = Buffer::new(ty, extents);
        let mut coords = vec![0i64; extents.len()];
        for i in 0..b.data.len() {
            let mut rest = i as i64;
            for (d, e) in extents.iter().enumerate() {
                coords[d] = rest % e;
                rest /= e;
            }
            b.data[i] = f(&coords);
        }
        b
    }

    pub fn strides(&self) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.extents.len());
        let mut s = 1;
        for e in &self.extents {
            out.push(s);
            s *= e;
        }
        out
    }

    fn offset(&self, coords: &[i64]) -> Option<usize> {
        if coords.len() != self.extents.len() {
            return None;
        }
        let mut at = 0;
        for ((c, m), (e, s)) in coords
            .iter()
            .zip(&self.mins)
            .zip(self.extents.iter().zip(self.strides()))
        {
            let x = c - m;
            if x < 0 || x >= *e {
                return None;
            }
            at += x * s;
        }
        Some(at as usize)
    }

    pub fn get(&self, coords: &[i64]) -> Option<f64> {
        self.offset(coords).map(|i| self.data[i])
    }

    pub fn set(&mut self, coords: &[i64], v: f64) -> bool {
        match self.offset(coords) {
            Some(i) => {
                self.data[i] = v;
                true
            }
            None => false,
        }
    }

    fn field(&self, field: &str, dim: usize) -> Option<i64> {
        match field {
            "min" => self.mins.get(dim).copied(),
            "extent" => self.extents.get(dim).copied(),
            "stride" => self.strides().get(dim).copied(),
            _ => None,
        }
    }
}

impl From<&ConstBuffer> for Buffer {
    fn from(c: &ConstBuffer) -> Self {
        let extents: Vec<i64> = c.extents.iter().map(|e| *e as i64).collect();
        Buffer {
            ty: c.ty,
            mins: vec![0; extents.len()],
            extents,
            data: c.data.clone(),
        }
    }
}

// ── Interpreter ────────────────────────────────────────────────────────────

fn out_of_bounds(buffer: &str, index: i64, len: usize) -> Error {
    Error::user(
        Diagnostic::error(
            codes::E0602_OUT_OF_BOUNDS,
            format!(
                "access to `{}` at flat index {} is outside its {} elements",
                buffer, index, len
            ),
        )
        .with_subject(buffer.to_string()),
    )
}

fn missing(what: &str, name: &str) -> Error {
    Error::user(
        Diagnostic::error(
            codes::E0603_MISSING_INPUT,
            format!("no {} named `{}` is bound", what, name),
        )
        .with_subject(name.to_string()),
    )
}

#[derive(Debug, Default)]
pub struct Interpreter {
    buffers: BTreeMap<String, Buffer>,
    scope: Scope<Value>,
    kernels: BTreeMap<String, Stmt>,
    stores: u64,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buffer(&mut self, name: impl Into<String>, buffer: Buffer) {
        self.buffers.insert(name.into(), buffer);
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, value: Value) {
        self.scope.push(name, value);
    }

    pub fn buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn take_buffer(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(name)
    }

    /// Run the entry function of `module`. Every buffer and scalar argument
    /// must already be bound; constant buffers are bound from the module.
    pub fn run(&mut self, module: &Module) -> Result<()> {
        let entry = module
            .entry()
            .ok_or_else(|| Error::internal(format!("module `{}` has no entry function", module.name)))?;
        for c in &module.buffers {
            self.buffers.entry(c.name.clone()).or_insert_with(|| Buffer::from(c));
        }
        for k in &module.kernels {
            self.kernels.insert(k.name.clone(), k.body.clone());
        }
        for arg in &entry.args {
            if arg.is_buffer() && !self.buffers.contains_key(&arg.name) {
                return Err(missing("buffer", &arg.name));
            }
            if !arg.is_buffer() && !self.scope.contains(&arg.name) {
                return Err(missing("scalar", &arg.name));
            }
        }
        self.stores = 0;
        self.exec(&entry.body)?;
        debug!(module = %module.name, stores = self.stores, "interpreted");
        Ok(())
    }

    pub fn exec(&mut self, s: &Stmt) -> Result<()> {
        match s.node() {
            StmtNode::LetStmt { name, value, body } => {
                let v = self.eval(value)?;
                self.scope.push(name, v);
                let r = self.exec(body);
                self.scope.pop(name);
                r
            }
            StmtNode::AssertStmt { condition, message } => {
                if self.eval(condition)?.ints()?.iter().all(|c| *c != 0) {
                    return Ok(());
                }
                let msg = match self.eval(message)? {
                    Value::Str(s) => s,
                    v => format!("{:?}", v),
                };
                Err(Error::user(Diagnostic::error(
                    codes::E0601_ASSERTION,
                    format!("assertion failed: {}", msg),
                )))
            }
            StmtNode::ProducerConsumer { body, .. }
            | StmtNode::Acquire { body, .. }
            | StmtNode::Atomic { body, .. } => self.exec(body),
            StmtNode::For {
                name,
                min,
                extent,
                body,
                ..
            } => {
                let min = self.scalar_int(min)?;
                let extent = self.scalar_int(extent)?;
                for i in min..min + extent {
                    self.scope.push(name, Value::int(i));
                    let r = self.exec(body);
                    self.scope.pop(name);
                    r?;
                }
                Ok(())
            }
            StmtNode::Store {
                name,
                value,
                index,
                predicate,
            } => self.store(name, value, index, predicate),
            StmtNode::Allocate {
                name,
                ty,
                extents,
                body,
                ..
            } => {
                let extents = extents
                    .iter()
                    .map(|e| self.scalar_int(e))
                    .collect::<Result<Vec<_>>>()?;
                let prev = self.buffers.insert(name.clone(), Buffer::new(*ty, &extents));
                let r = self.exec(body);
                match prev {
                    Some(b) => self.buffers.insert(name.clone(), b),
                    None => self.buffers.remove(name),
                };
                r
            }
            StmtNode::Free { name } => {
                self.buffers.remove(name);
                Ok(())
            }
            StmtNode::Block { first, rest } | StmtNode::Fork { first, rest } => {
                self.exec(first)?;
                self.exec(rest)
            }
            StmtNode::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                if self.scalar_int(condition)? != 0 {
                    self.exec(then_case)
                } else if let Some(e) = else_case {
                    self.exec(e)
                } else {
                    Ok(())
                }
            }
            StmtNode::Evaluate { value } => self.eval(value).map(|_| ()),
            StmtNode::NoOp => Ok(()),
            StmtNode::Provide { name, .. } | StmtNode::Realize { name, .. } => Err(Error::internal(
                format!("`{}` is not flattened; run storage flattening first", name),
            )),
        }
    }

    fn scalar_int(&mut self, e: &Expr) -> Result<i64> {
        let v = self.eval(e)?;
        v.as_i64()
            .ok_or_else(|| Error::internal(format!("`{}` is not a scalar integer", e)))
    }

    fn store(&mut self, name: &str, value: &Expr, index: &Expr, predicate: &Expr) -> Result<()> {
        let value = self.eval(value)?;
        let index = self.eval(index)?.ints()?;
        let predicate = self.eval(predicate)?.ints()?;
        let lanes = index.len().max(value.lanes());
        let buf = self
            .buffers
            .get_mut(name)
            .ok_or_else(|| missing("buffer", name))?;
        for i in 0..lanes {
            if lane(&predicate, i) == 0 {
                continue;
            }
            let at = lane(&index, i);
            let len = buf.data.len();
            let slot = usize::try_from(at)
                .ok()
                .and_then(|a| buf.data.get_mut(a))
                .ok_or_else(|| out_of_bounds(name, at, len))?;
            *slot = value.lane_f64(i);
            self.stores += 1;
        }
        Ok(())
    }

    fn load(&mut self, ty: Type, name: &str, index: &Expr, predicate: &Expr) -> Result<Value> {
        if index.ty().lanes != ty.lanes {
            return Err(Error::internal(format!(
                "load of `{}` has type {} but a {}-lane index",
                name,
                ty,
                index.ty().lanes
            )));
        }
        let index = self.eval(index)?.ints()?;
        let predicate = self.eval(predicate)?.ints()?;
        let buf = self.buffers.get(name).ok_or_else(|| missing("buffer", name))?;
        let mut out: Lanes<f64> = SmallVec::with_capacity(ty.lanes as usize);
        for i in 0..ty.lanes as usize {
            if lane(&predicate, i) == 0 {
                out.push(0.0);
                continue;
            }
            let at = lane(&index, i);
            let v = usize::try_from(at)
                .ok()
                .and_then(|a| buf.data.get(a))
                .ok_or_else(|| out_of_bounds(name, at, buf.data.len()))?;
            out.push(*v);
        }
        Ok(typed(ty, out.into_iter()))
    }

    fn variable(&self, name: &str) -> Result<Value> {
        if let Some(v) = self.scope.get(name) {
            return Ok(v.clone());
        }
        if let Some((buf, field, dim)) = split_buffer_field(name) {
            if let Some(v) = self.buffers.get(buf).and_then(|b| b.field(field, dim)) {
                return Ok(Value::int(v));
            }
        }
        if name.ends_with(".buffer") || name == crate::lower::arguments::USER_CONTEXT {
            return Ok(Value::int(0));
        }
        Err(missing("variable", name))
    }

    fn call(&mut self, ty: Type, name: &str, args: &[Expr], call_type: CallType) -> Result<Value> {
        match (call_type, name) {
            (_, intrinsics::LIKELY | intrinsics::LIKELY_IF_INNERMOST) => match args {
                [a] => self.eval(a),
                _ => Err(Error::internal(format!("{} takes one argument", name))),
            },
            (_, intrinsics::TRACE) => match args.get(3) {
                Some(v) => self.eval(v),
                None => Err(Error::internal("trace call without a value")),
            },
            (_, intrinsics::MEMOIZE_LOOKUP) => Ok(Value::int(1)),
            (_, intrinsics::DEVICE_RUN) => {
                let Some(Value::Str(kernel)) = args.first().map(|a| self.eval(a)).transpose()? else {
                    return Err(Error::internal("device run without a kernel name"));
                };
                let body = self
                    .kernels
                    .get(&kernel)
                    .cloned()
                    .ok_or_else(|| missing("kernel", &kernel))?;
                self.exec(&body)?;
                Ok(Value::int(0))
            }
            (_, intrinsics::ERROR_SPECIALIZE_FAIL) => {
                let msg = match args.first().map(|a| self.eval(a)).transpose()? {
                    Some(Value::Str(s)) => s,
                    _ => String::new(),
                };
                Err(Error::user(Diagnostic::error(
                    codes::E0601_ASSERTION,
                    format!("specialization failed: {}", msg),
                )))
            }
            (CallType::Intrinsic | CallType::PureIntrinsic, _) => {
                for a in args {
                    self.eval(a)?;
                }
                Ok(typed(ty, std::iter::repeat(0.0).take(ty.lanes as usize)))
            }
            _ => Err(Error::internal(format!(
                "can't interpret {:?} call to `{}`",
                call_type, name
            ))),
        }
    }

    pub fn eval(&mut self, e: &Expr) -> Result<Value> {
        match e.node() {
            ExprNode::IntImm { value, .. } => Ok(Value::int(*value)),
            ExprNode::UIntImm { value, .. } => Ok(Value::int(*value as i64)),
            ExprNode::FloatImm { value, .. } => Ok(Value::float(*value)),
            ExprNode::StringImm(s) => Ok(Value::Str(s.clone())),
            ExprNode::Variable { name, .. } => self.variable(name),
            ExprNode::Cast { ty, value } => {
                let v = self.eval(value)?;
                let n = ty.lanes as usize;
                if ty.is_bool() {
                    let f = v.floats()?;
                    Ok(bools((0..n).map(|i| lane(&f, i) != 0.0)))
                } else if ty.is_float() {
                    let f = v.floats()?;
                    Ok(typed(*ty, (0..n).map(|i| lane(&f, i))))
                } else {
                    let f = v.ints()?;
                    Ok(Value::Int((0..n).map(|i| wrap(*ty, lane(&f, i))).collect()))
                }
            }
            ExprNode::Binary { op, a, b } => {
                let ty = e.ty();
                let n = ty.lanes as usize;
                let (a, b) = (self.eval(a)?, self.eval(b)?);
                if ty.is_float() {
                    let (a, b) = (a.floats()?, b.floats()?);
                    Ok(typed(ty, (0..n).map(|i| fold_float(*op, lane(&a, i), lane(&b, i)))))
                } else {
                    let (a, b) = (a.ints()?, b.ints()?);
                    Ok(Value::Int(
                        (0..n)
                            .map(|i| wrap(ty, fold_int(*op, lane(&a, i), lane(&b, i))))
                            .collect(),
                    ))
                }
            }
            ExprNode::Cmp { op, a, b } => {
                let n = e.ty().lanes as usize;
                let float = a.ty().is_float();
                let (a, b) = (self.eval(a)?, self.eval(b)?);
                if float {
                    let (a, b) = (a.floats()?, b.floats()?);
                    Ok(bools((0..n).map(|i| fold_cmp(*op, lane(&a, i), lane(&b, i)))))
                } else {
                    let (a, b) = (a.ints()?, b.ints()?);
                    Ok(bools((0..n).map(|i| fold_cmp(*op, lane(&a, i), lane(&b, i)))))
                }
            }
            ExprNode::And { a, b } | ExprNode::Or { a, b } => {
                let n = e.ty().lanes as usize;
                let and = matches!(e.node(), ExprNode::And { .. });
                let (a, b) = (self.eval(a)?.ints()?, self.eval(b)?.ints()?);
                Ok(bools((0..n).map(|i| {
                    let (x, y) = (lane(&a, i) != 0, lane(&b, i) != 0);
                    if and {
                        x && y
                    } else {
                        x || y
                    }
                })))
            }
            ExprNode::Not { a } => {
                let a = self.eval(a)?.ints()?;
                Ok(bools(a.iter().map(|x| *x == 0)))
            }
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => {
                let ty = e.ty();
                let c = self.eval(condition)?.ints()?;
                let t = self.eval(true_value)?;
                let f = self.eval(false_value)?;
                Ok(typed(
                    ty,
                    (0..ty.lanes as usize).map(|i| {
                        if lane(&c, i) != 0 {
                            t.lane_f64(i)
                        } else {
                            f.lane_f64(i)
                        }
                    }),
                ))
            }
            ExprNode::Load {
                ty,
                name,
                index,
                predicate,
            } => self.load(*ty, name, index, predicate),
            ExprNode::Ramp {
                base,
                stride,
                lanes,
            } => {
                let ty = e.ty();
                let (b, s) = (self.eval(base)?, self.eval(stride)?);
                if ty.is_float() {
                    let (b, s) = (lane(&b.floats()?, 0), lane(&s.floats()?, 0));
                    Ok(typed(ty, (0..*lanes).map(|i| b + s * i as f64)))
                } else {
                    let (b, s) = (lane(&b.ints()?, 0), lane(&s.ints()?, 0));
                    Ok(Value::Int(
                        (0..*lanes as i64).map(|i| wrap(ty, b + s * i)).collect(),
                    ))
                }
            }
            ExprNode::Broadcast { value, lanes } => {
                let n = *lanes as usize;
                Ok(match self.eval(value)? {
                    Value::Int(v) => Value::Int((0..n).map(|i| lane(&v, i % v.len())).collect()),
                    Value::Float(v) => {
                        Value::Float((0..n).map(|i| lane(&v, i % v.len())).collect())
                    }
                    s @ Value::Str(_) => s,
                })
            }
            ExprNode::Let { name, value, body } => {
                let v = self.eval(value)?;
                self.scope.push(name, v);
                let r = self.eval(body);
                self.scope.pop(name);
                r
            }
            ExprNode::Call {
                ty,
                name,
                args,
                call_type,
                ..
            } => self.call(*ty, name, args, *call_type),
            ExprNode::Shuffle { vectors, indices } => {
                let ty = e.ty();
                let mut all: Vec<f64> = Vec::new();
                for v in vectors {
                    let v = self.eval(v)?;
                    all.extend((0..v.lanes()).map(|i| v.lane_f64(i)));
                }
                let picked = indices
                    .iter()
                    .map(|i| {
                        all.get(*i as usize).copied().ok_or_else(|| {
                            Error::internal(format!("shuffle index {} out of {} lanes", i, all.len()))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                Ok(typed(ty, picked.into_iter()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DeviceApi, ForType};

    fn load(name: &str, index: Expr) -> Expr {
        let ty = Type::i32().with_lanes(index.ty().lanes);
        Expr::load(ty, name, index, Expr::bool(true))
    }

    fn serial(name: &str, extent: i64, body: Stmt) -> Stmt {
        Stmt::for_loop(name, Expr::int(0), Expr::int(extent), ForType::Serial, DeviceApi::None, body)
    }

    #[test]
    fn scalar_loop_fills_the_output() {
        let x = Expr::var("x");
        let body = Stmt::store("out", load("in", x.clone()) * 2 + 1, x, Expr::bool(true));
        let mut it = Interpreter::new();
        it.set_buffer("in", Buffer::from_fn(Type::i32(), &[4], |c| c[0] as f64));
        it.set_buffer("out", Buffer::new(Type::i32(), &[4]));
        it.exec(&serial("x", 4, body)).unwrap();
        assert_eq!(it.buffer("out").unwrap().data, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn vector_store_respects_its_predicate() {
        let ramp = Expr::ramp(Expr::int(0), Expr::int(1), 4);
        let pred = Expr::lt(load("in", ramp.clone()), Expr::broadcast(Expr::int(2), 4));
        let s = Stmt::store("out", Expr::broadcast(Expr::int(9), 4), ramp, pred);
        let mut it = Interpreter::new();
        it.set_buffer("in", Buffer::from_fn(Type::i32(), &[4], |c| c[0] as f64));
        it.set_buffer("out", Buffer::new(Type::i32(), &[4]));
        it.exec(&s).unwrap();
        assert_eq!(it.buffer("out").unwrap().data, vec![9.0, 9.0, 0.0, 0.0]);
    }

    #[test]
    fn load_lanes_must_match_its_index() {
        let ramp = Expr::ramp(Expr::int(0), Expr::int(1), 4);
        let bad = Expr::load(Type::i32(), "in", ramp, Expr::bool(true));
        let mut it = Interpreter::new();
        it.set_buffer("in", Buffer::from_fn(Type::i32(), &[4], |c| c[0] as f64));
        let err = it.eval(&bad).unwrap_err();
        assert!(err.to_string().contains("4-lane index"), "{}", err);
    }

    #[test]
    fn integer_arithmetic_is_euclidean_and_wraps() {
        let mut it = Interpreter::new();
        let v = it.eval(&(Expr::int(-7) / Expr::int(2))).unwrap();
        assert_eq!(v, Value::int(-4));
        let v = it.eval(&(Expr::int(-7) % Expr::int(2))).unwrap();
        assert_eq!(v, Value::int(1));
        let v = it.eval(&(Expr::int(i32::MAX as i64) + Expr::int(1))).unwrap();
        assert_eq!(v, Value::int(i32::MIN as i64));
    }

    #[test]
    fn buffer_metadata_resolves_from_the_binding() {
        let mut it = Interpreter::new();
        it.set_buffer("b", Buffer::new(Type::i32(), &[3, 5]).with_mins(&[2, -1]));
        assert_eq!(it.eval(&Expr::var("b.min.1")).unwrap(), Value::int(-1));
        assert_eq!(it.eval(&Expr::var("b.stride.1")).unwrap(), Value::int(3));
        assert_eq!(it.eval(&Expr::var("b.extent.0")).unwrap(), Value::int(3));
    }

    #[test]
    fn out_of_bounds_store_is_reported() {
        let s = Stmt::store("out", Expr::int(1), Expr::int(4), Expr::bool(true));
        let mut it = Interpreter::new();
        it.set_buffer("out", Buffer::new(Type::i32(), &[4]));
        let err = it.exec(&s).unwrap_err();
        assert_eq!(err.code(), Some("E0602"));
    }

    #[test]
    fn freed_buffer_can_not_be_read() {
        let s = Stmt::allocate(
            "t",
            Type::i32(),
            Default::default(),
            vec![Expr::int(2)],
            Stmt::block_of(vec![
                Stmt::free("t"),
                Stmt::evaluate(load("t", Expr::int(0))),
            ]),
        );
        let err = Interpreter::new().exec(&s).unwrap_err();
        assert_eq!(err.code(), Some("E0603"));
    }

    #[test]
    fn failed_assertion_is_a_user_error() {
        let s = Stmt::assert(Expr::bool(false), Expr::string("too small"));
        let err = Interpreter::new().exec(&s).unwrap_err();
        assert_eq!(err.code(), Some("E0601"));
        assert!(err.to_string().contains("too small"));
    }
}
