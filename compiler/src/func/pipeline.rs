// pipeline.rs - The function arena and function-level API
//
// `Pipeline` owns every Function, input image, scalar parameter and constant
// buffer of one program. Functions are addressed by `FuncId`; expressions
// refer to them by name. Stage-level scheduling goes through `stage()`, which
// hands out a `Stage` borrowing the pipeline mutably.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use tracing::warn;

use crate::diag::{codes, DiagCode, Diagnostic};
use crate::error::{Error, Result, UserSnafu};
use crate::id::{FuncId, IdAllocator, NameGen};
use crate::ir::{can_prove, rename_calls, CallType, Expr, MemoryType, Type};
use crate::schedule::{self_call_args, AssociativityProver, PatternProver, Stage};

use super::definition::Definition;
use super::function::{ExternDefinition, Function};
use super::schedule::{Bound, Dim, DimKind, LoopLevel};
use super::var::{RDom, Var, OUTERMOST};

// ── Inputs ─────────────────────────────────────────────────────────────────

/// An input buffer of known element type and dimensionality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParam {
    pub name: String,
    pub ty: Type,
    pub dims: usize,
}

impl ImageParam {
    pub fn at(&self, args: Vec<Expr>) -> Expr {
        Expr::call(self.ty, self.name.clone(), args, CallType::Image, 0)
    }
}

/// A scalar input, optionally constrained to `[min, max]` at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

impl Param {
    pub fn expr(&self) -> Expr {
        Expr::var_of(self.ty, self.name.clone())
    }
}

/// A buffer whose contents are known at compile time; embedded in the module
/// instead of being passed as an argument. Dense, dim 0 innermost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstBuffer {
    pub name: String,
    pub ty: Type,
    pub extents: Vec<i32>,
    pub data: Vec<f64>,
}

impl ConstBuffer {
    pub fn at(&self, args: Vec<Expr>) -> Expr {
        Expr::call(self.ty, self.name.clone(), args, CallType::Image, 0)
    }
}

// ── Pipeline ───────────────────────────────────────────────────────────────

pub struct Pipeline {
    funcs: Vec<Function>,
    by_name: BTreeMap<String, FuncId>,
    ids: IdAllocator,
    pub(crate) names: NameGen,
    images: BTreeMap<String, ImageParam>,
    params: BTreeMap<String, Param>,
    buffers: BTreeMap<String, ConstBuffer>,
    /// Conditions the generated code asserts before doing any work.
    requirements: Vec<(Expr, String)>,
    warnings: Vec<Diagnostic>,
    prover: Box<dyn AssociativityProver>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("funcs", &self.by_name.keys().collect::<Vec<_>>())
            .field("images", &self.images.keys().collect::<Vec<_>>())
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .field("buffers", &self.buffers.keys().collect::<Vec<_>>())
            .field("requirements", &self.requirements.len())
            .field("warnings", &self.warnings.len())
            .finish_non_exhaustive()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accumulate {
    Sum,
    Product,
    Min,
    Max,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::with_prover(Box::new(PatternProver))
    }

    pub fn with_prover(prover: Box<dyn AssociativityProver>) -> Self {
        Pipeline {
            funcs: Vec::new(),
            by_name: BTreeMap::new(),
            ids: IdAllocator::new(),
            names: NameGen::new(),
            images: BTreeMap::new(),
            params: BTreeMap::new(),
            buffers: BTreeMap::new(),
            requirements: Vec::new(),
            warnings: Vec::new(),
            prover,
        }
    }

    pub fn prover(&self) -> &dyn AssociativityProver {
        self.prover.as_ref()
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn function(&self, f: FuncId) -> &Function {
        &self.funcs[f.0 as usize]
    }

    pub(crate) fn function_mut(&mut self, f: FuncId) -> &mut Function {
        &mut self.funcs[f.0 as usize]
    }

    pub fn id_of(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn function_named(&self, name: &str) -> Option<&Function> {
        self.id_of(name).map(|id| self.function(id))
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageParam> {
        self.images.values()
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params.values()
    }

    pub fn requirements(&self) -> &[(Expr, String)] {
        &self.requirements
    }

    pub fn const_buffers(&self) -> impl Iterator<Item = &ConstBuffer> {
        self.buffers.values()
    }

    pub fn image(&self, name: &str) -> Option<&ImageParam> {
        self.images.get(name)
    }

    pub fn param_named(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    pub fn const_buffer_named(&self, name: &str) -> Option<&ConstBuffer> {
        self.buffers.get(name)
    }

    /// The loop over `var` in whichever stage of `f` first uses the
    /// function being placed.
    pub fn at(&self, f: FuncId, var: impl Into<String>) -> LoopLevel {
        LoopLevel::at(self.function(f).name.clone(), var)
    }

    pub fn at_stage(&self, f: FuncId, stage: usize, var: impl Into<String>) -> LoopLevel {
        LoopLevel::at_stage(self.function(f).name.clone(), stage, var)
    }

    // ── Warnings ─────────────────────────────────────────────────────────

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.warnings)
    }

    pub(crate) fn warn(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        self.warnings.push(diagnostic);
    }

    // ── Declaration ──────────────────────────────────────────────────────

    fn name_taken(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
            || self.images.contains_key(name)
            || self.params.contains_key(name)
            || self.buffers.contains_key(name)
    }

    fn redefinition(name: &str) -> Error {
        Error::user(Diagnostic::error(
            codes::E0202_REDEFINITION,
            format!("the name `{}` is already used in this pipeline", name),
        ))
    }

    /// Declare a new, undefined function.
    pub fn func(&mut self, name: &str) -> Result<FuncId> {
        ensure!(
            !self.name_taken(name),
            UserSnafu {
                diagnostic: Diagnostic::error(
                    codes::E0202_REDEFINITION,
                    format!("the name `{}` is already used in this pipeline", name),
                ),
            }
        );
        let id = self.ids.alloc_func();
        self.funcs.push(Function::new(id, name));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn image_param(&mut self, name: &str, ty: Type, dims: usize) -> Result<ImageParam> {
        if self.name_taken(name) {
            return Err(Self::redefinition(name));
        }
        let p = ImageParam {
            name: name.to_string(),
            ty,
            dims,
        };
        self.images.insert(name.to_string(), p.clone());
        Ok(p)
    }

    pub fn param(&mut self, name: &str, ty: Type) -> Result<Param> {
        if self.name_taken(name) {
            return Err(Self::redefinition(name));
        }
        let p = Param {
            name: name.to_string(),
            ty,
            min: None,
            max: None,
        };
        self.params.insert(name.to_string(), p.clone());
        Ok(p)
    }

    /// Constrain `p` to `[min, max]`; either side may be left open.
    pub fn set_param_range(&mut self, p: &Param, min: Option<Expr>, max: Option<Expr>) -> Result<()> {
        let Some(stored) = self.params.get_mut(&p.name) else {
            return Err(Error::user(Diagnostic::error(
                codes::E0204_BAD_BOUND,
                format!("`{}` is not a parameter of this pipeline", p.name),
            )));
        };
        if let (Some(lo), Some(hi)) = (&min, &max) {
            if can_prove(&Expr::lt(hi.clone(), lo.clone())) {
                return Err(Error::user(Diagnostic::error(
                    codes::E0204_BAD_BOUND,
                    format!("the range of `{}` is empty: [{}, {}]", p.name, lo, hi),
                )));
            }
        }
        let ty = stored.ty;
        let cast = |e: Expr| if e.ty() == ty { e } else { Expr::cast(ty, e) };
        stored.min = min.map(cast);
        stored.max = max.map(cast);
        Ok(())
    }

    /// Require `condition` to hold whenever the pipeline runs; failing
    /// reports `message`.
    pub fn add_requirement(&mut self, condition: Expr, message: impl Into<String>) {
        self.requirements.push((condition, message.into()));
    }

    pub fn const_buffer(
        &mut self,
        name: &str,
        ty: Type,
        extents: Vec<i32>,
        data: Vec<f64>,
    ) -> Result<ConstBuffer> {
        if self.name_taken(name) {
            return Err(Self::redefinition(name));
        }
        let expected: i64 = extents.iter().map(|e| *e as i64).product();
        ensure!(
            expected == data.len() as i64,
            UserSnafu {
                diagnostic: Diagnostic::error(
                    codes::E0203_ARITY,
                    format!(
                        "constant buffer `{}` has {} elements but its extents need {}",
                        name,
                        data.len(),
                        expected
                    ),
                ),
            }
        );
        let b = ConstBuffer {
            name: name.to_string(),
            ty,
            extents,
            data,
        };
        self.buffers.insert(name.to_string(), b.clone());
        Ok(b)
    }

    // ── Definitions ──────────────────────────────────────────────────────

    fn user_error(code: DiagCode, func: &str, message: String) -> Error {
        Error::user(Diagnostic::error(code, message).with_subject(func.to_string()))
    }

    /// `f(args) = values`: the pure definition.
    pub fn define(&mut self, f: FuncId, args: &[Var], values: Vec<Expr>) -> Result<()> {
        let func = self.function(f);
        if func.is_defined() {
            return Err(Self::user_error(
                codes::E0202_REDEFINITION,
                &func.name,
                format!("function `{}` already has a pure definition", func.name),
            ));
        }
        if values.is_empty() {
            return Err(Self::user_error(
                codes::E0203_ARITY,
                &func.name,
                format!("function `{}` must produce at least one value", func.name),
            ));
        }
        for (i, a) in args.iter().enumerate() {
            if args[..i].iter().any(|b| b.name() == a.name()) {
                return Err(Self::user_error(
                    codes::E0106_DUPLICATE_DIM,
                    &func.name,
                    format!(
                        "pure definition of `{}` uses the variable `{}` twice",
                        func.name,
                        a.name()
                    ),
                ));
            }
        }
        self.install_pure(
            f,
            args.iter().map(|a| a.name().to_string()).collect(),
            values,
        );
        Ok(())
    }

    fn install_pure(&mut self, f: FuncId, args: Vec<String>, values: Vec<Expr>) {
        let mut def = Definition::new(
            true,
            args.iter().map(|a| Expr::var(a.clone())).collect(),
            values,
        );
        def.schedule.dims = args
            .iter()
            .map(|a| Dim::new(a.clone(), DimKind::PureVar))
            .chain(std::iter::once(Dim::new(OUTERMOST, DimKind::PureVar)))
            .collect();
        let func = self.function_mut(f);
        func.output_types = def.values.iter().map(|v| v.ty()).collect();
        func.schedule.storage_dims = args.clone();
        func.args = args;
        func.init = Some(def);
    }

    /// An update without a reduction domain. Returns the new stage index.
    pub fn update(&mut self, f: FuncId, args: Vec<Expr>, values: Vec<Expr>) -> Result<usize> {
        self.update_impl(f, args, values, RDom::from_vars(Vec::new()), None)
    }

    /// An update iterating over `rdom`. Returns the new stage index.
    pub fn update_with_domain(
        &mut self,
        f: FuncId,
        args: Vec<Expr>,
        values: Vec<Expr>,
        rdom: &RDom,
    ) -> Result<usize> {
        self.update_impl(f, args, values, rdom.clone(), None)
    }

    /// `f(args) += value`; an undefined `f` starts at zero.
    pub fn sum_into(&mut self, f: FuncId, args: Vec<Expr>, value: Expr, rdom: &RDom) -> Result<usize> {
        self.accumulate(f, args, value, rdom, Accumulate::Sum)
    }

    /// `f(args) *= value`; an undefined `f` starts at one.
    pub fn product_into(&mut self, f: FuncId, args: Vec<Expr>, value: Expr, rdom: &RDom) -> Result<usize> {
        self.accumulate(f, args, value, rdom, Accumulate::Product)
    }

    /// `f(args) = min(f(args), value)`; an undefined `f` starts at the
    /// type's maximum.
    pub fn min_into(&mut self, f: FuncId, args: Vec<Expr>, value: Expr, rdom: &RDom) -> Result<usize> {
        self.accumulate(f, args, value, rdom, Accumulate::Min)
    }

    /// `f(args) = max(f(args), value)`; an undefined `f` starts at the
    /// type's minimum.
    pub fn max_into(&mut self, f: FuncId, args: Vec<Expr>, value: Expr, rdom: &RDom) -> Result<usize> {
        self.accumulate(f, args, value, rdom, Accumulate::Max)
    }

    fn accumulate(
        &mut self,
        f: FuncId,
        args: Vec<Expr>,
        value: Expr,
        rdom: &RDom,
        kind: Accumulate,
    ) -> Result<usize> {
        let func = self.function(f);
        let ty = func.output_types.first().copied().unwrap_or_else(|| value.ty());
        let prev = Expr::call(ty, func.name.clone(), args.clone(), CallType::Halide, 0);
        let value = if value.ty() == ty {
            value
        } else {
            Expr::cast(ty, value)
        };
        let (combined, identity) = match kind {
            Accumulate::Sum => (prev + value, Expr::zero(ty)),
            Accumulate::Product => (prev * value, Expr::one(ty)),
            Accumulate::Min => (Expr::min(prev, value), Expr::type_max(ty)),
            Accumulate::Max => (Expr::max(prev, value), Expr::type_min(ty)),
        };
        self.update_impl(f, args, vec![combined], rdom.clone(), Some(vec![identity]))
    }

    fn update_impl(
        &mut self,
        f: FuncId,
        args: Vec<Expr>,
        values: Vec<Expr>,
        rdom: RDom,
        base: Option<Vec<Expr>>,
    ) -> Result<usize> {
        let name = self.function(f).name.clone();
        if self.function(f).is_extern() {
            return Err(Self::user_error(
                codes::E0206_EXTERN,
                &name,
                format!("extern function `{}` cannot have update definitions", name),
            ));
        }
        if !self.function(f).is_defined() {
            let pure_args: Vec<String> = args
                .iter()
                .enumerate()
                .map(|(i, a)| match a.as_variable() {
                    Some(v) if !rdom.contains(v) && !pure_args_clash(&args, i, v) => v.to_string(),
                    _ => format!("_{}", i),
                })
                .collect();
            let base = base.unwrap_or_else(|| values.iter().map(|v| Expr::zero(v.ty())).collect());
            self.install_pure(f, pure_args, base);
        }
        let func = self.function(f);
        if args.len() != func.dimensions() || values.len() != func.output_types.len() {
            return Err(Self::user_error(
                codes::E0203_ARITY,
                &name,
                format!(
                    "update of `{}` has {} arguments and {} values, but `{}` has {} dimensions and {} values",
                    name,
                    args.len(),
                    values.len(),
                    name,
                    func.dimensions(),
                    func.output_types.len()
                ),
            ));
        }
        let values: Vec<Expr> = values
            .into_iter()
            .zip(func.output_types.iter())
            .map(|(v, t)| if v.ty() == *t { v } else { Expr::cast(*t, v) })
            .collect();

        let self_calls_match = self_call_args(&name, &values)
            .iter()
            .all(|call_args| *call_args == args);
        let mut dims: Vec<Dim> = rdom
            .vars
            .iter()
            .map(|rv| {
                let pure = self_calls_match
                    && args.iter().any(|a| a.as_variable() == Some(rv.var.as_str()));
                Dim::new(
                    rv.var.clone(),
                    if pure {
                        DimKind::PureRVar
                    } else {
                        DimKind::ImpureRVar
                    },
                )
            })
            .collect();
        for a in &args {
            if let Some(v) = a.as_variable() {
                if !rdom.contains(v) && !dims.iter().any(|d| d.var == v) {
                    dims.push(Dim::new(v, DimKind::PureVar));
                }
            }
        }
        dims.push(Dim::new(OUTERMOST, DimKind::PureVar));

        let mut def = Definition::new(false, args, values);
        def.predicate = rdom.predicate.clone();
        def.schedule.dims = dims;
        def.schedule.rvars = rdom.vars.clone();
        let func = self.function_mut(f);
        func.updates.push(def);
        Ok(func.updates.len())
    }

    /// A function computed by one call to an external routine over its whole
    /// required region.
    pub fn define_extern(
        &mut self,
        f: FuncId,
        routine: &str,
        args: Vec<Expr>,
        types: Vec<Type>,
        dims: usize,
    ) -> Result<()> {
        let func = self.function(f);
        if func.is_defined() {
            return Err(Self::user_error(
                codes::E0202_REDEFINITION,
                &func.name,
                format!("function `{}` is already defined", func.name),
            ));
        }
        let func = self.function_mut(f);
        func.args = (0..dims).map(|i| format!("_{}", i)).collect();
        func.schedule.storage_dims = func.args.clone();
        func.output_types = types;
        func.extern_def = Some(ExternDefinition {
            routine: routine.to_string(),
            args,
        });
        Ok(())
    }

    // ── Calls ────────────────────────────────────────────────────────────

    pub fn call(&self, f: FuncId, args: Vec<Expr>) -> Result<Expr> {
        self.call_value(f, args, 0)
    }

    /// A read of tuple slot `index` of `f`.
    pub fn call_value(&self, f: FuncId, args: Vec<Expr>, index: usize) -> Result<Expr> {
        let func = self.function(f);
        if !func.is_defined() {
            return Err(Self::user_error(
                codes::E0201_UNDEFINED_FUNC,
                &func.name,
                format!("can't call function `{}` because it is undefined", func.name),
            ));
        }
        if args.len() != func.dimensions() || index >= func.output_types.len() {
            return Err(Self::user_error(
                codes::E0203_ARITY,
                &func.name,
                format!(
                    "call to `{}` with {} arguments (value {}), but it has {} dimensions and {} values",
                    func.name,
                    args.len(),
                    index,
                    func.dimensions(),
                    func.output_types.len()
                ),
            ));
        }
        Ok(Expr::call(
            func.output_types[index],
            func.name.clone(),
            args,
            CallType::Halide,
            index,
        ))
    }

    // ── Stages ───────────────────────────────────────────────────────────

    /// A handle on stage `stage` of `f` for scheduling.
    pub fn stage(&mut self, f: FuncId, stage: usize) -> Result<Stage<'_>> {
        let func = self.function(f);
        if stage >= func.stage_count() {
            return Err(Self::user_error(
                codes::E0207_BAD_UPDATE,
                &func.name,
                format!(
                    "function `{}` has {} stages; there is no stage {}",
                    func.name,
                    func.stage_count(),
                    stage
                ),
            ));
        }
        Ok(Stage::new(self, f, stage))
    }

    // ── Placement ────────────────────────────────────────────────────────

    pub fn compute_root(&mut self, f: FuncId) -> &mut Self {
        self.compute_at(f, LoopLevel::Root)
    }

    pub fn compute_at(&mut self, f: FuncId, level: LoopLevel) -> &mut Self {
        let s = &mut self.function_mut(f).schedule;
        s.compute_level = level;
        s.touched = true;
        self
    }

    pub fn compute_inline(&mut self, f: FuncId) -> &mut Self {
        self.compute_at(f, LoopLevel::Inlined)
    }

    pub fn store_root(&mut self, f: FuncId) -> &mut Self {
        self.store_at(f, LoopLevel::Root)
    }

    pub fn store_at(&mut self, f: FuncId, level: LoopLevel) -> &mut Self {
        let s = &mut self.function_mut(f).schedule;
        s.store_level = level;
        s.touched = true;
        self
    }

    pub fn store_in(&mut self, f: FuncId, memory_type: MemoryType) -> &mut Self {
        self.function_mut(f).schedule.memory_type = memory_type;
        self
    }

    /// Storage order, innermost (stride 1) first.
    pub fn reorder_storage(&mut self, f: FuncId, vars: &[Var]) -> Result<&mut Self> {
        let func = self.function(f);
        let mut order: Vec<String> = Vec::new();
        for v in vars {
            if !func.args.iter().any(|a| a == v.name()) {
                return Err(Self::user_error(
                    codes::E0101_UNKNOWN_DIM,
                    &func.name,
                    format!(
                        "can't reorder storage of `{}`: `{}` is not one of its dimensions",
                        func.name,
                        v.name()
                    ),
                ));
            }
            if order.iter().any(|o| o == v.name()) {
                return Err(Self::user_error(
                    codes::E0106_DUPLICATE_DIM,
                    &func.name,
                    format!("`{}` appears twice in reorder_storage", v.name()),
                ));
            }
            order.push(v.name().to_string());
        }
        // Unnamed dims keep their relative order after the named ones.
        let current = func.schedule.storage_dims.clone();
        let mut slots: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(_, d)| order.contains(d))
            .map(|(i, _)| i)
            .collect();
        slots.sort_unstable();
        let mut next = current.clone();
        for (slot, name) in slots.into_iter().zip(order) {
            next[slot] = name;
        }
        self.function_mut(f).schedule.storage_dims = next;
        Ok(self)
    }

    pub fn memoize(&mut self, f: FuncId) -> &mut Self {
        self.function_mut(f).schedule.memoized = true;
        self
    }

    pub fn async_(&mut self, f: FuncId) -> &mut Self {
        self.function_mut(f).schedule.is_async = true;
        self
    }

    pub fn trace_loads(&mut self, f: FuncId) -> &mut Self {
        self.function_mut(f).trace.loads = true;
        self
    }

    pub fn trace_stores(&mut self, f: FuncId) -> &mut Self {
        self.function_mut(f).trace.stores = true;
        self
    }

    pub fn trace_realizations(&mut self, f: FuncId) -> &mut Self {
        self.function_mut(f).trace.realizations = true;
        self
    }

    /// Replace the inferred bounds of pure dimension `var`.
    pub fn bound(&mut self, f: FuncId, var: &Var, min: impl Into<Expr>, extent: impl Into<Expr>) -> Result<&mut Self> {
        let b = self.checked_bound(f, var, min.into(), extent.into())?;
        let s = &mut self.function_mut(f).schedule;
        s.bounds.retain(|o| o.var != b.var);
        s.bounds.push(b);
        s.touched = true;
        Ok(self)
    }

    /// Record an advisory size for `var`. Lowering ignores estimates.
    pub fn set_estimate(&mut self, f: FuncId, var: &Var, min: impl Into<Expr>, extent: impl Into<Expr>) -> Result<&mut Self> {
        let b = self.checked_bound(f, var, min.into(), extent.into())?;
        let s = &mut self.function_mut(f).schedule;
        s.estimates.retain(|o| o.var != b.var);
        s.estimates.push(b);
        Ok(self)
    }

    fn checked_bound(&self, f: FuncId, var: &Var, min: Expr, extent: Expr) -> Result<Bound> {
        let func = self.function(f);
        if !func.args.iter().any(|a| a == var.name()) {
            return Err(Self::user_error(
                codes::E0204_BAD_BOUND,
                &func.name,
                format!(
                    "can't bound `{}` of `{}`: bounds may only be set on pure dimensions ({})",
                    var.name(),
                    func.name,
                    func.args.join(", ")
                ),
            ));
        }
        let as_i32 = |e: Expr| if e.ty() == Type::i32() { e } else { Expr::cast(Type::i32(), e) };
        Ok(Bound {
            var: var.name().to_string(),
            min: as_i32(min),
            extent: as_i32(extent),
        })
    }

    // ── Wrappers ─────────────────────────────────────────────────────────

    /// An identity wrapper of `f` used only by `consumer`.
    pub fn in_(&mut self, f: FuncId, consumer: FuncId) -> Result<FuncId> {
        let g = self.function(consumer).name.clone();
        let prefix = format!("{}_in_{}", self.function(f).name, g);
        self.wrapper(f, &[g], prefix, false)
    }

    /// One identity wrapper of `f` shared by several consumers.
    pub fn in_many(&mut self, f: FuncId, consumers: &[FuncId]) -> Result<FuncId> {
        let keys: Vec<String> = consumers
            .iter()
            .map(|c| self.function(*c).name.clone())
            .collect();
        let prefix = format!("{}_wrapper", self.function(f).name);
        self.wrapper(f, &keys, prefix, false)
    }

    /// An identity wrapper of `f` used by every consumer.
    pub fn in_global(&mut self, f: FuncId) -> Result<FuncId> {
        let prefix = format!("{}_global_wrapper", self.function(f).name);
        self.wrapper(f, &[String::new()], prefix, false)
    }

    /// A private copy of `f` for the given consumers.
    pub fn clone_in(&mut self, f: FuncId, consumers: &[FuncId]) -> Result<FuncId> {
        let keys: Vec<String> = consumers
            .iter()
            .map(|c| self.function(*c).name.clone())
            .collect();
        let fname = self.function(f).name.clone();
        let prefix = match keys.as_slice() {
            [only] => format!("{}_clone_in_{}", fname, only),
            _ => format!("{}_clone", fname),
        };
        self.wrapper(f, &keys, prefix, true)
    }

    fn wrapper(&mut self, f: FuncId, keys: &[String], prefix: String, clone: bool) -> Result<FuncId> {
        let src = self.function(f).clone();
        if !src.is_defined() {
            return Err(Self::user_error(
                codes::E0201_UNDEFINED_FUNC,
                &src.name,
                format!("can't wrap undefined function `{}`", src.name),
            ));
        }
        if keys.iter().any(|k| *k == src.name) {
            return Err(Self::user_error(
                codes::E0205_WRAPPER,
                &src.name,
                format!("function `{}` can't be a wrapper of itself", src.name),
            ));
        }
        let existing: Vec<Option<&String>> = keys.iter().map(|k| src.wrappers.get(k)).collect();
        if let Some(Some(first)) = existing.first() {
            if existing.iter().all(|e| *e == Some(*first)) {
                return self.id_of(first).ok_or_else(|| {
                    Error::internal(format!("wrapper `{}` is not in the pipeline", first))
                });
            }
        }
        if existing.iter().any(|e| e.is_some()) {
            return Err(Self::user_error(
                codes::E0205_WRAPPER,
                &src.name,
                format!(
                    "consumers {} of `{}` already have different wrappers",
                    keys.join(", "),
                    src.name
                ),
            ));
        }

        let name = format!("{}${}", prefix, src.wrappers.len());
        let id = self.func(&name)?;
        if clone {
            let mut copy = src.clone();
            copy.id = id;
            copy.name = name.clone();
            copy.wrappers.clear();
            for def in copy.definitions_mut() {
                def.map_exprs(&mut |e| rename_calls(&src.name, &name, e));
            }
            *self.function_mut(id) = copy;
        } else {
            let args: Vec<Var> = src.args.iter().map(Var::new).collect();
            let arg_exprs: Vec<Expr> = args.iter().map(Var::expr).collect();
            let values = (0..src.output_types.len())
                .map(|i| self.call_value(f, arg_exprs.clone(), i))
                .collect::<Result<Vec<_>>>()?;
            self.define(id, &args, values)?;
        }
        let func = self.function_mut(f);
        for k in keys {
            func.wrappers.insert(k.clone(), name.clone());
        }
        Ok(id)
    }
}

/// An update arg that repeats an earlier variable can't name a pure dim twice.
fn pure_args_clash(args: &[Expr], i: usize, v: &str) -> bool {
    args[..i].iter().any(|a| a.as_variable() == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::RDom;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut p = Pipeline::new();
        p.func("f").unwrap();
        assert_eq!(p.func("f").unwrap_err().code(), Some("E0202"));
        assert_eq!(p.param("f", Type::i32()).unwrap_err().code(), Some("E0202"));
    }

    #[test]
    fn pure_definition_sets_dims_and_storage() {
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        let (x, y) = (Var::new("x"), Var::new("y"));
        p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr()]).unwrap();
        let func = p.function(f);
        let dims: Vec<&str> = func.init.as_ref().unwrap().schedule.dims.iter().map(|d| d.var.as_str()).collect();
        assert_eq!(dims, vec!["x", "y", OUTERMOST]);
        assert_eq!(func.schedule.storage_dims, vec!["x", "y"]);
        assert_eq!(func.output_types, vec![Type::i32()]);
    }

    #[test]
    fn update_on_undefined_synthesizes_base_case() {
        let mut p = Pipeline::new();
        let h = p.func("hist").unwrap();
        let r = RDom::new("r", [(0, 16)]);
        let stage = p
            .sum_into(h, vec![r.x().expr() % 4], Expr::int(1), &r)
            .unwrap();
        assert_eq!(stage, 1);
        let func = p.function(h);
        assert_eq!(func.args, vec!["_0"]);
        assert!(func.init.as_ref().unwrap().values[0].is_zero());
        let update = &func.updates[0];
        assert_eq!(update.schedule.dims[0].kind, DimKind::ImpureRVar);
        assert_eq!(update.schedule.dims.last().unwrap().var, OUTERMOST);
    }

    #[test]
    fn rvar_on_lhs_is_pure() {
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        let x = Var::new("x");
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let r = RDom::new("r", [(0, 10)]);
        let prev = p.call(f, vec![r.x().expr()]).unwrap();
        p.update_with_domain(f, vec![r.x().expr()], vec![prev * 2], &r).unwrap();
        assert_eq!(p.function(f).updates[0].schedule.dims[0].kind, DimKind::PureRVar);
    }

    #[test]
    fn bounds_only_on_pure_args() {
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        let x = Var::new("x");
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        assert!(p.bound(f, &x, 0, 16).is_ok());
        let err = p.bound(f, &Var::new("q"), 0, 16).unwrap_err();
        assert_eq!(err.code(), Some("E0204"));
    }

    #[test]
    fn wrappers_are_shared_or_rejected() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx.clone()]).unwrap();
        let h = p.func("h").unwrap();
        p.define(h, &[x.clone()], vec![fx]).unwrap();

        let w = p.in_(f, g).unwrap();
        assert_eq!(p.function(w).name, "f_in_g$0");
        assert_eq!(p.in_(f, g).unwrap(), w);
        let w2 = p.in_(f, h).unwrap();
        assert_eq!(p.function(w2).name, "f_in_h$1");
        assert_eq!(p.in_many(f, &[g, h]).unwrap_err().code(), Some("E0205"));
        assert_eq!(p.in_(f, f).unwrap_err().code(), Some("E0205"));
    }

    #[test]
    fn storage_reorder_keeps_unnamed_dims() {
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        let (x, y, c) = (Var::new("x"), Var::new("y"), Var::new("c"));
        p.define(f, &[x.clone(), y.clone(), c.clone()], vec![Expr::int(0)]).unwrap();
        p.reorder_storage(f, &[c.clone(), x.clone()]).unwrap();
        assert_eq!(p.function(f).schedule.storage_dims, vec!["c", "y", "x"]);
    }
}
