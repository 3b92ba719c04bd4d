// stage.rs - Scheduling primitives on one definition of a function
//
// A `Stage` names a function, a stage index and a path of specializations.
// Every primitive works on a copy of the stage schedule and commits it only
// after all checks pass, so a failed call leaves the schedule untouched.
// Primitives chain: `p.stage(f, 0)?.split(&x, "xo", "xi", 8, Auto)?.vectorize("xi")?`.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, DiagCode, Diagnostic};
use crate::error::{Error, Result};
use crate::func::{
    var_name_match, Definition, Dim, DimKind, FuseLoopLevel, LoopAlignStrategy, LoopLevel,
    Pipeline, Specialization, Split, StageSchedule, TailStrategy, Var, VarOrRVar, OUTERMOST,
};
use crate::id::FuncId;
use crate::ir::{can_prove, const_int_value, vars_in_expr, DeviceApi, Expr, ForType, Type};

use super::associativity::AssociativeOp;

#[derive(Debug)]
pub struct Stage<'a> {
    pipeline: &'a mut Pipeline,
    func: FuncId,
    stage: usize,
    path: Vec<usize>,
}

impl<'a> Stage<'a> {
    pub(crate) fn new(pipeline: &'a mut Pipeline, func: FuncId, stage: usize) -> Self {
        Stage {
            pipeline,
            func,
            stage,
            path: Vec::new(),
        }
    }

    pub fn func_id(&self) -> FuncId {
        self.func
    }

    pub fn index(&self) -> usize {
        self.stage
    }

    pub fn is_specialization(&self) -> bool {
        !self.path.is_empty()
    }

    /// `f.s1`
    pub fn name(&self) -> String {
        self.pipeline.function(self.func).stage_name(self.stage)
    }

    pub(crate) fn pipeline(&mut self) -> &mut Pipeline {
        self.pipeline
    }

    pub fn definition(&self) -> Result<&Definition> {
        self.pipeline
            .function(self.func)
            .definition(self.stage)
            .and_then(|d| d.specialization_at(&self.path))
            .ok_or_else(|| Error::internal(format!("stage {} has no definition", self.name())))
    }

    pub(crate) fn definition_mut(&mut self) -> Result<&mut Definition> {
        let (func, stage) = (self.func, self.stage);
        let name = self.name();
        self.pipeline
            .function_mut(func)
            .definition_mut(stage)
            .and_then(|d| d.specialization_at_mut(&self.path))
            .ok_or_else(|| Error::internal(format!("stage {} has no definition", name)))
    }

    fn schedule(&self) -> Result<StageSchedule> {
        Ok(self.definition()?.schedule.clone())
    }

    fn commit(&mut self, mut sched: StageSchedule) -> Result<()> {
        sched.touched = true;
        self.definition_mut()?.schedule = sched;
        Ok(())
    }

    fn diag(&self, code: DiagCode, message: impl Into<String>) -> Diagnostic {
        let name = self.name();
        Diagnostic::error(code, format!("in schedule for {}, {}", name, message.into()))
            .with_subject(name)
    }

    pub(crate) fn error(&self, code: DiagCode, message: impl Into<String>) -> Error {
        Error::user(self.diag(code, message))
    }

    fn unknown_dim(&self, sched: &StageSchedule, var: &str, action: &str) -> Error {
        Error::user(
            self.diag(
                codes::E0101_UNKNOWN_DIM,
                format!("could not find dimension {} to {}", var, action),
            )
            .with_related(var.to_string(), "requested dimension")
            .with_hint(format!("dims are: {}", sched.dim_names())),
        )
    }

    fn find(&self, sched: &StageSchedule, var: &str, action: &str) -> Result<usize> {
        sched
            .find_dim(var)
            .ok_or_else(|| self.unknown_dim(sched, var, action))
    }

    pub(crate) fn prove_associativity(&self) -> Result<AssociativeOp> {
        let def = self.definition()?;
        let name = &self.pipeline.function(self.func).name;
        Ok(self.pipeline.prover().prove(name, &def.args, &def.values))
    }

    // ── Split family ─────────────────────────────────────────────────────

    /// Replace `old` by `outer` and `inner` (inner of extent `factor`).
    pub fn split(
        &mut self,
        old: impl Into<VarOrRVar>,
        outer: &str,
        inner: &str,
        factor: impl Into<Expr>,
        tail: TailStrategy,
    ) -> Result<&mut Self> {
        let old = old.into();
        self.split_impl(old.name(), outer, inner, factor.into(), tail)?;
        Ok(self)
    }

    /// Returns the qualified (outer, inner) names.
    pub(crate) fn split_impl(
        &mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: Expr,
        tail: TailStrategy,
    ) -> Result<(String, String)> {
        let mut sched = self.schedule()?;
        let i = self.find(&sched, old, "split")?;
        for new_name in [inner, outer] {
            let taken = sched
                .dims
                .iter()
                .enumerate()
                .any(|(j, d)| j != i && var_name_match(&d.var, new_name));
            if taken {
                return Err(self.error(
                    codes::E0102_DIM_EXISTS,
                    format!(
                        "can't create var {} using a split or tile, because {} is already used in this schedule",
                        new_name, new_name
                    ),
                ));
            }
        }
        if inner == outer {
            return Err(self.error(
                codes::E0102_DIM_EXISTS,
                format!("can't split {} into two dims both named {}", old, inner),
            ));
        }
        let old_dim = sched.dims[i].clone();
        let old_name = old_dim.var.clone();
        let inner_name = qualify(&old_name, inner);
        let outer_name = qualify(&old_name, outer);

        let factor = if factor.ty() == Type::i32() {
            factor
        } else {
            Expr::cast(Type::i32(), factor)
        };
        if let Some(c) = const_int_value(&factor) {
            if c <= 0 {
                return Err(self.error(
                    codes::E0103_BAD_FACTOR,
                    format!("split factor {} for {} must be positive", c, old_name),
                ));
            }
        }

        // Splitting a reduction variable must not change its iteration
        // count.
        let exact = old_dim.is_rvar();
        let is_update = self.stage > 0;
        let mut round_up_ok = !exact;
        if round_up_ok && is_update {
            let mut inner_vars: BTreeSet<String> = BTreeSet::new();
            for s in &sched.splits {
                match s {
                    Split::SplitVar {
                        old, outer, inner, ..
                    } => {
                        inner_vars.insert(inner.clone());
                        if inner_vars.contains(old) {
                            inner_vars.insert(outer.clone());
                        }
                    }
                    Split::RenameVar { old, new } | Split::PurifyRVar { old, new } => {
                        if inner_vars.contains(old) {
                            inner_vars.insert(new.clone());
                        }
                    }
                    Split::FuseVars {
                        fused,
                        outer,
                        inner,
                    } => {
                        if inner_vars.contains(inner) || inner_vars.contains(outer) {
                            inner_vars.insert(fused.clone());
                        }
                    }
                }
            }
            round_up_ok = !inner_vars.contains(&old_name);
            if !round_up_ok && tail == TailStrategy::RoundUp {
                return Err(self.error(
                    codes::E0104_BAD_TAIL,
                    format!(
                        "can't use RoundUp for splitting {} in an update definition: it may recompute values; use GuardWithIf",
                        old_name
                    ),
                ));
            }
        }

        let tail = match tail {
            TailStrategy::Auto if exact => TailStrategy::GuardWithIf,
            TailStrategy::Auto if is_update => {
                if round_up_ok {
                    TailStrategy::RoundUp
                } else {
                    TailStrategy::GuardWithIf
                }
            }
            TailStrategy::Auto => {
                // A split of something already covered by a larger
                // ShiftInwards split gains nothing from shifting again.
                let mut shifted: BTreeMap<&str, &Expr> = BTreeMap::new();
                for s in &sched.splits {
                    match s {
                        Split::SplitVar {
                            outer,
                            factor,
                            tail: TailStrategy::ShiftInwards,
                            ..
                        } => {
                            shifted.insert(outer.as_str(), factor);
                        }
                        Split::SplitVar {
                            old, outer, inner, ..
                        } => {
                            if let Some(f) = shifted.get(old.as_str()).copied() {
                                shifted.insert(inner.as_str(), f);
                                shifted.insert(outer.as_str(), f);
                            }
                        }
                        Split::RenameVar { old, new } | Split::PurifyRVar { old, new } => {
                            if let Some(f) = shifted.get(old.as_str()).copied() {
                                shifted.insert(new.as_str(), f);
                            }
                        }
                        Split::FuseVars { .. } => {}
                    }
                }
                match shifted.get(old_name.as_str()) {
                    Some(f) if can_prove(&Expr::ge((*f).clone(), factor.clone())) => {
                        TailStrategy::RoundUp
                    }
                    _ => TailStrategy::ShiftInwards,
                }
            }
            t => t,
        };
        if is_update && tail == TailStrategy::ShiftInwards {
            return Err(self.error(
                codes::E0104_BAD_TAIL,
                format!(
                    "when splitting {}, ShiftInwards is not a legal tail strategy for update definitions, as it may change the meaning of the algorithm",
                    old_name
                ),
            ));
        }
        if exact && tail != TailStrategy::GuardWithIf {
            return Err(self.error(
                codes::E0104_BAD_TAIL,
                format!(
                    "when splitting {}, the tail strategy must be GuardWithIf or Auto",
                    old_name
                ),
            ));
        }

        let mut inner_dim = old_dim.clone();
        inner_dim.var = inner_name.clone();
        let mut outer_dim = old_dim;
        outer_dim.var = outer_name.clone();
        if outer_dim.for_type == ForType::Extern {
            outer_dim.for_type = ForType::Serial;
        }
        sched.dims[i] = inner_dim;
        sched.dims.insert(i + 1, outer_dim);
        sched.splits.push(Split::SplitVar {
            old: old_name,
            outer: outer_name.clone(),
            inner: inner_name.clone(),
            factor,
            exact,
            tail,
        });
        self.commit(sched)?;
        Ok((outer_name, inner_name))
    }

    /// Merge `inner` and the dim directly outside it into `fused`.
    pub fn fuse(
        &mut self,
        inner: impl Into<VarOrRVar>,
        outer: impl Into<VarOrRVar>,
        fused: &str,
    ) -> Result<&mut Self> {
        let (inner, outer) = (inner.into(), outer.into());
        let mut sched = self.schedule()?;
        let io = self.find(&sched, outer.name(), "fuse")?;
        let ii = self.find(&sched, inner.name(), "fuse")?;
        if io != ii + 1 {
            return Err(self.error(
                codes::E0105_NOT_ADJACENT,
                format!(
                    "can't fuse {} and {}: {} must be the dimension directly outside {}",
                    inner.name(),
                    outer.name(),
                    outer.name(),
                    inner.name()
                ),
            ));
        }
        let outer_dim = sched.dims.remove(io);
        let inner_dim = &mut sched.dims[ii];
        if inner_dim.is_rvar() != outer_dim.is_rvar() {
            return Err(Error::internal(format!(
                "fusing {} ({:?}) with {} ({:?})",
                inner_dim.var, inner_dim.kind, outer_dim.var, outer_dim.kind
            )));
        }
        let inner_name = inner_dim.var.clone();
        let fused_name = format!("{}.{}", inner_name, fused);
        inner_dim.var = fused_name.clone();
        inner_dim.for_type = outer_dim.for_type;
        inner_dim.device_api = outer_dim.device_api;
        if inner_dim.is_rvar() {
            inner_dim.kind = if inner_dim.kind == DimKind::PureRVar && outer_dim.kind == DimKind::PureRVar {
                DimKind::PureRVar
            } else {
                DimKind::ImpureRVar
            };
        }
        sched.splits.push(Split::FuseVars {
            fused: fused_name,
            outer: outer_dim.var,
            inner: inner_name,
        });
        self.commit(sched)?;
        Ok(self)
    }

    /// Give `old` a new name; the dim becomes `<old>.<new>`.
    pub fn rename(&mut self, old: impl Into<VarOrRVar>, new: &str) -> Result<&mut Self> {
        let old = old.into();
        let mut sched = self.schedule()?;
        if sched.dims.iter().any(|d| var_name_match(&d.var, new)) {
            return Err(self.error(
                codes::E0102_DIM_EXISTS,
                format!("can't rename {} to {}: {} is already a dimension", old.name(), new, new),
            ));
        }
        let i = self.find(&sched, old.name(), "rename")?;
        let old_name = sched.dims[i].var.clone();
        let new_name = format!("{}.{}", old_name, new);
        sched.dims[i].var = new_name.clone();

        let mut rewritten = false;
        for s in sched.splits.iter_mut().rev() {
            match s {
                Split::FuseVars {
                    fused,
                    outer,
                    inner,
                } => {
                    if *inner == old_name || *outer == old_name {
                        return Err(self.error(
                            codes::E0101_UNKNOWN_DIM,
                            format!(
                                "can't rename variable {} because it has already been fused into {}",
                                old_name, fused
                            ),
                        ));
                    }
                    if *fused == old_name {
                        *fused = new_name.clone();
                        rewritten = true;
                        break;
                    }
                }
                Split::SplitVar { inner, outer, .. } => {
                    if *inner == old_name {
                        *inner = new_name.clone();
                        rewritten = true;
                        break;
                    }
                    if *outer == old_name {
                        *outer = new_name.clone();
                        rewritten = true;
                        break;
                    }
                }
                Split::RenameVar { new, .. } | Split::PurifyRVar { new, .. } => {
                    if *new == old_name {
                        *new = new_name.clone();
                        rewritten = true;
                        break;
                    }
                }
            }
        }
        if !rewritten {
            sched.splits.push(Split::RenameVar {
                old: old_name,
                new: new_name,
            });
        }
        self.commit(sched)?;
        Ok(self)
    }

    /// Turn reduction dim `rvar` into the pure dim `var`.
    pub fn purify(&mut self, rvar: impl Into<VarOrRVar>, var: &Var) -> Result<&mut Self> {
        let rvar = rvar.into();
        let mut sched = self.schedule()?;
        let i = self.find(&sched, rvar.name(), "purify")?;
        if !sched.dims[i].is_rvar() {
            return Err(self.error(
                codes::E0101_UNKNOWN_DIM,
                format!("purify needs a reduction variable, but {} is pure", rvar.name()),
            ));
        }
        let old_name = std::mem::replace(&mut sched.dims[i].var, var.name().to_string());
        sched.dims[i].kind = DimKind::PureVar;
        sched.splits.push(Split::PurifyRVar {
            old: old_name,
            new: var.name().to_string(),
        });
        self.commit(sched)?;
        Ok(self)
    }

    // ── Ordering ─────────────────────────────────────────────────────────

    /// Put the named dims in the given order, innermost first. Dims not
    /// named keep their slots.
    pub fn reorder<V: Into<VarOrRVar> + Clone>(&mut self, vars: &[V]) -> Result<&mut Self> {
        let vars: Vec<VarOrRVar> = vars.iter().cloned().map(Into::into).collect();
        let mut sched = self.schedule()?;
        let old_dims = sched.dims.clone();
        let mut idx = Vec::with_capacity(vars.len());
        for v in &vars {
            let i = self.find(&sched, v.name(), "reorder")?;
            if idx.contains(&i) {
                return Err(self.error(
                    codes::E0106_DUPLICATE_DIM,
                    format!("{} appears more than once in reorder", v.name()),
                ));
            }
            idx.push(i);
        }

        'check: for i in 0..idx.len() {
            if old_dims[idx[i]].is_pure() {
                continue;
            }
            for j in i + 1..idx.len() {
                if !old_dims[idx[j]].is_pure() && idx[i] > idx[j] {
                    let op = self.prove_associativity()?;
                    if !(op.associative && op.commutative) {
                        return Err(self.error(
                            codes::E0107_NOT_ASSOCIATIVE,
                            format!(
                                "can't reorder RVars {} and {} because it may change the meaning of the algorithm",
                                vars[i].name(),
                                vars[j].name()
                            ),
                        ));
                    }
                    break 'check;
                }
            }
        }

        let mut sorted = idx.clone();
        sorted.sort_unstable();
        for (slot, from) in sorted.iter().zip(idx.iter()) {
            sched.dims[*slot] = old_dims[*from].clone();
        }

        // A compute_with pin stays at the same loop depth.
        if self.path.is_empty() {
            repin(&mut sched.fuse_level.level, &old_dims, &sched.dims);
        } else {
            let dims = sched.dims.clone();
            repin(&mut self.original_schedule_mut()?.fuse_level.level, &old_dims, &dims);
        }
        self.commit(sched)?;
        Ok(self)
    }

    fn original_schedule_mut(&mut self) -> Result<&mut StageSchedule> {
        let (func, stage) = (self.func, self.stage);
        let name = self.name();
        self.pipeline
            .function_mut(func)
            .definition_mut(stage)
            .map(|d| &mut d.schedule)
            .ok_or_else(|| Error::internal(format!("stage {} has no definition", name)))
    }

    /// `split(x, xo, xi)`, `split(y, yo, yi)`, then `reorder(xi, yi, xo, yo)`.
    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        &mut self,
        x: impl Into<VarOrRVar>,
        y: impl Into<VarOrRVar>,
        xo: &str,
        yo: &str,
        xi: &str,
        yi: &str,
        xfactor: impl Into<Expr>,
        yfactor: impl Into<Expr>,
        tail: TailStrategy,
    ) -> Result<&mut Self> {
        let (x, y) = (x.into(), y.into());
        self.split(x, xo, xi, xfactor, tail)?;
        self.split(y, yo, yi, yfactor, tail)?;
        self.reorder(&[xi, yi, xo, yo])
    }

    /// N-dimensional tile: each of `vars` is split into the matching outer
    /// and inner, and all inners are placed inside all outers.
    pub fn tile_n(
        &mut self,
        vars: &[VarOrRVar],
        outers: &[&str],
        inners: &[&str],
        factors: &[Expr],
        tail: TailStrategy,
    ) -> Result<&mut Self> {
        if vars.len() != outers.len() || vars.len() != inners.len() || vars.len() != factors.len() {
            return Err(self.error(
                codes::E0203_ARITY,
                format!(
                    "tile needs as many outer names, inner names and factors as dims ({})",
                    vars.len()
                ),
            ));
        }
        for (((v, o), i), f) in vars.iter().zip(outers).zip(inners).zip(factors) {
            self.split(v.clone(), o, i, f.clone(), tail)?;
        }
        let order: Vec<&str> = inners.iter().chain(outers.iter()).copied().collect();
        self.reorder(&order)
    }

    // ── Loop types ───────────────────────────────────────────────────────

    fn set_dim_type(&mut self, var: &str, for_type: ForType) -> Result<()> {
        let mut sched = self.schedule()?;
        let mut found = false;
        let mut warn_unproven = false;
        for i in 0..sched.dims.len() {
            if var_name_match(&sched.dims[i].var, var) {
                found = true;
                sched.dims[i].for_type = for_type;
                if !sched.dims[i].is_pure() && for_type.is_parallel() {
                    if !sched.allow_race_conditions && sched.atomic && !sched.override_atomic_associativity_test
                        && !self.prove_associativity()?.associative
                    {
                        return Err(self.error(
                            codes::E0107_NOT_ASSOCIATIVE,
                            format!("failed to call atomic() on {} since it can't prove associativity of the operator", self.name()),
                        ));
                    }
                    if !sched.allow_race_conditions && !sched.atomic {
                        return Err(Error::user(
                            self.diag(
                                codes::E0108_RACE,
                                format!(
                                    "marking var {} as {} may introduce a race condition resulting in incorrect output",
                                    var,
                                    for_type.keyword()
                                ),
                            )
                            .with_hint("use atomic() for an associative update, or allow_race_conditions() to accept nondeterministic output"),
                        ));
                    }
                    if for_type == ForType::Vectorized
                        && sched.allow_race_conditions
                        && !sched.atomic
                        && !self.prove_associativity()?.associative
                    {
                        warn_unproven = true;
                    }
                }
            } else if for_type == ForType::Vectorized && sched.dims[i].for_type == ForType::Vectorized {
                return Err(self.error(
                    codes::E0109_DOUBLE_VECTORIZE,
                    format!(
                        "can't vectorize across {} because the stage is already vectorized across {}",
                        var, sched.dims[i].var
                    ),
                ));
            }
        }
        if !found {
            return Err(self.unknown_dim(&sched, var, &format!("mark as {}", for_type.keyword())));
        }
        self.commit(sched)?;
        if warn_unproven {
            let name = self.name();
            self.pipeline.warn(
                Diagnostic::warning(
                    codes::W0001_UNPROVEN_REDUCTION,
                    format!(
                        "{} vectorizes reduction variable {} under allow_race_conditions without an associativity proof",
                        name, var
                    ),
                )
                .with_subject(name),
            );
        }
        Ok(())
    }

    fn set_dim_device_api(&mut self, var: &str, api: DeviceApi) -> Result<()> {
        let mut sched = self.schedule()?;
        let mut found = false;
        for d in sched.dims.iter_mut().filter(|d| var_name_match(&d.var, var)) {
            d.device_api = api;
            found = true;
        }
        if !found {
            return Err(self.unknown_dim(&sched, var, "set a device API on"));
        }
        self.commit(sched)
    }

    pub fn serial(&mut self, var: impl Into<VarOrRVar>) -> Result<&mut Self> {
        self.set_dim_type(var.into().name(), ForType::Serial)?;
        Ok(self)
    }

    pub fn parallel(&mut self, var: impl Into<VarOrRVar>) -> Result<&mut Self> {
        self.set_dim_type(var.into().name(), ForType::Parallel)?;
        Ok(self)
    }

    pub fn vectorize(&mut self, var: impl Into<VarOrRVar>) -> Result<&mut Self> {
        self.set_dim_type(var.into().name(), ForType::Vectorized)?;
        Ok(self)
    }

    pub fn unroll(&mut self, var: impl Into<VarOrRVar>) -> Result<&mut Self> {
        self.set_dim_type(var.into().name(), ForType::Unrolled)?;
        Ok(self)
    }

    /// Split `var` by `factor` into an outer dim that keeps the short name
    /// and a fresh inner dim. Returns the qualified (outer, inner) names.
    fn split_fresh(&mut self, var: &str, factor: Expr, tail: TailStrategy) -> Result<(String, String)> {
        let short = var.rsplit('.').next().unwrap_or(var).to_string();
        let tmp = self.pipeline.names.fresh(&short);
        self.split_impl(var, &short, &tmp, factor, tail)
    }

    /// Split `var` by `task_size` and run the outer loop in parallel.
    pub fn parallel_by(&mut self, var: impl Into<VarOrRVar>, task_size: impl Into<Expr>, tail: TailStrategy) -> Result<&mut Self> {
        let (outer, _) = self.split_fresh(var.into().name(), task_size.into(), tail)?;
        self.set_dim_type(&outer, ForType::Parallel)?;
        Ok(self)
    }

    /// Split `var` by `factor` and vectorize the inner loop.
    pub fn vectorize_by(&mut self, var: impl Into<VarOrRVar>, factor: impl Into<Expr>, tail: TailStrategy) -> Result<&mut Self> {
        let (_, inner) = self.split_fresh(var.into().name(), factor.into(), tail)?;
        self.set_dim_type(&inner, ForType::Vectorized)?;
        Ok(self)
    }

    /// Split `var` by `factor` and unroll the inner loop.
    pub fn unroll_by(&mut self, var: impl Into<VarOrRVar>, factor: impl Into<Expr>, tail: TailStrategy) -> Result<&mut Self> {
        let (_, inner) = self.split_fresh(var.into().name(), factor.into(), tail)?;
        self.set_dim_type(&inner, ForType::Unrolled)?;
        Ok(self)
    }

    // ── GPU ──────────────────────────────────────────────────────────────

    pub fn gpu_blocks<V: Into<VarOrRVar> + Clone>(&mut self, vars: &[V], api: DeviceApi) -> Result<&mut Self> {
        for v in vars {
            let v: VarOrRVar = v.clone().into();
            self.set_dim_device_api(v.name(), api)?;
            self.set_dim_type(v.name(), ForType::GpuBlock)?;
        }
        Ok(self)
    }

    pub fn gpu_threads<V: Into<VarOrRVar> + Clone>(&mut self, vars: &[V], api: DeviceApi) -> Result<&mut Self> {
        for v in vars {
            let v: VarOrRVar = v.clone().into();
            self.set_dim_device_api(v.name(), api)?;
            self.set_dim_type(v.name(), ForType::GpuThread)?;
        }
        Ok(self)
    }

    pub fn gpu_lanes(&mut self, var: impl Into<VarOrRVar>, api: DeviceApi) -> Result<&mut Self> {
        let v = var.into();
        self.set_dim_device_api(v.name(), api)?;
        self.set_dim_type(v.name(), ForType::GpuLane)?;
        Ok(self)
    }

    /// Run the whole stage as one GPU block of one thread.
    pub fn gpu_single_thread(&mut self, api: DeviceApi) -> Result<&mut Self> {
        let block = self.pipeline.names.fresh("block");
        let (_, inner) = self.split_impl(OUTERMOST, OUTERMOST, &block, Expr::int(1), TailStrategy::Auto)?;
        self.set_dim_device_api(&inner, api)?;
        self.set_dim_type(&inner, ForType::GpuBlock)?;
        Ok(self)
    }

    pub fn gpu<V: Into<VarOrRVar> + Clone>(&mut self, blocks: &[V], threads: &[V], api: DeviceApi) -> Result<&mut Self> {
        self.gpu_blocks(blocks, api)?;
        self.gpu_threads(threads, api)
    }

    /// Split `x` by `size` into GPU blocks `bx` and threads `tx`.
    pub fn gpu_tile(
        &mut self,
        x: impl Into<VarOrRVar>,
        bx: &str,
        tx: &str,
        size: impl Into<Expr>,
        tail: TailStrategy,
        api: DeviceApi,
    ) -> Result<&mut Self> {
        let x = x.into();
        let (outer, inner) = self.split_impl(x.name(), bx, tx, size.into(), tail)?;
        self.set_dim_device_api(&outer, api)?;
        self.set_dim_device_api(&inner, api)?;
        self.set_dim_type(&outer, ForType::GpuBlock)?;
        self.set_dim_type(&inner, ForType::GpuThread)?;
        Ok(self)
    }

    /// Run loop `var` and everything inside it on `api`'s device. Pass
    /// `Var::outermost()` to move the whole stage.
    pub fn offload_to(&mut self, var: impl Into<VarOrRVar>, api: DeviceApi) -> Result<&mut Self> {
        self.set_dim_device_api(var.into().name(), api)?;
        Ok(self)
    }

    // ── Race and atomic flags ────────────────────────────────────────────

    pub fn allow_race_conditions(&mut self) -> Result<&mut Self> {
        let mut sched = self.schedule()?;
        sched.allow_race_conditions = true;
        self.commit(sched)?;
        Ok(self)
    }

    /// Run the update atomically so its reduction dims may be parallel.
    pub fn atomic(&mut self, override_associativity_test: bool) -> Result<&mut Self> {
        if !override_associativity_test && !self.prove_associativity()?.associative {
            return Err(self.error(
                codes::E0107_NOT_ASSOCIATIVE,
                format!(
                    "failed to call atomic() on {} since it can't prove associativity of the operator",
                    self.name()
                ),
            ));
        }
        let mut sched = self.schedule()?;
        sched.atomic = true;
        sched.override_atomic_associativity_test = override_associativity_test;
        self.commit(sched)?;
        Ok(self)
    }

    // ── Specialization ───────────────────────────────────────────────────

    /// The branch of this stage taken when `condition` holds. Asking again
    /// with an equal condition returns the same branch.
    pub fn specialize(&mut self, condition: Expr) -> Result<Stage<'_>> {
        if !condition.ty().is_bool() {
            return Err(self.error(
                codes::E0111_SPECIALIZE,
                format!("specialization condition {} must be of type bool", condition),
            ));
        }
        let func = self.pipeline.function(self.func);
        let mut dim_names: BTreeSet<String> = func.args.iter().cloned().collect();
        for def in func.definitions() {
            dim_names.extend(def.schedule.dims.iter().map(|d| d.var.clone()));
            dim_names.extend(def.schedule.rvars.iter().map(|r| r.var.clone()));
        }
        dim_names.remove(OUTERMOST);
        if let Some(bad) = vars_in_expr(&condition).into_iter().find(|v| {
            dim_names.contains(v) || dim_names.iter().any(|d| var_name_match(d, v))
        }) {
            return Err(self.error(
                codes::E0111_SPECIALIZE,
                format!(
                    "specialization condition {} depends on Var or RVar {}; specialization conditions may not depend on any Vars or RVars",
                    condition, bad
                ),
            ));
        }

        let def = self.definition()?;
        if let Some(i) = def
            .specializations
            .iter()
            .position(|s| s.condition == condition)
        {
            return Ok(self.child(i));
        }
        if def.has_failure_specialization() {
            return Err(self.error(
                codes::E0111_SPECIALIZE,
                "cannot add new specializations after specialize_fail()",
            ));
        }
        let mut branch = def.clone();
        branch.specializations.clear();
        let def = self.definition_mut()?;
        def.specializations.push(Specialization {
            condition,
            definition: branch,
            failure_message: None,
        });
        let i = def.specializations.len() - 1;
        Ok(self.child(i))
    }

    fn child(&mut self, i: usize) -> Stage<'_> {
        let mut path = self.path.clone();
        path.push(i);
        Stage {
            pipeline: &mut *self.pipeline,
            func: self.func,
            stage: self.stage,
            path,
        }
    }

    /// Close the specialization chain: if no earlier condition held, the
    /// pipeline fails with `message`.
    pub fn specialize_fail(&mut self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(self.error(codes::E0111_SPECIALIZE, "specialize_fail() needs a message"));
        }
        let def = self.definition()?;
        if def.has_failure_specialization() {
            return Err(self.error(
                codes::E0111_SPECIALIZE,
                "only one specialize_fail() may be defined per stage",
            ));
        }
        let mut branch = def.clone();
        branch.specializations.clear();
        self.definition_mut()?.specializations.push(Specialization {
            condition: Expr::bool(true),
            definition: branch,
            failure_message: Some(message.to_string()),
        });
        Ok(())
    }

    // ── Cross-stage fusion ───────────────────────────────────────────────

    /// Fuse this stage's loops, down to the loop `level` names, into the
    /// loops of the stage `level` refers to.
    pub fn compute_with(&mut self, level: LoopLevel, align: &[(&str, LoopAlignStrategy)]) -> Result<&mut Self> {
        let (func, stage, var) = match level {
            LoopLevel::At { func, stage, var } => (func, stage, var),
            other => {
                return Err(self.error(
                    codes::E0112_COMPUTE_WITH,
                    format!("undefined loop level {} to compute with", other),
                ))
            }
        };
        let me = self.pipeline.function(self.func);
        if func == me.name {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("cannot schedule {} to be computed with {}.{}", self.name(), func, var),
            ));
        }
        if me.is_extern() {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("compute_with() on extern function {} is not allowed", me.name),
            ));
        }
        let Some(target) = self.pipeline.function_named(&func) else {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("cannot compute with unknown function {}", func),
            ));
        };
        if target.is_extern() {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("cannot compute with extern function {}", func),
            ));
        }
        let stage = stage.unwrap_or_else(|| target.stage_count().saturating_sub(1));
        let Some(target_def) = target.definition(stage) else {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("{} has no stage {}", func, stage),
            ));
        };
        if !target_def.specializations.is_empty() {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!("{}.s{} has specializations and can't be computed with", func, stage),
            ));
        }
        if target_def.schedule.find_dim(&var).is_none() {
            return Err(self.unknown_dim(&target_def.schedule, &var, "compute with"));
        }
        if self.is_specialization() {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                "compute_with must be applied to the unspecialized stage",
            ));
        }
        let original = self.schedule()?;
        if !self.definition()?.specializations.is_empty() {
            return Err(self.error(
                codes::E0112_COMPUTE_WITH,
                format!(
                    "{} is scheduled to be computed with {}, so it must not have any specializations",
                    self.name(),
                    func
                ),
            ));
        }
        let level = LoopLevel::At {
            func,
            stage: Some(stage),
            var,
        };
        let replaced = original.fuse_level.is_set().then(|| original.fuse_level.level.clone());
        let mut sched = original;
        sched.fuse_level = FuseLoopLevel {
            level: level.clone(),
            align: align.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        self.commit(sched)?;
        if let Some(old) = replaced {
            let name = self.name();
            self.pipeline.warn(
                Diagnostic::warning(
                    codes::W0003_COMPUTE_WITH_REPLACED,
                    format!(
                        "{} already has a compute_with at {}; replacing it with a new compute_with at {}",
                        name, old, level
                    ),
                )
                .with_subject(name),
            );
        }
        Ok(self)
    }

    // ── Function placement shortcuts ─────────────────────────────────────

    pub fn compute_root(&mut self) -> &mut Self {
        self.pipeline.compute_root(self.func);
        self
    }

    pub fn compute_at(&mut self, level: LoopLevel) -> &mut Self {
        self.pipeline.compute_at(self.func, level);
        self
    }

    pub fn store_root(&mut self) -> &mut Self {
        self.pipeline.store_root(self.func);
        self
    }

    pub fn store_at(&mut self, level: LoopLevel) -> &mut Self {
        self.pipeline.store_at(self.func, level);
        self
    }

    /// Names of this stage's loop dims, innermost first.
    pub fn dims(&self) -> Result<Vec<String>> {
        Ok(self.definition()?.schedule.dims.iter().map(|d| d.var.clone()).collect())
    }
}

/// `inner` under `old`, unless the caller already qualified it.
fn qualify(old: &str, new_name: &str) -> String {
    match new_name.strip_prefix(old) {
        Some(rest) if rest.starts_with('.') && rest.len() > 1 => new_name.to_string(),
        _ => format!("{}.{}", old, new_name),
    }
}

fn repin(level: &mut LoopLevel, old_dims: &[Dim], new_dims: &[Dim]) {
    if let LoopLevel::At { var, .. } = level {
        let p = old_dims
            .iter()
            .position(|d| var_name_match(&d.var, var))
            .unwrap_or(0);
        if let Some(d) = new_dims.get(p) {
            *var = d.var.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `f(x, y) = x + y`
    fn pipeline() -> (Pipeline, FuncId) {
        let mut p = Pipeline::new();
        let (x, y) = (Var::new("x"), Var::new("y"));
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr()])
            .unwrap();
        (p, f)
    }

    fn dims(p: &mut Pipeline, f: FuncId) -> Vec<String> {
        p.stage(f, 0).unwrap().dims().unwrap()
    }

    #[test]
    fn split_qualifies_new_names_once() {
        let (mut p, f) = pipeline();
        p.stage(f, 0)
            .unwrap()
            .split("x", "x.xo", "x.xi", 4, TailStrategy::Auto)
            .unwrap()
            .split("y", "yo", "yi", 2, TailStrategy::Auto)
            .unwrap();
        assert_eq!(dims(&mut p, f), vec!["x.xi", "x.xo", "y.yi", "y.yo", OUTERMOST]);
    }

    #[test]
    fn split_rejects_bad_arguments() {
        let (mut p, f) = pipeline();
        let mut stage = p.stage(f, 0).unwrap();
        let unknown = stage.split("z", "zo", "zi", 4, TailStrategy::Auto).unwrap_err();
        assert_eq!(unknown.code(), Some("E0101"));
        let taken = stage.split("x", "y", "xi", 4, TailStrategy::Auto).unwrap_err();
        assert_eq!(taken.code(), Some("E0102"));
        let same = stage.split("x", "a", "a", 4, TailStrategy::Auto).unwrap_err();
        assert_eq!(same.code(), Some("E0102"));
        let zero = stage.split("x", "xo", "xi", 0, TailStrategy::Auto).unwrap_err();
        assert_eq!(zero.code(), Some("E0103"));
        let negative = stage.split("x", "xo", "xi", -2, TailStrategy::Auto).unwrap_err();
        assert_eq!(negative.code(), Some("E0103"));
        // Failed calls leave the schedule as it was.
        assert_eq!(dims(&mut p, f), vec!["x", "y", OUTERMOST]);
    }

    #[test]
    fn fuse_needs_adjacent_known_dims() {
        let (mut p, f) = pipeline();
        let mut stage = p.stage(f, 0).unwrap();
        let backwards = stage.fuse("y", "x", "xy").unwrap_err();
        assert_eq!(backwards.code(), Some("E0105"));
        let unknown = stage.fuse("x", "z", "xz").unwrap_err();
        assert_eq!(unknown.code(), Some("E0101"));
        stage.fuse("x", "y", "xy").unwrap();
        assert_eq!(dims(&mut p, f), vec!["x.xy", OUTERMOST]);
    }

    #[test]
    fn reorder_rejects_repeated_dims() {
        let (mut p, f) = pipeline();
        let err = p.stage(f, 0).unwrap().reorder(&["x", "x"]).unwrap_err();
        assert_eq!(err.code(), Some("E0106"));
    }

    #[test]
    fn rfactor_needs_an_update() {
        let (mut p, f) = pipeline();
        let err = p.stage(f, 0).unwrap().rfactor(&[]).unwrap_err();
        assert_eq!(err.code(), Some("E0110"));
    }
}
