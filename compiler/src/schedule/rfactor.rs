// rfactor.rs - Factoring an associative reduction through an intermediate
//
// `f.update(k).rfactor([(r.y, u)])` moves the reduction over every rvar
// except `r.y` into a new function `f_intm(x.., u)`, indexed by the pure
// replacement `u`, and rewrites the update of `f` to fold `f_intm` over
// `r.y` alone. The intermediate's `u` dimension is pure, so it can be
// vectorized or parallelized without races.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::diag::{codes, Diagnostic};
use crate::error::Result;
use crate::func::{
    var_name_match, Dim, DimKind, LoopLevel, RDom, RVar, ReductionVariable, Split, StageSchedule,
    Var, OUTERMOST,
};
use crate::id::FuncId;
use crate::ir::{
    expr_uses_vars, mutate_expr_children, simplify, substitute_map, CallType, Expr, ExprNode,
    IrMutator, Type,
};

use super::split::{apply_split, loop_bounds_after_split, ApplySplitResult, ExtentAlignment, SplitResultKind};
use super::stage::Stage;

/// The expressions a split replay rewrites.
struct Exprs<'a> {
    predicates: &'a mut Vec<Expr>,
    args: &'a mut Vec<Expr>,
    values: &'a mut Vec<Expr>,
}

impl Exprs<'_> {
    fn substitute(&mut self, name: &str, value: &Expr) {
        let map = BTreeMap::from([(name.to_string(), value.clone())]);
        for e in self
            .predicates
            .iter_mut()
            .chain(self.args.iter_mut())
            .chain(self.values.iter_mut())
        {
            *e = substitute_map(&map, e);
        }
    }

    fn apply(&mut self, results: &[ApplySplitResult], bounds: &[(String, Expr)]) {
        for r in results {
            match r.kind {
                SplitResultKind::Substitution | SplitResultKind::LetStmt => {
                    self.substitute(&r.name, &r.value)
                }
                SplitResultKind::Predicate => self.predicates.push(r.value.clone()),
            }
        }
        for (name, value) in bounds {
            self.substitute(name, value);
        }
    }
}

/// Replay `split` onto the reduction domain if it touches one of `rvars`.
/// Returns false when the split only concerns pure dims.
fn apply_to_rvars(split: &Split, rvars: &mut Vec<ReductionVariable>, exprs: &mut Exprs<'_>) -> bool {
    let mut alignment: ExtentAlignment = rvars
        .iter()
        .map(|rv| (rv.var.clone(), rv.extent.clone()))
        .collect();
    let rvar_bounds: Vec<(String, Expr)> = rvars
        .iter()
        .flat_map(|rv| {
            [
                (format!("{}.loop_min", rv.var), rv.min.clone()),
                (
                    format!("{}.loop_max", rv.var),
                    simplify(&(rv.min.clone() + rv.extent.clone() - 1)),
                ),
                (format!("{}.loop_extent", rv.var), rv.extent.clone()),
            ]
        })
        .collect();
    let position = |rvars: &[ReductionVariable], name: &str| rvars.iter().position(|rv| rv.var == name);

    let found = match split {
        Split::SplitVar {
            old,
            outer,
            inner,
            factor,
            ..
        } => match position(rvars, old) {
            Some(i) => {
                let old_extent = rvars[i].extent.clone();
                rvars[i] = ReductionVariable {
                    var: inner.clone(),
                    min: Expr::int(0),
                    extent: factor.clone(),
                };
                rvars.insert(
                    i + 1,
                    ReductionVariable {
                        var: outer.clone(),
                        min: Expr::int(0),
                        extent: simplify(&((old_extent - 1 + factor.clone()) / factor.clone())),
                    },
                );
                true
            }
            None => false,
        },
        Split::FuseVars {
            fused,
            outer,
            inner,
        } => match (position(rvars, outer), position(rvars, inner)) {
            (Some(o), Some(i)) => {
                let extent = rvars[o].extent.clone() * rvars[i].extent.clone();
                rvars[o] = ReductionVariable {
                    var: fused.clone(),
                    min: Expr::int(0),
                    extent,
                };
                rvars.remove(i);
                true
            }
            _ => false,
        },
        Split::PurifyRVar { old, .. } => match position(rvars, old) {
            Some(i) => {
                rvars.remove(i);
                true
            }
            None => false,
        },
        Split::RenameVar { old, new } => match position(rvars, old) {
            Some(i) => {
                rvars[i].var = new.clone();
                true
            }
            None => false,
        },
    };
    if found {
        let results = apply_split(split, "", &mut alignment);
        let bounds = loop_bounds_after_split(split, "");
        exprs.apply(&results, &bounds);
        for (name, value) in &rvar_bounds {
            exprs.substitute(name, value);
        }
    }
    found
}

/// Point reads of `func` at `intm`, appending `extra` to their arguments.
struct RedirectSelfCalls<'a> {
    func: &'a str,
    intm: &'a str,
    extra: &'a [Expr],
}

impl IrMutator for RedirectSelfCalls<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = mutate_expr_children(self, e);
        match e.node() {
            ExprNode::Call {
                ty,
                name,
                args,
                call_type: CallType::Halide,
                value_index,
            } if name == self.func => {
                let mut args = args.clone();
                args.extend(self.extra.iter().cloned());
                Expr::call(*ty, self.intm, args, CallType::Halide, *value_index)
            }
            _ => e,
        }
    }
}

fn conjunction(preds: Vec<Expr>) -> Option<Expr> {
    preds.into_iter().reduce(Expr::and)
}

impl Stage<'_> {
    /// Split this reduction into an intermediate over every rvar not in
    /// `preserved` and a final fold over the preserved ones. Each preserved
    /// rvar becomes the paired pure var in the intermediate. Returns the
    /// intermediate function.
    pub fn rfactor(&mut self, preserved: &[(RVar, Var)]) -> Result<FuncId> {
        if self.index() == 0 {
            return Err(self.error(
                codes::E0110_RFACTOR,
                "rfactor() must be called on an update definition",
            ));
        }
        if self.is_specialization() {
            return Err(self.error(
                codes::E0110_RFACTOR,
                "rfactor() must be called on the unspecialized stage",
            ));
        }
        let func_id = self.func_id();
        let (func_name, func_args, storage_dims, output_types) = {
            let f = self.pipeline().function(func_id);
            (
                f.name.clone(),
                f.args.clone(),
                f.schedule.storage_dims.clone(),
                f.output_types.clone(),
            )
        };
        let prover = self.prove_associativity()?;
        if !prover.associative {
            return Err(self.error(
                codes::E0107_NOT_ASSOCIATIVE,
                format!(
                    "failed to call rfactor() on {} since it can't prove associativity of the operator",
                    self.name()
                ),
            ));
        }

        let def = self.definition()?.clone();
        let StageSchedule {
            mut dims,
            splits,
            mut rvars,
            ..
        } = def.schedule.clone();
        let mut args = def.args.clone();
        let mut values = def.values.clone();
        let mut predicates = def.split_predicate();

        let mut is_rfactored = vec![false; dims.len()];
        for (rv, v) in preserved {
            match dims.iter().position(|d| var_name_match(&d.var, rv.name())) {
                Some(i) if dims[i].is_rvar() => is_rfactored[i] = true,
                _ => {
                    return Err(self.error(
                        codes::E0110_RFACTOR,
                        format!(
                            "can't perform rfactor() on {} since it is not in the reduction domain",
                            rv.name()
                        ),
                    ))
                }
            }
            if dims.iter().any(|d| var_name_match(&d.var, v.name())) {
                return Err(self.error(
                    codes::E0110_RFACTOR,
                    format!(
                        "can't rename the rvar {} into {}, since it is already used in this schedule",
                        rv.name(),
                        v.name()
                    ),
                ));
            }
        }

        // Without commutativity only an outer prefix of the rvars may be
        // rfactored.
        if !prover.commutative {
            let mut last_rvar: Option<usize> = None;
            for i in (0..dims.len()).rev() {
                if let Some(outer) = last_rvar {
                    if is_rfactored[i] && !is_rfactored[outer] {
                        return Err(self.error(
                            codes::E0110_RFACTOR,
                            format!(
                                "can't rfactor an inner dimension {} without rfactoring the outer dimensions, since the operator is non-commutative",
                                dims[i].var
                            ),
                        ));
                    }
                }
                if dims[i].is_rvar() {
                    last_rvar = Some(i);
                }
            }
        }

        let remaining_splits: Vec<Split> = {
            let mut exprs = Exprs {
                predicates: &mut predicates,
                args: &mut args,
                values: &mut values,
            };
            splits
                .into_iter()
                .filter(|s| !apply_to_rvars(s, &mut rvars, &mut exprs))
                .collect()
        };

        let is_preserved = |rv: &ReductionVariable| {
            preserved
                .iter()
                .any(|(p, _)| var_name_match(&rv.var, p.name()))
        };
        let intm_rvars: Vec<ReductionVariable> =
            rvars.iter().filter(|rv| !is_preserved(rv)).cloned().collect();
        let lifted: BTreeSet<String> = intm_rvars.iter().map(|rv| rv.var.clone()).collect();

        // Order the preserved pairs by where their rvar sits in the domain.
        let mut kept: Vec<(String, Var)> = Vec::new();
        for rv in rvars.iter().filter(|rv| is_preserved(rv)) {
            if let Some((_, v)) = preserved
                .iter()
                .find(|(p, _)| var_name_match(&rv.var, p.name()))
            {
                kept.push((rv.var.clone(), v.clone()));
            }
        }
        let kept_rvars: Vec<ReductionVariable> =
            rvars.iter().filter(|rv| is_preserved(rv)).cloned().collect();
        let renames: Vec<Expr> = kept.iter().map(|(_, v)| v.expr()).collect();
        debug!(
            stage = %self.name(),
            lifted = ?lifted,
            kept = ?kept.iter().map(|(r, _)| r.as_str()).collect::<Vec<_>>(),
            "rfactor"
        );

        // ── The intermediate ─────────────────────────────────────────────
        let intm_name = {
            let base = format!("{}_intm", func_name);
            if self.pipeline().id_of(&base).is_some() {
                self.pipeline().names.fresh(&base)
            } else {
                base
            }
        };
        let pipeline = self.pipeline();
        let intm = pipeline.func(&intm_name)?;
        let init_args: Vec<Var> = func_args
            .iter()
            .map(Var::new)
            .chain(kept.iter().map(|(_, v)| v.clone()))
            .collect();
        let identities: Vec<Expr> = prover
            .identities
            .iter()
            .zip(&output_types)
            .map(|(id, ty)| if id.ty() == *ty { id.clone() } else { Expr::cast(*ty, id.clone()) })
            .collect();
        pipeline.define(intm, &init_args, identities)?;

        let rename_map: BTreeMap<String, Expr> = kept
            .iter()
            .map(|(rv, v)| (rv.clone(), v.expr()))
            .collect();
        let intm_args: Vec<Expr> = args
            .iter()
            .map(|a| substitute_map(&rename_map, a))
            .chain(renames.iter().cloned())
            .collect();
        let mut intm_preds = Vec::new();
        let mut kept_preds = Vec::new();
        for p in &predicates {
            intm_preds.push(substitute_map(&rename_map, p));
            if !expr_uses_vars(p, &lifted) {
                kept_preds.push(p.clone());
            }
        }
        let intm_values: Vec<Expr> = values
            .iter()
            .map(|v| {
                let v = substitute_map(&rename_map, v);
                RedirectSelfCalls {
                    func: &func_name,
                    intm: &intm_name,
                    extra: &renames,
                }
                .mutate_expr(&v)
            })
            .collect();
        let mut intm_rdom = RDom::from_vars(intm_rvars);
        if let Some(p) = conjunction(intm_preds) {
            intm_rdom = intm_rdom.where_(p);
        }
        pipeline.update_with_domain(intm, intm_args, intm_values, &intm_rdom)?;
        {
            let intm_fn = pipeline.function_mut(intm);
            for (slot, dim) in intm_fn.schedule.storage_dims.iter_mut().zip(&storage_dims) {
                *slot = dim.clone();
            }
            intm_fn.schedule.compute_level = LoopLevel::Root;
            intm_fn.schedule.touched = true;
            if let Some(update) = intm_fn.updates.first_mut() {
                update.schedule.dims = dims.clone();
                update.schedule.splits = remaining_splits.clone();
            }
        }
        {
            let mut intm_stage = pipeline.stage(intm, 1)?;
            for (rv, v) in &kept {
                intm_stage.purify(rv.as_str(), v)?;
            }
        }

        // ── The rewritten update ─────────────────────────────────────────
        for a in &func_args {
            if !dims.iter().any(|d| var_name_match(&d.var, a)) {
                let at = dims.len().saturating_sub(1);
                dims.insert(at, Dim::new(a.clone(), DimKind::PureVar));
            }
        }
        dims.retain(|d| !lifted.contains(&d.var));
        debug_assert!(dims.last().map(|d| d.var == OUTERMOST).unwrap_or(false));

        let store_args: Vec<Expr> = func_args.iter().map(|a| Expr::var(a.clone())).collect();
        let load_args: Vec<Expr> = store_args
            .iter()
            .cloned()
            .chain(kept_rvars.iter().map(|rv| Expr::var_of(Type::i32(), rv.var.clone())))
            .collect();

        let mut replacements = BTreeMap::new();
        let mut not_reductions = Vec::new();
        for (i, ty) in output_types.iter().enumerate() {
            if let Some(y) = prover.ys.get(i).filter(|y| !y.var.is_empty()) {
                replacements.insert(
                    y.var.clone(),
                    Expr::call(*ty, intm_name.clone(), load_args.clone(), CallType::Halide, i),
                );
            }
            match prover.xs.get(i).filter(|x| !x.var.is_empty()) {
                Some(x) => {
                    replacements.insert(
                        x.var.clone(),
                        Expr::call(*ty, func_name.clone(), store_args.clone(), CallType::Halide, i),
                    );
                }
                None => not_reductions.push(i),
            }
        }
        let new_values: Vec<Expr> = prover
            .ops
            .iter()
            .map(|op| substitute_map(&replacements, op))
            .collect();

        let stage_name = self.name();
        for i in not_reductions {
            self.pipeline().warn(
                Diagnostic::warning(
                    codes::W0004_NON_REDUCTION_RFACTOR,
                    format!(
                        "update definition of {} at index {} doesn't depend on the previous value, so it isn't a reduction",
                        stage_name, i
                    ),
                )
                .with_subject(stage_name.clone()),
            );
        }

        let def = self.definition_mut()?;
        def.args = store_args;
        def.values = new_values;
        def.predicate = conjunction(kept_preds);
        def.schedule.dims = dims;
        def.schedule.splits = remaining_splits;
        def.schedule.rvars = kept_rvars;
        def.schedule.touched = true;
        Ok(intm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, TailStrategy};

    fn sum_pipeline() -> (Pipeline, FuncId, RDom) {
        let mut p = Pipeline::new();
        let input = p.image_param("input", Type::i32(), 2).unwrap();
        let f = p.func("f").unwrap();
        let x = Var::new("x");
        p.define(f, &[x.clone()], vec![Expr::int(0)]).unwrap();
        let r = RDom::new("r", [(0, 4), (0, 8)]);
        let term = input.at(vec![r.x().expr(), r.y().expr()]);
        p.sum_into(f, vec![x.expr()], term, &r).unwrap();
        (p, f, r)
    }

    #[test]
    fn intermediate_reduces_over_lifted_rvars() {
        let (mut p, f, r) = sum_pipeline();
        let u = Var::new("u");
        let intm = p.stage(f, 1).unwrap().rfactor(&[(r.y(), u.clone())]).unwrap();

        let g = p.function(intm);
        assert_eq!(g.name, "f_intm");
        assert_eq!(g.args, vec!["x".to_string(), "u".to_string()]);
        assert!(g.schedule.compute_level.is_root());
        let upd = &g.updates[0];
        assert_eq!(upd.schedule.rvars.len(), 1);
        assert_eq!(upd.schedule.rvars[0].var, r.x().name());
        assert!(upd.schedule.dims.iter().any(|d| d.var == "u" && d.is_pure()));

        let f_upd = p.function(f).definition(1).unwrap();
        assert_eq!(f_upd.schedule.rvars.len(), 1);
        assert_eq!(f_upd.schedule.rvars[0].var, r.y().name());
        assert!(f_upd.values[0].to_string().contains("f_intm("));
        assert!(p.warnings().is_empty());
    }

    #[test]
    fn split_rvars_are_replayed_first() {
        let (mut p, f, r) = sum_pipeline();
        p.stage(f, 1)
            .unwrap()
            .split(&r.y(), "ryo", "ryi", 4, TailStrategy::Auto)
            .unwrap();
        let v = Var::new("v");
        let intm = p
            .stage(f, 1)
            .unwrap()
            .rfactor(&[(RVar::new(format!("{}.ryi", r.y().name())), v)])
            .unwrap();
        let upd = &p.function(intm).updates[0];
        let names: Vec<&str> = upd.schedule.rvars.iter().map(|rv| rv.var.as_str()).collect();
        assert!(names.contains(&r.x().name()));
        assert!(names.iter().any(|n| n.ends_with(".ryo")));
        assert!(!upd.schedule.splits.iter().any(|s| s.is_split()));
    }

    #[test]
    fn pure_stage_and_unknown_rvar_are_rejected() {
        let (mut p, f, _) = sum_pipeline();
        let err = p
            .stage(f, 0)
            .unwrap()
            .rfactor(&[(RVar::new("r$x"), Var::new("u"))])
            .unwrap_err();
        assert_eq!(err.code(), Some("E0110"));
        let err = p
            .stage(f, 1)
            .unwrap()
            .rfactor(&[(RVar::new("nope"), Var::new("u"))])
            .unwrap_err();
        assert_eq!(err.code(), Some("E0110"));
    }

    #[test]
    fn non_associative_update_is_rejected() {
        let mut p = Pipeline::new();
        let f = p.func("f").unwrap();
        let x = Var::new("x");
        p.define(f, &[x.clone()], vec![Expr::int(0)]).unwrap();
        let r = RDom::new("r", [(0, 4)]);
        let prev = p.call(f, vec![x.expr()]).unwrap();
        p.update_with_domain(f, vec![x.expr()], vec![prev - r.x().expr()], &r)
            .unwrap();
        let err = p
            .stage(f, 1)
            .unwrap()
            .rfactor(&[(r.x(), Var::new("u"))])
            .unwrap_err();
        assert_eq!(err.code(), Some("E0107"));
    }
}
