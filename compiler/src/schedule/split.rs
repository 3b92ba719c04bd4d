// split.rs - Replaying split records into loop-variable definitions
//
// Each split record turns into (a) substitutions applied to the stage body,
// (b) let bindings that define the old variable in terms of the new ones,
// (c) predicates guarding the body, and (d) bound lets for the new loops.
// All names are prefixed with the stage prefix (`f.s0.`).

use std::collections::BTreeMap;

use crate::ir::{intrinsics, simplify, Expr, Type};

use crate::func::{Split, TailStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitResultKind {
    Substitution,
    LetStmt,
    Predicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplySplitResult {
    pub kind: SplitResultKind,
    /// Empty for predicates.
    pub name: String,
    pub value: Expr,
}

impl ApplySplitResult {
    fn subst(name: String, value: Expr) -> Self {
        ApplySplitResult {
            kind: SplitResultKind::Substitution,
            name,
            value,
        }
    }

    fn let_stmt(name: String, value: Expr) -> Self {
        ApplySplitResult {
            kind: SplitResultKind::LetStmt,
            name,
            value,
        }
    }

    fn predicate(value: Expr) -> Self {
        ApplySplitResult {
            kind: SplitResultKind::Predicate,
            name: String::new(),
            value,
        }
    }
}

fn v(name: String) -> Expr {
    Expr::var_of(Type::i32(), name)
}

/// Known extents (unprefixed dim name to extent) that the split factors may
/// divide exactly, seeded from `bound` directives and grown as splits are
/// replayed.
pub type ExtentAlignment = BTreeMap<String, Expr>;

/// Definitions of the variables a split consumes, in terms of the variables
/// it introduces. The tail strategy must already be resolved.
pub fn apply_split(split: &Split, prefix: &str, alignment: &mut ExtentAlignment) -> Vec<ApplySplitResult> {
    let mut out = Vec::new();
    match split {
        Split::SplitVar {
            old,
            outer,
            inner,
            factor,
            tail,
            ..
        } => {
            let outer_v = v(format!("{}{}", prefix, outer));
            let inner_v = v(format!("{}{}", prefix, inner));
            let old_name = format!("{}{}", prefix, old);
            let old_min = v(format!("{}.loop_min", old_name));
            let old_max = v(format!("{}.loop_max", old_name));
            let old_extent = v(format!("{}.loop_extent", old_name));
            let base_name = format!("{}{}.base", prefix, inner);
            let base_var = v(base_name.clone());

            alignment.insert(inner.clone(), factor.clone());
            let mut base = outer_v.clone() * factor.clone() + old_min.clone();

            let divides = alignment
                .get(old)
                .map(|ext| simplify(&(ext.clone() % factor.clone())).is_zero())
                .unwrap_or(false);
            if divides {
                if let Some(ext) = alignment.get(old).cloned() {
                    alignment.insert(outer.clone(), simplify(&(ext / factor.clone())));
                }
            } else {
                match tail {
                    TailStrategy::GuardWithIf => {
                        let rebased_name = format!("{}.rebased", old_name);
                        let rebased = v(rebased_name.clone());
                        out.push(ApplySplitResult::subst(
                            old_name.clone(),
                            rebased.clone() + old_min.clone(),
                        ));
                        out.push(ApplySplitResult::predicate(Expr::likely(Expr::lt(
                            rebased,
                            old_extent,
                        ))));
                        out.push(ApplySplitResult::let_stmt(
                            rebased_name,
                            outer_v * factor.clone() + inner_v.clone(),
                        ));
                    }
                    TailStrategy::ShiftInwards => {
                        let marked = Expr::pure_intrinsic(
                            Type::i32(),
                            intrinsics::LIKELY_IF_INNERMOST,
                            vec![base],
                        );
                        base = Expr::min(marked, old_max + (Expr::int(1) - factor.clone()));
                    }
                    TailStrategy::RoundUp | TailStrategy::Auto => {}
                }
            }
            out.push(ApplySplitResult::subst(
                old_name.clone(),
                base_var.clone() + inner_v.clone(),
            ));
            out.push(ApplySplitResult::let_stmt(old_name, base_var + inner_v));
            out.push(ApplySplitResult::let_stmt(base_name, base));
        }
        Split::FuseVars { fused, outer, inner } => {
            let fused_v = v(format!("{}{}", prefix, fused));
            let inner_min = v(format!("{}{}.loop_min", prefix, inner));
            let outer_min = v(format!("{}{}.loop_min", prefix, outer));
            let inner_extent = v(format!("{}{}.loop_extent", prefix, inner));
            let inner_e = fused_v.clone() % inner_extent.clone() + inner_min;
            let outer_e = fused_v / inner_extent + outer_min;
            out.push(ApplySplitResult::subst(format!("{}{}", prefix, inner), inner_e.clone()));
            out.push(ApplySplitResult::subst(format!("{}{}", prefix, outer), outer_e.clone()));
            out.push(ApplySplitResult::let_stmt(format!("{}{}", prefix, inner), inner_e));
            out.push(ApplySplitResult::let_stmt(format!("{}{}", prefix, outer), outer_e));
            if let (Some(a), Some(b)) = (alignment.get(inner).cloned(), alignment.get(outer).cloned()) {
                alignment.insert(fused.clone(), simplify(&(a * b)));
            }
        }
        Split::RenameVar { old, new } | Split::PurifyRVar { old, new } => {
            let new_v = v(format!("{}{}", prefix, new));
            out.push(ApplySplitResult::subst(format!("{}{}", prefix, old), new_v.clone()));
            out.push(ApplySplitResult::let_stmt(format!("{}{}", prefix, old), new_v));
        }
    }
    out
}

/// `.loop_min`, `.loop_max` and `.loop_extent` lets for the variables a
/// split introduces, in definition order.
pub fn loop_bounds_after_split(split: &Split, prefix: &str) -> Vec<(String, Expr)> {
    let p = |n: &str, field: &str| format!("{}{}.{}", prefix, n, field);
    match split {
        Split::SplitVar {
            old,
            outer,
            inner,
            factor,
            ..
        } => {
            let old_min = v(p(old, "loop_min"));
            let old_max = v(p(old, "loop_max"));
            let outer_extent = (old_max - old_min + factor.clone()) / factor.clone();
            vec![
                (p(inner, "loop_min"), Expr::int(0)),
                (p(inner, "loop_max"), factor.clone() - 1),
                (p(inner, "loop_extent"), factor.clone()),
                (p(outer, "loop_min"), Expr::int(0)),
                (p(outer, "loop_max"), outer_extent.clone() - 1),
                (p(outer, "loop_extent"), outer_extent),
            ]
        }
        Split::FuseVars { fused, outer, inner } => {
            let extent = v(p(inner, "loop_extent")) * v(p(outer, "loop_extent"));
            vec![
                (p(fused, "loop_min"), Expr::int(0)),
                (p(fused, "loop_max"), extent.clone() - 1),
                (p(fused, "loop_extent"), extent),
            ]
        }
        Split::RenameVar { old, new } => ["loop_min", "loop_max", "loop_extent"]
            .iter()
            .map(|field| (p(new, field), v(p(old, field))))
            .collect(),
        Split::PurifyRVar { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(tail: TailStrategy) -> Split {
        Split::SplitVar {
            old: "x".into(),
            outer: "x.xo".into(),
            inner: "x.xi".into(),
            factor: Expr::int(8),
            exact: false,
            tail,
        }
    }

    #[test]
    fn guard_with_if_adds_predicate() {
        let mut align = ExtentAlignment::new();
        let r = apply_split(&split(TailStrategy::GuardWithIf), "f.s0.", &mut align);
        let kinds: Vec<SplitResultKind> = r.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SplitResultKind::Substitution,
                SplitResultKind::Predicate,
                SplitResultKind::LetStmt,
                SplitResultKind::Substitution,
                SplitResultKind::LetStmt,
                SplitResultKind::LetStmt,
            ]
        );
        assert_eq!(r[2].name, "f.s0.x.rebased");
        assert!(align.contains_key("x.xi"));
    }

    #[test]
    fn known_divisible_extent_skips_the_tail() {
        let mut align = ExtentAlignment::new();
        align.insert("x".into(), Expr::int(32));
        let r = apply_split(&split(TailStrategy::GuardWithIf), "f.s0.", &mut align);
        assert!(r.iter().all(|r| r.kind != SplitResultKind::Predicate));
        assert!(align["x.xo"].is_const_value(4));
    }

    #[test]
    fn shift_inwards_clamps_the_base() {
        let mut align = ExtentAlignment::new();
        let r = apply_split(&split(TailStrategy::ShiftInwards), "f.s0.", &mut align);
        let base = r.last().unwrap();
        assert_eq!(base.name, "f.s0.x.xi.base");
        assert!(base.value.to_string().contains("min("));
    }

    #[test]
    fn rename_copies_bounds() {
        let s = Split::RenameVar {
            old: "x".into(),
            new: "x.z".into(),
        };
        let b = loop_bounds_after_split(&s, "f.s0.");
        assert_eq!(b[0].0, "f.s0.x.z.loop_min");
        assert_eq!(b[0].1.as_variable(), Some("f.s0.x.loop_min"));
    }
}
