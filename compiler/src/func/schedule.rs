// schedule.rs - Per-stage and per-function schedule records
//
// These are plain data. They only grow through the stage primitives in
// `crate::schedule` and the placement methods on `Pipeline`; lowering reads
// them.

use std::collections::BTreeMap;
use std::fmt;

use crate::ir::{DeviceApi, Expr, ForType, MemoryType};

use super::var::{var_name_match, ReductionVariable};

// ── Dims ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimKind {
    PureVar,
    /// A reduction variable whose iterations write disjoint sites.
    PureRVar,
    /// A reduction variable whose iterations may touch the same site.
    ImpureRVar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dim {
    pub var: String,
    pub for_type: ForType,
    pub device_api: DeviceApi,
    pub kind: DimKind,
}

impl Dim {
    pub fn new(var: impl Into<String>, kind: DimKind) -> Self {
        Dim {
            var: var.into(),
            for_type: ForType::Serial,
            device_api: DeviceApi::None,
            kind,
        }
    }

    pub fn is_pure(&self) -> bool {
        matches!(self.kind, DimKind::PureVar | DimKind::PureRVar)
    }

    pub fn is_rvar(&self) -> bool {
        matches!(self.kind, DimKind::PureRVar | DimKind::ImpureRVar)
    }
}

// ── Splits ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailStrategy {
    Auto,
    /// Round the extent up to a multiple of the factor; may compute past
    /// the end.
    RoundUp,
    /// Guard the innermost body with the original bound.
    GuardWithIf,
    /// Clamp the last iteration inwards so it overlaps the previous one.
    ShiftInwards,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Split {
    SplitVar {
        old: String,
        outer: String,
        inner: String,
        factor: Expr,
        exact: bool,
        tail: TailStrategy,
    },
    /// `fused` = `inner` + `outer` * extent(inner).
    FuseVars {
        fused: String,
        outer: String,
        inner: String,
    },
    RenameVar {
        old: String,
        new: String,
    },
    PurifyRVar {
        old: String,
        new: String,
    },
}

impl Split {
    /// The dim this record consumes (the fused dim it produces, for fuse).
    pub fn old_var(&self) -> &str {
        match self {
            Split::SplitVar { old, .. } | Split::RenameVar { old, .. } | Split::PurifyRVar { old, .. } => old,
            Split::FuseVars { fused, .. } => fused,
        }
    }

    pub fn is_split(&self) -> bool {
        matches!(self, Split::SplitVar { .. })
    }

    pub fn is_fuse(&self) -> bool {
        matches!(self, Split::FuseVars { .. })
    }
}

// ── Loop levels ────────────────────────────────────────────────────────────

/// Where a function is computed or stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum LoopLevel {
    #[default]
    Inlined,
    Root,
    /// The loop over `var` of stage `stage` of `func`. Without a stage the
    /// level names the first such loop that uses the scheduled function.
    At {
        func: String,
        stage: Option<usize>,
        var: String,
    },
}

impl LoopLevel {
    pub fn at(func: impl Into<String>, var: impl Into<String>) -> Self {
        LoopLevel::At {
            func: func.into(),
            stage: None,
            var: var.into(),
        }
    }

    pub fn at_stage(func: impl Into<String>, stage: usize, var: impl Into<String>) -> Self {
        LoopLevel::At {
            func: func.into(),
            stage: Some(stage),
            var: var.into(),
        }
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self, LoopLevel::Inlined)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }

    pub fn func(&self) -> Option<&str> {
        match self {
            LoopLevel::At { func, .. } => Some(func),
            _ => None,
        }
    }

    pub fn var(&self) -> Option<&str> {
        match self {
            LoopLevel::At { var, .. } => Some(var),
            _ => None,
        }
    }

    /// Does the loop named `loop_name` (`f.s1.x.xo`) implement this level?
    pub fn matches_loop(&self, loop_name: &str) -> bool {
        let LoopLevel::At { func, stage, var } = self else {
            return false;
        };
        let Some(rest) = loop_name
            .strip_prefix(func.as_str())
            .and_then(|r| r.strip_prefix(".s"))
        else {
            return false;
        };
        let Some((stage_str, dim)) = rest.split_once('.') else {
            return false;
        };
        let Ok(k) = stage_str.parse::<usize>() else {
            return false;
        };
        stage.map_or(true, |s| s == k) && var_name_match(dim, var)
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Inlined => write!(f, "inlined"),
            LoopLevel::Root => write!(f, "root"),
            LoopLevel::At {
                func,
                stage: Some(k),
                var,
            } => write!(f, "{}.s{}.{}", func, k, var),
            LoopLevel::At {
                func,
                stage: None,
                var,
            } => write!(f, "{}.{}", func, var),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopAlignStrategy {
    AlignStart,
    AlignEnd,
    NoAlign,
    Auto,
}

/// A compute_with link: this stage's loops down to `level` are fused with
/// the loops of the stage `level` names.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuseLoopLevel {
    pub level: LoopLevel,
    pub align: BTreeMap<String, LoopAlignStrategy>,
}

impl FuseLoopLevel {
    pub fn is_set(&self) -> bool {
        !self.level.is_inlined()
    }

    pub fn align_for(&self, dim: &str) -> LoopAlignStrategy {
        self.align
            .iter()
            .find(|(k, _)| var_name_match(dim, k))
            .map(|(_, v)| *v)
            .unwrap_or(LoopAlignStrategy::Auto)
    }
}

// ── Stage schedule ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageSchedule {
    /// Innermost first; the last entry is `__outermost`.
    pub dims: Vec<Dim>,
    pub splits: Vec<Split>,
    pub rvars: Vec<ReductionVariable>,
    pub allow_race_conditions: bool,
    pub atomic: bool,
    pub override_atomic_associativity_test: bool,
    pub fuse_level: FuseLoopLevel,
    /// Set once any primitive has been applied.
    pub touched: bool,
}

impl StageSchedule {
    pub fn find_dim(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| var_name_match(&d.var, var))
    }

    pub fn dim_names(&self) -> String {
        self.dims
            .iter()
            .map(|d| d.var.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ── Function schedule ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuncSchedule {
    /// Storage order, innermost (stride 1) first.
    pub storage_dims: Vec<String>,
    pub compute_level: LoopLevel,
    /// `Inlined` here means "same as the compute level".
    pub store_level: LoopLevel,
    pub memoized: bool,
    pub is_async: bool,
    pub memory_type: MemoryType,
    pub bounds: Vec<Bound>,
    pub estimates: Vec<Bound>,
    pub touched: bool,
}

impl FuncSchedule {
    pub fn effective_store_level(&self) -> &LoopLevel {
        if self.store_level.is_inlined() {
            &self.compute_level
        } else {
            &self.store_level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_level_matching() {
        let l = LoopLevel::at("f", "xo");
        assert!(l.matches_loop("f.s0.x.xo"));
        assert!(l.matches_loop("f.s2.x.xo"));
        assert!(!l.matches_loop("f.s0.x.xi"));
        assert!(!l.matches_loop("ff.s0.x.xo"));
        let l1 = LoopLevel::at_stage("f", 1, "x");
        assert!(l1.matches_loop("f.s1.x"));
        assert!(!l1.matches_loop("f.s0.x"));
        assert_eq!(l1.to_string(), "f.s1.x");
    }

    #[test]
    fn align_lookup_defaults_to_auto() {
        let mut fl = FuseLoopLevel::default();
        assert!(!fl.is_set());
        fl.align.insert("x".into(), LoopAlignStrategy::AlignEnd);
        assert_eq!(fl.align_for("f.s0.x"), LoopAlignStrategy::AlignEnd);
        assert_eq!(fl.align_for("y"), LoopAlignStrategy::Auto);
    }
}
