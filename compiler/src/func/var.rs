// var.rs - Dimension variables and reduction domains
//
// A `Var` is a pure dimension, an `RVar` one dimension of a reduction
// domain. Both are identified by name only. Names qualified by split, fuse
// and rename are `.`-separated (`x.xo.xoi`); `var_name_match` matches a
// qualified dim name against the short name a user typed.

use crate::ir::{Expr, Type};

/// Sentinel dim that sits outside every real loop of a stage.
pub const OUTERMOST: &str = "__outermost";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var {
    name: String,
}

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var { name: name.into() }
    }

    pub fn outermost() -> Self {
        Var::new(OUTERMOST)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> Expr {
        Expr::var(self.name.clone())
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Expr {
        v.expr()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RVar {
    name: String,
}

impl RVar {
    pub fn new(name: impl Into<String>) -> Self {
        RVar { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> Expr {
        Expr::var(self.name.clone())
    }
}

impl From<&RVar> for Expr {
    fn from(v: &RVar) -> Expr {
        v.expr()
    }
}

/// One dimension of a reduction domain: iterates `var` over
/// `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// An ordered list of reduction variables plus an optional predicate. The
/// first variable is the innermost loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RDom {
    pub vars: Vec<ReductionVariable>,
    pub predicate: Option<Expr>,
}

const AXIS_NAMES: [&str; 4] = ["x", "y", "z", "w"];

impl RDom {
    /// `RDom::new("r", [(0, 4), (0, 8)])` makes `r$x` in [0, 4) and `r$y` in
    /// [0, 8).
    pub fn new<I, A, B>(name: &str, ranges: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<Expr>,
        B: Into<Expr>,
    {
        let vars = ranges
            .into_iter()
            .enumerate()
            .map(|(i, (min, extent))| {
                let axis = AXIS_NAMES
                    .get(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| i.to_string());
                ReductionVariable {
                    var: format!("{}${}", name, axis),
                    min: Expr::cast(Type::i32(), min.into()),
                    extent: Expr::cast(Type::i32(), extent.into()),
                }
            })
            .collect();
        RDom {
            vars,
            predicate: None,
        }
    }

    pub fn from_vars(vars: Vec<ReductionVariable>) -> Self {
        RDom {
            vars,
            predicate: None,
        }
    }

    /// Restrict the domain to points where `pred` holds. Repeated calls are
    /// conjoined.
    pub fn where_(mut self, pred: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(p) => Expr::and(p, pred),
            None => pred,
        });
        self
    }

    pub fn dimensions(&self) -> usize {
        self.vars.len()
    }

    pub fn rvar(&self, i: usize) -> Option<RVar> {
        self.vars.get(i).map(|v| RVar::new(v.var.clone()))
    }

    pub fn x(&self) -> RVar {
        self.axis(0)
    }

    pub fn y(&self) -> RVar {
        self.axis(1)
    }

    pub fn z(&self) -> RVar {
        self.axis(2)
    }

    fn axis(&self, i: usize) -> RVar {
        match self.vars.get(i) {
            Some(v) => RVar::new(v.var.clone()),
            None => RVar::new(format!("<missing rvar {}>", i)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.iter().any(|v| v.var == name)
    }
}

/// Either kind of dimension, as accepted by the scheduling primitives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarOrRVar {
    Var(String),
    RVar(String),
}

impl VarOrRVar {
    pub fn name(&self) -> &str {
        match self {
            VarOrRVar::Var(n) | VarOrRVar::RVar(n) => n,
        }
    }

    pub fn is_rvar(&self) -> bool {
        matches!(self, VarOrRVar::RVar(_))
    }
}

impl From<&Var> for VarOrRVar {
    fn from(v: &Var) -> Self {
        VarOrRVar::Var(v.name.clone())
    }
}

impl From<Var> for VarOrRVar {
    fn from(v: Var) -> Self {
        VarOrRVar::Var(v.name)
    }
}

impl From<&RVar> for VarOrRVar {
    fn from(v: &RVar) -> Self {
        VarOrRVar::RVar(v.name.clone())
    }
}

impl From<RVar> for VarOrRVar {
    fn from(v: RVar) -> Self {
        VarOrRVar::RVar(v.name)
    }
}

impl From<&str> for VarOrRVar {
    fn from(s: &str) -> Self {
        VarOrRVar::Var(s.to_string())
    }
}

impl From<String> for VarOrRVar {
    fn from(s: String) -> Self {
        VarOrRVar::Var(s)
    }
}

/// Does the (possibly qualified) dim name `candidate` refer to `var`?
/// `x.xo` matches `xo` and `x.xo`, but not `o`.
pub fn var_name_match(candidate: &str, var: &str) -> bool {
    candidate == var
        || (candidate.len() > var.len()
            && candidate.ends_with(var)
            && candidate.as_bytes()[candidate.len() - var.len() - 1] == b'.')
}
