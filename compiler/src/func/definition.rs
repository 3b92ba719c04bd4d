// definition.rs - One equation of a function, with its schedule
//
// A definition is `f(args) = values` (optionally guarded by a predicate),
// the stage schedule that says how to iterate it, and the ordered list of
// specializations that replace it when a runtime condition holds.

use crate::ir::{Expr, ExprNode};

use super::schedule::StageSchedule;

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    /// True for the pure (stage 0) definition.
    pub is_init: bool,
    pub args: Vec<Expr>,
    pub values: Vec<Expr>,
    pub predicate: Option<Expr>,
    pub schedule: StageSchedule,
    pub specializations: Vec<Specialization>,
}

/// An alternate definition selected when `condition` holds. A failure
/// specialization has condition `true` and raises `failure_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct Specialization {
    pub condition: Expr,
    pub definition: Definition,
    pub failure_message: Option<String>,
}

impl Definition {
    pub fn new(is_init: bool, args: Vec<Expr>, values: Vec<Expr>) -> Self {
        Definition {
            is_init,
            args,
            values,
            predicate: None,
            schedule: StageSchedule::default(),
            specializations: Vec::new(),
        }
    }

    /// The LHS arguments that are bare variables, with their positions.
    pub fn pure_args(&self) -> impl Iterator<Item = (usize, &str)> {
        self.args
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.as_variable().map(|n| (i, n)))
    }

    /// The predicate split at top-level conjunctions.
    pub fn split_predicate(&self) -> Vec<Expr> {
        fn go(e: &Expr, out: &mut Vec<Expr>) {
            match e.node() {
                ExprNode::And { a, b } => {
                    go(a, out);
                    go(b, out);
                }
                _ => out.push(e.clone()),
            }
        }
        let mut out = Vec::new();
        if let Some(p) = &self.predicate {
            go(p, &mut out);
        }
        out
    }

    pub fn has_failure_specialization(&self) -> bool {
        self.specializations
            .iter()
            .any(|s| s.failure_message.is_some())
    }

    /// Rewrite every expression of this definition (and of its
    /// specializations, conditions included) with `f`.
    pub fn map_exprs(&mut self, f: &mut dyn FnMut(&Expr) -> Expr) {
        for a in &mut self.args {
            *a = f(a);
        }
        for v in &mut self.values {
            *v = f(v);
        }
        if let Some(p) = &mut self.predicate {
            *p = f(p);
        }
        for rv in &mut self.schedule.rvars {
            rv.min = f(&rv.min);
            rv.extent = f(&rv.extent);
        }
        for s in &mut self.specializations {
            s.condition = f(&s.condition);
            s.definition.map_exprs(f);
        }
    }

    /// Visit every expression of this definition and its specializations.
    pub fn for_each_expr(&self, f: &mut dyn FnMut(&Expr)) {
        self.args.iter().for_each(&mut *f);
        self.values.iter().for_each(&mut *f);
        if let Some(p) = &self.predicate {
            f(p);
        }
        for rv in &self.schedule.rvars {
            f(&rv.min);
            f(&rv.extent);
        }
        for s in &self.specializations {
            f(&s.condition);
            s.definition.for_each_expr(f);
        }
    }

    /// Follow a path of specialization indices down from this definition.
    pub fn specialization_at(&self, path: &[usize]) -> Option<&Definition> {
        match path.split_first() {
            None => Some(self),
            Some((i, rest)) => self
                .specializations
                .get(*i)?
                .definition
                .specialization_at(rest),
        }
    }

    pub fn specialization_at_mut(&mut self, path: &[usize]) -> Option<&mut Definition> {
        match path.split_first() {
            None => Some(self),
            Some((i, rest)) => self
                .specializations
                .get_mut(*i)?
                .definition
                .specialization_at_mut(rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_splits_on_and() {
        let mut d = Definition::new(false, vec![Expr::var("x")], vec![Expr::int(0)]);
        d.predicate = Some(Expr::and(
            Expr::lt(Expr::var("r"), Expr::int(4)),
            Expr::and(Expr::bool(true), Expr::gt(Expr::var("r"), Expr::int(0))),
        ));
        assert_eq!(d.split_predicate().len(), 3);
        assert_eq!(d.pure_args().collect::<Vec<_>>(), vec![(0, "x")]);
    }

    #[test]
    fn map_reaches_specializations() {
        let mut d = Definition::new(true, vec![Expr::var("x")], vec![Expr::var("p")]);
        let inner = d.clone();
        d.specializations.push(Specialization {
            condition: Expr::var("p"),
            definition: inner,
            failure_message: None,
        });
        d.map_exprs(&mut |e| crate::ir::substitute("p", &Expr::int(3), e));
        assert!(d.values[0].is_const_value(3));
        assert!(d.specializations[0].condition.is_const_value(3));
        assert!(d.specialization_at(&[0]).unwrap().values[0].is_const_value(3));
    }
}
