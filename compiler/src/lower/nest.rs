// nest.rs - The loop nest of one stage
//
// A stage becomes a `Provide` of its values at its LHS sites, wrapped in one
// loop per dim (outermost dim outermost), the lets that define the original
// variables in terms of the split ones, and the guards from tail strategies
// and the reduction domain predicate. Lets and guards float outwards past
// every loop they do not depend on. Loop bounds are defined outside the
// nest in terms of `<f>.s<k>.<v>.min/max`, which bounds inference provides.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::func::{Definition, Function, ReductionVariable, OUTERMOST};
use crate::ir::{
    intrinsics, substitute, substitute_map, substitute_stmt, vars_in_expr,
    CallType, DeviceApi, Expr, ForType, Stmt, Type,
};
use crate::schedule::{apply_split, loop_bounds_after_split, ExtentAlignment, SplitResultKind};

fn ivar(name: impl Into<String>) -> Expr {
    Expr::var_of(Type::i32(), name)
}

// ── Containers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Container {
    For {
        name: String,
        for_type: ForType,
        device_api: DeviceApi,
    },
    Let {
        name: String,
        value: Expr,
    },
    If {
        condition: Expr,
    },
}

impl Container {
    fn defines(&self) -> Option<&str> {
        match self {
            Container::For { name, .. } | Container::Let { name, .. } => Some(name),
            Container::If { .. } => None,
        }
    }

    fn uses(&self) -> BTreeSet<String> {
        match self {
            Container::For { .. } => BTreeSet::new(),
            Container::Let { value, .. } => vars_in_expr(value),
            Container::If { condition } => vars_in_expr(condition),
        }
    }

    pub(crate) fn is_loop(&self) -> bool {
        matches!(self, Container::For { .. })
    }

    pub(crate) fn wrap(&self, body: Stmt) -> Stmt {
        match self {
            Container::For {
                name,
                for_type,
                device_api,
            } => Stmt::for_loop(
                name.clone(),
                ivar(format!("{}.loop_min", name)),
                ivar(format!("{}.loop_extent", name)),
                *for_type,
                *device_api,
                body,
            ),
            Container::Let { name, value } => Stmt::let_stmt(name.clone(), value.clone(), body),
            Container::If { condition } => Stmt::if_then_else(condition.clone(), body, None),
        }
    }
}

/// Order lets and guards so every name is defined before it is used. Later
/// splits define variables that earlier splits' lets refer to.
fn order_by_dependency(mut pending: Vec<Container>) -> Vec<Container> {
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = (0..pending.len()).find(|&k| {
            let uses = pending[k].uses();
            !pending
                .iter()
                .enumerate()
                .any(|(j, c)| j != k && c.defines().is_some_and(|d| uses.contains(d)))
        });
        match ready {
            Some(k) => ordered.push(pending.remove(k)),
            None => {
                ordered.append(&mut pending);
            }
        }
    }
    ordered
}

/// Move each let and guard as far out as its dependencies allow.
pub(crate) fn hoist(containers: &mut [Container]) {
    // Outermost first, so a moved container never skips over one that has
    // not been visited yet.
    for i in 0..containers.len() {
        if containers[i].is_loop() {
            continue;
        }
        let uses = containers[i].uses();
        let mut j = i;
        while j > 0 {
            if let Some(d) = containers[j - 1].defines() {
                if uses.contains(d) {
                    break;
                }
            }
            containers.swap(j - 1, j);
            j -= 1;
        }
    }
}

pub(crate) fn wrap_all(containers: &[Container], body: Stmt) -> Stmt {
    containers.iter().rev().fold(body, |acc, c| c.wrap(acc))
}

fn wrap_lets(lets: &[(String, Expr)], body: Stmt) -> Stmt {
    lets.iter()
        .rev()
        .fold(body, |acc, (n, v)| Stmt::let_stmt(n.clone(), v.clone(), acc))
}

// ── Stage variables ────────────────────────────────────────────────────────

/// The pure variables a stage iterates, with the LHS position of each.
pub(crate) fn pure_vars(func: &Function, def: &Definition) -> Vec<(String, usize)> {
    if def.is_init {
        return func
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), i))
            .collect();
    }
    def.pure_args()
        .filter(|(_, n)| !def.schedule.rvars.iter().any(|rv| rv.var == *n))
        .map(|(i, n)| (n.to_string(), i))
        .collect()
}

/// `x` -> `f.s1.x` for every variable the stage binds.
fn qualify_map(prefix: &str, pure: &[(String, usize)], rvars: &[ReductionVariable]) -> BTreeMap<String, Expr> {
    pure.iter()
        .map(|(n, _)| n.clone())
        .chain(rvars.iter().map(|rv| rv.var.clone()))
        .map(|n| {
            let q = ivar(format!("{}{}", prefix, n));
            (n, q)
        })
        .collect()
}

pub(crate) fn stage_prefix(func: &Function, stage: usize) -> String {
    format!("{}.s{}.", func.name, stage)
}

/// Innermost-to-outermost loop nest of one (possibly specialized)
/// definition, before loop bounds are defined.
pub(crate) struct StageNest {
    /// Outermost first.
    pub containers: Vec<Container>,
    pub body: Stmt,
    /// `.loop_min/.loop_max/.loop_extent` lets for the split dims, outermost
    /// first.
    pub split_bounds: Vec<(String, Expr)>,
}

pub(crate) fn stage_nest(func: &Function, stage: usize, def: &Definition) -> Result<StageNest> {
    let prefix = stage_prefix(func, stage);
    let pure = pure_vars(func, def);
    let map = qualify_map(&prefix, &pure, &def.schedule.rvars);

    let args: Vec<Expr> = def.args.iter().map(|a| substitute_map(&map, a)).collect();
    let values: Vec<Expr> = def.values.iter().map(|v| substitute_map(&map, v)).collect();
    let mut body = Stmt::provide(func.name.clone(), values, args);
    let mut predicates: Vec<Expr> = def
        .split_predicate()
        .iter()
        .map(|p| substitute_map(&map, p))
        .collect();

    let mut alignment = ExtentAlignment::new();
    for b in &func.schedule.bounds {
        alignment.insert(b.var.clone(), b.extent.clone());
    }
    for rv in &def.schedule.rvars {
        alignment.insert(rv.var.clone(), rv.extent.clone());
    }

    let mut lets: Vec<Container> = Vec::new();
    for split in &def.schedule.splits {
        for r in apply_split(split, &prefix, &mut alignment) {
            match r.kind {
                SplitResultKind::Substitution => {
                    body = substitute_stmt(&r.name, &r.value, &body);
                    for p in &mut predicates {
                        *p = substitute(&r.name, &r.value, p);
                    }
                }
                SplitResultKind::LetStmt => lets.push(Container::Let {
                    name: r.name,
                    value: r.value,
                }),
                SplitResultKind::Predicate => predicates.push(r.value),
            }
        }
    }

    if def.schedule.atomic {
        body = Stmt::atomic(func.name.clone(), None, body);
    }

    let mut containers: Vec<Container> = def
        .schedule
        .dims
        .iter()
        .rev()
        .map(|d| Container::For {
            name: format!("{}{}", prefix, d.var),
            for_type: d.for_type,
            device_api: d.device_api,
        })
        .collect();
    lets.extend(predicates.into_iter().map(|condition| Container::If { condition }));
    containers.extend(order_by_dependency(lets));
    hoist(&mut containers);

    let mut split_bounds = Vec::new();
    for split in &def.schedule.splits {
        split_bounds.extend(loop_bounds_after_split(split, &prefix));
    }
    Ok(StageNest {
        containers,
        body,
        split_bounds,
    })
}

/// The nest of a definition and its specializations, with split loop
/// bounds defined.
fn specialized_nest(func: &Function, stage: usize, def: &Definition) -> Result<Stmt> {
    let nest = stage_nest(func, stage, def)?;
    let mut stmt = wrap_lets(&nest.split_bounds, wrap_all(&nest.containers, nest.body));
    for s in def.specializations.iter().rev() {
        stmt = match &s.failure_message {
            Some(msg) => Stmt::evaluate(Expr::call(
                Type::i32(),
                intrinsics::ERROR_SPECIALIZE_FAIL,
                vec![Expr::string(msg.clone())],
                CallType::Extern,
                0,
            )),
            None => Stmt::if_then_else(
                s.condition.clone(),
                specialized_nest(func, stage, &s.definition)?,
                Some(stmt),
            ),
        };
    }
    Ok(stmt)
}

/// `.loop_min/.loop_max/.loop_extent` of the stage's pure variables, its
/// reduction variables and the outermost sentinel, outermost first.
pub(crate) fn stage_bound_lets(func: &Function, stage: usize, def: &Definition) -> Vec<(String, Expr)> {
    let prefix = stage_prefix(func, stage);
    let mut lets = Vec::new();
    for (v, _) in pure_vars(func, def) {
        let p = format!("{}{}", prefix, v);
        let min = ivar(format!("{}.min", p));
        let max = ivar(format!("{}.max", p));
        lets.push((format!("{}.loop_min", p), min.clone()));
        lets.push((format!("{}.loop_max", p), max.clone()));
        lets.push((format!("{}.loop_extent", p), (max + 1) - min));
    }
    for rv in &def.schedule.rvars {
        let p = format!("{}{}", prefix, rv.var);
        let min = ivar(format!("{}.min", p));
        let max = ivar(format!("{}.max", p));
        lets.push((format!("{}.loop_min", p), min.clone()));
        lets.push((format!("{}.loop_max", p), max.clone()));
        lets.push((format!("{}.loop_extent", p), (max + 1) - min));
    }
    let o = format!("{}{}", prefix, OUTERMOST);
    lets.push((format!("{}.loop_min", o), Expr::int(0)));
    lets.push((format!("{}.loop_max", o), Expr::int(0)));
    lets.push((format!("{}.loop_extent", o), Expr::int(1)));
    lets
}

/// The complete loop nest of one stage.
pub(crate) fn build_stage(func: &Function, stage: usize) -> Result<Stmt> {
    let def = func
        .definition(stage)
        .ok_or_else(|| Error::internal(format!("{} has no stage {}", func.name, stage)))?;
    let nest = specialized_nest(func, stage, def)?;
    Ok(wrap_lets(&stage_bound_lets(func, stage, def), nest))
}

/// The call that produces an extern function over its required region.
fn extern_produce(func: &Function) -> Result<Stmt> {
    let ext = func
        .extern_def
        .as_ref()
        .ok_or_else(|| Error::internal(format!("{} is not extern", func.name)))?;
    let prefix = stage_prefix(func, 0);
    let mut args = ext.args.clone();
    args.push(Expr::string(func.name.clone()));
    for a in &func.args {
        let min = ivar(format!("{}{}.min", prefix, a));
        let max = ivar(format!("{}{}.max", prefix, a));
        args.push(min.clone());
        args.push((max + 1) - min);
    }
    Ok(Stmt::evaluate(Expr::call(
        Type::i32(),
        ext.routine.clone(),
        args,
        CallType::Extern,
        0,
    )))
}

/// Every stage of `func`, in order.
pub(crate) fn build_produce(func: &Function) -> Result<Stmt> {
    if func.is_extern() {
        return extern_produce(func);
    }
    let stages = (0..func.stage_count())
        .map(|k| build_stage(func, k))
        .collect::<Result<Vec<_>>>()?;
    Ok(Stmt::block_of(stages))
}

/// Replace every call to the inlined `func` in `s` by its value.
pub(crate) fn inline_function(s: &Stmt, func: &Function) -> Result<Stmt> {
    let def = func
        .init
        .as_ref()
        .ok_or_else(|| Error::internal(format!("inlining undefined function {}", func.name)))?;
    let mut m = Inliner { func, def };
    Ok(crate::ir::IrMutator::mutate_stmt(&mut m, s))
}

struct Inliner<'a> {
    func: &'a Function,
    def: &'a Definition,
}

impl crate::ir::IrMutator for Inliner<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        let e = crate::ir::mutate_expr_children(self, e);
        match e.node() {
            crate::ir::ExprNode::Call {
                name,
                args,
                call_type: CallType::Halide,
                value_index,
                ..
            } if *name == self.func.name => {
                let map: BTreeMap<String, Expr> = self
                    .func
                    .args
                    .iter()
                    .cloned()
                    .zip(args.iter().cloned())
                    .collect();
                match self.def.values.get(*value_index) {
                    Some(v) => substitute_map(&map, v),
                    None => e.clone(),
                }
            }
            _ => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, RDom, TailStrategy, Var};

    fn simple() -> (Pipeline, crate::id::FuncId) {
        let mut p = Pipeline::new();
        let (x, y) = (Var::new("x"), Var::new("y"));
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone(), y.clone()], vec![x.expr() + y.expr()]).unwrap();
        (p, f)
    }

    #[test]
    fn loops_follow_dims_outermost_first() {
        let (p, f) = simple();
        let nest = stage_nest(p.function(f), 0, p.function(f).init.as_ref().unwrap()).unwrap();
        let names: Vec<String> = nest
            .containers
            .iter()
            .filter_map(|c| match c {
                Container::For { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["f.s0.__outermost", "f.s0.y", "f.s0.x"]);
        assert_eq!(
            nest.body.to_string().trim(),
            "f(f.s0.x, f.s0.y) = (f.s0.x + f.s0.y)"
        );
    }

    #[test]
    fn split_lets_float_out_to_their_loop() {
        let (mut p, f) = simple();
        p.stage(f, 0)
            .unwrap()
            .split(&Var::new("x"), "xo", "xi", 8, TailStrategy::GuardWithIf)
            .unwrap();
        let func = p.function(f);
        let nest = stage_nest(func, 0, func.init.as_ref().unwrap()).unwrap();
        let pos = |want: &str| {
            nest.containers
                .iter()
                .position(|c| c.defines() == Some(want))
                .unwrap()
        };
        // The base only needs the outer loop; the rebased index needs both.
        assert!(pos("f.s0.x.xi.base") > pos("f.s0.x.xo"));
        assert!(pos("f.s0.x.xi.base") < pos("f.s0.x.xi"));
        assert!(pos("f.s0.x.rebased") > pos("f.s0.x.xi"));
        assert!(pos("f.s0.x") > pos("f.s0.x.xi.base"));
        assert!(matches!(nest.containers.last(), Some(Container::If { .. }) | Some(Container::Let { .. })));
        assert_eq!(nest.split_bounds.len(), 6);
    }

    #[test]
    fn nested_split_lets_follow_their_definitions() {
        let (mut p, f) = simple();
        p.stage(f, 0)
            .unwrap()
            .split(&Var::new("x"), "xo", "xi", 8, TailStrategy::GuardWithIf)
            .unwrap()
            .split(&Var::new("xo"), "xoo", "xoi", 2, TailStrategy::GuardWithIf)
            .unwrap();
        let func = p.function(f);
        let nest = stage_nest(func, 0, func.init.as_ref().unwrap()).unwrap();
        for (i, c) in nest.containers.iter().enumerate() {
            for used in c.uses() {
                if let Some(k) = nest.containers.iter().position(|d| d.defines() == Some(used.as_str())) {
                    assert!(k < i, "{:?} is used before its definition", used);
                }
            }
        }
        let wrapped = wrap_all(&nest.containers, nest.body).to_string();
        let base = wrapped.find("let f.s0.x.xi.base").unwrap();
        let outer = wrapped.find("let f.s0.x.xo =").unwrap();
        assert!(outer < base, "{}", wrapped);
    }

    #[test]
    fn atomic_updates_wrap_their_provide() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let h = p.func("h").unwrap();
        p.define(h, &[x.clone()], vec![Expr::int(0)]).unwrap();
        let r = RDom::new("r", [(0, 8)]);
        let bin = r.x().expr() % 4;
        let value = p.call(h, vec![bin.clone()]).unwrap() + 1;
        p.update_with_domain(h, vec![bin], vec![value], &r).unwrap();
        p.stage(h, 1).unwrap().atomic(false).unwrap();
        let func = p.function(h);
        let nest = stage_nest(func, 1, func.definition(1).unwrap()).unwrap();
        assert!(matches!(nest.body.node(), crate::ir::StmtNode::Atomic { producer_name, mutex_name: None, .. } if producer_name == "h"));
        let init = stage_nest(func, 0, func.init.as_ref().unwrap()).unwrap();
        assert!(matches!(init.body.node(), crate::ir::StmtNode::Provide { .. }));
    }

    #[test]
    fn bound_lets_cover_pure_vars_and_outermost() {
        let (p, f) = simple();
        let func = p.function(f);
        let lets = stage_bound_lets(func, 0, func.init.as_ref().unwrap());
        let names: Vec<&str> = lets.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"f.s0.x.loop_extent"));
        assert!(names.contains(&"f.s0.y.loop_min"));
        assert!(names.contains(&"f.s0.__outermost.loop_extent"));
    }

    #[test]
    fn inlining_substitutes_arguments() {
        let (p, f) = simple();
        let call = p.call(f, vec![Expr::var("a"), Expr::int(2)]).unwrap();
        let s = Stmt::evaluate(call);
        let out = inline_function(&s, p.function(f)).unwrap();
        assert_eq!(out, Stmt::evaluate(Expr::var("a") + Expr::int(2)));
    }
}
