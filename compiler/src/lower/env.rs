// env.rs - The lowering environment and the order functions are realized in
//
// `WrapCalls` redirects calls to wrapper functions and rebuilds the
// environment from the outputs, so later passes only see functions that
// are actually reachable. `RealizationOrder` sorts them producers-first and
// collects the stages linked by compute_with into fused groups.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::diag::codes;
use crate::error::{Error, Result};
use crate::func::{Function, LoopLevel};
use crate::ir::{halide_calls_in_expr, rename_calls, Stmt};

use super::pass::{FusedGroup, LowerContext, LoweringPass};

/// Names of the functions `func` calls, itself excluded.
pub(crate) fn callees(func: &Function) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for def in func.definitions() {
        def.for_each_expr(&mut |e| out.extend(halide_calls_in_expr(e)));
    }
    if let Some(ext) = &func.extern_def {
        for a in &ext.args {
            out.extend(halide_calls_in_expr(a));
        }
    }
    out.remove(&func.name);
    out
}

// ── wrap_calls ─────────────────────────────────────────────────────────────

pub struct WrapCalls;

impl WrapCalls {
    /// The wrapper of `producer` that `consumer` should call instead, if any.
    fn wrapper_for<'a>(producer: &'a Function, consumer: &str) -> Option<&'a String> {
        if let Some(w) = producer.wrappers.get(consumer) {
            return (w != consumer).then_some(w);
        }
        let global = producer.wrappers.get("")?;
        // A wrapper of f keeps calling f itself.
        let is_own_wrapper = producer.wrappers.values().any(|w| w == consumer);
        (!is_own_wrapper).then_some(global)
    }
}

impl LoweringPass for WrapCalls {
    fn name(&self) -> &str {
        "wrap_calls"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        for out in &ctx.outputs {
            let f = ctx.function(out)?;
            if !f.is_defined() {
                return Err(LowerContext::user_error(
                    codes::E0201_UNDEFINED_FUNC,
                    out,
                    format!("output `{}` is undefined", out),
                ));
            }
        }

        let names: Vec<String> = ctx.env.keys().cloned().collect();
        let mut redirects: Vec<(String, String, String)> = Vec::new();
        for consumer in &names {
            let func = ctx.function(consumer)?;
            for callee in callees(func) {
                let Some(producer) = ctx.env.get(&callee) else {
                    continue;
                };
                if let Some(w) = WrapCalls::wrapper_for(producer, consumer) {
                    redirects.push((consumer.clone(), callee.clone(), w.clone()));
                }
            }
        }
        for (consumer, from, to) in redirects {
            debug!(consumer = %consumer, from = %from, to = %to, "redirecting calls to wrapper");
            if let Some(func) = ctx.env.get_mut(&consumer) {
                for def in func.definitions_mut() {
                    def.map_exprs(&mut |e| rename_calls(&from, &to, e));
                }
            }
        }

        // Rebuild from the outputs; unreachable functions drop out.
        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut pending: Vec<String> = ctx.outputs.clone();
        while let Some(name) = pending.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            let func = ctx.function(&name)?;
            for c in callees(func) {
                if ctx.env.contains_key(&c) {
                    pending.push(c);
                } else if !ctx.images.contains_key(&c) && !ctx.buffers.contains_key(&c) {
                    return Err(LowerContext::user_error(
                        codes::E0201_UNDEFINED_FUNC,
                        &name,
                        format!("`{}` calls `{}`, which is not defined", name, c),
                    ));
                }
            }
        }
        ctx.env.retain(|name, _| reachable.contains(name));
        for name in &reachable {
            let func = ctx.function(name)?;
            if !func.is_defined() {
                return Err(LowerContext::user_error(
                    codes::E0201_UNDEFINED_FUNC,
                    name,
                    format!("function `{}` is called but never defined", name),
                ));
            }
        }
        // Outputs are always computed at root.
        for out in ctx.outputs.clone() {
            if let Some(f) = ctx.env.get_mut(&out) {
                if f.schedule.compute_level.is_inlined() {
                    f.schedule.compute_level = LoopLevel::Root;
                }
            }
        }
        Ok(stmt)
    }
}

// ── realization_order ──────────────────────────────────────────────────────

pub struct RealizationOrder;

fn visit(
    name: &str,
    env: &BTreeMap<String, Function>,
    done: &mut BTreeSet<String>,
    active: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(pos) = active.iter().position(|a| a == name) {
        let mut cycle = active[pos..].to_vec();
        cycle.push(name.to_string());
        return Err(LowerContext::user_error(
            codes::E0308_CYCLE,
            name,
            format!("functions call each other in a cycle: {}", cycle.join(" -> ")),
        ));
    }
    let Some(func) = env.get(name) else {
        return Ok(());
    };
    active.push(name.to_string());
    for c in callees(func) {
        if env.contains_key(&c) {
            visit(&c, env, done, active, order)?;
        }
    }
    active.pop();
    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

/// Producers first, in a deterministic depth-first order from the outputs.
pub fn realization_order(outputs: &[String], env: &BTreeMap<String, Function>) -> Result<Vec<String>> {
    let mut done = BTreeSet::new();
    let mut order = Vec::new();
    for out in outputs {
        visit(out, env, &mut done, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}

/// Follow compute_with links to the stage everything is fused into.
fn fused_root(env: &BTreeMap<String, Function>, func: &str, stage: usize) -> Result<(String, usize)> {
    let mut cur = (func.to_string(), stage);
    let mut seen: BTreeSet<(String, usize)> = BTreeSet::new();
    loop {
        if !seen.insert(cur.clone()) {
            return Err(LowerContext::user_error(
                codes::E0305_COMPUTE_WITH_GROUP,
                func,
                format!("compute_with links of `{}` form a cycle", func),
            ));
        }
        let def = env
            .get(&cur.0)
            .and_then(|f| f.definition(cur.1))
            .ok_or_else(|| Error::internal(format!("missing stage {}.s{}", cur.0, cur.1)))?;
        match &def.schedule.fuse_level.level {
            LoopLevel::At {
                func: parent,
                stage: Some(s),
                ..
            } => cur = (parent.clone(), *s),
            LoopLevel::At { func: parent, stage: None, .. } => {
                let last = env
                    .get(parent)
                    .map(|f| f.stage_count().saturating_sub(1))
                    .unwrap_or(0);
                cur = (parent.clone(), last);
            }
            _ => return Ok(cur),
        }
    }
}

pub fn fused_groups(order: &[String], env: &BTreeMap<String, Function>) -> Result<Vec<FusedGroup>> {
    let mut by_root: BTreeMap<(String, usize), Vec<(String, usize)>> = BTreeMap::new();
    for name in order {
        let Some(func) = env.get(name) else { continue };
        for (k, def) in func.definitions().enumerate() {
            if def.schedule.fuse_level.is_set() {
                if !env.contains_key(def.schedule.fuse_level.level.func().unwrap_or_default()) {
                    return Err(LowerContext::user_error(
                        codes::E0305_COMPUTE_WITH_GROUP,
                        name,
                        format!(
                            "{} is computed with {}, which is not used by this pipeline",
                            func.stage_name(k),
                            def.schedule.fuse_level.level
                        ),
                    ));
                }
                let root = fused_root(env, name, k)?;
                by_root.entry(root).or_default().push((name.clone(), k));
            }
        }
    }
    let position = |f: &str| order.iter().position(|o| o == f).unwrap_or(usize::MAX);
    let mut groups: Vec<FusedGroup> = by_root
        .into_iter()
        .map(|(root, mut members)| {
            members.push(root.clone());
            members.sort_by_key(|(f, s)| (position(f), *s));
            members.dedup();
            FusedGroup { root, members }
        })
        .collect();
    groups.sort_by_key(|g| g.members.first().map(|(f, _)| position(f)));
    Ok(groups)
}

/// Move every group's functions next to its last member, then check that
/// producers still come first.
fn order_with_groups(
    order: Vec<String>,
    groups: &[FusedGroup],
    env: &BTreeMap<String, Function>,
) -> Result<Vec<String>> {
    let mut out = order;
    for g in groups {
        let funcs = g.functions();
        let Some(last) = out.iter().rposition(|f| funcs.contains(f)) else {
            continue;
        };
        let anchor = out[last].clone();
        let moved: Vec<String> = out
            .iter()
            .filter(|f| funcs.contains(f) && **f != anchor)
            .cloned()
            .collect();
        out.retain(|f| !moved.contains(f));
        let at = out.iter().position(|f| *f == anchor).unwrap_or(out.len());
        for (i, f) in moved.into_iter().enumerate() {
            out.insert(at + i, f);
        }
    }
    for (i, name) in out.iter().enumerate() {
        let Some(func) = env.get(name) else { continue };
        for c in callees(func) {
            let Some(j) = out.iter().position(|o| *o == c) else {
                continue;
            };
            let same_group = groups
                .iter()
                .any(|g| g.functions().contains(name) && g.functions().contains(&c));
            if j > i || same_group {
                return Err(LowerContext::user_error(
                    codes::E0305_COMPUTE_WITH_GROUP,
                    name,
                    format!(
                        "`{}` calls `{}`, so they can't be computed in the same fused loop nest",
                        name, c
                    ),
                ));
            }
        }
    }
    Ok(out)
}

impl LoweringPass for RealizationOrder {
    fn name(&self) -> &str {
        "realization_order"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let order = realization_order(&ctx.outputs, &ctx.env)?;
        let groups = fused_groups(&order, &ctx.env)?;
        ctx.order = order_with_groups(order, &groups, &ctx.env)?;
        ctx.groups = groups;
        debug!(order = ?ctx.order, groups = ctx.groups.len(), "realization order");
        Ok(stmt)
    }
}
