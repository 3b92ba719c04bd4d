// schedule_functions.rs - Placing every function's loop nest
//
// Walks the realization order from the outputs back to the inputs. Inlined
// functions are substituted into their call sites; everything else gets a
// `produce f { .. }` / `consume f { .. }` pair injected at its compute
// level and a `realize f(..)` at its store level. Stages fused with
// `compute_with` are emitted once, as a single nest sharing the root
// stage's outer loops.

use std::collections::BTreeSet;

use tracing::debug;

use crate::diag::codes;
use crate::error::{Error, Result};
use crate::func::{Definition, Function, LoopAlignStrategy, LoopLevel};
use crate::ir::{
    mutate_stmt_children, simplify, visit_expr_children, visit_stmt_children, CallType, DeviceApi,
    Expr, ExprNode, ForType, IrMutator, IrVisitor, Range, Stmt, StmtNode, Type,
};

use super::nest::{
    build_produce, build_stage, hoist, inline_function, stage_bound_lets, stage_nest,
    stage_prefix, wrap_all, Container, StageNest,
};
use super::pass::{FusedGroup, LowerContext, LoweringPass};

fn ivar(name: impl Into<String>) -> Expr {
    Expr::var_of(Type::i32(), name)
}

pub(crate) fn is_inlined(ctx: &LowerContext, func: &Function) -> bool {
    func.schedule.compute_level.is_inlined() && !ctx.is_output(&func.name) && !func.is_extern()
}

// ── Injection ──────────────────────────────────────────────────────────────

/// `produce f { produce g { p } }` followed by `consume f { consume g { c } }`.
fn pipeline_stmt(funcs: &[String], produce: Stmt, consume: Stmt) -> Stmt {
    let p = funcs
        .iter()
        .rev()
        .fold(produce, |acc, f| Stmt::producer(f.clone(), acc));
    if consume.is_no_op() {
        return p;
    }
    let c = funcs
        .iter()
        .rev()
        .fold(consume, |acc, f| Stmt::consumer(f.clone(), acc));
    Stmt::block(p, c)
}

/// Apply `f` below the leading lets of `body`, so the injected code sees
/// the loop's derived variables.
fn under_lets(body: &Stmt, f: impl FnOnce(Stmt) -> Stmt) -> Stmt {
    match body.node() {
        StmtNode::LetStmt { name, value, body } => {
            Stmt::let_stmt(name.clone(), value.clone(), under_lets(body, f))
        }
        _ => f(body.clone()),
    }
}

fn calls_any(s: &Stmt, funcs: &[String]) -> bool {
    let called = crate::ir::halide_calls_in_stmt(s);
    funcs.iter().any(|f| called.contains(f))
}

struct InjectAt<'a> {
    level: &'a LoopLevel,
    funcs: &'a [String],
    produce: Option<Stmt>,
}

impl IrMutator for InjectAt<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.produce.is_none() {
            return s.clone();
        }
        if let StmtNode::For {
            name,
            min,
            extent,
            for_type,
            device_api,
            body,
        } = s.node()
        {
            if self.level.matches_loop(name) && calls_any(body, self.funcs) {
                if let Some(produce) = self.produce.take() {
                    let funcs = self.funcs;
                    let body = under_lets(body, |inner| pipeline_stmt(funcs, produce, inner));
                    return Stmt::for_loop(
                        name.clone(),
                        min.clone(),
                        extent.clone(),
                        *for_type,
                        *device_api,
                        body,
                    );
                }
            }
        }
        mutate_stmt_children(self, s)
    }
}

fn inject(s: Stmt, funcs: &[String], level: &LoopLevel, produce: Stmt) -> Result<Stmt> {
    if !matches!(level, LoopLevel::At { .. }) {
        return Ok(pipeline_stmt(funcs, produce, s));
    }
    let mut m = InjectAt {
        level,
        funcs,
        produce: Some(produce),
    };
    let out = m.mutate_stmt(&s);
    if m.produce.is_some() {
        let name = funcs.first().map(String::as_str).unwrap_or_default();
        return Err(LowerContext::user_error(
            codes::E0301_BAD_LOOP_LEVEL,
            name,
            format!(
                "`{}` is computed at {}, but no loop over {} uses it",
                name, level, level
            ),
        ));
    }
    Ok(out)
}

/// Every call to `func` must sit inside its producer or consumer.
fn check_calls_are_scoped(s: &Stmt, func: &str) -> Result<()> {
    struct Scoped<'a> {
        func: &'a str,
        depth: usize,
        stray: bool,
    }
    impl IrVisitor for Scoped<'_> {
        fn visit_stmt(&mut self, s: &Stmt) {
            match s.node() {
                StmtNode::ProducerConsumer { name, .. } if name == self.func => {
                    self.depth += 1;
                    visit_stmt_children(self, s);
                    self.depth -= 1;
                }
                _ => visit_stmt_children(self, s),
            }
        }

        fn visit_expr(&mut self, e: &Expr) {
            if let ExprNode::Call {
                name,
                call_type: CallType::Halide,
                ..
            } = e.node()
            {
                if name == self.func && self.depth == 0 {
                    self.stray = true;
                }
            }
            visit_expr_children(self, e);
        }
    }
    let mut v = Scoped {
        func,
        depth: 0,
        stray: false,
    };
    v.visit_stmt(s);
    if v.stray {
        return Err(LowerContext::user_error(
            codes::E0301_BAD_LOOP_LEVEL,
            func,
            format!(
                "`{}` is used outside the loop it is computed at; compute it further out",
                func
            ),
        ));
    }
    Ok(())
}

// ── Realizations ───────────────────────────────────────────────────────────

fn has_producer(s: &Stmt, func: &str) -> bool {
    struct Find<'a> {
        func: &'a str,
        found: bool,
    }
    impl IrVisitor for Find<'_> {
        fn visit_expr(&mut self, _e: &Expr) {}

        fn visit_stmt(&mut self, s: &Stmt) {
            if self.found {
                return;
            }
            match s.node() {
                StmtNode::ProducerConsumer {
                    name,
                    is_producer: true,
                    ..
                } if name == self.func => self.found = true,
                _ => visit_stmt_children(self, s),
            }
        }
    }
    let mut f = Find { func, found: false };
    f.visit_stmt(s);
    f.found
}

fn realize(func: &Function, body: Stmt) -> Stmt {
    let bounds = func
        .args
        .iter()
        .map(|a| {
            Range::new(
                ivar(format!("{}.{}.min_realized", func.name, a)),
                ivar(format!("{}.{}.extent_realized", func.name, a)),
            )
        })
        .collect();
    Stmt::realize(
        func.name.clone(),
        func.output_types.clone(),
        func.schedule.memory_type,
        bounds,
        body,
    )
}

struct InjectRealize<'a> {
    func: &'a Function,
    level: &'a LoopLevel,
    done: bool,
}

impl IrMutator for InjectRealize<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.done {
            return s.clone();
        }
        if let StmtNode::For {
            name,
            min,
            extent,
            for_type,
            device_api,
            body,
        } = s.node()
        {
            if self.level.matches_loop(name) && has_producer(body, &self.func.name) {
                self.done = true;
                let func = self.func;
                let body = under_lets(body, |inner| realize(func, inner));
                return Stmt::for_loop(
                    name.clone(),
                    min.clone(),
                    extent.clone(),
                    *for_type,
                    *device_api,
                    body,
                );
            }
        }
        mutate_stmt_children(self, s)
    }
}

fn inject_realization(s: Stmt, func: &Function) -> Result<Stmt> {
    let level = func.schedule.effective_store_level();
    if !matches!(level, LoopLevel::At { .. }) {
        return Ok(realize(func, s));
    }
    let mut m = InjectRealize {
        func,
        level,
        done: false,
    };
    let out = m.mutate_stmt(&s);
    if !m.done {
        return Err(LowerContext::user_error(
            codes::E0301_BAD_LOOP_LEVEL,
            &func.name,
            format!(
                "`{}` is stored at {}, which is not outside where it is computed ({})",
                func.name, level, func.schedule.compute_level
            ),
        ));
    }
    Ok(out)
}

// ── compute_with ───────────────────────────────────────────────────────────

struct Member<'a> {
    func: &'a Function,
    stage: usize,
    def: &'a Definition,
    is_root: bool,
    /// How many of the outermost loops are fused.
    shared: usize,
    /// Dim names, outermost first.
    dims: Vec<String>,
    nest: StageNest,
}

impl Member<'_> {
    fn loop_name(&self, j: usize) -> String {
        format!("{}{}", stage_prefix(self.func, self.stage), self.dims[j])
    }

    /// This stage's loop variable at level `j` minus the fused one.
    fn offset(&self, j: usize, root_loop: &str) -> Expr {
        if self.is_root {
            return Expr::int(0);
        }
        let mine = self.loop_name(j);
        let field = |n: &str, f: &str| ivar(format!("{}.{}", n, f));
        match self.def.schedule.fuse_level.align_for(&self.dims[j]) {
            LoopAlignStrategy::AlignStart => {
                simplify(&(field(&mine, "loop_min") - field(root_loop, "loop_min")))
            }
            LoopAlignStrategy::AlignEnd => {
                simplify(&(field(&mine, "loop_max") - field(root_loop, "loop_max")))
            }
            LoopAlignStrategy::NoAlign | LoopAlignStrategy::Auto => Expr::int(0),
        }
    }

    /// The iterations of the fused loop at level `j` this stage runs.
    fn range(&self, j: usize, root_loop: &str) -> (Expr, Expr) {
        let mine = self.loop_name(j);
        let off = self.offset(j, root_loop);
        (
            simplify(&(ivar(format!("{}.loop_min", mine)) - off.clone())),
            simplify(&(ivar(format!("{}.loop_max", mine)) - off)),
        )
    }
}

/// Fused depth of a stage: the loops of its parent from the fuse var out.
fn shared_depth(ctx: &LowerContext, func: &Function, def: &Definition) -> Result<usize> {
    let LoopLevel::At {
        func: parent,
        stage,
        var,
    } = &def.schedule.fuse_level.level
    else {
        return Ok(0);
    };
    let p = ctx.function(parent)?;
    let pdef = p
        .definition(stage.unwrap_or_else(|| p.stage_count().saturating_sub(1)))
        .ok_or_else(|| Error::internal(format!("{} has no stage {:?}", parent, stage)))?;
    let idx = pdef.schedule.find_dim(var).ok_or_else(|| {
        LowerContext::user_error(
            codes::E0305_COMPUTE_WITH_GROUP,
            &func.name,
            format!(
                "`{}` is computed with {}, but that loop no longer exists",
                func.name, def.schedule.fuse_level.level
            ),
        )
    })?;
    Ok(pdef.schedule.dims.len() - idx)
}

struct RootLoop {
    name: String,
    for_type: ForType,
    device_api: DeviceApi,
}

fn fused_loop(j: usize, parts: &[&Member], roots: &[RootLoop]) -> Stmt {
    let root = &roots[j];
    let mut lo: Option<Expr> = None;
    let mut hi: Option<Expr> = None;
    for m in parts {
        let (l, h) = m.range(j, &root.name);
        lo = Some(match lo {
            Some(x) if x != l => Expr::min(x, l),
            Some(x) => x,
            None => l,
        });
        hi = Some(match hi {
            Some(x) if x != h => Expr::max(x, h),
            Some(x) => x,
            None => h,
        });
    }
    let lo = simplify(&lo.unwrap_or_else(|| Expr::int(0)));
    let hi = simplify(&hi.unwrap_or_else(|| Expr::int(0)));

    let mut body = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        if parts[i].shared > j + 1 {
            let start = i;
            while i < parts.len() && parts[i].shared > j + 1 {
                i += 1;
            }
            body.push(fused_loop(j + 1, &parts[start..i], roots));
        } else {
            body.push(fused_leaf(parts[i], roots));
            i += 1;
        }
    }
    Stmt::for_loop(
        root.name.clone(),
        lo.clone(),
        simplify(&((hi + 1) - lo)),
        root.for_type,
        root.device_api,
        Stmt::block_of(body),
    )
}

/// One stage's unfused loops, entered from inside the fused loops.
fn fused_leaf(m: &Member, roots: &[RootLoop]) -> Stmt {
    let mut loops_seen = 0;
    let mut split = m.nest.containers.len();
    for (i, c) in m.nest.containers.iter().enumerate() {
        if c.is_loop() {
            loops_seen += 1;
            if loops_seen == m.shared {
                split = i + 1;
                break;
            }
        }
    }
    let (outer, inner) = m.nest.containers.split_at(split);
    let mut inner_cs: Vec<Container> = outer.iter().filter(|c| !c.is_loop()).cloned().collect();
    inner_cs.extend(inner.iter().cloned());
    hoist(&mut inner_cs);
    let mut body = wrap_all(&inner_cs, m.nest.body.clone());

    let mut guard: Option<Expr> = None;
    for j in (0..m.shared).rev() {
        let r = ivar(roots[j].name.clone());
        if !m.is_root {
            let off = m.offset(j, &roots[j].name);
            let value = if off.is_zero() { r.clone() } else { r.clone() + off };
            body = Stmt::let_stmt(m.loop_name(j), value, body);
        }
        let (lo, hi) = m.range(j, &roots[j].name);
        let c = Expr::and(Expr::le(lo, r.clone()), Expr::le(r, hi));
        guard = Some(match guard {
            Some(g) => Expr::and(c, g),
            None => c,
        });
    }
    match guard {
        Some(g) => Stmt::if_then_else(Expr::likely(g), body, None),
        None => body,
    }
}

fn build_fused_group(ctx: &LowerContext, group: &FusedGroup) -> Result<Stmt> {
    let (root_name, root_stage) = &group.root;
    let root_fn = ctx.function(root_name)?;
    let root_def = root_fn
        .definition(*root_stage)
        .ok_or_else(|| Error::internal(format!("{} has no stage {}", root_name, root_stage)))?;
    let roots: Vec<RootLoop> = root_def
        .schedule
        .dims
        .iter()
        .rev()
        .map(|d| RootLoop {
            name: format!("{}{}", stage_prefix(root_fn, *root_stage), d.var),
            for_type: d.for_type,
            device_api: d.device_api,
        })
        .collect();

    let mut members: Vec<Member> = Vec::new();
    let mut bound_lets: Vec<(String, Expr)> = Vec::new();
    for (name, k) in &group.members {
        let func = ctx.function(name)?;
        let def = func
            .definition(*k)
            .ok_or_else(|| Error::internal(format!("{} has no stage {}", name, k)))?;
        if !def.specializations.is_empty() {
            return Err(LowerContext::user_error(
                codes::E0305_COMPUTE_WITH_GROUP,
                name,
                format!(
                    "{} is part of a compute_with group, so it can't be specialized",
                    func.stage_name(*k)
                ),
            ));
        }
        let is_root = name == root_name && k == root_stage;
        let nest = stage_nest(func, *k, def)?;
        bound_lets.extend(stage_bound_lets(func, *k, def));
        bound_lets.extend(nest.split_bounds.iter().cloned());
        members.push(Member {
            func,
            stage: *k,
            def,
            is_root,
            shared: if is_root { 0 } else { shared_depth(ctx, func, def)? },
            dims: def.schedule.dims.iter().rev().map(|d| d.var.clone()).collect(),
            nest,
        });
    }
    let depth = members.iter().map(|m| m.shared).max().unwrap_or(1).max(1);
    for m in members.iter_mut().filter(|m| m.is_root) {
        m.shared = depth;
    }
    for m in &members {
        if m.shared > roots.len() || m.shared > m.dims.len() {
            return Err(LowerContext::user_error(
                codes::E0305_COMPUTE_WITH_GROUP,
                &m.func.name,
                format!(
                    "{} shares {} loops with {}, which has only {}",
                    m.func.stage_name(m.stage),
                    m.shared,
                    root_fn.stage_name(*root_stage),
                    roots.len().min(m.dims.len())
                ),
            ));
        }
    }
    let parts: Vec<&Member> = members.iter().collect();
    let fused = bound_lets
        .iter()
        .rev()
        .fold(fused_loop(0, &parts, &roots), |acc, (n, v)| {
            Stmt::let_stmt(n.clone(), v.clone(), acc)
        });

    let mut before = Vec::new();
    let mut after = Vec::new();
    for name in group.functions() {
        let func = ctx.function(&name)?;
        let first = group
            .members
            .iter()
            .filter(|(f, _)| *f == name)
            .map(|(_, s)| *s)
            .min()
            .unwrap_or(0);
        for k in 0..func.stage_count() {
            if group.contains(&name, k) {
                continue;
            }
            let s = build_stage(func, k)?;
            if k < first {
                before.push(s);
            } else {
                after.push(s);
            }
        }
    }
    Ok(Stmt::block_of(
        before.into_iter().chain(Some(fused)).chain(after),
    ))
}

// ── Pass ───────────────────────────────────────────────────────────────────

pub struct ScheduleFunctions;

impl LoweringPass for ScheduleFunctions {
    fn name(&self) -> &str {
        "schedule_functions"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut s = stmt;
        let mut placed: Vec<String> = Vec::new();
        let mut grouped: BTreeSet<String> = BTreeSet::new();
        let order = ctx.order.clone();
        for name in order.iter().rev() {
            if grouped.contains(name) {
                continue;
            }
            if let Some(group) = ctx.group_of(name) {
                let funcs = group.functions();
                let produce = build_fused_group(ctx, group)?;
                let level = ctx.function(&group.root.0)?.schedule.compute_level.clone();
                s = inject(s, &funcs, &level, produce)?;
                debug!(group = %funcs.join(","), level = %level, "fused group placed");
                placed.extend(funcs.iter().cloned());
                grouped.extend(funcs);
                continue;
            }
            let func = ctx.function(name)?;
            if is_inlined(ctx, func) {
                s = inline_function(&s, func)?;
                continue;
            }
            let produce = build_produce(func)?;
            s = inject(
                s,
                std::slice::from_ref(name),
                &func.schedule.compute_level,
                produce,
            )?;
            debug!(func = %name, level = %func.schedule.compute_level, "function placed");
            placed.push(name.clone());
        }
        for name in &placed {
            check_calls_are_scoped(&s, name)?;
        }
        for name in &placed {
            if ctx.is_output(name) {
                continue;
            }
            s = inject_realization(s, ctx.function(name)?)?;
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, Var};
    use crate::lower::env::{RealizationOrder, WrapCalls};
    use crate::lower::validate::ValidateSchedules;
    use crate::options::LowerOptions;

    fn schedule(p: &Pipeline, out: &str) -> Result<String> {
        let mut ctx = LowerContext::new(LowerOptions::default());
        ctx.env = p.functions().map(|f| (f.name.clone(), f.clone())).collect();
        ctx.outputs = vec![out.to_string()];
        let s = WrapCalls.run(Stmt::no_op(), &mut ctx)?;
        let s = RealizationOrder.run(s, &mut ctx)?;
        let s = ValidateSchedules.run(s, &mut ctx)?;
        Ok(ScheduleFunctions.run(s, &mut ctx)?.to_string())
    }

    fn producer_consumer(scale: i32) -> Pipeline {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() * scale]).unwrap();
        let g = p.func("g").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.define(g, &[x.clone()], vec![fx + 1]).unwrap();
        p
    }

    #[test]
    fn inlined_function_is_substituted() {
        let p = producer_consumer(2);
        let out = schedule(&p, "g").unwrap();
        assert!(!out.contains("produce f"));
        assert!(out.contains("g(g.s0.x) = ((g.s0.x * 2) + 1)"), "{}", out);
    }

    #[test]
    fn root_producer_comes_before_consumer() {
        let mut p = producer_consumer(2);
        let f = p.id_of("f").unwrap();
        p.compute_root(f);
        let out = schedule(&p, "g").unwrap();
        let produce = out.find("produce f").unwrap();
        let consume = out.find("consume f").unwrap();
        assert!(produce < consume);
        assert!(out.find("produce g").unwrap() > consume);
        assert!(out.starts_with("realize f("));
        assert!(!out.contains("realize g"));
    }

    #[test]
    fn compute_at_places_the_producer_inside_the_loop() {
        let mut p = producer_consumer(2);
        let f = p.id_of("f").unwrap();
        p.compute_at(f, LoopLevel::at("g", "x"));
        let out = schedule(&p, "g").unwrap();
        let g_loop = out.find("for (g.s0.x,").unwrap();
        assert!(out.find("produce f").unwrap() > g_loop);
        assert!(out.find("realize f(").unwrap() > g_loop);
    }

    #[test]
    fn use_outside_the_compute_loop_is_rejected() {
        let mut p = producer_consumer(2);
        let (f, g) = (p.id_of("f").unwrap(), p.id_of("g").unwrap());
        let x = Var::new("x");
        let gx = p.call(g, vec![x.expr()]).unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        p.update(g, vec![x.expr()], vec![gx + fx]).unwrap();
        p.compute_at(f, LoopLevel::at_stage("g", 0, "x"));
        let err = schedule(&p, "g").unwrap_err();
        assert_eq!(err.code(), Some("E0301"));
    }

    #[test]
    fn compute_with_shares_the_root_loops() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let g = p.func("g").unwrap();
        p.define(g, &[x.clone()], vec![x.expr() * 2]).unwrap();
        let h = p.func("h").unwrap();
        let fx = p.call(f, vec![x.expr()]).unwrap();
        let gx = p.call(g, vec![x.expr()]).unwrap();
        p.define(h, &[x.clone()], vec![fx + gx]).unwrap();
        p.compute_root(f).compute_root(g);
        p.stage(g, 0)
            .unwrap()
            .compute_with(LoopLevel::at_stage("f", 0, "x"), &[])
            .unwrap();
        let out = schedule(&p, "h").unwrap();
        assert!(out.contains("for (f.s0.x,"), "{}", out);
        assert!(!out.contains("for (g.s0.x,"), "{}", out);
        assert!(out.contains("let g.s0.x = f.s0.x"), "{}", out);
        assert!(out.find("produce f").unwrap() < out.find("produce g").unwrap());
    }
}
