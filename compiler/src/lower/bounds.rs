// bounds.rs - Bounds inference
//
// Every produced function needs its per-stage loop bounds
// (`<f>.s<k>.<v>.min/max`) and every realization its allocated box
// (`<f>.<v>.min_realized/extent_realized`). Both are computed from the code
// around the function: the region the consumer reads, widened stage by
// stage through the region each update touches, and for realizations the
// hull of every site that reads or writes the function.

use crate::error::Result;
use crate::func::Function;
use crate::ir::{
    bounds_of_expr_in_scope, mutate_stmt_children, simplify, visit_expr_children,
    visit_stmt_children, CallType, CmpOp, Expr, ExprNode, Interval, IrMutator, IrVisitor, Scope,
    Stmt, StmtNode, Type,
};

use super::nest::pure_vars;
use super::pass::{LowerContext, LoweringPass};

fn ivar(name: impl Into<String>) -> Expr {
    Expr::var_of(Type::i32(), name)
}

pub type Region = Vec<Interval>;

fn union_region(a: Option<Region>, b: Region) -> Region {
    match a {
        None => b,
        Some(a) => a.iter().zip(&b).map(|(x, y)| x.union(y).simplified()).collect(),
    }
}

// ── Footprints ─────────────────────────────────────────────────────────────

/// Walks a statement with loop and let variables bound to intervals and
/// takes the hull of every access to one function.
struct Footprint<'a> {
    func: &'a str,
    call_type: CallType,
    include_provides: bool,
    scope: Scope<Interval>,
    region: Option<Region>,
}

impl Footprint<'_> {
    fn add_site(&mut self, args: &[Expr]) {
        let site: Region = args
            .iter()
            .map(|a| bounds_of_expr_in_scope(a, &self.scope))
            .collect();
        self.region = Some(union_region(self.region.take(), site));
    }

    /// Tighten the interval of a bound variable from a branch condition.
    fn narrowed(&self, cond: &Expr) -> Vec<(String, Interval)> {
        let cond = cond.as_likely().unwrap_or(cond);
        match cond.node() {
            ExprNode::And { a, b } => {
                let mut out = self.narrowed(a);
                out.extend(self.narrowed(b));
                out
            }
            ExprNode::Cmp { op, a, b } => {
                let (var, op, other) = match (a.as_variable(), b.as_variable()) {
                    (Some(v), _) if self.scope.contains(v) => (v, *op, b),
                    (_, Some(v)) if self.scope.contains(v) => {
                        let flipped = match op {
                            CmpOp::Lt => CmpOp::Gt,
                            CmpOp::Le => CmpOp::Ge,
                            CmpOp::Gt => CmpOp::Lt,
                            CmpOp::Ge => CmpOp::Le,
                            other => *other,
                        };
                        (v, flipped, a)
                    }
                    _ => return Vec::new(),
                };
                let Some(current) = self.scope.get(var).cloned() else {
                    return Vec::new();
                };
                let o = bounds_of_expr_in_scope(other, &self.scope);
                let tighter_max = |limit: Option<Expr>| Interval {
                    min: current.min.clone(),
                    max: match (current.max.clone(), limit) {
                        (Some(m), Some(l)) => Some(Expr::min(m, l)),
                        (m, l) => l.or(m),
                    },
                };
                let tighter_min = |limit: Option<Expr>| Interval {
                    min: match (current.min.clone(), limit) {
                        (Some(m), Some(l)) => Some(Expr::max(m, l)),
                        (m, l) => l.or(m),
                    },
                    max: current.max.clone(),
                };
                let i = match op {
                    CmpOp::Lt => tighter_max(o.max.map(|m| m - 1)),
                    CmpOp::Le => tighter_max(o.max),
                    CmpOp::Gt => tighter_min(o.min.map(|m| m + 1)),
                    CmpOp::Ge => tighter_min(o.min),
                    CmpOp::Eq | CmpOp::Ne => return Vec::new(),
                };
                vec![(var.to_string(), i.simplified())]
            }
            _ => Vec::new(),
        }
    }
}

impl IrVisitor for Footprint<'_> {
    fn visit_stmt(&mut self, s: &Stmt) {
        match s.node() {
            StmtNode::For {
                name,
                min,
                extent,
                body,
                ..
            } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                let lo = bounds_of_expr_in_scope(min, &self.scope).min;
                let hi = bounds_of_expr_in_scope(&(min.clone() + extent.clone() - 1), &self.scope).max;
                self.scope.push(name.clone(), Interval { min: lo, max: hi });
                self.visit_stmt(body);
                self.scope.pop(name);
            }
            StmtNode::LetStmt { name, value, body } => {
                self.visit_expr(value);
                let i = bounds_of_expr_in_scope(value, &self.scope);
                self.scope.push(name.clone(), i);
                self.visit_stmt(body);
                self.scope.pop(name);
            }
            StmtNode::IfThenElse {
                condition,
                then_case,
                else_case,
            } => {
                self.visit_expr(condition);
                let narrowed = self.narrowed(condition);
                for (n, i) in &narrowed {
                    self.scope.push(n.clone(), i.clone());
                }
                self.visit_stmt(then_case);
                for (n, _) in narrowed.iter().rev() {
                    self.scope.pop(n);
                }
                if let Some(e) = else_case {
                    self.visit_stmt(e);
                }
            }
            StmtNode::Provide { name, args, .. } if self.include_provides && name == self.func => {
                self.add_site(args);
                visit_stmt_children(self, s);
            }
            _ => visit_stmt_children(self, s),
        }
    }

    fn visit_expr(&mut self, e: &Expr) {
        match e.node() {
            ExprNode::Call {
                name,
                args,
                call_type,
                ..
            } if name == self.func && *call_type == self.call_type => {
                self.add_site(args);
                visit_expr_children(self, e);
            }
            ExprNode::Let { name, value, body } => {
                self.visit_expr(value);
                let i = bounds_of_expr_in_scope(value, &self.scope);
                self.scope.push(name.clone(), i);
                self.visit_expr(body);
                self.scope.pop(name);
            }
            _ => visit_expr_children(self, e),
        }
    }
}

/// Hull of the accesses to `func` in `s`, or `None` if there are none.
pub fn footprint(s: &Stmt, func: &str, include_provides: bool) -> Option<Region> {
    footprint_in(s, func, include_provides, Scope::new())
}

/// Hull of the reads of input image `image` in `s`.
pub fn image_footprint(s: &Stmt, image: &str) -> Option<Region> {
    let mut f = Footprint {
        func: image,
        call_type: CallType::Image,
        include_provides: false,
        scope: Scope::new(),
        region: None,
    };
    f.visit_stmt(s);
    f.region
}

fn footprint_in(s: &Stmt, func: &str, include_provides: bool, scope: Scope<Interval>) -> Option<Region> {
    let mut f = Footprint {
        func,
        call_type: CallType::Halide,
        include_provides,
        scope,
        region: None,
    };
    f.visit_stmt(s);
    f.region
}

// ── Stage regions ──────────────────────────────────────────────────────────

fn check_bounded(func: &Function, region: &Region) -> Result<()> {
    for (i, iv) in region.iter().enumerate() {
        if !iv.is_bounded() {
            let dim = func.args.get(i).map(String::as_str).unwrap_or("?");
            return Err(LowerContext::unbounded(&func.name, dim));
        }
    }
    Ok(())
}

fn apply_bound_directives(func: &Function, region: &mut Region) {
    for b in &func.schedule.bounds {
        if let Some(i) = func.args.iter().position(|a| *a == b.var) {
            region[i] = Interval::new(
                b.min.clone(),
                simplify(&(b.min.clone() + b.extent.clone() - 1)),
            );
        }
    }
}

/// The region each stage of `func` computes, first stage first.
pub fn stage_regions(ctx: &LowerContext, func: &Function, consumer: Option<&Stmt>) -> Result<Vec<Region>> {
    let dims = func.args.len();
    let mut last = consumer.and_then(|c| footprint(c, &func.name, false));
    if ctx.is_output(&func.name) {
        let buffer = if func.is_tuple() {
            format!("{}.0", func.name)
        } else {
            func.name.clone()
        };
        let own: Region = (0..dims)
            .map(|i| {
                let min = ivar(format!("{}.min.{}", buffer, i));
                let extent = ivar(format!("{}.extent.{}", buffer, i));
                Interval::new(min.clone(), simplify(&(min + extent - 1)))
            })
            .collect();
        last = Some(union_region(last, own));
    }
    let mut region = last.unwrap_or_else(|| vec![Interval::everything(); dims]);
    apply_bound_directives(func, &mut region);
    check_bounded(func, &region)?;

    let count = func.stage_count().max(1);
    let mut regions = vec![region; count];
    for k in (1..count).rev() {
        let Some(def) = func.definition(k) else { continue };
        let mut scope = Scope::new();
        for (v, pos) in pure_vars(func, def) {
            scope.push(v, regions[k][pos].clone());
        }
        for rv in &def.schedule.rvars {
            scope.push(
                rv.var.clone(),
                Interval::new(rv.min.clone(), rv.min.clone() + rv.extent.clone() - 1),
            );
        }
        let touched = Stmt::provide(func.name.clone(), def.values.clone(), def.args.clone());
        let site = footprint_in(&touched, &func.name, true, scope);
        let mut prev = match site {
            Some(site) => union_region(Some(regions[k].clone()), site),
            None => regions[k].clone(),
        };
        apply_bound_directives(func, &mut prev);
        check_bounded(func, &prev)?;
        regions[k - 1] = prev;
    }
    Ok(regions)
}

/// `<f>.s<k>.<v>.min/max` for every stage variable.
fn stage_bound_values(ctx: &LowerContext, func: &Function, consumer: Option<&Stmt>) -> Result<Vec<(String, Expr)>> {
    let regions = stage_regions(ctx, func, consumer)?;
    let mut lets = Vec::new();
    for (k, def) in func.definitions().enumerate() {
        let prefix = format!("{}.s{}.", func.name, k);
        for (v, pos) in pure_vars(func, def) {
            let iv = &regions[k][pos];
            if let (Some(min), Some(max)) = (&iv.min, &iv.max) {
                lets.push((format!("{}{}.min", prefix, v), min.clone()));
                lets.push((format!("{}{}.max", prefix, v), max.clone()));
            }
        }
        for rv in &def.schedule.rvars {
            lets.push((format!("{}{}.min", prefix, rv.var), rv.min.clone()));
            lets.push((
                format!("{}{}.max", prefix, rv.var),
                simplify(&(rv.min.clone() + rv.extent.clone() - 1)),
            ));
        }
    }
    if func.is_extern() {
        // Extern stages carry no definition; their box is the first region.
        if let Some(r) = regions.first() {
            for (i, a) in func.args.iter().enumerate() {
                if let (Some(min), Some(max)) = (&r[i].min, &r[i].max) {
                    lets.push((format!("{}.s0.{}.min", func.name, a), min.clone()));
                    lets.push((format!("{}.s0.{}.max", func.name, a), max.clone()));
                }
            }
        }
    }
    Ok(lets)
}

// ── Pass ───────────────────────────────────────────────────────────────────

/// Names of a `produce f { produce g { .. } }` chain and its innermost body.
fn producer_chain(s: &Stmt) -> Option<(Vec<String>, Stmt)> {
    let StmtNode::ProducerConsumer {
        name,
        is_producer: true,
        body,
    } = s.node()
    else {
        return None;
    };
    let mut names = vec![name.clone()];
    let mut cur = body.clone();
    while let StmtNode::ProducerConsumer {
        name,
        is_producer: true,
        body,
    } = cur.node()
    {
        names.push(name.clone());
        let next = body.clone();
        cur = next;
    }
    Some((names, cur))
}

fn consumer_chain(s: &Stmt, names: &[String]) -> Option<Stmt> {
    let mut cur = s.clone();
    for n in names {
        let StmtNode::ProducerConsumer {
            name,
            is_producer: false,
            body,
        } = cur.node()
        else {
            return None;
        };
        if name != n {
            return None;
        }
        let next = body.clone();
        cur = next;
    }
    Some(cur)
}

fn rebuild(names: &[String], produce: Stmt, consume: Option<Stmt>) -> Stmt {
    let p = names
        .iter()
        .rev()
        .fold(produce, |acc, n| Stmt::producer(n.clone(), acc));
    match consume {
        Some(c) => {
            let c = names
                .iter()
                .rev()
                .fold(c, |acc, n| Stmt::consumer(n.clone(), acc));
            Stmt::block(p, c)
        }
        None => p,
    }
}

/// Split the leading lets off `s`. They only bind bounds of code at this
/// level, so they may move above the producer that precedes them.
fn peel_lets(s: &Stmt) -> (Vec<(String, Expr)>, Stmt) {
    let mut lets = Vec::new();
    let mut cur = s.clone();
    while let StmtNode::LetStmt { name, value, body } = cur.node() {
        lets.push((name.clone(), value.clone()));
        let next = body.clone();
        cur = next;
    }
    (lets, cur)
}

fn wrap_lets(lets: Vec<(String, Expr)>, body: Stmt) -> Stmt {
    lets.into_iter()
        .rev()
        .fold(body, |acc, (n, v)| Stmt::let_stmt(n, v, acc))
}

struct InferBounds<'a> {
    ctx: &'a LowerContext,
    err: Option<crate::error::Error>,
}

impl InferBounds<'_> {
    fn pipeline(&mut self, names: Vec<String>, produce: &Stmt, consume: Option<&Stmt>) -> Stmt {
        let produce = self.mutate_stmt(produce);
        let (mut lets, consume) = match consume.map(|c| self.mutate_stmt(c)) {
            Some(c) => {
                let (outer, rest) = peel_lets(&c);
                (outer, Some(rest))
            }
            None => (Vec::new(), None),
        };
        for n in &names {
            let r = self
                .ctx
                .function(n)
                .and_then(|f| stage_bound_values(self.ctx, f, consume.as_ref()));
            match r {
                Ok(l) => lets.extend(l),
                Err(e) => {
                    self.err.get_or_insert(e);
                }
            }
        }
        wrap_lets(lets, rebuild(&names, produce, consume))
    }

    fn realize(&mut self, s: &Stmt) -> Stmt {
        let s = mutate_stmt_children(self, s);
        let StmtNode::Realize {
            name,
            types,
            memory_type,
            bounds,
            condition,
            body,
        } = s.node()
        else {
            return s;
        };
        let func = match self.ctx.function(name) {
            Ok(f) => f,
            Err(e) => {
                self.err.get_or_insert(e);
                return s;
            }
        };
        let (mut lets, body) = peel_lets(body);
        let region = footprint(&body, name, true)
            .unwrap_or_else(|| vec![Interval::everything(); func.args.len()]);
        if let Err(e) = check_bounded(func, &region) {
            self.err.get_or_insert(e);
            return s;
        }
        for (a, iv) in func.args.iter().zip(&region) {
            if let (Some(min), Some(max)) = (&iv.min, &iv.max) {
                let extent = simplify(&(max.clone() + 1 - min.clone()));
                lets.push((format!("{}.{}.min_realized", name, a), min.clone()));
                lets.push((format!("{}.{}.extent_realized", name, a), extent));
            }
        }
        let realize: Stmt = StmtNode::Realize {
            name: name.clone(),
            types: types.clone(),
            memory_type: *memory_type,
            bounds: bounds.clone(),
            condition: condition.clone(),
            body,
        }
        .into();
        wrap_lets(lets, realize)
    }
}

impl IrMutator for InferBounds<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        match s.node() {
            StmtNode::Block { first, rest } => {
                if let Some((names, produce)) = producer_chain(first) {
                    if let Some(consume) = consumer_chain(rest, &names) {
                        return self.pipeline(names, &produce, Some(&consume));
                    }
                }
                mutate_stmt_children(self, s)
            }
            StmtNode::ProducerConsumer {
                is_producer: true, ..
            } => match producer_chain(s) {
                Some((names, produce)) => self.pipeline(names, &produce, None),
                None => mutate_stmt_children(self, s),
            },
            StmtNode::Realize { .. } => self.realize(s),
            _ => mutate_stmt_children(self, s),
        }
    }
}

pub struct BoundsInference;

impl LoweringPass for BoundsInference {
    fn name(&self) -> &str {
        "bounds_inference"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut m = InferBounds {
            ctx: &*ctx,
            err: None,
        };
        let out = m.mutate_stmt(&stmt);
        match m.err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{LoopLevel, Pipeline, RDom, TailStrategy, Var};
    use crate::lower::env::{RealizationOrder, WrapCalls};
    use crate::lower::schedule_functions::ScheduleFunctions;
    use crate::lower::validate::ValidateSchedules;
    use crate::options::LowerOptions;

    fn infer(p: &Pipeline, out: &str) -> Result<String> {
        let mut ctx = LowerContext::new(LowerOptions::default());
        ctx.env = p.functions().map(|f| (f.name.clone(), f.clone())).collect();
        ctx.outputs = vec![out.to_string()];
        let mut s = Stmt::no_op();
        s = WrapCalls.run(s, &mut ctx)?;
        s = RealizationOrder.run(s, &mut ctx)?;
        s = ValidateSchedules.run(s, &mut ctx)?;
        s = ScheduleFunctions.run(s, &mut ctx)?;
        Ok(BoundsInference.run(s, &mut ctx)?.to_string())
    }

    fn blur() -> Pipeline {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let g = p.func("g").unwrap();
        let a = p.call(f, vec![x.expr() - 1]).unwrap();
        let b = p.call(f, vec![x.expr() + 1]).unwrap();
        p.define(g, &[x.clone()], vec![a + b]).unwrap();
        p.compute_root(f);
        p
    }

    #[test]
    fn output_bounds_come_from_its_buffer() {
        let out = infer(&blur(), "g").unwrap();
        assert!(out.contains("let g.s0.x.min = g.min.0"), "{}", out);
        assert!(out.contains("let g.s0.x.max = ((g.min.0 + g.extent.0) - 1)"), "{}", out);
    }

    #[test]
    fn producer_covers_the_stencil() {
        let out = infer(&blur(), "g").unwrap();
        assert!(out.contains("let f.s0.x.min = (g.s0.x.min - 1)"), "{}", out);
        assert!(out.contains("let f.s0.x.max = (g.s0.x.max + 1)"), "{}", out);
        assert!(out.contains("let f.x.min_realized ="), "{}", out);
        assert!(out.contains("let f.x.extent_realized ="), "{}", out);
    }

    #[test]
    fn update_footprint_widens_earlier_stages() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let h = p.func("h").unwrap();
        p.define(h, &[x.clone()], vec![Expr::int(0)]).unwrap();
        let r = RDom::new("r", [(0, 10)]);
        p.update_with_domain(h, vec![r.x().expr()], vec![Expr::int(1)], &r)
            .unwrap();
        let out = infer(&p, "h").unwrap();
        assert!(out.contains("let h.s1.r$x.min = 0"), "{}", out);
        assert!(out.contains("let h.s1.r$x.max = 9"), "{}", out);
        assert!(out.contains("let h.s0.x.min = min(h.min.0, 0)"), "{}", out);
    }

    #[test]
    fn guarded_split_does_not_widen_the_producer() {
        let mut p = blur();
        let g = p.id_of("g").unwrap();
        let f = p.id_of("f").unwrap();
        p.stage(g, 0)
            .unwrap()
            .split(&Var::new("x"), "xo", "xi", 8, TailStrategy::GuardWithIf)
            .unwrap();
        p.compute_at(f, LoopLevel::at("g", "xo"));
        let out = infer(&p, "g").unwrap();
        assert!(out.contains("let f.s0.x.max ="), "{}", out);
        assert!(out.contains("g.s0.x.loop_extent"), "{}", out);
    }

    #[test]
    fn unbounded_access_is_an_error() {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let g = p.func("g").unwrap();
        let inner = crate::ir::Expr::load(Type::i32(), "lut", x.expr(), Expr::bool(true));
        let fx = p.call(f, vec![inner]).unwrap();
        p.define(g, &[x.clone()], vec![fx]).unwrap();
        p.compute_root(f);
        let err = infer(&p, "g").unwrap_err();
        assert_eq!(err.code(), Some("E0303"));
    }
}
