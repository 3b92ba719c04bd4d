// checks.rs - Run-time checks on the pipeline's inputs and outputs
//
// `AddParameterChecks` asserts the declared range of every scalar parameter
// the code reads and every requirement registered on the pipeline.
// `AddImageChecks` runs once bounds inference has defined the loop bounds:
// for every input image and output buffer it takes the hull of all accesses
// and asserts the bound buffer covers it, dimension by dimension. Both place
// their assertions ahead of any other work, so a bad call fails before it
// reads or writes out of bounds.

use tracing::debug;

use crate::error::Result;
use crate::ir::{simplify, stmt_uses_var, Expr, Stmt, Type};

use super::bounds::{footprint, image_footprint, Region};
use super::pass::{LowerContext, LoweringPass};

fn ivar(name: impl Into<String>) -> Expr {
    Expr::var_of(Type::i32(), name)
}

/// `lets` around the block of `checks` followed by `body`.
fn prepend(lets: Vec<(String, Expr)>, checks: Vec<Stmt>, body: Stmt) -> Stmt {
    let inner = Stmt::block(Stmt::block_of(checks), body);
    lets.into_iter()
        .rev()
        .fold(inner, |acc, (n, v)| Stmt::let_stmt(n, v, acc))
}

// ── Parameters ─────────────────────────────────────────────────────────────

pub struct AddParameterChecks;

impl LoweringPass for AddParameterChecks {
    fn name(&self) -> &str {
        "add_parameter_checks"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut checks = Vec::new();
        for p in ctx.params.values() {
            if !stmt_uses_var(&stmt, &p.name) {
                continue;
            }
            if let Some(min) = &p.min {
                checks.push(Stmt::assert(
                    Expr::ge(p.expr(), min.clone()),
                    Expr::string(format!("parameter `{}` is below its minimum {}", p.name, min)),
                ));
            }
            if let Some(max) = &p.max {
                checks.push(Stmt::assert(
                    Expr::le(p.expr(), max.clone()),
                    Expr::string(format!("parameter `{}` is above its maximum {}", p.name, max)),
                ));
            }
        }
        for (condition, message) in &ctx.requirements {
            checks.push(Stmt::assert(condition.clone(), Expr::string(message.clone())));
        }
        if checks.is_empty() {
            return Ok(stmt);
        }
        debug!(count = checks.len(), "parameter checks");
        Ok(prepend(Vec::new(), checks, stmt))
    }
}

// ── Images ─────────────────────────────────────────────────────────────────

/// Required-region lets and the assertions that `buffer` covers `region`.
fn region_checks(kind: &str, buffer: &str, region: &Region, lets: &mut Vec<(String, Expr)>, checks: &mut Vec<Stmt>) {
    for (i, iv) in region.iter().enumerate() {
        let min = ivar(format!("{}.min.{}", buffer, i));
        let extent = ivar(format!("{}.extent.{}", buffer, i));
        checks.push(Stmt::assert(
            Expr::ge(extent.clone(), Expr::int(0)),
            Expr::string(format!("{} buffer `{}` has a negative extent in dimension {}", kind, buffer, i)),
        ));
        if let Some(lo) = &iv.min {
            let name = format!("{}.min.{}.required", buffer, i);
            lets.push((name.clone(), simplify(lo)));
            checks.push(Stmt::assert(
                Expr::le(min.clone(), ivar(&name)),
                Expr::string(format!(
                    "{} buffer `{}` is accessed below its minimum in dimension {}",
                    kind, buffer, i
                )),
            ));
        }
        if let Some(hi) = &iv.max {
            let name = format!("{}.max.{}.required", buffer, i);
            lets.push((name.clone(), simplify(hi)));
            checks.push(Stmt::assert(
                Expr::le(ivar(&name), min + extent - 1),
                Expr::string(format!(
                    "{} buffer `{}` is accessed beyond its maximum in dimension {}",
                    kind, buffer, i
                )),
            ));
        }
    }
}

pub struct AddImageChecks;

impl LoweringPass for AddImageChecks {
    fn name(&self) -> &str {
        "add_image_checks"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut lets = Vec::new();
        let mut checks = Vec::new();
        for image in ctx.images.keys() {
            if let Some(region) = image_footprint(&stmt, image) {
                region_checks("input", image, &region, &mut lets, &mut checks);
            }
        }
        for name in &ctx.outputs {
            let func = ctx.function(name)?;
            let Some(region) = footprint(&stmt, name, true) else {
                continue;
            };
            if func.is_tuple() {
                for k in 0..func.output_types.len() {
                    region_checks("output", &format!("{}.{}", name, k), &region, &mut lets, &mut checks);
                }
            } else {
                region_checks("output", name, &region, &mut lets, &mut checks);
            }
        }
        if checks.is_empty() {
            return Ok(stmt);
        }
        debug!(count = checks.len(), "image checks");
        Ok(prepend(lets, checks, stmt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Pipeline, TailStrategy, Var};
    use crate::interp::{Buffer, Interpreter, Value};
    use crate::lower::lower;
    use crate::lower::module::Argument;
    use crate::options::LowerOptions;

    /// `f(x) = x; f(x) = f(x) + 1` with the update split by 4.
    fn split_update() -> (Pipeline, crate::id::FuncId) {
        let mut p = Pipeline::new();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let value = p.call(f, vec![x.expr()]).unwrap() + 1;
        p.update(f, vec![x.expr()], vec![value]).unwrap();
        p.stage(f, 1)
            .unwrap()
            .split(&x, "xo", "xi", 4, TailStrategy::Auto)
            .unwrap();
        (p, f)
    }

    fn run(p: &Pipeline, f: crate::id::FuncId, args: &[Argument], it: &mut Interpreter) -> Result<()> {
        let m = lower(p, &[f], args, &LowerOptions::default(), Vec::new())?;
        it.run(&m)
    }

    #[test]
    fn rounded_up_update_overruns_a_short_output() {
        let (p, f) = split_update();
        let mut it = Interpreter::new();
        it.set_buffer("f", Buffer::new(Type::i32(), &[10]));
        let err = run(&p, f, &[], &mut it).unwrap_err();
        assert_eq!(err.code(), Some("E0601"));
        assert!(err.to_string().contains("beyond its maximum"), "{}", err);
        // Nothing was written before the check.
        assert!(it.buffer("f").unwrap().data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn output_covering_the_rounded_region_passes() {
        let (p, f) = split_update();
        let mut it = Interpreter::new();
        it.set_buffer("f", Buffer::new(Type::i32(), &[12]));
        run(&p, f, &[], &mut it).unwrap();
        let expected: Vec<f64> = (0..12).map(|v| (v + 1) as f64).collect();
        assert_eq!(it.buffer("f").unwrap().data, expected);
    }

    #[test]
    fn input_too_small_for_the_stencil_fails() {
        let mut p = Pipeline::new();
        let input = p.image_param("input", Type::i32(), 1).unwrap();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![input.at(vec![x.expr()]) + input.at(vec![x.expr() + 1])])
            .unwrap();
        let args = vec![Argument::from(&input)];

        let mut it = Interpreter::new();
        it.set_buffer("input", Buffer::from_fn(Type::i32(), &[8], |c| c[0] as f64));
        it.set_buffer("f", Buffer::new(Type::i32(), &[8]));
        let err = run(&p, f, &args, &mut it).unwrap_err();
        assert_eq!(err.code(), Some("E0601"));
        assert!(err.to_string().contains("input buffer `input`"), "{}", err);

        let mut it = Interpreter::new();
        it.set_buffer("input", Buffer::from_fn(Type::i32(), &[9], |c| c[0] as f64));
        it.set_buffer("f", Buffer::new(Type::i32(), &[8]));
        run(&p, f, &args, &mut it).unwrap();
        assert_eq!(it.buffer("f").unwrap().get(&[7]), Some(15.0));
    }

    #[test]
    fn checks_are_emitted_ahead_of_the_loops() {
        let (p, f) = split_update();
        let m = lower(&p, &[f], &[], &LowerOptions::default(), Vec::new()).unwrap();
        let body = m.entry().unwrap().body.to_string();
        let check = body.find("assert(").unwrap();
        let first_loop = body.find("for (").unwrap();
        assert!(check < first_loop, "{}", body);
    }

    #[test]
    fn parameter_range_is_asserted() {
        let mut p = Pipeline::new();
        let k = p.param("k", Type::i32()).unwrap();
        p.set_param_range(&k, Some(Expr::int(1)), Some(Expr::int(4))).unwrap();
        p.add_requirement(Expr::ne(k.expr(), Expr::int(3)), "k must not be 3");
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr() * k.expr()]).unwrap();
        let args = vec![Argument::from(&k)];

        let check = |value: i64| {
            let mut it = Interpreter::new();
            it.set_scalar("k", Value::int(value));
            it.set_buffer("f", Buffer::new(Type::i32(), &[4]));
            run(&p, f, &args, &mut it)
        };
        assert!(check(2).is_ok());
        let low = check(0).unwrap_err();
        assert_eq!(low.code(), Some("E0601"));
        assert!(low.to_string().contains("below its minimum"), "{}", low);
        assert!(check(5).unwrap_err().to_string().contains("above its maximum"));
        assert!(check(3).unwrap_err().to_string().contains("k must not be 3"));
    }

    #[test]
    fn empty_parameter_range_is_rejected() {
        let mut p = Pipeline::new();
        let k = p.param("k", Type::i32()).unwrap();
        let err = p
            .set_param_range(&k, Some(Expr::int(4)), Some(Expr::int(1)))
            .unwrap_err();
        assert_eq!(err.code(), Some("E0204"));
    }

    #[test]
    fn unused_parameter_is_not_checked() {
        let mut p = Pipeline::new();
        let k = p.param("k", Type::i32()).unwrap();
        p.set_param_range(&k, Some(Expr::int(1)), None).unwrap();
        let x = Var::new("x");
        let f = p.func("f").unwrap();
        p.define(f, &[x.clone()], vec![x.expr()]).unwrap();
        let m = lower(&p, &[f], &[], &LowerOptions::default(), Vec::new()).unwrap();
        assert!(!m.entry().unwrap().body.to_string().contains("parameter `k`"));
    }
}
