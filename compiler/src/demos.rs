// demos.rs - Built-in demo pipelines
//
// Small scheduled pipelines shared by the CLI, the benchmarks and the
// integration tests. Each demo also knows how to bind deterministic inputs
// and zeroed outputs to an interpreter, so a lowered module can be run end
// to end.

use crate::error::Result;
use crate::func::{Pipeline, RDom, TailStrategy, Var};
use crate::id::FuncId;
use crate::interp::{Buffer, Interpreter};
use crate::ir::{Expr, Type};
use crate::lower::Argument;

pub const NAMES: &[&str] = &["blur", "histogram", "matmul", "divergent"];

pub struct Demo {
    pub name: &'static str,
    pub pipeline: Pipeline,
    pub outputs: Vec<FuncId>,
    pub args: Vec<Argument>,
    /// Input buffers and output shapes used when interpreting.
    inputs: Vec<(String, Buffer)>,
    output_shapes: Vec<(String, Vec<i64>)>,
}

impl Demo {
    pub fn by_name(name: &str) -> Result<Option<Demo>> {
        Ok(Some(match name {
            "blur" => blur()?,
            "histogram" => histogram()?,
            "matmul" => matmul()?,
            "divergent" => divergent()?,
            _ => return Ok(None),
        }))
    }

    /// Bind inputs and zeroed outputs.
    pub fn bind(&self, it: &mut Interpreter) {
        for (name, b) in &self.inputs {
            it.set_buffer(name.clone(), b.clone());
        }
        for (name, shape) in &self.output_shapes {
            it.set_buffer(name.clone(), Buffer::new(Type::i32(), shape));
        }
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.output_shapes.iter().map(|(n, _)| n.as_str())
    }
}

fn args_of(p: &Pipeline) -> Vec<Argument> {
    let mut args: Vec<Argument> = p.params().map(Argument::from).collect();
    args.extend(p.images().map(Argument::from));
    args
}

fn pattern(c: &[i64]) -> f64 {
    c.iter()
        .enumerate()
        .map(|(i, x)| (x * (7 + 3 * i as i64) + 5) % 23)
        .sum::<i64>() as f64
}

/// Two-stage 3x3 box blur; the output is tiled 8x4 with the inner x
/// vectorized, and the horizontal pass is computed per tile.
pub fn blur() -> Result<Demo> {
    let mut p = Pipeline::new();
    let input = p.image_param("input", Type::i32(), 2)?;
    let (x, y) = (Var::new("x"), Var::new("y"));
    let at = |dx: i32, dy: i32| input.at(vec![x.expr() + dx, y.expr() + dy]);

    let bx = p.func("blur_x")?;
    p.define(bx, &[x.clone(), y.clone()], vec![(at(0, 0) + at(1, 0) + at(2, 0)) / 3])?;
    let by = p.func("blur_y")?;
    let call = |p: &Pipeline, dy: i32| p.call(bx, vec![x.expr(), y.expr() + dy]);
    let sum = call(&p, 0)? + call(&p, 1)? + call(&p, 2)?;
    p.define(by, &[x.clone(), y.clone()], vec![sum / 3])?;

    p.stage(by, 0)?
        .tile(&x, &y, "xo", "yo", "xi", "yi", 8, 4, TailStrategy::Auto)?
        .vectorize("xi")?;
    let level = p.at(by, "xo");
    p.compute_at(bx, level);

    Ok(Demo {
        name: "blur",
        args: args_of(&p),
        outputs: vec![by],
        inputs: vec![(
            "input".into(),
            Buffer::from_fn(Type::i32(), &[18, 10], pattern),
        )],
        output_shapes: vec![("blur_y".into(), vec![16, 8])],
        pipeline: p,
    })
}

/// A 16-bin histogram of a 2-D image whose row reduction is factored
/// through an intermediate with a vectorized bin dimension.
pub fn histogram() -> Result<Demo> {
    let mut p = Pipeline::new();
    let input = p.image_param("input", Type::i32(), 2)?;
    let (b, u) = (Var::new("b"), Var::new("u"));
    let r = RDom::new("r", [(0, 12), (0, 8)]);

    let hist = p.func("hist")?;
    p.define(hist, &[b.clone()], vec![Expr::int(0)])?;
    let bin = Expr::min(
        Expr::max(input.at(vec![r.x().expr(), r.y().expr()]), Expr::int(0)),
        Expr::int(15),
    );
    p.sum_into(hist, vec![bin], Expr::int(1), &r)?;
    let intm = p.stage(hist, 1)?.rfactor(&[(r.y(), u.clone())])?;
    p.stage(intm, 0)?.vectorize_by(&b, 8, TailStrategy::RoundUp)?;

    Ok(Demo {
        name: "histogram",
        args: args_of(&p),
        outputs: vec![hist],
        inputs: vec![(
            "input".into(),
            Buffer::from_fn(Type::i32(), &[12, 8], |c| pattern(c) % 16.0),
        )],
        output_shapes: vec![("hist".into(), vec![16])],
        pipeline: p,
    })
}

/// `C(x, y) = sum_k A(k, y) * B(x, k)` with the initialisation vectorized
/// by 8.
pub fn matmul() -> Result<Demo> {
    let mut p = Pipeline::new();
    let a = p.image_param("A", Type::i32(), 2)?;
    let bm = p.image_param("B", Type::i32(), 2)?;
    let (x, y) = (Var::new("x"), Var::new("y"));
    let k = RDom::new("k", [(0, 16)]);

    let c = p.func("C")?;
    p.define(c, &[x.clone(), y.clone()], vec![Expr::int(0)])?;
    let term = a.at(vec![k.x().expr(), y.expr()]) * bm.at(vec![x.expr(), k.x().expr()]);
    p.sum_into(c, vec![x.expr(), y.expr()], term, &k)?;
    p.stage(c, 0)?.vectorize_by(&x, 8, TailStrategy::Auto)?;

    Ok(Demo {
        name: "matmul",
        args: args_of(&p),
        outputs: vec![c],
        inputs: vec![
            ("A".into(), Buffer::from_fn(Type::i32(), &[16, 8], pattern)),
            ("B".into(), Buffer::from_fn(Type::i32(), &[16, 16], pattern)),
        ],
        output_shapes: vec![("C".into(), vec![16, 8])],
        pipeline: p,
    })
}

/// `out(x) = in(x) > 0 ? in(x) : -in(x)`, vectorized by 8 with the tail
/// guarded, so the vector body sits under a data-independent branch.
pub fn divergent() -> Result<Demo> {
    let mut p = Pipeline::new();
    let input = p.image_param("input", Type::i32(), 1)?;
    let x = Var::new("x");
    let v = input.at(vec![x.expr()]);

    let out = p.func("out")?;
    let value = Expr::select(Expr::gt(v.clone(), Expr::int(0)), v.clone(), Expr::int(0) - v);
    p.define(out, &[x.clone()], vec![value])?;
    p.stage(out, 0)?.vectorize_by(&x, 8, TailStrategy::GuardWithIf)?;

    Ok(Demo {
        name: "divergent",
        args: args_of(&p),
        outputs: vec![out],
        inputs: vec![(
            "input".into(),
            Buffer::from_fn(Type::i32(), &[20], |c| (c[0] * 5 % 11 - 5) as f64),
        )],
        output_shapes: vec![("out".into(), vec![20])],
        pipeline: p,
    })
}
