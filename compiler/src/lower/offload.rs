// offload.rs - Device offload
//
// Loops scheduled onto Hexagon or an FPGA are compiled separately from the
// host code. The default `OffloadCompiler` lifts each such loop into a
// `DeviceKernel` with its own argument list and leaves a
// `halide_device_run("<kernel>", args...)` call in its place. Buffers are
// passed by handle (`b.buffer`), scalars by value.

use crate::diag::codes;
use crate::error::{Error, Result};
use crate::ir::{
    intrinsics, mutate_stmt_children, DeviceApi, Expr, IrMutator, Stmt, StmtNode, Type,
};
use crate::target::{Feature, Target};

use super::arguments::{argument_expr, FreeSymbols};
use super::module::{Argument, DeviceKernel};
use super::pass::{LowerContext, LoweringPass};
use super::trace::pipeline_name;

/// Compiles the device parts of a lowered statement.
pub trait OffloadCompiler {
    fn offload(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt>;
}

fn device_name(api: DeviceApi) -> Option<&'static str> {
    match api {
        DeviceApi::Hexagon => Some("hexagon"),
        DeviceApi::IntelFpga => Some("intel_fpga"),
        _ => None,
    }
}

/// Arguments of a kernel body: scalars first, then buffers, each in name
/// order. Buffers the body stores to are outputs.
pub(crate) fn kernel_arguments(body: &Stmt) -> Vec<Argument> {
    let free = FreeSymbols::of(body);
    let scalars = free
        .scalars
        .iter()
        .map(|(name, ty)| Argument::scalar(name.clone(), *ty));
    let buffers = free.buffers.iter().map(|(name, b)| {
        let ty = b.ty.unwrap_or_else(Type::i32);
        if b.stored {
            Argument::output_buffer(name.clone(), ty, b.dimensions)
        } else {
            Argument::input_buffer(name.clone(), ty, b.dimensions)
        }
    });
    scalars.chain(buffers).collect()
}

struct Extract<'a> {
    target: &'a Target,
    prefix: String,
    autorun: bool,
    overlay_count: u32,
    kernels: Vec<DeviceKernel>,
    err: Option<Error>,
}

impl IrMutator for Extract<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        e.clone()
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        if self.err.is_some() {
            return s.clone();
        }
        let StmtNode::For {
            name, device_api, ..
        } = s.node()
        else {
            return mutate_stmt_children(self, s);
        };
        let Some(device) = device_name(*device_api) else {
            return mutate_stmt_children(self, s);
        };
        if !self.target.supports_device_api(*device_api) {
            self.err = Some(LowerContext::user_error(
                codes::E0309_OFFLOAD,
                name,
                format!(
                    "loop `{}` runs on {:?}, which target `{}` does not support",
                    name, device_api, self.target
                ),
            ));
            return s.clone();
        }

        let kernel = format!("{}_k{}", self.prefix, self.kernels.len());
        let args = kernel_arguments(s);
        let mut call_args = vec![Expr::string(kernel.clone())];
        call_args.extend(args.iter().map(argument_expr));
        tracing::debug!(kernel = %kernel, device, args = args.len(), "offloaded loop");
        self.kernels.push(DeviceKernel {
            name: kernel,
            device: device.to_string(),
            args,
            body: s.clone(),
            autorun: self.autorun,
            overlay_count: self.overlay_count,
        });
        Stmt::evaluate(Expr::intrinsic(Type::i32(), intrinsics::DEVICE_RUN, call_args))
    }
}

/// Lifts every outermost Hexagon or FPGA loop into a kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceLoopExtractor;

impl OffloadCompiler for DeviceLoopExtractor {
    fn offload(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        let mut m = Extract {
            target: ctx.target(),
            prefix: pipeline_name(ctx),
            autorun: !ctx.options.disable_autorun,
            overlay_count: ctx.options.overlay_count,
            kernels: Vec::new(),
            err: None,
        };
        let out = m.mutate_stmt(&stmt);
        if let Some(e) = m.err {
            return Err(e);
        }
        let kernels = m.kernels;
        ctx.kernels.extend(kernels);
        Ok(out)
    }
}

pub struct Offload {
    compiler: Box<dyn OffloadCompiler>,
}

impl Offload {
    pub fn new(compiler: Box<dyn OffloadCompiler>) -> Self {
        Offload { compiler }
    }
}

impl Default for Offload {
    fn default() -> Self {
        Offload::new(Box::new(DeviceLoopExtractor))
    }
}

impl LoweringPass for Offload {
    fn name(&self) -> &str {
        "offload"
    }

    fn gate(&self, target: &Target) -> bool {
        target.has_feature(Feature::Hvx) || target.is_fpga()
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        self.compiler.offload(stmt, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ForType;
    use crate::lower::module::ArgumentKind;
    use crate::options::LowerOptions;

    fn device_loop(api: DeviceApi) -> Stmt {
        let value = Expr::load(Type::f32(), "in", Expr::var("x"), Expr::bool(true))
            * Expr::var_of(Type::f32(), "k");
        let body = Stmt::store("out", value, Expr::var("x"), Expr::bool(true));
        Stmt::for_loop("x", Expr::int(0), Expr::var("n"), ForType::Serial, api, body)
    }

    fn ctx(target: &str) -> LowerContext {
        let mut options = LowerOptions::for_target(target.parse().unwrap());
        options.pipeline_name = "p".into();
        options.overlay_count = 2;
        LowerContext::new(options)
    }

    #[test]
    fn hexagon_loop_becomes_a_kernel() {
        let mut ctx = ctx("hexagon-32-noos-hvx");
        let s = Stmt::let_stmt("n", Expr::int(16), device_loop(DeviceApi::Hexagon));
        let out = Offload::default().run(s, &mut ctx).unwrap();
        insta::assert_snapshot!(out.to_string(), @r#"
        let n = 16
        halide_device_run("p_k0", k, n, in.buffer, out.buffer)
        "#);
        let kernel = &ctx.kernels[0];
        assert_eq!(kernel.device, "hexagon");
        assert!(kernel.autorun);
        assert_eq!(kernel.overlay_count, 2);
        let kinds: Vec<_> = kernel.args.iter().map(|a| (a.name.as_str(), a.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("k", ArgumentKind::InputScalar),
                ("n", ArgumentKind::InputScalar),
                ("in", ArgumentKind::InputBuffer),
                ("out", ArgumentKind::OutputBuffer),
            ]
        );
    }

    #[test]
    fn disable_autorun_reaches_the_kernel() {
        let mut ctx = ctx("x86-64-linux-intel_fpga");
        ctx.options.disable_autorun = true;
        Offload::default()
            .run(device_loop(DeviceApi::IntelFpga), &mut ctx)
            .unwrap();
        assert_eq!(ctx.kernels[0].device, "intel_fpga");
        assert!(!ctx.kernels[0].autorun);
    }

    #[test]
    fn unsupported_device_is_an_error() {
        let mut ctx = ctx("x86-64-linux-intel_fpga");
        let err = Offload::default()
            .run(device_loop(DeviceApi::Hexagon), &mut ctx)
            .err()
            .unwrap();
        assert_eq!(err.code(), Some("E0309"));
    }
}
