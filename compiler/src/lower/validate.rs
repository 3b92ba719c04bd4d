// validate.rs - Schedule legality checks that need the whole environment
//
// The stage primitives check what they can locally. Everything that depends
// on other functions (loop levels naming another function's loops, fused
// group compatibility, device loops versus the target) is checked here,
// before any IR is built.

use crate::diag::{codes, Diagnostic};
use crate::error::{Error, Result};
use crate::func::{Function, LoopLevel};
use crate::ir::{DeviceApi, Stmt};
use crate::target::Target;

use super::pass::{LowerContext, LoweringPass};

pub struct ValidateSchedules;

fn check_level(ctx: &LowerContext, func: &Function, level: &LoopLevel, what: &str) -> Result<()> {
    let LoopLevel::At { func: owner, stage, var } = level else {
        return Ok(());
    };
    let bad = |msg: String| {
        Err(LowerContext::user_error(codes::E0301_BAD_LOOP_LEVEL, &func.name, msg))
    };
    if *owner == func.name {
        return bad(format!("`{}` can't be {} one of its own loops ({})", func.name, what, level));
    }
    let Some(target) = ctx.env.get(owner) else {
        return bad(format!(
            "`{}` is {} {}, but `{}` is not used by this pipeline",
            func.name, what, level, owner
        ));
    };
    if target.schedule.compute_level.is_inlined() && !ctx.is_output(owner) {
        return bad(format!(
            "`{}` is {} {}, but `{}` is inlined and has no loops",
            func.name, what, level, owner
        ));
    }
    let has_dim = target
        .definitions()
        .enumerate()
        .filter(|(k, _)| stage.map_or(true, |s| s == *k))
        .any(|(_, d)| d.schedule.find_dim(var).is_some());
    if !has_dim {
        return bad(format!(
            "`{}` is {} {}, but `{}` has no loop over `{}`",
            func.name, what, level, owner, var
        ));
    }
    Ok(())
}

fn check_device_loops(func: &Function, target: &Target) -> Result<()> {
    for (k, def) in func.definitions().enumerate() {
        let mut defs = vec![def];
        defs.extend(def.specializations.iter().map(|s| &s.definition));
        for d in defs {
            for dim in &d.schedule.dims {
                let gpu_loop = dim.for_type.is_gpu()
                    || matches!(
                        dim.device_api,
                        DeviceApi::DefaultGpu | DeviceApi::Cuda | DeviceApi::OpenCl | DeviceApi::Metal
                    );
                if gpu_loop && !target.has_gpu_feature() {
                    return Err(LowerContext::user_error(
                        codes::E0306_NO_GPU,
                        &func.name,
                        format!(
                            "loop {}.{} is scheduled for a GPU, but target {} has no GPU feature",
                            func.stage_name(k),
                            dim.var,
                            target
                        ),
                    ));
                }
                if !target.supports_device_api(dim.device_api) {
                    return Err(LowerContext::user_error(
                        codes::E0309_OFFLOAD,
                        &func.name,
                        format!(
                            "loop {}.{} uses device API {:?}, which target {} does not support",
                            func.stage_name(k),
                            dim.var,
                            dim.device_api,
                            target
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

impl LoweringPass for ValidateSchedules {
    fn name(&self) -> &str {
        "validate_schedules"
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        for func in ctx.env.values() {
            let s = &func.schedule;
            let inlined = s.compute_level.is_inlined() && !ctx.is_output(&func.name);
            if inlined && !func.is_extern() {
                if func.has_updates() {
                    return Err(LowerContext::user_error(
                        codes::E0302_INLINE_UPDATE,
                        &func.name,
                        format!(
                            "`{}` has update definitions, so it can't be inlined; schedule it with compute_root or compute_at",
                            func.name
                        ),
                    ));
                }
                if func.definitions().any(|d| d.schedule.touched) {
                    return Err(Error::user(
                        Diagnostic::error(
                            codes::E0302_INLINE_UPDATE,
                            format!("`{}` is inlined, so its loops can't be scheduled", func.name),
                        )
                        .with_subject(func.name.clone())
                        .with_hint("give it a compute_root or compute_at"),
                    ));
                }
            }
            if ctx.is_output(&func.name) && matches!(s.compute_level, LoopLevel::At { .. }) {
                return Err(LowerContext::user_error(
                    codes::E0301_BAD_LOOP_LEVEL,
                    &func.name,
                    format!("output `{}` must be computed at root", func.name),
                ));
            }
            check_level(ctx, func, &s.compute_level, "computed at")?;
            check_level(ctx, func, &s.store_level, "stored at")?;
            if s.memoized && !s.compute_level.is_root() {
                return Err(LowerContext::user_error(
                    codes::E0304_MEMOIZE_LEVEL,
                    &func.name,
                    format!(
                        "`{}` is memoized, so it must be computed at root (it is computed at {})",
                        func.name, s.compute_level
                    ),
                ));
            }
            check_device_loops(func, ctx.target())?;
        }

        for g in &ctx.groups {
            let funcs = g.functions();
            let Some(first) = funcs.first() else { continue };
            let level = &ctx.function(first)?.schedule.compute_level;
            for f in &funcs[1..] {
                let other = &ctx.function(f)?.schedule.compute_level;
                if other != level {
                    return Err(LowerContext::user_error(
                        codes::E0305_COMPUTE_WITH_GROUP,
                        f,
                        format!(
                            "`{}` is computed with `{}`, but they are computed at different levels ({} and {})",
                            f, first, other, level
                        ),
                    ));
                }
            }
            if level.is_inlined() {
                return Err(LowerContext::user_error(
                    codes::E0305_COMPUTE_WITH_GROUP,
                    first,
                    format!("`{}` is part of a compute_with group and can't be inlined", first),
                ));
            }
        }
        Ok(stmt)
    }
}
