// lower/mod.rs - Lowering orchestrator
//
// `lower` turns the scheduled function graph into a `Module`. It takes a
// private copy of the pipeline's functions, then folds a fixed list of
// passes over a single statement:
//
//   wrap_calls → realization_order → validate_schedules → schedule_functions
//   → inject_tracing → add_parameter_checks → bounds_inference
//   → add_image_checks → async_producers → uniquify_names → memoization
//   → split_tuples → storage_flattening → canonicalize_gpu_vars → simplify
//   → vectorize → unroll → select_gpu_api → simplify → trim_no_ops
//   → early_free → remove_dead_allocations → profiling → offload
//   → (custom passes)
//
// and finally infers the argument list and assembles the module. The order
// matters: names are made unique before passes that key on them, bounds are
// known before storage is flattened, and frees are placed once allocations
// have their final extents. Gated passes are skipped for targets that lack
// the feature they serve. Any user error aborts lowering; there is no
// partial module.

pub mod arguments;
pub mod async_producers;
pub mod bounds;
pub mod checks;
pub mod env;
pub mod flatten;
pub mod free;
pub mod gpu;
pub mod memoize;
pub mod module;
pub mod nest;
pub mod offload;
pub mod pass;
pub mod profiling;
pub mod schedule_functions;
pub mod split_tuples;
pub mod trace;
pub mod trim;
pub mod uniquify;
pub mod unroll;
pub mod validate;
pub mod vectorize;

use tracing::info;

use crate::diag::codes;
use crate::error::Result;
use crate::func::Pipeline;
use crate::id::FuncId;
use crate::ir::{simplify_stmt, Stmt};
use crate::options::LowerOptions;

pub use arguments::assemble_module;
pub use module::{Argument, ArgumentKind, DeviceKernel, Linkage, LoweredFunc, Module};
pub use offload::{DeviceLoopExtractor, OffloadCompiler};
pub use pass::{
    run_passes, FnPass, LowerContext, LoweringPass, PassObserver, RecordingObserver,
    TracingObserver,
};

/// Algebraic cleanup between passes.
pub struct Simplify;

impl LoweringPass for Simplify {
    fn name(&self) -> &str {
        "simplify"
    }

    fn run(&mut self, stmt: Stmt, _ctx: &mut LowerContext) -> Result<Stmt> {
        Ok(simplify_stmt(&stmt))
    }
}

/// The built-in passes, in order.
pub fn default_passes() -> Vec<Box<dyn LoweringPass>> {
    vec![
        Box::new(env::WrapCalls),
        Box::new(env::RealizationOrder),
        Box::new(validate::ValidateSchedules),
        Box::new(schedule_functions::ScheduleFunctions),
        Box::new(trace::InjectTracingPass),
        Box::new(checks::AddParameterChecks),
        Box::new(bounds::BoundsInference),
        Box::new(checks::AddImageChecks),
        Box::new(async_producers::AsyncProducers),
        Box::new(uniquify::UniquifyNames),
        Box::new(memoize::Memoization),
        Box::new(split_tuples::SplitTuplesPass),
        Box::new(flatten::StorageFlattening),
        Box::new(gpu::CanonicalizeGpuVars),
        Box::new(Simplify),
        Box::new(vectorize::Vectorize),
        Box::new(unroll::UnrollLoops),
        Box::new(gpu::SelectGpuApi),
        Box::new(Simplify),
        Box::new(trim::TrimNoOps),
        Box::new(free::EarlyFree),
        Box::new(free::RemoveDeadAllocations),
        Box::new(profiling::Profiling),
        Box::new(offload::Offload::default()),
    ]
}

/// Build the lowering context: private copies of everything the pipeline
/// owns, the output names, and the declared arguments.
pub fn prepare(
    pipeline: &Pipeline,
    outputs: &[FuncId],
    args: &[Argument],
    options: &LowerOptions,
) -> Result<LowerContext> {
    let mut ctx = LowerContext::new(options.clone());
    ctx.env = pipeline
        .functions()
        .map(|f| (f.name.clone(), f.clone()))
        .collect();
    for id in outputs {
        let Some(f) = pipeline.functions().find(|f| f.id == *id) else {
            return Err(LowerContext::user_error(
                codes::E0201_UNDEFINED_FUNC,
                &id.to_string(),
                format!("output {} is not a function of this pipeline", id),
            ));
        };
        ctx.outputs.push(f.name.clone());
    }
    if ctx.outputs.is_empty() {
        return Err(LowerContext::user_error(
            codes::E0201_UNDEFINED_FUNC,
            "",
            "a pipeline needs at least one output".to_string(),
        ));
    }
    ctx.images = pipeline.images().map(|i| (i.name.clone(), i.clone())).collect();
    ctx.params = pipeline.params().map(|p| (p.name.clone(), p.clone())).collect();
    ctx.buffers = pipeline
        .const_buffers()
        .map(|b| (b.name.clone(), b.clone()))
        .collect();
    ctx.requirements = pipeline.requirements().to_vec();
    ctx.declared_args = args.to_vec();
    ctx.names = pipeline.names.clone();
    Ok(ctx)
}

/// Lower `outputs` of `pipeline` for `options.target`, logging each pass
/// through `tracing`.
pub fn lower(
    pipeline: &Pipeline,
    outputs: &[FuncId],
    args: &[Argument],
    options: &LowerOptions,
    custom_passes: Vec<Box<dyn LoweringPass>>,
) -> Result<Module> {
    let mut observer = TracingObserver::new(options.debug_level);
    lower_with_observer(pipeline, outputs, args, options, custom_passes, &mut observer)
}

pub fn lower_with_observer(
    pipeline: &Pipeline,
    outputs: &[FuncId],
    args: &[Argument],
    options: &LowerOptions,
    custom_passes: Vec<Box<dyn LoweringPass>>,
    observer: &mut dyn PassObserver,
) -> Result<Module> {
    let mut ctx = prepare(pipeline, outputs, args, options)?;
    let mut passes = default_passes();
    passes.extend(custom_passes);

    let start = std::time::Instant::now();
    let stmt = run_passes(&mut passes, Stmt::no_op(), &mut ctx, observer)?;
    let module = assemble_module(stmt, &mut ctx)?;
    info!(
        module = %module.name,
        target = %module.target,
        kernels = module.kernels.len(),
        warnings = module.warnings.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "lowered"
    );
    Ok(module)
}
