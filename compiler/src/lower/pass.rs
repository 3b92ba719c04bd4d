// pass.rs - Lowering pass interface, shared context, and observers
//
// Every lowering step implements `LoweringPass`: a stable name, a gate on the
// target's features, and a `run` that consumes the whole statement and
// returns the rewritten one. Passes whose precondition is absent from the
// pipeline (no traced function, no tuple) return their input unchanged.
//
// `LowerContext` carries what the passes share: the deep-copied function
// environment, the realization order, the declared inputs and the warnings
// gathered so far. Observers see the IR after each pass.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::diag::{codes, Diagnostic};
use crate::error::{Error, Result};
use crate::func::{ConstBuffer, Function, ImageParam, Param};
use crate::id::NameGen;
use crate::ir::{Expr, Stmt};
use crate::options::LowerOptions;
use crate::target::Target;

use super::module::{Argument, DeviceKernel};

// ── Pass trait ─────────────────────────────────────────────────────────────

pub trait LoweringPass {
    /// Stable name used in logs and observer callbacks.
    fn name(&self) -> &str;

    /// False skips the pass for this target.
    fn gate(&self, _target: &Target) -> bool {
        true
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt>;
}

/// A pass built from a closure, handy for custom passes and tests.
pub struct FnPass<F> {
    name: String,
    f: F,
}

impl<F> FnPass<F>
where
    F: FnMut(Stmt, &mut LowerContext) -> Result<Stmt>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnPass {
            name: name.into(),
            f,
        }
    }
}

impl<F> LoweringPass for FnPass<F>
where
    F: FnMut(Stmt, &mut LowerContext) -> Result<Stmt>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, stmt: Stmt, ctx: &mut LowerContext) -> Result<Stmt> {
        (self.f)(stmt, ctx)
    }
}

// ── Observers ──────────────────────────────────────────────────────────────

pub trait PassObserver {
    fn on_pass(&mut self, name: &str, stmt: &Stmt, elapsed: Duration);

    /// Called for passes whose gate rejected the target.
    fn on_skip(&mut self, _name: &str) {}
}

/// Logs one `debug!` event per pass; at debug level 2 and up also logs the
/// IR after every pass at `trace!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    pub debug_level: u8,
}

impl TracingObserver {
    pub fn new(debug_level: u8) -> Self {
        TracingObserver { debug_level }
    }
}

impl PassObserver for TracingObserver {
    fn on_pass(&mut self, name: &str, stmt: &Stmt, elapsed: Duration) {
        debug!(pass = name, elapsed_us = elapsed.as_micros() as u64, "lowering pass done");
        if self.debug_level >= 2 {
            trace!(pass = name, "\n{}", stmt);
        }
    }

    fn on_skip(&mut self, name: &str) {
        debug!(pass = name, "lowering pass skipped by target gate");
    }
}

/// Records pass names and IR snapshots; used by tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub passes: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl PassObserver for RecordingObserver {
    fn on_pass(&mut self, name: &str, stmt: &Stmt, _elapsed: Duration) {
        self.passes.push((name.to_string(), stmt.to_string()));
    }

    fn on_skip(&mut self, name: &str) {
        self.skipped.push(name.to_string());
    }
}

// ── Context ────────────────────────────────────────────────────────────────

/// A set of stages computed together by `compute_with`, in execution order.
/// `root` is the stage the others were fused into.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedGroup {
    pub root: (String, usize),
    pub members: Vec<(String, usize)>,
}

impl FusedGroup {
    pub fn functions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (f, _) in &self.members {
            if !out.contains(f) {
                out.push(f.clone());
            }
        }
        out
    }

    pub fn contains(&self, func: &str, stage: usize) -> bool {
        self.members.iter().any(|(f, s)| f == func && *s == stage)
    }
}

pub struct LowerContext {
    pub options: LowerOptions,
    /// Function name to a private copy of the function.
    pub env: BTreeMap<String, Function>,
    pub outputs: Vec<String>,
    /// Producers before consumers.
    pub order: Vec<String>,
    pub groups: Vec<FusedGroup>,
    pub images: BTreeMap<String, ImageParam>,
    pub params: BTreeMap<String, Param>,
    pub buffers: BTreeMap<String, ConstBuffer>,
    /// Conditions asserted before the pipeline runs, with their messages.
    pub requirements: Vec<(Expr, String)>,
    /// The argument list the caller declared.
    pub declared_args: Vec<Argument>,
    pub kernels: Vec<DeviceKernel>,
    pub warnings: Vec<Diagnostic>,
    pub names: NameGen,
}

impl LowerContext {
    pub fn new(options: LowerOptions) -> Self {
        LowerContext {
            options,
            env: BTreeMap::new(),
            outputs: Vec::new(),
            order: Vec::new(),
            groups: Vec::new(),
            images: BTreeMap::new(),
            params: BTreeMap::new(),
            buffers: BTreeMap::new(),
            requirements: Vec::new(),
            declared_args: Vec::new(),
            kernels: Vec::new(),
            warnings: Vec::new(),
            names: NameGen::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.options.target
    }

    pub fn function(&self, name: &str) -> Result<&Function> {
        self.env
            .get(name)
            .ok_or_else(|| Error::internal(format!("function `{}` is not in the environment", name)))
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub fn group_of(&self, func: &str) -> Option<&FusedGroup> {
        self.groups
            .iter()
            .find(|g| g.members.iter().any(|(f, _)| f == func))
    }

    pub fn warn(&mut self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        self.warnings.push(diagnostic);
    }

    pub fn user_error(code: crate::diag::DiagCode, subject: &str, message: String) -> Error {
        Error::user(Diagnostic::error(code, message).with_subject(subject.to_string()))
    }

    pub(crate) fn unbounded(func: &str, dim: &str) -> Error {
        LowerContext::user_error(
            codes::E0303_UNBOUNDED,
            func,
            format!(
                "can't infer bounds for dimension `{}` of `{}`: it is accessed at an unbounded index",
                dim, func
            ),
        )
    }
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// Fold `passes` over `stmt`, skipping gated-off passes and reporting each
/// step to `observer`.
pub fn run_passes(
    passes: &mut [Box<dyn LoweringPass>],
    mut stmt: Stmt,
    ctx: &mut LowerContext,
    observer: &mut dyn PassObserver,
) -> Result<Stmt> {
    for pass in passes.iter_mut() {
        if !pass.gate(ctx.target()) {
            observer.on_skip(pass.name());
            continue;
        }
        let t = std::time::Instant::now();
        stmt = pass.run(stmt, ctx)?;
        observer.on_pass(pass.name(), &stmt, t.elapsed());
    }
    Ok(stmt)
}
