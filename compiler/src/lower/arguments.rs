// arguments.rs - Argument inference and module assembly
//
// The last step of lowering closes the statement over its inputs. Every
// symbol that is still free must be one of:
//
//   * a declared argument (scalar parameter or input buffer),
//   * an output buffer of the pipeline,
//   * a constant buffer, which is embedded in the module by value,
//   * the implicit `__user_context`.
//
// Anything else is an undeclared parameter and lowering fails naming it.
// Buffer metadata symbols (`b.min.0`, `b.stride.1`, ...) and the `b.buffer`
// handles passed to device kernels count as uses of buffer `b`.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::{codes, Diagnostic};
use crate::error::{Error, Result};
use crate::ir::{
    split_buffer_field, visit_expr_children, visit_stmt_children, CallType, Expr, ExprNode,
    IrVisitor, Scope, Stmt, StmtNode, Type,
};
use crate::target::Feature;

use super::module::{Argument, ArgumentKind, LoweredFunc, Linkage, Module};
use super::pass::LowerContext;
use super::split_tuples::component_name;
use super::trace::pipeline_name;

pub const USER_CONTEXT: &str = "__user_context";

// ── Free symbols ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BufferUse {
    pub ty: Option<Type>,
    pub dimensions: usize,
    pub stored: bool,
}

/// Symbols a statement reads but does not bind, in name order.
#[derive(Debug, Clone, Default)]
pub(crate) struct FreeSymbols {
    pub scalars: BTreeMap<String, Type>,
    pub buffers: BTreeMap<String, BufferUse>,
    bound: Scope<()>,
    allocated: Scope<()>,
}

impl FreeSymbols {
    pub fn of(s: &Stmt) -> Self {
        let mut v = FreeSymbols::default();
        v.visit_stmt(s);
        v
    }

    fn buffer(&mut self, name: &str) -> Option<&mut BufferUse> {
        if self.allocated.contains(name) {
            return None;
        }
        Some(self.buffers.entry(name.to_string()).or_default())
    }
}

impl IrVisitor for FreeSymbols {
    fn visit_expr(&mut self, e: &Expr) {
        match e.node() {
            ExprNode::Variable { ty, name } => {
                if self.bound.contains(name) || name == USER_CONTEXT {
                    return;
                }
                if let Some((buf, _, dim)) = split_buffer_field(name) {
                    if let Some(b) = self.buffer(buf) {
                        b.dimensions = b.dimensions.max(dim + 1);
                    }
                } else if let Some(buf) = name.strip_suffix(".buffer") {
                    self.buffer(buf);
                } else {
                    self.scalars.insert(name.clone(), *ty);
                }
            }
            ExprNode::Let { name, value, body } => {
                self.visit_expr(value);
                self.bound.push(name, ());
                self.visit_expr(body);
                self.bound.pop(name);
            }
            ExprNode::Load { ty, name, .. } => {
                if let Some(b) = self.buffer(name) {
                    b.ty.get_or_insert(ty.element_of());
                    b.dimensions = b.dimensions.max(1);
                }
                visit_expr_children(self, e);
            }
            ExprNode::Call {
                ty,
                name,
                args,
                call_type: CallType::Image,
                ..
            } => {
                if let Some(b) = self.buffer(name) {
                    b.ty.get_or_insert(ty.element_of());
                    b.dimensions = b.dimensions.max(args.len());
                }
                visit_expr_children(self, e);
            }
            _ => visit_expr_children(self, e),
        }
    }

    fn visit_stmt(&mut self, s: &Stmt) {
        match s.node() {
            StmtNode::LetStmt { name, value, body } => {
                self.visit_expr(value);
                self.bound.push(name, ());
                self.visit_stmt(body);
                self.bound.pop(name);
            }
            StmtNode::For {
                name,
                min,
                extent,
                body,
                ..
            } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                self.bound.push(name, ());
                self.visit_stmt(body);
                self.bound.pop(name);
            }
            StmtNode::Allocate {
                name,
                extents,
                condition,
                body,
                ..
            } => {
                extents.iter().for_each(|e| self.visit_expr(e));
                self.visit_expr(condition);
                self.allocated.push(name, ());
                self.visit_stmt(body);
                self.allocated.pop(name);
            }
            StmtNode::Store { name, value, .. } => {
                if let Some(b) = self.buffer(name) {
                    b.ty.get_or_insert(value.ty().element_of());
                    b.dimensions = b.dimensions.max(1);
                    b.stored = true;
                }
                visit_stmt_children(self, s);
            }
            _ => visit_stmt_children(self, s),
        }
    }
}

// ── Inference ──────────────────────────────────────────────────────────────

fn bad_arg(name: &str, message: String) -> Error {
    LowerContext::user_error(codes::E0502_BAD_ARG, name, message)
}

/// The output buffers in calling-convention order: outputs in the order
/// given, tuple components in index order.
pub(crate) fn output_arguments(ctx: &LowerContext) -> Result<Vec<Argument>> {
    let mut out = Vec::new();
    for name in &ctx.outputs {
        let f = ctx.function(name)?;
        let dims = f.args.len();
        if f.is_tuple() {
            for (i, ty) in f.output_types.iter().enumerate() {
                out.push(Argument::output_buffer(component_name(name, i), *ty, dims));
            }
        } else {
            let ty = f.output_types.first().copied().unwrap_or_else(Type::i32);
            out.push(Argument::output_buffer(name.clone(), ty, dims));
        }
    }
    Ok(out)
}

fn check_declared(ctx: &LowerContext, outputs: &[Argument]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for a in &ctx.declared_args {
        if !seen.insert(a.name.as_str()) {
            return Err(bad_arg(
                &a.name,
                format!("argument `{}` is declared more than once", a.name),
            ));
        }
        if a.kind == ArgumentKind::OutputBuffer {
            return Err(bad_arg(
                &a.name,
                format!(
                    "argument `{}` is declared as an output; outputs are added from the pipeline's output functions",
                    a.name
                ),
            ));
        }
        if outputs.iter().any(|o| o.name == a.name) {
            return Err(bad_arg(
                &a.name,
                format!("argument `{}` has the same name as an output buffer", a.name),
            ));
        }
    }
    Ok(())
}

fn undeclared(symbol: &str, what: &str) -> Error {
    Error::user(
        Diagnostic::error(
            codes::E0501_UNDECLARED,
            format!("generated code refers to {} `{}`, which was not declared as an argument", what, symbol),
        )
        .with_subject(symbol.to_string())
        .with_hint(format!("add `{}` to the argument list passed to lower()", symbol)),
    )
}

/// Resolve the free symbols of the lowered body against the declared
/// arguments. Returns the full argument list: declared arguments first,
/// then output buffers, plus the names of constant buffers to embed.
pub(crate) fn infer_arguments(stmt: &Stmt, ctx: &LowerContext) -> Result<(Vec<Argument>, Vec<String>)> {
    let outputs = output_arguments(ctx)?;
    check_declared(ctx, &outputs)?;
    let declared: BTreeMap<&str, &Argument> =
        ctx.declared_args.iter().map(|a| (a.name.as_str(), a)).collect();
    let free = FreeSymbols::of(stmt);

    for name in free.scalars.keys() {
        match declared.get(name.as_str()) {
            Some(a) if a.kind == ArgumentKind::InputScalar => {}
            Some(a) => {
                return Err(bad_arg(
                    name,
                    format!("`{}` is used as a scalar but declared as a {:?}", name, a.kind),
                ))
            }
            None => return Err(undeclared(name, "parameter")),
        }
    }

    let mut embedded = Vec::new();
    for name in free.buffers.keys() {
        if outputs.iter().any(|o| &o.name == name) {
            continue;
        }
        match declared.get(name.as_str()) {
            Some(a) if a.is_buffer() => {}
            Some(a) => {
                return Err(bad_arg(
                    name,
                    format!("`{}` is used as a buffer but declared as a {:?}", name, a.kind),
                ))
            }
            None if ctx.buffers.contains_key(name) => embedded.push(name.clone()),
            None => return Err(undeclared(name, "buffer")),
        }
    }

    let mut args = ctx.declared_args.clone();
    args.extend(outputs);
    Ok((args, embedded))
}

/// Expression passing `arg` by its runtime handle.
pub(crate) fn argument_expr(arg: &Argument) -> Expr {
    if arg.is_buffer() {
        Expr::var_of(Type::handle(), format!("{}.buffer", arg.name))
    } else {
        Expr::var_of(arg.ty, arg.name.clone())
    }
}

/// Build the module around the fully lowered body.
pub fn assemble_module(stmt: Stmt, ctx: &mut LowerContext) -> Result<Module> {
    let (args, embedded) = infer_arguments(&stmt, ctx)?;
    let name = pipeline_name(ctx);
    tracing::debug!(
        pipeline = %name,
        args = args.len(),
        embedded = embedded.len(),
        "arguments inferred"
    );

    let mut functions = vec![LoweredFunc {
        name: name.clone(),
        args: args.clone(),
        body: stmt,
        linkage: Linkage::External,
    }];
    if ctx.options.legacy_wrapper && !ctx.target().has_feature(Feature::Jit) {
        let call = Expr::call(
            Type::i32(),
            name.clone(),
            args.iter().map(argument_expr).collect(),
            CallType::Extern,
            0,
        );
        functions.push(LoweredFunc {
            name: format!("{}_legacy", name),
            args,
            body: Stmt::evaluate(call),
            linkage: Linkage::ExternalLegacy,
        });
    }

    let buffers = embedded
        .iter()
        .filter_map(|b| ctx.buffers.get(b).cloned())
        .collect();
    Ok(Module {
        name,
        target: ctx.target().clone(),
        functions,
        buffers,
        kernels: std::mem::take(&mut ctx.kernels),
        warnings: ctx.warnings.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LowerOptions;

    fn ctx_with(declared: Vec<Argument>) -> LowerContext {
        let mut ctx = LowerContext::new(LowerOptions::default());
        ctx.declared_args = declared;
        ctx
    }

    fn body() -> Stmt {
        let value = Expr::load(Type::f32(), "input", Expr::var("x") - Expr::var("input.min.0"), Expr::bool(true))
            * Expr::var_of(Type::f32(), "k");
        let store = Stmt::store("out", value, Expr::var("x"), Expr::bool(true));
        Stmt::for_loop(
            "x",
            Expr::int(0),
            Expr::var("n"),
            crate::ir::ForType::Serial,
            crate::ir::DeviceApi::None,
            store,
        )
    }

    #[test]
    fn free_symbols_skip_bound_names() {
        let s = Stmt::let_stmt("n", Expr::int(4), body());
        let free = FreeSymbols::of(&s);
        assert_eq!(free.scalars.keys().collect::<Vec<_>>(), vec!["k"]);
        let input = &free.buffers["input"];
        assert_eq!(input.ty, Some(Type::f32()));
        assert!(!input.stored);
        assert!(free.buffers["out"].stored);
    }

    #[test]
    fn undeclared_parameter_is_named() {
        let ctx = ctx_with(vec![Argument::input_buffer("input", Type::f32(), 1)]);
        let s = Stmt::let_stmt("n", Expr::int(4), body());
        let err = infer_arguments(&s, &ctx).unwrap_err();
        assert_eq!(err.code(), Some("E0501"));
        assert!(err.to_string().contains("`k`"), "{}", err);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let ctx = ctx_with(vec![
            Argument::scalar("k", Type::f32()),
            Argument::scalar("k", Type::f32()),
        ]);
        let err = infer_arguments(&Stmt::no_op(), &ctx).unwrap_err();
        assert_eq!(err.code(), Some("E0502"));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let ctx = ctx_with(vec![
            Argument::scalar("input", Type::f32()),
            Argument::scalar("k", Type::f32()),
            Argument::scalar("n", Type::i32()),
        ]);
        let err = infer_arguments(&body(), &ctx).unwrap_err();
        assert_eq!(err.code(), Some("E0502"));
    }

    #[test]
    fn user_context_is_implicit() {
        let s = Stmt::evaluate(Expr::var_of(Type::handle(), USER_CONTEXT));
        let (args, embedded) = infer_arguments(&s, &ctx_with(Vec::new())).unwrap();
        assert!(args.is_empty());
        assert!(embedded.is_empty());
    }
}
