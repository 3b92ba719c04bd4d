// ir/mod.rs - Expression and statement IR
//
// Immutable, reference-counted trees. Every lowering pass is a function from
// `Stmt` to `Stmt`; rewrites go through `IrMutator`, analyses through
// `IrVisitor`.

pub mod expr;
pub mod interval;
pub mod printer;
pub mod scope;
pub mod simplify;
pub mod stmt;
pub mod substitute;
pub mod types;
pub mod visit;

pub use expr::{intrinsics, match_types, BinOp, CallType, CmpOp, Expr, ExprNode, Range};
pub use interval::{bounds_of_expr_in_scope, Interval};
pub use scope::Scope;
pub use simplify::{can_prove, const_int_value, simplify, simplify_stmt};
pub use stmt::{DeviceApi, ForType, MemoryType, Stmt, StmtNode};
pub use substitute::{
    rename_calls, substitute, substitute_expr, substitute_map, substitute_map_stmt,
    substitute_stmt,
};
pub use types::{Type, TypeCode};
pub use visit::{
    expr_uses_var, expr_uses_vars, halide_calls_in_expr, halide_calls_in_stmt,
    is_buffer_field_of, mutate_expr_children, mutate_stmt_children, split_buffer_field,
    stmt_uses_buffer, stmt_uses_var, vars_in_expr, visit_expr_children, visit_stmt_children,
    IrMutator, IrVisitor,
};
