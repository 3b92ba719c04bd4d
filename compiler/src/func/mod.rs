// func/mod.rs - The function model
//
// Functions, their definitions (pure, update, specialization), the
// scheduling records attached to each, and the `Pipeline` arena that owns
// them.

pub mod definition;
pub mod function;
pub mod pipeline;
pub mod schedule;
pub mod var;

pub use definition::{Definition, Specialization};
pub use function::{ExternDefinition, Function, TraceFlags};
pub use pipeline::{ConstBuffer, ImageParam, Param, Pipeline};
pub use schedule::{
    Bound, Dim, DimKind, FuncSchedule, FuseLoopLevel, LoopAlignStrategy, LoopLevel, Split,
    StageSchedule, TailStrategy,
};
pub use var::{var_name_match, RDom, RVar, ReductionVariable, Var, VarOrRVar, OUTERMOST};
