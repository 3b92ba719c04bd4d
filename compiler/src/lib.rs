// lnc - LoopNest Compiler
//
// Library root. A pipeline of functions is defined and scheduled through
// `func` and `schedule`, then lowered by `lower` into a loop-nest `Module`
// of `ir` statements. `interp` executes lowered IR for checking.

pub mod demos;
pub mod diag;
pub mod error;
pub mod func;
pub mod id;
pub mod interp;
pub mod ir;
pub mod lower;
pub mod options;
pub mod schedule;
pub mod target;

pub use error::{Error, Result};
pub use func::{ImageParam, Param, Pipeline, RDom, RVar, TailStrategy, Var};
pub use id::FuncId;
pub use lower::{lower, lower_with_observer, Argument, LoweringPass, Module};
pub use options::LowerOptions;
pub use target::{Feature, Target};
