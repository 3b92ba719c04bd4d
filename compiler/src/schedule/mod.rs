// schedule/mod.rs - Stage scheduling primitives
//
// `Stage` edits the per-definition schedule records in `func::schedule`.
// `split` turns those records back into loop-variable definitions during
// lowering and for rfactor; `associativity` decides which reduction
// reorderings preserve meaning.

pub mod associativity;
pub mod rfactor;
pub mod split;
pub mod stage;

pub use associativity::{
    self_call_args, AssociativeOp, AssociativityProver, PatternProver, Replacement,
};
pub use split::{
    apply_split, loop_bounds_after_split, ApplySplitResult, ExtentAlignment, SplitResultKind,
};
pub use stage::Stage;
