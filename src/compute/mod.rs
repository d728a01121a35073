//! Evaluation: cache ledger, value kernels and the pass evaluator.
pub mod engine;
pub mod kernel;
pub mod ledger;

pub use engine::{Ctx, PassOutput, PassState};
pub use kernel::OpCode;
pub use ledger::{ComputationError, EvalResult, Ledger, Slot, Value};
