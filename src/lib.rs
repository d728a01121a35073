//! Memory-bounded evaluation of recursive, time-indexed projection models.
//!
//! A model is a set of named functions of an integer timestep (or of nothing)
//! that call each other through a memoizing evaluator. A first, trial pass records
//! which call reads which; from that trace a release schedule is compiled, and later
//! production passes drop every cached value right after its last reader finishes.
//!
//! ```
//! use projection_core::{Model, ModelConfig, Registry, Value};
//!
//! let mut reg: Registry<()> = Registry::new();
//! reg.timestep("f", |_, t| Ok(Value::Scalar(t as f64)))?;
//! reg.timestep("g", |ctx, t| {
//!     let f = ctx.get("f", t)?;
//!     if t == 0 { return Ok(f); }
//!     Ok(f + ctx.get("g", t - 1)?)
//! })?;
//!
//! let mut model = Model::new(reg, (), ModelConfig::new(3).with_auto_run(true))?;
//! model.optimize_and_reset(3)?;
//! model.run(3)?;
//! assert_eq!(model.query("g")?.last(), Some(&Value::Scalar(6.0)));
//! # Ok::<(), projection_core::ComputationError>(())
//! ```

pub mod analysis;
pub mod compute;
pub mod display;
pub mod model;
pub mod store;

pub use analysis::{DependencyGraph, ExecutionTrace, LastUseTable, MissCounter, PassKind, PassStats, ReleaseSchedule};
pub use compute::{ComputationError, Ctx, EvalResult, Value};
pub use model::{run_scenarios, EvalMode, Model, ModelConfig, ReplayCheck};
pub use store::{Aggregation, CallKey, FuncId, Registry, ResultStore};
