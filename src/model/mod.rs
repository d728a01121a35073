//! Model configuration, the projection controller and scenario fan-out.
pub mod config;
pub mod controller;
pub mod scenario;

pub use config::{EvalMode, ModelConfig, ReplayCheck, DEFAULT_MAX_DEPTH};
pub use controller::{Hook, Model};
pub use scenario::run_scenarios;
