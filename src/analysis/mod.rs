//! Trace recording, last-use analysis, release scheduling and pass telemetry.
pub mod last_use;
pub mod schedule;
pub mod telemetry;
pub mod trace;

pub use last_use::{analyze, DependencyGraph, LastUseTable};
pub use schedule::ReleaseSchedule;
pub use telemetry::{MissCounter, PassKind, PassStats};
pub use trace::{CallEvent, Edge, ExecutionTrace};
