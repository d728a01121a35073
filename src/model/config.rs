//! Model configuration.

use crate::compute::ledger::{ComputationError, EvalResult};
use crate::store::Aggregation;
use serde::{Deserialize, Serialize};

/// Nesting limit applied when none is configured.
pub const DEFAULT_MAX_DEPTH: usize = 1_000;

/// How nested calls are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvalMode {
    /// Native recursion. Simplest and fastest, bounded by the thread's stack.
    #[default]
    Recursive,
    /// Heap-allocated work stack. A body that misses the cache is suspended and
    /// replayed once the missing value exists; deep look-ahead chains only cost heap.
    ExplicitStack,
}

/// Whether a production pass verifies that it replays the trial's call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayCheck {
    /// Divergence goes unnoticed: evicted values are recomputed, and a value can
    /// be dropped while still needed.
    #[default]
    Off,
    /// Every call is compared against the schedule's recorded order; the first
    /// mismatch fails the pass.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Last timestep evaluated; passes cover `0..=horizon`.
    pub horizon: usize,

    /// Run one pass over `horizon` as soon as the model is built.
    pub auto_run: bool,

    pub mode: EvalMode,

    pub replay: ReplayCheck,

    /// Deepest allowed nesting of calls before `RecursionExhausted`.
    pub max_depth: usize,

    /// Reduction applied before storing results, unless a function overrides it.
    #[serde(skip)]
    pub aggregation: Aggregation,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            horizon: 0,
            auto_run: false,
            mode: EvalMode::Recursive,
            replay: ReplayCheck::Off,
            max_depth: DEFAULT_MAX_DEPTH,
            aggregation: Aggregation::Identity,
        }
    }
}

impl ModelConfig {
    pub fn new(horizon: usize) -> Self {
        Self { horizon, ..Self::default() }
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    pub fn with_mode(mut self, mode: EvalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_replay_check(mut self, replay: ReplayCheck) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Reads the serialisable fields; the aggregation stays at its default.
    pub fn from_json(json: &str) -> EvalResult<Self> {
        serde_json::from_str(json).map_err(|e| ComputationError::Serialization(e.to_string()))
    }
}
