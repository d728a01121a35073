use crate::store::CallKey;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type EvalResult<T> = Result<T, ComputationError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputationError {
    #[error("Cyclic dependency: {call} was requested while it was still being evaluated")]
    CyclicDependency { key: CallKey, call: String },
    #[error("Recursion exhausted at {call}: nesting depth {depth} exceeds the limit of {limit}; {}", depth_hint(.explicit_stack))]
    RecursionExhausted { key: CallKey, call: String, depth: usize, limit: usize, explicit_stack: bool },
    #[error("Replay diverged at call #{order}: schedule expected {expected}, model called {found}")]
    ReplayDivergence { order: usize, expected: String, found: String },
    #[error("optimize_and_reset({requested}) needs a completed trial pass over the same horizon (last trial: {trial:?})")]
    MisuseBeforeOptimize { requested: usize, trial: Option<usize> },
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
    #[error("Function '{0}' is already registered")]
    DuplicateFunction(String),
    #[error("Function '{name}' called with the wrong arity")]
    ArityMismatch { name: String },
    #[error("Schedule does not match this model: {0}")]
    ScheduleMismatch(String),
    #[error("Model error: {0}")]
    Model(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Control signal of the explicit-stack evaluator: the running body needs
    /// the carried key first. Bodies must propagate it with `?`; it never escapes a pass.
    #[doc(hidden)]
    #[error("evaluation suspended on {0:?}")]
    Suspended(CallKey),
}

fn depth_hint(explicit_stack: &bool) -> &'static str {
    if *explicit_stack { "raise `max_depth`" } else { "raise `max_depth` or use the explicit-stack evaluator" }
}

/// The atomic unit of data in the engine.
/// Scalars avoid heap allocation; series share their buffer on clone.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Series(Arc<Vec<f64>>),
}

impl Value {
    pub fn series(values: Vec<f64>) -> Self { Value::Series(Arc::new(values)) }

    pub fn len(&self) -> usize {
        match self { Value::Scalar(_) => 1, Value::Series(v) => v.len() }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Broadcasting read: a scalar answers every index, a short series repeats its last element.
    #[inline(always)]
    pub fn get_at(&self, i: usize) -> f64 {
        match self {
            Value::Scalar(s) => *s,
            Value::Series(vec) => *vec.get(i).unwrap_or_else(|| vec.last().unwrap_or(&0.0))
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self { Value::Scalar(s) => Some(*s), Value::Series(_) => None }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        match self { Value::Scalar(s) => vec![*s], Value::Series(s) => s.to_vec() }
    }

    /// Approximate heap + inline size, used for resident-size telemetry.
    pub fn footprint(&self) -> usize {
        match self {
            Value::Scalar(_) => std::mem::size_of::<f64>(),
            Value::Series(v) => v.len() * std::mem::size_of::<f64>(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Scalar(v) }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self { Value::series(v) }
}

/// State of one cache entry. An absent key is Uncomputed.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    InProgress,
    Computed(Value),
    Evicted,
}

/// Per-pass cache table. Tracks resident entries so telemetry can report the peak.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    slots: HashMap<CallKey, Slot>,
    resident: usize,
    resident_bytes: usize,
    peak_resident: usize,
    peak_bytes: usize,
}

impl Ledger {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: &CallKey) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn value(&self, key: &CallKey) -> Option<&Value> {
        match self.slots.get(key) {
            Some(Slot::Computed(v)) => Some(v),
            _ => None,
        }
    }

    /// True once the key has been produced in this pass, whether or not it is still resident.
    pub fn is_settled(&self, key: &CallKey) -> bool {
        matches!(self.slots.get(key), Some(Slot::Computed(_)) | Some(Slot::Evicted))
    }

    /// Marks `key` as being evaluated and returns what was there before.
    pub fn mark_in_progress(&mut self, key: CallKey) -> Option<Slot> {
        let previous = self.slots.insert(key, Slot::InProgress);
        if let Some(Slot::Computed(v)) = &previous {
            self.release(v.footprint());
        }
        previous
    }

    pub fn complete(&mut self, key: CallKey, value: Value) {
        let bytes = value.footprint();
        if let Some(Slot::Computed(old)) = self.slots.insert(key, Slot::Computed(value)) {
            self.release(old.footprint());
        }
        self.resident += 1;
        self.resident_bytes += bytes;
        self.peak_resident = self.peak_resident.max(self.resident);
        self.peak_bytes = self.peak_bytes.max(self.resident_bytes);
    }

    /// Drops the value held for `key`. Returns false if nothing was resident.
    pub fn evict(&mut self, key: &CallKey) -> bool {
        let Some(slot) = self.slots.get_mut(key) else { return false };
        if !matches!(slot, Slot::Computed(_)) {
            return false;
        }
        if let Slot::Computed(v) = std::mem::replace(slot, Slot::Evicted) {
            self.release(v.footprint());
        }
        true
    }

    fn release(&mut self, bytes: usize) {
        self.resident -= 1;
        self.resident_bytes -= bytes;
    }

    pub fn resident(&self) -> usize { self.resident }
    pub fn resident_bytes(&self) -> usize { self.resident_bytes }
    pub fn peak_resident(&self) -> usize { self.peak_resident }
    pub fn peak_bytes(&self) -> usize { self.peak_bytes }
}
