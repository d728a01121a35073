//! Durable per-call output, kept independently of the cache's lifetime.

use super::types::{CallKey, FuncId};
use crate::compute::ledger::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// How a freshly computed value is reduced before it is stored for reporting.
#[derive(Clone, Default)]
pub enum Aggregation {
    /// Store the value as computed.
    #[default]
    Identity,
    /// Collapse series to their total.
    Sum,
    /// Store nothing for this function.
    Skip,
    Custom(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl Aggregation {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Aggregation::Custom(Arc::new(f))
    }

    pub fn apply(&self, value: &Value) -> Option<Value> {
        match self {
            Aggregation::Identity => Some(value.clone()),
            Aggregation::Sum => Some(Value::Scalar(value.total())),
            Aggregation::Skip => None,
            Aggregation::Custom(f) => Some(f(value)),
        }
    }
}

impl fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Identity => f.write_str("Identity"),
            Aggregation::Sum => f.write_str("Sum"),
            Aggregation::Skip => f.write_str("Skip"),
            Aggregation::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Append-only map of (function, argument) to stored value.
///
/// Keys sort constants (`None`) before steps and steps ascending, so a query is a
/// plain in-order walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultStore {
    entries: BTreeMap<FuncId, BTreeMap<Option<i64>, Value>>,
}

impl ResultStore {
    pub fn new() -> Self { Self::default() }

    /// Reduces `value` and stores it under `key`, replacing any earlier value.
    pub fn record(&mut self, key: CallKey, value: &Value, aggregation: &Aggregation) {
        if let Some(stored) = aggregation.apply(value) {
            self.entries.entry(key.func).or_default().insert(key.arg, stored);
        }
    }

    pub fn get(&self, key: &CallKey) -> Option<&Value> {
        self.entries.get(&key.func)?.get(&key.arg)
    }

    /// Stored values for `func` in argument order; a constant yields one element.
    pub fn query(&self, func: FuncId) -> Vec<Value> {
        self.entries.get(&func).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// Arguments that have a stored value for `func`.
    pub fn arguments(&self, func: FuncId) -> Vec<Option<i64>> {
        self.entries.get(&func).map(|m| m.keys().copied().collect()).unwrap_or_default()
    }

    /// Element-wise sum of every stored value of `func`; `None` if nothing is stored.
    pub fn aggregate(&self, func: FuncId) -> Option<Value> {
        self.aggregate_with(func, |acc, v| &acc + v)
    }

    pub fn aggregate_with<F>(&self, func: FuncId, fold: F) -> Option<Value>
    where
        F: Fn(Value, &Value) -> Value,
    {
        let mut values = self.entries.get(&func)?.values();
        let first = values.next()?.clone();
        Some(values.fold(first, fold))
    }

    /// Commits a finished pass: its values overwrite ours key by key.
    pub fn merge(&mut self, other: ResultStore) {
        for (func, values) in other.entries {
            self.entries.entry(func).or_default().extend(values);
        }
    }

    pub fn clear(&mut self) { self.entries.clear(); }

    pub fn len(&self) -> usize { self.entries.values().map(|m| m.len()).sum() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
