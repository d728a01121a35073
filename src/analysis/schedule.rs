//! Compiles a last-use table into a release plan: for each completion index,
//! the cache keys that are dead once that call has finished.

use super::last_use::LastUseTable;
use super::trace::ExecutionTrace;
use crate::compute::ledger::{ComputationError, EvalResult};
use crate::store::{CallKey, Registry};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fs;
use std::path::Path;

pub type Bucket = SmallVec<[CallKey; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSchedule {
    horizon: usize,
    /// Function names of the registry the trace came from, in registration order.
    functions: Vec<String>,
    /// Indexed by completion index.
    buckets: Vec<Bucket>,
    /// Keys in the start order of the trial pass; used by strict replay checking.
    call_order: Vec<CallKey>,
}

impl ReleaseSchedule {
    /// Buckets are filled in the table's first-production order, so the same
    /// trace always yields the same schedule.
    pub fn compile(table: &LastUseTable, trace: &ExecutionTrace, horizon: usize, functions: Vec<String>) -> Self {
        let mut buckets: Vec<Bucket> = vec![Bucket::new(); trace.completion_order().len()];
        for (key, last) in table.iter() {
            if last >= buckets.len() {
                buckets.resize(last + 1, Bucket::new());
            }
            buckets[last].push(key);
        }
        let call_order = trace.events().iter().map(|e| e.key).collect();
        Self { horizon, functions, buckets, call_order }
    }

    pub fn horizon(&self) -> usize { self.horizon }
    pub fn functions(&self) -> &[String] { &self.functions }

    /// Keys to evict right after the call with this completion index finishes.
    #[inline]
    pub fn releases_at(&self, completion: usize) -> &[CallKey] {
        self.buckets.get(completion).map(|b| b.as_slice()).unwrap_or(&[])
    }

    /// Completion index at which `key` is released, if it is scheduled at all.
    pub fn release_index(&self, key: &CallKey) -> Option<usize> {
        self.buckets.iter().position(|b| b.contains(key))
    }

    pub fn expected_call(&self, order: usize) -> Option<CallKey> {
        self.call_order.get(order).copied()
    }

    pub fn call_count(&self) -> usize { self.call_order.len() }

    pub fn scheduled_keys(&self) -> usize { self.buckets.iter().map(|b| b.len()).sum() }

    /// Rejects a schedule that was compiled against a differently shaped registry.
    pub fn validate_for<D>(&self, registry: &Registry<D>) -> EvalResult<()> {
        let ours = registry.fingerprint();
        if ours != self.functions {
            return Err(ComputationError::ScheduleMismatch(format!(
                "schedule functions {:?}, model functions {:?}", self.functions, ours
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> EvalResult<String> {
        serde_json::to_string(self).map_err(|e| ComputationError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> EvalResult<Self> {
        serde_json::from_str(json).map_err(|e| ComputationError::Serialization(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> EvalResult<()> {
        fs::write(path, self.to_json()?).map_err(|e| ComputationError::Serialization(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> EvalResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| ComputationError::Serialization(e.to_string()))?;
        Self::from_json(&json)
    }
}
