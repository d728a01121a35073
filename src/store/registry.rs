use super::results::Aggregation;
use super::types::*;
use crate::compute::engine::Ctx;
use crate::compute::ledger::{ComputationError, EvalResult, Value};
use std::collections::HashMap;
use std::fmt;

pub type ConstantFn<D> = dyn Fn(&mut Ctx<'_, D>) -> EvalResult<Value> + Send + Sync;
pub type TimestepFn<D> = dyn Fn(&mut Ctx<'_, D>, i64) -> EvalResult<Value> + Send + Sync;

pub enum Body<D> {
    Constant(Box<ConstantFn<D>>),
    Timestep(Box<TimestepFn<D>>),
}

/// The static set of functions a model is made of.
///
/// Registration order is the evaluation order the controller uses for every pass,
/// so two registries built by the same code produce interchangeable schedules.
pub struct Registry<D> {
    // Columnar Arrays
    meta: Vec<FunctionMeta>,
    bodies: Vec<Body<D>>,
    aggregations: Vec<Option<Aggregation>>,

    by_name: HashMap<String, FuncId>,
}

impl<D> Default for Registry<D> {
    fn default() -> Self {
        Self { meta: Vec::new(), bodies: Vec::new(), aggregations: Vec::new(), by_name: HashMap::new() }
    }
}

impl<D> fmt::Debug for Registry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("functions", &self.meta).finish()
    }
}

impl<D> Registry<D> {
    pub fn new() -> Self { Self::default() }
    pub fn count(&self) -> usize { self.meta.len() }

    /// Registers a zero-argument function, evaluated once per pass.
    pub fn constant<F>(&mut self, name: &str, body: F) -> EvalResult<FuncId>
    where
        F: Fn(&mut Ctx<'_, D>) -> EvalResult<Value> + Send + Sync + 'static,
    {
        self.add(name, Arity::Constant, Body::Constant(Box::new(body)))
    }

    /// Registers a function of one integer timestep, evaluated for `0..=horizon`.
    pub fn timestep<F>(&mut self, name: &str, body: F) -> EvalResult<FuncId>
    where
        F: Fn(&mut Ctx<'_, D>, i64) -> EvalResult<Value> + Send + Sync + 'static,
    {
        self.add(name, Arity::Timestep, Body::Timestep(Box::new(body)))
    }

    fn add(&mut self, name: &str, arity: Arity, body: Body<D>) -> EvalResult<FuncId> {
        if self.by_name.contains_key(name) {
            return Err(ComputationError::DuplicateFunction(name.to_string()));
        }
        let id = FuncId::new(self.meta.len());
        self.by_name.insert(name.to_string(), id);
        self.meta.push(FunctionMeta { name: name.to_string(), arity });
        self.bodies.push(body);
        self.aggregations.push(None);
        Ok(id)
    }

    /// Overrides the model-wide aggregation for one function's stored results.
    pub fn set_aggregation(&mut self, id: FuncId, aggregation: Aggregation) -> EvalResult<()> {
        let slot = self.aggregations
            .get_mut(id.index())
            .ok_or_else(|| ComputationError::UnknownFunction(format!("{:?}", id)))?;
        *slot = Some(aggregation);
        Ok(())
    }

    pub fn aggregation(&self, id: FuncId) -> Option<&Aggregation> {
        self.aggregations.get(id.index())?.as_ref()
    }

    pub fn id(&self, name: &str) -> EvalResult<FuncId> {
        self.by_name.get(name).copied().ok_or_else(|| ComputationError::UnknownFunction(name.to_string()))
    }

    #[inline(always)]
    pub fn meta(&self, id: FuncId) -> &FunctionMeta { &self.meta[id.index()] }

    pub fn name(&self, id: FuncId) -> &str { &self.meta[id.index()].name }

    pub(crate) fn body(&self, id: FuncId) -> &Body<D> { &self.bodies[id.index()] }

    pub fn label(&self, key: CallKey) -> CallLabel<'_> {
        CallLabel { name: self.name(key.func), arg: key.arg }
    }

    /// Builds the key for `name` at `arg`, checking the arity.
    pub fn key(&self, name: &str, arg: Option<i64>) -> EvalResult<CallKey> {
        let func = self.id(name)?;
        self.checked_key(func, arg)
    }

    pub fn checked_key(&self, func: FuncId, arg: Option<i64>) -> EvalResult<CallKey> {
        let meta = self.meta.get(func.index()).ok_or_else(|| ComputationError::UnknownFunction(format!("{:?}", func)))?;
        match (meta.arity, arg) {
            (Arity::Constant, None) | (Arity::Timestep, Some(_)) => Ok(CallKey { func, arg }),
            _ => Err(ComputationError::ArityMismatch { name: meta.name.clone() }),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        (0..self.meta.len()).map(FuncId::new)
    }

    pub fn constants(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.ids().filter(|&id| self.meta(id).arity == Arity::Constant)
    }

    pub fn timesteps(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.ids().filter(|&id| self.meta(id).arity == Arity::Timestep)
    }

    pub fn timestep_functions(&self) -> Vec<&str> {
        self.timesteps().map(|id| self.name(id)).collect()
    }

    pub fn constant_functions(&self) -> Vec<&str> {
        self.constants().map(|id| self.name(id)).collect()
    }

    /// Names in registration order; a schedule is only valid for a registry with the same fingerprint.
    pub fn fingerprint(&self) -> Vec<String> {
        self.meta.iter().map(|m| m.name.clone()).collect()
    }
}
