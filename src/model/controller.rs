//! The projection controller: drives full passes over a registry and owns
//! everything that outlives a single pass.

use crate::analysis::last_use::{analyze, DependencyGraph};
use crate::analysis::schedule::ReleaseSchedule;
use crate::analysis::telemetry::{MissCounter, PassKind, PassStats};
use crate::analysis::trace::ExecutionTrace;
use crate::compute::engine::{PassOutput, PassState};
use crate::compute::ledger::{ComputationError, EvalResult, Value};
use crate::display::trace::format_call_tree;
use crate::model::config::{ModelConfig, ReplayCheck};
use crate::store::{CallKey, Registry, ResultStore};
use std::sync::Arc;

/// Called with the model data before the first call or after the last call of a pass.
pub type Hook<D> = Box<dyn FnMut(&mut D, PassKind) + Send>;

pub struct Model<D> {
    registry: Arc<Registry<D>>,
    data: D,
    config: ModelConfig,

    results: ResultStore,
    schedule: Option<Arc<ReleaseSchedule>>,

    // Last successful trial pass.
    trace: Option<ExecutionTrace>,
    trial_horizon: Option<usize>,

    stats: Option<PassStats>,
    misses: MissCounter,

    pre_hook: Option<Hook<D>>,
    post_hook: Option<Hook<D>>,
}

impl<D> Model<D> {
    /// Builds a model and, if `config.auto_run` is set, runs one trial pass over
    /// `config.horizon`.
    pub fn new(registry: impl Into<Arc<Registry<D>>>, data: D, config: ModelConfig) -> EvalResult<Self> {
        let mut model = Self {
            registry: registry.into(),
            data,
            config,
            results: ResultStore::new(),
            schedule: None,
            trace: None,
            trial_horizon: None,
            stats: None,
            misses: MissCounter::default(),
            pre_hook: None,
            post_hook: None,
        };
        if model.config.auto_run {
            model.run(model.config.horizon)?;
        }
        Ok(model)
    }

    pub fn with_pre_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut D, PassKind) + Send + 'static,
    {
        self.pre_hook = Some(Box::new(hook));
        self
    }

    pub fn with_post_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut D, PassKind) + Send + 'static,
    {
        self.post_hook = Some(Box::new(hook));
        self
    }

    /// One full pass over `0..=horizon`: a trial pass without a schedule, a
    /// production pass with one.
    ///
    /// Results are committed only if the whole pass succeeds. A failed pass
    /// leaves the result store untouched and forgets the last trial.
    pub fn run(&mut self, horizon: usize) -> EvalResult<PassStats> {
        let kind = if self.schedule.is_some() { PassKind::Production } else { PassKind::Trial };

        if let Some(schedule) = &self.schedule {
            if schedule.horizon() != horizon && self.config.replay == ReplayCheck::Off {
                tracing::warn!(
                    scheduled = schedule.horizon(),
                    requested = horizon,
                    "running a production pass over a different horizon than the schedule was built for"
                );
            }
        }

        tracing::info!(?kind, horizon, mode = ?self.config.mode, "starting pass");
        if let Some(hook) = self.pre_hook.as_mut() {
            hook(&mut self.data, kind);
        }

        let output = match self.drive(horizon) {
            Ok(output) => output,
            Err(e) => {
                self.trace = None;
                self.trial_horizon = None;
                tracing::warn!(?kind, horizon, error = %e, "pass failed, nothing committed");
                return Err(e);
            }
        };

        if let Some(hook) = self.post_hook.as_mut() {
            hook(&mut self.data, kind);
        }
        Ok(self.commit(horizon, output))
    }

    fn drive(&self, horizon: usize) -> EvalResult<PassOutput> {
        let registry = &*self.registry;
        let mut pass = PassState::new(horizon, &self.config, self.schedule.clone());

        let constants = registry.constants().map(CallKey::constant);
        let steps = (0..=horizon as i64).flat_map(move |t| registry.timesteps().map(move |f| CallKey::step(f, t)));
        for key in constants.chain(steps) {
            // Already produced as somebody's dependency, resident or evicted.
            if pass.is_settled(&key) {
                continue;
            }
            pass.evaluate(registry, &self.data, key)?;
        }

        pass.verify_replay_complete(registry)?;
        Ok(pass.into_output())
    }

    fn commit(&mut self, horizon: usize, output: PassOutput) -> PassStats {
        let PassOutput { results, trace, stats, misses } = output;
        tracing::info!(
            kind = ?stats.kind,
            events = stats.events,
            evictions = stats.evictions,
            peak_resident = stats.peak_resident,
            "pass finished"
        );
        tracing::debug!(?stats, "pass statistics");
        if misses.max() > 1 {
            tracing::debug!(worst = misses.max(), "some values were computed more than once");
        }

        self.results.merge(results);
        if let Some(trace) = trace {
            self.trace = Some(trace);
            self.trial_horizon = Some(horizon);
        }
        self.misses = misses;
        self.stats = Some(stats.clone());
        stats
    }

    /// Turns the last trial pass into a release schedule and attaches it.
    ///
    /// Requires a completed trial over the same `horizon`. The trial's results are
    /// discarded; the next `run` is a production pass.
    pub fn optimize_and_reset(&mut self, horizon: usize) -> EvalResult<&ReleaseSchedule> {
        let trace = match (&self.trace, self.trial_horizon) {
            (Some(trace), Some(trial)) if trial == horizon => trace,
            _ => return Err(ComputationError::MisuseBeforeOptimize { requested: horizon, trial: self.trial_horizon }),
        };

        let table = analyze(trace)?;
        let schedule = ReleaseSchedule::compile(&table, trace, horizon, self.registry.fingerprint());
        tracing::info!(horizon, keys = schedule.scheduled_keys(), calls = schedule.call_count(), "release schedule compiled");

        self.results.clear();
        Ok(&**self.schedule.insert(Arc::new(schedule)))
    }

    /// Attaches a schedule compiled elsewhere, e.g. loaded from disk.
    pub fn attach_schedule(&mut self, schedule: impl Into<Arc<ReleaseSchedule>>) -> EvalResult<()> {
        let schedule = schedule.into();
        schedule.validate_for(&self.registry)?;
        tracing::info!(horizon = schedule.horizon(), keys = schedule.scheduled_keys(), "release schedule attached");
        self.schedule = Some(schedule);
        Ok(())
    }

    pub fn detach_schedule(&mut self) -> Option<Arc<ReleaseSchedule>> {
        self.schedule.take()
    }

    pub fn schedule(&self) -> Option<&ReleaseSchedule> { self.schedule.as_deref() }

    pub fn shared_schedule(&self) -> Option<Arc<ReleaseSchedule>> { self.schedule.clone() }

    /// Drops results, schedule, trace and statistics.
    pub fn reset(&mut self) {
        self.results.clear();
        self.schedule = None;
        self.trace = None;
        self.trial_horizon = None;
        self.stats = None;
        self.misses = MissCounter::default();
    }

    /// Stored values of `name`: argument order for timestep functions, a single
    /// entry for constants.
    pub fn query(&self, name: &str) -> EvalResult<Vec<Value>> {
        Ok(self.results.query(self.registry.id(name)?))
    }

    pub fn result(&self, name: &str, arg: Option<i64>) -> EvalResult<Option<&Value>> {
        let key = self.registry.key(name, arg)?;
        Ok(self.results.get(&key))
    }

    /// Element-wise sum of everything stored for `name`.
    pub fn aggregate(&self, name: &str) -> EvalResult<Option<Value>> {
        Ok(self.results.aggregate(self.registry.id(name)?))
    }

    pub fn aggregate_with<F>(&self, name: &str, fold: F) -> EvalResult<Option<Value>>
    where
        F: Fn(Value, &Value) -> Value,
    {
        Ok(self.results.aggregate_with(self.registry.id(name)?, fold))
    }

    pub fn results(&self) -> &ResultStore { &self.results }

    pub fn into_results(self) -> ResultStore { self.results }

    pub fn registry(&self) -> &Arc<Registry<D>> { &self.registry }
    pub fn config(&self) -> &ModelConfig { &self.config }

    pub fn data(&self) -> &D { &self.data }
    pub fn data_mut(&mut self) -> &mut D { &mut self.data }

    /// Swaps in new data for later passes and returns the old one.
    pub fn replace_data(&mut self, data: D) -> D {
        std::mem::replace(&mut self.data, data)
    }

    pub fn trace(&self) -> Option<&ExecutionTrace> { self.trace.as_ref() }

    /// Statistics of the last successful pass.
    pub fn stats(&self) -> Option<&PassStats> { self.stats.as_ref() }

    pub fn cache_misses(&self) -> &MissCounter { &self.misses }

    pub fn timestep_functions(&self) -> Vec<&str> { self.registry.timestep_functions() }
    pub fn constant_functions(&self) -> Vec<&str> { self.registry.constant_functions() }

    pub fn dependency_graph(&self) -> EvalResult<DependencyGraph> {
        let trace = self.trace.as_ref().ok_or_else(|| ComputationError::Model("no trial pass recorded".into()))?;
        DependencyGraph::from_trace(trace)
    }

    /// Audit rendering of the last trial's call forest.
    pub fn call_tree(&self) -> Option<String> {
        self.trace.as_ref().map(|trace| format_call_tree(&self.registry, trace))
    }
}
