//! A synchronous, single-threaded memoizing evaluator.
//!
//! One `PassState` owns the cache, the trace and the staged results of a single
//! pass. Bodies see it through a `Ctx`, whose reads go through the cache and are
//! recorded as dependency edges.
//!
//! Two drivers share the same bookkeeping and therefore the same call order:
//! - `Recursive`: a miss evaluates the callee on the native stack.
//! - `ExplicitStack`: a miss suspends the running body with `Suspended(key)`; the
//!   driver evaluates the callee on a heap stack and then re-runs the body. Each
//!   frame logs the values it has already read and serves them back on re-run, so
//!   a re-run never touches the cache for reads it already made. The suspension is
//!   also flagged on the frame, so a body that swallows the error cannot commit a
//!   fallback value in place of the real one.

use crate::analysis::schedule::ReleaseSchedule;
use crate::analysis::telemetry::{MissCounter, PassKind, PassStats};
use crate::analysis::trace::{CallEvent, ExecutionTrace};
use crate::compute::ledger::{ComputationError, EvalResult, Ledger, Slot, Value};
use crate::model::config::{EvalMode, ModelConfig, ReplayCheck};
use crate::store::{Aggregation, Body, CallKey, FuncId, Registry, ResultStore};
use std::sync::Arc;

// Recursive bodies grow the native stack in segments once less than this is left.
const RED_ZONE: usize = 128 * 1024;
const STACK_SEGMENT: usize = 2 * 1024 * 1024;

/// Everything a finished pass hands back to its controller.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub results: ResultStore,
    pub trace: Option<ExecutionTrace>,
    pub stats: PassStats,
    pub misses: MissCounter,
}

pub struct PassState {
    ledger: Ledger,
    trace: Option<ExecutionTrace>,
    schedule: Option<Arc<ReleaseSchedule>>,
    strict: bool,
    mode: EvalMode,
    max_depth: usize,
    aggregation: Aggregation,

    // Orders of the calls currently open, innermost last.
    stack: Vec<usize>,
    next_order: usize,
    next_completion: usize,

    results: ResultStore,
    stats: PassStats,
    misses: MissCounter,
}

impl PassState {
    /// A pass without a schedule is a trial and records its trace; a pass with
    /// one is a production pass and applies it.
    pub fn new(horizon: usize, config: &ModelConfig, schedule: Option<Arc<ReleaseSchedule>>) -> Self {
        let kind = if schedule.is_some() { PassKind::Production } else { PassKind::Trial };
        Self {
            ledger: Ledger::new(),
            trace: matches!(kind, PassKind::Trial).then(ExecutionTrace::new),
            strict: config.replay == ReplayCheck::Strict && schedule.is_some(),
            schedule,
            mode: config.mode,
            max_depth: config.max_depth,
            aggregation: config.aggregation.clone(),
            stack: Vec::new(),
            next_order: 0,
            next_completion: 0,
            results: ResultStore::new(),
            stats: PassStats::new(kind, horizon),
            misses: MissCounter::default(),
        }
    }

    pub fn kind(&self) -> PassKind { self.stats.kind }
    pub fn ledger(&self) -> &Ledger { &self.ledger }

    /// True once `key` was produced in this pass, resident or not.
    pub fn is_settled(&self, key: &CallKey) -> bool { self.ledger.is_settled(key) }

    /// Evaluates `key` with no caller, as the controller does.
    pub fn evaluate<D>(&mut self, registry: &Registry<D>, data: &D, key: CallKey) -> EvalResult<Value> {
        if let Some(v) = self.lookup(registry, key)? {
            return Ok(v);
        }
        match self.mode {
            EvalMode::Recursive => {
                let mut ctx = Ctx { registry, data, pass: &mut *self, frame: None };
                ctx.compute(key)
            }
            EvalMode::ExplicitStack => self.run_stacked(registry, data, key),
        }
    }

    /// In strict mode, a pass that stops short of the recorded call count diverged too.
    pub fn verify_replay_complete<D>(&self, registry: &Registry<D>) -> EvalResult<()> {
        let Some(schedule) = self.schedule.as_ref().filter(|_| self.strict) else { return Ok(()) };
        if self.next_order != schedule.call_count() {
            return Err(ComputationError::ReplayDivergence {
                order: self.next_order,
                expected: schedule.expected_call(self.next_order)
                    .map(|k| registry.label(k).to_string())
                    .unwrap_or_else(|| "<end of schedule>".into()),
                found: "<end of pass>".into(),
            });
        }
        Ok(())
    }

    pub fn into_output(mut self) -> PassOutput {
        self.stats.peak_resident = self.ledger.peak_resident();
        self.stats.peak_resident_bytes = self.ledger.peak_bytes();
        self.stats.final_resident = self.ledger.resident();
        PassOutput { results: self.results, trace: self.trace, stats: self.stats, misses: self.misses }
    }

    /// A read by the innermost open call: records the edge, then answers from cache.
    /// `Ok(None)` is a miss the caller has to resolve.
    fn lookup<D>(&mut self, registry: &Registry<D>, key: CallKey) -> EvalResult<Option<Value>> {
        if let (Some(trace), Some(&caller)) = (self.trace.as_mut(), self.stack.last()) {
            trace.push_edge(caller, key);
        }
        match self.ledger.get(&key) {
            Some(Slot::Computed(v)) => {
                self.stats.cache_hits += 1;
                Ok(Some(v.clone()))
            }
            Some(Slot::InProgress) => Err(ComputationError::CyclicDependency {
                key,
                call: registry.label(key).to_string(),
            }),
            Some(Slot::Evicted) | None => {
                self.stats.cache_misses += 1;
                self.misses.record(key);
                Ok(None)
            }
        }
    }

    /// Opens a call event for `key` and returns its order.
    fn begin<D>(&mut self, registry: &Registry<D>, key: CallKey) -> EvalResult<usize> {
        let depth = self.stack.len() + 1;
        if depth > self.max_depth {
            return Err(ComputationError::RecursionExhausted {
                key,
                call: registry.label(key).to_string(),
                depth,
                limit: self.max_depth,
                explicit_stack: self.mode == EvalMode::ExplicitStack,
            });
        }

        let order = self.next_order;
        if let Some(schedule) = self.schedule.as_ref().filter(|_| self.strict) {
            let expected = schedule.expected_call(order);
            if expected != Some(key) {
                return Err(ComputationError::ReplayDivergence {
                    order,
                    expected: expected
                        .map(|k| registry.label(k).to_string())
                        .unwrap_or_else(|| "<end of schedule>".into()),
                    found: registry.label(key).to_string(),
                });
            }
        }

        if let Some(Slot::Evicted) = self.ledger.mark_in_progress(key) {
            self.stats.recomputations += 1;
            tracing::debug!(call = %registry.label(key), order, "recomputing evicted value");
        }

        self.next_order += 1;
        if let Some(trace) = self.trace.as_mut() {
            trace.push_event(CallEvent { order, key, caller: self.stack.last().copied(), completion: None, depth });
        }
        self.stack.push(order);
        self.stats.events += 1;
        self.stats.max_depth = self.stats.max_depth.max(depth);
        Ok(order)
    }

    /// Closes the innermost call: caches and records its value, then applies the
    /// release bucket for its completion index.
    fn finish<D>(&mut self, registry: &Registry<D>, key: CallKey, order: usize, value: &Value) {
        let closed = self.stack.pop();
        debug_assert_eq!(closed, Some(order));

        let completion = self.next_completion;
        self.next_completion += 1;
        if let Some(trace) = self.trace.as_mut() {
            trace.complete(order, completion);
        }

        let aggregation = registry.aggregation(key.func).unwrap_or(&self.aggregation);
        self.results.record(key, value, aggregation);
        self.ledger.complete(key, value.clone());

        if let Some(schedule) = &self.schedule {
            let released = schedule.releases_at(completion);
            for k in released {
                if self.ledger.evict(k) {
                    self.stats.evictions += 1;
                }
            }
            if !released.is_empty() {
                tracing::trace!(completion, released = released.len(), resident = self.ledger.resident(), "released cache entries");
            }
        }
    }

    fn run_stacked<D>(&mut self, registry: &Registry<D>, data: &D, key: CallKey) -> EvalResult<Value> {
        let order = self.begin(registry, key)?;
        let mut frames = vec![Frame::new(key, order)];

        loop {
            let Some(top) = frames.last_mut() else {
                return Err(ComputationError::Model("explicit stack emptied before its root finished".into()));
            };
            top.cursor = 0;
            let current = top.key;

            let outcome = {
                let mut ctx = Ctx { registry, data, pass: &mut *self, frame: Some(top) };
                ctx.invoke(current)
            };

            // Whatever the body made of it, a flagged suspension means its value is not final.
            let outcome = match frames.last_mut().and_then(|f| f.suspended.take()) {
                Some(dep) => Err(ComputationError::Suspended(dep)),
                None => outcome,
            };

            match outcome {
                Ok(value) => {
                    if let Some(done) = frames.pop() {
                        self.finish(registry, done.key, done.order, &value);
                    }
                    match frames.last_mut() {
                        Some(parent) => parent.resumed = Some((current, value)),
                        None => return Ok(value),
                    }
                }
                Err(ComputationError::Suspended(dep)) => {
                    let order = self.begin(registry, dep)?;
                    frames.push(Frame::new(dep, order));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A suspended body on the explicit stack.
struct Frame {
    key: CallKey,
    order: usize,
    // Values already read by this body, in read order.
    reads: Vec<Value>,
    cursor: usize,
    // The callee that suspended this body, once it has a value.
    resumed: Option<(CallKey, Value)>,
    // Set by the first miss of the current run of the body.
    suspended: Option<CallKey>,
}

impl Frame {
    fn new(key: CallKey, order: usize) -> Self {
        Self { key, order, reads: Vec::new(), cursor: 0, resumed: None, suspended: None }
    }

    fn replay_next(&mut self) -> Option<Value> {
        let v = self.reads.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(v)
    }

    fn take_resumed(&mut self, key: CallKey) -> Option<Value> {
        match self.resumed.take() {
            Some((k, v)) if k == key => {
                self.log(v.clone());
                Some(v)
            }
            other => {
                self.resumed = other;
                None
            }
        }
    }

    fn log(&mut self, value: Value) {
        self.reads.push(value);
        self.cursor += 1;
    }
}

/// What a model body sees: cached access to other functions plus the model data.
pub struct Ctx<'c, D> {
    registry: &'c Registry<D>,
    data: &'c D,
    pass: &'c mut PassState,
    frame: Option<&'c mut Frame>,
}

impl<'c, D> Ctx<'c, D> {
    pub fn data(&self) -> &D { self.data }

    pub fn registry(&self) -> &Registry<D> { self.registry }

    /// Value of timestep function `name` at `t`.
    pub fn get(&mut self, name: &str, t: i64) -> EvalResult<Value> {
        let key = self.registry.key(name, Some(t))?;
        self.demand(key)
    }

    pub fn get_id(&mut self, func: FuncId, t: i64) -> EvalResult<Value> {
        let key = self.registry.checked_key(func, Some(t))?;
        self.demand(key)
    }

    /// Value of zero-argument function `name`.
    pub fn constant(&mut self, name: &str) -> EvalResult<Value> {
        let key = self.registry.key(name, None)?;
        self.demand(key)
    }

    pub fn constant_id(&mut self, func: FuncId) -> EvalResult<Value> {
        let key = self.registry.checked_key(func, None)?;
        self.demand(key)
    }

    /// Like `get`, for functions that produce scalars.
    pub fn scalar(&mut self, name: &str, t: i64) -> EvalResult<f64> {
        self.get(name, t)?
            .as_scalar()
            .ok_or_else(|| ComputationError::Model(format!("{}({}) is not a scalar", name, t)))
    }

    fn demand(&mut self, key: CallKey) -> EvalResult<Value> {
        if let Some(frame) = self.frame.as_deref_mut() {
            // Already suspended: later reads of this run must not reach the cache.
            if let Some(dep) = frame.suspended {
                return Err(ComputationError::Suspended(dep));
            }
            if let Some(v) = frame.replay_next() {
                return Ok(v);
            }
            if let Some(v) = frame.take_resumed(key) {
                return Ok(v);
            }
        }

        if let Some(v) = self.pass.lookup(self.registry, key)? {
            if let Some(frame) = self.frame.as_deref_mut() {
                frame.log(v.clone());
            }
            return Ok(v);
        }

        match self.frame.as_deref_mut() {
            Some(frame) => {
                frame.suspended = Some(key);
                Err(ComputationError::Suspended(key))
            }
            None => self.compute(key),
        }
    }

    /// Recursive driver: runs `key` as a nested call on the native stack.
    fn compute(&mut self, key: CallKey) -> EvalResult<Value> {
        stacker::maybe_grow(RED_ZONE, STACK_SEGMENT, || {
            let order = self.pass.begin(self.registry, key)?;
            let mut child = Ctx { registry: self.registry, data: self.data, pass: &mut *self.pass, frame: None };
            let value = child.invoke(key)?;
            self.pass.finish(self.registry, key, order, &value);
            Ok(value)
        })
    }

    fn invoke(&mut self, key: CallKey) -> EvalResult<Value> {
        let registry = self.registry;
        match (registry.body(key.func), key.arg) {
            (Body::Constant(f), None) => f(self),
            (Body::Timestep(f), Some(t)) => f(self, t),
            _ => Err(ComputationError::ArityMismatch { name: registry.name(key.func).to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cumulative() -> Registry<()> {
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("f", |_, t| Ok(Value::Scalar(t as f64))).unwrap();
        reg.timestep("g", |ctx, t| {
            let f = ctx.get("f", t)?;
            if t == 0 { return Ok(f); }
            Ok(f + ctx.get("g", t - 1)?)
        }).unwrap();
        reg
    }

    fn config(mode: EvalMode) -> ModelConfig {
        ModelConfig::default().with_mode(mode)
    }

    #[rstest]
    #[case(EvalMode::Recursive)]
    #[case(EvalMode::ExplicitStack)]
    fn test_nested_evaluation_from_cold_cache(#[case] mode: EvalMode) {
        let reg = cumulative();
        let mut pass = PassState::new(3, &config(mode), None);
        let g3 = reg.key("g", Some(3)).unwrap();

        assert_eq!(pass.evaluate(&reg, &(), g3).unwrap(), Value::Scalar(6.0));
        let out = pass.into_output();
        // g(3..=0) and f(3..=0)
        assert_eq!(out.stats.events, 8);
        assert_eq!(out.stats.max_depth, 5);
        assert_eq!(out.misses.max(), 1);
        assert_eq!(out.results.query(reg.id("g").unwrap()).len(), 4);
    }

    #[test]
    fn test_both_drivers_record_identical_traces() {
        let reg = cumulative();
        let traces: Vec<ExecutionTrace> = [EvalMode::Recursive, EvalMode::ExplicitStack]
            .into_iter()
            .map(|mode| {
                let mut pass = PassState::new(3, &config(mode), None);
                for t in 0..=3 {
                    for func in reg.timesteps() {
                        let key = CallKey::step(func, t);
                        if !pass.is_settled(&key) {
                            pass.evaluate(&reg, &(), key).unwrap();
                        }
                    }
                }
                pass.into_output().trace.unwrap()
            })
            .collect();
        assert_eq!(traces[0], traces[1]);
    }

    #[rstest]
    #[case(EvalMode::Recursive)]
    #[case(EvalMode::ExplicitStack)]
    fn test_self_dependency_is_cyclic(#[case] mode: EvalMode) {
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("a", |ctx, t| ctx.get("b", t)).unwrap();
        reg.timestep("b", |ctx, t| ctx.get("a", t)).unwrap();

        let mut pass = PassState::new(0, &config(mode), None);
        let err = pass.evaluate(&reg, &(), reg.key("a", Some(0)).unwrap()).unwrap_err();
        match err {
            ComputationError::CyclicDependency { call, .. } => assert_eq!(call, "a(0)"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[rstest]
    #[case(EvalMode::Recursive)]
    #[case(EvalMode::ExplicitStack)]
    fn test_depth_limit(#[case] mode: EvalMode) {
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("ahead", |ctx, t| {
            if t >= 100 { return Ok(Value::Scalar(1.0)); }
            ctx.get("ahead", t + 1)
        }).unwrap();

        let mut pass = PassState::new(0, &config(mode).with_max_depth(20), None);
        let err = pass.evaluate(&reg, &(), reg.key("ahead", Some(0)).unwrap()).unwrap_err();
        assert!(matches!(err, ComputationError::RecursionExhausted { depth: 21, limit: 20, .. }), "{err:?}");
    }

    #[rstest]
    #[case(EvalMode::Recursive, true)]
    #[case(EvalMode::ExplicitStack, false)]
    fn test_depth_hint_depends_on_mode(#[case] mode: EvalMode, #[case] suggests_switch: bool) {
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("ahead", |ctx, t| ctx.get("ahead", t + 1)).unwrap();

        let mut pass = PassState::new(0, &config(mode).with_max_depth(8), None);
        let msg = pass.evaluate(&reg, &(), reg.key("ahead", Some(0)).unwrap()).unwrap_err().to_string();
        assert!(msg.contains("max_depth"), "{msg}");
        assert_eq!(msg.contains("explicit-stack"), suggests_switch, "{msg}");
    }

    #[rstest]
    #[case(EvalMode::Recursive)]
    #[case(EvalMode::ExplicitStack)]
    fn test_fallback_on_read_error_sees_the_real_value(#[case] mode: EvalMode) {
        // `opt` is registered first, so every read of `src` is a miss.
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("opt", |ctx, t| Ok(ctx.get("src", t).unwrap_or(Value::Scalar(0.0)))).unwrap();
        reg.timestep("src", |_, t| Ok(Value::Scalar(10.0 + t as f64))).unwrap();

        let mut pass = PassState::new(2, &config(mode), None);
        for t in 0..=2 {
            for func in reg.timesteps() {
                let key = CallKey::step(func, t);
                if !pass.is_settled(&key) {
                    pass.evaluate(&reg, &(), key).unwrap();
                }
            }
        }
        let out = pass.into_output();
        assert_eq!(
            out.results.query(reg.id("opt").unwrap()),
            vec![Value::Scalar(10.0), Value::Scalar(11.0), Value::Scalar(12.0)]
        );
        assert_eq!(out.stats.events, 6);
    }

    #[test]
    fn test_reads_after_a_swallowed_suspension_stay_off_the_cache() {
        let mut reg: Registry<()> = Registry::new();
        reg.constant("x", |_| Ok(Value::Scalar(2.0))).unwrap();
        reg.constant("y", |_| Ok(Value::Scalar(3.0))).unwrap();
        reg.constant("outer", |ctx| {
            let a = ctx.constant("y").unwrap_or(Value::Scalar(0.0));
            Ok(a + ctx.constant("x")?)
        }).unwrap();

        let mut pass = PassState::new(0, &config(EvalMode::ExplicitStack), None);
        pass.evaluate(&reg, &(), reg.key("x", None).unwrap()).unwrap();
        let v = pass.evaluate(&reg, &(), reg.key("outer", None).unwrap()).unwrap();
        assert_eq!(v, Value::Scalar(5.0));

        let out = pass.into_output();
        let trace = out.trace.unwrap();
        let outer_order = trace.events().iter().find(|e| e.key.func == FuncId(2)).unwrap().order;
        // y then x, each once
        assert_eq!(trace.reads_of(outer_order).count(), 2);
        assert_eq!(out.stats.cache_hits, 1);
    }

    #[test]
    fn test_explicit_stack_replays_reads_without_rereading_cache() {
        // outer reads x, then needs y, then reads x again. On re-run the first
        // read of x must come from the frame log, not the cache.
        let mut reg: Registry<()> = Registry::new();
        reg.constant("x", |_| Ok(Value::Scalar(2.0))).unwrap();
        reg.constant("y", |_| Ok(Value::Scalar(3.0))).unwrap();
        reg.constant("outer", |ctx| {
            let a = ctx.constant("x")?;
            let b = ctx.constant("y")?;
            let c = ctx.constant("x")?;
            Ok(a * b + c)
        }).unwrap();

        let mut pass = PassState::new(0, &config(EvalMode::ExplicitStack), None);
        let x = reg.key("x", None).unwrap();
        pass.evaluate(&reg, &(), x).unwrap();
        let v = pass.evaluate(&reg, &(), reg.key("outer", None).unwrap()).unwrap();
        assert_eq!(v, Value::Scalar(8.0));

        let out = pass.into_output();
        let trace = out.trace.unwrap();
        // outer's reads: x, y, x. Exactly three edges from it.
        let outer_order = trace.events().iter().find(|e| e.key.func == FuncId(2)).unwrap().order;
        assert_eq!(trace.reads_of(outer_order).count(), 3);
        assert_eq!(out.stats.cache_hits, 2);
    }

    #[test]
    fn test_body_error_propagates() {
        let mut reg: Registry<()> = Registry::new();
        reg.timestep("bad", |_, t| Err(ComputationError::Model(format!("no data for t={t}")))).unwrap();
        let mut pass = PassState::new(0, &ModelConfig::default(), None);
        let err = pass.evaluate(&reg, &(), reg.key("bad", Some(4)).unwrap()).unwrap_err();
        assert_eq!(err, ComputationError::Model("no data for t=4".into()));
    }
}
