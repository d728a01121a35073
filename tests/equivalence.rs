use projection_core::{
    CallKey, ComputationError, EvalMode, Model, ModelConfig, PassKind, Registry, Value,
};
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

fn scalars(values: &[f64]) -> Vec<Value> {
    values.iter().map(|&v| Value::Scalar(v)).collect()
}

struct Basis {
    premium: f64,
    lapse: Vec<f64>,
    term: i64,
}

/// A small policy projection: decrements looking back, a reserve looking ahead,
/// a constant read from everywhere and series-valued claims.
fn policy() -> Registry<Basis> {
    let mut reg: Registry<Basis> = Registry::new();
    reg.constant("rate", |_| Ok(Value::Scalar(0.03))).unwrap();
    reg.timestep("pols_if", |ctx, t| {
        if t == 0 { return Ok(Value::Scalar(1.0)); }
        let lapse = Value::series(ctx.data().lapse.clone()).get_at((t - 1) as usize);
        Ok(ctx.get("pols_if", t - 1)? * (1.0 - lapse))
    }).unwrap();
    reg.timestep("premiums", |ctx, t| {
        let premium = ctx.data().premium;
        Ok(ctx.get("pols_if", t)? * premium)
    }).unwrap();
    reg.timestep("claims", |ctx, t| {
        let pols = ctx.get("pols_if", t)?;
        Ok(Value::series(vec![4.0, 6.0, 1.5]) * pols)
    }).unwrap();
    reg.timestep("discount", |ctx, t| {
        let rate = ctx.constant("rate")?.as_scalar().unwrap_or_default();
        Ok(Value::Scalar((1.0 + rate).powi(-(t as i32))))
    }).unwrap();
    reg.timestep("reserve", |ctx, t| {
        if t >= ctx.data().term { return Ok(Value::Scalar(0.0)); }
        let net = ctx.get("premiums", t)?.total() - ctx.get("claims", t)?.total();
        let v = ctx.scalar("discount", 1)?;
        Ok(Value::Scalar(net) + ctx.get("reserve", t + 1)? * v)
    }).unwrap();
    reg
}

fn basis() -> Basis {
    Basis { premium: 100.0, lapse: vec![0.1, 0.08, 0.05, 0.03], term: 12 }
}

#[rstest]
#[case(EvalMode::Recursive)]
#[case(EvalMode::ExplicitStack)]
fn test_cumulative_sum_trial_then_production(#[case] mode: EvalMode) {
    let config = ModelConfig::new(3).with_mode(mode).with_auto_run(true);
    let mut model = Model::new(cumulative(), (), config).unwrap();

    assert_eq!(model.query("f").unwrap(), scalars(&[0.0, 1.0, 2.0, 3.0]));
    assert_eq!(model.query("g").unwrap(), scalars(&[0.0, 1.0, 3.0, 6.0]));
    assert_eq!(model.stats().unwrap().peak_resident, 8);

    model.optimize_and_reset(3).unwrap();
    assert!(model.query("g").unwrap().is_empty());

    let stats = model.run(3).unwrap();
    assert_eq!(model.query("f").unwrap(), scalars(&[0.0, 1.0, 2.0, 3.0]));
    assert_eq!(model.query("g").unwrap(), scalars(&[0.0, 1.0, 3.0, 6.0]));

    assert_eq!(stats.kind, PassKind::Production);
    // previous g, current f and current g
    assert_eq!(stats.peak_resident, 3);
    assert_eq!(stats.final_resident, 0);
    assert_eq!(stats.evictions, 8);
    assert_eq!(stats.recomputations, 0);
}

#[test]
fn test_resident_cache_stays_flat_as_horizon_grows() {
    for horizon in [10, 100, 500] {
        let mut model = Model::new(cumulative(), (), ModelConfig::new(horizon).with_auto_run(true)).unwrap();
        model.optimize_and_reset(horizon).unwrap();
        let stats = model.run(horizon).unwrap();
        assert_eq!(stats.peak_resident, 3, "horizon {horizon}");
        assert_eq!(model.query("g").unwrap().last(), Some(&Value::Scalar((horizon * (horizon + 1) / 2) as f64)));
    }
}

#[test]
fn test_fibonacci_peak_drops_to_a_constant() {
    let mut reg: Registry<()> = Registry::new();
    reg.timestep("fib", |ctx, t| {
        if t < 2 { return Ok(Value::Scalar(t as f64)); }
        Ok(ctx.get("fib", t - 1)? + ctx.get("fib", t - 2)?)
    }).unwrap();

    let mut model = Model::new(reg, (), ModelConfig::new(200).with_auto_run(true)).unwrap();
    assert_eq!(model.stats().unwrap().peak_resident, 201);
    let before = model.query("fib").unwrap();

    model.optimize_and_reset(200).unwrap();
    let stats = model.run(200).unwrap();
    assert_eq!(stats.peak_resident, 3);
    assert_eq!(model.query("fib").unwrap(), before);
}

#[rstest]
#[case(EvalMode::Recursive)]
#[case(EvalMode::ExplicitStack)]
fn test_production_matches_trial_for_every_function(#[case] mode: EvalMode) {
    let horizon = 12;
    let config = ModelConfig::new(horizon).with_mode(mode).with_auto_run(true);
    let mut model = Model::new(policy(), basis(), config).unwrap();
    let trial = model.results().clone();
    let trial_peak = model.stats().unwrap().peak_resident;

    model.optimize_and_reset(horizon).unwrap();
    let stats = model.run(horizon).unwrap();

    assert_eq!(model.results(), &trial);
    for name in model.timestep_functions() {
        assert_eq!(model.query(name).unwrap().len(), horizon + 1, "{name}");
    }
    assert_eq!(model.cache_misses().max(), 1);
    assert_eq!(stats.recomputations, 0);
    assert_eq!(stats.final_resident, 0);
    assert!(stats.peak_resident < trial_peak);
}

#[test]
fn test_both_modes_agree_on_trace_and_results() {
    let run = |mode| {
        let config = ModelConfig::new(8).with_mode(mode).with_auto_run(true);
        Model::new(policy(), basis(), config).unwrap()
    };
    let recursive = run(EvalMode::Recursive);
    let stacked = run(EvalMode::ExplicitStack);

    assert_eq!(recursive.trace(), stacked.trace());
    assert_eq!(recursive.results(), stacked.results());
    assert_eq!(recursive.stats(), stacked.stats());
}

#[test]
fn test_release_never_precedes_a_read() {
    let mut model = Model::new(policy(), basis(), ModelConfig::new(10).with_auto_run(true)).unwrap();
    model.optimize_and_reset(10).unwrap();
    let trace = model.trace().unwrap().clone();
    let schedule = model.schedule().unwrap();

    for edge in trace.edges() {
        let reader = trace.event(edge.caller).unwrap();
        let released = schedule.release_index(&edge.callee).unwrap();
        assert!(released >= reader.completion.unwrap(), "{:?} released before {:?} finished", edge.callee, reader.key);
    }
}

#[test]
fn test_sinks_are_released_at_their_own_completion() {
    let mut model = Model::new(cumulative(), (), ModelConfig::new(5).with_auto_run(true)).unwrap();
    model.optimize_and_reset(5).unwrap();
    let graph = model.dependency_graph().unwrap();
    let trace = model.trace().unwrap();
    let schedule = model.schedule().unwrap();

    let g = model.registry().id("g").unwrap();
    assert_eq!(graph.sinks(), vec![CallKey::step(g, 5)]);
    for sink in graph.sinks() {
        let own = trace.events().iter().find(|e| e.key == sink).and_then(|e| e.completion);
        assert_eq!(schedule.release_index(&sink), own);
    }
}

#[rstest]
#[case(EvalMode::Recursive)]
#[case(EvalMode::ExplicitStack)]
fn test_cycle_aborts_without_touching_results(#[case] mode: EvalMode) {
    let mut reg: Registry<bool> = Registry::new();
    reg.timestep("assets", |ctx, t| {
        if *ctx.data() { ctx.get("liabilities", t) } else { Ok(Value::Scalar(1.0)) }
    }).unwrap();
    reg.timestep("liabilities", |ctx, t| ctx.get("assets", t)).unwrap();

    let mut model = Model::new(reg, false, ModelConfig::new(2).with_mode(mode).with_auto_run(true)).unwrap();
    let before = model.results().clone();
    assert!(!before.is_empty());

    *model.data_mut() = true;
    let err = model.run(2).unwrap_err();
    match err {
        ComputationError::CyclicDependency { call, .. } => assert_eq!(call, "assets(0)"),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(model.results(), &before);
    assert!(model.trace().is_none());
    assert!(matches!(model.optimize_and_reset(2), Err(ComputationError::MisuseBeforeOptimize { trial: None, .. })));
}

#[rstest]
#[case(EvalMode::Recursive)]
#[case(EvalMode::ExplicitStack)]
fn test_trial_after_reset_matches_first_trial(#[case] mode: EvalMode) {
    let config = ModelConfig::new(8).with_mode(mode);
    let mut model = Model::new(policy(), basis(), config.clone()).unwrap();
    let first_stats = model.run(8).unwrap();
    let first = model.results().clone();
    let first_trace = model.trace().cloned();

    model.reset();
    assert!(model.results().is_empty());
    let second_stats = model.run(8).unwrap();

    assert_eq!(second_stats.kind, PassKind::Trial);
    assert_eq!(model.results(), &first);
    assert_eq!(model.trace().cloned(), first_trace);
    assert_eq!(first_stats, second_stats);
}

#[test]
fn test_repeated_production_passes_are_identical() {
    let mut model = Model::new(policy(), basis(), ModelConfig::new(6).with_auto_run(true)).unwrap();
    model.optimize_and_reset(6).unwrap();

    let first_stats = model.run(6).unwrap();
    let first = model.results().clone();
    let second_stats = model.run(6).unwrap();

    assert_eq!(model.results(), &first);
    assert_eq!(first_stats, second_stats);
}
