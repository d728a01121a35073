//! Independent model instances over one shared registry, run in parallel.

use crate::analysis::schedule::ReleaseSchedule;
use crate::compute::ledger::EvalResult;
use crate::model::config::ModelConfig;
use crate::model::controller::Model;
use crate::store::{Registry, ResultStore};
use rayon::prelude::*;
use std::sync::Arc;

/// Runs one pass over `config.horizon` for every dataset and returns the
/// results in dataset order.
///
/// Each dataset gets its own model, cache and result store. With a schedule every
/// pass is a production pass; the schedule is validated once up front.
pub fn run_scenarios<D: Send>(
    registry: Arc<Registry<D>>,
    schedule: Option<Arc<ReleaseSchedule>>,
    config: &ModelConfig,
    datasets: Vec<D>,
) -> EvalResult<Vec<EvalResult<ResultStore>>> {
    if let Some(schedule) = &schedule {
        schedule.validate_for(&registry)?;
    }
    tracing::info!(scenarios = datasets.len(), horizon = config.horizon, "running scenarios");

    let config = config.clone().with_auto_run(false);
    Ok(datasets
        .into_par_iter()
        .map(|data| {
            let mut model = Model::new(Arc::clone(&registry), data, config.clone())?;
            if let Some(schedule) = &schedule {
                model.attach_schedule(Arc::clone(schedule))?;
            }
            model.run(config.horizon)?;
            Ok(model.into_results())
        })
        .collect())
}
