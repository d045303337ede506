use crate::calc::{Calc, CalcError, CalcSpec};
use crate::config::Config;
use crate::model::Var;
use crate::request::{CalcRequest, RequestError};
use log::{error, info};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result of one Calc run by the driver
#[derive(Debug)]
pub struct CalcOutcome {
    pub label: String,
    /// Scratch files written, one per output kind
    pub result: Result<Vec<PathBuf>, CalcError>,
}

impl CalcOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn label_of(spec: &CalcSpec) -> String {
    let runs: Vec<&str> = spec.runs.iter().map(|r| r.name.as_str()).collect();
    format!(
        "{} {} {} {}",
        spec.var.name,
        spec.model.name,
        runs.join("_"),
        spec.intvl_out
    )
}

fn run_one(mut calc: Calc) -> CalcOutcome {
    let label = calc.to_string();
    let result = calc.compute().map(|()| {
        calc.output_kinds()
            .iter()
            .filter_map(|k| calc.path_scratch(k.label()))
            .collect()
    });
    if let Err(e) = &result {
        error!("{} failed: {}", label, e);
    }
    CalcOutcome { label, result }
}

/// Compute every spec in parallel.
///
/// Calcs writing to the same archive run one after another within a single
/// task; distinct archives run concurrently. A failing Calc is reported in
/// its outcome and does not stop the others.
pub fn compute_calcs_parallel(specs: Vec<CalcSpec>, config: &Arc<Config>) -> Vec<CalcOutcome> {
    let mut outcomes = Vec::new();
    let mut groups: BTreeMap<PathBuf, Vec<Calc>> = BTreeMap::new();
    for spec in specs {
        let label = label_of(&spec);
        match Calc::new(spec, Arc::clone(config)) {
            Ok(calc) => groups.entry(calc.path_archive()).or_default().push(calc),
            Err(e) => {
                error!("{}: {}", label, e);
                outcomes.push(CalcOutcome {
                    label,
                    result: Err(e),
                });
            }
        }
    }

    info!(
        "Computing {} calculations in {} archive groups using {} threads",
        groups.values().map(Vec::len).sum::<usize>(),
        groups.len(),
        rayon::current_num_threads()
    );

    let groups: Vec<Vec<Calc>> = groups.into_values().collect();
    let computed: Vec<CalcOutcome> = groups
        .into_par_iter()
        .flat_map_iter(|group| group.into_iter().map(run_one).collect::<Vec<_>>())
        .collect();
    outcomes.extend(computed);
    outcomes
}

/// Parallel computation with a custom thread pool when `config.num_threads` is set
pub fn compute_with_custom_threads(
    specs: Vec<CalcSpec>,
    config: &Arc<Config>,
) -> Result<Vec<CalcOutcome>, DriverError> {
    if config.num_threads == 0 {
        return Ok(compute_calcs_parallel(specs, config));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build()?;
    Ok(pool.install(|| compute_calcs_parallel(specs, config)))
}

/// Build and compute every Calc of a request.
pub fn run_request(
    request: &CalcRequest,
    registry: &BTreeMap<String, Arc<Var>>,
    config: &Arc<Config>,
) -> Result<Vec<CalcOutcome>, DriverError> {
    let specs = request.build(registry)?;
    info!("Request '{}' expands to {} calculations", request.project, specs.len());
    compute_with_custom_threads(specs, config)
}

/// Resolved source files of every Calc of a request, keyed by Calc label.
pub fn locate_request(
    request: &CalcRequest,
    registry: &BTreeMap<String, Arc<Var>>,
    config: &Arc<Config>,
) -> Result<Vec<(String, Result<Vec<(String, Vec<PathBuf>)>, CalcError>)>, DriverError> {
    let specs = request.build(registry)?;
    Ok(specs
        .into_iter()
        .map(|spec| {
            let label = label_of(&spec);
            let files = Calc::new(spec, Arc::clone(config)).and_then(|calc| calc.input_files());
            (label, files)
        })
        .collect())
}
