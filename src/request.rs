//! Request files describing which calculations to run.
//!
//! A request names a project, its models and runs, the variables to
//! compute, the regions to average over, and one or more calculation
//! blocks. Each block expands to one [`CalcSpec`] per combination of run
//! selection, variable, date range and output interval.

use crate::calc::{CalcSpec, VertReduction};
use crate::dataset::{create_reader, normalize::rename_grid_attrs, DatasetError};
use crate::locator::{LocateError, LocatorConfig};
use crate::model::{
    EnsembleMember, GridMetadata, Model, Project, Run, TimeSampling, Var, VertDef, VertType,
};
use crate::region::Region;
use crate::time_utils::{parse_datetime, TimeError};
use chrono::NaiveDateTime;
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Cannot read request {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Model '{model}' has no run '{run}'")]
    UnknownRun { model: String, run: String },

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Unknown region '{0}'")]
    UnknownRegion(String),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("Cannot read grid: {0}")]
    Grid(#[from] DatasetError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct VarConfig {
    pub name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_true")]
    pub def_time: bool,
    #[serde(default)]
    pub def_vert: VertDef,
    #[serde(default)]
    pub plot_units: Option<(String, f64)>,
    #[serde(default)]
    pub valid_range: Option<(f64, f64)>,
}

impl VarConfig {
    pub fn to_var(&self) -> Var {
        let alt: Vec<&str> = self.alt_names.iter().map(String::as_str).collect();
        let mut var = Var::new(&self.name)
            .alt_names(&alt)
            .description(&self.description)
            .units(&self.units)
            .def_time(self.def_time)
            .def_vert(self.def_vert);
        if let Some(domain) = &self.domain {
            var = var.domain(domain);
        }
        if let Some((units, conv)) = &self.plot_units {
            var = var.plot_units(units, *conv);
        }
        if let Some((lo, hi)) = self.valid_range {
            var = var.valid_range(lo, hi);
        }
        var
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub locator: LocatorConfig,
    #[serde(default)]
    pub default_date_range: Option<(String, String)>,
    #[serde(default)]
    pub idealized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Files holding the grid; earlier files take precedence
    #[serde(default)]
    pub grid_files: Vec<PathBuf>,
    #[serde(default)]
    pub reference_pressure: Option<f64>,
    pub runs: Vec<RunConfig>,
}

/// One run, or several runs feeding the inputs of one calculation in order
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunSelection {
    One(String),
    Many(Vec<String>),
}

impl RunSelection {
    fn names(&self) -> Vec<&str> {
        match self {
            RunSelection::One(name) => vec![name.as_str()],
            RunSelection::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

fn default_intvl_in() -> String {
    "monthly".to_string()
}

fn default_intvl_out() -> Vec<String> {
    vec!["ann".to_string()]
}

fn default_dtype_in_time() -> TimeSampling {
    TimeSampling::TS
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalcConfig {
    pub model: String,
    pub runs: Vec<RunSelection>,
    pub variables: Vec<String>,
    /// Date ranges to compute; empty means each run's default range
    #[serde(default)]
    pub date_ranges: Vec<(String, String)>,
    #[serde(default = "default_intvl_in")]
    pub intvl_in: String,
    #[serde(default = "default_intvl_out")]
    pub intvl_out: Vec<String>,
    #[serde(default = "default_dtype_in_time")]
    pub dtype_in_time: TimeSampling,
    #[serde(default)]
    pub dtype_in_vert: Option<VertType>,
    pub dtype_out_time: Vec<String>,
    #[serde(default)]
    pub dtype_out_vert: Option<VertReduction>,
    /// Region names; all regions of the request when absent
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub ens_mem: Option<EnsembleMember>,
    #[serde(default)]
    pub time_offset_hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalcRequest {
    pub project: String,
    #[serde(default)]
    pub description: String,
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub variables: Vec<VarConfig>,
    #[serde(default)]
    pub regions: Vec<Region>,
    pub calcs: Vec<CalcConfig>,
}

/// Grid metadata from grid files, after renaming their grid attributes
pub fn load_grid(paths: &[PathBuf]) -> Result<GridMetadata, DatasetError> {
    let mut grid = GridMetadata::default();
    for path in paths {
        let reader = create_reader(path)?;
        let mut ds = reader.read(path)?;
        rename_grid_attrs(&mut ds);
        debug!("Grid from {}", path.display());
        grid = grid.merge(GridMetadata::from_dataset(&ds)?);
    }
    Ok(grid)
}

fn parse_range(range: &(String, String)) -> Result<(NaiveDateTime, NaiveDateTime), TimeError> {
    Ok((parse_datetime(&range.0)?, parse_datetime(&range.1)?))
}

struct ModelEntry {
    model: Arc<Model>,
    runs: BTreeMap<String, Arc<Run>>,
}

impl CalcRequest {
    pub fn from_file(path: &Path) -> Result<Self, RequestError> {
        let text = std::fs::read_to_string(path).map_err(|source| RequestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    fn build_models(&self) -> Result<BTreeMap<String, ModelEntry>, RequestError> {
        let mut models = BTreeMap::new();
        for config in &self.models {
            let mut model = Model::new(&config.name, load_grid(&config.grid_files)?);
            model.description = config.description.clone();
            if let Some(p_ref) = config.reference_pressure {
                model.reference_pressure = p_ref;
            }
            let mut runs = BTreeMap::new();
            for run_config in &config.runs {
                let mut run = Run::new(&run_config.name, run_config.locator.build()?);
                run.description = run_config.description.clone();
                run.idealized = run_config.idealized;
                if let Some(range) = &run_config.default_date_range {
                    let (start, end) = parse_range(range)?;
                    run = run.with_default_date_range(start, end);
                }
                runs.insert(run_config.name.clone(), Arc::new(run));
            }
            models.insert(
                config.name.clone(),
                ModelEntry {
                    model: Arc::new(model),
                    runs,
                },
            );
        }
        Ok(models)
    }

    /// Expand every calculation block into Calc specs.
    ///
    /// # Arguments
    /// * `registry` - Variables defined in code (e.g. derived quantities),
    ///   consulted before those listed in the request
    pub fn build(&self, registry: &BTreeMap<String, Arc<Var>>) -> Result<Vec<CalcSpec>, RequestError> {
        let project = Arc::new(Project {
            name: self.project.clone(),
            description: self.description.clone(),
        });
        let models = self.build_models()?;
        let mut variables: BTreeMap<String, Arc<Var>> = self
            .variables
            .iter()
            .map(|v| (v.name.clone(), Arc::new(v.to_var())))
            .collect();
        variables.extend(registry.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));

        let mut specs = Vec::new();
        for block in &self.calcs {
            let entry = models
                .get(&block.model)
                .ok_or_else(|| RequestError::UnknownModel(block.model.clone()))?;
            let regions = match &block.regions {
                None => self.regions.clone(),
                Some(names) => names
                    .iter()
                    .map(|name| {
                        self.regions
                            .iter()
                            .find(|r| &r.name == name)
                            .cloned()
                            .ok_or_else(|| RequestError::UnknownRegion(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            let date_ranges = block
                .date_ranges
                .iter()
                .map(|r| parse_range(r).map(Some))
                .collect::<Result<Vec<_>, _>>()?;
            let date_ranges = if date_ranges.is_empty() { vec![None] } else { date_ranges };

            for selection in &block.runs {
                let runs = selection
                    .names()
                    .into_iter()
                    .map(|name| {
                        entry.runs.get(name).cloned().ok_or_else(|| RequestError::UnknownRun {
                            model: block.model.clone(),
                            run: name.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                for var_name in &block.variables {
                    let var = variables
                        .get(var_name)
                        .ok_or_else(|| RequestError::UnknownVariable(var_name.clone()))?;
                    for range in &date_ranges {
                        for intvl_out in &block.intvl_out {
                            let kinds: Vec<&str> =
                                block.dtype_out_time.iter().map(String::as_str).collect();
                            let mut spec = CalcSpec::new(
                                Arc::clone(&project),
                                Arc::clone(&entry.model),
                                Arc::clone(&runs[0]),
                                Arc::clone(var),
                            )
                            .runs(runs.clone())
                            .regions(regions.clone())
                            .intervals(&block.intvl_in, intvl_out)
                            .dtype_in_time(block.dtype_in_time)
                            .dtype_out_time(&kinds);
                            spec.dtype_in_vert = block.dtype_in_vert;
                            spec.dtype_out_vert = block.dtype_out_vert;
                            spec.ens_mem = block.ens_mem;
                            spec.time_offset_hours = block.time_offset_hours;
                            spec.date_range = *range;
                            specs.push(spec);
                        }
                    }
                }
            }
        }
        Ok(specs)
    }
}
