//! One unit of work: a variable computed for a set of runs over a date
//! range, reduced to the requested output kinds and saved.

use crate::config::Config;
use crate::dataset::{load_variable, DataArray, DatasetError};
use crate::locator::{DataTags, LocateError};
use crate::math::vertical::{
    dp_from_p, dp_from_ps, int_dp_g, pfull_from_ps, pressure_from_levels, to_pfull_from_phalf,
    VerticalError,
};
use crate::model::{
    EnsembleMember, Input, Model, Operand, Project, RawOperand, Run, TimeSampling, Transform, Var,
    VertDef, VertType, GRID_ONLY_NAMES,
};
use crate::names::{DP_STR, LON_STR, PLEVEL_STR, P_STR, YEAR_STR};
use crate::region::{Region, RegionError};
use crate::staging::{CommandStager, NoStaging, Stager};
use crate::time_utils::{month_indices, year_label, TimeError};
use chrono::{Datelike, NaiveDateTime};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod output;
pub mod store;

pub use output::{
    data_in_label, data_out_label, OutputKind, Selector, TimeReducer, UnsupportedReduction,
    VertReduction, Zonal,
};
pub use store::{Artifact, ArtifactPaths, PersistenceError};

#[derive(Error, Debug)]
pub enum CalcError {
    #[error(transparent)]
    UnsupportedReduction(#[from] UnsupportedReduction),

    #[error("Vertical coordinate error: {0}")]
    VerticalCoordinate(#[from] VerticalError),

    #[error("Model '{model}' grid has no '{field}'")]
    MissingGridField { model: String, field: String },

    #[error("Invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("Staging {} files failed: {source}", .paths.len())]
    Staging { paths: Vec<PathBuf>, source: io::Error },

    #[error("Invalid calculation: {0}")]
    InvalidSpec(String),

    #[error("No region '{0}' in this result")]
    UnknownRegion(String),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Everything needed to build a [`Calc`]
#[derive(Debug, Clone)]
pub struct CalcSpec {
    pub project: Arc<Project>,
    pub model: Arc<Model>,
    /// With one run every input comes from it; otherwise input `n` comes from run `n`
    pub runs: Vec<Arc<Run>>,
    pub ens_mem: Option<EnsembleMember>,
    pub var: Arc<Var>,
    /// Falls back to the first run's default range
    pub date_range: Option<(NaiveDateTime, NaiveDateTime)>,
    pub regions: Vec<Region>,
    pub intvl_in: String,
    pub intvl_out: String,
    pub dtype_in_time: TimeSampling,
    pub dtype_in_vert: Option<VertType>,
    pub dtype_out_time: Vec<String>,
    pub dtype_out_vert: Option<VertReduction>,
    /// Overrides the configured instantaneous offset table
    pub time_offset_hours: Option<i64>,
}

impl CalcSpec {
    pub fn new(project: Arc<Project>, model: Arc<Model>, run: Arc<Run>, var: Arc<Var>) -> Self {
        Self {
            project,
            model,
            runs: vec![run],
            ens_mem: None,
            var,
            date_range: None,
            regions: Vec::new(),
            intvl_in: "monthly".to_string(),
            intvl_out: "ann".to_string(),
            dtype_in_time: TimeSampling::TS,
            dtype_in_vert: None,
            dtype_out_time: vec!["av".to_string()],
            dtype_out_vert: None,
            time_offset_hours: None,
        }
    }

    pub fn runs(mut self, runs: Vec<Arc<Run>>) -> Self {
        self.runs = runs;
        self
    }

    pub fn ens_mem(mut self, member: EnsembleMember) -> Self {
        self.ens_mem = Some(member);
        self
    }

    pub fn date_range(mut self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn intervals(mut self, intvl_in: &str, intvl_out: &str) -> Self {
        self.intvl_in = intvl_in.to_string();
        self.intvl_out = intvl_out.to_string();
        self
    }

    pub fn dtype_in_time(mut self, sampling: TimeSampling) -> Self {
        self.dtype_in_time = sampling;
        self
    }

    pub fn dtype_in_vert(mut self, vert: VertType) -> Self {
        self.dtype_in_vert = Some(vert);
        self
    }

    pub fn dtype_out_time(mut self, kinds: &[&str]) -> Self {
        self.dtype_out_time = kinds.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn dtype_out_vert(mut self, vert: VertReduction) -> Self {
        self.dtype_out_vert = Some(vert);
        self
    }

    pub fn time_offset_hours(mut self, hours: i64) -> Self {
        self.time_offset_hours = Some(hours);
        self
    }
}

/// Progress of a [`Calc`] through its computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CalcState {
    Constructed,
    InputsGathered,
    ComputedFull,
    ComputedMonthly,
    ComputedEddy,
    YearAveraged,
    Reduced,
    Saved,
}

/// Subsetting and cosmetic conversions applied when loading a result
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Pick one region out of a regional result
    pub region: Option<String>,
    /// Inclusive range of years to keep
    pub years: Option<(i32, i32)>,
    /// Pressure level to pick, in hPa
    pub level: Option<f64>,
    /// Multiply by the variable's plot-unit conversion factor
    pub plot_units: bool,
    /// Replace values outside the variable's valid range with NaN
    pub mask_unphysical: bool,
}

/// Join non-empty components onto `root`
fn join_components(root: &Path, parts: &[&str]) -> PathBuf {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Series produced by one pass of the computation
struct Series {
    full: Option<DataArray>,
    monthly: Option<DataArray>,
    eddy: Option<DataArray>,
}

pub struct Calc {
    spec: CalcSpec,
    config: Arc<Config>,
    stager: Arc<dyn Stager>,
    kinds: Vec<OutputKind>,
    months: Vec<u32>,
    start_date: NaiveDateTime,
    end_date: NaiveDateTime,
    run_str: String,
    run_str_full: String,
    paths: ArtifactPaths,
    state: CalcState,
    data_out: HashMap<String, Artifact>,
    ps_cache: BTreeMap<usize, DataArray>,
}

impl Calc {
    /// Validate a spec and derive the names and paths of its outputs.
    pub fn new(spec: CalcSpec, config: Arc<Config>) -> Result<Self, CalcError> {
        if spec.runs.is_empty() {
            return Err(CalcError::InvalidSpec("at least one run is required".into()));
        }
        let kinds = spec
            .dtype_out_time
            .iter()
            .map(|k| k.parse::<OutputKind>())
            .collect::<Result<Vec<_>, _>>()?;
        if kinds.is_empty() {
            return Err(CalcError::InvalidSpec("no output kinds requested".into()));
        }
        if kinds.iter().any(|k| k.regional) && spec.regions.is_empty() {
            return Err(CalcError::InvalidSpec(
                "regional output requested without any regions".into(),
            ));
        }
        let months = month_indices(&spec.intvl_out)?;

        let (start_date, end_date) = spec
            .date_range
            .or(spec.runs[0].default_date_range)
            .ok_or_else(|| {
                CalcError::InvalidDateRange(format!(
                    "no date range given and run '{}' has no default",
                    spec.runs[0].name
                ))
            })?;
        if start_date > end_date {
            return Err(CalcError::InvalidDateRange(format!(
                "start {} is after end {}",
                start_date, end_date
            )));
        }

        let names: Vec<&str> = spec.runs.iter().map(|r| r.name.as_str()).collect();
        let run_str_full = names.join("_");
        let mut unique = names.clone();
        unique.sort_unstable();
        unique.dedup();
        let run_str = unique.join("_");

        let stager: Arc<dyn Stager> = match &config.stage_command {
            Some(program) => Arc::new(CommandStager::new(program)),
            None => Arc::new(NoStaging),
        };

        let mut calc = Self {
            paths: ArtifactPaths {
                dir_scratch: PathBuf::new(),
                dir_archive: PathBuf::new(),
                file_names: BTreeMap::new(),
            },
            spec,
            config,
            stager,
            kinds,
            months,
            start_date,
            end_date,
            run_str,
            run_str_full,
            state: CalcState::Constructed,
            data_out: HashMap::new(),
            ps_cache: BTreeMap::new(),
        };
        calc.paths = calc.derive_paths();
        Ok(calc)
    }

    pub fn with_stager(mut self, stager: Arc<dyn Stager>) -> Self {
        self.stager = stager;
        self
    }

    fn derive_paths(&self) -> ArtifactPaths {
        let ens = EnsembleMember::label(self.spec.ens_mem);
        let proj = self.spec.project.name.as_str();
        let model = self.spec.model.name.as_str();
        let user = self.config.user.as_str();
        let dir_scratch = join_components(
            &self.config.work_root,
            &[user, proj, model, &self.run_str, &ens, &self.spec.var.name],
        );
        let dir_archive = join_components(
            &self.config.archive_root,
            &[user, proj, "data", model, &self.run_str, &ens],
        );
        let file_names = self
            .kinds
            .iter()
            .map(|k| (k.label().to_string(), self.file_name_for(k)))
            .collect();
        ArtifactPaths {
            dir_scratch,
            dir_archive,
            file_names,
        }
    }

    fn file_name_for(&self, kind: &OutputKind) -> String {
        let out_lbl = data_out_label(&self.spec.intvl_out, kind, self.spec.dtype_out_vert);
        let in_lbl = data_in_label(
            &self.spec.intvl_in,
            self.spec.dtype_in_time,
            self.spec.dtype_in_vert,
        );
        let ens_lbl = EnsembleMember::label(self.spec.ens_mem);
        let yr_lbl = year_label(self.start_date.year(), self.end_date.year());
        [
            self.spec.var.name.as_str(),
            &out_lbl,
            &in_lbl,
            &self.spec.model.name,
            &self.run_str_full,
            &ens_lbl,
            &yr_lbl,
            store::ARTIFACT_EXTENSION,
        ]
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(".")
    }

    pub fn name(&self) -> &str {
        &self.spec.var.name
    }

    pub fn spec(&self) -> &CalcSpec {
        &self.spec
    }

    pub fn state(&self) -> CalcState {
        self.state
    }

    pub fn output_kinds(&self) -> &[OutputKind] {
        &self.kinds
    }

    pub fn start_date(&self) -> NaiveDateTime {
        self.start_date
    }

    pub fn end_date(&self) -> NaiveDateTime {
        self.end_date
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn file_name(&self, kind: &str) -> Option<&str> {
        self.paths.file_name(kind)
    }

    pub fn path_scratch(&self, kind: &str) -> Option<PathBuf> {
        self.paths.path_scratch(kind)
    }

    pub fn path_archive(&self) -> PathBuf {
        self.paths.path_archive()
    }

    /// Results computed or loaded so far, by output kind
    pub fn data_out(&self) -> &HashMap<String, Artifact> {
        &self.data_out
    }

    fn set_state(&mut self, state: CalcState) {
        debug!("{}: {:?} -> {:?}", self, self.state, state);
        self.state = state;
    }

    fn tags(&self, var: &Var) -> DataTags {
        DataTags {
            domain: var.domain.clone(),
            intvl_in: self.spec.intvl_in.clone(),
            intvl_out: self.spec.intvl_out.clone(),
            dtype_in_time: self.spec.dtype_in_time,
            dtype_in_vert: self.spec.dtype_in_vert,
        }
    }

    fn stage(&self, paths: &[PathBuf]) -> Result<(), CalcError> {
        self.stager.stage(paths).map_err(|source| CalcError::Staging {
            paths: paths.to_vec(),
            source,
        })
    }

    fn grid_value(&self, name: &str) -> Result<DataArray, CalcError> {
        self.spec
            .model
            .grid
            .field(name)
            .ok_or_else(|| self.missing_grid(name))
    }

    fn missing_grid(&self, field: &str) -> CalcError {
        CalcError::MissingGridField {
            model: self.spec.model.name.clone(),
            field: field.to_string(),
        }
    }

    /// Attach model grid coordinates the array lacks but whose dimensions it has.
    fn attach_grid(&self, mut arr: DataArray) -> DataArray {
        for (name, coord) in self.spec.model.grid.coords() {
            if arr.coords.contains_key(&name) {
                continue;
            }
            let fits = coord
                .dims
                .iter()
                .zip(coord.values.shape())
                .all(|(dim, len)| arr.dim_len(dim) == Some(*len));
            if fits {
                arr.coords.insert(name, coord);
            } else if coord.dims.iter().all(|d| arr.has_dim(d)) {
                warn!(
                    "Grid '{}' of model '{}' does not match the shape of '{}'",
                    name, self.spec.model.name, arr.name
                );
            }
        }
        arr
    }

    /// Timestamp correction for the input sampling, if any.
    fn time_offset(&self) -> Option<i64> {
        self.spec.time_offset_hours.or_else(|| {
            if self.spec.dtype_in_time.is_inst() {
                self.config.inst_offset_hours(&self.spec.intvl_in)
            } else {
                None
            }
        })
    }

    /// Correct the time axis and restrict to the requested dates and months.
    fn to_desired_dates(&self, mut arr: DataArray) -> Result<DataArray, CalcError> {
        if let (Some(hours), Some(time)) = (self.time_offset(), &arr.time) {
            if hours != 0 {
                debug!("Shifting '{}' timestamps by {} h", arr.name, hours);
                arr.time = Some(time.shift_hours(hours)?);
            }
        }
        Ok(arr.sel_time(self.start_date, self.end_date, &self.months)?)
    }

    fn run_for(&self, n: usize) -> Result<&Arc<Run>, CalcError> {
        let index = if self.spec.runs.len() == 1 { 0 } else { n };
        self.spec.runs.get(index).ok_or_else(|| {
            CalcError::InvalidSpec(format!(
                "input {} of '{}' has no run ({} runs given)",
                n,
                self.spec.var.name,
                self.spec.runs.len()
            ))
        })
    }

    fn read_from_disk(&self, var: &Var, n: usize) -> Result<DataArray, CalcError> {
        let run = self.run_for(n)?;
        let files = run
            .locator
            .locate(var, self.start_date, self.end_date, &self.tags(var))?;
        debug!("'{}' from run '{}': {} files", var.name, run.name, files.len());
        self.stage(&files)?;
        let mut arr = load_variable(&files, &var.names(), self.config.min_safe_year)?;
        if self.spec.dtype_in_vert == Some(VertType::Sigma) && var.def_vert == VertDef::Half {
            arr = to_pfull_from_phalf(&arr, self.spec.model.grid.pfull.as_deref())?;
        }
        Ok(self.attach_grid(arr))
    }

    fn surface_pressure(&mut self, n: usize) -> Result<DataArray, CalcError> {
        let key = if self.spec.runs.len() == 1 { 0 } else { n };
        if let Some(ps) = self.ps_cache.get(&key) {
            return Ok(ps.clone());
        }
        let ps = self.read_from_disk(&Var::surface_pressure(), n)?;
        let ps = self.to_desired_dates(ps)?;
        self.ps_cache.insert(key, ps.clone());
        Ok(ps)
    }

    /// Pressure or pressure thickness at the data's vertical levels
    fn pressure_values(&mut self, name: &str, n: usize) -> Result<DataArray, CalcError> {
        let vert = self
            .spec
            .dtype_in_vert
            .ok_or_else(|| VerticalError::NoVerticalType(self.spec.var.name.clone()))?;
        let grid = &self.spec.model.grid;
        let data = match vert {
            VertType::Pressure => {
                let levels = grid.level.clone().ok_or_else(|| self.missing_grid(PLEVEL_STR))?;
                if name == P_STR {
                    pressure_from_levels(&levels)?
                } else {
                    let ps = self.surface_pressure(n)?;
                    dp_from_p(&levels, &ps)?
                }
            }
            VertType::Sigma => {
                let pk = grid.pk.clone().ok_or_else(|| self.missing_grid("pk"))?;
                let bk = grid.bk.clone().ok_or_else(|| self.missing_grid("bk"))?;
                let pfull = grid.pfull.clone();
                let p_ref = self.spec.model.reference_pressure;
                let ps = self.surface_pressure(n)?;
                if name == P_STR {
                    pfull_from_ps(&pk, &bk, p_ref, &ps, pfull.as_deref())?
                } else {
                    dp_from_ps(&pk, &bk, p_ref, &ps, pfull.as_deref())?
                }
            }
        };
        Ok(self.attach_grid(data))
    }

    /// Data for one input over the Calc's dates
    fn input_data(&mut self, var: &Var, n: usize) -> Result<DataArray, CalcError> {
        info!("Getting input data: {}", var.name);
        let name = var.name.as_str();
        if name == P_STR || name == DP_STR {
            return self.pressure_values(name, n);
        }
        if GRID_ONLY_NAMES.contains(&name) {
            return Ok(self.attach_grid(self.grid_value(name)?));
        }
        let arr = self.read_from_disk(var, n)?;
        if var.def_time {
            self.to_desired_dates(arr)
        } else {
            Ok(arr)
        }
    }

    fn gather_inputs(&mut self) -> Result<Vec<(String, Operand)>, CalcError> {
        let var = Arc::clone(&self.spec.var);
        let inputs = if var.is_derived() {
            var.inputs.clone()
        } else {
            vec![Input::Var(Arc::clone(&var))]
        };
        let mut operands = Vec::with_capacity(inputs.len());
        for (n, input) in inputs.iter().enumerate() {
            let operand = match input {
                Input::Constant { value, .. } => Operand::Scalar(*value),
                Input::Var(v) => Operand::Array(self.input_data(v, n)?),
            };
            operands.push((input.name().to_string(), operand));
        }
        self.set_state(CalcState::InputsGathered);
        Ok(operands)
    }

    /// Source files each on-disk input would be read from, without reading them.
    pub fn input_files(&self) -> Result<Vec<(String, Vec<PathBuf>)>, CalcError> {
        let var = &self.spec.var;
        let inputs = if var.is_derived() {
            var.inputs.clone()
        } else {
            vec![Input::Var(Arc::clone(var))]
        };
        let mut out = Vec::new();
        for (n, input) in inputs.iter().enumerate() {
            let Input::Var(v) = input else { continue };
            let name = v.name.as_str();
            let on_disk = if name == P_STR || name == DP_STR {
                let needs_ps = self.spec.dtype_in_vert == Some(VertType::Sigma) || name == DP_STR;
                if !needs_ps {
                    continue;
                }
                Var::surface_pressure()
            } else if GRID_ONLY_NAMES.contains(&name) {
                continue;
            } else {
                (**v).clone()
            };
            let run = self.run_for(n)?;
            let files = run
                .locator
                .locate(&on_disk, self.start_date, self.end_date, &self.tags(&on_disk))?;
            out.push((on_disk.name.clone(), files));
        }
        Ok(out)
    }

    fn apply_transform(&self, operands: &[(String, Operand)]) -> Result<DataArray, CalcError> {
        let var = &self.spec.var;
        let first_array = || {
            operands
                .iter()
                .find_map(|(_, o)| o.as_array())
                .ok_or_else(|| {
                    CalcError::InvalidSpec(format!("'{}' has no array inputs", var.name))
                })
        };
        let result = match &var.transform {
            None => first_array()?.clone(),
            Some(Transform::Arrays(f)) => {
                let args: Vec<Operand> = operands.iter().map(|(_, o)| o.clone()).collect();
                f(&args)?
            }
            Some(Transform::Set(f)) => {
                let args: BTreeMap<String, Operand> = operands.iter().cloned().collect();
                f(&args)?
            }
            Some(Transform::Raw(f)) => {
                let args: Vec<RawOperand> = operands
                    .iter()
                    .map(|(_, o)| match o {
                        Operand::Array(a) => RawOperand::Array(a.values.clone()),
                        Operand::Scalar(v) => RawOperand::Scalar(*v),
                    })
                    .collect();
                let values = f(&args)?;
                first_array()?.with_values(values)?
            }
        };
        Ok(result.renamed(&var.name))
    }

    /// Evaluate the transform, on monthly means of the inputs if `monthly`.
    fn compute_series(
        &mut self,
        operands: &[(String, Operand)],
        monthly: bool,
    ) -> Result<DataArray, CalcError> {
        let series = if monthly {
            let monthly_ops = operands
                .iter()
                .map(|(name, op)| {
                    let op = match op {
                        Operand::Array(a) if a.time.is_some() => Operand::Array(a.monthly_mean()?),
                        other => other.clone(),
                    };
                    Ok((name.clone(), op))
                })
                .collect::<Result<Vec<_>, DatasetError>>()?;
            self.apply_transform(&monthly_ops)?
        } else {
            self.apply_transform(operands)?
        };

        if self.spec.dtype_out_vert == Some(VertReduction::VertInt)
            && self.spec.var.def_vert != VertDef::None
        {
            let vert_dim = self
                .spec
                .dtype_in_vert
                .map(|v| v.dim())
                .ok_or_else(|| VerticalError::NoVerticalType(self.spec.var.name.clone()))?;
            let mut dp = self.pressure_values(&Var::pressure_thickness().name, 0)?;
            if monthly && dp.time.is_some() {
                dp = dp.monthly_mean()?;
            }
            let g = self.config.constants.g;
            return Ok(int_dp_g(&series, &dp, vert_dim, g)?.renamed(&self.spec.var.name));
        }
        Ok(series)
    }

    fn time_weights(&self, arr: &DataArray) -> Result<Vec<f64>, CalcError> {
        let time = arr.time_axis()?;
        if self.spec.dtype_in_time.is_inst() {
            return Ok(vec![1.0; time.len()]);
        }
        match &time.durations {
            Some(d) if d.len() == time.len() => Ok(d.clone()),
            _ => {
                warn!(
                    "No averaging-interval durations for '{}'; weighting every step equally",
                    arr.name
                );
                Ok(vec![1.0; time.len()])
            }
        }
    }

    fn averages_by_year(&self, arr: &DataArray) -> bool {
        self.spec.var.def_time
            && arr.time.is_some()
            && !self.spec.dtype_in_time.is_pre_averaged()
            && !self.spec.runs[0].idealized
    }

    /// Duration-weighted mean within each year.
    fn full_to_yearly(&self, arr: DataArray) -> Result<DataArray, CalcError> {
        if !self.averages_by_year(&arr) {
            return Ok(arr);
        }
        let weights = self.time_weights(&arr)?;
        Ok(arr.year_weighted_mean(&weights)?)
    }

    fn compute_all_series(&mut self, operands: &[(String, Operand)]) -> Result<Series, CalcError> {
        let monthly_input = self.spec.dtype_in_time.monthly_from;
        let all_time_mean = self.kinds.iter().all(|k| k.selector == Selector::TimeMean);
        let need_full = !(monthly_input && all_time_mean);
        let need_eddy = self.kinds.iter().any(|k| k.selector == Selector::Eddy);
        let need_monthly = monthly_input || self.kinds.iter().any(|k| k.needs_monthly());

        let full = if need_full {
            let full = self.compute_series(operands, false)?;
            self.set_state(CalcState::ComputedFull);
            Some(full)
        } else {
            None
        };
        let monthly = if need_monthly && self.spec.var.def_time {
            let monthly = self.compute_series(operands, true)?;
            self.set_state(CalcState::ComputedMonthly);
            Some(monthly)
        } else {
            None
        };
        let eddy = match (&full, &monthly) {
            (Some(full), Some(monthly)) if need_eddy => {
                let baseline = monthly.broadcast_months(full.time_axis()?)?;
                let eddy = full.sub(&baseline)?;
                self.set_state(CalcState::ComputedEddy);
                Some(eddy)
            }
            _ => None,
        };

        let series = Series {
            full: full.map(|a| self.full_to_yearly(a)).transpose()?,
            monthly: monthly.map(|a| self.full_to_yearly(a)).transpose()?,
            eddy: eddy.map(|a| self.full_to_yearly(a)).transpose()?,
        };
        self.set_state(CalcState::YearAveraged);
        Ok(series)
    }

    fn time_reduce(&self, arr: &DataArray, reducer: TimeReducer) -> Result<DataArray, CalcError> {
        match reducer {
            TimeReducer::Ts | TimeReducer::Identity => Ok(arr.clone()),
            _ if !arr.has_dim(YEAR_STR) => Ok(arr.clone()),
            TimeReducer::Av => Ok(arr.mean_dim(YEAR_STR)?),
            TimeReducer::Std => Ok(arr.reduce_dim(YEAR_STR, crate::dataset::Reduction::Std)?),
        }
    }

    fn reduce(&self, series: &Series, kind: &OutputKind) -> Result<Artifact, CalcError> {
        let chosen = match kind.selector {
            Selector::Full => series.full.as_ref(),
            Selector::Eddy => series.eddy.as_ref(),
            Selector::TimeMean => series.monthly.as_ref().or(series.full.as_ref()),
        };
        let data = chosen.ok_or_else(|| {
            CalcError::InvalidSpec(format!(
                "'{}' cannot be computed for time-invariant '{}'",
                kind,
                self.spec.var.name
            ))
        })?;
        let data = match kind.zonal {
            Zonal::None => data.clone(),
            Zonal::Asym => data.sub(&data.mean_dim(LON_STR)?)?,
            Zonal::Mean => data.mean_dim(LON_STR)?,
        };

        let pre_averaged = self.spec.dtype_in_time.is_pre_averaged() || !self.spec.var.def_time;
        if kind.regional {
            let mut by_region = BTreeMap::new();
            for region in &self.spec.regions {
                by_region.insert(
                    region.name.clone(),
                    region.reduce(&data, kind.reducer, pre_averaged)?,
                );
            }
            Ok(Artifact::Regional(by_region))
        } else if self.spec.var.def_time {
            Ok(Artifact::Field(self.time_reduce(&data, kind.reducer)?))
        } else {
            Ok(Artifact::Field(data))
        }
    }

    /// Compute every requested output kind and save it.
    pub fn compute(&mut self) -> Result<(), CalcError> {
        info!("Computing {} for {} -- {}", self, self.start_date, self.end_date);
        let operands = self.gather_inputs()?;
        let series = self.compute_all_series(&operands)?;

        let mut reduced = Vec::with_capacity(self.kinds.len());
        for kind in &self.kinds {
            reduced.push((kind.label().to_string(), self.reduce(&series, kind)?));
        }
        self.set_state(CalcState::Reduced);

        let archive = self.config.archive;
        for (kind, artifact) in reduced {
            self.save(&kind, artifact, archive)?;
        }
        self.set_state(CalcState::Saved);
        Ok(())
    }

    /// Save a result to scratch, and to the archive if `archive`.
    pub fn save(&mut self, kind: &str, artifact: Artifact, archive: bool) -> Result<(), CalcError> {
        let path = self
            .path_scratch(kind)
            .ok_or_else(|| CalcError::InvalidSpec(format!("'{}' is not an output of {}", kind, self)))?;
        let written = store::save_to_scratch(&path, artifact)?;
        self.data_out.insert(kind.to_string(), written);
        if archive {
            let tar = self.path_archive();
            self.stage(&[tar.clone()])?;
            if let Some(entry) = self.file_name(kind) {
                store::save_to_archive(&tar, entry, &path)?;
            }
        }
        info!("\t{}", path.display());
        Ok(())
    }

    fn load_stored(&self, kind: &str) -> Result<Artifact, CalcError> {
        let path = self
            .path_scratch(kind)
            .ok_or_else(|| CalcError::InvalidSpec(format!("'{}' is not an output of {}", kind, self)))?;
        match store::read_artifact(&path) {
            Ok(artifact) => Ok(artifact),
            Err(PersistenceError::Io { .. }) => {
                let tar = self.path_archive();
                debug!("{} not on scratch; trying {}", path.display(), tar.display());
                self.stage(&[tar.clone()])?;
                let entry = self.file_name(kind).unwrap_or_default();
                Ok(store::load_from_archive(&tar, entry)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load a result: from memory, else scratch, else the archive.
    pub fn load(&mut self, kind: &str, options: &LoadOptions) -> Result<Artifact, CalcError> {
        let artifact = match self.data_out.get(kind) {
            Some(a) => a.clone(),
            None => {
                let a = self.load_stored(kind)?;
                self.data_out.insert(kind.to_string(), a.clone());
                a
            }
        };
        self.subset(artifact, options)
    }

    /// A result from memory or storage, computing everything if neither has it.
    pub fn get_or_compute(&mut self, kind: &str) -> Result<Artifact, CalcError> {
        match self.load(kind, &LoadOptions::default()) {
            Ok(a) => Ok(a),
            Err(CalcError::Persistence(_)) => {
                self.compute()?;
                self.load(kind, &LoadOptions::default())
            }
            Err(e) => Err(e),
        }
    }

    fn subset(&self, artifact: Artifact, options: &LoadOptions) -> Result<Artifact, CalcError> {
        let artifact = match &options.region {
            Some(region) => Artifact::Field(
                artifact
                    .region(region)
                    .cloned()
                    .ok_or_else(|| CalcError::UnknownRegion(region.clone()))?,
            ),
            None => artifact,
        };
        let subset_one = |arr: &DataArray| -> Result<DataArray, CalcError> {
            let mut arr = arr.clone();
            if let Some(years) = options.years {
                arr = self.select_years(arr, years)?;
            }
            if let Some(level) = options.level {
                arr = self.select_level(arr, level)?;
            }
            if options.mask_unphysical {
                if let Some((lo, hi)) = self.spec.var.valid_range {
                    arr = arr.map(|v| if v < lo || v > hi { f64::NAN } else { v });
                }
            }
            if options.plot_units {
                let conv = self.spec.var.plot_units_conv;
                arr = arr.map(|v| v * conv);
            }
            Ok(arr)
        };
        Ok(match artifact {
            Artifact::Field(a) => Artifact::Field(subset_one(&a)?),
            Artifact::Regional(r) => Artifact::Regional(
                r.iter()
                    .map(|(k, v)| Ok((k.clone(), subset_one(v)?)))
                    .collect::<Result<_, CalcError>>()?,
            ),
        })
    }

    fn select_years(&self, arr: DataArray, (first, last): (i32, i32)) -> Result<DataArray, CalcError> {
        if !arr.has_dim(YEAR_STR) {
            return Ok(arr);
        }
        let years = arr.coord_1d(YEAR_STR)?;
        let indices: Vec<usize> = years
            .iter()
            .enumerate()
            .filter(|(_, y)| **y >= first as f64 && **y <= last as f64)
            .map(|(i, _)| i)
            .collect();
        let arr = arr.isel(YEAR_STR, &indices)?;
        if self.spec.dtype_in_time.monthly_from {
            return Ok(arr.mean_dim(YEAR_STR)?);
        }
        Ok(arr)
    }

    fn select_level(&self, arr: DataArray, level_hpa: f64) -> Result<DataArray, CalcError> {
        if self.spec.dtype_in_vert == Some(VertType::Sigma) || !arr.has_dim(PLEVEL_STR) {
            return Ok(arr);
        }
        let levels = match arr.coord_1d(PLEVEL_STR) {
            Ok(levels) => levels,
            Err(_) => self
                .spec
                .model
                .grid
                .level
                .clone()
                .ok_or_else(|| self.missing_grid(PLEVEL_STR))?,
        };
        let max = levels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let scale = if max > 1e4 { 1e-2 } else { 1.0 };
        let index = levels
            .iter()
            .position(|l| (l * scale - level_hpa).abs() < 1e-6)
            .ok_or_else(|| {
                CalcError::InvalidSpec(format!("level {} hPa not in '{}'", level_hpa, arr.name))
            })?;
        Ok(arr.isel(PLEVEL_STR, &[index])?.sum_dim(PLEVEL_STR)?)
    }
}

impl fmt::Display for Calc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Calc object: {}, {}, {}, {}",
            self.spec.var.name, self.spec.project.name, self.spec.model.name, self.run_str_full
        )
    }
}

impl fmt::Debug for Calc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calc")
            .field("var", &self.spec.var.name)
            .field("runs", &self.run_str_full)
            .field("state", &self.state)
            .field("paths", &self.paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::DictLocator;
    use crate::model::GridMetadata;
    use chrono::NaiveDate;

    fn date(y: i32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn spec(runs: &[&str]) -> CalcSpec {
        let project = Arc::new(Project::new("proj"));
        let model = Arc::new(Model::new("am2", GridMetadata::default()));
        let runs: Vec<Arc<Run>> = runs
            .iter()
            .map(|r| Arc::new(Run::new(r, Arc::new(DictLocator::default()))))
            .collect();
        CalcSpec::new(project, model, Arc::clone(&runs[0]), Arc::new(Var::new("olr").def_time(true)))
            .runs(runs)
            .date_range(date(2000), date(2002))
            .dtype_out_time(&["av", "reg.ts"])
            .regions(vec![Region::new("globe", (-90.0, 90.0), (0.0, 360.0))])
    }

    #[test]
    fn test_paths_are_deterministic() {
        let config = Arc::new(Config::for_testing(Path::new("/tmp/root")));
        let calc = Calc::new(spec(&["cont", "ctrl"]), Arc::clone(&config)).unwrap();
        assert_eq!(
            calc.paths().dir_scratch,
            PathBuf::from("/tmp/root/work/tester/proj/am2/cont_ctrl/olr")
        );
        assert_eq!(
            calc.path_archive(),
            PathBuf::from("/tmp/root/archive/tester/proj/data/am2/cont_ctrl/data.tar")
        );
        assert_eq!(
            calc.file_name("av").unwrap(),
            "olr.ann.av.from_monthly_ts.am2.cont_ctrl.2000-2002.json"
        );

        let again = Calc::new(spec(&["cont", "ctrl"]), config).unwrap();
        assert_eq!(calc.paths(), again.paths());
        assert_eq!(calc.state(), CalcState::Constructed);
    }

    #[test]
    fn test_run_labels_sorted_and_ordered() {
        let config = Arc::new(Config::for_testing(Path::new("/r")));
        let calc = Calc::new(spec(&["b", "a", "b"]), config).unwrap();
        assert!(calc.paths().dir_scratch.ends_with("a_b/olr"));
        assert!(calc.file_name("reg.ts").unwrap().contains(".b_a_b."));
    }

    #[test]
    fn test_rejects_bad_output_kind() {
        let config = Arc::new(Config::for_testing(Path::new("/r")));
        let err = Calc::new(spec(&["a"]).dtype_out_time(&["reg.zmean.av"]), config).unwrap_err();
        assert!(matches!(err, CalcError::UnsupportedReduction(_)));
    }

    #[test]
    fn test_rejects_inverted_dates() {
        let config = Arc::new(Config::for_testing(Path::new("/r")));
        let err = Calc::new(spec(&["a"]).date_range(date(2002), date(2000)), config).unwrap_err();
        assert!(matches!(err, CalcError::InvalidDateRange(_)));
    }

    #[test]
    fn test_regional_needs_regions() {
        let config = Arc::new(Config::for_testing(Path::new("/r")));
        let err = Calc::new(spec(&["a"]).regions(Vec::new()), config).unwrap_err();
        assert!(matches!(err, CalcError::InvalidSpec(_)));
    }

    #[test]
    fn test_ensemble_in_paths() {
        let config = Arc::new(Config::for_testing(Path::new("/r")));
        let calc = Calc::new(spec(&["a"]).ens_mem(EnsembleMember::Member(1)), config).unwrap();
        assert!(calc.paths().dir_scratch.ends_with("a/mem2/olr"));
        assert!(calc.file_name("av").unwrap().ends_with(".a.mem2.2000-2002.json"));
    }
}
