//! Descriptions of what is computed (variables) and where the data comes
//! from (projects, models, runs).

use crate::dataset::{Coord, DataArray, Dataset, DatasetError};
use crate::locator::FileLocator;
use crate::names::{
    BK_STR, DP_STR, LAND_MASK_STR, LAT_BOUNDS_STR, LAT_STR, LON_BOUNDS_STR, LON_STR, PFULL_STR,
    PHALF_STR, PK_STR, PLEVEL_STR, PS_STR, P_STR, SFC_AREA_STR, ZSURF_STR,
};
use chrono::NaiveDateTime;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Vertical extent of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertDef {
    #[default]
    None,
    /// Defined at full (layer-centre) levels
    Full,
    /// Defined at half (interface) levels
    Half,
}

/// Vertical coordinate of the input data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertType {
    /// Fixed pressure levels
    Pressure,
    /// Hybrid sigma-pressure levels
    Sigma,
}

impl VertType {
    pub fn label(&self) -> &'static str {
        match self {
            VertType::Pressure => "pressure",
            VertType::Sigma => "sigma",
        }
    }

    /// Name of the vertical dimension data on these levels carry.
    pub fn dim(&self) -> &'static str {
        match self {
            VertType::Pressure => PLEVEL_STR,
            VertType::Sigma => PFULL_STR,
        }
    }
}

impl FromStr for VertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pressure" => Ok(VertType::Pressure),
            "sigma" | "hybrid" => Ok(VertType::Sigma),
            other => Err(format!("unknown vertical coordinate type '{}'", other)),
        }
    }
}

/// Base kind of the input time sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingKind {
    /// Time series of interval averages
    Ts,
    /// Multi-year climatological averages
    Av,
    /// Time series of climatological averages
    AvTs,
    /// Instantaneous snapshots
    Inst,
}

/// How the input data was sampled in time, e.g. `ts`, `inst`,
/// `monthly_from_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSampling {
    pub kind: SamplingKind,
    /// Monthly means were pre-computed from the base sampling
    pub monthly_from: bool,
}

impl TimeSampling {
    pub const TS: TimeSampling = TimeSampling {
        kind: SamplingKind::Ts,
        monthly_from: false,
    };
    pub const INST: TimeSampling = TimeSampling {
        kind: SamplingKind::Inst,
        monthly_from: false,
    };
    pub const AV: TimeSampling = TimeSampling {
        kind: SamplingKind::Av,
        monthly_from: false,
    };

    pub fn base_label(&self) -> &'static str {
        match self.kind {
            SamplingKind::Ts => "ts",
            SamplingKind::Av => "av",
            SamplingKind::AvTs => "av_ts",
            SamplingKind::Inst => "inst",
        }
    }

    pub fn is_inst(&self) -> bool {
        self.kind == SamplingKind::Inst && !self.monthly_from
    }

    /// Input was already averaged over years.
    pub fn is_pre_averaged(&self) -> bool {
        matches!(self.kind, SamplingKind::Av | SamplingKind::AvTs)
    }
}

impl fmt::Display for TimeSampling {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.monthly_from {
            write!(f, "monthly_from_{}", self.base_label())
        } else {
            write!(f, "{}", self.base_label())
        }
    }
}

impl FromStr for TimeSampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (monthly_from, base) = match s.strip_prefix("monthly_from_") {
            Some(base) => (true, base),
            None => (false, s),
        };
        let kind = match base {
            "ts" => SamplingKind::Ts,
            "av" => SamplingKind::Av,
            "av_ts" => SamplingKind::AvTs,
            "inst" => SamplingKind::Inst,
            other => return Err(format!("unknown time sampling '{}'", other)),
        };
        Ok(TimeSampling { kind, monthly_from })
    }
}

impl TryFrom<String> for TimeSampling {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeSampling> for String {
    fn from(t: TimeSampling) -> String {
        t.to_string()
    }
}

/// Ensemble member selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMember {
    /// Zero-based member index
    Member(usize),
    Mean,
}

impl EnsembleMember {
    pub fn label(member: Option<EnsembleMember>) -> String {
        match member {
            None => String::new(),
            Some(EnsembleMember::Member(n)) => format!("mem{}", n + 1),
            Some(EnsembleMember::Mean) => "ens_mean".to_string(),
        }
    }
}

/// A transform operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Array(DataArray),
    Scalar(f64),
}

impl Operand {
    pub fn as_array(&self) -> Option<&DataArray> {
        match self {
            Operand::Array(a) => Some(a),
            Operand::Scalar(_) => None,
        }
    }

    /// The operand as an array, promoting scalars to 0-d arrays.
    pub fn to_array(&self, name: &str) -> DataArray {
        match self {
            Operand::Array(a) => a.clone(),
            Operand::Scalar(v) => DataArray::scalar(name, *v),
        }
    }
}

/// A transform operand stripped of its labels
#[derive(Debug, Clone, PartialEq)]
pub enum RawOperand {
    Array(ArrayD<f64>),
    Scalar(f64),
}

pub type ArraysFn = dyn Fn(&[Operand]) -> Result<DataArray, DatasetError> + Send + Sync;
pub type SetFn = dyn Fn(&BTreeMap<String, Operand>) -> Result<DataArray, DatasetError> + Send + Sync;
pub type RawFn = dyn Fn(&[RawOperand]) -> Result<ArrayD<f64>, DatasetError> + Send + Sync;

/// User-supplied computation over a variable's inputs.
///
/// The variant fixes the container the inputs arrive in: positional labeled
/// arrays, labeled arrays keyed by input name, or bare numeric buffers. Raw
/// results are re-labeled with the coordinates of the first array input.
#[derive(Clone)]
pub enum Transform {
    Arrays(Arc<ArraysFn>),
    Set(Arc<SetFn>),
    Raw(Arc<RawFn>),
}

impl Transform {
    pub fn arrays<F>(f: F) -> Self
    where
        F: Fn(&[Operand]) -> Result<DataArray, DatasetError> + Send + Sync + 'static,
    {
        Transform::Arrays(Arc::new(f))
    }

    pub fn set<F>(f: F) -> Self
    where
        F: Fn(&BTreeMap<String, Operand>) -> Result<DataArray, DatasetError> + Send + Sync + 'static,
    {
        Transform::Set(Arc::new(f))
    }

    pub fn raw<F>(f: F) -> Self
    where
        F: Fn(&[RawOperand]) -> Result<ArrayD<f64>, DatasetError> + Send + Sync + 'static,
    {
        Transform::Raw(Arc::new(f))
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Arrays(_) => write!(f, "Transform::Arrays"),
            Transform::Set(_) => write!(f, "Transform::Set"),
            Transform::Raw(_) => write!(f, "Transform::Raw"),
        }
    }
}

/// One input of a derived variable
#[derive(Debug, Clone)]
pub enum Input {
    Var(Arc<Var>),
    Constant { name: String, value: f64 },
}

impl Input {
    pub fn name(&self) -> &str {
        match self {
            Input::Var(v) => &v.name,
            Input::Constant { name, .. } => name,
        }
    }
}

/// A physical quantity, either read from disk or derived from other inputs
#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    /// Alternate on-disk names, in priority order
    pub alt_names: Vec<String>,
    pub description: String,
    pub units: String,
    /// Output-stream domain used in directory conventions, e.g. `atmos`
    pub domain: String,
    pub def_time: bool,
    pub def_vert: VertDef,
    pub transform: Option<Transform>,
    pub inputs: Vec<Input>,
    pub plot_units: String,
    /// Factor applied when loading in plot units
    pub plot_units_conv: f64,
    /// Physically meaningful range; values outside are masked on request
    pub valid_range: Option<(f64, f64)>,
}

impl Var {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            alt_names: Vec::new(),
            description: String::new(),
            units: String::new(),
            domain: "atmos".to_string(),
            def_time: false,
            def_vert: VertDef::None,
            transform: None,
            inputs: Vec::new(),
            plot_units: String::new(),
            plot_units_conv: 1.0,
            valid_range: None,
        }
    }

    pub fn alt_names(mut self, names: &[&str]) -> Self {
        self.alt_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn def_time(mut self, def_time: bool) -> Self {
        self.def_time = def_time;
        self
    }

    pub fn def_vert(mut self, def_vert: VertDef) -> Self {
        self.def_vert = def_vert;
        self
    }

    pub fn transform(mut self, transform: Transform, inputs: Vec<Input>) -> Self {
        self.transform = Some(transform);
        self.inputs = inputs;
        self
    }

    pub fn plot_units(mut self, units: &str, conv: f64) -> Self {
        self.plot_units = units.to_string();
        self.plot_units_conv = conv;
        self
    }

    pub fn valid_range(mut self, min: f64, max: f64) -> Self {
        self.valid_range = Some((min, max));
        self
    }

    /// Canonical name followed by the alternates.
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.alt_names.iter().map(String::as_str))
            .collect()
    }

    pub fn is_derived(&self) -> bool {
        self.transform.is_some()
    }

    /// Pressure at the data's vertical levels
    pub fn pressure() -> Self {
        Var::new(P_STR).def_time(true).def_vert(VertDef::Full).units("Pa")
    }

    /// Pressure thickness of each vertical layer
    pub fn pressure_thickness() -> Self {
        Var::new(DP_STR).def_time(true).def_vert(VertDef::Full).units("Pa")
    }

    pub fn surface_pressure() -> Self {
        Var::new(PS_STR)
            .alt_names(&["PS", "sp"])
            .def_time(true)
            .units("Pa")
            .description("Surface pressure.")
    }
}

/// Grid description shared by every run of a model
#[derive(Debug, Clone, Default)]
pub struct GridMetadata {
    pub lat: Option<Vec<f64>>,
    pub lat_bounds: Option<Vec<f64>>,
    pub lon: Option<Vec<f64>>,
    pub lon_bounds: Option<Vec<f64>>,
    /// Pressure levels, hPa or Pa
    pub level: Option<Vec<f64>>,
    pub pfull: Option<Vec<f64>>,
    pub phalf: Option<Vec<f64>>,
    /// Hybrid A coefficients at half levels
    pub pk: Option<Vec<f64>>,
    /// Hybrid B coefficients at half levels
    pub bk: Option<Vec<f64>>,
    /// Cell area on the (lat, lon) grid
    pub sfc_area: Option<DataArray>,
    /// Land fraction on the (lat, lon) grid
    pub land_mask: Option<DataArray>,
    pub zsurf: Option<DataArray>,
}

/// Names served from grid metadata instead of data files.
pub const GRID_ONLY_NAMES: [&str; 12] = [
    LAT_STR,
    LAT_BOUNDS_STR,
    LON_STR,
    LON_BOUNDS_STR,
    PLEVEL_STR,
    PFULL_STR,
    PHALF_STR,
    PK_STR,
    BK_STR,
    SFC_AREA_STR,
    LAND_MASK_STR,
    ZSURF_STR,
];

impl GridMetadata {
    /// Pick the grid fields out of a dataset whose attributes have already
    /// been given their canonical names.
    pub fn from_dataset(ds: &Dataset) -> Result<Self, DatasetError> {
        let vector =
            |name: &str| -> Option<Vec<f64>> { ds.get(name).map(|v| v.values.iter().copied().collect()) };
        let field = |name: &str| -> Result<Option<DataArray>, DatasetError> {
            match ds.get(name) {
                Some(v) => {
                    let dims: Vec<&str> = v.dims.iter().map(String::as_str).collect();
                    Ok(Some(DataArray::new(name, &dims, v.values.clone())?.transpose_canonical()))
                }
                None => Ok(None),
            }
        };
        Ok(Self {
            lat: vector(LAT_STR),
            lat_bounds: vector(LAT_BOUNDS_STR),
            lon: vector(LON_STR),
            lon_bounds: vector(LON_BOUNDS_STR),
            level: vector(PLEVEL_STR),
            pfull: vector(PFULL_STR),
            phalf: vector(PHALF_STR),
            pk: vector(PK_STR),
            bk: vector(BK_STR),
            sfc_area: field(SFC_AREA_STR)?,
            land_mask: field(LAND_MASK_STR)?,
            zsurf: field(ZSURF_STR)?,
        })
    }

    /// Fill fields missing here from `other`.
    pub fn merge(mut self, other: GridMetadata) -> Self {
        self.lat = self.lat.or(other.lat);
        self.lat_bounds = self.lat_bounds.or(other.lat_bounds);
        self.lon = self.lon.or(other.lon);
        self.lon_bounds = self.lon_bounds.or(other.lon_bounds);
        self.level = self.level.or(other.level);
        self.pfull = self.pfull.or(other.pfull);
        self.phalf = self.phalf.or(other.phalf);
        self.pk = self.pk.or(other.pk);
        self.bk = self.bk.or(other.bk);
        self.sfc_area = self.sfc_area.or(other.sfc_area);
        self.land_mask = self.land_mask.or(other.land_mask);
        self.zsurf = self.zsurf.or(other.zsurf);
        self
    }

    /// A grid quantity as a labeled array.
    pub fn field(&self, name: &str) -> Option<DataArray> {
        let vector = |values: &Option<Vec<f64>>, dim: &str| {
            values.as_ref().map(|v| DataArray::from_vec(name, dim, v.clone()))
        };
        match name {
            LAT_STR => vector(&self.lat, LAT_STR),
            LAT_BOUNDS_STR => vector(&self.lat_bounds, LAT_BOUNDS_STR),
            LON_STR => vector(&self.lon, LON_STR),
            LON_BOUNDS_STR => vector(&self.lon_bounds, LON_BOUNDS_STR),
            PLEVEL_STR => vector(&self.level, PLEVEL_STR),
            PFULL_STR => vector(&self.pfull, PFULL_STR),
            PHALF_STR => vector(&self.phalf, PHALF_STR),
            PK_STR => vector(&self.pk, PHALF_STR),
            BK_STR => vector(&self.bk, PHALF_STR),
            SFC_AREA_STR => self.sfc_area.clone(),
            LAND_MASK_STR => self.land_mask.clone(),
            ZSURF_STR => self.zsurf.clone(),
            _ => None,
        }
    }

    /// Grid coordinates that can label a field, as `(name, coord)` pairs.
    pub fn coords(&self) -> Vec<(String, Coord)> {
        let mut out = Vec::new();
        for (name, values) in [
            (LAT_STR, &self.lat),
            (LON_STR, &self.lon),
            (PLEVEL_STR, &self.level),
            (PFULL_STR, &self.pfull),
            (PHALF_STR, &self.phalf),
        ] {
            if let Some(v) = values {
                out.push((
                    name.to_string(),
                    Coord::new(&[name], ndarray::Array1::from(v.clone()).into_dyn()),
                ));
            }
        }
        for field in [&self.sfc_area, &self.land_mask, &self.zsurf].into_iter().flatten() {
            let dims: Vec<&str> = field.dims.iter().map(String::as_str).collect();
            out.push((field.name.clone(), Coord::new(&dims, field.values.clone())));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub description: String,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub description: String,
    pub grid: GridMetadata,
    /// Reference pressure multiplying the hybrid A coefficients
    pub reference_pressure: f64,
}

impl Model {
    pub fn new(name: &str, grid: GridMetadata) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            grid,
            reference_pressure: 1.0,
        }
    }
}

/// One simulation or observational product
#[derive(Debug, Clone)]
pub struct Run {
    pub name: String,
    pub description: String,
    pub default_date_range: Option<(NaiveDateTime, NaiveDateTime)>,
    pub locator: Arc<dyn FileLocator>,
    /// Idealized runs have no meaningful calendar; no year averaging is done
    pub idealized: bool,
}

impl Run {
    /// A run whose default date range is that of its locator, if any.
    pub fn new(name: &str, locator: Arc<dyn FileLocator>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            default_date_range: locator.default_date_range(),
            locator,
            idealized: false,
        }
    }

    pub fn with_default_date_range(mut self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        self.default_date_range = Some((start, end));
        self
    }
}
