//! In-memory gridded data: raw datasets as read from disk and the labeled
//! arrays that flow through a calculation.

use crate::names::{dim_rank, TIME_STR, YEAR_STR};
use crate::time_utils::{apply_time_offset, Calendar, TimeError};
use chrono::{Datelike, NaiveDateTime};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

pub mod normalize;
pub mod reader;

pub use normalize::load_variable;
pub use reader::{create_reader, DatasetReader, JsonReader};

/// Errors raised while reading or manipulating gridded data
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Variable '{name}' not found under any of its names {aliases:?}")]
    VariableNotFound { name: String, aliases: Vec<String> },

    #[error("Dimension not found: {0}")]
    MissingDimension(String),

    #[error("Coordinate not found: {0}")]
    MissingCoordinate(String),

    #[error("Attribute not found: {0}")]
    MissingAttribute(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Time decoding error: {0}")]
    Time(#[from] TimeError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "netcdf")]
    #[error("NetCDF error: {0}")]
    Netcdf(#[from] netcdf::Error),
}

impl From<ndarray::ShapeError> for DatasetError {
    fn from(e: ndarray::ShapeError) -> Self {
        DatasetError::ShapeMismatch(e.to_string())
    }
}

/// Supported attribute value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Double(f64),
    DoubleArray(Vec<f64>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(v) => Some(*v),
            AttributeValue::DoubleArray(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Array (de)serialization as `{shape, data}` with non-finite values as `null`.
pub(crate) mod array_serde {
    use ndarray::{ArrayD, IxDyn};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Repr {
        shape: Vec<usize>,
        data: Vec<Option<f64>>,
    }

    pub fn serialize<S: Serializer>(arr: &ArrayD<f64>, s: S) -> Result<S::Ok, S::Error> {
        Repr {
            shape: arr.shape().to_vec(),
            data: arr.iter().map(|v| v.is_finite().then_some(*v)).collect(),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ArrayD<f64>, D::Error> {
        let repr = Repr::deserialize(d)?;
        let data = repr.data.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        ArrayD::from_shape_vec(IxDyn(&repr.shape), data).map_err(serde::de::Error::custom)
    }
}

/// One field of a raw dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub dims: Vec<String>,
    #[serde(with = "array_serde")]
    pub values: ArrayD<f64>,
    #[serde(default)]
    pub attrs: Attributes,
}

impl Variable {
    pub fn new(dims: &[&str], values: ArrayD<f64>) -> Result<Self, DatasetError> {
        if dims.len() != values.ndim() {
            return Err(DatasetError::ShapeMismatch(format!(
                "{} dimension names for a {}-d array",
                dims.len(),
                values.ndim()
            )));
        }
        Ok(Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            values,
            attrs: Attributes::new(),
        })
    }

    pub fn with_attr(mut self, name: &str, value: AttributeValue) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttributeValue::as_str)
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.values.shape()[i])
    }
}

/// Decoded time axis shared by all time-dependent fields of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAxis {
    pub dates: Vec<NaiveDateTime>,
    #[serde(default)]
    pub calendar: Calendar,
    /// Length of each step's averaging window, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durations: Option<Vec<f64>>,
    /// True start and end of each step's averaging window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Vec<(NaiveDateTime, NaiveDateTime)>>,
}

impl TimeAxis {
    pub fn new(dates: Vec<NaiveDateTime>, calendar: Calendar) -> Self {
        Self {
            dates,
            calendar,
            durations: None,
            bounds: None,
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn select(&self, indices: &[usize]) -> TimeAxis {
        TimeAxis {
            dates: indices.iter().map(|&i| self.dates[i]).collect(),
            calendar: self.calendar,
            durations: self
                .durations
                .as_ref()
                .map(|d| indices.iter().map(|&i| d[i]).collect()),
            bounds: self
                .bounds
                .as_ref()
                .map(|b| indices.iter().map(|&i| b[i]).collect()),
        }
    }

    pub fn concat(axes: &[&TimeAxis]) -> Result<TimeAxis, DatasetError> {
        let first = axes
            .first()
            .ok_or_else(|| DatasetError::ShapeMismatch("no time axes to concatenate".into()))?;
        if axes.iter().any(|a| a.calendar != first.calendar) {
            return Err(DatasetError::ShapeMismatch(
                "cannot concatenate time axes with different calendars".into(),
            ));
        }
        let durations = if axes.iter().all(|a| a.durations.is_some()) {
            Some(axes.iter().flat_map(|a| a.durations.iter().flatten().copied()).collect())
        } else {
            None
        };
        let bounds = if axes.iter().all(|a| a.bounds.is_some()) {
            Some(axes.iter().flat_map(|a| a.bounds.iter().flatten().copied()).collect())
        } else {
            None
        };
        Ok(TimeAxis {
            dates: axes.iter().flat_map(|a| a.dates.iter().copied()).collect(),
            calendar: first.calendar,
            durations,
            bounds,
        })
    }

    /// Indices of each group of steps sharing a key, in key order.
    pub fn group_by<K: Ord, F: Fn(&NaiveDateTime) -> K>(&self, key: F) -> Vec<(K, Vec<usize>)> {
        let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
        for (i, date) in self.dates.iter().enumerate() {
            groups.entry(key(date)).or_default().push(i);
        }
        groups.into_iter().collect()
    }

    /// Move every step, and its bounds, by `hours`.
    pub fn shift_hours(&self, hours: i64) -> Result<TimeAxis, DatasetError> {
        let bounds = match &self.bounds {
            Some(b) => {
                let (starts, ends): (Vec<_>, Vec<_>) = b.iter().copied().unzip();
                let starts = apply_time_offset(&starts, hours, self.calendar)?;
                let ends = apply_time_offset(&ends, hours, self.calendar)?;
                Some(starts.into_iter().zip(ends).collect())
            }
            None => None,
        };
        Ok(TimeAxis {
            dates: apply_time_offset(&self.dates, hours, self.calendar)?,
            calendar: self.calendar,
            durations: self.durations.clone(),
            bounds,
        })
    }
}

/// A set of raw variables read from one or more files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    #[serde(default)]
    pub attrs: Attributes,
    /// Variables that ride along with every selected field
    #[serde(default)]
    pub coord_names: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeAxis>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, variable: Variable) {
        self.variables.insert(name.to_string(), variable);
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Variable and dimension names present in the dataset.
    pub fn names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.variables.keys().cloned().collect();
        for var in self.variables.values() {
            names.extend(var.dims.iter().cloned());
        }
        names
    }

    /// Rename a variable and any dimension of the same name.
    pub fn rename(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        if let Some(var) = self.variables.remove(old) {
            self.variables.insert(new.to_string(), var);
        }
        for var in self.variables.values_mut() {
            for dim in var.dims.iter_mut() {
                if dim == old {
                    *dim = new.to_string();
                }
            }
        }
        if self.coord_names.remove(old) {
            self.coord_names.insert(new.to_string());
        }
    }
}

/// A coordinate carried by a labeled array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub dims: Vec<String>,
    #[serde(with = "array_serde")]
    pub values: ArrayD<f64>,
}

impl Coord {
    pub fn new(dims: &[&str], values: ArrayD<f64>) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            values,
        }
    }
}

/// How to collapse a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    /// Population standard deviation
    Std,
}

/// A named n-dimensional field with labeled dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    pub name: String,
    pub dims: Vec<String>,
    #[serde(with = "array_serde")]
    pub values: ArrayD<f64>,
    #[serde(default)]
    pub coords: BTreeMap<String, Coord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeAxis>,
    #[serde(default)]
    pub attrs: Attributes,
}

fn merged_dims(a: &[String], b: &[String]) -> Vec<String> {
    let mut dims: Vec<String> = a.to_vec();
    dims.extend(b.iter().filter(|d| !a.contains(d)).cloned());
    dims.sort_by_key(|d| dim_rank(d));
    dims
}

impl DataArray {
    pub fn new(name: &str, dims: &[&str], values: ArrayD<f64>) -> Result<Self, DatasetError> {
        if dims.len() != values.ndim() {
            return Err(DatasetError::ShapeMismatch(format!(
                "'{}': {} dimension names for a {}-d array",
                name,
                dims.len(),
                values.ndim()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            values,
            coords: BTreeMap::new(),
            time: None,
            attrs: Attributes::new(),
        })
    }

    /// A 0-d array
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            dims: Vec::new(),
            values: ArrayD::from_elem(IxDyn(&[]), value),
            coords: BTreeMap::new(),
            time: None,
            attrs: Attributes::new(),
        }
    }

    /// A 1-d array whose single dimension is `dim`
    pub fn from_vec(name: &str, dim: &str, values: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            dims: vec![dim.to_string()],
            values: ndarray::Array1::from(values).into_dyn(),
            coords: BTreeMap::new(),
            time: None,
            attrs: Attributes::new(),
        }
    }

    pub fn with_coord(mut self, name: &str, coord: Coord) -> Result<Self, DatasetError> {
        for (dim, len) in coord.dims.iter().zip(coord.values.shape()) {
            if let Some(own) = self.dim_len(dim) {
                if own != *len {
                    return Err(DatasetError::ShapeMismatch(format!(
                        "coordinate '{}' has {} entries along '{}', array has {}",
                        name, len, dim, own
                    )));
                }
            }
        }
        self.coords.insert(name.to_string(), coord);
        Ok(self)
    }

    pub fn with_time(mut self, time: TimeAxis) -> Result<Self, DatasetError> {
        let n = self
            .dim_len(TIME_STR)
            .ok_or_else(|| DatasetError::MissingDimension(TIME_STR.into()))?;
        if n != time.len() {
            return Err(DatasetError::ShapeMismatch(format!(
                "time axis has {} steps, array has {}",
                time.len(),
                n
            )));
        }
        self.time = Some(time);
        Ok(self)
    }

    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dims.iter().any(|d| d == dim)
    }

    pub fn axis(&self, dim: &str) -> Result<usize, DatasetError> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| DatasetError::MissingDimension(format!("{} in '{}'", dim, self.name)))
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.values.shape()[i])
    }

    /// Values of a 1-d coordinate, or of a dimension coordinate.
    pub fn coord_1d(&self, name: &str) -> Result<Vec<f64>, DatasetError> {
        let coord = self
            .coords
            .get(name)
            .ok_or_else(|| DatasetError::MissingCoordinate(format!("{} on '{}'", name, self.name)))?;
        if coord.values.ndim() != 1 {
            return Err(DatasetError::ShapeMismatch(format!(
                "coordinate '{}' is {}-d, expected 1-d",
                name,
                coord.values.ndim()
            )));
        }
        Ok(coord.values.iter().copied().collect())
    }

    pub fn time_axis(&self) -> Result<&TimeAxis, DatasetError> {
        self.time
            .as_ref()
            .ok_or_else(|| DatasetError::MissingCoordinate(format!("time on '{}'", self.name)))
    }

    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> DataArray {
        DataArray {
            values: self.values.mapv(f),
            ..self.clone()
        }
    }

    /// Replace the values, keeping labels. The new values must have the same shape.
    pub fn with_values(&self, values: ArrayD<f64>) -> Result<DataArray, DatasetError> {
        if values.shape() != self.values.shape() {
            return Err(DatasetError::ShapeMismatch(format!(
                "result shape {:?} does not match '{}' shape {:?}",
                values.shape(),
                self.name,
                self.values.shape()
            )));
        }
        Ok(DataArray {
            values,
            ..self.clone()
        })
    }

    fn expanded_view(&self, dims: &[String]) -> ArrayViewD<'_, f64> {
        let order: Vec<usize> = dims
            .iter()
            .filter_map(|d| self.dims.iter().position(|own| own == d))
            .collect();
        let mut view = self.values.view().permuted_axes(order);
        for (i, dim) in dims.iter().enumerate() {
            if !self.has_dim(dim) {
                view = view.insert_axis(Axis(i));
            }
        }
        view
    }

    /// Combine two arrays elementwise, broadcasting over dimension names.
    pub fn zip_with<F: Fn(f64, f64) -> f64>(
        &self,
        other: &DataArray,
        f: F,
    ) -> Result<DataArray, DatasetError> {
        let dims = merged_dims(&self.dims, &other.dims);
        let mut shape = Vec::with_capacity(dims.len());
        for dim in &dims {
            let len = match (self.dim_len(dim), other.dim_len(dim)) {
                (Some(a), Some(b)) if a != b => {
                    return Err(DatasetError::ShapeMismatch(format!(
                        "dimension '{}' has length {} in '{}' and {} in '{}'",
                        dim, a, self.name, b, other.name
                    )))
                }
                (Some(a), _) => a,
                (None, Some(b)) => b,
                (None, None) => 1,
            };
            shape.push(len);
        }

        let lhs = self.expanded_view(&dims);
        let rhs = other.expanded_view(&dims);
        let broadcast_err = || DatasetError::ShapeMismatch(format!("cannot broadcast to {:?}", shape));
        let lhs = lhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
        let rhs = rhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
        let values = Zip::from(&lhs).and(&rhs).map_collect(|&a, &b| f(a, b));

        let mut coords = other.coords.clone();
        coords.extend(self.coords.clone());
        Ok(DataArray {
            name: self.name.clone(),
            dims,
            values,
            coords,
            time: self.time.clone().or_else(|| other.time.clone()),
            attrs: self.attrs.clone(),
        })
    }

    pub fn add(&self, other: &DataArray) -> Result<DataArray, DatasetError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &DataArray) -> Result<DataArray, DatasetError> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &DataArray) -> Result<DataArray, DatasetError> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &DataArray) -> Result<DataArray, DatasetError> {
        self.zip_with(other, |a, b| a / b)
    }

    /// Select entries along one dimension by position.
    pub fn isel(&self, dim: &str, indices: &[usize]) -> Result<DataArray, DatasetError> {
        let axis = self.axis(dim)?;
        let len = self.values.shape()[axis];
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(DatasetError::ShapeMismatch(format!(
                "index {} out of range for '{}' of length {}",
                bad, dim, len
            )));
        }
        let values = self.values.select(Axis(axis), indices);
        let coords = self
            .coords
            .iter()
            .map(|(name, coord)| {
                let values = match coord.dims.iter().position(|d| d == dim) {
                    Some(ax) => coord.values.select(Axis(ax), indices),
                    None => coord.values.clone(),
                };
                (name.clone(), Coord { dims: coord.dims.clone(), values })
            })
            .collect();
        let time = match (&self.time, dim == TIME_STR) {
            (Some(t), true) => Some(t.select(indices)),
            (t, _) => t.clone(),
        };
        Ok(DataArray {
            name: self.name.clone(),
            dims: self.dims.clone(),
            values,
            coords,
            time,
            attrs: self.attrs.clone(),
        })
    }

    /// Collapse one dimension.
    pub fn reduce_dim(&self, dim: &str, how: Reduction) -> Result<DataArray, DatasetError> {
        let axis = Axis(self.axis(dim)?);
        if self.values.len_of(axis) == 0 {
            return Err(DatasetError::ShapeMismatch(format!(
                "cannot reduce empty dimension '{}' of '{}'",
                dim, self.name
            )));
        }
        let values = match how {
            Reduction::Sum => self.values.sum_axis(axis),
            Reduction::Mean => self
                .values
                .mean_axis(axis)
                .ok_or_else(|| DatasetError::ShapeMismatch(format!("empty '{}'", dim)))?,
            Reduction::Std => self.values.std_axis(axis, 0.0),
        };
        Ok(DataArray {
            name: self.name.clone(),
            dims: self.dims.iter().filter(|d| *d != dim).cloned().collect(),
            values,
            coords: self
                .coords
                .iter()
                .filter(|(_, c)| !c.dims.iter().any(|d| d == dim))
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect(),
            time: if dim == TIME_STR { None } else { self.time.clone() },
            attrs: self.attrs.clone(),
        })
    }

    pub fn mean_dim(&self, dim: &str) -> Result<DataArray, DatasetError> {
        self.reduce_dim(dim, Reduction::Mean)
    }

    pub fn sum_dim(&self, dim: &str) -> Result<DataArray, DatasetError> {
        self.reduce_dim(dim, Reduction::Sum)
    }

    /// Reorder axes to `[time|year, vertical, lat, lon, other]`.
    pub fn transpose_canonical(mut self) -> DataArray {
        let mut order: Vec<usize> = (0..self.dims.len()).collect();
        order.sort_by_key(|&i| dim_rank(&self.dims[i]));
        if order.iter().enumerate().all(|(i, &o)| i == o) {
            return self;
        }
        self.dims = order.iter().map(|&i| self.dims[i].clone()).collect();
        self.values = self
            .values
            .permuted_axes(order)
            .as_standard_layout()
            .into_owned();
        self
    }

    fn weighted_group_mean(
        &self,
        groups: &[Vec<usize>],
        weights: &[f64],
    ) -> Result<ArrayD<f64>, DatasetError> {
        let axis = Axis(self.axis(TIME_STR)?);
        let mut slab_shape = self.values.shape().to_vec();
        slab_shape.remove(axis.index());

        let mut slabs = Vec::with_capacity(groups.len());
        for indices in groups {
            let mut num = ArrayD::<f64>::zeros(IxDyn(&slab_shape));
            let mut den = 0.0;
            for &i in indices {
                num.scaled_add(weights[i], &self.values.index_axis(axis, i));
                den += weights[i];
            }
            if den == 0.0 {
                return Err(DatasetError::ShapeMismatch(format!(
                    "zero total weight in a time group of '{}'",
                    self.name
                )));
            }
            num.mapv_inplace(|v| v / den);
            slabs.push(num);
        }
        let views: Vec<_> = slabs.iter().map(|s| s.view()).collect();
        Ok(ndarray::stack(axis, &views)?)
    }

    /// Weighted average of each calendar year; `time` becomes `year`.
    pub fn year_weighted_mean(&self, weights: &[f64]) -> Result<DataArray, DatasetError> {
        let time = self.time_axis()?;
        if weights.len() != time.len() {
            return Err(DatasetError::ShapeMismatch(format!(
                "{} weights for {} time steps",
                weights.len(),
                time.len()
            )));
        }
        let groups = time.group_by(|d| d.year());
        let years: Vec<f64> = groups.iter().map(|(y, _)| *y as f64).collect();
        let indices: Vec<Vec<usize>> = groups.into_iter().map(|(_, idx)| idx).collect();
        let values = self.weighted_group_mean(&indices, weights)?;

        let mut coords: BTreeMap<String, Coord> = self
            .coords
            .iter()
            .filter(|(_, c)| !c.dims.iter().any(|d| d == TIME_STR))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        let n_years = years.len();
        coords.insert(
            YEAR_STR.to_string(),
            Coord::new(&[YEAR_STR], ArrayD::from_shape_vec(IxDyn(&[n_years]), years)?),
        );
        Ok(DataArray {
            name: self.name.clone(),
            dims: self
                .dims
                .iter()
                .map(|d| if d == TIME_STR { YEAR_STR.to_string() } else { d.clone() })
                .collect(),
            values,
            coords,
            time: None,
            attrs: self.attrs.clone(),
        })
    }

    /// Mean of each calendar month. Durations of the result are the mean
    /// duration of the member steps.
    pub fn monthly_mean(&self) -> Result<DataArray, DatasetError> {
        let time = self.time_axis()?;
        let groups: Vec<Vec<usize>> = time
            .group_by(|d| (d.year(), d.month()))
            .into_iter()
            .map(|(_, idx)| idx)
            .collect();
        let ones = vec![1.0; time.len()];
        let values = self.weighted_group_mean(&groups, &ones)?;

        let monthly_time = TimeAxis {
            dates: groups.iter().map(|g| time.dates[g[0]]).collect(),
            calendar: time.calendar,
            durations: time.durations.as_ref().map(|d| {
                groups
                    .iter()
                    .map(|g| g.iter().map(|&i| d[i]).sum::<f64>() / g.len() as f64)
                    .collect()
            }),
            bounds: time.bounds.as_ref().map(|b| {
                groups
                    .iter()
                    .map(|g| (b[g[0]].0, b[g[g.len() - 1]].1))
                    .collect()
            }),
        };
        let coords = self
            .coords
            .iter()
            .filter(|(_, c)| !c.dims.iter().any(|d| d == TIME_STR))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        Ok(DataArray {
            name: self.name.clone(),
            dims: self.dims.clone(),
            values,
            coords,
            time: Some(monthly_time),
            attrs: self.attrs.clone(),
        })
    }

    /// Expand a monthly series onto the steps of `full`, repeating each
    /// month's value at every step of that month.
    pub fn broadcast_months(&self, full: &TimeAxis) -> Result<DataArray, DatasetError> {
        let monthly = self.time_axis()?;
        let indices = full
            .dates
            .iter()
            .map(|d| {
                monthly
                    .dates
                    .iter()
                    .position(|m| m.year() == d.year() && m.month() == d.month())
                    .ok_or_else(|| {
                        DatasetError::ShapeMismatch(format!("no monthly value for {}", d))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut expanded = self.isel(TIME_STR, &indices)?;
        expanded.time = Some(full.clone());
        Ok(expanded)
    }

    /// Keep steps within `[start, end]` whose month is in `months`.
    pub fn sel_time(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        months: &[u32],
    ) -> Result<DataArray, DatasetError> {
        let time = match &self.time {
            Some(t) => t,
            None => return Ok(self.clone()),
        };
        let indices: Vec<usize> = time
            .dates
            .iter()
            .enumerate()
            .filter(|(_, d)| **d >= start && **d <= end && months.contains(&d.month()))
            .map(|(i, _)| i)
            .collect();
        self.isel(TIME_STR, &indices)
    }

    /// Join arrays end to end along `time`.
    pub fn concat_time(parts: &[DataArray]) -> Result<DataArray, DatasetError> {
        let first = parts
            .first()
            .ok_or_else(|| DatasetError::ShapeMismatch("nothing to concatenate".into()))?;
        if parts.len() == 1 {
            return Ok(first.clone());
        }
        if parts.iter().any(|p| p.dims != first.dims) {
            return Err(DatasetError::ShapeMismatch(format!(
                "cannot concatenate '{}': dimensions differ between parts",
                first.name
            )));
        }
        let axis = Axis(first.axis(TIME_STR)?);
        let views: Vec<_> = parts.iter().map(|p| p.values.view()).collect();
        let values = ndarray::concatenate(axis, &views)?;
        let axes = parts
            .iter()
            .map(|p| p.time_axis())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DataArray {
            name: first.name.clone(),
            dims: first.dims.clone(),
            values,
            coords: first
                .coords
                .iter()
                .filter(|(_, c)| !c.dims.iter().any(|d| d == TIME_STR))
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect(),
            time: Some(TimeAxis::concat(&axes)?),
            attrs: first.attrs.clone(),
        })
    }
}
