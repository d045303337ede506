//! Resolve a variable, date range and data tags to the source files holding it.

use crate::model::{SamplingKind, TimeSampling, Var, VertType};
use crate::names::PS_STR;
use crate::time_utils::{month_indices, parse_datetime, TimeError};
use chrono::{Datelike, NaiveDateTime};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Files for '{var}' between {start} and {end} could not be located (tried {tried:?})")]
    FilesNotFound {
        var: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tried: Vec<String>,
    },

    #[error("Unsupported directory convention: {0}")]
    UnsupportedDirectoryConvention(String),

    #[error("Unsupported input interval '{0}' for this directory convention")]
    UnsupportedInterval(String),

    #[error("Locator configuration is missing '{0}'")]
    MissingField(&'static str),

    #[error("Invalid locator date: {0}")]
    Time(#[from] TimeError),
}

/// Tags identifying one family of source files
#[derive(Debug, Clone, PartialEq)]
pub struct DataTags {
    /// Output-stream domain, e.g. `atmos`
    pub domain: String,
    /// Input interval, e.g. `monthly`, `daily`, `3hr`
    pub intvl_in: String,
    /// Output interval, e.g. `ann`, `djf`
    pub intvl_out: String,
    pub dtype_in_time: TimeSampling,
    pub dtype_in_vert: Option<VertType>,
}

/// Maps a variable and date range to an ordered, deduplicated list of files.
pub trait FileLocator: Send + Sync + Debug {
    /// Files holding `var` between `start` and `end`.
    ///
    /// Names are tried in the variable's priority order; the first name whose
    /// file set is non-empty and fully present on disk wins.
    fn locate(
        &self,
        var: &Var,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tags: &DataTags,
    ) -> Result<Vec<PathBuf>, LocateError>;

    /// Date range covered by the data, when the locator knows it.
    fn default_date_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        None
    }
}

/// Sorted, deduplicated `files` if the set is non-empty and every file exists.
fn resolve(files: &[PathBuf]) -> Option<Vec<PathBuf>> {
    if files.is_empty() {
        return None;
    }
    if let Some(missing) = files.iter().find(|f| !f.is_file()) {
        debug!("Missing source file {}", missing.display());
        return None;
    }
    let mut files = files.to_vec();
    files.sort();
    files.dedup();
    Some(files)
}

fn not_found(var: &Var, start: NaiveDateTime, end: NaiveDateTime, tried: Vec<String>) -> LocateError {
    LocateError::FilesNotFound {
        var: var.name.clone(),
        start,
        end,
        tried,
    }
}

/// One list of files per input interval, shared by every variable.
#[derive(Debug, Clone, Default)]
pub struct DictLocator {
    pub file_map: BTreeMap<String, Vec<PathBuf>>,
}

impl DictLocator {
    pub fn new(file_map: BTreeMap<String, Vec<PathBuf>>) -> Self {
        Self { file_map }
    }
}

impl FileLocator for DictLocator {
    fn locate(
        &self,
        var: &Var,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tags: &DataTags,
    ) -> Result<Vec<PathBuf>, LocateError> {
        self.file_map
            .get(&tags.intvl_in)
            .and_then(|files| resolve(files))
            .ok_or_else(|| not_found(var, start, end, vec![tags.intvl_in.clone()]))
    }
}

/// Lists of files per input interval and per variable name.
#[derive(Debug, Clone, Default)]
pub struct NestedDictLocator {
    pub file_map: BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>,
}

impl NestedDictLocator {
    pub fn new(file_map: BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>) -> Self {
        Self { file_map }
    }
}

impl FileLocator for NestedDictLocator {
    fn locate(
        &self,
        var: &Var,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tags: &DataTags,
    ) -> Result<Vec<PathBuf>, LocateError> {
        let by_name = self.file_map.get(&tags.intvl_in);
        let names = var.names();
        names
            .iter()
            .find_map(|name| by_name.and_then(|m| m.get(*name)).and_then(|files| resolve(files)))
            .ok_or_else(|| {
                not_found(var, start, end, names.iter().map(|n| n.to_string()).collect())
            })
    }
}

/// Files laid out by the GFDL post-processing directory convention:
/// `<root>/<domain>/<sampling>/<interval>/<dur>yr/<file>`.
#[derive(Debug, Clone, PartialEq)]
pub struct GfdlLocator {
    pub data_direc: PathBuf,
    /// Years per file
    pub data_dur: i32,
    pub data_start_date: NaiveDateTime,
    pub data_end_date: NaiveDateTime,
}

/// Builds a [`GfdlLocator`], optionally inheriting unset fields from a template.
#[derive(Debug, Clone, Default)]
pub struct GfdlLocatorBuilder {
    template: Option<GfdlLocator>,
    data_direc: Option<PathBuf>,
    data_dur: Option<i32>,
    data_start_date: Option<NaiveDateTime>,
    data_end_date: Option<NaiveDateTime>,
}

impl GfdlLocatorBuilder {
    pub fn template(mut self, template: &GfdlLocator) -> Self {
        self.template = Some(template.clone());
        self
    }

    pub fn data_direc<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_direc = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn data_dur(mut self, years: i32) -> Self {
        self.data_dur = Some(years);
        self
    }

    pub fn data_start_date(mut self, date: NaiveDateTime) -> Self {
        self.data_start_date = Some(date);
        self
    }

    pub fn data_end_date(mut self, date: NaiveDateTime) -> Self {
        self.data_end_date = Some(date);
        self
    }

    pub fn build(self) -> Result<GfdlLocator, LocateError> {
        let t = self.template.as_ref();
        let data_dur = self
            .data_dur
            .or(t.map(|t| t.data_dur))
            .ok_or(LocateError::MissingField("data_dur"))?;
        if data_dur < 1 {
            return Err(LocateError::MissingField("data_dur"));
        }
        Ok(GfdlLocator {
            data_direc: self
                .data_direc
                .or(t.map(|t| t.data_direc.clone()))
                .ok_or(LocateError::MissingField("data_direc"))?,
            data_dur,
            data_start_date: self
                .data_start_date
                .or(t.map(|t| t.data_start_date))
                .ok_or(LocateError::MissingField("data_start_date"))?,
            data_end_date: self
                .data_end_date
                .or(t.map(|t| t.data_end_date))
                .ok_or(LocateError::MissingField("data_end_date"))?,
        })
    }
}

impl GfdlLocator {
    pub fn builder() -> GfdlLocatorBuilder {
        GfdlLocatorBuilder::default()
    }

    /// Candidate paths for one variable name.
    pub fn input_data_paths(
        &self,
        name: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tags: &DataTags,
    ) -> Result<Vec<PathBuf>, LocateError> {
        let sampling = tags.dtype_in_time;
        let mut domain = tags.domain.clone();
        let mut dtype_lbl = sampling.base_label();
        if tags.intvl_in == "daily" {
            domain.push_str("_daily");
        }
        if tags.dtype_in_vert == Some(VertType::Sigma) && name != PS_STR {
            domain.push_str("_level");
        }
        if sampling.is_inst() {
            domain.push_str("_inst");
            dtype_lbl = "ts";
        }
        let dtype = sampling.kind;

        let dur_str = format!("{}yr", self.data_dur);
        let subdir = if dtype == SamplingKind::Av && !sampling.monthly_from {
            PathBuf::from(format!("{}_{}", tags.intvl_in, dur_str))
        } else {
            Path::new(&tags.intvl_in).join(dur_str)
        };
        let direc = self.data_direc.join(&domain).join(dtype_lbl).join(subdir);

        let mut files = (start.year()..=end.year())
            .map(|year| {
                data_name_gfdl(
                    name,
                    &domain,
                    dtype,
                    &tags.intvl_in,
                    year,
                    &tags.intvl_out,
                    self.data_start_date.year(),
                    self.data_dur,
                )
                .map(|file| direc.join(file))
            })
            .collect::<Result<Vec<_>, _>>()?;
        files.sort();
        files.dedup();
        Ok(files)
    }
}

impl FileLocator for GfdlLocator {
    fn locate(
        &self,
        var: &Var,
        start: NaiveDateTime,
        end: NaiveDateTime,
        tags: &DataTags,
    ) -> Result<Vec<PathBuf>, LocateError> {
        let names = var.names();
        for name in &names {
            let candidates = self.input_data_paths(name, start, end, tags)?;
            if let Some(files) = resolve(&candidates) {
                debug!("Located {} files for {} as '{}'", files.len(), var.name, name);
                return Ok(files);
            }
        }
        Err(not_found(var, start, end, names.iter().map(|n| n.to_string()).collect()))
    }

    fn default_date_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        Some((self.data_start_date, self.data_end_date))
    }
}

/// File name of one GFDL post-processed file.
///
/// Files hold `data_dur` years each, starting from `data_start_yr`; the file
/// for `data_yr` is the one whose span contains it.
#[allow(clippy::too_many_arguments)]
pub fn data_name_gfdl(
    name: &str,
    domain: &str,
    dtype: SamplingKind,
    intvl_in: &str,
    data_yr: i32,
    intvl_out: &str,
    data_start_yr: i32,
    data_dur: i32,
) -> Result<String, LocateError> {
    let first = data_yr - (data_yr - data_start_yr).rem_euclid(data_dur);
    let last = first + data_dur - 1;
    let span = if data_dur == 1 {
        format!("{:04}", first)
    } else {
        format!("{:04}-{:04}", first, last)
    };

    let file = match dtype {
        SamplingKind::Ts | SamplingKind::Inst => match intvl_in {
            "annual" => format!("{}.{}.{}.nc", domain, span, name),
            "monthly" => format!("{}.{:04}01-{:04}12.{}.nc", domain, first, last, name),
            "daily" => format!("{}.{:04}0101-{:04}1231.{}.nc", domain, first, last, name),
            hourly if hourly.contains("hr") => {
                format!("{}.{:04}010100-{:04}123123.{}.nc", domain, first, last, name)
            }
            other => return Err(LocateError::UnsupportedInterval(other.to_string())),
        },
        SamplingKind::Av => {
            let label = match intvl_in {
                "annual" | "ann" => "ann".to_string(),
                "seasonal" | "seas" => intvl_out.to_uppercase(),
                "monthly" | "mon" => {
                    let months = month_indices(intvl_out)
                        .map_err(|_| LocateError::UnsupportedInterval(intvl_out.to_string()))?;
                    match months.as_slice() {
                        [month] => format!("{:02}", month),
                        _ => return Err(LocateError::UnsupportedInterval(intvl_out.to_string())),
                    }
                }
                other => return Err(LocateError::UnsupportedInterval(other.to_string())),
            };
            format!("{}.{}.{}.nc", domain, span, label)
        }
        SamplingKind::AvTs => format!("{}.{:04}-{:04}.01-12.nc", domain, first, last),
    };
    Ok(file)
}

/// Serialized description of a locator, as found in request files.
#[derive(Debug, Clone, Deserialize)]
pub struct LocatorConfig {
    /// `one_dir`, `nested` or `gfdl`
    pub convention: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub nested_files: BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>,
    #[serde(default)]
    pub data_dur: Option<i32>,
    #[serde(default)]
    pub data_start_date: Option<String>,
    #[serde(default)]
    pub data_end_date: Option<String>,
}

impl LocatorConfig {
    fn rooted(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        match &self.root {
            Some(root) => files.iter().map(|f| root.join(f)).collect(),
            None => files.to_vec(),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn FileLocator>, LocateError> {
        match self.convention.as_str() {
            "one_dir" | "dict" => Ok(Arc::new(DictLocator::new(
                self.files
                    .iter()
                    .map(|(k, v)| (k.clone(), self.rooted(v)))
                    .collect(),
            ))),
            "nested" | "nested_dict" => Ok(Arc::new(NestedDictLocator::new(
                self.nested_files
                    .iter()
                    .map(|(intvl, by_name)| {
                        let by_name = by_name
                            .iter()
                            .map(|(name, files)| (name.clone(), self.rooted(files)))
                            .collect();
                        (intvl.clone(), by_name)
                    })
                    .collect(),
            ))),
            "gfdl" | "gfdl_dir_struc" => {
                let mut builder = GfdlLocator::builder();
                if let Some(root) = &self.root {
                    builder = builder.data_direc(root);
                }
                if let Some(dur) = self.data_dur {
                    builder = builder.data_dur(dur);
                }
                if let Some(start) = &self.data_start_date {
                    builder = builder.data_start_date(parse_datetime(start)?);
                }
                if let Some(end) = &self.data_end_date {
                    builder = builder.data_end_date(parse_datetime(end)?);
                }
                Ok(Arc::new(builder.build()?))
            }
            other => {
                warn!("Directory convention '{}' is not supported", other);
                Err(LocateError::UnsupportedDirectoryConvention(other.to_string()))
            }
        }
    }
}
