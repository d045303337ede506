//! Bring raw datasets to one internal convention: canonical attribute names,
//! decoded time axes, grid attributes as coordinates, canonical axis order.

use super::{create_reader, Coord, DataArray, Dataset, DatasetError, TimeAxis};
use crate::names::{
    grid_attrs, AVERAGE_DT_STR, AVERAGE_T1_STR, AVERAGE_T2_STR, AVG_END_DATE_STR,
    AVG_START_DATE_STR, TIME_BOUNDS_STR, TIME_STR,
};
use crate::time_utils::{decode_times, Calendar, TimeUnit, TimeUnits};
use chrono::NaiveDateTime;
use log::debug;
use ndarray::{Axis, Ix2};
use std::path::PathBuf;

/// Rename recognised alternate spellings of grid attributes to their
/// canonical names. The first accepted spelling present wins.
pub fn rename_grid_attrs(ds: &mut Dataset) {
    for (canonical, _) in grid_attrs().iter() {
        let present = ds.names();
        if let Some(found) =
            grid_attrs().first_present(canonical, present.iter().map(String::as_str))
        {
            if found != canonical {
                debug!("Renaming {} to {}", found, canonical);
                ds.rename(found, canonical);
            }
        }
    }
}

/// Mark grid attributes and dimension coordinates so that they are carried
/// by every selected field whose dimensions cover theirs.
pub fn set_grid_attrs_as_coords(ds: &mut Dataset) {
    let coords: Vec<String> = ds
        .variables
        .iter()
        .filter(|(name, var)| {
            grid_attrs().is_grid_attr(name) || (var.dims.len() == 1 && &var.dims[0] == *name)
        })
        .map(|(name, _)| name.clone())
        .collect();
    ds.coord_names.extend(coords);
}

fn time_units(ds: &Dataset, name: &str, fallback: Option<&str>) -> Result<TimeUnits, DatasetError> {
    let units = ds
        .get(name)
        .and_then(|v| v.attr_str("units"))
        .or(fallback)
        .ok_or_else(|| DatasetError::MissingAttribute(format!("{}.units", name)))?;
    Ok(units.parse()?)
}

fn decode_variable(
    ds: &Dataset,
    name: &str,
    units: &TimeUnits,
    calendar: Calendar,
    min_safe_year: i32,
) -> Result<Option<Vec<NaiveDateTime>>, DatasetError> {
    match ds.get(name) {
        Some(var) => {
            let values: Vec<f64> = var.values.iter().copied().collect();
            Ok(Some(decode_times(&values, units, calendar, min_safe_year)?))
        }
        None => Ok(None),
    }
}

/// Decode the time axis and its averaging metadata.
///
/// Steps carry their averaging-window bounds (from `time_bounds`, or from
/// `average_T1`/`average_T2`) and durations (from `average_DT`, or derived
/// from the bounds). The overall window is recorded as the dataset
/// attributes `avg_start_date` and `avg_end_date`.
pub fn prep_time_data(ds: &mut Dataset, min_safe_year: i32) -> Result<(), DatasetError> {
    let time_var = match ds.get(TIME_STR) {
        Some(v) => v,
        None => return Ok(()),
    };
    let units_str = time_var
        .attr_str("units")
        .ok_or_else(|| DatasetError::MissingAttribute(format!("{}.units", TIME_STR)))?
        .to_string();
    let calendar: Calendar = time_var
        .attr_str("calendar")
        .map(str::parse::<Calendar>)
        .transpose()?
        .unwrap_or_default();
    let units: TimeUnits = units_str.parse()?;
    let dates = decode_variable(ds, TIME_STR, &units, calendar, min_safe_year)?.unwrap_or_default();
    let mut axis = TimeAxis::new(dates, calendar);

    if let Some(bounds_var) = ds.get(TIME_BOUNDS_STR) {
        let bounds_units = time_units(ds, TIME_BOUNDS_STR, Some(&units_str))?;
        let pairs = bounds_var
            .values
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| DatasetError::ShapeMismatch(format!("{} must be 2-d", TIME_BOUNDS_STR)))?;
        let starts: Vec<f64> = pairs.index_axis(Axis(1), 0).iter().copied().collect();
        let ends: Vec<f64> = pairs.index_axis(Axis(1), pairs.ncols() - 1).iter().copied().collect();
        let starts = decode_times(&starts, &bounds_units, calendar, min_safe_year)?;
        let ends = decode_times(&ends, &bounds_units, calendar, min_safe_year)?;
        axis.bounds = Some(starts.into_iter().zip(ends).collect());
    } else if ds.contains(AVERAGE_T1_STR) && ds.contains(AVERAGE_T2_STR) {
        let t1_units = time_units(ds, AVERAGE_T1_STR, Some(&units_str))?;
        let t2_units = time_units(ds, AVERAGE_T2_STR, Some(&units_str))?;
        let starts = decode_variable(ds, AVERAGE_T1_STR, &t1_units, calendar, min_safe_year)?;
        let ends = decode_variable(ds, AVERAGE_T2_STR, &t2_units, calendar, min_safe_year)?;
        if let (Some(starts), Some(ends)) = (starts, ends) {
            axis.bounds = Some(starts.into_iter().zip(ends).collect());
        }
    }

    if let Some(dt_var) = ds.get(AVERAGE_DT_STR) {
        let unit: TimeUnit = dt_var.attr_str("units").unwrap_or("days").parse()?;
        axis.durations = Some(dt_var.values.iter().map(|v| v * unit.seconds()).collect());
    } else if let Some(bounds) = &axis.bounds {
        axis.durations = Some(
            bounds
                .iter()
                .map(|(s, e)| calendar.seconds_between(*s, *e))
                .collect::<Result<_, _>>()?,
        );
    }

    if axis.len() != ds.get(TIME_STR).map(|v| v.values.len()).unwrap_or(0)
        || axis.bounds.as_ref().is_some_and(|b| b.len() != axis.len())
        || axis.durations.as_ref().is_some_and(|d| d.len() != axis.len())
    {
        return Err(DatasetError::ShapeMismatch(
            "time averaging metadata does not match the time axis".into(),
        ));
    }

    if let Some(bounds) = &axis.bounds {
        if let (Some(first), Some(last)) = (bounds.first(), bounds.last()) {
            ds.attrs.insert(
                AVG_START_DATE_STR.into(),
                super::AttributeValue::String(first.0.to_string()),
            );
            ds.attrs.insert(
                AVG_END_DATE_STR.into(),
                super::AttributeValue::String(last.1.to_string()),
            );
        }
    }

    for consumed in [TIME_STR, TIME_BOUNDS_STR, AVERAGE_DT_STR, AVERAGE_T1_STR, AVERAGE_T2_STR] {
        ds.variables.remove(consumed);
        ds.coord_names.remove(consumed);
    }
    ds.time = Some(axis);
    Ok(())
}

/// Join per-file datasets along `time`. Fields without a time dimension are
/// taken from the first file.
pub fn concat_datasets(mut parts: Vec<Dataset>) -> Result<Dataset, DatasetError> {
    if parts.len() <= 1 {
        return parts
            .pop()
            .ok_or_else(|| DatasetError::ShapeMismatch("no datasets to concatenate".into()));
    }
    let mut merged = parts[0].clone();
    for (name, var) in merged.variables.iter_mut() {
        let axis = match var.dims.iter().position(|d| d == TIME_STR) {
            Some(a) => a,
            None => continue,
        };
        let views = parts
            .iter()
            .map(|p| {
                p.get(name)
                    .filter(|v| v.dims == var.dims)
                    .map(|v| v.values.view())
                    .ok_or_else(|| {
                        DatasetError::ShapeMismatch(format!(
                            "'{}' is missing or differently shaped in one of the files",
                            name
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        var.values = ndarray::concatenate(Axis(axis), &views)?;
    }
    let axes: Vec<&TimeAxis> = parts.iter().filter_map(|p| p.time.as_ref()).collect();
    if !axes.is_empty() {
        if axes.len() != parts.len() {
            return Err(DatasetError::ShapeMismatch(
                "some files lack a time axis".into(),
            ));
        }
        merged.time = Some(TimeAxis::concat(&axes)?);
    }
    if let Some(last) = parts.last() {
        if let Some(end) = last.attrs.get(AVG_END_DATE_STR) {
            merged.attrs.insert(AVG_END_DATE_STR.into(), end.clone());
        }
    }
    Ok(merged)
}

/// Select a field by the first of `names` present, renamed to `names[0]`.
pub fn sel_var(ds: &Dataset, names: &[&str]) -> Result<DataArray, DatasetError> {
    let not_found = || DatasetError::VariableNotFound {
        name: names.first().map(|n| n.to_string()).unwrap_or_default(),
        aliases: names.iter().map(|n| n.to_string()).collect(),
    };
    let canonical = names.first().ok_or_else(not_found)?;
    let (found, var) = names
        .iter()
        .find_map(|n| ds.get(n).map(|v| (*n, v)))
        .ok_or_else(not_found)?;

    let dims: Vec<&str> = var.dims.iter().map(String::as_str).collect();
    let mut arr = DataArray::new(canonical, &dims, var.values.clone())?;
    arr.attrs = var.attrs.clone();

    for coord_name in &ds.coord_names {
        if coord_name == found {
            continue;
        }
        if let Some(coord) = ds.get(coord_name) {
            if coord.dims.iter().all(|d| var.dims.contains(d)) {
                let coord_dims: Vec<&str> = coord.dims.iter().map(String::as_str).collect();
                arr = arr.with_coord(coord_name, Coord::new(&coord_dims, coord.values.clone()))?;
            }
        }
    }
    if arr.has_dim(TIME_STR) {
        if let Some(time) = &ds.time {
            arr = arr.with_time(time.clone())?;
        }
    }
    Ok(arr.transpose_canonical())
}

/// Read, normalize and concatenate `files`, then select the field named by
/// the first of `names` present.
pub fn load_variable(
    files: &[PathBuf],
    names: &[&str],
    min_safe_year: i32,
) -> Result<DataArray, DatasetError> {
    let mut parts = Vec::with_capacity(files.len());
    for path in files {
        let reader = create_reader(path)?;
        debug!("Reading {} as {}", path.display(), reader.format_name());
        let mut ds = reader.read(path)?;
        rename_grid_attrs(&mut ds);
        prep_time_data(&mut ds, min_safe_year)?;
        parts.push(ds);
    }
    let mut ds = concat_datasets(parts)?;
    set_grid_attrs_as_coords(&mut ds);
    sel_var(&ds, names)
}
