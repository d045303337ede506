use chrono::{NaiveDate, NaiveDateTime};
use climdiag::dataset::{load_variable, AttributeValue, Dataset, Variable};
use climdiag::time_utils::{decode_times, month_indices, Calendar, TimeUnits};
use ndarray::{ArrayD, IxDyn};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

fn arr(values: Vec<f64>, shape: &[usize]) -> ArrayD<f64> {
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

/// Twelve monthly steps of one year on a noleap calendar with epoch 0001-01-01
fn write_year(dir: &Path, year: i32) -> PathBuf {
    let text = |s: &str| AttributeValue::String(s.to_string());
    let units: TimeUnits = "days since 0001-01-01 00:00:00".parse().unwrap();
    let cum = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];
    let year_start = (year - 1) as f64 * 365.0;
    let starts: Vec<f64> = cum[..12].iter().map(|d| year_start + *d as f64).collect();
    let ends: Vec<f64> = cum[1..].iter().map(|d| year_start + *d as f64).collect();
    let mids: Vec<f64> = starts.iter().zip(&ends).map(|(s, e)| 0.5 * (s + e)).collect();
    assert_eq!(
        decode_times(&starts[..1], &units, Calendar::NoLeap, 1678).unwrap(),
        vec![dt(year, 1, 1)]
    );

    let mut ds = Dataset::new();
    ds.insert(
        "time",
        Variable::new(&["time"], arr(mids, &[12]))
            .unwrap()
            .with_attr("units", text("days since 0001-01-01 00:00:00"))
            .with_attr("calendar", text("noleap")),
    );
    ds.insert("average_T1", Variable::new(&["time"], arr(starts, &[12])).unwrap());
    ds.insert("average_T2", Variable::new(&["time"], arr(ends, &[12])).unwrap());
    let values: Vec<f64> = (1..=12).map(|m| (year * 100 + m) as f64).collect();
    ds.insert("t_surf", Variable::new(&["time"], arr(values, &[12])).unwrap());

    let path = dir.join(format!("t_surf.{:04}.json", year));
    fs::write(&path, serde_json::to_string(&ds).unwrap()).unwrap();
    path
}

#[test]
fn test_early_epoch_files_concatenate() {
    let dir = tempdir().unwrap();
    let files = vec![write_year(dir.path(), 1), write_year(dir.path(), 2)];
    let arr = load_variable(&files, &["t_surf"], 1678).unwrap();

    let time = arr.time.as_ref().unwrap();
    assert_eq!(time.len(), 24);
    assert_eq!(time.calendar, Calendar::NoLeap);
    let bounds = time.bounds.as_ref().unwrap();
    assert_eq!(bounds[0], (dt(1, 1, 1), dt(1, 2, 1)));
    assert_eq!(bounds[23], (dt(2, 12, 1), dt(3, 1, 1)));
    let durations = time.durations.as_ref().unwrap();
    assert_eq!(durations[1], 28.0 * 86400.0);
}

#[test]
fn test_season_selection_crosses_year_boundary() {
    let dir = tempdir().unwrap();
    let files = vec![write_year(dir.path(), 1), write_year(dir.path(), 2)];
    let arr = load_variable(&files, &["t_surf"], 1678).unwrap();

    let djf = month_indices("djf").unwrap();
    let selected = arr.sel_time(dt(1, 1, 1), dt(2, 12, 31), &djf).unwrap();
    let values: Vec<f64> = selected.values.iter().copied().collect();
    assert_eq!(values, vec![101.0, 102.0, 112.0, 201.0, 202.0, 212.0]);

    let july = arr.sel_time(dt(2, 1, 1), dt(2, 12, 31), &month_indices("7").unwrap()).unwrap();
    assert_eq!(july.values.iter().copied().collect::<Vec<_>>(), vec![207.0]);
}
