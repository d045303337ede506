use approx::assert_relative_eq;
use chrono::{NaiveDate, NaiveDateTime};
use climdiag::calc::{Calc, CalcError, CalcSpec, VertReduction};
use climdiag::config::{Config, Constants};
use climdiag::dataset::{AttributeValue, DataArray, Dataset, Variable};
use climdiag::locator::DictLocator;
use climdiag::math::*;
use climdiag::model::{GridMetadata, Input, Model, Operand, Project, Run, Transform, Var, VertDef, VertType};
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;

fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

fn arr(shape: &[usize], values: Vec<f64>) -> ArrayD<f64> {
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

/// One January of `q` on two levels (2 below, 1 above) over a 1 x 1 grid,
/// with surface pressure `ps` in the same file
fn write_column(path: &Path, vert_dim: &str, ps: f64) {
    let text = |s: &str| AttributeValue::String(s.to_string());
    let mut ds = Dataset::new();
    ds.insert("lat", Variable::new(&["lat"], arr(&[1], vec![10.0])).unwrap());
    ds.insert("lon", Variable::new(&["lon"], arr(&[1], vec![100.0])).unwrap());
    ds.insert(
        "time",
        Variable::new(&["time"], arr(&[1], vec![15.0]))
            .unwrap()
            .with_attr("units", text("days since 2000-01-01"))
            .with_attr("calendar", text("noleap")),
    );
    ds.insert(
        "average_DT",
        Variable::new(&["time"], arr(&[1], vec![31.0])).unwrap(),
    );
    ds.insert("ps", Variable::new(&["time", "lat", "lon"], arr(&[1, 1, 1], vec![ps])).unwrap());
    ds.insert(
        "q",
        Variable::new(&["time", vert_dim, "lat", "lon"], arr(&[1, 2, 1, 1], vec![2.0, 1.0])).unwrap(),
    );
    fs::write(path, serde_json::to_string(&ds).unwrap()).unwrap();
}

fn column_spec(source: PathBuf, grid: GridMetadata, vert: VertType) -> CalcSpec {
    let locator = DictLocator::new(BTreeMap::from([("monthly".to_string(), vec![source])]));
    CalcSpec::new(
        Arc::new(Project::new("proj")),
        Arc::new(Model::new("am2", grid)),
        Arc::new(Run::new("ctrl", Arc::new(locator))),
        Arc::new(Var::new("q").def_time(true).def_vert(VertDef::Full)),
    )
    .date_range(dt(2000, 1, 1), dt(2000, 12, 31))
    .dtype_in_vert(vert)
    .dtype_out_vert(VertReduction::VertInt)
    .dtype_out_time(&["av"])
}

fn single_value(calc: &Calc) -> f64 {
    let av = calc.data_out().get("av").unwrap().as_field().unwrap();
    assert!(!av.has_dim("level") && !av.has_dim("pfull"));
    av.values.iter().next().copied().unwrap()
}

#[test]
fn test_column_integral_on_pressure_levels() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("column.json");
    write_column(&source, "level", 100000.0);
    let grid = GridMetadata {
        level: Some(vec![1000.0, 500.0]),
        ..Default::default()
    };
    let config = Config::for_testing(dir.path()).into_arc();
    let g = config.constants.g;

    let mut calc = Calc::new(column_spec(source, grid, VertType::Pressure), config).unwrap();
    assert_eq!(
        calc.file_name("av").unwrap(),
        "q.ann.av.vert_int.from_monthly_ts_pressure.am2.ctrl.2000.json"
    );
    calc.compute().unwrap();

    // 1000 hPa spans 75000-100000 Pa, 500 hPa spans 0-75000 Pa
    assert_relative_eq!(single_value(&calc), (2.0 * 25000.0 + 75000.0) / g, epsilon = 1e-9);
}

#[test]
fn test_column_integral_excludes_levels_below_ground() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("column.json");
    write_column(&source, "level", 70000.0);
    let grid = GridMetadata {
        level: Some(vec![1000.0, 500.0]),
        ..Default::default()
    };
    let config = Config::for_testing(dir.path()).into_arc();
    let g = config.constants.g;

    let mut calc = Calc::new(column_spec(source, grid, VertType::Pressure), config).unwrap();
    calc.compute().unwrap();
    assert_relative_eq!(single_value(&calc), 70000.0 / g, epsilon = 1e-9);
}

#[test]
fn test_column_integral_on_hybrid_levels() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("column.json");
    write_column(&source, "pfull", 80000.0);
    let grid = GridMetadata {
        pk: Some(vec![0.0, 0.0, 0.0]),
        bk: Some(vec![0.0, 0.5, 1.0]),
        pfull: Some(vec![200.0, 600.0]),
        ..Default::default()
    };
    let config = Config::for_testing(dir.path()).into_arc();
    let g = config.constants.g;

    let mut calc = Calc::new(column_spec(source, grid, VertType::Sigma), config).unwrap();
    calc.compute().unwrap();
    // Both layers hold half the column: (2 + 1) * 40000 / g
    assert_relative_eq!(single_value(&calc), 3.0 * 40000.0 / g, epsilon = 1e-9);
}

#[test]
fn test_hybrid_levels_need_coefficients() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("column.json");
    write_column(&source, "pfull", 80000.0);
    let config = Config::for_testing(dir.path()).into_arc();

    let mut calc = Calc::new(
        column_spec(source, GridMetadata::default(), VertType::Sigma),
        config,
    )
    .unwrap();
    assert!(matches!(
        calc.compute(),
        Err(CalcError::MissingGridField { .. })
    ));
}

#[test]
fn test_pressure_inputs_to_derived_variable() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("column.json");
    write_column(&source, "level", 100000.0);
    let grid = GridMetadata {
        level: Some(vec![1000.0, 500.0]),
        ..Default::default()
    };
    let config = Config::for_testing(dir.path()).into_arc();

    // q * dp / p on each level
    let q = Arc::new(Var::new("q").def_time(true).def_vert(VertDef::Full));
    let weighted = Var::new("q_dp_p").def_time(true).def_vert(VertDef::Full).transform(
        Transform::arrays(|ops: &[Operand]| {
            ops[0].to_array("q").mul(&ops[1].to_array("dp"))?.div(&ops[2].to_array("p"))
        }),
        vec![
            Input::Var(q),
            Input::Var(Arc::new(Var::pressure_thickness())),
            Input::Var(Arc::new(Var::pressure())),
        ],
    );
    let locator = DictLocator::new(BTreeMap::from([("monthly".to_string(), vec![source])]));
    let spec = CalcSpec::new(
        Arc::new(Project::new("proj")),
        Arc::new(Model::new("am2", grid)),
        Arc::new(Run::new("ctrl", Arc::new(locator))),
        Arc::new(weighted),
    )
    .date_range(dt(2000, 1, 1), dt(2000, 12, 31))
    .dtype_in_vert(VertType::Pressure)
    .dtype_out_time(&["av"]);

    let mut calc = Calc::new(spec, config).unwrap();
    calc.compute().unwrap();
    let av = calc.data_out().get("av").unwrap().as_field().unwrap();
    assert!(av.has_dim("level"));
    // 2 * 25000 / 100000 at 1000 hPa, 1 * 75000 / 50000 at 500 hPa
    let values: Vec<f64> = av.values.iter().copied().collect();
    assert_eq!(values.len(), 2);
    assert_relative_eq!(values[0], 0.5, epsilon = 1e-12);
    assert_relative_eq!(values[1], 1.5, epsilon = 1e-12);
}

#[test]
fn test_int_dp_g_uses_configured_gravity() {
    let constants = Constants::default();
    let field = DataArray::from_vec("q", "level", vec![1.0, 3.0]);
    let dp = DataArray::from_vec("dp", "level", vec![constants.g, 2.0 * constants.g]);
    let column = int_dp_g(&field, &dp, "level", constants.g).unwrap();
    assert!(column.dims.is_empty());
    assert_relative_eq!(column.values.sum(), 7.0, epsilon = 1e-12);
}
