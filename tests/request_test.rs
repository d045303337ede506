use climdiag::calc::{store, LoadOptions};
use climdiag::config::Config;
use climdiag::dataset::{AttributeValue, Dataset, Variable};
use climdiag::driver::{locate_request, run_request};
use climdiag::request::{CalcRequest, RequestError};
use climdiag::Calc;
use ndarray::{ArrayD, IxDyn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// A year of monthly `olr` and `area` in the GFDL post-processing layout.
/// The file content is JSON despite the `.nc` name.
fn write_gfdl_year(root: &Path, year: i32, value: f64) {
    let text = |s: &str| AttributeValue::String(s.to_string());
    let dir = root.join("atmos/ts/monthly/1yr");
    fs::create_dir_all(&dir).unwrap();

    let mut ds = Dataset::new();
    ds.insert("lat", Variable::new(&["lat"], ArrayD::from_shape_vec(IxDyn(&[2]), vec![-45.0, 45.0]).unwrap()).unwrap());
    ds.insert("lon", Variable::new(&["lon"], ArrayD::from_shape_vec(IxDyn(&[1]), vec![180.0]).unwrap()).unwrap());
    ds.insert("area", Variable::new(&["lat", "lon"], ArrayD::from_elem(IxDyn(&[2, 1]), 1.0)).unwrap());
    let offset = (year - 2000) as f64 * 365.0;
    ds.insert(
        "time",
        Variable::new(&["time"], ArrayD::from_shape_vec(IxDyn(&[2]), vec![offset + 15.0, offset + 45.0]).unwrap())
            .unwrap()
            .with_attr("units", text("days since 2000-01-01"))
            .with_attr("calendar", text("noleap")),
    );
    ds.insert(
        "average_DT",
        Variable::new(&["time"], ArrayD::from_shape_vec(IxDyn(&[2]), vec![31.0, 28.0]).unwrap()).unwrap(),
    );
    ds.insert("rlut", Variable::new(&["time", "lat", "lon"], ArrayD::from_elem(IxDyn(&[2, 2, 1]), value)).unwrap());
    let file = dir.join(format!("atmos.{:04}01-{:04}12.rlut.nc", year, year));
    fs::write(file, serde_json::to_string(&ds).unwrap()).unwrap();
}

fn write_request(dir: &Path) -> std::path::PathBuf {
    let data = dir.join("data");
    write_gfdl_year(&data, 2000, 200.0);
    write_gfdl_year(&data, 2001, 240.0);
    let request = format!(
        r#"{{
            "project": "demo",
            "models": [{{
                "name": "am2",
                "runs": [{{
                    "name": "ctrl",
                    "locator": {{
                        "convention": "gfdl",
                        "root": {root:?},
                        "data_dur": 1,
                        "data_start_date": "2000-01-01",
                        "data_end_date": "2001-12-31"
                    }}
                }}]
            }}],
            "variables": [
                {{"name": "olr", "alt_names": ["rlut"], "units": "W m-2"}},
                {{"name": "precip"}}
            ],
            "regions": [{{"name": "nh", "mask_bounds": [{{"lat": [0, 90], "lon": [0, 360]}}]}}],
            "calcs": [{{
                "model": "am2",
                "runs": ["ctrl"],
                "variables": ["olr", "precip"],
                "dtype_out_time": ["av", "reg.ts"]
            }}]
        }}"#,
        root = data.display().to_string()
    );
    let path = dir.join("request.json");
    fs::write(&path, request).unwrap();
    path
}

#[test]
fn test_request_computes_and_isolates_failures() {
    let dir = tempdir().unwrap();
    let request = CalcRequest::from_file(&write_request(dir.path())).unwrap();
    let mut config = Config::for_testing(dir.path());
    config.archive = true;
    config.num_threads = 2;
    let config = config.into_arc();

    let outcomes = run_request(&request, &BTreeMap::new(), &config).unwrap();
    assert_eq!(outcomes.len(), 2);
    let (ok, failed): (Vec<_>, Vec<_>) = outcomes.iter().partition(|o| o.is_ok());
    assert_eq!(ok.len(), 1);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].label.contains("precip"));

    let paths = ok[0].result.as_ref().unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p.is_file()));
    assert!(paths[0].starts_with(dir.path().join("work/tester/demo/am2/ctrl/olr")));

    // Reload through a fresh Calc; both years average to 220
    let specs = request.build(&BTreeMap::new()).unwrap();
    let mut calc = Calc::new(specs[0].clone(), config).unwrap();
    assert_eq!(store::archive_entries(&calc.path_archive()).unwrap().len(), 2);
    let av = calc.load("av", &LoadOptions::default()).unwrap();
    for v in av.as_field().unwrap().values.iter() {
        assert!((v - 220.0).abs() < 1e-9);
    }
    let nh = calc
        .load(
            "reg.ts",
            &LoadOptions {
                region: Some("nh".into()),
                years: Some((2001, 2001)),
                ..Default::default()
            },
        )
        .unwrap();
    let values: Vec<f64> = nh.as_field().unwrap().values.iter().copied().collect();
    assert_eq!(values.len(), 1);
    assert!((values[0] - 240.0).abs() < 1e-9);
}

#[test]
fn test_locate_request_lists_files() {
    let dir = tempdir().unwrap();
    let request = CalcRequest::from_file(&write_request(dir.path())).unwrap();
    let config = Config::for_testing(dir.path()).into_arc();

    let located = locate_request(&request, &BTreeMap::new(), &config).unwrap();
    assert_eq!(located.len(), 2);
    let (label, files) = &located[0];
    assert!(label.starts_with("olr"));
    let inputs = files.as_ref().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].0, "olr");
    assert_eq!(inputs[0].1.len(), 2);
    assert!(located[1].1.is_err());
}

#[test]
fn test_malformed_request() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, r#"{"project": "demo"}"#).unwrap();
    assert!(matches!(CalcRequest::from_file(&path), Err(RequestError::Json(_))));
    assert!(matches!(
        CalcRequest::from_file(&dir.path().join("absent.json")),
        Err(RequestError::Io { .. })
    ));
}
