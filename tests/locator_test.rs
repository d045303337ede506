use chrono::{NaiveDate, NaiveDateTime};
use climdiag::locator::{DataTags, DictLocator, FileLocator, GfdlLocator, LocateError, LocatorConfig, NestedDictLocator};
use climdiag::model::{TimeSampling, Var};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn dt(y: i32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

fn monthly_tags() -> DataTags {
    DataTags {
        domain: "atmos".into(),
        intvl_in: "monthly".into(),
        intvl_out: "ann".into(),
        dtype_in_time: TimeSampling::TS,
        dtype_in_vert: None,
    }
}

fn touch(path: &Path) -> PathBuf {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "{}").unwrap();
    path.to_path_buf()
}

#[test]
fn test_gfdl_resolves_alternate_name() {
    let dir = tempdir().unwrap();
    let loc = GfdlLocator::builder()
        .data_direc(dir.path())
        .data_dur(1)
        .data_start_date(dt(2000))
        .data_end_date(dt(2001))
        .build()
        .unwrap();
    let sub = dir.path().join("atmos/ts/monthly/1yr");
    let y0 = touch(&sub.join("atmos.200001-200012.rlut.nc"));
    let y1 = touch(&sub.join("atmos.200101-200112.rlut.nc"));
    // Only one year under the canonical name: incomplete, so the alias wins
    touch(&sub.join("atmos.200001-200012.olr.nc"));

    let var = Var::new("olr").alt_names(&["rlut"]);
    let files = loc.locate(&var, dt(2000), dt(2001), &monthly_tags()).unwrap();
    assert_eq!(files, vec![y0, y1]);

    let only_canonical = loc.locate(&var, dt(2000), dt(2000), &monthly_tags()).unwrap();
    assert_eq!(only_canonical, vec![sub.join("atmos.200001-200012.olr.nc")]);
}

#[test]
fn test_gfdl_not_found_lists_names() {
    let dir = tempdir().unwrap();
    let loc = GfdlLocator::builder()
        .data_direc(dir.path())
        .data_dur(1)
        .data_start_date(dt(2000))
        .data_end_date(dt(2000))
        .build()
        .unwrap();
    let var = Var::new("olr").alt_names(&["rlut"]);
    match loc.locate(&var, dt(2000), dt(2000), &monthly_tags()) {
        Err(LocateError::FilesNotFound { var, tried, .. }) => {
            assert_eq!(var, "olr");
            assert_eq!(tried, vec!["olr", "rlut"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_dict_locators() {
    let dir = tempdir().unwrap();
    let a = touch(&dir.path().join("b.json"));
    let b = touch(&dir.path().join("a.json"));

    let flat = DictLocator::new(BTreeMap::from([(
        "monthly".to_string(),
        vec![a.clone(), b.clone(), a.clone()],
    )]));
    let var = Var::new("olr");
    assert_eq!(
        flat.locate(&var, dt(2000), dt(2000), &monthly_tags()).unwrap(),
        vec![b.clone(), a.clone()]
    );
    let mut daily = monthly_tags();
    daily.intvl_in = "daily".into();
    assert!(flat.locate(&var, dt(2000), dt(2000), &daily).is_err());

    let nested = NestedDictLocator::new(BTreeMap::from([(
        "monthly".to_string(),
        BTreeMap::from([
            ("olr".to_string(), vec![dir.path().join("missing.json")]),
            ("rlut".to_string(), vec![a.clone()]),
        ]),
    )]));
    let aliased = Var::new("olr").alt_names(&["rlut"]);
    assert_eq!(
        nested.locate(&aliased, dt(2000), dt(2000), &monthly_tags()).unwrap(),
        vec![a]
    );
}

#[test]
fn test_locator_from_config() {
    let dir = tempdir().unwrap();
    let file = touch(&dir.path().join("olr.json"));
    let json = format!(
        r#"{{"convention": "one_dir", "root": {:?}, "files": {{"monthly": ["olr.json"]}}}}"#,
        dir.path().display().to_string()
    );
    let cfg: LocatorConfig = serde_json::from_str(&json).unwrap();
    let loc = cfg.build().unwrap();
    assert_eq!(
        loc.locate(&Var::new("olr"), dt(2000), dt(2000), &monthly_tags()).unwrap(),
        vec![file]
    );
    assert!(loc.default_date_range().is_none());

    let gfdl: LocatorConfig = serde_json::from_str(
        r#"{"convention": "gfdl", "root": "/d", "data_dur": 5,
            "data_start_date": "1983-01-01", "data_end_date": "1987-12-31"}"#,
    )
    .unwrap();
    let (start, _) = gfdl.build().unwrap().default_date_range().unwrap();
    assert_eq!(start, dt(1983));
}
