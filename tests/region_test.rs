use approx::assert_relative_eq;
use climdiag::calc::TimeReducer;
use climdiag::dataset::{Coord, DataArray};
use climdiag::region::{LandMaskMode, Region, RegionError};
use ndarray::{ArrayD, IxDyn};

fn coord_1d(name: &str, values: Vec<f64>) -> Coord {
    let n = values.len();
    Coord::new(&[name], ArrayD::from_shape_vec(IxDyn(&[n]), values).unwrap())
}

/// A (year, lat, lon) field on a 4 x 2 grid with unequal cell areas
fn field(values: Vec<f64>, years: usize) -> DataArray {
    let lats = vec![-60.0, -20.0, 20.0, 60.0];
    let lons = vec![90.0, 270.0];
    let area = ArrayD::from_shape_vec(
        IxDyn(&[4, 2]),
        vec![1.0, 1.0, 3.0, 3.0, 3.0, 3.0, 1.0, 1.0],
    )
    .unwrap();
    let land = ArrayD::from_shape_vec(
        IxDyn(&[4, 2]),
        vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
    )
    .unwrap();
    DataArray::new(
        "t_surf",
        &["year", "lat", "lon"],
        ArrayD::from_shape_vec(IxDyn(&[years, 4, 2]), values).unwrap(),
    )
    .unwrap()
    .with_coord("lat", coord_1d("lat", lats))
    .unwrap()
    .with_coord("lon", coord_1d("lon", lons))
    .unwrap()
    .with_coord("sfc_area", Coord::new(&["lat", "lon"], area))
    .unwrap()
    .with_coord("land_mask", Coord::new(&["lat", "lon"], land))
    .unwrap()
}

#[test]
fn test_hemisphere_of_uniform_field() {
    let data = field(vec![5.0; 16], 2);
    let nh = Region::new("nh", (0.0, 90.0), (0.0, 360.0));
    let ts = nh.ts(&data).unwrap();
    assert_eq!(ts.dims, vec!["year"]);
    for v in ts.values.iter() {
        assert_relative_eq!(*v, 5.0, epsilon = 1e-12);
    }
    assert_relative_eq!(nh.av(&data).unwrap().values.sum(), 5.0, epsilon = 1e-12);
    assert_relative_eq!(nh.std(&data).unwrap().values.sum(), 0.0, epsilon = 1e-12);
}

#[test]
fn test_area_weighting_and_years() {
    // Year 1: lat rows 1, 2, 3, 4; year 2: every cell 10
    let mut values: Vec<f64> = [1.0, 2.0, 3.0, 4.0].iter().flat_map(|v| [*v, *v]).collect();
    values.extend(vec![10.0; 8]);
    let data = field(values, 2);
    let globe = Region::new("globe", (-90.0, 90.0), (0.0, 360.0));

    let ts = globe.reduce(&data, TimeReducer::Ts, false).unwrap();
    // (1*1 + 2*3 + 3*3 + 4*1) / 8
    assert_relative_eq!(ts.values[[0]], 2.5, epsilon = 1e-12);
    assert_relative_eq!(ts.values[[1]], 10.0, epsilon = 1e-12);

    let av = globe.reduce(&data, TimeReducer::Av, false).unwrap();
    assert_relative_eq!(av.values.sum(), 6.25, epsilon = 1e-12);
    let std = globe.reduce(&data, TimeReducer::Std, false).unwrap();
    assert_relative_eq!(std.values.sum(), 3.75, epsilon = 1e-12);

    // Pre-averaged input keeps its year dimension untouched by av
    let pre = globe.reduce(&data, TimeReducer::Av, true).unwrap();
    assert_eq!(pre.dims, vec!["year"]);
}

#[test]
fn test_land_and_ocean_masks() {
    // Land cells (lon 270) hold 2, ocean cells 8
    let values: Vec<f64> = (0..4).flat_map(|_| [8.0, 2.0]).collect();
    let data = field(values, 1);
    let globe = Region::new("globe", (-90.0, 90.0), (0.0, 360.0));

    let land = globe.clone().with_land_mask(LandMaskMode::Land);
    assert_relative_eq!(land.ts(&data).unwrap().values.sum(), 2.0, epsilon = 1e-12);
    let ocean = globe.clone().with_land_mask(LandMaskMode::Ocean);
    assert_relative_eq!(ocean.ts(&data).unwrap().values.sum(), 8.0, epsilon = 1e-12);
    assert_relative_eq!(globe.ts(&data).unwrap().values.sum(), 5.0, epsilon = 1e-12);
}

#[test]
fn test_boundaries_are_strict_and_empty_regions_fail() {
    let data = field(vec![1.0; 8], 1);
    // The only latitudes are -60, -20, 20, 60: a box ending exactly at 20 excludes it
    let band = Region::new("band", (-20.0, 20.0), (0.0, 360.0));
    assert!(matches!(
        band.ts(&data),
        Err(RegionError::ZeroRegionWeight { .. })
    ));

    let no_area = DataArray::new(
        "t_surf",
        &["lat", "lon"],
        ArrayD::from_elem(IxDyn(&[4, 2]), 1.0),
    )
    .unwrap();
    assert!(matches!(
        band.ts(&no_area),
        Err(RegionError::MissingCoordinate { .. })
    ));
}

#[test]
fn test_nan_cells_skipped() {
    let mut values = vec![4.0; 8];
    values[6] = f64::NAN;
    let data = field(values, 1);
    let nh = Region::new("nh", (0.0, 90.0), (0.0, 360.0));
    // Total weight still counts the NaN cell, so the mean is pulled toward zero
    let v = nh.ts(&data).unwrap().values.sum();
    assert_relative_eq!(v, 4.0 * 7.0 / 8.0, epsilon = 1e-12);
}
