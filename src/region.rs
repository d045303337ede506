//! Area-weighted averages over named geographic regions.

use crate::calc::output::TimeReducer;
use crate::dataset::{DataArray, DatasetError, Reduction};
use crate::names::{LAND_MASK_STR, LAT_STR, LON_STR, SFC_AREA_STR, YEAR_STR};
use log::warn;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("Region '{region}': data '{var}' has no '{coord}' coordinate")]
    MissingCoordinate {
        region: String,
        var: String,
        coord: &'static str,
    },

    #[error("Region '{region}' has zero total weight on this grid")]
    ZeroRegionWeight { region: String },

    #[error("Unsupported land mask mode: {0}")]
    UnsupportedMaskMode(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Which surface type contributes to the average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LandMaskMode {
    #[default]
    None,
    Land,
    Ocean,
}

impl FromStr for LandMaskMode {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" | "false" => Ok(LandMaskMode::None),
            "land" | "true" => Ok(LandMaskMode::Land),
            "ocean" => Ok(LandMaskMode::Ocean),
            other => Err(RegionError::UnsupportedMaskMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for LandMaskMode {
    type Error = RegionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for LandMaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LandMaskMode::None => "none",
            LandMaskMode::Land => "land",
            LandMaskMode::Ocean => "ocean",
        };
        write!(f, "{}", s)
    }
}

impl From<LandMaskMode> for String {
    fn from(mode: LandMaskMode) -> Self {
        mode.to_string()
    }
}

/// Open latitude-longitude rectangle, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLonBox {
    pub lat: (f64, f64),
    pub lon: (f64, f64),
}

impl LatLonBox {
    fn contains(&self, lat: f64, lon: f64) -> bool {
        lat > self.lat.0 && lat < self.lat.1 && lon > self.lon.0 && lon < self.lon.1
    }
}

/// A named union of lat-lon rectangles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub mask_bounds: Vec<LatLonBox>,
    #[serde(default)]
    pub land_mask: LandMaskMode,
}

impl Region {
    /// A region covering a single rectangle
    pub fn new(name: &str, lat: (f64, f64), lon: (f64, f64)) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            mask_bounds: vec![LatLonBox { lat, lon }],
            land_mask: LandMaskMode::None,
        }
    }

    pub fn with_box(mut self, lat: (f64, f64), lon: (f64, f64)) -> Self {
        self.mask_bounds.push(LatLonBox { lat, lon });
        self
    }

    pub fn with_land_mask(mut self, mode: LandMaskMode) -> Self {
        self.land_mask = mode;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    fn coord(&self, data: &DataArray, coord: &'static str) -> Result<Vec<f64>, RegionError> {
        if !data.coords.contains_key(coord) {
            return Err(RegionError::MissingCoordinate {
                region: self.name.clone(),
                var: data.name.clone(),
                coord,
            });
        }
        Ok(data.coord_1d(coord)?)
    }

    fn grid_field(&self, data: &DataArray, name: &'static str) -> Option<DataArray> {
        data.coords.get(name).map(|c| DataArray {
            name: name.to_string(),
            dims: c.dims.clone(),
            values: c.values.clone(),
            coords: Default::default(),
            time: None,
            attrs: Default::default(),
        })
    }

    /// 1 inside any of the rectangles, 0 elsewhere, on the `lat` x `lon` grid of `data`
    pub fn make_mask(&self, data: &DataArray) -> Result<DataArray, RegionError> {
        let lats = self.coord(data, LAT_STR)?;
        let lons = self.coord(data, LON_STR)?;
        let mask = Array2::from_shape_fn((lats.len(), lons.len()), |(i, j)| {
            let inside = self.mask_bounds.iter().any(|b| b.contains(lats[i], lons[j]));
            if inside {
                1.0
            } else {
                0.0
            }
        });
        Ok(DataArray::new("mask", &[LAT_STR, LON_STR], mask.into_dyn())?)
    }

    fn land_factor(&self, data: &DataArray) -> DataArray {
        if self.land_mask == LandMaskMode::None {
            return DataArray::scalar(LAND_MASK_STR, 1.0);
        }
        match self.grid_field(data, LAND_MASK_STR) {
            Some(land) => match self.land_mask {
                LandMaskMode::Ocean => land.map(|v| 1.0 - v),
                _ => land,
            },
            None => {
                warn!(
                    "Land mask not found for '{}'; averaging region '{}' without it",
                    data.name, self.name
                );
                DataArray::scalar(LAND_MASK_STR, 1.0)
            }
        }
    }

    /// Per-cell weights: surface area times land factor inside the region, 0 outside
    pub fn weights(&self, data: &DataArray) -> Result<DataArray, RegionError> {
        let area = self
            .grid_field(data, SFC_AREA_STR)
            .ok_or_else(|| RegionError::MissingCoordinate {
                region: self.name.clone(),
                var: data.name.clone(),
                coord: SFC_AREA_STR,
            })?;
        let mask = self.make_mask(data)?;
        Ok(area.mul(&mask)?.mul(&self.land_factor(data))?.renamed("weights"))
    }

    /// Region-average series: every dimension but `lat` and `lon` survives
    pub fn ts(&self, data: &DataArray) -> Result<DataArray, RegionError> {
        let weights = self.weights(data)?;
        let total: f64 = weights.values.iter().filter(|w| w.is_finite()).sum();
        if total == 0.0 || !total.is_finite() {
            return Err(RegionError::ZeroRegionWeight {
                region: self.name.clone(),
            });
        }
        // Cells outside the region or without data drop out of the sum
        let weighted = data.zip_with(&weights, |d, w| {
            if w == 0.0 || !w.is_finite() || d.is_nan() {
                0.0
            } else {
                d * w
            }
        })?;
        let summed = weighted.sum_dim(LAT_STR)?.sum_dim(LON_STR)?;
        Ok(summed.map(|v| v / total))
    }

    /// Mean over years of the region-average series
    pub fn av(&self, data: &DataArray) -> Result<DataArray, RegionError> {
        self.over_years(data, Reduction::Mean)
    }

    /// Population standard deviation over years of the region-average series
    pub fn std(&self, data: &DataArray) -> Result<DataArray, RegionError> {
        self.over_years(data, Reduction::Std)
    }

    fn over_years(&self, data: &DataArray, how: Reduction) -> Result<DataArray, RegionError> {
        let ts = self.ts(data)?;
        if !ts.has_dim(YEAR_STR) {
            return Ok(ts);
        }
        Ok(ts.reduce_dim(YEAR_STR, how)?)
    }

    /// Apply a terminal reducer. Pre-averaged input only gets the regional average.
    pub fn reduce(
        &self,
        data: &DataArray,
        reducer: TimeReducer,
        pre_averaged: bool,
    ) -> Result<DataArray, RegionError> {
        if pre_averaged {
            return self.ts(data);
        }
        match reducer {
            TimeReducer::Ts | TimeReducer::Identity => self.ts(data),
            TimeReducer::Av => self.av(data),
            TimeReducer::Std => self.std(data),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Geographical region \"{}\"", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Coord;
    use ndarray::{array, ArrayD, IxDyn};

    fn uniform_area(nlat: usize, nlon: usize) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(&[nlat, nlon]), 1.0)
    }

    fn field(values: ArrayD<f64>) -> DataArray {
        DataArray::new("t", &[LAT_STR, LON_STR], values)
            .unwrap()
            .with_coord(LAT_STR, Coord::new(&[LAT_STR], array![-45.0, 45.0].into_dyn()))
            .unwrap()
            .with_coord(LON_STR, Coord::new(&[LON_STR], array![90.0, 270.0].into_dyn()))
            .unwrap()
            .with_coord(SFC_AREA_STR, Coord::new(&[LAT_STR, LON_STR], uniform_area(2, 2)))
            .unwrap()
    }

    #[test]
    fn test_mask_is_strict_union() {
        let data = field(array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        let region = Region::new("r", (-45.0, 90.0), (0.0, 360.0)).with_box((-90.0, 0.0), (0.0, 180.0));
        let mask = region.make_mask(&data).unwrap();
        assert_eq!(mask.values, array![[1.0, 0.0], [1.0, 1.0]].into_dyn());
    }

    #[test]
    fn test_land_and_ocean_weighting() {
        let data = field(array![[1.0, 2.0], [3.0, 4.0]].into_dyn()).with_coord(
            LAND_MASK_STR,
            Coord::new(&[LAT_STR, LON_STR], array![[1.0, 0.0], [0.0, 1.0]].into_dyn()),
        );
        let data = data.unwrap();
        let globe = Region::new("globe", (-90.0, 90.0), (0.0, 360.0));

        let land = globe.clone().with_land_mask(LandMaskMode::Land).ts(&data).unwrap();
        assert_eq!(land.values.sum(), 2.5);
        let ocean = globe.with_land_mask(LandMaskMode::Ocean).ts(&data).unwrap();
        assert_eq!(ocean.values.sum(), 2.5);
    }

    #[test]
    fn test_missing_land_mask_passes_through() {
        let data = field(array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        let region = Region::new("globe", (-90.0, 90.0), (0.0, 360.0)).with_land_mask(LandMaskMode::Land);
        assert_eq!(region.ts(&data).unwrap().values.sum(), 2.5);
    }

    #[test]
    fn test_zero_weight_is_an_error() {
        let data = field(array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        let region = Region::new("nowhere", (50.0, 60.0), (0.0, 10.0));
        assert!(matches!(region.ts(&data), Err(RegionError::ZeroRegionWeight { .. })));
    }

    #[test]
    fn test_nan_cells_skipped() {
        let data = field(array![[f64::NAN, 2.0], [3.0, 4.0]].into_dyn());
        let region = Region::new("south", (-90.0, 0.0), (0.0, 360.0));
        assert_eq!(region.ts(&data).unwrap().values.sum(), 1.0);
    }

    #[test]
    fn test_mask_mode_parse() {
        assert_eq!("Ocean".parse::<LandMaskMode>().unwrap(), LandMaskMode::Ocean);
        assert!(matches!(
            "strict_land".parse::<LandMaskMode>(),
            Err(RegionError::UnsupportedMaskMode(_))
        ));
        let region: Region = serde_json::from_str(
            r#"{"name": "nh", "mask_bounds": [{"lat": [0, 90], "lon": [0, 360]}], "land_mask": "land"}"#,
        )
        .unwrap();
        assert_eq!(region.land_mask, LandMaskMode::Land);
    }
}
