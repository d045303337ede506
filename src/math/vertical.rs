use crate::dataset::{Coord, DataArray, DatasetError};
use crate::names::{PFULL_STR, PHALF_STR, PLEVEL_STR};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use thiserror::Error;

/// Level sets whose maximum is above this are already in Pa
const PA_THRESHOLD: f64 = 1e4;

#[derive(Error, Debug)]
pub enum VerticalError {
    #[error("Hybrid coefficients differ in length: {pk} pk values, {bk} bk values")]
    CoefficientMismatch { pk: usize, bk: usize },

    #[error("Need at least two half levels, got {0}")]
    TooFewLevels(usize),

    #[error("Full-level coordinate has {got} values, expected {expected}")]
    FullLevelMismatch { got: usize, expected: usize },

    #[error("Pressure requested for '{0}' but its vertical coordinate type is not set")]
    NoVerticalType(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Convert pressure levels to Pa
///
/// Levels whose maximum exceeds 1e4 are taken to be in Pa already, otherwise hPa.
pub fn to_pascal(levels: &[f64]) -> Vec<f64> {
    let max = levels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > PA_THRESHOLD {
        levels.to_vec()
    } else {
        levels.iter().map(|l| l * 100.0).collect()
    }
}

/// Pressure at fixed pressure levels, in Pa, along the `level` dimension
pub fn pressure_from_levels(levels: &[f64]) -> Result<DataArray, VerticalError> {
    let pa = to_pascal(levels);
    let coord = Coord::new(&[PLEVEL_STR], ArrayD::from_shape_vec(IxDyn(&[pa.len()]), pa.clone())
        .map_err(DatasetError::from)?);
    Ok(DataArray::from_vec("p", PLEVEL_STR, pa).with_coord(PLEVEL_STR, coord)?)
}

/// Half-level pressure of hybrid sigma-pressure data
///
/// # Arguments
/// * `pk` - Pressure coefficients (A) at each half level
/// * `bk` - Sigma coefficients (B) at each half level
/// * `p_ref` - Reference pressure multiplying `pk`
/// * `ps` - Surface pressure (Pa)
///
/// # Returns
/// `pk * p_ref + bk * ps` along `phalf`, broadcast over the dimensions of `ps`
pub fn phalf_from_ps(
    pk: &[f64],
    bk: &[f64],
    p_ref: f64,
    ps: &DataArray,
) -> Result<DataArray, VerticalError> {
    if pk.len() != bk.len() {
        return Err(VerticalError::CoefficientMismatch {
            pk: pk.len(),
            bk: bk.len(),
        });
    }
    if pk.len() < 2 {
        return Err(VerticalError::TooFewLevels(pk.len()));
    }
    let a = DataArray::from_vec("pk", PHALF_STR, pk.iter().map(|v| v * p_ref).collect());
    let b = DataArray::from_vec("bk", PHALF_STR, bk.to_vec());
    let phalf = a.add(&b.mul(ps)?)?;
    Ok(phalf.renamed(PHALF_STR))
}

/// Combine adjacent half levels into full levels with `f(upper, lower)`
fn pair_half_levels<F: Fn(f64, f64) -> f64>(
    arr: &DataArray,
    pfull_coord: Option<&[f64]>,
    f: F,
) -> Result<DataArray, VerticalError> {
    let axis = Axis(arr.axis(PHALF_STR)?);
    let n = arr.values.len_of(axis);
    if n < 2 {
        return Err(VerticalError::TooFewLevels(n));
    }
    let upper = arr.values.slice_axis(axis, Slice::from(0..n - 1));
    let lower = arr.values.slice_axis(axis, Slice::from(1..n));
    let values = ndarray::Zip::from(&upper)
        .and(&lower)
        .map_collect(|&u, &l| f(u, l));

    let dims: Vec<String> = arr
        .dims
        .iter()
        .map(|d| if d == PHALF_STR { PFULL_STR.to_string() } else { d.clone() })
        .collect();
    let mut out = DataArray {
        name: arr.name.clone(),
        dims,
        values,
        coords: arr
            .coords
            .iter()
            .filter(|(_, c)| !c.dims.iter().any(|d| d == PHALF_STR))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect(),
        time: arr.time.clone(),
        attrs: arr.attrs.clone(),
    };
    if let Some(pfull) = pfull_coord {
        if pfull.len() != n - 1 {
            return Err(VerticalError::FullLevelMismatch {
                got: pfull.len(),
                expected: n - 1,
            });
        }
        let coord = Coord::new(
            &[PFULL_STR],
            ArrayD::from_shape_vec(IxDyn(&[pfull.len()]), pfull.to_vec())
                .map_err(DatasetError::from)?,
        );
        out = out.with_coord(PFULL_STR, coord)?;
    }
    Ok(out)
}

/// Average a half-level field onto full levels
pub fn to_pfull_from_phalf(
    arr: &DataArray,
    pfull_coord: Option<&[f64]>,
) -> Result<DataArray, VerticalError> {
    pair_half_levels(arr, pfull_coord, |u, l| 0.5 * (u + l))
}

/// Full-level pressure of hybrid sigma-pressure data
pub fn pfull_from_ps(
    pk: &[f64],
    bk: &[f64],
    p_ref: f64,
    ps: &DataArray,
    pfull_coord: Option<&[f64]>,
) -> Result<DataArray, VerticalError> {
    let phalf = phalf_from_ps(pk, bk, p_ref, ps)?;
    Ok(to_pfull_from_phalf(&phalf, pfull_coord)?.renamed("p"))
}

/// Pressure thickness of each full level of hybrid sigma-pressure data
pub fn dp_from_ps(
    pk: &[f64],
    bk: &[f64],
    p_ref: f64,
    ps: &DataArray,
    pfull_coord: Option<&[f64]>,
) -> Result<DataArray, VerticalError> {
    let phalf = phalf_from_ps(pk, bk, p_ref, ps)?;
    Ok(pair_half_levels(&phalf, pfull_coord, |u, l| (l - u).abs())?.renamed("dp"))
}

/// Pressure thickness of fixed pressure levels
///
/// Each level spans the midpoints to its neighbours. The topmost level
/// extends to zero pressure and the bottommost to the surface. Boundaries
/// are capped at the surface pressure, so levels below ground get zero
/// thickness.
///
/// # Arguments
/// * `levels` - Level pressures, hPa or Pa, in any order
/// * `ps` - Surface pressure (Pa)
///
/// # Returns
/// Thickness (Pa) along `level`, broadcast over the dimensions of `ps`
pub fn dp_from_p(levels: &[f64], ps: &DataArray) -> Result<DataArray, VerticalError> {
    let pa = to_pascal(levels);
    let n = pa.len();
    if n == 0 {
        return Err(VerticalError::TooFewLevels(0));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| pa[i].total_cmp(&pa[j]));
    let mut top = vec![0.0; n];
    let mut bottom = vec![f64::INFINITY; n];
    for k in 0..n - 1 {
        let mid = 0.5 * (pa[order[k]] + pa[order[k + 1]]);
        bottom[order[k]] = mid;
        top[order[k + 1]] = mid;
    }

    let top = DataArray::from_vec("top", PLEVEL_STR, top).zip_with(ps, f64::min)?;
    let bottom = DataArray::from_vec("bottom", PLEVEL_STR, bottom).zip_with(ps, f64::min)?;
    let dp = bottom.zip_with(&top, |b, t| (b - t).max(0.0))?;

    let coord = Coord::new(
        &[PLEVEL_STR],
        ArrayD::from_shape_vec(IxDyn(&[n]), pa).map_err(DatasetError::from)?,
    );
    Ok(dp.renamed("dp").with_coord(PLEVEL_STR, coord)?)
}

/// Mass-weighted vertical integral: sum over `vert_dim` of `arr * dp / g`
pub fn int_dp_g(
    arr: &DataArray,
    dp: &DataArray,
    vert_dim: &str,
    g: f64,
) -> Result<DataArray, VerticalError> {
    let integrand = arr.mul(dp)?;
    Ok(integrand.sum_dim(vert_dim)?.map(|v| v / g))
}
