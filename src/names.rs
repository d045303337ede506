//! Canonical names for grid and time attributes, and the alternate spellings
//! accepted for each of them in source files.

use std::sync::OnceLock;

pub const LAT_STR: &str = "lat";
pub const LAT_BOUNDS_STR: &str = "lat_bounds";
pub const LON_STR: &str = "lon";
pub const LON_BOUNDS_STR: &str = "lon_bounds";
pub const ZSURF_STR: &str = "zsurf";
pub const SFC_AREA_STR: &str = "sfc_area";
pub const LAND_MASK_STR: &str = "land_mask";
pub const PK_STR: &str = "pk";
pub const BK_STR: &str = "bk";
pub const PHALF_STR: &str = "phalf";
pub const PFULL_STR: &str = "pfull";
pub const PLEVEL_STR: &str = "level";
pub const TIME_STR: &str = "time";
pub const YEAR_STR: &str = "year";
pub const AVERAGE_DT_STR: &str = "average_DT";
pub const TIME_BOUNDS_STR: &str = "time_bounds";
pub const AVERAGE_T1_STR: &str = "average_T1";
pub const AVERAGE_T2_STR: &str = "average_T2";
pub const NV_STR: &str = "nv";
pub const AVG_START_DATE_STR: &str = "avg_start_date";
pub const AVG_END_DATE_STR: &str = "avg_end_date";

/// Names of the pressure and pressure-thickness pseudo-variables, which are
/// computed from the vertical coordinate rather than read from disk.
pub const P_STR: &str = "p";
pub const DP_STR: &str = "dp";
/// Surface pressure, used to build pressure fields on hybrid levels.
pub const PS_STR: &str = "ps";

/// An ordered mapping from canonical attribute name to accepted spellings.
#[derive(Debug, Clone)]
pub struct GridAttrs {
    entries: Vec<(&'static str, Vec<&'static str>)>,
}

impl GridAttrs {
    fn standard() -> Self {
        let entries = vec![
            (LAT_STR, vec!["lat", "latitude", "LATITUDE", "y", "yto"]),
            (LAT_BOUNDS_STR, vec!["latb", "lat_bnds", "lat_bounds"]),
            (LON_STR, vec!["lon", "longitude", "LONGITUDE", "x", "xto"]),
            (LON_BOUNDS_STR, vec!["lonb", "lon_bnds", "lon_bounds"]),
            (ZSURF_STR, vec!["zsurf"]),
            (SFC_AREA_STR, vec!["area", "sfc_area"]),
            (LAND_MASK_STR, vec!["land_mask"]),
            (PK_STR, vec!["pk"]),
            (BK_STR, vec!["bk"]),
            (PHALF_STR, vec!["phalf"]),
            (PFULL_STR, vec!["pfull"]),
            (PLEVEL_STR, vec!["level", "lev", "plev"]),
            (TIME_STR, vec!["time"]),
            (AVERAGE_DT_STR, vec!["average_DT"]),
            (TIME_BOUNDS_STR, vec!["time_bounds", "time_bnds"]),
            (AVERAGE_T1_STR, vec!["average_T1"]),
            (AVERAGE_T2_STR, vec!["average_T2"]),
            (NV_STR, vec!["nv"]),
            (AVG_START_DATE_STR, vec!["avg_start_date"]),
            (AVG_END_DATE_STR, vec!["avg_end_date"]),
        ];
        Self { entries }
    }

    /// Iterate over `(canonical, accepted spellings)` in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[&'static str])> + '_ {
        self.entries.iter().map(|(name, aliases)| (*name, aliases.as_slice()))
    }

    /// Accepted spellings for a canonical name.
    pub fn aliases(&self, canonical: &str) -> Option<&[&'static str]> {
        self.entries
            .iter()
            .find(|(name, _)| *name == canonical)
            .map(|(_, aliases)| aliases.as_slice())
    }

    pub fn is_grid_attr(&self, name: &str) -> bool {
        self.entries.iter().any(|(canonical, _)| *canonical == name)
    }

    /// First accepted spelling of `canonical` that appears in `present`.
    pub fn first_present<'a, I>(&self, canonical: &str, present: I) -> Option<&'static str>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.aliases(canonical)?
            .iter()
            .copied()
            .find(|alias| present.clone().into_iter().any(|p| p == *alias))
    }
}

/// The process-wide alias table.
pub fn grid_attrs() -> &'static GridAttrs {
    static TABLE: OnceLock<GridAttrs> = OnceLock::new();
    TABLE.get_or_init(GridAttrs::standard)
}

/// Names a vertical dimension may carry.
pub const VERTICAL_DIMS: [&str; 3] = [PFULL_STR, PHALF_STR, PLEVEL_STR];

/// Sort rank of a dimension in the canonical axis order
/// `[time|year, vertical, lat, lon, other]`.
pub fn dim_rank(dim: &str) -> usize {
    match dim {
        TIME_STR | YEAR_STR => 0,
        d if VERTICAL_DIMS.contains(&d) => 1,
        LAT_STR => 2,
        LON_STR => 3,
        _ => 4,
    }
}
