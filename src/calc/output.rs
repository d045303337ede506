//! Output kinds: which series is reduced, how, and how results are labeled.

use crate::model::{TimeSampling, VertType};
use crate::time_utils::interval_label;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unsupported reduction '{kind}': {reason}")]
pub struct UnsupportedReduction {
    pub kind: String,
    pub reason: String,
}

/// Which time series an output is computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// The series at the input sampling
    Full,
    /// Deviations of each step from its monthly mean
    Eddy,
    /// The series of monthly means
    TimeMean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zonal {
    None,
    /// Deviation from the zonal mean
    Asym,
    /// Zonal mean
    Mean,
}

/// Terminal reduction over years
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeReducer {
    Ts,
    /// `None`: keep the series as is
    Identity,
    Av,
    /// Population standard deviation
    Std,
}

/// A parsed output kind such as `ts`, `reg.av` or `eddy.zasym.std`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputKind {
    pub selector: Selector,
    pub regional: bool,
    pub zonal: Zonal,
    pub reducer: TimeReducer,
    label: String,
}

impl OutputKind {
    /// The kind as written, used in file names and as the result key
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn needs_monthly(&self) -> bool {
        matches!(self.selector, Selector::Eddy | Selector::TimeMean)
    }
}

impl FromStr for OutputKind {
    type Err = UnsupportedReduction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| UnsupportedReduction {
            kind: s.to_string(),
            reason: reason.to_string(),
        };
        let tokens: Vec<&str> = s.split('.').collect();
        let (terminal, qualifiers) = tokens
            .split_last()
            .ok_or_else(|| fail("empty output kind"))?;
        let reducer = match *terminal {
            "ts" => TimeReducer::Ts,
            "None" => TimeReducer::Identity,
            "av" => TimeReducer::Av,
            "std" => TimeReducer::Std,
            _ => return Err(fail("must end in one of ts, None, av, std")),
        };

        let mut selector = None;
        let mut regional = false;
        let mut zonal = None;
        for token in qualifiers {
            match *token {
                "eddy" | "time-mean" => {
                    if selector.is_some() {
                        return Err(fail("more than one series selector"));
                    }
                    selector = Some(if *token == "eddy" {
                        Selector::Eddy
                    } else {
                        Selector::TimeMean
                    });
                }
                "reg" => {
                    if regional {
                        return Err(fail("'reg' given twice"));
                    }
                    regional = true;
                }
                "zasym" | "zmean" => {
                    if zonal.is_some() {
                        return Err(fail("more than one zonal operator"));
                    }
                    zonal = Some(if *token == "zasym" { Zonal::Asym } else { Zonal::Mean });
                }
                "ts" | "None" | "av" | "std" => return Err(fail("time reducer must come last")),
                other => return Err(fail(&format!("unknown token '{}'", other))),
            }
        }
        let zonal = zonal.unwrap_or(Zonal::None);
        if regional && zonal == Zonal::Mean {
            return Err(fail("'reg' cannot be combined with 'zmean'"));
        }
        Ok(OutputKind {
            selector: selector.unwrap_or(Selector::Full),
            regional,
            zonal,
            reducer,
            label: s.to_string(),
        })
    }
}

impl TryFrom<String> for OutputKind {
    type Error = UnsupportedReduction;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OutputKind> for String {
    fn from(kind: OutputKind) -> Self {
        kind.label
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Vertical reduction of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertReduction {
    /// Mass-weighted column integral
    #[serde(rename = "vert_int")]
    VertInt,
}

impl VertReduction {
    pub fn label(&self) -> &'static str {
        match self {
            VertReduction::VertInt => "vert_int",
        }
    }
}

impl FromStr for VertReduction {
    type Err = UnsupportedReduction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vert_int" => Ok(VertReduction::VertInt),
            other => Err(UnsupportedReduction {
                kind: other.to_string(),
                reason: "only vert_int is supported".to_string(),
            }),
        }
    }
}

/// `from_<intvl_in>_<sampling>[_<vert>]`
pub fn data_in_label(intvl_in: &str, dtype_in_time: TimeSampling, dtype_in_vert: Option<VertType>) -> String {
    let mut label = format!("from_{}_{}", intvl_in, dtype_in_time);
    if let Some(vert) = dtype_in_vert {
        label.push('_');
        label.push_str(vert.label());
    }
    label.replace("__", "_")
}

/// `<intvl_out>.<kind>[.<vert_out>]`
pub fn data_out_label(intvl_out: &str, kind: &OutputKind, vert_out: Option<VertReduction>) -> String {
    let mut label = format!("{}.{}", interval_label(intvl_out), kind.label());
    if let Some(vert) = vert_out {
        label.push('.');
        label.push_str(vert.label());
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> OutputKind {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_kinds() {
        let k = parse("av");
        assert_eq!(k.selector, Selector::Full);
        assert!(!k.regional);
        assert_eq!(k.reducer, TimeReducer::Av);

        let k = parse("eddy.reg.zasym.std");
        assert_eq!(k.selector, Selector::Eddy);
        assert!(k.regional);
        assert_eq!(k.zonal, Zonal::Asym);
        assert_eq!(k.reducer, TimeReducer::Std);
        assert!(k.needs_monthly());

        assert_eq!(parse("time-mean.None").reducer, TimeReducer::Identity);
        assert_eq!(parse("zmean.ts").zonal, Zonal::Mean);
    }

    #[test]
    fn test_reject_malformed_kinds() {
        for bad in ["", "reg", "av.ts", "reg.reg.av", "eddy.time-mean.av", "reg.zmean.av", "foo.av", "zasym.zmean.ts"] {
            assert!(bad.parse::<OutputKind>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(data_in_label("monthly", TimeSampling::TS, None), "from_monthly_ts");
        assert_eq!(
            data_in_label("3hr", TimeSampling::INST, Some(VertType::Sigma)),
            "from_3hr_inst_sigma"
        );
        assert_eq!(data_out_label("ann", &parse("reg.av"), None), "ann.reg.av");
        assert_eq!(
            data_out_label("7", &parse("av"), Some(VertReduction::VertInt)),
            "jul.av.vert_int"
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let kind: OutputKind = serde_json::from_str("\"reg.ts\"").unwrap();
        assert!(kind.regional);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"reg.ts\"");
        assert!(serde_json::from_str::<OutputKind>("\"bogus\"").is_err());
    }
}
