pub mod calc;
pub mod config;
pub mod dataset;
pub mod driver;
pub mod locator;
pub mod math;
pub mod model;
pub mod names;
pub mod region;
pub mod request;
pub mod staging;
pub mod time_utils;

pub use calc::{Artifact, Calc, CalcError, CalcSpec, LoadOptions, OutputKind};
pub use config::Config;
pub use model::{Model, Project, Run, Var};
pub use region::Region;
