use clap::{Arg, ArgAction, ArgMatches, Command};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Physical constants
#[derive(Clone, Debug)]
pub struct Constants {
    /// Gravitational acceleration (m/s²)
    pub g: f64,
}

impl Default for Constants {
    fn default() -> Self {
        Self { g: 9.80665 }
    }
}

/// Main configuration structure with CLI support
#[derive(Clone, Debug)]
pub struct Config {
    /// Physical constants
    pub constants: Constants,

    // Storage locations
    /// Root of the scratch tree
    pub work_root: PathBuf,
    /// Root of the archive tree
    pub archive_root: PathBuf,
    /// User component of scratch and archive paths
    pub user: String,

    // Input handling
    /// Earliest reference year decoded without the epoch-shift workaround
    pub min_safe_year: i32,
    /// Known timestamp errors of instantaneous data, in hours, by input interval.
    /// The 3hr/6hr entries shift each stamp back by one interval; confirm
    /// against the data provider before adding new ones.
    pub inst_time_offsets: BTreeMap<String, i64>,
    /// External command that stages files from slow storage, e.g. `dmget`
    pub stage_command: Option<String>,

    // Execution
    /// Also write results into the archive tarball
    pub archive: bool,
    /// Number of parallel threads (0 lets rayon decide)
    pub num_threads: usize,
    /// Verbose output
    pub verbose: bool,
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn default_inst_time_offsets() -> BTreeMap<String, i64> {
    BTreeMap::from([("3hr".to_string(), -3), ("6hr".to_string(), -6)])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            constants: Constants::default(),
            work_root: PathBuf::from("/work"),
            archive_root: PathBuf::from("/archive"),
            user: default_user(),
            min_safe_year: 1678,
            inst_time_offsets: default_inst_time_offsets(),
            stage_command: None,
            archive: false,
            num_threads: 0,
            verbose: false,
        }
    }
}

impl Config {
    /// Command-line arguments shared by every subcommand
    pub fn args() -> Vec<Arg> {
        vec![
            Arg::new("work-root")
                .long("work-root")
                .value_name("DIR")
                .help("Root of the scratch directory tree")
                .default_value("/work"),
            Arg::new("archive-root")
                .long("archive-root")
                .value_name("DIR")
                .help("Root of the archive directory tree")
                .default_value("/archive"),
            Arg::new("user")
                .long("user")
                .value_name("NAME")
                .help("User component of output paths (defaults to $USER)"),
            Arg::new("min-safe-year")
                .long("min-safe-year")
                .value_name("YEAR")
                .help("Earliest reference year decoded without shifting")
                .default_value("1678"),
            Arg::new("inst-offset")
                .long("inst-offset")
                .value_name("INTERVAL=HOURS")
                .help("Timestamp correction for instantaneous data, e.g. 3hr=-3 (repeatable)")
                .action(ArgAction::Append),
            Arg::new("stage-command")
                .long("stage-command")
                .value_name("PROGRAM")
                .help("Command run on source files before reading them (e.g. dmget)"),
            Arg::new("archive")
                .long("archive")
                .help("Also save results to the archive tarball")
                .action(ArgAction::SetTrue),
            Arg::new("num-threads")
                .short('j')
                .long("num-threads")
                .value_name("COUNT")
                .help("Number of parallel threads (0 = all cores)")
                .default_value("0"),
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose output")
                .action(ArgAction::SetTrue),
        ]
    }

    /// Parse configuration from command line arguments
    pub fn from_args() -> Result<Self, String> {
        let app = Command::new("climdiag")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Derived climate diagnostics with scratch/archive caching")
            .args(Self::args());
        let matches = app.try_get_matches().map_err(|e| e.to_string())?;
        Self::from_matches(&matches)
    }

    /// Build a configuration from already parsed arguments
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let string = |name: &str| matches.get_one::<String>(name).cloned();

        let mut inst_time_offsets = default_inst_time_offsets();
        if let Some(values) = matches.get_many::<String>("inst-offset") {
            for value in values {
                let (interval, hours) = Self::parse_offset(value)?;
                inst_time_offsets.insert(interval, hours);
            }
        }

        let config = Self {
            constants: Constants::default(),
            work_root: PathBuf::from(string("work-root").unwrap_or_else(|| "/work".into())),
            archive_root: PathBuf::from(string("archive-root").unwrap_or_else(|| "/archive".into())),
            user: string("user").unwrap_or_else(default_user),
            min_safe_year: string("min-safe-year")
                .unwrap_or_else(|| "1678".into())
                .parse()
                .map_err(|_| "Invalid minimum safe year")?,
            inst_time_offsets,
            stage_command: string("stage-command"),
            archive: matches.get_flag("archive"),
            num_threads: string("num-threads")
                .unwrap_or_else(|| "0".into())
                .parse()
                .map_err(|_| "Invalid number of threads")?,
            verbose: matches.get_flag("verbose"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse an `INTERVAL=HOURS` offset
    fn parse_offset(value: &str) -> Result<(String, i64), String> {
        let (interval, hours) = value
            .split_once('=')
            .ok_or_else(|| format!("Invalid offset '{}': expected INTERVAL=HOURS", value))?;
        let hours = hours
            .trim()
            .parse()
            .map_err(|_| format!("Invalid offset hours in '{}'", value))?;
        Ok((interval.trim().to_string(), hours))
    }

    /// Create an Arc<Config> for thread-safe sharing
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Timestamp correction, in hours, for instantaneous data at `intvl_in`
    pub fn inst_offset_hours(&self, intvl_in: &str) -> Option<i64> {
        self.inst_time_offsets.get(intvl_in).copied()
    }

    /// A configuration rooted in `root`, for tests and examples
    pub fn for_testing(root: &Path) -> Self {
        Self {
            work_root: root.join("work"),
            archive_root: root.join("archive"),
            user: "tester".to_string(),
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.user.is_empty() || self.user.contains(std::path::MAIN_SEPARATOR) {
            return Err(format!("Invalid user name: '{}'", self.user));
        }
        if self.work_root == self.archive_root {
            return Err("Scratch and archive roots must differ".to_string());
        }
        if !(1678..=2262).contains(&self.min_safe_year) {
            return Err(format!(
                "Minimum safe year must lie within 1678-2262, got {}",
                self.min_safe_year
            ));
        }
        if self.constants.g <= 0.0 {
            return Err("Gravitational acceleration must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_offsets() {
        let config = Config::default();
        assert_eq!(config.inst_offset_hours("3hr"), Some(-3));
        assert_eq!(config.inst_offset_hours("6hr"), Some(-6));
        assert_eq!(config.inst_offset_hours("daily"), None);
    }

    #[test]
    fn test_from_matches() {
        let matches = Command::new("t")
            .args(Config::args())
            .try_get_matches_from([
                "t",
                "--work-root",
                "/scratch",
                "--user",
                "me",
                "--inst-offset",
                "1hr=-1",
                "--archive",
            ])
            .unwrap();
        let config = Config::from_matches(&matches).unwrap();
        assert_eq!(config.work_root, PathBuf::from("/scratch"));
        assert_eq!(config.user, "me");
        assert!(config.archive);
        assert_eq!(config.inst_offset_hours("1hr"), Some(-1));
        assert_eq!(config.inst_offset_hours("3hr"), Some(-3));
    }

    #[test]
    fn test_bad_offset() {
        assert!(Config::parse_offset("3hr").is_err());
        assert!(Config::parse_offset("3hr=x").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::for_testing(Path::new("/tmp/x"));
        assert!(config.validate().is_ok());
        config.archive_root = config.work_root.clone();
        assert!(config.validate().is_err());

        let mut config = Config::for_testing(Path::new("/tmp/x"));
        config.min_safe_year = 1500;
        assert!(config.validate().is_err());

        let mut config = Config::for_testing(Path::new("/tmp/x"));
        config.constants = Constants { g: 0.0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_gravity() {
        assert_eq!(Constants::default().g, 9.80665);
        assert_eq!(Config::default().constants.g, 9.80665);
    }
}
