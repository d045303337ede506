use clap::{Arg, ArgMatches, Command};
use climdiag::{
    config::Config,
    driver::{locate_request, run_request},
    request::CalcRequest,
};
use std::collections::BTreeMap;
use std::path::Path;

fn main() {
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("compute", sub_matches)) => {
            if let Err(e) = run_compute(sub_matches) {
                eprintln!("Computation error: {}", e);
                std::process::exit(1);
            }
        }
        Some(("locate", sub_matches)) => {
            if let Err(e) = run_locate(sub_matches) {
                eprintln!("Locate error: {}", e);
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("Please specify a subcommand. Use --help for more information.");
            std::process::exit(1);
        }
    }
}

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load(matches: &ArgMatches) -> Result<(Config, CalcRequest), String> {
    let config = Config::from_matches(matches)?;
    init_logging(&config);
    let request_path = matches
        .get_one::<String>("request")
        .ok_or("Missing --request")?;
    let request = CalcRequest::from_file(Path::new(request_path)).map_err(|e| e.to_string())?;
    Ok((config, request))
}

fn run_compute(matches: &ArgMatches) -> Result<(), String> {
    let (config, request) = load(matches)?;
    let config = config.into_arc();
    let outcomes = run_request(&request, &BTreeMap::new(), &config).map_err(|e| e.to_string())?;

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    println!("\n=== {} calculations, {} failed ===", outcomes.len(), failed);
    for outcome in &outcomes {
        match &outcome.result {
            Ok(paths) => {
                println!("{}", outcome.label);
                for path in paths {
                    println!("  {}", path.display());
                }
            }
            Err(e) => println!("{}\n  FAILED: {}", outcome.label, e),
        }
    }
    if failed > 0 {
        return Err(format!("{} of {} calculations failed", failed, outcomes.len()));
    }
    Ok(())
}

fn run_locate(matches: &ArgMatches) -> Result<(), String> {
    let (config, request) = load(matches)?;
    let config = config.into_arc();
    for (label, files) in locate_request(&request, &BTreeMap::new(), &config).map_err(|e| e.to_string())? {
        println!("{}", label);
        match files {
            Ok(inputs) => {
                for (name, paths) in inputs {
                    println!("  {}:", name);
                    for path in paths {
                        println!("    {}", path.display());
                    }
                }
            }
            Err(e) => println!("  not found: {}", e),
        }
    }
    Ok(())
}

fn request_arg() -> Arg {
    Arg::new("request")
        .short('r')
        .long("request")
        .value_name("FILE")
        .help("JSON request describing models, runs, variables and calculations")
        .required(true)
}

fn build_cli() -> Command {
    Command::new("climdiag")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Derived climate diagnostics with scratch/archive caching")
        .subcommand_required(true)
        .subcommand(
            Command::new("compute")
                .about("Compute, reduce and save every calculation of a request")
                .arg(request_arg())
                .args(Config::args()),
        )
        .subcommand(
            Command::new("locate")
                .about("Print the source files each calculation of a request would read")
                .arg(request_arg())
                .args(Config::args()),
        )
}
