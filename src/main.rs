//! evalhook - Dispatch Scenario Runner

use evalhook::config::DispatchConfig;
use evalhook::sim::Scenario;
use std::env;
use std::process;
use tracing::Level;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("evalhook v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    evalhook [OPTIONS] <SCENARIO>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help           Print this help message");
    eprintln!("    -V, --version        Print version information");
    eprintln!("    -v, --verbose        Log dispatch decisions (repeat for trace output)");
    eprintln!("    -c, --config <FILE>  Dispatcher settings, overriding the scenario's [dispatch]");
    eprintln!("    --stats              Print dispatch statistics after the run");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    <SCENARIO>           Scenario file (TOML)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    evalhook warmup.toml");
    eprintln!("    evalhook --stats -vv warmup.toml");
    eprintln!("    evalhook --config strict.toml warmup.toml");
}

fn print_version() {
    println!("evalhook {}", VERSION);
}

struct Options {
    scenario: String,
    config: Option<String>,
    verbosity: u8,
    show_stats: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut scenario = None;
    let mut config = None;
    let mut verbosity = 0u8;
    let mut show_stats = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-V" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-v" | "--verbose" => {
                verbosity = verbosity.saturating_add(1);
            }
            "-vv" => {
                verbosity = verbosity.saturating_add(2);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config file after --config".to_string());
                }
                config = Some(args[i].clone());
            }
            "--stats" => {
                show_stats = true;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if scenario.is_some() {
                    return Err("Multiple scenario files specified".to_string());
                }
                scenario = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let scenario = scenario.ok_or_else(|| "Missing scenario file".to_string())?;
    Ok(Options {
        scenario,
        config,
        verbosity,
        show_stats,
    })
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(options: &Options) -> Result<usize, String> {
    let mut scenario = Scenario::load(&options.scenario).map_err(|e| e.to_string())?;
    if let Some(path) = &options.config {
        let config = DispatchConfig::load(path).map_err(|e| e.to_string())?;
        scenario = scenario.with_dispatch(config);
    }

    let report = scenario.run().map_err(|e| e.to_string())?;
    print!("{}", report);
    if options.show_stats {
        println!();
        println!("{}", report.stats);
    }
    Ok(report.failures())
}

fn main() {
    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    init_logging(options.verbosity);

    match run(&options) {
        Ok(0) => {}
        Ok(failures) => {
            eprintln!("{} call(s) failed", failures);
            process::exit(2);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
