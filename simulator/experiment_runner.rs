// Experiment Runner - sweep ring sizes and aggregate run statistics
//
// Usage:
//   cargo run --bin experiment_runner
//   cargo run --bin experiment_runner -- sweeps/small_rings.yaml
//   cargo run --bin experiment_runner -- --max-n 32 --k 5 --csv results.csv

mod experiment;

use std::env;
use std::fs;
use std::process::exit;

use log::{error, info};
use simple_logger::SimpleLogger;

use experiment::{ExperimentConfig, ExperimentRunner};

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} [sweep.yaml] [options]", program);
    eprintln!("\nOptions:");
    eprintln!("  --start-n N         smallest ring size (default 2)");
    eprintln!("  --max-n N           largest ring size to attempt (default 16)");
    eprintln!("  --initial-p F       initial event probability (default 0.5)");
    eprintln!("  --k N               silent rounds required to terminate (default 5)");
    eprintln!("  --hop-delay-ms N    artificial per-hop delay (default 100)");
    eprintln!("  --timeout-secs N    wall-clock bound per run (default 60)");
    eprintln!("  --seed HEX          experiment seed forwarded to the nodes");
    eprintln!("  --csv PATH          results file (default experiment_results.csv)");
    eprintln!("\nExamples:");
    eprintln!("  {} sweeps/small_rings.yaml", program);
    eprintln!("  {} --max-n 32 --seed 0x1234", program);
    exit(1);
}

fn parse_config() -> ExperimentConfig {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut config = ExperimentConfig::default();

    let mut i = 1;
    // optional scenario file comes first, CLI flags override it
    if args.len() > 1 && !args[1].starts_with("--") {
        let content = fs::read_to_string(&args[1]).unwrap_or_else(|e| {
            eprintln!("Failed to read {}: {}", args[1], e);
            exit(1);
        });
        config = serde_yaml::from_str(&content).unwrap_or_else(|e| {
            eprintln!("Failed to parse {}: {}", args[1], e);
            exit(1);
        });
        i = 2;
    }

    while i < args.len() {
        let take_value = |i: &mut usize| -> String {
            *i += 1;
            if *i >= args.len() {
                usage(&program);
            }
            args[*i].clone()
        };

        match args[i].as_str() {
            "--start-n" => {
                config.start_n = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--max-n" => {
                config.max_n = take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--initial-p" => {
                config.initial_probability =
                    take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--k" => {
                config.silence_threshold =
                    take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--hop-delay-ms" => {
                config.hop_delay_ms =
                    take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--timeout-secs" => {
                config.run_timeout_secs =
                    take_value(&mut i).parse().unwrap_or_else(|_| usage(&program))
            }
            "--seed" => config.seed = Some(take_value(&mut i)),
            "--csv" => config.csv_path = Some(take_value(&mut i)),
            _ => usage(&program),
        }
        i += 1;
    }

    if config.start_n < 1 || config.max_n < config.start_n {
        eprintln!("ring sizes must satisfy 1 <= start_n <= max_n");
        exit(1);
    }
    if !(config.initial_probability > 0.0 && config.initial_probability <= 1.0) {
        eprintln!("--initial-p must be in (0, 1]");
        exit(1);
    }
    if config.silence_threshold == 0 {
        eprintln!("--k must be at least 1");
        exit(1);
    }

    config
}

fn main() {
    SimpleLogger::new().init().unwrap();

    let config = parse_config();
    info!("starting sweep: {}", config.summary_line());

    let csv_path = config.csv_path.clone();
    let results = ExperimentRunner::new(config).run();

    results.print_summary();

    if let Some(path) = csv_path {
        match results.write_csv(&path) {
            Ok(()) => info!("results written to {}", path),
            Err(e) => {
                error!("failed to write {}: {}", path, e);
                exit(1);
            }
        }
    }

    if results.runs.is_empty() {
        exit(1);
    }
}
