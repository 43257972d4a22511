//! Conductor CLI Entry Point
//!
//! Loads sequence definitions, mounts them with built-in demo handlers and
//! plays them, printing lifecycle events and final statistics.
//!
//! # Usage
//!
//! ```bash
//! # Play every sequence in a file
//! conductor sequences.yaml
//!
//! # Play one sequence with start data
//! conductor sequences.yaml --sequence drag --data '{"elementId": "rect-1"}'
//!
//! # Load orchestrator settings and raise priority
//! conductor sequences.yaml --config conductor.yaml --priority high
//! ```
//!
//! Handler names map to built-in demo behaviour: `fail` returns an error,
//! `noop` does nothing, `log` logs the baton, `merge` merges the beat's
//! data into the baton. Any other name appends the beat to `trace`.

use std::env;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::{json, Value};

use conductor::events::{BEAT_ERRORED, SEQUENCE_CANCELLED, SEQUENCE_COMPLETED, SEQUENCE_FAILED};
use conductor::{
    load_sequences, BeatInvocation, Conductor, ConductorConfig, ExecutionStatus, Handler, HandlerError,
    HandlerMap, Priority, RequestId, Sequence, APP_NAME, VERSION,
};

/// Default sequence file used when none is specified.
const DEFAULT_SEQUENCE_FILE: &str = "sequences.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    sequence_file: String,
    config_path: Option<String>,
    plugin_id: Option<String>,
    sequences: Vec<String>,
    data: Value,
    priority: Priority,
    max_concurrent: Option<usize>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sequence_file: DEFAULT_SEQUENCE_FILE.to_string(),
            config_path: None,
            plugin_id: None,
            sequences: Vec::new(),
            data: json!({}),
            priority: Priority::Normal,
            max_concurrent: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Sequence Orchestration Engine");
    println!();
}

fn print_usage() {
    println!("Usage: conductor [OPTIONS] <SEQUENCE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <SEQUENCE_FILE>      YAML or JSON file with one or more sequences");
    println!();
    println!("Options:");
    println!("  --config PATH        Orchestrator configuration (YAML)");
    println!("  --plugin ID          Plugin id to mount under (default: sequence id)");
    println!("  --sequence ID        Sequence to play; repeatable (default: all)");
    println!("  --data JSON          Start data passed to every sequence");
    println!("  --priority LEVEL     high, normal or chained (default: normal)");
    println!("  --max-concurrent N   Cap on concurrently active executions");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    match value.to_ascii_lowercase().as_str() {
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "chained" => Ok(Priority::Chained),
        other => Err(format!("Invalid priority: {}", other)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_seen = false;
    let mut i = 1;

    let value_of = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--config" => {
                i += 1;
                config.config_path = Some(value_of(i, arg)?);
            }
            "--plugin" => {
                i += 1;
                config.plugin_id = Some(value_of(i, arg)?);
            }
            "--sequence" => {
                i += 1;
                config.sequences.push(value_of(i, arg)?);
            }
            "--data" => {
                i += 1;
                let raw = value_of(i, arg)?;
                config.data = serde_json::from_str(&raw).map_err(|e| format!("Invalid --data JSON: {}", e))?;
            }
            "--priority" => {
                i += 1;
                config.priority = parse_priority(&value_of(i, arg)?)?;
            }
            "--max-concurrent" => {
                i += 1;
                let raw = value_of(i, arg)?;
                config.max_concurrent = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid max-concurrent value: {}", raw))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.sequence_file = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

fn trace_beat(invocation: &BeatInvocation) -> Result<Option<Value>, HandlerError> {
    let mut trace = invocation
        .baton()
        .get("trace")
        .and_then(|trace| trace.as_array().cloned())
        .unwrap_or_default();
    trace.push(json!(format!("{}/{}", invocation.movement_id, invocation.beat.beat)));
    info!(
        "  {} beat {} ({})",
        invocation.sequence_id, invocation.beat.beat, invocation.beat.event
    );
    Ok(Some(json!({ "trace": trace })))
}

/// Demo handlers for every handler name `sequence` uses.
fn demo_handlers(sequence: &Sequence) -> HandlerMap {
    sequence
        .handler_names()
        .into_iter()
        .map(|name| {
            let handler = match name.as_str() {
                "fail" => Handler::sync(|invocation| {
                    Err(HandlerError::new(format!(
                        "beat {} failed on purpose",
                        invocation.beat.beat
                    )))
                }),
                "noop" => Handler::sync(|_| Ok(None)),
                "log" => Handler::sync(|invocation| {
                    info!(
                        "  {} beat {} baton: {}",
                        invocation.sequence_id,
                        invocation.beat.beat,
                        invocation.baton().snapshot()
                    );
                    Ok(None)
                }),
                "merge" => Handler::sync(|invocation| Ok(Some(invocation.data().clone()))),
                _ => Handler::sync(trace_beat),
            };
            (name, handler)
        })
        .collect()
}

fn subscribe_reporting(conductor: &Conductor) {
    for event in [SEQUENCE_COMPLETED, SEQUENCE_FAILED, SEQUENCE_CANCELLED] {
        conductor.bus().subscribe_fn(event, move |data| {
            let label = match event {
                SEQUENCE_COMPLETED => "completed".green(),
                SEQUENCE_FAILED => "failed".red(),
                _ => "cancelled".yellow(),
            };
            println!(
                "{} {} {}",
                label,
                data["requestId"].as_str().unwrap_or_default(),
                data["error"].as_str().unwrap_or_default()
            );
            Ok(())
        });
    }
    conductor.bus().subscribe_fn(BEAT_ERRORED, |data| {
        warn!(
            "Beat {} of {} errored: {}",
            data["beat"],
            data["requestId"].as_str().unwrap_or_default(),
            data["error"].as_str().unwrap_or_default()
        );
        Ok(())
    });
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let mut settings = match &config.config_path {
        Some(path) => ConductorConfig::load(path)?,
        None => ConductorConfig::default(),
    };
    if let Some(max) = config.max_concurrent {
        settings.set_max_concurrent(max);
    }
    info!("Max concurrent executions: {}", settings.max_concurrent);

    info!("Loading sequences: {}", config.sequence_file);
    let sequences = load_sequences(&config.sequence_file).map_err(|e| {
        error!("Failed to load sequences: {}", e);
        format!("Could not load sequences from '{}': {}", config.sequence_file, e)
    })?;

    let conductor = Conductor::new(settings);
    subscribe_reporting(&conductor);

    let mut mounted = Vec::new();
    for sequence in sequences {
        let handlers = demo_handlers(&sequence);
        let result = conductor.mount(sequence, handlers, config.plugin_id.as_deref());
        if result.success {
            mounted.push((result.plugin_id, result.sequence_id));
        } else {
            error!(
                "Could not mount '{}': {}",
                result.sequence_id,
                result.reason.unwrap_or_default()
            );
        }
    }

    let targets: Vec<(String, String)> = if config.sequences.is_empty() {
        mounted
    } else {
        mounted
            .into_iter()
            .filter(|(_, sequence_id)| config.sequences.contains(sequence_id))
            .collect()
    };
    if targets.is_empty() {
        return Err("No mounted sequence matches the request".into());
    }

    let mut requests: Vec<RequestId> = Vec::new();
    for (plugin_id, sequence_id) in &targets {
        match conductor
            .play(plugin_id, sequence_id, config.data.clone(), config.priority)
            .await
        {
            Ok(request) => requests.push(request),
            Err(e) => error!("Could not play '{}': {}", sequence_id, e),
        }
    }

    let mut all_completed = true;
    for request in &requests {
        let status = conductor.wait_for(request).await?;
        all_completed &= status == ExecutionStatus::Completed;
    }
    conductor.wait_idle().await;

    println!();
    println!("{}", "Statistics".bold());
    println!("{}", serde_json::to_string_pretty(&conductor.statistics())?);

    Ok(all_completed && requests.len() == targets.len())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}
