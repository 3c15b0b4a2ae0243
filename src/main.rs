//! FlowRunner CLI Entry Point
//!
//! Validates and executes a workflow document from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner order.yaml
//!
//! # With input data, inline or from a file
//! flowrunner order.yaml --input '{"sku": "A-1"}'
//! flowrunner order.yaml --input @order.json
//!
//! # Only validate the document
//! flowrunner order.yaml --validate
//!
//! # Dry-run the document and report missing data per state
//! flowrunner order.yaml --check-flow --input @order.json
//!
//! # Engine limits from a config file, overridden by flags
//! flowrunner order.yaml --config engine.yaml --max-visits 50 --parallel 8
//! ```
//!
//! Only `type: expression` functions can run from the command line; other
//! functions need a host application that registers them.

use std::env;
use std::error::Error;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowrunner::execution::InMemoryFunctionRegistry;
use flowrunner::{
    load_workflow, validate, validate_data_flow, Engine, EngineConfig, ValidationStatus, APP_NAME,
    VERSION,
};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    input: Option<String>,
    config_path: Option<String>,
    validate_only: bool,
    check_flow: bool,
    max_visits: Option<usize>,
    max_parallel: Option<usize>,
    verbose: bool,
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
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Serverless Workflow Execution Engine");
    eprintln!();
}

fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to a workflow document (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --input <JSON|@FILE>  Initial workflow data, inline or read from a file");
    println!("  --config FILE         Engine configuration file");
    println!("  --validate            Validate the document and print the report");
    println!("  --check-flow          Dry-run the document and print the data-flow report");
    println!("  --max-visits N        Maximum visits of a single state per run");
    println!("  --parallel N          Default concurrency for parallel ForEach states");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner order.yaml --input '{{\"sku\": \"A-1\"}}'");
    println!("  flowrunner order.yaml --validate");
    println!("  flowrunner order.yaml --config engine.yaml --parallel 8");
}

/// Returns the value following a flag.
fn flag_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

fn parse_count(value: &str, flag: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", flag, value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

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
            "--validate" => config.validate_only = true,
            "--check-flow" => config.check_flow = true,
            "--verbose" | "-v" => config.verbose = true,
            "--input" => config.input = Some(flag_value(args, &mut i, arg)?.to_string()),
            "--config" => config.config_path = Some(flag_value(args, &mut i, arg)?.to_string()),
            "--max-visits" => {
                config.max_visits = Some(parse_count(flag_value(args, &mut i, arg)?, arg)?);
            }
            "--parallel" => {
                config.max_parallel = Some(parse_count(flag_value(args, &mut i, arg)?, arg)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ if config.workflow_path.is_none() => config.workflow_path = Some(arg.clone()),
            _ => return Err(format!("Unexpected argument: {}", arg)),
        }
        i += 1;
    }

    Ok(config)
}

/// Reads `--input`: inline JSON, or `@path` for a JSON file.
fn read_input(input: &str) -> Result<Value, Box<dyn Error>> {
    let text = match input.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).map_err(|e| format!("Could not read input file '{}': {}", path, e))?
        }
        None => input.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| format!("Input is not valid JSON: {}", e).into())
}

/// Formats an error with all of its sources.
fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(&format!("\n  caused by: {}", text));
        }
        source = cause.source();
    }
    message
}

async fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    let workflow_path = config
        .workflow_path
        .ok_or("No workflow file given (see --help)")?;

    info!("Loading workflow: {}", workflow_path);
    let workflow = load_workflow(&workflow_path)?;

    if config.validate_only {
        let report = validate(&workflow);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return match report.status {
            ValidationStatus::Valid => Ok(()),
            ValidationStatus::Invalid => Err("Workflow is invalid".into()),
        };
    }

    if config.check_flow {
        let input = config.input.as_deref().map(read_input).transpose()?;
        let report =
            validate_data_flow(&workflow, Arc::new(InMemoryFunctionRegistry::new()), input).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return match report.status {
            ValidationStatus::Valid => Ok(()),
            ValidationStatus::Invalid => Err("Workflow data flow is inconsistent".into()),
        };
    }

    print_banner();

    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(max) = config.max_visits {
        engine_config.max_state_visits = max;
    }
    if let Some(max) = config.max_parallel {
        engine_config.max_concurrency = max;
    }

    let input = config.input.as_deref().map(read_input).transpose()?;

    let mut engine = Engine::new(Arc::new(InMemoryFunctionRegistry::new()));
    engine.set_config(engine_config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            on_interrupt.cancel();
        }
    });

    let result = engine
        .execute_with_cancellation(&workflow, input, cancel)
        .await?;

    eprintln!("{} {}", "Workflow completed:".green().bold(), workflow.id);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), error_chain(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}
