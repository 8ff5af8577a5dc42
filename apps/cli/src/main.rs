//! Distill CLI - offline train/eval job runner
//!
//! Reads a job descriptor from `--config` and/or stdin, runs it, and writes the
//! event stream to stdout as JSON lines. Diagnostics go to stderr.

mod commands;

use clap::{Parser, Subcommand};
use commands::JobArgs;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "DISTILL_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "distill",
    author,
    version,
    about = "Offline fine-tuning and knowledge distillation job runner",
    long_about = "Runs training and evaluation jobs described by JSON.\nEvents are written to stdout one JSON object per line; logs go to stderr."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train or distill a student model
    ///
    /// Exits 0 on success, 130 when cancelled through the run directory's
    /// cancel.flag, and 2 on any other failure.
    Train(JobArgs),

    /// Evaluate a trained model version against a stored dataset
    Eval(JobArgs),
}

fn init_tracing(log_level: &str) {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(level_directive(log_level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to initialise logging: {err}");
    }
}

fn level_directive(log_level: &str) -> &'static str {
    match log_level {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let code = match args.command {
        Command::Train(job) => commands::train::execute(&job),
        Command::Eval(job) => commands::eval::execute(&job),
    };
    std::process::exit(code);
}
