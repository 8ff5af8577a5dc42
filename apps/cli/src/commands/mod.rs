//! Command implementations for the Distill CLI.

pub mod eval;
pub mod train;

use anyhow::{Context, Result};
use clap::Args;
use distill_training::events::StatusPayload;
use distill_training::{merge_sources, Event, EventSink, RawConfig, EXIT_FAILED};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Input channels shared by every job command.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Path to a JSON job descriptor
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also read a JSON job descriptor from stdin (the config file wins on conflicts)
    #[arg(long)]
    pub stdin: bool,

    /// Run directory (overrides run_dir in the descriptor)
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
}

impl JobArgs {
    /// Read and merge both input channels.
    pub fn load(&self) -> Result<RawConfig> {
        let file = self.config.as_deref().map(read_config_file).transpose()?;
        let secondary = if self.stdin { read_stdin()? } else { None };
        Ok(merge_sources(file, secondary)?)
    }
}

fn read_config_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Whitespace-only stdin counts as no input.
fn read_stdin() -> Result<Option<Value>> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text).context("failed to read stdin")?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&text).context("failed to parse stdin config")?;
    Ok(Some(value))
}

/// Report a failure that happened before a job could start.
pub fn input_failure(err: &anyhow::Error, sink: &dyn EventSink) -> i32 {
    tracing::error!("{:#}", err);
    sink.emit(Event::Status(StatusPayload::error(format!("{err:#}")).trace(format!("{err:?}"))));
    EXIT_FAILED
}
