//! Hyperparameter resolution.
//!
//! The map is free-form: a nested `training` section overrides top-level keys,
//! and `distillation`, `lora`, `export` hold their own settings.

use crate::config::{as_float, as_non_negative, as_text, get_any, present, truthy, RawConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::mode::AlphaSchedule;
use serde_json::Value;

pub const DEFAULT_LEARNING_RATE: f64 = 5e-5;
pub const DEFAULT_MAX_SEQ_LEN: usize = 512;
pub const DEFAULT_SEPARATOR: &str = "\n\n";
pub const DEFAULT_TEMPERATURE: f64 = 2.0;
pub const DEFAULT_ALPHA: f64 = 0.5;

/// Wrapper over the raw map with section-aware lookups.
#[derive(Debug, Clone, Default)]
pub struct HyperParams {
    raw: RawConfig,
}

impl HyperParams {
    #[must_use]
    pub fn new(raw: RawConfig) -> Self {
        Self { raw }
    }

    /// A nested object section, if present.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&RawConfig> {
        present(&self.raw, name).and_then(Value::as_object)
    }

    /// Top-level value under any of `keys`.
    #[must_use]
    pub fn top(&self, keys: &[&str]) -> Option<&Value> {
        get_any(&self.raw, keys)
    }

    /// Section value first, then the top-level fallback.
    fn lookup(&self, section: &str, keys: &[&str]) -> Option<&Value> {
        self.section(section)
            .and_then(|s| get_any(s, keys))
            .or_else(|| self.top(keys))
    }

    fn uint(&self, section: &str, keys: &[&str]) -> TrainingResult<Option<u64>> {
        self.lookup(section, keys).map(|v| as_non_negative(keys[0], v)).transpose()
    }

    fn float(&self, section: &str, keys: &[&str]) -> TrainingResult<Option<f64>> {
        self.lookup(section, keys).map(|v| as_float(keys[0], v)).transpose()
    }

    pub fn training(&self, job_steps: u64) -> TrainingResult<TrainingParams> {
        const S: &str = "training";
        let max_steps = match self.uint(S, &["max_steps", "maxSteps"])? {
            Some(0) | None => job_steps,
            Some(n) => n,
        };
        let params = TrainingParams {
            batch_size: self.uint(S, &["batch_size", "batchSize"])?.unwrap_or(1) as usize,
            grad_accum: self.uint(S, &["grad_accum", "gradAccum"])?.unwrap_or(1) as usize,
            learning_rate: self
                .float(S, &["lr", "learning_rate", "learningRate"])?
                .unwrap_or(DEFAULT_LEARNING_RATE),
            weight_decay: self.float(S, &["weight_decay", "weightDecay"])?.unwrap_or(0.0),
            warmup_steps: self.uint(S, &["warmup_steps", "warmupSteps"])?.unwrap_or(0),
            epochs: self.uint(S, &["epochs"])?.unwrap_or(1),
            max_seq_len: self
                .uint(S, &["max_seq_len", "maxSeqLen"])?
                .map_or(DEFAULT_MAX_SEQ_LEN, |n| n as usize),
            separator: self
                .lookup(S, &["separator"])
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_SEPARATOR)
                .to_string(),
            add_eos: self.lookup(S, &["add_eos", "addEos"]).is_none_or(truthy),
            max_steps,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn distillation(&self) -> TrainingResult<DistillParams> {
        const S: &str = "distillation";
        let temperature = self.float(S, &["temperature"])?.unwrap_or(DEFAULT_TEMPERATURE);
        let alpha = self.float(S, &["alpha"])?.unwrap_or(DEFAULT_ALPHA);
        // alpha_start is only read from the section.
        let alpha_start = self
            .section(S)
            .and_then(|s| get_any(s, &["alpha_start", "alphaStart"]))
            .map(|v| as_float("alpha_start", v))
            .transpose()?
            .unwrap_or(alpha);
        let alpha_warmup_steps = self.uint(S, &["alpha_warmup_steps", "alphaWarmupSteps"])?.unwrap_or(0);

        if temperature <= 0.0 {
            return Err(TrainingError::config("temperature must be > 0"));
        }
        for (name, value) in [("alpha", alpha), ("alpha_start", alpha_start)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrainingError::config(format!("{name} must be within [0, 1]")));
            }
        }

        Ok(DistillParams {
            temperature,
            schedule: AlphaSchedule { start: alpha_start, end: alpha, warmup_steps: alpha_warmup_steps },
        })
    }

    /// Text value from the top level under any of `keys`.
    #[must_use]
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        self.top(keys).and_then(as_text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingParams {
    pub batch_size: usize,
    pub grad_accum: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_steps: u64,
    pub epochs: u64,
    pub max_seq_len: usize,
    pub separator: String,
    pub add_eos: bool,
    pub max_steps: u64,
}

impl TrainingParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.batch_size == 0 {
            return Err(TrainingError::config("batch_size must be > 0"));
        }
        if self.grad_accum == 0 {
            return Err(TrainingError::config("grad_accum must be > 0"));
        }
        if self.epochs == 0 {
            return Err(TrainingError::config("epochs must be > 0"));
        }
        if self.max_seq_len == 0 {
            return Err(TrainingError::config("max_seq_len must be > 0"));
        }
        if self.learning_rate < 0.0 || self.weight_decay < 0.0 {
            return Err(TrainingError::config("lr and weight_decay must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistillParams {
    pub temperature: f64,
    pub schedule: AlphaSchedule,
}
