//! Job descriptor normalization.
//!
//! Host orchestrators hand us loosely-typed JSON with a mix of snake_case and
//! camelCase keys. Everything is folded into one canonical, immutable
//! descriptor here; nothing downstream looks at the raw map's aliases.

use crate::dataset::DatasetSourceKind;
use crate::error::{TrainingError, TrainingResult};
use crate::mode::TrainingMode;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Untyped job configuration as received from the host.
pub type RawConfig = Map<String, Value>;

pub const DEFAULT_STEPS: u64 = 100;
pub const DEFAULT_EMIT_EVERY: u64 = 1;
pub const DEFAULT_MAX_NEW_TOKENS: u64 = 128;
pub const DEFAULT_TOP_P: f64 = 1.0;

/// `(alias, canonical)` pairs. An alias is folded only when the canonical key is absent.
pub const KEY_ALIASES: &[(&str, &str)] = &[
    ("runId", "run_id"),
    ("runDir", "run_dir"),
    ("evalId", "eval_id"),
    ("versionId", "version_id"),
    ("datasetId", "dataset_id"),
    ("datasetSource", "dataset_source"),
    ("trainingDbPath", "training_db_path"),
    ("datasetPath", "dataset_path"),
    ("softLabelsPath", "soft_labels_path"),
    ("hyperparams_json", "hyperparams"),
    ("emitEvery", "emit_every"),
    ("maxSamples", "max_samples"),
    ("maxNewTokens", "max_new_tokens"),
    ("topP", "top_p"),
    ("computeTeacherAgreement", "compute_teacher_agreement"),
    ("studentModel", "student_model"),
    ("teacherModel", "teacher_model"),
    ("exportFormat", "export_format"),
    ("toyModel", "toy_model"),
];

/// Merge the two input channels. Both must be JSON objects; the file wins on key conflicts.
pub fn merge_sources(file: Option<Value>, secondary: Option<Value>) -> TrainingResult<RawConfig> {
    let mut merged = RawConfig::new();
    for (channel, value) in [("stdin", secondary), ("config file", file)] {
        match value {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => merged.extend(map),
            Some(_) => {
                return Err(TrainingError::config(format!("{channel} config must be a JSON object")));
            }
        }
    }
    if merged.is_empty() {
        return Err(TrainingError::config("No config provided (use --config or --stdin)"));
    }
    Ok(merged)
}

/// Fold recognized aliases into their canonical key.
#[must_use]
pub fn fold_aliases(raw: &RawConfig) -> RawConfig {
    let mut out = raw.clone();
    for (alias, canonical) in KEY_ALIASES {
        if out.contains_key(*canonical) {
            continue;
        }
        if let Some(value) = raw.get(*alias) {
            out.insert((*canonical).to_string(), value.clone());
        }
    }
    out
}

/// Canonical training job.
#[derive(Debug, Clone)]
pub struct TrainDescriptor {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub mode: TrainingMode,
    pub seed: Option<i64>,
    pub steps: Option<u64>,
    pub emit_every: Option<u64>,
    pub dataset_source: DatasetSourceKind,
    pub training_db_path: Option<PathBuf>,
    pub dataset_path: Option<PathBuf>,
    pub soft_labels_path: Option<PathBuf>,
    pub hyperparams: Option<RawConfig>,
    pub student_model: Option<Value>,
    pub teacher_model: Option<Value>,
    pub export_format: Option<String>,
    pub toy_model: bool,
    pub samples: Option<Value>,
}

impl TrainDescriptor {
    pub fn from_raw(raw: &RawConfig, run_dir_override: Option<&Path>) -> TrainingResult<Self> {
        let raw = fold_aliases(raw);

        let run_id = required_text(&raw, "run_id")?;
        let run_dir = match run_dir_override {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from(required_text(&raw, "run_dir")?),
        };

        let mode = match text_field(&raw, "mode") {
            Some(m) => TrainingMode::parse(&m)?,
            None => TrainingMode::FineTune,
        };
        let dataset_source = match text_field(&raw, "dataset_source") {
            Some(s) => DatasetSourceKind::parse(&s)?,
            None => DatasetSourceKind::Db,
        };

        Ok(Self {
            run_id,
            run_dir,
            mode,
            seed: int_field(&raw, "seed")?,
            steps: non_negative_field(&raw, "steps")?,
            emit_every: non_negative_field(&raw, "emit_every")?,
            dataset_source,
            training_db_path: text_field(&raw, "training_db_path").map(PathBuf::from),
            dataset_path: text_field(&raw, "dataset_path").map(PathBuf::from),
            soft_labels_path: text_field(&raw, "soft_labels_path").map(PathBuf::from),
            hyperparams: hyperparams_field(&raw),
            student_model: present(&raw, "student_model").cloned(),
            teacher_model: present(&raw, "teacher_model").cloned(),
            export_format: text_field(&raw, "export_format"),
            toy_model: present(&raw, "toy_model").is_some_and(truthy),
            samples: present(&raw, "samples").cloned(),
        })
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    #[must_use]
    pub fn emit_every(&self) -> u64 {
        self.emit_every.unwrap_or(DEFAULT_EMIT_EVERY).max(1)
    }
}

/// Canonical evaluation job.
#[derive(Debug, Clone)]
pub struct EvalDescriptor {
    pub eval_id: String,
    pub version_id: String,
    pub dataset_id: String,
    pub run_dir: PathBuf,
    pub training_db_path: Option<PathBuf>,
    pub max_samples: Option<u64>,
    pub max_new_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
    pub compute_teacher_agreement: bool,
}

impl EvalDescriptor {
    pub fn from_raw(raw: &RawConfig, run_dir_override: Option<&Path>) -> TrainingResult<Self> {
        let raw = fold_aliases(raw);

        let eval_id = text_field(&raw, "eval_id");
        let version_id = text_field(&raw, "version_id");
        let dataset_id = text_field(&raw, "dataset_id");
        let run_dir = run_dir_override
            .map(Path::to_path_buf)
            .or_else(|| text_field(&raw, "run_dir").map(PathBuf::from));

        let (Some(eval_id), Some(version_id), Some(dataset_id), Some(run_dir)) =
            (eval_id, version_id, dataset_id, run_dir)
        else {
            return Err(TrainingError::config("eval_id, version_id, dataset_id, run_dir are required"));
        };

        Ok(Self {
            eval_id,
            version_id,
            dataset_id,
            run_dir,
            training_db_path: text_field(&raw, "training_db_path").map(PathBuf::from),
            max_samples: non_negative_field(&raw, "max_samples")?,
            max_new_tokens: non_negative_field(&raw, "max_new_tokens")?,
            temperature: float_field(&raw, "temperature")?,
            top_p: float_field(&raw, "top_p")?,
            seed: int_field(&raw, "seed")?,
            compute_teacher_agreement: present(&raw, "compute_teacher_agreement").is_some_and(truthy),
        })
    }

    #[must_use]
    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens.unwrap_or(DEFAULT_MAX_NEW_TOKENS) as usize
    }

    #[must_use]
    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.0)
    }

    #[must_use]
    pub fn top_p(&self) -> f64 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }
}

// ---------------------------------------------------------------------------
// Field readers shared with the hyperparameter and model-spec parsers.
// ---------------------------------------------------------------------------

/// Value for `key`, treating JSON `null` as absent.
pub(crate) fn present<'a>(map: &'a RawConfig, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

/// First non-null value among `keys`.
pub(crate) fn get_any<'a>(map: &'a RawConfig, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| present(map, k))
}

/// Strings (trimmed, non-empty) and numbers read as text.
pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Like [`as_text`] but keeps surrounding whitespace; blank strings are still absent.
pub(crate) fn as_verbatim_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        other => as_text(other),
    }
}

pub(crate) fn text_field(map: &RawConfig, key: &str) -> Option<String> {
    present(map, key).and_then(as_text)
}

fn required_text(map: &RawConfig, key: &str) -> TrainingResult<String> {
    text_field(map, key).ok_or_else(|| TrainingError::config(format!("Missing required field: {key}")))
}

pub(crate) fn as_int(key: &str, value: &Value) -> TrainingResult<i64> {
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| TrainingError::config(format!("{key} must be an integer")))
}

pub(crate) fn as_float(key: &str, value: &Value) -> TrainingResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| TrainingError::config(format!("{key} must be a number")))
}

pub(crate) fn as_non_negative(key: &str, value: &Value) -> TrainingResult<u64> {
    let v = as_int(key, value)?;
    u64::try_from(v).map_err(|_| TrainingError::config(format!("{key} must be a non-negative integer")))
}

fn int_field(map: &RawConfig, key: &str) -> TrainingResult<Option<i64>> {
    present(map, key).map(|v| as_int(key, v)).transpose()
}

fn non_negative_field(map: &RawConfig, key: &str) -> TrainingResult<Option<u64>> {
    present(map, key).map(|v| as_non_negative(key, v)).transpose()
}

fn float_field(map: &RawConfig, key: &str) -> TrainingResult<Option<f64>> {
    present(map, key).map(|v| as_float(key, v)).transpose()
}

/// Loose truthiness for host-supplied flags.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

/// Hyperparameters arrive either as an object or as a JSON-encoded string.
/// An unparsable string is treated as unset.
fn hyperparams_field(map: &RawConfig) -> Option<RawConfig> {
    match present(map, "hyperparams")? {
        Value::Object(obj) => Some(obj.clone()),
        Value::String(s) if !s.trim().is_empty() => parse_object(s),
        _ => None,
    }
}

pub(crate) fn parse_object(text: &str) -> Option<RawConfig> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}
