//! Training datasets: jsonl, inline, and store-backed sources plus the seeded split.

use crate::config::{as_float, as_text, as_verbatim_text, get_any, RawConfig, TrainDescriptor};
use crate::error::{TrainingError, TrainingResult};
use crate::store::MetadataStore;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Named dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Self::Train),
            "val" => Some(Self::Val),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetSourceKind {
    None,
    Jsonl,
    Inline,
    Db,
}

impl DatasetSourceKind {
    pub fn parse(value: &str) -> TrainingResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "jsonl" => Ok(Self::Jsonl),
            "inline" => Ok(Self::Inline),
            "db" => Ok(Self::Db),
            other => Err(TrainingError::config(format!("Unsupported dataset_source: {other}"))),
        }
    }
}

/// A single supervised example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub correction_id: String,
    pub split: Split,
    pub weight: f64,
    pub prompt: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A single evaluation item.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSample {
    pub prompt: String,
    pub expected: String,
    pub metadata: Option<RawConfig>,
}

/// Where a dataset came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetMeta {
    pub source: DatasetSourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DatasetMeta {
    #[must_use]
    pub const fn new(source: DatasetSourceKind) -> Self {
        Self { source, path: None, count: None, error: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitCounts {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitCounts {
    #[must_use]
    pub fn from_samples(samples: &[TrainingSample]) -> Self {
        let mut counts = Self::default();
        for s in samples {
            match s.split {
                Split::Train => counts.train += 1,
                Split::Val => counts.val += 1,
                Split::Test => counts.test += 1,
            }
        }
        counts
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.train + self.val + self.test
    }
}

/// Split-stamped samples plus their provenance.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub samples: Vec<TrainingSample>,
    pub meta: DatasetMeta,
}

impl Dataset {
    #[must_use]
    pub fn counts(&self) -> SplitCounts {
        SplitCounts::from_samples(&self.samples)
    }

    #[must_use]
    pub fn split(&self, split: Split) -> Vec<TrainingSample> {
        self.samples.iter().filter(|s| s.split == split).cloned().collect()
    }
}

/// Build the dataset for a training job.
///
/// `store` is only consulted for the `db` source.
pub fn build_dataset(job: &TrainDescriptor, store: Option<&MetadataStore>) -> TrainingResult<Dataset> {
    match job.dataset_source {
        DatasetSourceKind::None => Ok(Dataset { samples: Vec::new(), meta: DatasetMeta::new(DatasetSourceKind::None) }),
        DatasetSourceKind::Jsonl => {
            let path = job
                .dataset_path
                .as_deref()
                .ok_or_else(|| TrainingError::config("dataset_source=jsonl requires dataset_path"))?;
            let samples = read_jsonl_samples(path)?;
            let mut meta = DatasetMeta::new(DatasetSourceKind::Jsonl);
            meta.path = Some(path.display().to_string());
            Ok(Dataset { samples, meta })
        }
        DatasetSourceKind::Inline => {
            let items = job
                .samples
                .as_ref()
                .or_else(|| job.hyperparams.as_ref().and_then(|hp| get_any(hp, &["samples"])));
            let samples = match items {
                None => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| {
                        parse_record(item)
                            .map_err(|reason| TrainingError::Dataset(format!("invalid inline sample {idx}: {reason}")))
                    })
                    .collect::<TrainingResult<Vec<_>>>()?,
                Some(_) => return Err(TrainingError::Dataset("samples must be a list".to_string())),
            };
            let mut meta = DatasetMeta::new(DatasetSourceKind::Inline);
            meta.count = Some(samples.len());
            Ok(Dataset { samples, meta })
        }
        DatasetSourceKind::Db => {
            let mut meta = DatasetMeta::new(DatasetSourceKind::Db);
            let Some(store) = store else {
                meta.error = Some("training_db_path not provided and could not infer".to_string());
                return Ok(Dataset { samples: Vec::new(), meta });
            };
            let samples = store.training_samples(&job.run_id, job.seed)?;
            meta.path = Some(store.path().display().to_string());
            meta.count = Some(samples.len());
            Ok(Dataset { samples, meta })
        }
    }
}

/// Read a user-supplied JSONL dataset. Any malformed record is fatal.
pub fn read_jsonl_samples(path: &Path) -> TrainingResult<Vec<TrainingSample>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TrainingError::Dataset(format!("failed to read dataset {}: {}", path.display(), e)))?;

    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e)))?;
        let sample = parse_record(&value)
            .map_err(|reason| TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, reason)))?;
        out.push(sample);
    }
    Ok(out)
}

/// One user-supplied record. The error is a bare reason; callers add location.
fn parse_record(value: &Value) -> Result<TrainingSample, String> {
    let obj = value.as_object().ok_or("record must be a JSON object")?;

    let prompt = get_any(obj, &["prompt"]).and_then(as_verbatim_text).ok_or("missing prompt")?;
    let target = ["target", "expected_output", "output"]
        .iter()
        .find_map(|k| get_any(obj, &[*k]).and_then(as_verbatim_text))
        .ok_or("missing target/expected_output/output")?;

    let split = match get_any(obj, &["split"]).and_then(as_text) {
        None => Split::Train,
        Some(s) => Split::parse(&s).ok_or_else(|| format!("unknown split: {s}"))?,
    };

    let weight = match get_any(obj, &["weight"]) {
        None => 1.0,
        Some(v) => as_float("weight", v).map_err(|e| e.to_string())?,
    };
    if weight < 0.0 {
        return Err(format!("weight must be >= 0 (got {weight})"));
    }

    Ok(TrainingSample {
        correction_id: get_any(obj, &["correction_id", "id"]).and_then(as_text).unwrap_or_default(),
        split,
        weight,
        prompt,
        target,
        metadata: get_any(obj, &["metadata"]).filter(|m| m.is_object()).cloned(),
    })
}

/// Seeded shuffle followed by a fixed 90/5/5 assignment.
///
/// `train = floor(0.9n)`, `val = floor(0.05n)`, the remainder is `test`.
#[must_use]
pub fn deterministic_split(items: Vec<TrainingSample>, seed: i64) -> Vec<TrainingSample> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
    let mut shuffled = items;
    shuffled.shuffle(&mut rng);

    let n = shuffled.len();
    let n_train = n * 9 / 10;
    let n_val = n / 20;
    for (idx, sample) in shuffled.iter_mut().enumerate() {
        sample.split = if idx < n_train {
            Split::Train
        } else if idx < n_train + n_val {
            Split::Val
        } else {
            Split::Test
        };
    }
    shuffled
}
