//! Read-only access to the training metadata store.
//!
//! The store is a SQLite file owned by the host application. Each lookup opens
//! its own read-only connection and closes it before returning; nothing here
//! ever writes.

use crate::config::{parse_object, RawConfig};
use crate::dataset::{deterministic_split, EvalSample, Split, TrainingSample};
use crate::error::{TrainingError, TrainingResult};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const STORE_FILE_NAME: &str = "training.db";

/// How many ancestors of the run directory are searched for the store.
pub const MAX_ANCESTORS: usize = 6;

/// Model version row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version_id: String,
    pub model_id: String,
    pub run_id: Option<String>,
    pub artifact_path: Option<String>,
    pub parent_version_id: Option<String>,
}

/// Training run row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub student_model_id: Option<String>,
    pub teacher_model_id: Option<String>,
    pub base_version_id: Option<String>,
    pub method: Option<String>,
    pub hyperparams_json: Option<String>,
}

impl RunInfo {
    /// Decoded `hyperparams_json`; unparsable or non-object content is ignored.
    #[must_use]
    pub fn hyperparams(&self) -> Option<RawConfig> {
        self.hyperparams_json.as_deref().and_then(parse_object)
    }
}

/// Where a teacher's weights live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeacherSource {
    /// Provider is `local`; weights may or may not have a known path.
    Local { model_id: String, artifact_path: Option<String> },
    /// Hosted behind an API. No local weights.
    Api { model_id: String },
    /// No model row at all.
    Missing { model_id: String },
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit path first, else the nearest `training.db` at or above `run_dir`.
    #[must_use]
    pub fn locate(explicit: Option<&Path>, run_dir: &Path) -> Option<Self> {
        match explicit {
            Some(path) => Some(Self::new(path)),
            None => infer_store_path(run_dir).map(Self::new),
        }
    }

    fn connect(&self) -> TrainingResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// # Errors
    /// `NotFound` when no version row matches.
    pub fn version_info(&self, version_id: &str) -> TrainingResult<VersionInfo> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT version_id, model_id, run_id, artifact_path, parent_version_id
             FROM model_versions WHERE version_id = ?1",
            params![version_id],
            |row| {
                Ok(VersionInfo {
                    version_id: text_at(row, 0)?.unwrap_or_default(),
                    model_id: text_at(row, 1)?.unwrap_or_default(),
                    run_id: text_at(row, 2)?,
                    artifact_path: non_empty(text_at(row, 3)?),
                    parent_version_id: text_at(row, 4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| TrainingError::NotFound(format!("Model version not found: {version_id}")))
    }

    /// Absent run rows are not an error.
    pub fn run_info(&self, run_id: &str) -> TrainingResult<Option<RunInfo>> {
        let conn = self.connect()?;
        let info = conn
            .query_row(
                "SELECT run_id, student_model_id, teacher_model_id, base_version_id, method, hyperparams_json
                 FROM training_runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunInfo {
                        run_id: text_at(row, 0)?.unwrap_or_default(),
                        student_model_id: text_at(row, 1)?,
                        teacher_model_id: text_at(row, 2)?,
                        base_version_id: text_at(row, 3)?,
                        method: text_at(row, 4)?,
                        hyperparams_json: text_at(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// Base version's artifact path, else the model's default path.
    pub fn model_artifact_path(&self, model_id: &str, base_version_id: Option<&str>) -> TrainingResult<Option<String>> {
        let conn = self.connect()?;
        if let Some(base) = base_version_id.filter(|b| !b.is_empty()) {
            let path = conn
                .query_row(
                    "SELECT artifact_path FROM model_versions WHERE version_id = ?1",
                    params![base],
                    |row| text_at(row, 0),
                )
                .optional()?
                .flatten();
            if let Some(path) = non_empty(path) {
                return Ok(Some(path));
            }
        }
        let path = conn
            .query_row(
                "SELECT default_artifact_path FROM models WHERE model_id = ?1",
                params![model_id],
                |row| text_at(row, 0),
            )
            .optional()?
            .flatten();
        Ok(non_empty(path))
    }

    pub fn teacher_source(&self, teacher_model_id: &str) -> TrainingResult<TeacherSource> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT provider, default_artifact_path FROM models WHERE model_id = ?1",
                params![teacher_model_id],
                |row| Ok((text_at(row, 0)?, text_at(row, 1)?)),
            )
            .optional()?;
        let model_id = teacher_model_id.to_string();
        Ok(match row {
            None => TeacherSource::Missing { model_id },
            Some((Some(provider), artifact_path)) if provider == "local" => {
                TeacherSource::Local { model_id, artifact_path: non_empty(artifact_path) }
            }
            Some(_) => TeacherSource::Api { model_id },
        })
    }

    /// Evaluation items in insertion order. Rows without prompt or expected text are dropped.
    pub fn dataset_items(&self, dataset_id: &str) -> TrainingResult<Vec<EvalSample>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT prompt, expected_output, metadata_json
             FROM dataset_items
             WHERE dataset_id = ?1
             ORDER BY created_at ASC, item_id ASC",
        )?;
        let rows = stmt
            .query_map(params![dataset_id], |row| Ok((text_at(row, 0)?, text_at(row, 1)?, text_at(row, 2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(prompt, expected, metadata)| {
                let prompt = non_empty(prompt)?;
                let expected = non_empty(expected)?;
                Some(EvalSample { prompt, expected, metadata: metadata.as_deref().and_then(parse_object) })
            })
            .collect())
    }

    /// Samples assigned to `run_id`, falling back to every correction when the run has none.
    ///
    /// The fallback marks everything `train`, or applies the seeded split when `seed` is set.
    pub fn training_samples(&self, run_id: &str, seed: Option<i64>) -> TrainingResult<Vec<TrainingSample>> {
        let assigned = self.assigned_samples(run_id)?;
        if !assigned.is_empty() {
            return Ok(assigned);
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT correction_id, prompt, corrected_output
             FROM corrections
             ORDER BY created_at ASC, correction_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((text_at(row, 0)?, text_at(row, 1)?, text_at(row, 2)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let samples: Vec<TrainingSample> = rows
            .into_iter()
            .filter_map(|(id, prompt, target)| {
                Some(TrainingSample {
                    correction_id: id.unwrap_or_default(),
                    split: Split::Train,
                    weight: 1.0,
                    prompt: non_empty(prompt)?,
                    target: non_empty(target)?,
                    metadata: None,
                })
            })
            .collect();
        debug!(run_id, count = samples.len(), "no run assignments; using all corrections");

        Ok(match seed {
            Some(seed) => deterministic_split(samples, seed),
            None => samples,
        })
    }

    fn assigned_samples(&self, run_id: &str) -> TrainingResult<Vec<TrainingSample>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT rc.correction_id, rc.split, rc.weight, c.prompt, c.corrected_output
             FROM run_corrections rc
             JOIN corrections c ON c.correction_id = rc.correction_id
             WHERE rc.run_id = ?1
             ORDER BY rc.split ASC, rc.correction_id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    text_at(row, 0)?,
                    text_at(row, 1)?,
                    row.get::<_, Option<f64>>(2)?,
                    text_at(row, 3)?,
                    text_at(row, 4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut samples = Vec::with_capacity(rows.len());
        for (id, split, weight, prompt, target) in rows {
            let id = id.unwrap_or_default();
            let Some(split) = split.as_deref().and_then(Split::parse) else {
                debug!(correction_id = %id, "skipping row with unknown split");
                continue;
            };
            let weight = weight.unwrap_or(1.0);
            if !weight.is_finite() || weight < 0.0 {
                debug!(correction_id = %id, weight, "skipping row with invalid weight");
                continue;
            }
            let (Some(prompt), Some(target)) = (non_empty(prompt), non_empty(target)) else {
                continue;
            };
            samples.push(TrainingSample { correction_id: id, split, weight, prompt, target, metadata: None });
        }
        Ok(samples)
    }
}

/// Nearest `training.db` in `run_dir` or up to [`MAX_ANCESTORS`] of its parents.
#[must_use]
pub fn infer_store_path(run_dir: &Path) -> Option<PathBuf> {
    run_dir
        .ancestors()
        .take(MAX_ANCESTORS + 1)
        .map(|dir| dir.join(STORE_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Column as text regardless of the stored affinity.
fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
