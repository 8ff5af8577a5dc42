#![allow(dead_code)]

use distill_training::{JobEnv, RawConfig};
use distill_training::telemetry::NullProbe;
use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builtin runtime without host telemetry or stub pacing.
pub fn quiet_env() -> JobEnv {
    JobEnv { probe: Box::new(NullProbe), stub_step_delay: Duration::ZERO, ..JobEnv::default() }
}

pub fn raw(value: Value) -> RawConfig {
    value.as_object().cloned().expect("config must be an object")
}

pub fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

pub fn read_jsonl(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

pub fn messages(statuses: &[Value]) -> Vec<String> {
    statuses.iter().filter_map(|s| s["message"].as_str().map(str::to_string)).collect()
}

pub const QA_PAIRS: &[(&str, &str)] = &[
    ("what colour is the sky", "the sky is blue"),
    ("what colour is grass", "grass is green"),
    ("what colour is snow", "snow is white"),
    ("what colour is coal", "coal is black"),
];

/// Metadata store with one run (`run-1`) whose four corrections are all in
/// `train` and whose teacher is hosted behind an API.
pub fn create_store(dir: &Path) -> PathBuf {
    let path = dir.join("training.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        r"
        CREATE TABLE models (model_id TEXT PRIMARY KEY, display_name TEXT, provider TEXT,
                             model_family TEXT, default_artifact_path TEXT);
        CREATE TABLE model_versions (version_id TEXT PRIMARY KEY, model_id TEXT, run_id TEXT,
                                     parent_version_id TEXT, artifact_path TEXT);
        CREATE TABLE training_runs (run_id TEXT PRIMARY KEY, student_model_id TEXT, base_version_id TEXT,
                                    teacher_model_id TEXT, method TEXT, hyperparams_json TEXT);
        CREATE TABLE corrections (correction_id TEXT PRIMARY KEY, prompt TEXT, corrected_output TEXT,
                                  created_at TEXT);
        CREATE TABLE run_corrections (run_id TEXT, correction_id TEXT, split TEXT, weight REAL);
        CREATE TABLE dataset_items (item_id TEXT, dataset_id TEXT, prompt TEXT, expected_output TEXT,
                                    metadata_json TEXT, created_at TEXT);

        INSERT INTO models VALUES ('teacher-api', 'Hosted', 'openai', 'gpt', NULL);
        INSERT INTO training_runs VALUES ('run-1', NULL, NULL, 'teacher-api', 'kd', NULL);
        ",
    )
    .unwrap();

    for (idx, (prompt, target)) in QA_PAIRS.iter().enumerate() {
        let id = format!("c{idx}");
        conn.execute(
            "INSERT INTO corrections VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, prompt, target, format!("2024-01-0{}", idx + 1)],
        )
        .unwrap();
        conn.execute("INSERT INTO run_corrections VALUES ('run-1', ?1, 'train', 1.0)", rusqlite::params![id])
            .unwrap();
        conn.execute(
            "INSERT INTO dataset_items VALUES (?1, 'ds-1', ?2, ?3, NULL, ?4)",
            rusqlite::params![format!("i{idx}"), prompt, target, format!("2024-01-0{}", idx + 1)],
        )
        .unwrap();
    }
    path
}

/// Register `artifact_path` as version `v-1` of a local model.
pub fn register_version(db: &Path, artifact_path: &Path) {
    let conn = Connection::open(db).unwrap();
    conn.execute(
        "INSERT INTO models VALUES ('student', 'Student', 'local', 'toy', NULL)",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO model_versions VALUES ('v-1', 'student', 'run-1', NULL, ?1)",
        rusqlite::params![artifact_path.display().to_string()],
    )
    .unwrap();
}
