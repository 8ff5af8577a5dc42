//! Evaluation jobs against checkpoints produced by the builtin runtime.

mod common;

use common::{create_store, quiet_env, raw, read_json, read_jsonl, register_version, QA_PAIRS};
use distill_training::{run_eval_job, run_train_job, MemorySink, EXIT_CANCELLED, EXIT_FAILED, EXIT_OK};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Train a toy model on the fixture pairs and return its exported directory.
fn train_checkpoint(root: &Path) -> PathBuf {
    let run_dir = root.join("runs").join("toy");
    let samples: Vec<Value> = QA_PAIRS.iter().map(|(p, t)| json!({"prompt": p, "target": t})).collect();
    let config = raw(json!({
        "run_id": "toy",
        "run_dir": run_dir.display().to_string(),
        "dataset_source": "inline",
        "samples": samples,
        "toy_model": true,
        "steps": 8,
        "hyperparams": {"epochs": 2},
    }));
    assert_eq!(run_train_job(&config, None, &mut quiet_env(), &MemorySink::new()), EXIT_OK);
    run_dir.join("artifacts").join("merged_model")
}

fn eval_config(db: &Path, run_dir: &Path, extra: Value) -> serde_json::Map<String, Value> {
    let mut config = raw(json!({
        "evalId": "e1",
        "versionId": "v-1",
        "datasetId": "ds-1",
        "runDir": run_dir.display().to_string(),
        "trainingDbPath": db.display().to_string(),
        "maxNewTokens": 4,
        "seed": 1,
    }));
    if let Value::Object(extra) = extra {
        config.extend(extra);
    }
    config
}

#[test]
fn test_eval_scores_toy_checkpoint() {
    let temp = TempDir::new().unwrap();
    let db = create_store(temp.path());
    register_version(&db, &train_checkpoint(temp.path()));
    let eval_dir = temp.path().join("evals").join("e1");
    let sink = MemorySink::new();

    let code = run_eval_job(&eval_config(&db, &eval_dir, json!({})), None, &mut quiet_env(), &sink);
    assert_eq!(code, EXIT_OK);

    let predictions = read_jsonl(&eval_dir.join("predictions.jsonl"));
    assert_eq!(predictions.len(), QA_PAIRS.len());
    assert_eq!(predictions[0]["prompt"], QA_PAIRS[0].0);
    assert_eq!(predictions[0]["expected"], QA_PAIRS[0].1);
    assert!(predictions[0]["predicted"].is_string());

    let metrics = read_json(&eval_dir.join("metrics.json"));
    for name in ["exact_match", "fuzzy_match", "bleu", "f1"] {
        let value = metrics[name].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&value), "{name} out of range: {value}");
    }
    assert!(metrics.get("teacher_agreement").is_none());
    assert!(metrics.get("citation_coverage").is_none());

    let progress = sink.payloads("progress");
    assert_eq!(progress.len(), QA_PAIRS.len());
    assert_eq!(progress.last().unwrap()["processed"], QA_PAIRS.len());
    assert_eq!(sink.payloads("dataset")[0]["total"], QA_PAIRS.len());
    assert_eq!(sink.payloads("metric").len(), 4);

    let kinds: Vec<Value> = sink.payloads("artifact").iter().map(|a| a["kind"].clone()).collect();
    assert_eq!(kinds, vec![json!("predictions"), json!("metrics")]);
}

#[test]
fn test_eval_max_samples_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let db = create_store(temp.path());
    register_version(&db, &train_checkpoint(temp.path()));

    let prompts = |name: &str| -> Vec<Value> {
        let dir = temp.path().join("evals").join(name);
        let config = eval_config(&db, &dir, json!({"maxSamples": 2}));
        assert_eq!(run_eval_job(&config, None, &mut quiet_env(), &MemorySink::new()), EXIT_OK);
        read_jsonl(&dir.join("predictions.jsonl")).iter().map(|p| p["prompt"].clone()).collect()
    };

    let first = prompts("a");
    assert_eq!(first.len(), 2);
    assert_eq!(first, prompts("b"));
}

#[test]
fn test_eval_cancelled_writes_result() {
    let temp = TempDir::new().unwrap();
    let db = create_store(temp.path());
    register_version(&db, &train_checkpoint(temp.path()));
    let eval_dir = temp.path().join("evals").join("e1");
    std::fs::create_dir_all(&eval_dir).unwrap();
    std::fs::write(eval_dir.join("cancel.flag"), "").unwrap();
    let sink = MemorySink::new();

    let code = run_eval_job(&eval_config(&db, &eval_dir, json!({})), None, &mut quiet_env(), &sink);
    assert_eq!(code, EXIT_CANCELLED);
    assert_eq!(read_json(&eval_dir.join("result.json")), json!({"eval_id": "e1", "status": "cancelled"}));
    assert!(!eval_dir.join("predictions.jsonl").exists());
}

#[test]
fn test_eval_hub_model_needs_tensor_runtime() {
    let temp = TempDir::new().unwrap();
    let db = create_store(temp.path());
    register_version(&db, Path::new("org/hub-model"));
    let eval_dir = temp.path().join("evals").join("e1");
    let sink = MemorySink::new();

    let code = run_eval_job(&eval_config(&db, &eval_dir, json!({})), None, &mut quiet_env(), &sink);
    assert_eq!(code, EXIT_FAILED);
    let error = sink.payloads("status").into_iter().find(|s| s["level"] == "error").unwrap();
    assert!(error["message"].as_str().unwrap().contains("requires a tensor runtime"));
    assert_eq!(error["eval_id"], "e1");
}

#[test]
fn test_eval_requires_identifiers() {
    let temp = TempDir::new().unwrap();
    let config = raw(json!({"eval_id": "e1", "run_dir": temp.path().display().to_string()}));
    let sink = MemorySink::new();

    assert_eq!(run_eval_job(&config, None, &mut quiet_env(), &sink), EXIT_FAILED);
    let message = sink.payloads("status")[0]["message"].as_str().unwrap().to_string();
    assert!(message.contains("eval_id, version_id, dataset_id, run_dir are required"));
}
