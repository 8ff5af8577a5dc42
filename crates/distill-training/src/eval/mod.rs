//! The evaluation job: generate answers for a stored dataset with a trained
//! model version and score them.

pub mod metrics;

use crate::config::{EvalDescriptor, RawConfig};
use crate::dataset::EvalSample;
use crate::error::{TrainingError, TrainingResult};
use crate::events::{
    ArtifactKind, ArtifactPayload, DatasetPayload, EvalProgress, Event, EventSink, MetricMap, MetricPayload,
    ProgressPayload, StatusPayload,
};
use crate::layout::RunLayout;
use crate::model::{has_adapter_markers, ModelArtifact, ModelSpec};
use crate::persist::{write_json_atomic, write_jsonl_atomic};
use crate::runner::JobEnv;
use crate::runtime::{generate, GenerationConfig, LoadContext, LoadedModel, ModelRole};
use crate::store::{MetadataStore, TeacherSource, VersionInfo};
use metrics::{MetricAccumulator, SampleScores};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

/// Context window used when a runtime needs one to build the model.
const EVAL_MAX_SEQ_LEN: usize = 512;

#[derive(Debug, Serialize)]
struct PredictionRow<'a> {
    prompt: &'a str,
    expected: &'a str,
    predicted: String,
    exact_match: f64,
    fuzzy_match: f64,
    bleu: f64,
    f1: f64,
    citation_coverage: Option<f64>,
    faithfulness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    teacher_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    teacher_agreement: Option<f64>,
}

/// Run an evaluation job and return its aggregate metrics.
pub fn run_evaluation(
    job: &EvalDescriptor,
    raw: &RawConfig,
    layout: &RunLayout,
    env: &mut JobEnv,
    sink: &dyn EventSink,
) -> TrainingResult<MetricMap> {
    layout.ensure_root()?;
    write_json_atomic(&layout.config_path(), raw)?;
    sink.emit(Event::Status(
        StatusPayload::info("evaluator started").eval_id(&job.eval_id).run_dir(layout.root().display().to_string()),
    ));
    sink.emit(env.env_event());

    let store = MetadataStore::locate(job.training_db_path.as_deref(), layout.root())
        .ok_or_else(|| TrainingError::config("training_db_path not provided and could not infer"))?;
    let items = store.dataset_items(&job.dataset_id)?;
    sink.emit(Event::Dataset(DatasetPayload::Eval {
        eval_id: job.eval_id.clone(),
        dataset_id: job.dataset_id.clone(),
        total: items.len(),
    }));

    let version = store.version_info(&job.version_id)?;
    let artifact = resolve_version_artifact(&store, &version)?;
    if !env.runtime.supports(&artifact) {
        return Err(TrainingError::DependencyMissing(format!(
            "evaluation of {} requires a tensor runtime",
            artifact.name_or_path()
        )));
    }

    let corpus: Vec<&str> = items.iter().flat_map(|s| [s.prompt.as_str(), s.expected.as_str()]).collect();
    let seed = job.seed.map_or(0, |s| s as u64);
    let ctx = LoadContext { role: ModelRole::Student, corpus: &corpus, max_seq_len: EVAL_MAX_SEQ_LEN, seed };
    let student = env.runtime.load(&artifact, &ctx)?;
    tracing::info!(eval_id = %job.eval_id, model = %artifact.name_or_path(), "model loaded");

    let teacher = if job.compute_teacher_agreement {
        load_agreement_teacher(job, &store, &version, env, &ctx, sink)?
    } else {
        None
    };

    let samples = select_samples(items, job.max_samples, seed);
    if samples.is_empty() {
        return Err(TrainingError::Dataset("No evaluation samples found".to_string()));
    }

    let generation =
        GenerationConfig { max_new_tokens: job.max_new_tokens(), temperature: job.temperature(), top_p: job.top_p() };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let cancel = layout.cancel_marker();
    let mut acc = MetricAccumulator::default();
    let mut rows = Vec::with_capacity(samples.len());

    for sample in &samples {
        cancel.check()?;
        let predicted =
            generate(student.model.as_ref(), student.tokenizer.as_ref(), &sample.prompt, &generation, &mut rng)?;
        let teacher_output = match &teacher {
            Some(t) => Some(generate(t.model.as_ref(), t.tokenizer.as_ref(), &sample.prompt, &generation, &mut rng)?),
            None => None,
        };
        let scores =
            SampleScores::score(&predicted, &sample.expected, sample.metadata.as_ref(), teacher_output.as_deref());
        acc.add(&scores);

        let (exact_match, fuzzy_match, bleu, f1) = acc.headline();
        sink.emit(Event::Progress(ProgressPayload::Eval(EvalProgress {
            eval_id: job.eval_id.clone(),
            processed: acc.processed(),
            total: samples.len(),
            exact_match,
            fuzzy_match,
            bleu,
            f1,
        })));

        rows.push(PredictionRow {
            prompt: &sample.prompt,
            expected: &sample.expected,
            predicted,
            exact_match: scores.exact_match,
            fuzzy_match: scores.fuzzy_match,
            bleu: scores.bleu,
            f1: scores.f1,
            citation_coverage: scores.citation_coverage,
            faithfulness: scores.faithfulness,
            teacher_output,
            teacher_agreement: scores.teacher_agreement,
        });
    }

    let metrics = acc.finish();
    write_jsonl_atomic(&layout.predictions_path(), &rows)?;
    write_json_atomic(&layout.metrics_path(), &metrics)?;
    for (kind, path) in [
        (ArtifactKind::Predictions, layout.predictions_path()),
        (ArtifactKind::Metrics, layout.metrics_path()),
    ] {
        sink.emit(Event::Artifact(ArtifactPayload {
            kind,
            path: path.display().to_string(),
            run_id: None,
            eval_id: Some(job.eval_id.clone()),
        }));
    }
    for (name, value) in &metrics {
        sink.emit(Event::Metric(MetricPayload {
            name: name.clone(),
            value: *value,
            run_id: None,
            eval_id: Some(job.eval_id.clone()),
        }));
    }

    sink.emit(Event::Status(StatusPayload::info("evaluator completed").eval_id(&job.eval_id)));
    tracing::info!(eval_id = %job.eval_id, samples = samples.len(), "evaluator completed");
    Ok(metrics)
}

/// The version's weights. Adapter versions are layered on the owning run's
/// student model.
fn resolve_version_artifact(store: &MetadataStore, version: &VersionInfo) -> TrainingResult<ModelArtifact> {
    let path = match &version.artifact_path {
        Some(path) => Some(path.clone()),
        None => store.model_artifact_path(&version.model_id, None)?,
    }
    .ok_or_else(|| TrainingError::NotFound(format!("Model version has no artifact path: {}", version.version_id)))?;

    let spec = ModelSpec::local(path);
    let base = if !spec.is_gguf() && has_adapter_markers(std::path::Path::new(&spec.name_or_path)) {
        adapter_base_path(store, version)?
    } else {
        None
    };
    ModelArtifact::resolve(&spec, base.map(ModelSpec::local).as_ref())
}

fn adapter_base_path(store: &MetadataStore, version: &VersionInfo) -> TrainingResult<Option<String>> {
    let Some(run_id) = &version.run_id else {
        return Ok(None);
    };
    let Some(run) = store.run_info(run_id)? else {
        return Ok(None);
    };
    match &run.student_model_id {
        Some(student) => store.model_artifact_path(student, run.base_version_id.as_deref()),
        None => Ok(None),
    }
}

fn load_agreement_teacher(
    job: &EvalDescriptor,
    store: &MetadataStore,
    version: &VersionInfo,
    env: &JobEnv,
    ctx: &LoadContext<'_>,
    sink: &dyn EventSink,
) -> TrainingResult<Option<LoadedModel>> {
    let teacher_id = match &version.run_id {
        Some(run_id) => store.run_info(run_id)?.and_then(|run| run.teacher_model_id),
        None => None,
    };
    let Some(teacher_id) = teacher_id else {
        return Ok(None);
    };
    let warn = |message: &str, id: &str| {
        sink.emit(Event::Status(StatusPayload::warn(message).eval_id(&job.eval_id).teacher_model_id(id)));
    };

    match store.teacher_source(&teacher_id)? {
        TeacherSource::Local { model_id, artifact_path: Some(path) } => {
            let artifact = ModelArtifact::resolve(&ModelSpec::local(path), None)?;
            if !env.runtime.supports(&artifact) {
                warn("teacher requires a tensor runtime; teacher agreement disabled", &model_id);
                return Ok(None);
            }
            let teacher_ctx = LoadContext { role: ModelRole::Teacher, ..*ctx };
            Ok(Some(env.runtime.load(&artifact, &teacher_ctx)?))
        }
        TeacherSource::Api { model_id } => {
            warn("teacher is api-backed; teacher agreement disabled", &model_id);
            Ok(None)
        }
        TeacherSource::Local { model_id, artifact_path: None } | TeacherSource::Missing { model_id } => {
            warn("teacher model could not be resolved; teacher agreement disabled", &model_id);
            Ok(None)
        }
    }
}

/// Seeded shuffle then truncate, only when the dataset exceeds `max_samples`.
fn select_samples(mut items: Vec<EvalSample>, max_samples: Option<u64>, seed: u64) -> Vec<EvalSample> {
    if let Some(limit) = max_samples.map(|n| n as usize) {
        if items.len() > limit {
            items.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
            items.truncate(limit);
        }
    }
    items
}
