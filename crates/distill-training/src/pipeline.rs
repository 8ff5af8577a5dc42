//! The training job, end to end.
//!
//! Flow: snapshot config, describe the environment, build and persist the
//! dataset, load cached teacher outputs, then dispatch once on runtime
//! capability to either the real optimization loop or the stub pipeline.

use crate::config::{RawConfig, TrainDescriptor};
use crate::dataset::{build_dataset, Dataset, DatasetMeta, DatasetSourceKind, Split, SplitCounts};
use crate::encode::{Collator, EncodedSample, Encoder};
use crate::error::TrainingResult;
use crate::events::{
    ArtifactKind, ArtifactPayload, DatasetPayload, Event, EventSink, ModelPayload, StatusPayload, StudentInfo,
};
use crate::export::{export_model, ExportIntent};
use crate::hyperparams::HyperParams;
use crate::layout::{CancelMarker, RunLayout};
use crate::mode::{check_vocab, LossPolicy, TeacherState, TrainingMode};
use crate::model::lora::LoraConfig;
use crate::model::{has_adapter_markers, ModelArtifact, ModelSpec};
use crate::persist::{write_json_atomic, write_jsonl_atomic};
use crate::runner::JobEnv;
use crate::runtime::{LoadContext, LoadedModel, ModelRole};
use crate::soft_labels::SoftLabelCache;
use crate::store::{MetadataStore, RunInfo, TeacherSource};
use crate::trainer::{run_stub, LoopConfig, TrainLoop};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

const STUDENT_KEYS: &[&str] = &["student_model", "studentModel"];
const TEACHER_KEYS: &[&str] = &["teacher_model", "teacherModel"];

/// Everything resolved before the dispatch point.
struct Prepared<'a> {
    job: &'a TrainDescriptor,
    layout: &'a RunLayout,
    cancel: CancelMarker,
    store: Option<MetadataStore>,
    run_info: Option<RunInfo>,
    hyperparams: HyperParams,
    dataset: Dataset,
    soft_labels: SoftLabelCache,
}

#[derive(Debug, Serialize)]
struct DatasetSummary<'a> {
    run_id: &'a str,
    dataset: &'a DatasetMeta,
    counts: SplitCounts,
    total: usize,
}

#[derive(Debug, Serialize)]
struct NamedModel {
    name_or_path: String,
}

#[derive(Debug, Serialize)]
struct CompletedResult<'a> {
    run_id: &'a str,
    status: &'static str,
    mode: TrainingMode,
    steps: u64,
    optimizer_steps: u64,
    train_loss: f64,
    train_ce_loss: f64,
    train_kd_loss: f64,
    val_loss: Option<f64>,
    student: NamedModel,
    dataset: &'a DatasetMeta,
}

#[derive(Debug, Serialize)]
struct StubResult<'a> {
    run_id: &'a str,
    status: &'static str,
    mode: TrainingMode,
    steps: u64,
    final_loss: f64,
    stub: bool,
}

/// Run a training job. Cancellation surfaces as `Err(Cancelled)`.
pub fn run_training(
    job: &TrainDescriptor,
    raw: &RawConfig,
    layout: &RunLayout,
    env: &mut JobEnv,
    sink: &dyn EventSink,
) -> TrainingResult<()> {
    layout.ensure_root()?;
    write_json_atomic(&layout.config_path(), raw)?;
    sink.emit(Event::Status(
        StatusPayload::info("trainer started").run_id(&job.run_id).run_dir(layout.root().display().to_string()),
    ));
    sink.emit(env.env_event());
    tracing::info!(run_id = %job.run_id, mode = %job.mode, "trainer started");

    let store = if job.training_db_path.is_some() || job.dataset_source == DatasetSourceKind::Db {
        MetadataStore::locate(job.training_db_path.as_deref(), layout.root())
    } else {
        None
    };
    let run_info = match &store {
        Some(store) => store.run_info(&job.run_id)?,
        None => None,
    };
    let hyperparams = HyperParams::new(
        job.hyperparams
            .clone()
            .or_else(|| run_info.as_ref().and_then(RunInfo::hyperparams))
            .unwrap_or_default(),
    );

    let mut dataset = build_dataset(job, store.as_ref())?;
    persist_dataset(job, layout, &dataset, sink)?;

    let soft_labels = match &job.soft_labels_path {
        Some(path) => SoftLabelCache::load(path, sink),
        None => SoftLabelCache::default(),
    };
    if !soft_labels.is_empty() {
        let replaced = soft_labels.substitute_targets(&mut dataset.samples);
        tracing::debug!(replaced, "substituted cached teacher outputs");
        sink.emit(Event::Status(
            StatusPayload::info(format!("Substituted cached teacher outputs for {replaced} samples")).run_id(&job.run_id),
        ));
    }

    let prepared = Prepared {
        job,
        layout,
        cancel: layout.cancel_marker(),
        store,
        run_info,
        hyperparams,
        dataset,
        soft_labels,
    };
    prepared.cancel.check()?;

    // Single capability dispatch.
    match resolve_student(&prepared)? {
        Some(artifact) if env.runtime.supports(&artifact) => run_full(&prepared, &artifact, env, sink)?,
        Some(artifact) => {
            sink.emit(Event::Status(
                StatusPayload::warn(format!(
                    "tensor runtime unavailable for {}; running stub pipeline",
                    artifact.name_or_path()
                ))
                .run_id(&job.run_id),
            ));
            run_stub_pipeline(&prepared, env, sink)?;
        }
        None => {
            sink.emit(Event::Status(
                StatusPayload::info("no student model resolved; running stub pipeline").run_id(&job.run_id),
            ));
            run_stub_pipeline(&prepared, env, sink)?;
        }
    }

    sink.emit(Event::Status(StatusPayload::info("trainer completed").run_id(&job.run_id)));
    tracing::info!(run_id = %job.run_id, "trainer completed");
    Ok(())
}

fn persist_dataset(
    job: &TrainDescriptor,
    layout: &RunLayout,
    dataset: &Dataset,
    sink: &dyn EventSink,
) -> TrainingResult<()> {
    let counts = dataset.counts();
    write_jsonl_atomic(&layout.dataset_jsonl_path(), &dataset.samples)?;
    write_json_atomic(
        &layout.dataset_summary_path(),
        &DatasetSummary { run_id: &job.run_id, dataset: &dataset.meta, counts, total: counts.total() },
    )?;
    if let Some(error) = &dataset.meta.error {
        sink.emit(Event::Status(StatusPayload::warn(error.clone()).run_id(&job.run_id)));
    }
    sink.emit(Event::Dataset(DatasetPayload::Train {
        run_id: job.run_id.clone(),
        meta: dataset.meta.clone(),
        counts,
        total: counts.total(),
        path: layout.dataset_jsonl_path().display().to_string(),
    }));
    Ok(())
}

/// Student priority: `toy_model`, job descriptor, hyperparameters, then the
/// store's run → student → artifact chain.
fn resolve_student(p: &Prepared<'_>) -> TrainingResult<Option<ModelArtifact>> {
    let spec = if p.job.toy_model {
        Some(ModelSpec::toy())
    } else {
        match spec_from(p.job.student_model.as_ref(), &p.hyperparams, STUDENT_KEYS)? {
            Some(spec) => Some(spec),
            None => store_student_path(p)?.map(ModelSpec::local),
        }
    };
    let Some(spec) = spec else {
        return Ok(None);
    };

    let base = if has_adapter_markers(Path::new(&spec.name_or_path)) { store_base_path(p)? } else { None };
    ModelArtifact::resolve(&spec, base.map(ModelSpec::local).as_ref()).map(Some)
}

fn spec_from(explicit: Option<&Value>, hp: &HyperParams, keys: &[&str]) -> TrainingResult<Option<ModelSpec>> {
    if let Some(spec) = explicit.map(ModelSpec::parse).transpose()?.flatten() {
        return Ok(Some(spec));
    }
    hp.top(keys).map(ModelSpec::parse).transpose().map(Option::flatten)
}

fn store_student_path(p: &Prepared<'_>) -> TrainingResult<Option<String>> {
    let (Some(store), Some(run)) = (&p.store, &p.run_info) else {
        return Ok(None);
    };
    match &run.student_model_id {
        Some(student) => store.model_artifact_path(student, run.base_version_id.as_deref()),
        None => Ok(None),
    }
}

/// The student model's default weights, used as the base under an adapter.
fn store_base_path(p: &Prepared<'_>) -> TrainingResult<Option<String>> {
    let (Some(store), Some(run)) = (&p.store, &p.run_info) else {
        return Ok(None);
    };
    match &run.student_model_id {
        Some(student) => store.model_artifact_path(student, None),
        None => Ok(None),
    }
}

fn corpus(dataset: &Dataset) -> Vec<&str> {
    dataset.samples.iter().flat_map(|s| [s.prompt.as_str(), s.target.as_str()]).collect()
}

fn run_full(
    p: &Prepared<'_>,
    artifact: &ModelArtifact,
    env: &mut JobEnv,
    sink: &dyn EventSink,
) -> TrainingResult<()> {
    let job = p.job;
    let training = p.hyperparams.training(job.steps())?;
    let distill = p.hyperparams.distillation()?;
    let texts = corpus(&p.dataset);
    let seed = job.seed.map_or(0, |s| s as u64);

    let ctx = LoadContext { role: ModelRole::Student, corpus: &texts, max_seq_len: training.max_seq_len, seed };
    let LoadedModel { model: mut student, tokenizer } = env.runtime.load(artifact, &ctx)?;

    let lora = if artifact.is_toy() {
        false
    } else {
        match LoraConfig::from_hyperparams(&p.hyperparams)?.plan(&student.module_names()) {
            Some(plan) => student.attach_lora(&plan),
            None => false,
        }
    };
    sink.emit(Event::Model(ModelPayload {
        run_id: job.run_id.clone(),
        student: StudentInfo { name_or_path: artifact.name_or_path(), lora },
        params: student.param_counts(),
        device: student.device(),
    }));

    let (teacher, teacher_state) = if job.mode.uses_teacher() {
        resolve_teacher(p, env, &texts, training.max_seq_len, seed, student.vocab_size(), sink)?
    } else {
        (None, TeacherState::NotRequested)
    };
    if job.mode == TrainingMode::KnowledgeDistillation && teacher.is_none() {
        sink.emit(Event::Status(
            StatusPayload::warn("knowledge_distillation requested but teacher is unavailable; falling back to supervised loss")
                .run_id(&job.run_id),
        ));
    }
    let policy = LossPolicy::new(job.mode, &teacher_state);

    let encoder = Encoder::new(tokenizer.as_ref(), &training.separator, training.max_seq_len, training.add_eos);
    let encode = |split: Split| -> Vec<EncodedSample> {
        p.dataset.samples.iter().filter(|s| s.split == split).map(|s| encoder.encode(s)).collect()
    };
    let (train, val) = (encode(Split::Train), encode(Split::Val));

    let loop_config = LoopConfig {
        run_id: job.run_id.clone(),
        mode: job.mode,
        training,
        distill,
        policy,
        seed: job.seed,
        emit_every: job.emit_every(),
    };
    let outcome = TrainLoop::new(&loop_config, sink, &p.cancel, env.probe.as_mut()).run(
        student.as_mut(),
        teacher.as_ref().map(|t| t.model.as_ref()),
        Collator::new(tokenizer.pad_id()),
        &train,
        &val,
    )?;

    p.cancel.check()?;
    let intent = ExportIntent::resolve(&p.hyperparams, job.export_format.as_deref());
    export_model(&intent, student.as_ref(), tokenizer.as_ref(), p.layout, &job.run_id, sink)?;

    write_result(
        p,
        &CompletedResult {
            run_id: &job.run_id,
            status: "completed",
            mode: job.mode,
            steps: outcome.steps,
            optimizer_steps: outcome.optimizer_steps,
            train_loss: outcome.train_loss,
            train_ce_loss: outcome.train_ce_loss,
            train_kd_loss: outcome.train_kd_loss,
            val_loss: outcome.val_loss,
            student: NamedModel { name_or_path: artifact.name_or_path() },
            dataset: &p.dataset.meta,
        },
        sink,
    )
}

/// Teacher priority: job descriptor, hyperparameters, then the store. Every
/// way of ending up without a teacher is a warning, never an error.
fn resolve_teacher(
    p: &Prepared<'_>,
    env: &JobEnv,
    texts: &[&str],
    max_seq_len: usize,
    seed: u64,
    student_vocab: usize,
    sink: &dyn EventSink,
) -> TrainingResult<(Option<LoadedModel>, TeacherState)> {
    let run_id = &p.job.run_id;
    let warn = |status: StatusPayload| sink.emit(Event::Status(status.run_id(run_id)));

    if !p.soft_labels.is_empty() {
        sink.emit(Event::Status(
            StatusPayload::info("Using cached soft labels - skipping teacher model loading (offline mode)")
                .run_id(run_id),
        ));
        return Ok((None, TeacherState::Unavailable));
    }

    let spec = match spec_from(p.job.teacher_model.as_ref(), &p.hyperparams, TEACHER_KEYS)? {
        Some(spec) => Some(spec),
        None => match store_teacher(p)? {
            Some(TeacherSource::Local { artifact_path: Some(path), .. }) => Some(ModelSpec::local(path)),
            Some(TeacherSource::Local { model_id, artifact_path: None } | TeacherSource::Missing { model_id }) => {
                warn(
                    StatusPayload::warn("teacher model could not be resolved; proceeding without distillation")
                        .teacher_model_id(model_id),
                );
                None
            }
            Some(TeacherSource::Api { model_id }) => {
                warn(
                    StatusPayload::warn("teacher is api-backed; API teacher is disabled by default in offline runner")
                        .teacher_model_id(model_id),
                );
                None
            }
            None => None,
        },
    };
    let Some(spec) = spec else {
        return Ok((None, TeacherState::Unavailable));
    };

    if spec.is_gguf() {
        warn(StatusPayload::warn("GGUF teacher models are not supported; skipping teacher"));
        return Ok((None, TeacherState::Unavailable));
    }
    let artifact = ModelArtifact::resolve(&spec, None)?;
    if !env.runtime.supports(&artifact) {
        warn(
            StatusPayload::warn("teacher requires a tensor runtime; proceeding without distillation")
                .teacher_model_id(artifact.name_or_path()),
        );
        return Ok((None, TeacherState::Unavailable));
    }

    let ctx = LoadContext { role: ModelRole::Teacher, corpus: texts, max_seq_len, seed };
    let teacher = env.runtime.load(&artifact, &ctx)?;
    let state = check_vocab(teacher.model.vocab_size(), student_vocab);
    if let TeacherState::VocabMismatch { teacher: t, student: s } = &state {
        tracing::warn!(teacher_vocab = t, student_vocab = s, "vocabulary mismatch");
        warn(StatusPayload::warn("teacher/student vocab mismatch; falling back to supervised loss"));
        return Ok((None, state));
    }
    tracing::info!(run_id = %run_id, teacher = %artifact.name_or_path(), "teacher loaded");
    Ok((Some(teacher), state))
}

fn store_teacher(p: &Prepared<'_>) -> TrainingResult<Option<TeacherSource>> {
    let (Some(store), Some(run)) = (&p.store, &p.run_info) else {
        return Ok(None);
    };
    match &run.teacher_model_id {
        Some(teacher) => store.teacher_source(teacher).map(Some),
        None => Ok(None),
    }
}

fn run_stub_pipeline(p: &Prepared<'_>, env: &JobEnv, sink: &dyn EventSink) -> TrainingResult<()> {
    let job = p.job;
    let outcome = run_stub(
        &job.run_id,
        job.mode,
        job.steps(),
        job.emit_every(),
        env.stub_step_delay,
        sink,
        &p.cancel,
    )?;
    write_result(
        p,
        &StubResult {
            run_id: &job.run_id,
            status: "completed",
            mode: job.mode,
            steps: outcome.steps,
            final_loss: outcome.final_loss,
            stub: true,
        },
        sink,
    )
}

fn write_result<T: Serialize>(p: &Prepared<'_>, result: &T, sink: &dyn EventSink) -> TrainingResult<()> {
    let path = p.layout.result_path();
    write_json_atomic(&path, result)?;
    sink.emit(Event::Artifact(ArtifactPayload {
        kind: ArtifactKind::Result,
        path: path.display().to_string(),
        run_id: Some(p.job.run_id.clone()),
        eval_id: None,
    }));
    Ok(())
}
