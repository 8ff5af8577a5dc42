//! Top-level job entry points.
//!
//! Every outcome of a job ends here: success, cooperative cancellation, or a
//! failure rendered as a terminal `error` status with its full cause chain.

use crate::config::{EvalDescriptor, RawConfig, TrainDescriptor};
use crate::error::{TrainingError, TrainingResult};
use crate::eval;
use crate::events::{ArtifactKind, ArtifactPayload, EnvPayload, Event, EventSink, StatusPayload};
use crate::layout::RunLayout;
use crate::persist::write_json_atomic;
use crate::pipeline;
use crate::runtime::{BuiltinRuntime, ModelRuntime};
use crate::telemetry::{ResourceProbe, SysinfoProbe};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CANCELLED: i32 = 130;
pub const EXIT_FAILED: i32 = 2;

pub const DEFAULT_STUB_STEP_DELAY: Duration = Duration::from_millis(20);

/// Collaborators a job runs against.
pub struct JobEnv {
    pub runtime: Box<dyn ModelRuntime>,
    pub probe: Box<dyn ResourceProbe>,
    /// Pause between stub steps so hosts see a realistic progress cadence.
    pub stub_step_delay: Duration,
}

impl Default for JobEnv {
    fn default() -> Self {
        Self {
            runtime: Box::new(BuiltinRuntime),
            probe: Box::new(SysinfoProbe::new()),
            stub_step_delay: DEFAULT_STUB_STEP_DELAY,
        }
    }
}

impl JobEnv {
    #[must_use]
    pub fn env_event(&self) -> Event {
        Event::Env(EnvPayload {
            runtime: self.runtime.name().to_string(),
            version: self.runtime.version(),
            capabilities: self.runtime.capabilities(),
            gpu: self.probe.gpu_info(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CancelledResult<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_id: Option<&'a str>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<&'a str>,
}

/// Run a training job and return the process exit code.
pub fn run_train_job(raw: &RawConfig, run_dir: Option<&Path>, env: &mut JobEnv, sink: &dyn EventSink) -> i32 {
    let job = match TrainDescriptor::from_raw(raw, run_dir) {
        Ok(job) => job,
        Err(err) => return fail(err, sink, None),
    };
    let layout = RunLayout::new(&job.run_dir);

    match pipeline::run_training(&job, raw, &layout, env, sink) {
        Ok(()) => EXIT_OK,
        Err(err) if err.is_cancelled() => {
            let result = CancelledResult {
                run_id: Some(&job.run_id),
                eval_id: None,
                status: "cancelled",
                mode: Some(job.mode.as_str()),
            };
            record_cancelled(&layout, &result, sink);
            sink.emit(Event::Status(StatusPayload::warn("trainer cancelled").run_id(&job.run_id)));
            EXIT_CANCELLED
        }
        Err(err) => fail(err, sink, Some(Tag::Run(&job.run_id))),
    }
}

/// Run an evaluation job and return the process exit code.
pub fn run_eval_job(raw: &RawConfig, run_dir: Option<&Path>, env: &mut JobEnv, sink: &dyn EventSink) -> i32 {
    let job = match EvalDescriptor::from_raw(raw, run_dir) {
        Ok(job) => job,
        Err(err) => return fail(err, sink, None),
    };
    let layout = RunLayout::new(&job.run_dir);

    match eval::run_evaluation(&job, raw, &layout, env, sink) {
        Ok(_) => EXIT_OK,
        Err(err) if err.is_cancelled() => {
            let result = CancelledResult { run_id: None, eval_id: Some(&job.eval_id), status: "cancelled", mode: None };
            record_cancelled(&layout, &result, sink);
            sink.emit(Event::Status(StatusPayload::warn("evaluator cancelled").eval_id(&job.eval_id)));
            EXIT_CANCELLED
        }
        Err(err) => fail(err, sink, Some(Tag::Eval(&job.eval_id))),
    }
}

fn record_cancelled(layout: &RunLayout, result: &CancelledResult<'_>, sink: &dyn EventSink) {
    let written: TrainingResult<()> = layout.ensure_root().and_then(|()| write_json_atomic(&layout.result_path(), result));
    match written {
        Ok(()) => sink.emit(Event::Artifact(ArtifactPayload {
            kind: ArtifactKind::Result,
            path: layout.result_path().display().to_string(),
            run_id: result.run_id.map(str::to_string),
            eval_id: result.eval_id.map(str::to_string),
        })),
        Err(err) => tracing::warn!("failed to write cancelled result: {}", err),
    }
}

enum Tag<'a> {
    Run(&'a str),
    Eval(&'a str),
}

fn fail(err: TrainingError, sink: &dyn EventSink, tag: Option<Tag<'_>>) -> i32 {
    let message = err.to_string();
    let trace = format!("{:?}", anyhow::Error::new(err));
    tracing::error!("{}", message);

    let mut status = StatusPayload::error(message).trace(trace);
    match tag {
        Some(Tag::Run(id)) => status = status.run_id(id),
        Some(Tag::Eval(id)) => status = status.eval_id(id),
        None => {}
    }
    sink.emit(Event::Status(status));
    EXIT_FAILED
}
