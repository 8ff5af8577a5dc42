//! The event stream consumed by the host.
//!
//! Every event is one self-contained JSON line: `{"kind": ..., "payload": {...}}`.

use crate::dataset::{DatasetMeta, SplitCounts};
use crate::runtime::Capabilities;
use crate::telemetry::{GpuInfo, ResourceSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Status(StatusPayload),
    Env(EnvPayload),
    Dataset(DatasetPayload),
    Model(ModelPayload),
    Progress(ProgressPayload),
    Metric(MetricPayload),
    Artifact(ArtifactPayload),
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Env(_) => "env",
            Self::Dataset(_) => "dataset",
            Self::Model(_) => "model",
            Self::Progress(_) => "progress",
            Self::Metric(_) => "metric",
            Self::Artifact(_) => "artifact",
        }
    }

    /// Single-line JSON encoding.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl StatusPayload {
    #[must_use]
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            run_id: None,
            eval_id: None,
            run_dir: None,
            teacher_model_id: None,
            trace: None,
        }
    }

    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    #[must_use]
    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Level::Warn, message)
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn eval_id(mut self, eval_id: impl Into<String>) -> Self {
        self.eval_id = Some(eval_id.into());
        self
    }

    #[must_use]
    pub fn run_dir(mut self, run_dir: impl Into<String>) -> Self {
        self.run_dir = Some(run_dir.into());
        self
    }

    #[must_use]
    pub fn teacher_model_id(mut self, id: impl Into<String>) -> Self {
        self.teacher_model_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvPayload {
    pub runtime: String,
    pub version: String,
    pub capabilities: Capabilities,
    pub gpu: GpuInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DatasetPayload {
    Train {
        run_id: String,
        meta: DatasetMeta,
        counts: SplitCounts,
        total: usize,
        path: String,
    },
    Eval {
        eval_id: String,
        dataset_id: String,
        total: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelPayload {
    pub run_id: String,
    pub student: StudentInfo,
    pub params: ParamCounts,
    pub device: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentInfo {
    pub name_or_path: String,
    pub lora: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamCounts {
    pub trainable: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProgressPayload {
    Train(TrainProgress),
    Stub(StubProgress),
    Eval(EvalProgress),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainProgress {
    pub run_id: String,
    pub epoch: u64,
    pub step: u64,
    pub optim_step: u64,
    pub total_steps: u64,
    pub loss: f64,
    pub ce_loss: f64,
    pub kd_loss: f64,
    pub alpha: f64,
    pub temperature: f64,
    pub lr: f64,
    pub mode: String,
    pub elapsed_ms: u64,
    pub resources: ResourceSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StubProgress {
    pub run_id: String,
    pub step: u64,
    pub total_steps: u64,
    pub loss: f64,
    pub mode: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalProgress {
    pub eval_id: String,
    pub processed: usize,
    pub total: usize,
    pub exact_match: f64,
    pub fuzzy_match: f64,
    pub bleu: f64,
    pub f1: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricPayload {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Result,
    Adapter,
    MergedModel,
    Predictions,
    Metrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPayload {
    pub kind: ArtifactKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_id: Option<String>,
}

/// Ordered metric map as persisted to `metrics.json`.
pub type MetricMap = BTreeMap<String, f64>;

/// Receiver of job events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes one JSON line per event and flushes immediately.
#[derive(Debug)]
pub struct JsonlSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JsonlSink<std::io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> EventSink for JsonlSink<W> {
    fn emit(&self, event: Event) {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(kind = event.kind(), "failed to encode event: {}", err);
                return;
            }
        };
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            tracing::warn!(kind = event.kind(), "failed to write event: {}", err);
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events as JSON values, the way a host would read them.
    #[must_use]
    pub fn lines(&self) -> Vec<serde_json::Value> {
        self.events()
            .iter()
            .filter_map(|e| serde_json::to_value(e).ok())
            .collect()
    }

    /// Payloads of every event of `kind`.
    #[must_use]
    pub fn payloads(&self, kind: &str) -> Vec<serde_json::Value> {
        self.lines()
            .into_iter()
            .filter(|v| v["kind"] == kind)
            .map(|mut v| v["payload"].take())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_status_line_shape() {
        let event = Event::Status(StatusPayload::warn("teacher skipped").teacher_model_id("t1"));
        let v: Value = serde_json::from_str(&event.to_line().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({"kind": "status", "payload": {"level": "warn", "message": "teacher skipped", "teacher_model_id": "t1"}})
        );
    }

    #[test]
    fn test_artifact_kind_is_snake_case() {
        let event = Event::Artifact(ArtifactPayload {
            kind: ArtifactKind::MergedModel,
            path: "/r/artifacts/merged_model".into(),
            run_id: Some("r".into()),
            eval_id: None,
        });
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["payload"]["kind"], "merged_model");
        assert!(v["payload"].get("eval_id").is_none());
    }

    #[test]
    fn test_jsonl_sink_writes_one_line_per_event() {
        let sink = JsonlSink::new(Vec::new());
        sink.emit(Event::Status(StatusPayload::info("a")));
        sink.emit(Event::Metric(MetricPayload { name: "val_loss".into(), value: 1.5, run_id: None, eval_id: None }));
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: Value = serde_json::from_str(line).unwrap();
            assert!(v.get("kind").is_some());
            assert!(v.get("payload").is_some());
        }
    }

    #[test]
    fn test_memory_sink_payloads_by_kind() {
        let sink = MemorySink::new();
        sink.emit(Event::Status(StatusPayload::info("x")));
        sink.emit(Event::Progress(ProgressPayload::Stub(StubProgress {
            run_id: "r".into(),
            step: 1,
            total_steps: 2,
            loss: 1.97,
            mode: "fine_tune".into(),
            elapsed_ms: 0,
        })));
        let progress = sink.payloads("progress");
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["step"], 1);
    }
}
