//! Which artifact forms a finished run persists.

use crate::config::{as_text, get_any, truthy};
use crate::error::TrainingResult;
use crate::events::{ArtifactKind, ArtifactPayload, Event, EventSink, StatusPayload};
use crate::hyperparams::HyperParams;
use crate::layout::RunLayout;
use crate::runtime::{CausalLm, Tokenizer};
use std::path::{Path, PathBuf};

pub const DEFAULT_EXPORT_FORMAT: &str = "adapter";

const GGUF_WARNING: &str =
    "GGUF export requested but not implemented in this runner yet (requires llama.cpp conversion).";

/// What to save once training finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportIntent {
    pub save_adapter: bool,
    pub save_merged: bool,
    /// A quantized export was asked for and degraded to a merged model.
    pub quantized_requested: bool,
    /// Format name that matched nothing.
    pub unknown_format: Option<String>,
}

impl ExportIntent {
    /// Format from the `export` section, then top-level hyperparameters, then the
    /// job descriptor. Explicit save flags in the section override the format.
    #[must_use]
    pub fn resolve(hp: &HyperParams, job_format: Option<&str>) -> Self {
        let section = hp.section("export");
        let format = section
            .and_then(|s| get_any(s, &["format", "export_format", "exportFormat"]))
            .and_then(as_text)
            .or_else(|| hp.text(&["export_format", "exportFormat"]))
            .or_else(|| job_format.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_EXPORT_FORMAT.to_string())
            .to_ascii_lowercase();

        let adapter_flag = section.and_then(|s| get_any(s, &["save_adapter", "saveAdapter"]));
        let merged_flag = section.and_then(|s| get_any(s, &["save_merged_model", "saveMergedModel"]));
        if adapter_flag.is_some() || merged_flag.is_some() {
            return Self {
                save_adapter: adapter_flag.is_none_or(truthy),
                save_merged: merged_flag.is_some_and(truthy),
                quantized_requested: false,
                unknown_format: None,
            };
        }

        let mut intent =
            Self { save_adapter: true, save_merged: false, quantized_requested: false, unknown_format: None };
        match format.as_str() {
            "adapter" => {}
            "merged_model" | "merged" => {
                intent.save_adapter = false;
                intent.save_merged = true;
            }
            "gguf" => {
                intent.save_adapter = false;
                intent.save_merged = true;
                intent.quantized_requested = true;
            }
            _ => intent.unknown_format = Some(format),
        }
        intent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

/// Persist the artifact forms in `intent`. At least one deployable artifact is
/// always written: with nothing saved, the full model goes to `merged_model`.
pub fn export_model(
    intent: &ExportIntent,
    model: &dyn CausalLm,
    tokenizer: &dyn Tokenizer,
    layout: &RunLayout,
    run_id: &str,
    sink: &dyn EventSink,
) -> TrainingResult<Vec<ExportedArtifact>> {
    if intent.quantized_requested {
        sink.emit(Event::Status(StatusPayload::warn(GGUF_WARNING).run_id(run_id)));
    }
    if let Some(format) = &intent.unknown_format {
        sink.emit(Event::Status(
            StatusPayload::warn(format!("Unknown export format '{format}'; saving adapter")).run_id(run_id),
        ));
    }
    layout.ensure_artifacts_dir()?;

    let mut exported = Vec::new();
    if intent.save_adapter {
        let dir = layout.adapter_dir();
        std::fs::create_dir_all(&dir)?;
        if model.save_adapter(&dir)? {
            tokenizer.save(&dir)?;
            exported.push(ExportedArtifact { kind: ArtifactKind::Adapter, path: dir });
        } else {
            tracing::debug!(run_id, "no adapter attached; skipping adapter export");
            remove_if_empty(&dir);
        }
    }

    if intent.save_merged || exported.is_empty() {
        if !intent.save_merged {
            sink.emit(Event::Status(
                StatusPayload::info("No adapter to export; saving full model as merged_model").run_id(run_id),
            ));
        }
        let dir = layout.merged_model_dir();
        std::fs::create_dir_all(&dir)?;
        if !model.save_merged(&dir)? {
            model.save_pretrained(&dir)?;
        }
        tokenizer.save(&dir)?;
        exported.push(ExportedArtifact { kind: ArtifactKind::MergedModel, path: dir });
    }

    for artifact in &exported {
        sink.emit(Event::Artifact(ArtifactPayload {
            kind: artifact.kind,
            path: artifact.path.display().to_string(),
            run_id: Some(run_id.to_string()),
            eval_id: None,
        }));
    }
    Ok(exported)
}

fn remove_if_empty(dir: &Path) {
    let empty = std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
    if empty {
        let _ = std::fs::remove_dir(dir);
    }
}
