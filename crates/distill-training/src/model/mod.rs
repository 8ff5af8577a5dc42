//! Model identity and artifact resolution.
//!
//! A [`ModelSpec`] says *which* model a job wants; [`ModelArtifact`] says what
//! kind of thing is on disk (or on the hub) behind it. Resolution happens once
//! and the tagged result is passed down to the runtime.

pub mod lora;

use crate::config::{as_text, get_any, truthy};
use crate::error::{TrainingError, TrainingResult};
use crate::runtime::toy::TOY_MODEL_FILE;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Requests the built-in toy model instead of real weights.
pub const TOY_SENTINEL: &str = "__toy__";

pub const ADAPTER_MARKERS: &[&str] = &["adapter_config.json", "adapter_model.safetensors"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub name_or_path: String,
    pub local_files_only: bool,
    pub trust_remote_code: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ModelSpec {
    /// A string is a local path; an object carries the full spec.
    /// `null` or an empty string means "not specified".
    pub fn parse(value: &Value) -> TrainingResult<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => Ok(Some(Self::local(s.trim()))),
            Value::Object(obj) => {
                let name = get_any(obj, &["name_or_path", "model_name_or_path", "path"])
                    .and_then(as_text)
                    .ok_or_else(|| TrainingError::config("model spec requires name_or_path"))?;
                let local_files_only = match get_any(obj, &["local_files_only"]) {
                    Some(v) => truthy(v),
                    None => !get_any(obj, &["allow_download", "allowDownload"]).is_some_and(truthy),
                };
                Ok(Some(Self {
                    name_or_path: name,
                    local_files_only,
                    trust_remote_code: get_any(obj, &["trust_remote_code", "trustRemoteCode"]).is_some_and(truthy),
                    revision: get_any(obj, &["revision"]).and_then(as_text),
                }))
            }
            _ => Err(TrainingError::config("model spec must be a string or an object")),
        }
    }

    #[must_use]
    pub fn local(path: impl Into<String>) -> Self {
        Self { name_or_path: path.into(), local_files_only: true, trust_remote_code: false, revision: None }
    }

    #[must_use]
    pub fn toy() -> Self {
        Self::local(TOY_SENTINEL)
    }

    #[must_use]
    pub fn is_toy(&self) -> bool {
        self.name_or_path == TOY_SENTINEL
    }

    #[must_use]
    pub fn is_gguf(&self) -> bool {
        self.name_or_path.to_ascii_lowercase().ends_with(".gguf")
    }
}

#[must_use]
pub fn has_adapter_markers(dir: &Path) -> bool {
    dir.is_dir() && ADAPTER_MARKERS.iter().any(|m| dir.join(m).exists())
}

fn is_encoder_decoder(dir: &Path) -> bool {
    std::fs::read_to_string(dir.join("config.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|cfg| cfg.get("is_encoder_decoder").and_then(Value::as_bool))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelArtifact {
    /// Built from the job's corpus at load time.
    Toy,
    /// A toy model saved by an earlier run.
    ToyCheckpoint { dir: PathBuf },
    /// Full weights: a hub id or a local directory in hub layout.
    Pretrained { spec: ModelSpec },
    /// Adapter weights layered on `base`.
    Adapter { dir: PathBuf, base: ModelSpec },
}

impl ModelArtifact {
    /// Classify `spec`. `base` is only consulted for adapter directories.
    pub fn resolve(spec: &ModelSpec, base: Option<&ModelSpec>) -> TrainingResult<Self> {
        if spec.is_toy() {
            return Ok(Self::Toy);
        }
        if spec.is_gguf() {
            return Err(TrainingError::UnsupportedFormat(format!(
                "GGUF artifacts are not supported: {}",
                spec.name_or_path
            )));
        }

        let dir = Path::new(&spec.name_or_path);
        if !dir.is_dir() {
            return Ok(Self::Pretrained { spec: spec.clone() });
        }
        if dir.join(TOY_MODEL_FILE).is_file() {
            return Ok(Self::ToyCheckpoint { dir: dir.to_path_buf() });
        }
        if has_adapter_markers(dir) {
            let base = base.ok_or_else(|| {
                TrainingError::NotFound("Adapter artifact requires a base model path.".to_string())
            })?;
            if base.is_gguf() {
                return Err(TrainingError::UnsupportedFormat(format!(
                    "GGUF artifacts are not supported: {}",
                    base.name_or_path
                )));
            }
            return Ok(Self::Adapter { dir: dir.to_path_buf(), base: base.clone() });
        }
        if is_encoder_decoder(dir) {
            return Err(TrainingError::UnsupportedFormat(format!(
                "encoder-decoder models are not supported: {}",
                spec.name_or_path
            )));
        }
        Ok(Self::Pretrained { spec: spec.clone() })
    }

    #[must_use]
    pub fn name_or_path(&self) -> String {
        match self {
            Self::Toy => TOY_SENTINEL.to_string(),
            Self::ToyCheckpoint { dir } | Self::Adapter { dir, .. } => dir.display().to_string(),
            Self::Pretrained { spec } => spec.name_or_path.clone(),
        }
    }

    #[must_use]
    pub fn requires_tensor_runtime(&self) -> bool {
        matches!(self, Self::Pretrained { .. } | Self::Adapter { .. })
    }

    #[must_use]
    pub fn is_toy(&self) -> bool {
        matches!(self, Self::Toy | Self::ToyCheckpoint { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_string_and_object() {
        let s = ModelSpec::parse(&json!("/models/student")).unwrap().unwrap();
        assert_eq!(s, ModelSpec::local("/models/student"));

        let o = ModelSpec::parse(&json!({
            "model_name_or_path": "org/model",
            "allowDownload": true,
            "trustRemoteCode": "yes",
            "revision": "main"
        }))
        .unwrap()
        .unwrap();
        assert_eq!(o.name_or_path, "org/model");
        assert!(!o.local_files_only);
        assert!(o.trust_remote_code);
        assert_eq!(o.revision.as_deref(), Some("main"));

        assert!(ModelSpec::parse(&json!(null)).unwrap().is_none());
        assert!(ModelSpec::parse(&json!("  ")).unwrap().is_none());
        assert!(ModelSpec::parse(&json!({"revision": "x"})).is_err());
        assert!(ModelSpec::parse(&json!(3)).is_err());
    }

    #[test]
    fn test_explicit_local_flag_wins_over_allow_download() {
        let o = ModelSpec::parse(&json!({"path": "p", "local_files_only": true, "allow_download": true}))
            .unwrap()
            .unwrap();
        assert!(o.local_files_only);
    }

    #[test]
    fn test_gguf_rejected_case_insensitive() {
        let err = ModelArtifact::resolve(&ModelSpec::local("/m/model.Q4.GGUF"), None).unwrap_err();
        assert!(matches!(err, TrainingError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_toy_and_hub_ids() {
        assert_eq!(ModelArtifact::resolve(&ModelSpec::toy(), None).unwrap(), ModelArtifact::Toy);
        let hub = ModelArtifact::resolve(&ModelSpec::local("org/not-on-disk"), None).unwrap();
        assert!(hub.requires_tensor_runtime());
        assert_eq!(hub.name_or_path(), "org/not-on-disk");
    }

    #[test]
    fn test_adapter_requires_base() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("adapter_config.json"), "{}").unwrap();
        let spec = ModelSpec::local(temp.path().display().to_string());

        let err = ModelArtifact::resolve(&spec, None).unwrap_err();
        assert!(err.to_string().contains("requires a base model path"));

        let base = ModelSpec::local("/models/base");
        match ModelArtifact::resolve(&spec, Some(&base)).unwrap() {
            ModelArtifact::Adapter { base: b, .. } => assert_eq!(b, base),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_encoder_decoder_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"is_encoder_decoder": true}"#).unwrap();
        let spec = ModelSpec::local(temp.path().display().to_string());
        assert!(matches!(ModelArtifact::resolve(&spec, None), Err(TrainingError::UnsupportedFormat(_))));

        std::fs::write(temp.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
        assert!(matches!(ModelArtifact::resolve(&spec, None), Ok(ModelArtifact::Pretrained { .. })));
    }

    #[test]
    fn test_toy_checkpoint_detected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(TOY_MODEL_FILE), "{}").unwrap();
        let spec = ModelSpec::local(temp.path().display().to_string());
        let artifact = ModelArtifact::resolve(&spec, None).unwrap();
        assert!(artifact.is_toy());
        assert!(!artifact.requires_tensor_runtime());
    }
}
