use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};

pub const CANCEL_FLAG: &str = "cancel.flag";

/// Filesystem layout of one run directory.
///
/// The host owns the directory; this process only writes the files listed here
/// and polls `cancel.flag`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    #[must_use]
    pub fn dataset_jsonl_path(&self) -> PathBuf {
        self.root.join("dataset.jsonl")
    }

    #[must_use]
    pub fn dataset_summary_path(&self) -> PathBuf {
        self.root.join("dataset_summary.json")
    }

    #[must_use]
    pub fn result_path(&self) -> PathBuf {
        self.root.join("result.json")
    }

    #[must_use]
    pub fn predictions_path(&self) -> PathBuf {
        self.root.join("predictions.jsonl")
    }

    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    #[must_use]
    pub fn cancel_flag_path(&self) -> PathBuf {
        self.root.join(CANCEL_FLAG)
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        self.artifacts_dir().join("adapter")
    }

    #[must_use]
    pub fn merged_model_dir(&self) -> PathBuf {
        self.artifacts_dir().join("merged_model")
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            TrainingError::Persistence(format!("failed to create run dir {}: {}", self.root.display(), e))
        })
    }

    pub fn ensure_artifacts_dir(&self) -> TrainingResult<()> {
        let dir = self.artifacts_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| TrainingError::Persistence(format!("failed to create {}: {}", dir.display(), e)))
    }

    #[must_use]
    pub fn cancel_marker(&self) -> CancelMarker {
        CancelMarker { path: self.cancel_flag_path() }
    }
}

/// Cooperative cancellation marker polled between batches.
#[derive(Debug, Clone)]
pub struct CancelMarker {
    path: PathBuf,
}

impl CancelMarker {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// `Err(Cancelled)` once the host has created the marker.
    pub fn check(&self) -> TrainingResult<()> {
        if self.is_set() {
            tracing::info!(path = %self.path.display(), "cancel marker found");
            return Err(TrainingError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path().join("runs").join("r1"));

        assert!(layout.result_path().ends_with("r1/result.json"));
        assert!(layout.adapter_dir().ends_with("artifacts/adapter"));
        assert!(layout.merged_model_dir().ends_with("artifacts/merged_model"));

        layout.ensure_root().unwrap();
        assert!(layout.root().is_dir());
    }

    #[test]
    fn test_cancel_marker() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path());
        let marker = layout.cancel_marker();
        assert!(marker.check().is_ok());

        std::fs::write(layout.cancel_flag_path(), b"").unwrap();
        assert!(marker.check().unwrap_err().is_cancelled());
    }
}
