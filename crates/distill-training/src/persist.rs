//! Atomic file persistence: write to a sibling temp file, then rename over the target.

use crate::error::{TrainingError, TrainingResult};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_sibling(path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let name = path
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp-{}-{millis}", std::process::id()))
}

fn persistence(path: &Path, err: &std::io::Error) -> TrainingError {
    TrainingError::Persistence(format!("failed to write {}: {}", path.display(), err))
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| persistence(path, &e))?;
    }
    let tmp = temp_sibling(path);
    let written = std::fs::File::create(&tmp).and_then(|mut f| {
        f.write_all(bytes)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|()| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(persistence(path, &e));
    }
    Ok(())
}

pub fn write_text_atomic(path: &Path, text: &str) -> TrainingResult<()> {
    write_bytes_atomic(path, text.as_bytes())
}

/// Pretty-printed JSON document.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> TrainingResult<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    write_text_atomic(path, &text)
}

/// One compact JSON object per line.
pub fn write_jsonl_atomic<T, I>(path: &Path, rows: I) -> TrainingResult<()>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut buf = String::new();
    for row in rows {
        buf.push_str(&serde_json::to_string(&row)?);
        buf.push('\n');
    }
    write_text_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn test_write_json_replaces_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("result.json");
        write_json_atomic(&path, &json!({"status": "running"})).unwrap();
        write_json_atomic(&path, &json!({"status": "completed"})).unwrap();

        let v: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["status"], "completed");

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_jsonl_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("rows.jsonl");
        write_jsonl_atomic(&path, [json!({"a": 1}), json!({"a": 2})]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
