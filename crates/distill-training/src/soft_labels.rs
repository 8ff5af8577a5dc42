//! Cached teacher outputs keyed by prompt hash.

use crate::dataset::TrainingSample;
use crate::events::{Event, EventSink, StatusPayload};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Lowercase hex SHA-256 of the prompt text.
#[must_use]
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoftLabel {
    #[serde(alias = "promptHash")]
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "teacherOutput")]
    pub teacher_output: Option<String>,
    #[serde(default, alias = "softLabelType")]
    pub soft_label_type: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SoftLabelCache {
    entries: HashMap<String, SoftLabel>,
}

impl SoftLabelCache {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, prompt: &str) -> Option<&SoftLabel> {
        self.entries.get(&prompt_hash(prompt))
    }

    /// Load a JSONL cache. Problems are reported as `warn` events, never as errors.
    pub fn load(path: &Path, sink: &dyn EventSink) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                sink.emit(Event::Status(StatusPayload::warn(format!(
                    "Soft labels path specified but file not found: {}",
                    path.display()
                ))));
                return Self::default();
            }
            Err(err) => {
                sink.emit(Event::Status(StatusPayload::warn(format!("Failed to load soft labels: {err}"))));
                return Self::default();
            }
        };

        let mut entries = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SoftLabel>(line) {
                Ok(record) => {
                    if let Some(hash) = record.prompt_hash.clone().filter(|h| !h.is_empty()) {
                        entries.insert(hash, record);
                    }
                }
                Err(err) => sink.emit(Event::Status(StatusPayload::warn(format!(
                    "Failed to parse soft label record on line {}: {}",
                    idx + 1,
                    err
                )))),
            }
        }

        let cache = Self { entries };
        sink.emit(Event::Status(StatusPayload::info(format!(
            "Loaded {} cached soft labels from {}{}",
            cache.len(),
            path.display(),
            cache.provenance()
        ))));
        cache
    }

    /// Label types and the teacher temperature recorded in the cache, as a status suffix.
    fn provenance(&self) -> String {
        let kinds: BTreeSet<&str> = self.entries.values().filter_map(|l| l.soft_label_type.as_deref()).collect();
        let mut temperatures: Vec<f64> = self.entries.values().filter_map(|l| l.temperature).collect();
        temperatures.sort_by(f64::total_cmp);
        temperatures.dedup();

        let mut details = Vec::new();
        if !kinds.is_empty() {
            details.push(format!("type {}", kinds.into_iter().collect::<Vec<_>>().join("/")));
        }
        match temperatures.as_slice() {
            [] => {}
            [t] => details.push(format!("temperature {t}")),
            [lo, .., hi] => details.push(format!("temperature {lo}..{hi}")),
        }
        if details.is_empty() { String::new() } else { format!(" ({})", details.join(", ")) }
    }

    /// Replace targets with cached teacher text where available. Returns how many changed.
    pub fn substitute_targets(&self, samples: &mut [TrainingSample]) -> usize {
        let mut replaced = 0;
        for sample in samples.iter_mut() {
            if let Some(text) = self
                .get(&sample.prompt)
                .and_then(|label| label.teacher_output.as_deref())
                .filter(|t| !t.trim().is_empty())
            {
                sample.target = text.to_string();
                replaced += 1;
            }
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Split;
    use crate::events::MemorySink;
    use tempfile::TempDir;

    #[test]
    fn test_prompt_hash_is_sha256_hex() {
        assert_eq!(
            prompt_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_file_warns() {
        let sink = MemorySink::new();
        let cache = SoftLabelCache::load(Path::new("/definitely/not/here.jsonl"), &sink);
        assert!(cache.is_empty());
        let status = sink.payloads("status");
        assert_eq!(status[0]["level"], "warn");
    }

    #[test]
    fn test_load_and_substitute() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("soft.jsonl");
        let line = format!(
            "{{\"promptHash\":\"{}\",\"prompt\":\"q\",\"teacher_output\":\"teacher says\"}}\nnot json\n",
            prompt_hash("q")
        );
        std::fs::write(&path, line).unwrap();

        let sink = MemorySink::new();
        let cache = SoftLabelCache::load(&path, &sink);
        assert_eq!(cache.len(), 1);
        let levels: Vec<_> = sink.payloads("status").iter().map(|p| p["level"].clone()).collect();
        assert_eq!(levels, vec!["warn", "info"]);

        let mut samples = vec![
            TrainingSample {
                correction_id: "a".into(),
                split: Split::Train,
                weight: 1.0,
                prompt: "q".into(),
                target: "old".into(),
                metadata: None,
            },
            TrainingSample {
                correction_id: "b".into(),
                split: Split::Train,
                weight: 1.0,
                prompt: "other".into(),
                target: "keep".into(),
                metadata: None,
            },
        ];
        assert_eq!(cache.substitute_targets(&mut samples), 1);
        assert_eq!(samples[0].target, "teacher says");
        assert_eq!(samples[1].target, "keep");
    }

    #[test]
    fn test_whitespace_prompt_hits_cache() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("soft.jsonl");
        let prompt = "Question: what is 2+2?\n";
        let record = serde_json::json!({
            "prompt_hash": prompt_hash(prompt),
            "teacher_output": "four",
            "soft_label_type": "text",
            "temperature": 2.0,
        });
        std::fs::write(&path, format!("{record}\n")).unwrap();

        let sink = MemorySink::new();
        let cache = SoftLabelCache::load(&path, &sink);
        let message = sink.payloads("status")[0]["message"].as_str().unwrap().to_string();
        assert!(message.ends_with("(type text, temperature 2)"), "{message}");

        let mut samples = vec![TrainingSample {
            correction_id: "a".into(),
            split: Split::Train,
            weight: 1.0,
            prompt: prompt.into(),
            target: "  4\n".into(),
            metadata: None,
        }];
        assert_eq!(cache.substitute_targets(&mut samples), 1);
        assert_eq!(samples[0].target, "four");
    }

    #[test]
    fn test_provenance_spans_temperatures() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("soft.jsonl");
        let lines: Vec<String> = [("a", 1.0), ("b", 3.0)]
            .iter()
            .map(|(p, t)| serde_json::json!({"promptHash": prompt_hash(p), "teacherOutput": p, "temperature": t}).to_string())
            .collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let cache = SoftLabelCache::load(&path, &MemorySink::new());
        assert_eq!(cache.provenance(), " (temperature 1..3)");
    }
}
