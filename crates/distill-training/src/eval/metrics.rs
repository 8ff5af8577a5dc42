//! Text-overlap metrics for generated answers.

use crate::config::RawConfig;
use crate::events::MetricMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const BLEU_MAX_ORDER: usize = 4;

/// Lowercase with whitespace runs collapsed to single spaces.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

fn tokens(text: &str) -> Vec<String> {
    normalize(text).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

#[must_use]
pub fn exact_match(predicted: &str, expected: &str) -> f64 {
    if normalize(predicted) == normalize(expected) { 1.0 } else { 0.0 }
}

/// Normalized Levenshtein similarity in [0, 1].
#[must_use]
pub fn fuzzy_match(predicted: &str, expected: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(predicted), &normalize(expected))
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// Sentence BLEU-4 with add-one smoothing for orders without matches.
#[must_use]
pub fn bleu(predicted: &str, expected: &str) -> f64 {
    let hyp = tokens(predicted);
    let reference = tokens(expected);
    if hyp.is_empty() || reference.is_empty() {
        return 0.0;
    }

    let mut log_sum = 0.0;
    for n in 1..=BLEU_MAX_ORDER {
        let hyp_counts = ngram_counts(&hyp, n);
        let ref_counts = ngram_counts(&reference, n);
        let matches: usize =
            hyp_counts.iter().map(|(gram, c)| (*c).min(ref_counts.get(gram).copied().unwrap_or(0))).sum();
        let total = hyp.len().saturating_sub(n - 1);
        let precision = if matches > 0 && total > 0 {
            matches as f64 / total as f64
        } else {
            (matches as f64 + 1.0) / (total as f64 + 1.0)
        };
        log_sum += precision.ln();
    }

    let (c, r) = (hyp.len() as f64, reference.len() as f64);
    let brevity = if c > r { 1.0 } else { (1.0 - r / c).exp() };
    brevity * (log_sum / BLEU_MAX_ORDER as f64).exp()
}

/// F1 over unique tokens.
#[must_use]
pub fn token_f1(predicted: &str, expected: &str) -> f64 {
    let pred: HashSet<String> = tokens(predicted).into_iter().collect();
    let gold: HashSet<String> = tokens(expected).into_iter().collect();
    if pred.is_empty() || gold.is_empty() {
        return if pred.is_empty() && gold.is_empty() { 1.0 } else { 0.0 };
    }
    let common = pred.intersection(&gold).count() as f64;
    if common == 0.0 {
        return 0.0;
    }
    let precision = common / pred.len() as f64;
    let recall = common / gold.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

fn string_list(metadata: Option<&RawConfig>, key: &str) -> Vec<String> {
    metadata
        .and_then(|m| m.get(key))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Share of metadata `citations` present in the normalized prediction.
#[must_use]
pub fn citation_coverage(predicted: &str, metadata: Option<&RawConfig>) -> Option<f64> {
    let citations = string_list(metadata, "citations");
    if citations.is_empty() {
        return None;
    }
    let haystack = normalize(predicted);
    let found = citations.iter().filter(|c| haystack.contains(&normalize(c))).count();
    Some(found as f64 / citations.len() as f64)
}

/// Share of metadata `keywords` present in the lowercased prediction.
#[must_use]
pub fn faithfulness(predicted: &str, metadata: Option<&RawConfig>) -> Option<f64> {
    let keywords = string_list(metadata, "keywords");
    if keywords.is_empty() {
        return None;
    }
    let haystack = predicted.to_lowercase();
    let found = keywords.iter().filter(|k| haystack.contains(&k.to_lowercase())).count();
    Some(found as f64 / keywords.len() as f64)
}

/// Scores for one prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleScores {
    pub exact_match: f64,
    pub fuzzy_match: f64,
    pub bleu: f64,
    pub f1: f64,
    pub citation_coverage: Option<f64>,
    pub faithfulness: Option<f64>,
    pub teacher_agreement: Option<f64>,
}

impl SampleScores {
    #[must_use]
    pub fn score(predicted: &str, expected: &str, metadata: Option<&RawConfig>, teacher: Option<&str>) -> Self {
        Self {
            exact_match: exact_match(predicted, expected),
            fuzzy_match: fuzzy_match(predicted, expected),
            bleu: bleu(predicted, expected),
            f1: token_f1(predicted, expected),
            citation_coverage: citation_coverage(predicted, metadata),
            faithfulness: faithfulness(predicted, metadata),
            teacher_agreement: teacher.map(|t| exact_match(predicted, t)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Running means. Optional metrics average only over samples that carry them.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    exact_match: Mean,
    fuzzy_match: Mean,
    bleu: Mean,
    f1: Mean,
    citation_coverage: Mean,
    faithfulness: Mean,
    teacher_agreement: Mean,
}

impl MetricAccumulator {
    pub fn add(&mut self, scores: &SampleScores) {
        self.exact_match.add(Some(scores.exact_match));
        self.fuzzy_match.add(Some(scores.fuzzy_match));
        self.bleu.add(Some(scores.bleu));
        self.f1.add(Some(scores.f1));
        self.citation_coverage.add(scores.citation_coverage);
        self.faithfulness.add(scores.faithfulness);
        self.teacher_agreement.add(scores.teacher_agreement);
    }

    #[must_use]
    pub fn processed(&self) -> usize {
        self.exact_match.count
    }

    /// `(exact_match, fuzzy_match, bleu, f1)` so far.
    #[must_use]
    pub fn headline(&self) -> (f64, f64, f64, f64) {
        let v = |m: &Mean| m.value().unwrap_or(0.0);
        (v(&self.exact_match), v(&self.fuzzy_match), v(&self.bleu), v(&self.f1))
    }

    #[must_use]
    pub fn finish(&self) -> MetricMap {
        let mut out = MetricMap::new();
        let (em, fuzzy, bleu, f1) = self.headline();
        out.insert("exact_match".to_string(), em);
        out.insert("fuzzy_match".to_string(), fuzzy);
        out.insert("bleu".to_string(), bleu);
        out.insert("f1".to_string(), f1);
        for (name, mean) in [
            ("citation_coverage", &self.citation_coverage),
            ("faithfulness", &self.faithfulness),
            ("teacher_agreement", &self.teacher_agreement),
        ] {
            if let Some(value) = mean.value() {
                out.insert(name.to_string(), value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> RawConfig {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_normalize_and_exact() {
        assert_eq!(normalize("  Hello\n  World "), "hello world");
        assert_eq!(exact_match("Hello   world", "hello world"), 1.0);
        assert_eq!(exact_match("hello", "world"), 0.0);
    }

    #[test]
    fn test_bleu_identity_and_disjoint() {
        let s = "the quick brown fox jumps";
        assert!((bleu(s, s) - 1.0).abs() < 1e-12);
        let disjoint = bleu("alpha beta gamma delta", "one two three four");
        assert!(disjoint > 0.0 && disjoint < 0.5);
        assert_eq!(bleu("", "x"), 0.0);
        // Short hypotheses pay the brevity penalty.
        assert!(bleu("the quick", s) < bleu("the quick brown fox", s));
    }

    #[test]
    fn test_token_f1_is_set_based() {
        assert_eq!(token_f1("a a b", "a b"), 1.0);
        assert!((token_f1("a b c d", "a b") - (2.0 * 0.5 * 1.0 / 1.5)).abs() < 1e-12);
        assert_eq!(token_f1("", ""), 1.0);
        assert_eq!(token_f1("x", ""), 0.0);
    }

    #[test]
    fn test_fuzzy_is_one_for_normalized_equal() {
        assert_eq!(fuzzy_match("A  B", "a b"), 1.0);
        assert!(fuzzy_match("kitten", "sitting") < 1.0);
    }

    #[test]
    fn test_citations_and_keywords() {
        let m = meta(json!({"citations": ["Doc 1", "doc  2"], "keywords": ["Alpha", "beta"]}));
        assert_eq!(citation_coverage("see DOC 1 and doc 2", Some(&m)), Some(1.0));
        assert_eq!(citation_coverage("see doc 1", Some(&m)), Some(0.5));
        assert_eq!(faithfulness("ALPHA only", Some(&m)), Some(0.5));
        assert_eq!(citation_coverage("x", None), None);
    }

    #[test]
    fn test_optional_metrics_average_over_carriers() {
        let m = meta(json!({"keywords": ["k"]}));
        let mut acc = MetricAccumulator::default();
        acc.add(&SampleScores::score("k", "k", Some(&m), None));
        acc.add(&SampleScores::score("z", "k", None, None));
        let out = acc.finish();
        assert_eq!(acc.processed(), 2);
        assert_eq!(out["exact_match"], 0.5);
        assert_eq!(out["faithfulness"], 1.0);
        assert!(!out.contains_key("citation_coverage"));
        assert!(!out.contains_key("teacher_agreement"));
    }
}
