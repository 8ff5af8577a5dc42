//! Built-in toy runtime.
//!
//! A word-level tokenizer over the job's own corpus and a tiny causal LM
//! (token embedding followed by a vocabulary projection). Small enough to
//! train on a laptop CPU in milliseconds, which makes end-to-end runs possible
//! without any external model files.

use super::{Capabilities, CausalLm, LoadContext, LoadedModel, Logits, ModelRole, ModelRuntime, Parameter, Tokenizer};
use crate::error::{TrainingError, TrainingResult};
use crate::model::ModelArtifact;
use crate::persist::write_json_atomic;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const EOS_TOKEN: &str = "<eos>";

pub const HIDDEN_SIZE: usize = 64;

pub const TOY_MODEL_FILE: &str = "toy_model.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const CHECKPOINT_FORMAT: &str = "distill-toy-lm";
const INIT_SCALE: f32 = 0.05;
const TEACHER_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Word and punctuation runs, whitespace dropped.
const PRE_TOKENIZE: &str = r"\w+|[^\w\s]+";

#[derive(Debug, Serialize, Deserialize)]
struct TokenizerFile {
    model: String,
    vocab: Vec<String>,
    pad_token: String,
    unk_token: String,
    eos_token: String,
}

#[derive(Debug, Clone)]
pub struct ToyTokenizer {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
    splitter: Regex,
}

impl ToyTokenizer {
    /// Vocabulary in first-seen order after the three special tokens.
    pub fn from_corpus<'a>(texts: impl IntoIterator<Item = &'a str>) -> TrainingResult<Self> {
        let splitter = pre_tokenizer()?;
        let mut tokens = vec![PAD_TOKEN.to_string(), UNK_TOKEN.to_string(), EOS_TOKEN.to_string()];
        let mut index: HashMap<String, u32> =
            tokens.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();

        for text in texts {
            for piece in splitter.find_iter(text) {
                if !index.contains_key(piece.as_str()) {
                    index.insert(piece.as_str().to_string(), tokens.len() as u32);
                    tokens.push(piece.as_str().to_string());
                }
            }
        }
        Ok(Self { tokens, index, splitter })
    }

    pub fn load(dir: &Path) -> TrainingResult<Self> {
        let path = dir.join(TOKENIZER_FILE);
        let file: TokenizerFile = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let specials = [PAD_TOKEN, UNK_TOKEN, EOS_TOKEN];
        if file.vocab.len() < specials.len() || file.vocab.iter().zip(specials).any(|(a, b)| a != b) {
            return Err(TrainingError::UnsupportedFormat(format!(
                "{} is not a toy word-level tokenizer",
                path.display()
            )));
        }
        let index = file.vocab.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();
        Ok(Self { tokens: file.vocab, index, splitter: pre_tokenizer()? })
    }

    fn is_special(id: u32) -> bool {
        id < 3
    }
}

fn pre_tokenizer() -> TrainingResult<Regex> {
    Regex::new(PRE_TOKENIZE).map_err(|e| TrainingError::Trainer(format!("invalid pre-tokenizer pattern: {e}")))
}

impl Tokenizer for ToyTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.splitter
            .find_iter(text)
            .map(|m| self.index.get(m.as_str()).copied().unwrap_or(1))
            .collect()
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> String {
        ids.iter()
            .filter(|&&id| !(skip_special && Self::is_special(id)))
            .filter_map(|&id| self.tokens.get(id as usize).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn pad_id(&self) -> Option<u32> {
        Some(0)
    }

    fn eos_id(&self) -> Option<u32> {
        Some(2)
    }

    fn save(&self, dir: &Path) -> TrainingResult<()> {
        let file = TokenizerFile {
            model: "word_level".to_string(),
            vocab: self.tokens.clone(),
            pad_token: PAD_TOKEN.to_string(),
            unk_token: UNK_TOKEN.to_string(),
            eos_token: EOS_TOKEN.to_string(),
        };
        write_json_atomic(&dir.join(TOKENIZER_FILE), &file)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    format: String,
    vocab_size: usize,
    hidden_size: usize,
    tensors: BTreeMap<String, Vec<f32>>,
}

/// `logits[t] = embed[x_t] · lm_head + bias`
#[derive(Debug, Clone)]
pub struct ToyCausalLm {
    vocab: usize,
    hidden: usize,
    params: Vec<Parameter>,
}

impl ToyCausalLm {
    #[must_use]
    pub fn new(vocab: usize, seed: u64) -> Self {
        let hidden = HIDDEN_SIZE;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut init = |n: usize| (0..n).map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE)).collect::<Vec<f32>>();
        let params = vec![
            Parameter::new("embed.weight", init(vocab * hidden)),
            Parameter::new("lm_head.weight", init(hidden * vocab)),
            Parameter::new("lm_head.bias", vec![0.0; vocab]),
        ];
        Self { vocab, hidden, params }
    }

    pub fn load(dir: &Path) -> TrainingResult<Self> {
        let path = dir.join(TOY_MODEL_FILE);
        let file: CheckpointFile = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if file.format != CHECKPOINT_FORMAT {
            return Err(TrainingError::UnsupportedFormat(format!("{}: unknown format {}", path.display(), file.format)));
        }
        let (vocab, hidden) = (file.vocab_size, file.hidden_size);
        let mut tensors = file.tensors;
        let mut take = |name: &str, len: usize| -> TrainingResult<Parameter> {
            match tensors.remove(name) {
                Some(values) if values.len() == len => Ok(Parameter::new(name, values)),
                _ => Err(TrainingError::UnsupportedFormat(format!(
                    "{}: tensor {name} missing or mis-sized",
                    path.display()
                ))),
            }
        };
        let params = vec![
            take("embed.weight", vocab * hidden)?,
            take("lm_head.weight", hidden * vocab)?,
            take("lm_head.bias", vocab)?,
        ];
        Ok(Self { vocab, hidden, params })
    }

    fn check_ids(&self, input_ids: &[Vec<u32>]) -> TrainingResult<usize> {
        let seq_len = input_ids.first().map_or(0, Vec::len);
        for row in input_ids {
            if row.len() != seq_len {
                return Err(TrainingError::Trainer("ragged batch passed to forward".to_string()));
            }
            if let Some(bad) = row.iter().find(|&&id| id as usize >= self.vocab) {
                return Err(TrainingError::Trainer(format!("token id {bad} outside vocabulary {}", self.vocab)));
            }
        }
        Ok(seq_len)
    }
}

fn is_masked(mask: &[Vec<u8>], b: usize, t: usize) -> bool {
    mask.get(b).and_then(|row| row.get(t)).is_some_and(|m| *m == 0)
}

impl CausalLm for ToyCausalLm {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn module_names(&self) -> Vec<String> {
        vec!["embed".to_string(), "lm_head".to_string()]
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn forward(&self, input_ids: &[Vec<u32>], attention_mask: &[Vec<u8>]) -> TrainingResult<Logits> {
        let seq_len = self.check_ids(input_ids)?;
        let (v_size, h_size) = (self.vocab, self.hidden);
        let (embed, head, bias) = (&self.params[0].value, &self.params[1].value, &self.params[2].value);

        let mut logits = Logits::zeros(input_ids.len(), seq_len, v_size);
        for (b, row) in input_ids.iter().enumerate() {
            for (t, &id) in row.iter().enumerate() {
                if is_masked(attention_mask, b, t) {
                    continue;
                }
                let h = &embed[id as usize * h_size..(id as usize + 1) * h_size];
                let out = logits.row_mut(b, t);
                out.copy_from_slice(bias);
                for (d, &hd) in h.iter().enumerate() {
                    let w = &head[d * v_size..(d + 1) * v_size];
                    for (o, &wv) in out.iter_mut().zip(w) {
                        *o += hd * wv;
                    }
                }
            }
        }
        Ok(logits)
    }

    fn backward(
        &mut self,
        input_ids: &[Vec<u32>],
        attention_mask: &[Vec<u8>],
        dlogits: &Logits,
    ) -> TrainingResult<()> {
        let seq_len = self.check_ids(input_ids)?;
        if dlogits.batch != input_ids.len() || dlogits.seq_len != seq_len || dlogits.vocab != self.vocab {
            return Err(TrainingError::Trainer("gradient shape does not match the batch".to_string()));
        }
        let (v_size, h_size) = (self.vocab, self.hidden);
        let [embed, head, bias] = self.params.as_mut_slice() else {
            return Err(TrainingError::Trainer("toy model parameters corrupted".to_string()));
        };

        for (b, row) in input_ids.iter().enumerate() {
            for (t, &id) in row.iter().enumerate() {
                if is_masked(attention_mask, b, t) {
                    continue;
                }
                let dl = dlogits.row(b, t);
                if dl.iter().all(|g| *g == 0.0) {
                    continue;
                }
                for (g, &d) in bias.grad.iter_mut().zip(dl) {
                    *g += d;
                }
                let base = id as usize * h_size;
                for d in 0..h_size {
                    let hd = embed.value[base + d];
                    let w = &head.value[d * v_size..(d + 1) * v_size];
                    let dw = &mut head.grad[d * v_size..(d + 1) * v_size];
                    let mut dh = 0.0f32;
                    for v in 0..v_size {
                        dw[v] += hd * dl[v];
                        dh += w[v] * dl[v];
                    }
                    embed.grad[base + d] += dh;
                }
            }
        }
        Ok(())
    }

    fn save_pretrained(&self, dir: &Path) -> TrainingResult<()> {
        let file = CheckpointFile {
            format: CHECKPOINT_FORMAT.to_string(),
            vocab_size: self.vocab,
            hidden_size: self.hidden,
            tensors: self.params.iter().map(|p| (p.name.clone(), p.value.clone())).collect(),
        };
        write_json_atomic(&dir.join(TOY_MODEL_FILE), &file)
    }
}

/// The runtime that is always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinRuntime;

impl ModelRuntime for BuiltinRuntime {
    fn name(&self) -> &str {
        "builtin"
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { toy_models: true, tensor_runtime: false }
    }

    fn load(&self, artifact: &ModelArtifact, ctx: &LoadContext<'_>) -> TrainingResult<LoadedModel> {
        match artifact {
            ModelArtifact::Toy => {
                let tokenizer = ToyTokenizer::from_corpus(ctx.corpus.iter().copied())?;
                let seed = match ctx.role {
                    ModelRole::Student => ctx.seed,
                    ModelRole::Teacher => ctx.seed ^ TEACHER_SEED_SALT,
                };
                let model = ToyCausalLm::new(tokenizer.vocab_size(), seed);
                tracing::debug!(vocab = tokenizer.vocab_size(), role = ?ctx.role, "built toy model");
                Ok(LoadedModel { model: Box::new(model), tokenizer: Box::new(tokenizer) })
            }
            ModelArtifact::ToyCheckpoint { dir } => {
                let tokenizer = ToyTokenizer::load(dir)?;
                let model = ToyCausalLm::load(dir)?;
                if model.vocab_size() != tokenizer.vocab_size() {
                    return Err(TrainingError::UnsupportedFormat(format!(
                        "{}: tokenizer and model vocabularies differ",
                        dir.display()
                    )));
                }
                Ok(LoadedModel { model: Box::new(model), tokenizer: Box::new(tokenizer) })
            }
            other => Err(TrainingError::DependencyMissing(format!(
                "a tensor runtime is required to load {}",
                other.name_or_path()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ops::{cross_entropy, IGNORE_INDEX};
    use crate::runtime::optim::AdamW;
    use tempfile::TempDir;

    #[test]
    fn test_tokenizer_vocab_order_and_unknowns() {
        let tok = ToyTokenizer::from_corpus(["hello world", "world, again"]).unwrap();
        assert_eq!(tok.vocab_size(), 3 + 4);
        assert_eq!(tok.encode("hello world"), vec![3, 4]);
        assert_eq!(tok.encode("world ,"), vec![4, 5]);
        assert_eq!(tok.encode("unseen"), vec![1]);
        assert_eq!(tok.decode(&[3, 2, 4], true), "hello world");
        assert_eq!(tok.decode(&[3, 2], false), "hello <eos>");
        assert!(tok.encode("\n\n").is_empty());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let temp = TempDir::new().unwrap();
        let tok = ToyTokenizer::from_corpus(["a b c"]).unwrap();
        let model = ToyCausalLm::new(tok.vocab_size(), 3);
        model.save_pretrained(temp.path()).unwrap();
        tok.save(temp.path()).unwrap();

        let loaded = BuiltinRuntime
            .load(
                &ModelArtifact::ToyCheckpoint { dir: temp.path().to_path_buf() },
                &LoadContext { role: ModelRole::Student, corpus: &[], max_seq_len: 8, seed: 0 },
            )
            .unwrap();
        assert_eq!(loaded.tokenizer.encode("c a"), tok.encode("c a"));
        assert_eq!(loaded.model.parameters(), model.parameters());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut model = ToyCausalLm::new(5, 11);
        let ids = vec![vec![3u32, 4, 2]];
        let mask = vec![vec![1u8, 1, 1]];
        let labels = vec![vec![IGNORE_INDEX, 4, 2]];

        let logits = model.forward(&ids, &mask).unwrap();
        let mut dlogits = Logits::zeros(1, 3, 5);
        cross_entropy(&logits, &labels, &[1.0], Some((&mut dlogits, 1.0))).unwrap();
        model.backward(&ids, &mask, &dlogits).unwrap();

        let loss_of = |m: &ToyCausalLm| cross_entropy(&m.forward(&ids, &mask).unwrap(), &labels, &[1.0], None).unwrap();
        let eps = 1e-2f32;
        // embedding row of token 3, first few dims
        for idx in [3 * HIDDEN_SIZE, 3 * HIDDEN_SIZE + 1, 4 * HIDDEN_SIZE + 7] {
            let mut plus = model.clone();
            plus.params[0].value[idx] += eps;
            let mut minus = model.clone();
            minus.params[0].value[idx] -= eps;
            let numeric = (loss_of(&plus) - loss_of(&minus)) / (2.0 * f64::from(eps));
            let analytic = f64::from(model.params[0].grad[idx]);
            assert!((numeric - analytic).abs() < 1e-3, "idx {idx}: {numeric} vs {analytic}");
        }
    }

    #[test]
    fn test_few_steps_reduce_loss() {
        let mut model = ToyCausalLm::new(6, 1);
        let ids = vec![vec![3u32, 4, 5, 2]];
        let mask = vec![vec![1u8; 4]];
        let labels = vec![vec![IGNORE_INDEX, 4, 5, 2]];
        let mut opt = AdamW::new(0.0);

        let mut losses = Vec::new();
        for _ in 0..20 {
            let logits = model.forward(&ids, &mask).unwrap();
            let mut grad = Logits::zeros(1, 4, 6);
            losses.push(cross_entropy(&logits, &labels, &[1.0], Some((&mut grad, 1.0))).unwrap());
            model.backward(&ids, &mask, &grad).unwrap();
            opt.step(model.parameters_mut(), 0.05);
            model.zero_grad();
        }
        assert!(losses[19] < losses[0] * 0.5, "{losses:?}");
    }

    #[test]
    fn test_hub_artifacts_need_tensor_runtime() {
        let artifact = ModelArtifact::Pretrained { spec: crate::model::ModelSpec::local("gpt2") };
        assert!(!BuiltinRuntime.supports(&artifact));
        let err = BuiltinRuntime
            .load(&artifact, &LoadContext { role: ModelRole::Student, corpus: &[], max_seq_len: 8, seed: 0 })
            .unwrap_err();
        assert!(matches!(err, TrainingError::DependencyMissing(_)));
    }
}
