//! Model runtime contract.
//!
//! The job pipeline only talks to models through [`CausalLm`], [`Tokenizer`]
//! and [`ModelRuntime`]. The crate ships one implementation, the built-in toy
//! runtime; hub-format weights need an external tensor runtime plugged in
//! behind the same traits.

pub mod ops;
pub mod optim;
pub mod scheduler;
pub mod toy;

use crate::error::{TrainingError, TrainingResult};
use crate::events::ParamCounts;
use crate::model::lora::LoraPlan;
use crate::model::ModelArtifact;
use rand::Rng;
use serde::Serialize;
use std::path::Path;

pub use toy::BuiltinRuntime;

/// What the active runtime can do. Probed once per job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Self-contained toy models and their checkpoints.
    pub toy_models: bool,
    /// Hub-format weights, adapters and hub ids.
    pub tensor_runtime: bool,
}

/// Dense `[batch][seq_len][vocab]` scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    pub batch: usize,
    pub seq_len: usize,
    pub vocab: usize,
    pub data: Vec<f32>,
}

impl Logits {
    #[must_use]
    pub fn zeros(batch: usize, seq_len: usize, vocab: usize) -> Self {
        Self { batch, seq_len, vocab, data: vec![0.0; batch * seq_len * vocab] }
    }

    #[must_use]
    pub fn row(&self, b: usize, t: usize) -> &[f32] {
        let start = (b * self.seq_len + t) * self.vocab;
        &self.data[start..start + self.vocab]
    }

    pub fn row_mut(&mut self, b: usize, t: usize) -> &mut [f32] {
        let start = (b * self.seq_len + t) * self.vocab;
        &mut self.data[start..start + self.vocab]
    }

    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.batch == other.batch && self.seq_len == other.seq_len && self.vocab == other.vocab
    }
}

/// A named weight buffer with its gradient accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
    pub trainable: bool,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self { name: name.into(), value, grad, trainable: true }
    }
}

pub trait Tokenizer: Send {
    /// Token ids without special tokens.
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, ids: &[u32], skip_special: bool) -> String;
    fn vocab_size(&self) -> usize;
    fn pad_id(&self) -> Option<u32>;
    fn eos_id(&self) -> Option<u32>;
    fn save(&self, dir: &Path) -> TrainingResult<()>;
}

/// Decoder-only language model with explicit gradient buffers.
pub trait CausalLm: Send {
    fn vocab_size(&self) -> usize;

    /// Dotted sub-module names, used for adapter target inference.
    fn module_names(&self) -> Vec<String>;

    fn parameters(&self) -> &[Parameter];
    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn forward(&self, input_ids: &[Vec<u32>], attention_mask: &[Vec<u8>]) -> TrainingResult<Logits>;

    /// Accumulate parameter gradients for `dlogits`, the loss gradient w.r.t. the last forward's output.
    fn backward(&mut self, input_ids: &[Vec<u32>], attention_mask: &[Vec<u8>], dlogits: &Logits)
    -> TrainingResult<()>;

    fn save_pretrained(&self, dir: &Path) -> TrainingResult<()>;

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.grad.fill(0.0);
        }
    }

    /// Wrap target modules with adapters. `false` when unsupported.
    fn attach_lora(&mut self, _plan: &LoraPlan) -> bool {
        false
    }

    /// Save adapter weights only. `Ok(false)` when no adapter is attached.
    fn save_adapter(&self, _dir: &Path) -> TrainingResult<bool> {
        Ok(false)
    }

    /// Fold adapters into the base and save the full model. `Ok(false)` when no adapter is attached.
    fn save_merged(&self, _dir: &Path) -> TrainingResult<bool> {
        Ok(false)
    }

    fn device(&self) -> String {
        "cpu".to_string()
    }

    fn param_counts(&self) -> ParamCounts {
        let params = self.parameters();
        ParamCounts {
            trainable: params.iter().filter(|p| p.trainable).map(|p| p.value.len()).sum(),
            total: params.iter().map(|p| p.value.len()).sum(),
        }
    }
}

/// A model and the tokenizer that goes with it.
pub struct LoadedModel {
    pub model: Box<dyn CausalLm>,
    pub tokenizer: Box<dyn Tokenizer>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("vocab_size", &self.model.vocab_size())
            .field("tokenizer_vocab", &self.tokenizer.vocab_size())
            .finish()
    }
}

/// Which side of the distillation pair a model is loaded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Student,
    Teacher,
}

/// Inputs a runtime may need to materialize a model.
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    pub role: ModelRole,
    /// Texts a synthetic vocabulary is built from.
    pub corpus: &'a [&'a str],
    pub max_seq_len: usize,
    pub seed: u64,
}

pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> String;
    fn capabilities(&self) -> Capabilities;

    /// Whether `artifact` can be loaded by this runtime.
    fn supports(&self, artifact: &ModelArtifact) -> bool {
        let caps = self.capabilities();
        if artifact.requires_tensor_runtime() { caps.tensor_runtime } else { caps.toy_models }
    }

    fn load(&self, artifact: &ModelArtifact, ctx: &LoadContext<'_>) -> TrainingResult<LoadedModel>;
}

/// Decoding settings for evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// `0.0` means greedy.
    pub temperature: f64,
    pub top_p: f64,
}

/// Autoregressive generation. Returns the decoded continuation only.
pub fn generate<R: Rng>(
    model: &dyn CausalLm,
    tokenizer: &dyn Tokenizer,
    prompt: &str,
    config: &GenerationConfig,
    rng: &mut R,
) -> TrainingResult<String> {
    let mut ids = tokenizer.encode(prompt);
    let prompt_len = ids.len();
    if ids.is_empty() {
        // Seed the context so the model has something to condition on.
        let start = tokenizer.eos_id().or(tokenizer.pad_id()).unwrap_or(0);
        ids.push(start);
    }
    let context_start = ids.len();

    for _ in 0..config.max_new_tokens {
        let mask = vec![vec![1u8; ids.len()]];
        let logits = model.forward(std::slice::from_ref(&ids), &mask)?;
        let last = logits.row(0, ids.len() - 1);
        let next = if config.temperature <= 0.0 {
            ops::argmax(last)
        } else {
            ops::sample_top_p(last, config.temperature, config.top_p, rng)
        };
        let next = u32::try_from(next).map_err(|_| TrainingError::Trainer("token id overflow".to_string()))?;
        if Some(next) == tokenizer.eos_id() {
            break;
        }
        ids.push(next);
    }

    let generated = &ids[context_start.max(prompt_len)..];
    let text = tokenizer.decode(generated, true);
    Ok(strip_prompt(prompt, &text))
}

/// Drop an echoed prompt from the front of a decoded output.
#[must_use]
pub fn strip_prompt(prompt: &str, output: &str) -> String {
    output.strip_prefix(prompt).unwrap_or(output).trim().to_string()
}
