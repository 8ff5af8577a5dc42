//! Prompt/target encoding and batch collation.

use crate::dataset::TrainingSample;
use crate::runtime::ops::IGNORE_INDEX;
use crate::runtime::Tokenizer;

/// One tokenized example. Prompt and separator positions carry [`IGNORE_INDEX`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSample {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
    pub weight: f64,
}

pub struct Encoder<'a> {
    tokenizer: &'a dyn Tokenizer,
    separator: &'a str,
    max_seq_len: usize,
    add_eos: bool,
}

impl<'a> Encoder<'a> {
    #[must_use]
    pub fn new(tokenizer: &'a dyn Tokenizer, separator: &'a str, max_seq_len: usize, add_eos: bool) -> Self {
        Self { tokenizer, separator, max_seq_len: max_seq_len.max(1), add_eos }
    }

    #[must_use]
    pub fn encode(&self, sample: &TrainingSample) -> EncodedSample {
        self.encode_pair(&sample.prompt, &sample.target, sample.weight)
    }

    #[must_use]
    pub fn encode_pair(&self, prompt: &str, target: &str, weight: f64) -> EncodedSample {
        let mut prefix = self.tokenizer.encode(prompt);
        prefix.extend(self.tokenizer.encode(self.separator));
        let mut target_ids = self.tokenizer.encode(target);
        if self.add_eos {
            if let Some(eos) = self.tokenizer.eos_id() {
                target_ids.push(eos);
            }
        }

        let max = self.max_seq_len;
        if prefix.len() + target_ids.len() > max {
            if target_ids.len() >= max {
                target_ids.truncate(max);
                prefix.clear();
            } else {
                let keep = max - target_ids.len();
                prefix.drain(..prefix.len() - keep);
            }
        }

        let labels = std::iter::repeat_n(IGNORE_INDEX, prefix.len())
            .chain(target_ids.iter().map(|&id| i64::from(id)))
            .collect();
        prefix.extend(target_ids);
        EncodedSample { input_ids: prefix, labels, weight }
    }
}

/// A padded batch ready for `forward`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
    pub labels: Vec<Vec<i64>>,
    pub weights: Vec<f64>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Pads each batch to its own longest sequence.
#[derive(Debug, Clone, Copy)]
pub struct Collator {
    pad_id: u32,
}

impl Collator {
    /// Tokenizers without a pad token pad with id 0.
    #[must_use]
    pub fn new(pad_id: Option<u32>) -> Self {
        Self { pad_id: pad_id.unwrap_or(0) }
    }

    #[must_use]
    pub fn collate(&self, items: &[&EncodedSample]) -> Batch {
        let width = items.iter().map(|s| s.input_ids.len()).max().unwrap_or(0);
        let mut batch = Batch::default();
        for item in items {
            let pad = width - item.input_ids.len();
            let mut ids = item.input_ids.clone();
            ids.extend(std::iter::repeat_n(self.pad_id, pad));
            let mut mask = vec![1u8; item.input_ids.len()];
            mask.extend(std::iter::repeat_n(0u8, pad));
            let mut labels = item.labels.clone();
            labels.extend(std::iter::repeat_n(IGNORE_INDEX, pad));

            batch.input_ids.push(ids);
            batch.attention_mask.push(mask);
            batch.labels.push(labels);
            batch.weights.push(item.weight);
        }
        batch
    }

    /// Consecutive batches of at most `batch_size`, in the order given by `order`.
    #[must_use]
    pub fn batches(&self, samples: &[EncodedSample], order: &[usize], batch_size: usize) -> Vec<Batch> {
        order
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let items: Vec<&EncodedSample> = chunk.iter().filter_map(|&i| samples.get(i)).collect();
                self.collate(&items)
            })
            .collect()
    }
}
