//! Loss kernels over [`Logits`].
//!
//! Labels follow the causal-LM convention: position `t` predicts `labels[t + 1]`,
//! and [`IGNORE_INDEX`] masks a position out of every loss.

use super::Logits;
use crate::error::{TrainingError, TrainingResult};
use rand::Rng;

pub const IGNORE_INDEX: i64 = -100;

const MIN_WEIGHT_TOTAL: f64 = 1e-9;

/// Gradient destination plus the coefficient the loss is scaled by.
pub type GradOut<'a> = Option<(&'a mut Logits, f64)>;

#[must_use]
pub fn log_softmax(row: &[f32], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = row.iter().map(|&x| f64::from(x) / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lse = max + scaled.iter().map(|x| (x - max).exp()).sum::<f64>().ln();
    scaled.into_iter().map(|x| x - lse).collect()
}

#[must_use]
pub fn softmax(row: &[f32], temperature: f64) -> Vec<f64> {
    log_softmax(row, temperature).into_iter().map(f64::exp).collect()
}

#[must_use]
pub fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
        .0
}

/// Nucleus sampling at `temperature`.
pub fn sample_top_p<R: Rng>(row: &[f32], temperature: f64, top_p: f64, rng: &mut R) -> usize {
    let probs = softmax(row, temperature);
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut kept = Vec::new();
    let mut mass = 0.0;
    for idx in order {
        kept.push(idx);
        mass += probs[idx];
        if mass >= top_p {
            break;
        }
    }

    let mut r = rng.gen_range(0.0..mass.max(f64::MIN_POSITIVE));
    for &idx in &kept {
        r -= probs[idx];
        if r <= 0.0 {
            return idx;
        }
    }
    kept.last().copied().unwrap_or(0)
}

/// `(position, target)` pairs that carry a real label.
fn shifted_targets(labels: &[i64]) -> Vec<(usize, i64)> {
    labels
        .iter()
        .skip(1)
        .enumerate()
        .filter(|(_, y)| **y != IGNORE_INDEX)
        .map(|(t, y)| (t, *y))
        .collect()
}

fn check_batch(logits: &Logits, labels: &[Vec<i64>], weights: &[f64]) -> TrainingResult<()> {
    if labels.len() != logits.batch || weights.len() != logits.batch {
        return Err(TrainingError::Trainer(format!(
            "batch mismatch: logits {} labels {} weights {}",
            logits.batch,
            labels.len(),
            weights.len()
        )));
    }
    if let Some(bad) = labels.iter().find(|l| l.len() != logits.seq_len) {
        return Err(TrainingError::Trainer(format!(
            "label length {} does not match sequence length {}",
            bad.len(),
            logits.seq_len
        )));
    }
    Ok(())
}

/// Supervised loss: token cross entropy averaged per sequence, then weight-averaged over the batch.
pub fn cross_entropy(
    logits: &Logits,
    labels: &[Vec<i64>],
    weights: &[f64],
    mut grad: GradOut<'_>,
) -> TrainingResult<f64> {
    check_batch(logits, labels, weights)?;
    let w_total = weights.iter().sum::<f64>().max(MIN_WEIGHT_TOTAL);

    let mut loss = 0.0;
    for (b, row_labels) in labels.iter().enumerate() {
        let targets = shifted_targets(row_labels);
        let n = targets.len().max(1) as f64;
        let mut seq_loss = 0.0;
        for (t, y) in targets {
            let y = usize::try_from(y)
                .ok()
                .filter(|&y| y < logits.vocab)
                .ok_or_else(|| TrainingError::Trainer(format!("label {y} outside vocabulary")))?;
            let lp = log_softmax(logits.row(b, t), 1.0);
            seq_loss -= lp[y];
            if let Some((g, scale)) = grad.as_mut() {
                let coef = *scale * weights[b] / (w_total * n);
                for (v, out) in g.row_mut(b, t).iter_mut().enumerate() {
                    let onehot = if v == y { 1.0 } else { 0.0 };
                    *out += (coef * (lp[v].exp() - onehot)) as f32;
                }
            }
        }
        loss += weights[b] * seq_loss / n;
    }
    Ok(loss / w_total)
}

/// Distillation loss: `T² · KL(teacher_T || student_T)` over labelled positions,
/// with the same per-sequence and per-weight averaging as [`cross_entropy`].
pub fn distillation_kl(
    student: &Logits,
    teacher: &Logits,
    labels: &[Vec<i64>],
    weights: &[f64],
    temperature: f64,
    mut grad: GradOut<'_>,
) -> TrainingResult<f64> {
    check_batch(student, labels, weights)?;
    if !student.same_shape(teacher) {
        return Err(TrainingError::Trainer("teacher and student logits differ in shape".to_string()));
    }
    let w_total = weights.iter().sum::<f64>().max(MIN_WEIGHT_TOTAL);

    let mut loss = 0.0;
    for (b, row_labels) in labels.iter().enumerate() {
        let targets = shifted_targets(row_labels);
        let n = targets.len().max(1) as f64;
        let mut seq_kl = 0.0;
        for (t, _) in targets {
            let ls = log_softmax(student.row(b, t), temperature);
            let lt = log_softmax(teacher.row(b, t), temperature);
            seq_kl += lt
                .iter()
                .zip(&ls)
                .map(|(pt_log, ps_log)| {
                    let p = pt_log.exp();
                    if p > 0.0 { p * (pt_log - ps_log) } else { 0.0 }
                })
                .sum::<f64>();
            if let Some((g, scale)) = grad.as_mut() {
                let coef = *scale * weights[b] / (w_total * n) * temperature;
                for (v, out) in g.row_mut(b, t).iter_mut().enumerate() {
                    *out += (coef * (ls[v].exp() - lt[v].exp())) as f32;
                }
            }
        }
        loss += weights[b] * seq_kl / n;
    }
    Ok(loss / w_total * temperature * temperature)
}
