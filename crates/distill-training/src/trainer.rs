//! The optimization loop and the dependency-free stub pipeline.

use crate::encode::{Batch, Collator, EncodedSample};
use crate::error::{TrainingError, TrainingResult};
use crate::events::{Event, EventSink, MetricPayload, ProgressPayload, StubProgress, TrainProgress};
use crate::hyperparams::{DistillParams, TrainingParams};
use crate::layout::CancelMarker;
use crate::mode::{LossPolicy, TrainingMode};
use crate::runtime::ops::{cross_entropy, distillation_kl};
use crate::runtime::optim::AdamW;
use crate::runtime::scheduler::LinearSchedule;
use crate::runtime::{CausalLm, Logits};
use crate::telemetry::ResourceProbe;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::time::{Duration, Instant};

/// Fixed settings for one training run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub run_id: String,
    pub mode: TrainingMode,
    pub training: TrainingParams,
    pub distill: DistillParams,
    pub policy: LossPolicy,
    pub seed: Option<i64>,
    pub emit_every: u64,
}

impl LoopConfig {
    /// Optimizer updates the LR schedule spans.
    #[must_use]
    pub fn total_optimizer_steps(&self, batches_per_epoch: usize) -> u64 {
        let planned = self.training.max_steps.min(self.training.epochs.saturating_mul(batches_per_epoch as u64));
        planned.div_ceil(self.training.grad_accum as u64).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LossTotals {
    loss: f64,
    ce: f64,
    kd: f64,
    count: u64,
}

impl LossTotals {
    fn add(&mut self, loss: f64, ce: f64, kd: f64) {
        self.loss += loss;
        self.ce += ce;
        self.kd += kd;
        self.count += 1;
    }

    fn means(&self) -> (f64, f64, f64) {
        let n = self.count.max(1) as f64;
        (self.loss / n, self.ce / n, self.kd / n)
    }
}

/// Counters and accumulators owned by the loop.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub global_step: u64,
    pub optim_step: u64,
    pub epoch: u64,
    pub alpha: f64,
    cumulative: LossTotals,
    running: LossTotals,
}

impl RunState {
    fn record(&mut self, loss: f64, ce: f64, kd: f64) {
        self.cumulative.add(loss, ce, kd);
        self.running.add(loss, ce, kd);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub steps: u64,
    pub optimizer_steps: u64,
    pub train_loss: f64,
    pub train_ce_loss: f64,
    pub train_kd_loss: f64,
    pub val_loss: Option<f64>,
}

/// Losses of one micro-step, before accumulation scaling.
struct StepLoss {
    loss: f64,
    ce: f64,
    kd: f64,
}

pub struct TrainLoop<'a> {
    config: &'a LoopConfig,
    sink: &'a dyn EventSink,
    cancel: &'a CancelMarker,
    probe: &'a mut dyn ResourceProbe,
}

impl<'a> TrainLoop<'a> {
    pub fn new(
        config: &'a LoopConfig,
        sink: &'a dyn EventSink,
        cancel: &'a CancelMarker,
        probe: &'a mut dyn ResourceProbe,
    ) -> Self {
        Self { config, sink, cancel, probe }
    }

    /// Train `student` on `train`, then score `val` once without updates.
    pub fn run(
        &mut self,
        student: &mut dyn CausalLm,
        teacher: Option<&dyn CausalLm>,
        collator: Collator,
        train: &[EncodedSample],
        val: &[EncodedSample],
    ) -> TrainingResult<TrainOutcome> {
        if train.is_empty() {
            return Err(TrainingError::Dataset("No training samples found (split=train)".to_string()));
        }
        let cfg = self.config;
        let params = &cfg.training;
        let teacher = teacher.filter(|_| cfg.policy.needs_teacher_logits());

        let batches_per_epoch = train.len().div_ceil(params.batch_size);
        let total_optim = cfg.total_optimizer_steps(batches_per_epoch);
        let schedule = LinearSchedule::new(params.learning_rate, params.warmup_steps, total_optim);
        let mut optimizer = AdamW::new(params.weight_decay);
        let mut rng = match cfg.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed as u64),
            None => ChaCha8Rng::from_entropy(),
        };

        tracing::info!(
            run_id = %cfg.run_id,
            mode = %cfg.mode,
            samples = train.len(),
            batches_per_epoch,
            max_steps = params.max_steps,
            total_optim,
            "starting optimization"
        );

        let started = Instant::now();
        let mut state = RunState::default();
        student.zero_grad();

        'epochs: for epoch in 0..params.epochs {
            state.epoch = epoch + 1;
            let mut order: Vec<usize> = (0..train.len()).collect();
            order.shuffle(&mut rng);

            for batch in collator.batches(train, &order, params.batch_size) {
                if state.global_step >= params.max_steps {
                    break 'epochs;
                }
                self.cancel.check()?;

                state.alpha = cfg.distill.schedule.alpha(cfg.mode, state.global_step);
                state.global_step += 1;
                let step = self.micro_step(student, teacher, &batch, state.alpha)?;
                state.record(step.loss, step.ce, step.kd);

                if state.global_step % params.grad_accum as u64 == 0 {
                    let lr = schedule.get_lr(state.optim_step);
                    optimizer.step(student.parameters_mut(), lr);
                    student.zero_grad();
                    state.optim_step += 1;
                }

                if state.global_step % cfg.emit_every.max(1) == 0 {
                    self.emit_progress(&state, schedule.get_lr(state.optim_step), started.elapsed());
                    state.running = LossTotals::default();
                }
            }
        }

        self.cancel.check()?;
        let val_loss = if val.is_empty() { None } else { Some(self.validate(student, collator, val)?) };
        if let Some(value) = val_loss {
            self.sink.emit(Event::Metric(MetricPayload {
                name: "val_loss".to_string(),
                value,
                run_id: Some(cfg.run_id.clone()),
                eval_id: None,
            }));
        }

        let (train_loss, train_ce_loss, train_kd_loss) = state.cumulative.means();
        tracing::info!(
            run_id = %cfg.run_id,
            steps = state.global_step,
            optimizer_steps = state.optim_step,
            train_loss,
            "optimization finished"
        );
        Ok(TrainOutcome {
            steps: state.global_step,
            optimizer_steps: state.optim_step,
            train_loss,
            train_ce_loss,
            train_kd_loss,
            val_loss,
        })
    }

    fn micro_step(
        &self,
        student: &mut dyn CausalLm,
        teacher: Option<&dyn CausalLm>,
        batch: &Batch,
        alpha: f64,
    ) -> TrainingResult<StepLoss> {
        let cfg = self.config;
        let accum = cfg.training.grad_accum as f64;
        let weights = cfg.policy.weights(alpha);

        let logits = student.forward(&batch.input_ids, &batch.attention_mask)?;
        let mut dlogits = Logits::zeros(logits.batch, logits.seq_len, logits.vocab);
        let ce = cross_entropy(&logits, &batch.labels, &batch.weights, Some((&mut dlogits, weights.ce / accum)))?;

        let kd = match teacher {
            Some(teacher) if weights.kd > 0.0 => {
                let teacher_logits = teacher.forward(&batch.input_ids, &batch.attention_mask)?;
                distillation_kl(
                    &logits,
                    &teacher_logits,
                    &batch.labels,
                    &batch.weights,
                    cfg.distill.temperature,
                    Some((&mut dlogits, weights.kd / accum)),
                )?
            }
            _ => 0.0,
        };

        let loss = cfg.policy.blend(alpha, ce, kd);
        if !loss.is_finite() {
            return Err(TrainingError::Trainer(format!("non-finite loss at alpha {alpha}")));
        }
        student.backward(&batch.input_ids, &batch.attention_mask, &dlogits)?;
        Ok(StepLoss { loss, ce, kd })
    }

    /// Mean supervised loss over in-order validation batches.
    fn validate(&self, student: &dyn CausalLm, collator: Collator, val: &[EncodedSample]) -> TrainingResult<f64> {
        let order: Vec<usize> = (0..val.len()).collect();
        let batches = collator.batches(val, &order, self.config.training.batch_size);
        let mut total = 0.0;
        for batch in &batches {
            let logits = student.forward(&batch.input_ids, &batch.attention_mask)?;
            total += cross_entropy(&logits, &batch.labels, &batch.weights, None)?;
        }
        Ok(total / batches.len().max(1) as f64)
    }

    fn emit_progress(&mut self, state: &RunState, lr: f64, elapsed: Duration) {
        let cfg = self.config;
        let (loss, ce_loss, kd_loss) = state.running.means();
        self.sink.emit(Event::Progress(ProgressPayload::Train(TrainProgress {
            run_id: cfg.run_id.clone(),
            epoch: state.epoch,
            step: state.global_step,
            optim_step: state.optim_step,
            total_steps: cfg.training.max_steps,
            loss,
            ce_loss,
            kd_loss,
            alpha: state.alpha,
            temperature: cfg.distill.temperature,
            lr,
            mode: cfg.mode.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            resources: self.probe.snapshot().unwrap_or_default(),
        })));
    }
}

const STUB_INITIAL_LOSS: f64 = 2.0;
const STUB_DECAY: f64 = 0.985;
const STUB_FLOOR: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StubOutcome {
    pub steps: u64,
    pub final_loss: f64,
}

/// Synthetic progress for hosts without a tensor runtime.
pub fn run_stub(
    run_id: &str,
    mode: TrainingMode,
    steps: u64,
    emit_every: u64,
    step_delay: Duration,
    sink: &dyn EventSink,
    cancel: &CancelMarker,
) -> TrainingResult<StubOutcome> {
    let started = Instant::now();
    let emit_every = emit_every.max(1);
    let mut loss = STUB_INITIAL_LOSS;

    for step in 1..=steps {
        cancel.check()?;
        loss = (loss * STUB_DECAY).max(STUB_FLOOR);
        if step % emit_every == 0 {
            sink.emit(Event::Progress(ProgressPayload::Stub(StubProgress {
                run_id: run_id.to_string(),
                step,
                total_steps: steps,
                loss: round6(loss),
                mode: mode.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })));
        }
        if !step_delay.is_zero() {
            std::thread::sleep(step_delay);
        }
    }
    Ok(StubOutcome { steps, final_loss: loss })
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Encoder;
    use crate::events::MemorySink;
    use crate::hyperparams::HyperParams;
    use crate::layout::RunLayout;
    use crate::mode::{check_vocab, AlphaSchedule, TeacherState};
    use crate::runtime::toy::{ToyCausalLm, ToyTokenizer};
    use crate::runtime::Tokenizer;
    use crate::telemetry::NullProbe;
    use tempfile::TempDir;

    fn config(mode: TrainingMode, teacher: &TeacherState, max_steps: u64) -> LoopConfig {
        let hp = HyperParams::new(
            serde_json::json!({"lr": 0.05, "batch_size": 2, "epochs": 50})
                .as_object()
                .cloned()
                .unwrap(),
        );
        LoopConfig {
            run_id: "r1".to_string(),
            mode,
            training: hp.training(max_steps).unwrap(),
            distill: hp.distillation().unwrap(),
            policy: LossPolicy::new(mode, teacher),
            seed: Some(7),
            emit_every: 5,
        }
    }

    fn corpus() -> (ToyTokenizer, Vec<EncodedSample>) {
        let pairs = [("red", "apple"), ("yellow", "banana"), ("green", "lime"), ("purple", "grape")];
        let texts: Vec<&str> = pairs.iter().flat_map(|(p, t)| [*p, *t]).collect();
        let tok = ToyTokenizer::from_corpus(texts).unwrap();
        let enc = Encoder::new(&tok, "\n\n", 16, true);
        let samples = pairs.iter().map(|(p, t)| enc.encode_pair(p, t, 1.0)).collect();
        (tok, samples)
    }

    #[test]
    fn test_total_optimizer_steps() {
        let mut cfg = config(TrainingMode::FineTune, &TeacherState::NotRequested, 10);
        cfg.training.grad_accum = 4;
        assert_eq!(cfg.total_optimizer_steps(100), 3);
        cfg.training.epochs = 1;
        assert_eq!(cfg.total_optimizer_steps(2), 1);
        assert_eq!(cfg.total_optimizer_steps(0), 1);
    }

    #[test]
    fn test_fine_tune_reduces_loss_and_caps_steps() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let (tok, samples) = corpus();
        let mut student = ToyCausalLm::new(tok.vocab_size(), 1);
        let cfg = config(TrainingMode::FineTune, &TeacherState::NotRequested, 60);

        let outcome = TrainLoop::new(&cfg, &sink, &cancel, &mut probe)
            .run(&mut student, None, Collator::new(tok.pad_id()), &samples, &samples[..1])
            .unwrap();

        assert_eq!(outcome.steps, 60);
        assert_eq!(outcome.optimizer_steps, 60);
        assert_eq!(outcome.train_kd_loss, 0.0);
        let progress = sink.payloads("progress");
        assert_eq!(progress.len(), 12);
        let first = progress[0]["loss"].as_f64().unwrap();
        let last = progress[11]["loss"].as_f64().unwrap();
        assert!(last < first, "loss did not decrease: {first} -> {last}");
        assert_eq!(progress[11]["step"], 60);
        assert_eq!(progress[0]["alpha"], 0.0);
        assert!(outcome.val_loss.is_some());
        assert_eq!(sink.payloads("metric")[0]["name"], "val_loss");
    }

    #[test]
    fn test_distillation_with_usable_teacher_reports_kd() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let (tok, samples) = corpus();
        let mut student = ToyCausalLm::new(tok.vocab_size(), 1);
        let teacher = ToyCausalLm::new(tok.vocab_size(), 2);
        let state = check_vocab(teacher.vocab_size(), student.vocab_size());
        let cfg = config(TrainingMode::KnowledgeDistillation, &state, 10);

        let outcome = TrainLoop::new(&cfg, &sink, &cancel, &mut probe)
            .run(&mut student, Some(&teacher), Collator::new(tok.pad_id()), &samples, &[])
            .unwrap();
        assert!(outcome.train_kd_loss > 0.0);
        assert!((outcome.train_loss - outcome.train_kd_loss).abs() < 1e-12);
        assert!(outcome.val_loss.is_none());
    }

    #[test]
    fn test_alpha_warmup_starts_at_alpha_start() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let (tok, samples) = corpus();
        let mut student = ToyCausalLm::new(tok.vocab_size(), 1);
        let teacher = ToyCausalLm::new(tok.vocab_size(), 2);
        let mut cfg = config(TrainingMode::Hybrid, &TeacherState::Usable, 5);
        cfg.distill.schedule = AlphaSchedule { start: 0.2, end: 0.6, warmup_steps: 4 };
        cfg.emit_every = 1;

        TrainLoop::new(&cfg, &sink, &cancel, &mut probe)
            .run(&mut student, Some(&teacher), Collator::new(tok.pad_id()), &samples, &[])
            .unwrap();

        let alphas: Vec<f64> = sink.payloads("progress").iter().map(|p| p["alpha"].as_f64().unwrap()).collect();
        let expected = [0.2, 0.3, 0.4, 0.5, 0.6];
        assert_eq!(alphas.len(), expected.len());
        for (got, want) in alphas.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{alphas:?}");
        }
    }

    #[test]
    fn test_grad_accumulation_counts_updates() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let (tok, samples) = corpus();
        let mut student = ToyCausalLm::new(tok.vocab_size(), 1);
        let mut cfg = config(TrainingMode::FineTune, &TeacherState::NotRequested, 7);
        cfg.training.grad_accum = 3;

        let outcome = TrainLoop::new(&cfg, &sink, &cancel, &mut probe)
            .run(&mut student, None, Collator::new(tok.pad_id()), &samples, &[])
            .unwrap();
        assert_eq!(outcome.steps, 7);
        assert_eq!(outcome.optimizer_steps, 2);
    }

    #[test]
    fn test_cancel_marker_stops_before_first_batch() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path());
        std::fs::write(layout.cancel_flag_path(), "").unwrap();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let (tok, samples) = corpus();
        let mut student = ToyCausalLm::new(tok.vocab_size(), 1);
        let before = student.parameters().to_vec();
        let cfg = config(TrainingMode::FineTune, &TeacherState::NotRequested, 10);

        let err = TrainLoop::new(&cfg, &sink, &layout.cancel_marker(), &mut probe)
            .run(&mut student, None, Collator::new(tok.pad_id()), &samples, &[])
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(student.parameters(), before.as_slice());
        assert!(sink.payloads("progress").is_empty());
    }

    #[test]
    fn test_empty_train_split_is_fatal() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let mut probe = NullProbe;
        let mut student = ToyCausalLm::new(4, 1);
        let cfg = config(TrainingMode::FineTune, &TeacherState::NotRequested, 10);
        let err = TrainLoop::new(&cfg, &sink, &cancel, &mut probe)
            .run(&mut student, None, Collator::new(None), &[], &[])
            .unwrap_err();
        assert!(err.to_string().contains("No training samples found"));
    }

    #[test]
    fn test_stub_progress_cadence_and_floor() {
        let temp = TempDir::new().unwrap();
        let cancel = RunLayout::new(temp.path()).cancel_marker();
        let sink = MemorySink::new();
        let outcome =
            run_stub("r1", TrainingMode::Hybrid, 400, 100, Duration::ZERO, &sink, &cancel).unwrap();
        assert_eq!(outcome.steps, 400);
        assert!((outcome.final_loss - STUB_FLOOR).abs() < 1e-12);

        let progress = sink.payloads("progress");
        assert_eq!(progress.len(), 4);
        assert_eq!(progress[0]["step"], 100);
        assert_eq!(progress[0]["total_steps"], 400);
        assert_eq!(progress[0]["mode"], "hybrid");
        assert!(progress[0].get("ce_loss").is_none());
    }
}
