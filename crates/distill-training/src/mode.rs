//! Training modes and the loss-blending policy.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    FineTune,
    KnowledgeDistillation,
    Hybrid,
}

impl TrainingMode {
    pub fn parse(value: &str) -> TrainingResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fine_tune" => Ok(Self::FineTune),
            "knowledge_distillation" => Ok(Self::KnowledgeDistillation),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(TrainingError::config(format!("Unsupported mode: {other}"))),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FineTune => "fine_tune",
            Self::KnowledgeDistillation => "knowledge_distillation",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether this mode ever wants a teacher.
    #[must_use]
    pub const fn uses_teacher(self) -> bool {
        !matches!(self, Self::FineTune)
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear warm-up of the mixing coefficient from `start` to `end`, then held.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaSchedule {
    pub start: f64,
    pub end: f64,
    pub warmup_steps: u64,
}

impl AlphaSchedule {
    #[must_use]
    pub fn alpha(&self, mode: TrainingMode, step: u64) -> f64 {
        if mode == TrainingMode::FineTune {
            return 0.0;
        }
        let value = if self.warmup_steps == 0 {
            self.end
        } else {
            let t = (step as f64 / self.warmup_steps as f64).min(1.0);
            self.start + (self.end - self.start) * t
        };
        value.clamp(0.0, 1.0)
    }
}

/// Why distillation is not applied for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeacherState {
    /// A live teacher with a matching output vocabulary.
    Usable,
    /// Mode never asked for one.
    NotRequested,
    /// No teacher could be loaded (api-backed, missing, skipped, or cached labels in use).
    Unavailable,
    VocabMismatch { teacher: usize, student: usize },
}

/// Per-run decision on how supervised and distillation losses combine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossPolicy {
    pub mode: TrainingMode,
    pub teacher_usable: bool,
}

/// Coefficients applied to the supervised and distillation terms for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub ce: f64,
    pub kd: f64,
}

impl LossPolicy {
    #[must_use]
    pub fn new(mode: TrainingMode, teacher: &TeacherState) -> Self {
        Self {
            mode,
            teacher_usable: mode.uses_teacher() && *teacher == TeacherState::Usable,
        }
    }

    /// Whether the distillation term has to be computed at all.
    #[must_use]
    pub const fn needs_teacher_logits(&self) -> bool {
        self.teacher_usable
    }

    #[must_use]
    pub fn weights(&self, alpha: f64) -> LossWeights {
        match (self.mode, self.teacher_usable) {
            (TrainingMode::FineTune, _) | (TrainingMode::KnowledgeDistillation, false) => {
                LossWeights { ce: 1.0, kd: 0.0 }
            }
            (TrainingMode::KnowledgeDistillation, true) => LossWeights { ce: 0.0, kd: 1.0 },
            (TrainingMode::Hybrid, true) => LossWeights { ce: 1.0 - alpha, kd: alpha },
            // (1 - a)·ce + a·ce
            (TrainingMode::Hybrid, false) => LossWeights { ce: 1.0, kd: 0.0 },
        }
    }

    #[must_use]
    pub fn blend(&self, alpha: f64, ce: f64, kd: f64) -> f64 {
        let w = self.weights(alpha);
        w.ce * ce + w.kd * kd
    }
}

/// Teacher usability check on output-vocabulary size.
#[must_use]
pub fn check_vocab(teacher: usize, student: usize) -> TeacherState {
    if teacher == student {
        TeacherState::Usable
    } else {
        TeacherState::VocabMismatch { teacher, student }
    }
}
