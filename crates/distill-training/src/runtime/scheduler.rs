/// Linear warm-up from zero to the base rate, then linear decay to zero at `total_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
}

impl LinearSchedule {
    #[must_use]
    pub const fn new(base_lr: f64, warmup_steps: u64, total_steps: u64) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }

    /// Learning rate after `step` optimizer updates.
    #[must_use]
    pub fn get_lr(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(step);
        self.base_lr * (remaining as f64 / decay_steps as f64).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_decay() {
        let s = LinearSchedule::new(1.0, 2, 6);
        assert_eq!(s.get_lr(0), 0.0);
        assert_eq!(s.get_lr(1), 0.5);
        assert_eq!(s.get_lr(2), 1.0);
        assert_eq!(s.get_lr(4), 0.5);
        assert_eq!(s.get_lr(6), 0.0);
        assert_eq!(s.get_lr(9), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let s = LinearSchedule::new(0.1, 0, 10);
        assert!((s.get_lr(0) - 0.1).abs() < 1e-12);
        assert!((s.get_lr(5) - 0.05).abs() < 1e-12);
    }
}
