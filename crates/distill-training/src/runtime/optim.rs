use super::Parameter;

/// AdamW with decoupled weight decay over a model's trainable parameters.
#[derive(Debug, Clone)]
pub struct AdamW {
    betas: (f64, f64),
    eps: f64,
    weight_decay: f64,
    step: u64,
    moments: Vec<(Vec<f64>, Vec<f64>)>,
}

impl AdamW {
    #[must_use]
    pub fn new(weight_decay: f64) -> Self {
        Self { betas: (0.9, 0.999), eps: 1e-8, weight_decay, step: 0, moments: Vec::new() }
    }

    #[must_use]
    pub const fn with_betas(mut self, betas: (f64, f64)) -> Self {
        self.betas = betas;
        self
    }

    #[must_use]
    pub const fn steps_taken(&self) -> u64 {
        self.step
    }

    /// One update at learning rate `lr`. Frozen parameters are left untouched.
    pub fn step(&mut self, params: &mut [Parameter], lr: f64) {
        if self.moments.len() != params.len() {
            self.moments = params
                .iter()
                .map(|p| (vec![0.0; p.value.len()], vec![0.0; p.value.len()]))
                .collect();
        }
        self.step += 1;
        let (b1, b2) = self.betas;
        let t = i32::try_from(self.step).unwrap_or(i32::MAX);
        let bias1 = 1.0 - b1.powi(t);
        let bias2 = 1.0 - b2.powi(t);

        for (param, (m, v)) in params.iter_mut().zip(self.moments.iter_mut()) {
            if !param.trainable {
                continue;
            }
            for i in 0..param.value.len() {
                let g = f64::from(param.grad[i]);
                let mut w = f64::from(param.value[i]);
                w -= lr * self.weight_decay * w;
                m[i] = b1 * m[i] + (1.0 - b1) * g;
                v[i] = b2 * v[i] + (1.0 - b2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                w -= lr * m_hat / (v_hat.sqrt() + self.eps);
                param.value[i] = w as f32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_lr() {
        let mut params = vec![Parameter::new("w", vec![1.0, -1.0])];
        params[0].grad = vec![0.5, -2.0];
        let mut opt = AdamW::new(0.0);
        opt.step(&mut params, 0.1);
        // Bias-corrected first step is lr * sign(g).
        assert!((params[0].value[0] - 0.9).abs() < 1e-5);
        assert!((params[0].value[1] + 0.9).abs() < 1e-5);
        assert_eq!(opt.steps_taken(), 1);
    }

    #[test]
    fn test_frozen_parameters_untouched() {
        let mut frozen = Parameter::new("base", vec![1.0]);
        frozen.trainable = false;
        frozen.grad = vec![1.0];
        let mut params = vec![frozen];
        AdamW::new(0.1).step(&mut params, 0.5);
        assert_eq!(params[0].value, vec![1.0]);
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let mut params = vec![Parameter::new("w", vec![2.0])];
        AdamW::new(0.5).step(&mut params, 0.1);
        assert!((params[0].value[0] - 1.9).abs() < 1e-5);
    }
}
