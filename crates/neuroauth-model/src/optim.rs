//! Optimization: decoupled-weight-decay Adam, plateau scheduling, gradient
//! clipping.

use serde::{Deserialize, Serialize};

/// Adam with decoupled weight decay over a flat parameter vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    m: Vec<f32>,
    v: Vec<f32>,
    t: u64,
}

impl AdamW {
    /// Creates an optimizer with the given learning rate and weight decay.
    #[must_use]
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Current learning rate.
    #[must_use]
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Set the learning rate (driven by the scheduler).
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// One update step. Decay is decoupled: applied directly to the
    /// parameters, not folded into the gradient.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
            self.t = 0;
        }
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);
        for i in 0..params.len().min(grads.len()) {
            let g = grads[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            params[i] -= self.lr * (m_hat / (v_hat.sqrt() + self.eps) + self.weight_decay * params[i]);
        }
    }

    /// Optimizer state for checkpointing (first moment, second moment, step).
    #[must_use]
    pub fn state(&self) -> (Vec<f32>, Vec<f32>, u64) {
        (self.m.clone(), self.v.clone(), self.t)
    }

    /// Restore checkpointed state.
    pub fn load_state(&mut self, m: Vec<f32>, v: Vec<f32>, t: u64) {
        self.m = m;
        self.v = v;
        self.t = t;
    }
}

/// Reduce-on-plateau learning-rate scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauScheduler {
    factor: f32,
    patience: usize,
    min_lr: f32,
    best: f32,
    bad_epochs: usize,
}

impl PlateauScheduler {
    /// Creates a scheduler that multiplies the rate by `factor` after
    /// `patience` epochs without improvement.
    #[must_use]
    pub fn new(factor: f32, patience: usize, min_lr: f32) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            best: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Observe an epoch's monitored value; returns the new learning rate.
    pub fn step(&mut self, metric: f32, current_lr: f32) -> f32 {
        if metric < self.best - 1e-6 {
            self.best = metric;
            self.bad_epochs = 0;
            current_lr
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs > self.patience {
                self.bad_epochs = 0;
                (current_lr * self.factor).max(self.min_lr)
            } else {
                current_lr
            }
        }
    }

    /// Best monitored value seen so far.
    #[must_use]
    pub fn best(&self) -> f32 {
        self.best
    }
}

/// Clip a flat gradient vector by global L2 norm; returns the pre-clip norm.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grads.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            *g *= scale;
        }
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adamw_minimises_quadratic() {
        let mut params = vec![5.0f32, -3.0];
        let mut optimizer = AdamW::new(0.1, 0.0);
        for _ in 0..200 {
            let grads: Vec<f32> = params.iter().map(|p| 2.0 * p).collect();
            optimizer.step(&mut params, &grads);
        }
        assert!(params.iter().all(|p| p.abs() < 0.1), "params {params:?}");
    }

    #[test]
    fn weight_decay_shrinks_unused_parameters() {
        let mut params = vec![1.0f32];
        let mut optimizer = AdamW::new(0.01, 0.1);
        for _ in 0..100 {
            optimizer.step(&mut params, &[0.0]);
        }
        assert!(params[0] < 1.0, "decay had no effect: {}", params[0]);
    }

    #[test]
    fn state_round_trip() {
        let mut a = AdamW::new(0.01, 0.0);
        let mut params_a = vec![1.0f32, 2.0];
        a.step(&mut params_a, &[0.1, -0.2]);

        let (m, v, t) = a.state();
        let mut b = AdamW::new(0.01, 0.0);
        b.load_state(m, v, t);

        let mut params_b = params_a.clone();
        a.step(&mut params_a, &[0.3, 0.4]);
        b.step(&mut params_b, &[0.3, 0.4]);
        assert_eq!(params_a, params_b);
    }

    #[test]
    fn plateau_scheduler_halves_after_patience() {
        let mut scheduler = PlateauScheduler::new(0.5, 2, 1e-6);
        let mut lr = 1e-3;
        lr = scheduler.step(1.0, lr); // best = 1.0
        lr = scheduler.step(1.1, lr); // bad 1
        lr = scheduler.step(1.2, lr); // bad 2
        assert!((lr - 1e-3).abs() < 1e-9);
        lr = scheduler.step(1.3, lr); // bad 3 > patience → halve
        assert!((lr - 5e-4).abs() < 1e-9);
    }

    #[test]
    fn plateau_scheduler_respects_min_lr() {
        let mut scheduler = PlateauScheduler::new(0.1, 0, 1e-4);
        let mut lr = 1e-3;
        for _ in 0..10 {
            lr = scheduler.step(2.0, lr);
        }
        assert!(lr >= 1e-4);
    }

    #[test]
    fn clip_respects_max_norm() {
        let mut grads = vec![3.0f32, 4.0];
        let norm = clip_grad_norm(&mut grads, 2.5);
        assert!((norm - 5.0).abs() < 1e-6);
        let new_norm = grads.iter().map(|g| g * g).sum::<f32>().sqrt();
        assert!((new_norm - 2.5).abs() < 1e-5);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let mut grads = vec![0.3f32, 0.4];
        clip_grad_norm(&mut grads, 1.0);
        assert_eq!(grads, vec![0.3, 0.4]);
    }
}
