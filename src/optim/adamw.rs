//! AdamW optimizer (Adam with decoupled Weight decay)

use super::optimizer::{ensure_consumed, f32_array, take_slot, Optimizer, WeightDecayMask};
use super::scheduler::{LRScheduler, WarmupCosine};
use crate::error::{Error, Result};
use crate::tree::{join_path, Leaf, ParameterTree};
use ndarray::{ArrayD, Zip};

/// AdamW optimizer
///
/// Keeps two slots per parameter, `mu` (first moment) and `nu` (second
/// moment). With t = step + 1:
///
/// - m_t = β1 * m_{t-1} + (1 - β1) * g
/// - v_t = β2 * v_{t-1} + (1 - β2) * g²
/// - u_t = -lr_t * (m̂_t / (√v̂_t + ε) + λ * θ_{t-1})
///
/// where m̂_t = m_t / (1 - β1^t), v̂_t = v_t / (1 - β2^t), and λ is zero for
/// parameters excluded by the weight decay mask.
#[derive(Debug, Clone)]
pub struct AdamW {
    schedule: WarmupCosine,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    mask: WeightDecayMask,
}

impl AdamW {
    const SLOTS: [&'static str; 2] = ["mu", "nu"];

    /// Create a new AdamW optimizer with a constant learning rate
    pub fn new(lr: f64, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            schedule: WarmupCosine::constant(lr),
            beta1,
            beta2,
            epsilon,
            weight_decay,
            mask: WeightDecayMask::default(),
        }
    }

    /// Create AdamW with default parameters (weight_decay = 0.01)
    pub fn default_params(lr: f64) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }

    pub fn with_schedule(mut self, schedule: WarmupCosine) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_weight_decay_mask(mut self, mask: WeightDecayMask) -> Self {
        self.mask = mask;
        self
    }
}

impl Optimizer for AdamW {
    fn slots(&self) -> &[&'static str] {
        &Self::SLOTS
    }

    fn learning_rate(&self, step: u64) -> f64 {
        self.schedule.lr_at(step)
    }

    fn update(
        &self,
        grads: &ParameterTree,
        mut state: ParameterTree,
        params: &ParameterTree,
        step: u64,
    ) -> Result<(ParameterTree, ParameterTree)> {
        params.check_same_paths(grads)?;
        let lr = self.learning_rate(step) as f32;
        let t = i32::try_from(step + 1)
            .map_err(|_| Error::ConfigError(format!("AdamW step {step} out of range")))?;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        let mut updates = ParameterTree::new();
        let mut new_state = ParameterTree::new();
        for (path, grad) in grads.iter() {
            let g = f32_array(path, grad)?;
            let p = f32_array(path, params.require(path)?)?;
            if p.shape() != g.shape() {
                return Err(Error::ShapeMismatch {
                    path: path.to_string(),
                    expected: p.shape().to_vec(),
                    got: g.shape().to_vec(),
                });
            }
            let mut mu = take_slot(&mut state, "mu", path, g.shape())?;
            let mut nu = take_slot(&mut state, "nu", path, g.shape())?;
            let decay = if self.mask.applies(path) { self.weight_decay } else { 0.0 };

            Zip::from(&mut mu).and(g).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
            Zip::from(&mut nu).and(g).for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

            let mut u = ArrayD::<f32>::zeros(g.raw_dim());
            Zip::from(&mut u)
                .and(&mu)
                .and(&nu)
                .and(p)
                .for_each(|u, &m, &v, &p| {
                    let m_hat = m / bias1;
                    let v_hat = v / bias2;
                    *u = -lr * (m_hat / (v_hat.sqrt() + eps) + decay * p);
                });

            updates.insert(path, Leaf::F32(u));
            new_state.insert(join_path("mu", path), Leaf::F32(mu));
            new_state.insert(join_path("nu", path), Leaf::F32(nu));
        }
        ensure_consumed(&state)?;
        Ok((updates, new_state))
    }
}
