//! Learning rate schedules

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Learning rate as a pure function of the optimizer step
///
/// Schedules carry no mutable position: the step counter lives in the
/// train state, so a restored run sees the same rate it would have seen
/// without the restart.
pub trait LRScheduler {
    /// Learning rate used for the update applied at `step`
    fn lr_at(&self, step: u64) -> f64;
}

/// Linear warmup followed by cosine decay
///
/// Formula:
/// - `step < warmup`: lr_t = lr * t / warmup
/// - otherwise: lr_t = end_lr + 0.5 * (lr - end_lr) * (1 + cos(π * p))
///
/// Where p = min((t - warmup) / decay_steps, 1). With `decay_steps == 0`
/// the rate stays at `lr` after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    pub lr: f64,
    pub end_lr: f64,
    pub warmup_steps: u64,
    pub decay_steps: u64,
}

impl WarmupCosine {
    pub fn new(lr: f64, end_lr: f64, warmup_steps: u64, decay_steps: u64) -> Self {
        Self {
            lr,
            end_lr,
            warmup_steps,
            decay_steps,
        }
    }

    /// Fixed learning rate
    pub fn constant(lr: f64) -> Self {
        Self::new(lr, lr, 0, 0)
    }
}

impl LRScheduler for WarmupCosine {
    fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.lr * step as f64 / self.warmup_steps as f64;
        }
        if self.decay_steps == 0 {
            return self.lr;
        }
        let progress = ((step - self.warmup_steps) as f64 / self.decay_steps as f64).min(1.0);
        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        self.end_lr + (self.lr - self.end_lr) * cosine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_warmup_is_linear_from_zero() {
        let schedule = WarmupCosine::new(1e-3, 0.0, 10, 100);
        assert_abs_diff_eq!(schedule.lr_at(0), 0.0);
        assert_abs_diff_eq!(schedule.lr_at(5), 5e-4, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.lr_at(10), 1e-3, epsilon = 1e-12);
    }

    #[test]
    fn test_cosine_reaches_end_lr_and_stays() {
        let schedule = WarmupCosine::new(1e-3, 1e-5, 10, 100);
        assert_abs_diff_eq!(schedule.lr_at(60), (1e-3 + 1e-5) / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.lr_at(110), 1e-5, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.lr_at(10_000), 1e-5, epsilon = 1e-12);
    }

    #[test]
    fn test_decay_is_monotonic_after_warmup() {
        let schedule = WarmupCosine::new(0.1, 0.0, 0, 50);
        let rates: Vec<f64> = (0..=50).map(|t| schedule.lr_at(t)).collect();
        assert!(rates.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_constant() {
        let schedule = WarmupCosine::constant(0.01);
        assert_eq!(schedule.lr_at(0), 0.01);
        assert_eq!(schedule.lr_at(123_456), 0.01);
    }
}
