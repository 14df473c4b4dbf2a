//! Stochastic Gradient Descent optimizer

use super::optimizer::{ensure_consumed, f32_array, take_slot, Optimizer};
use super::scheduler::{LRScheduler, WarmupCosine};
use crate::error::Result;
use crate::tree::{join_path, Leaf, ParameterTree};
use ndarray::Zip;

/// SGD optimizer with optional momentum
///
/// With momentum the state carries one `momentum` slot per parameter:
/// v = momentum * v - lr * g, and the update is v. Without momentum the
/// state is empty and the update is -lr * g.
#[derive(Debug, Clone)]
pub struct SGD {
    schedule: WarmupCosine,
    momentum: f32,
}

impl SGD {
    /// Create a new SGD optimizer
    pub fn new(lr: f64, momentum: f32) -> Self {
        Self {
            schedule: WarmupCosine::constant(lr),
            momentum,
        }
    }

    pub fn with_schedule(mut self, schedule: WarmupCosine) -> Self {
        self.schedule = schedule;
        self
    }
}

impl Optimizer for SGD {
    fn slots(&self) -> &[&'static str] {
        if self.momentum > 0.0 {
            &["momentum"]
        } else {
            &[]
        }
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
        let momentum = self.momentum;

        let mut updates = ParameterTree::new();
        let mut new_state = ParameterTree::new();
        for (path, grad) in grads.iter() {
            let g = f32_array(path, grad)?;
            if momentum > 0.0 {
                let mut velocity = take_slot(&mut state, "momentum", path, g.shape())?;
                Zip::from(&mut velocity)
                    .and(g)
                    .for_each(|v, &g| *v = momentum * *v - lr * g);
                updates.insert(path, Leaf::F32(velocity.clone()));
                new_state.insert(join_path("momentum", path), Leaf::F32(velocity));
            } else {
                updates.insert(path, Leaf::F32(g.mapv(|g| -lr * g)));
            }
        }
        ensure_consumed(&state)?;
        Ok((updates, new_state))
    }
}
