//! Model boundary

use super::Batch;
use crate::error::Result;
use crate::rng::RngKey;
use crate::tree::{ParameterTree, TreeShape};

/// Loss and token accuracy over the weighted positions of a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossAccuracy {
    pub loss: f64,
    pub accuracy: f64,
}

/// Loss, accuracy and gradients for one batch
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub accuracy: f64,
    pub grads: ParameterTree,
}

/// A causal language model as seen by the trainer
///
/// Every method must be a pure function of its arguments: the same
/// parameters, batch and key always give bit-identical results.
pub trait Model {
    /// Parameter skeleton, computed without allocating any tensor
    fn param_shapes(&self) -> TreeShape;

    /// Fresh parameters matching [`Model::param_shapes`]
    fn init(&self, key: RngKey) -> Result<ParameterTree>;

    /// Masked cross-entropy, accuracy and the gradient of the loss
    fn loss_and_grad(&self, params: &ParameterTree, batch: &Batch, key: RngKey)
        -> Result<StepOutput>;

    /// Masked cross-entropy and accuracy without gradients
    fn evaluate(&self, params: &ParameterTree, batch: &Batch, key: RngKey) -> Result<LossAccuracy>;

    /// Configuration snapshot stored in checkpoint metadata
    fn config(&self) -> serde_json::Value;
}
