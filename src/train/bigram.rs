//! Bigram language model
//!
//! The smallest causal LM with a real training signal: the logits for
//! position t are `table[token_{t-1}] + bias`, where the token before the
//! first position is the BOS token. Gradients of the masked cross-entropy
//! are computed analytically.

use super::model::{LossAccuracy, Model, StepOutput};
use super::Batch;
use crate::error::{Error, Result};
use crate::rng::RngKey;
use crate::tree::{DType, Leaf, LeafShape, ParameterTree, TreeShape};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Ix1, Ix2};
use rand::Rng;
use serde::{Deserialize, Serialize};

const TABLE: &str = "lm.table";
const BIAS: &str = "lm.bias";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigramConfig {
    pub vocab_size: usize,
    #[serde(default)]
    pub bos_token: i32,
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

fn default_init_scale() -> f32 {
    0.02
}

impl BigramConfig {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            bos_token: 0,
            init_scale: default_init_scale(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BigramModel {
    config: BigramConfig,
}

struct Forward {
    stats: LossAccuracy,
    grads: Option<(Array2<f32>, Array1<f32>)>,
}

impl BigramModel {
    pub fn new(config: BigramConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            return Err(Error::ConfigError("vocab_size must be positive".into()));
        }
        if config.bos_token < 0 || config.bos_token as usize >= config.vocab_size {
            return Err(Error::ConfigError(format!(
                "bos_token {} is outside the vocabulary of {}",
                config.bos_token, config.vocab_size
            )));
        }
        Ok(Self { config })
    }

    fn views<'a>(&self, params: &'a ParameterTree) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let shapes = self.param_shapes();
        for (path, expected) in shapes.iter() {
            expected.check(path, &params.require(path)?.leaf_shape())?;
        }
        let as_model_err = |e: ndarray::ShapeError| Error::Model(e.to_string());
        let table = params
            .require(TABLE)?
            .as_f32()
            .ok_or_else(|| Error::Model(format!("{TABLE} is not f32")))?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(as_model_err)?;
        let bias = params
            .require(BIAS)?
            .as_f32()
            .ok_or_else(|| Error::Model(format!("{BIAS} is not f32")))?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(as_model_err)?;
        Ok((table, bias))
    }

    fn token(&self, token: i32) -> Result<usize> {
        usize::try_from(token)
            .ok()
            .filter(|&t| t < self.config.vocab_size)
            .ok_or_else(|| {
                Error::InvalidBatch(format!(
                    "token {token} is outside the vocabulary of {}",
                    self.config.vocab_size
                ))
            })
    }

    fn forward(&self, params: &ParameterTree, batch: &Batch, with_grad: bool) -> Result<Forward> {
        let (table, bias) = self.views(params)?;
        let vocab = self.config.vocab_size;
        let weight: f64 = batch.loss_masks.iter().map(|&m| m as f64).sum();
        let denom = weight.max(1e-5);

        let mut grads = with_grad.then(|| (Array2::<f32>::zeros((vocab, vocab)), Array1::<f32>::zeros(vocab)));
        let mut loss = 0.0;
        let mut correct = 0.0;
        let mut logits = vec![0.0f64; vocab];
        for (row_tokens, row_masks) in batch.tokens.outer_iter().zip(batch.loss_masks.outer_iter()) {
            let mut prev = self.token(self.config.bos_token)?;
            for (&token, &mask) in row_tokens.iter().zip(row_masks.iter()) {
                let target = self.token(token)?;
                if mask != 0.0 {
                    let mask = mask as f64;
                    for (v, logit) in logits.iter_mut().enumerate() {
                        *logit = table[[prev, v]] as f64 + bias[v] as f64;
                    }
                    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let sum_exp: f64 = logits.iter().map(|&l| (l - max).exp()).sum();
                    let log_z = max + sum_exp.ln();
                    loss += mask * (log_z - logits[target]);

                    let predicted = logits
                        .iter()
                        .enumerate()
                        .fold((0, f64::NEG_INFINITY), |best, (i, &l)| if l > best.1 { (i, l) } else { best })
                        .0;
                    if predicted == target {
                        correct += mask;
                    }

                    if let Some((g_table, g_bias)) = grads.as_mut() {
                        for (v, &logit) in logits.iter().enumerate() {
                            let p = (logit - log_z).exp();
                            let onehot = if v == target { 1.0 } else { 0.0 };
                            let d = (mask * (p - onehot) / denom) as f32;
                            g_table[[prev, v]] += d;
                            g_bias[v] += d;
                        }
                    }
                }
                prev = target;
            }
        }
        Ok(Forward {
            stats: LossAccuracy {
                loss: loss / denom,
                accuracy: correct / denom,
            },
            grads,
        })
    }
}

impl Model for BigramModel {
    fn param_shapes(&self) -> TreeShape {
        let vocab = self.config.vocab_size;
        let mut shapes = TreeShape::new();
        shapes.insert(TABLE, LeafShape::new([vocab, vocab], DType::F32));
        shapes.insert(BIAS, LeafShape::new([vocab], DType::F32));
        shapes
    }

    fn init(&self, key: RngKey) -> Result<ParameterTree> {
        let vocab = self.config.vocab_size;
        let scale = self.config.init_scale;
        let mut rng = key.fold_in(TABLE).to_rng();
        let table: Vec<f32> = (0..vocab * vocab)
            .map(|_| if scale > 0.0 { rng.random_range(-scale..scale) } else { 0.0 })
            .collect();

        let mut params = ParameterTree::new();
        params.insert(TABLE, Leaf::f32(&[vocab, vocab], table)?);
        params.insert(BIAS, Leaf::f32(&[vocab], vec![0.0; vocab])?);
        Ok(params)
    }

    fn loss_and_grad(&self, params: &ParameterTree, batch: &Batch, _key: RngKey) -> Result<StepOutput> {
        let forward = self.forward(params, batch, true)?;
        let (g_table, g_bias) = forward
            .grads
            .ok_or_else(|| Error::Model("gradients were not computed".into()))?;
        let mut grads = ParameterTree::new();
        grads.insert(TABLE, Leaf::F32(g_table.into_dyn()));
        grads.insert(BIAS, Leaf::F32(g_bias.into_dyn()));
        Ok(StepOutput {
            loss: forward.stats.loss,
            accuracy: forward.stats.accuracy,
            grads,
        })
    }

    fn evaluate(&self, params: &ParameterTree, batch: &Batch, _key: RngKey) -> Result<LossAccuracy> {
        Ok(self.forward(params, batch, false)?.stats)
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "bigram",
            "vocab_size": self.config.vocab_size,
            "bos_token": self.config.bos_token,
            "init_scale": self.config.init_scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn model() -> BigramModel {
        BigramModel::new(BigramConfig::new(4)).unwrap()
    }

    fn zero_params() -> ParameterTree {
        model().param_shapes().zeros()
    }

    #[test]
    fn test_uniform_logits_give_log_vocab_loss() {
        let batch = Batch::unmasked(array![[1, 2, 3]]);
        let out = model().evaluate(&zero_params(), &batch, RngKey::from_seed(0)).unwrap();
        assert_abs_diff_eq!(out.loss, (4.0f64).ln(), epsilon = 1e-9);
    }

    #[test]
    fn test_masked_positions_do_not_count() {
        let m = model();
        let mut params = zero_params();
        // Strongly predict token 2 after token 1
        params.get_mut(TABLE).unwrap().as_f32_mut().unwrap()[[1, 2]] = 10.0;
        let batch = Batch::new(array![[1, 2, 3]], array![[0.0, 1.0, 0.0]]).unwrap();
        let out = m.evaluate(&params, &batch, RngKey::from_seed(0)).unwrap();
        assert_eq!(out.accuracy, 1.0);
        assert!(out.loss < 1e-3);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let m = model();
        let params = m.init(RngKey::from_seed(3)).unwrap();
        let batch = Batch::new(array![[1, 3, 0, 2], [2, 2, 1, 3]], array![[1.0, 1.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]]).unwrap();
        let out = m.loss_and_grad(&params, &batch, RngKey::from_seed(0)).unwrap();

        let h = 1e-2f32;
        for (path, index) in [(TABLE, vec![1, 3]), (TABLE, vec![0, 2]), (BIAS, vec![2])] {
            let mut plus = params.clone();
            plus.get_mut(path).unwrap().as_f32_mut().unwrap()[index.as_slice()] += h;
            let mut minus = params.clone();
            minus.get_mut(path).unwrap().as_f32_mut().unwrap()[index.as_slice()] -= h;
            let lp = m.evaluate(&plus, &batch, RngKey::from_seed(0)).unwrap().loss;
            let lm = m.evaluate(&minus, &batch, RngKey::from_seed(0)).unwrap().loss;
            let numeric = (lp - lm) / (2.0 * h as f64);
            let analytic = out.grads.get(path).unwrap().as_f32().unwrap()[index.as_slice()] as f64;
            assert_abs_diff_eq!(numeric, analytic, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_init_is_deterministic_and_matches_shapes() {
        let m = model();
        let a = m.init(RngKey::from_seed(7)).unwrap();
        let b = m.init(RngKey::from_seed(7)).unwrap();
        let c = m.init(RngKey::from_seed(8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        m.param_shapes().check_tree(&a).unwrap();
    }

    #[test]
    fn test_out_of_vocab_token_is_rejected() {
        let batch = Batch::unmasked(array![[9]]);
        let err = model().evaluate(&zero_params(), &batch, RngKey::from_seed(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidBatch(_)));
    }

    #[test]
    fn test_wrong_parameter_shape_is_rejected() {
        let mut params = zero_params();
        params.insert(BIAS, Leaf::f32(&[3], vec![0.0; 3]).unwrap());
        let err = model()
            .evaluate(&params, &Batch::unmasked(array![[1]]), RngKey::from_seed(0))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { path, .. } if path == BIAS));
    }

    #[test]
    fn test_config_rejects_bad_bos() {
        let mut config = BigramConfig::new(4);
        config.bos_token = 4;
        assert!(BigramModel::new(config).is_err());
    }
}
