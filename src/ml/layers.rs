//! Candle plumbing shared by the demand regressors
//!
//! Every network owns a `ParamStore`, the candle `VarMap` its layers were
//! built from. Weights are drawn from the run's seeded RNG, can be copied out
//! into a serializable `WeightSnapshot` and written back in place, which is
//! how early stopping keeps its best epoch and how artifacts are persisted.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use ndarray::{Array1, ArrayView1, ArrayView3};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of every weight and activation
pub const DTYPE: DType = DType::F64;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

/// Name of the input-side LSTM bias created by `candle_nn::rnn::lstm`
const LSTM_INPUT_BIAS: &str = "bias_ih_l0";

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("snapshot has no value for {0}")]
    Missing(String),
    #[error("snapshot holds {0}, which this network does not have")]
    Unexpected(String),
    #[error("{name} is shaped {found:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// One weight tensor in row-major order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

/// Every variable of a network, keyed by its builder path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub tensors: BTreeMap<String, StoredTensor>,
}

impl WeightSnapshot {
    pub fn get(&self, name: &str) -> Option<&StoredTensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// The variables behind one network
///
/// Clones share storage with the original.
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
}

impl fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamStore")
            .field("parameters", &self.parameter_count())
            .finish()
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamStore {
    pub fn new() -> Self {
        Self {
            varmap: VarMap::new(),
        }
    }

    /// Builder that registers every created layer weight in this store
    pub fn builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, DTYPE, &Device::Cpu)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Variables sorted by name
    fn named(&self) -> candle_core::Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".to_string()))?;
        let mut named: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn parameter_count(&self) -> usize {
        self.named()
            .map(|named| named.iter().map(|(_, var)| var.elem_count()).sum())
            .unwrap_or(0)
    }

    /// Glorot-uniform matrices and zero biases, drawn from `rng`
    ///
    /// Batch-norm scales and running statistics keep their constant
    /// initial values.
    pub fn initialize<R: Rng>(&self, rng: &mut R) -> candle_core::Result<()> {
        for (name, var) in self.named()? {
            let dims = var.dims().to_vec();
            let leaf = name.rsplit('.').next().unwrap_or(&name);
            let values = match dims.as_slice() {
                [rows, cols] => glorot_uniform(*rows, *cols, rng),
                [len] if leaf.starts_with("bias") => bias_values(leaf, *len),
                _ => continue,
            };
            var.set(&Tensor::from_vec(values, dims, &Device::Cpu)?)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> candle_core::Result<WeightSnapshot> {
        let mut tensors = BTreeMap::new();
        for (name, var) in self.named()? {
            let values = var.as_tensor().flatten_all()?.to_vec1::<f64>()?;
            tensors.insert(
                name,
                StoredTensor {
                    shape: var.dims().to_vec(),
                    values,
                },
            );
        }
        Ok(WeightSnapshot { tensors })
    }

    /// Overwrite every variable with its value in `snapshot`
    ///
    /// The snapshot must name exactly this store's variables, each with the
    /// shape the layer was built with.
    pub fn restore(&self, snapshot: &WeightSnapshot) -> Result<(), ParamError> {
        let named = self.named()?;
        if let Some(extra) = snapshot
            .tensors
            .keys()
            .find(|key| !named.iter().any(|(name, _)| name == *key))
        {
            return Err(ParamError::Unexpected(extra.clone()));
        }
        for (name, var) in &named {
            let stored = snapshot
                .get(name)
                .ok_or_else(|| ParamError::Missing(name.clone()))?;
            if stored.shape.as_slice() != var.dims() {
                return Err(ParamError::Shape {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    found: stored.shape.clone(),
                });
            }
            let value =
                Tensor::from_vec(stored.values.clone(), stored.shape.clone(), &Device::Cpu)?;
            var.set(&value)?;
        }
        Ok(())
    }
}

fn glorot_uniform<R: Rng>(fan_out: usize, fan_in: usize, rng: &mut R) -> Vec<f64> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    (0..fan_out * fan_in)
        .map(|_| rng.gen_range(-limit..=limit))
        .collect()
}

/// Zeros, except the forget gate of an LSTM input bias which starts at one
///
/// LSTM gate rows are laid out `[input, forget, cell, output]`.
fn bias_values(leaf: &str, len: usize) -> Vec<f64> {
    let mut values = vec![0.0; len];
    if leaf == LSTM_INPUT_BIAS {
        let units = len / 4;
        values[units..2 * units].fill(1.0);
    }
    values
}

/// Adam over every variable in `store`; weight penalties go into the loss
pub fn adam(store: &ParamStore, learning_rate: f64) -> candle_core::Result<AdamW> {
    AdamW::new(
        store.vars(),
        ParamsAdamW {
            lr: learning_rate,
            beta1: BETA1,
            beta2: BETA2,
            eps: ADAM_EPSILON,
            weight_decay: 0.0,
        },
    )
}

/// `(n, window, features)` windows as a tensor
pub fn windows_tensor(x: ArrayView3<f64>) -> candle_core::Result<Tensor> {
    let (n, window, features) = x.dim();
    Tensor::from_iter(x.iter().copied(), &Device::Cpu)?.reshape((n, window, features))
}

pub fn targets_tensor(y: ArrayView1<f64>) -> candle_core::Result<Tensor> {
    Tensor::from_iter(y.iter().copied(), &Device::Cpu)
}

pub fn to_array1(t: &Tensor) -> candle_core::Result<Array1<f64>> {
    Ok(Array1::from(t.flatten_all()?.to_vec1::<f64>()?))
}

/// Inverted dropout: kept units are scaled by `1 / (1 - rate)`
///
/// Masks come from `rng` so seeded runs repeat exactly.
pub fn dropout<R: Rng>(x: &Tensor, rate: f64, rng: &mut R) -> candle_core::Result<Tensor> {
    if rate <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - rate.min(0.99);
    let mask: Vec<f64> = (0..x.elem_count())
        .map(|_| if rng.r#gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims().to_vec(), x.device())?;
    x.mul(&mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_nn::rnn::{LSTMConfig, lstm};
    use candle_nn::{Init, linear};
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dense_store(seed: u64) -> ParamStore {
        let store = ParamStore::new();
        linear(3, 2, store.builder().pp("dense")).unwrap();
        store.initialize(&mut StdRng::seed_from_u64(seed)).unwrap();
        store
    }

    #[test]
    fn test_initialize_is_seeded() {
        assert_eq!(dense_store(4).snapshot().unwrap(), dense_store(4).snapshot().unwrap());
        assert_ne!(dense_store(4).snapshot().unwrap(), dense_store(5).snapshot().unwrap());
    }

    #[test]
    fn test_initialize_glorot_bounds_and_zero_bias() {
        let snapshot = dense_store(1).snapshot().unwrap();
        let weight = snapshot.get("dense.weight").unwrap();
        assert_eq!(weight.shape, vec![2, 3]);
        let limit = (6.0f64 / 5.0).sqrt();
        assert!(weight.values.iter().all(|w| w.abs() <= limit));
        assert!(snapshot.get("dense.bias").unwrap().values.iter().all(|&b| b == 0.0));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_lstm_forget_bias_is_one() {
        let store = ParamStore::new();
        lstm(3, 5, LSTMConfig::default(), store.builder().pp("lstm")).unwrap();
        store.initialize(&mut StdRng::seed_from_u64(7)).unwrap();
        let snapshot = store.snapshot().unwrap();

        let (_, bias) = snapshot
            .tensors
            .iter()
            .find(|(name, _)| name.ends_with(LSTM_INPUT_BIAS))
            .unwrap();
        assert_eq!(bias.values.len(), 20);
        assert_eq!(bias.values[5..10].iter().sum::<f64>(), 5.0);
        assert_eq!(bias.values[..5].iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn test_restore_writes_back_in_place() {
        let store = dense_store(1);
        let saved = store.snapshot().unwrap();
        store.initialize(&mut StdRng::seed_from_u64(99)).unwrap();
        assert_ne!(store.snapshot().unwrap(), saved);

        store.restore(&saved).unwrap();
        assert_eq!(store.snapshot().unwrap(), saved);
    }

    #[test]
    fn test_restore_rejects_wrong_shape() {
        let store = dense_store(1);
        let mut corrupt = store.snapshot().unwrap();
        corrupt.tensors.insert(
            "dense.weight".to_string(),
            StoredTensor {
                shape: vec![2, 4],
                values: vec![0.0; 8],
            },
        );
        assert!(matches!(
            store.restore(&corrupt),
            Err(ParamError::Shape { ref name, .. }) if name == "dense.weight"
        ));
    }

    #[test]
    fn test_restore_rejects_missing_and_unexpected() {
        let store = dense_store(1);
        let mut missing = store.snapshot().unwrap();
        missing.tensors.remove("dense.bias");
        assert!(matches!(store.restore(&missing), Err(ParamError::Missing(_))));

        let mut extra = store.snapshot().unwrap();
        extra.tensors.insert("other.weight".to_string(), StoredTensor::default());
        assert!(matches!(store.restore(&extra), Err(ParamError::Unexpected(_))));
    }

    #[test]
    fn test_adam_moves_against_gradient() {
        let store = ParamStore::new();
        let w = store.builder().get_with_hints(2, "w", Init::Const(1.0)).unwrap();
        let mut optimizer = adam(&store, 0.1).unwrap();

        let coefficients = Tensor::new(&[0.5f64, -0.5], &Device::Cpu).unwrap();
        let loss = w.mul(&coefficients).unwrap().sum_all().unwrap();
        optimizer.backward_step(&loss).unwrap();

        // first bias-corrected step is lr * sign(g)
        let after = w.to_vec1::<f64>().unwrap();
        assert_abs_diff_eq!(after[0], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(after[1], 1.1, epsilon = 1e-6);
    }

    #[test]
    fn test_windows_tensor_is_row_major() {
        let x = Array3::from_shape_fn((2, 3, 2), |(i, t, f)| (i * 100 + t * 10 + f) as f64);
        let t = windows_tensor(x.view()).unwrap();
        assert_eq!(t.dims(), &[2, 3, 2]);
        let flat = t.reshape((2, 6)).unwrap().to_vec2::<f64>().unwrap();
        assert_eq!(flat[1], vec![100.0, 101.0, 110.0, 111.0, 120.0, 121.0]);
    }

    #[test]
    fn test_dropout_zero_rate_is_identity() {
        let x = Tensor::ones((2, 3), DTYPE, &Device::Cpu).unwrap();
        let out = dropout(&x, 0.0, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(out.to_vec2::<f64>().unwrap(), x.to_vec2::<f64>().unwrap());
    }

    #[test]
    fn test_dropout_scales_kept_units() {
        let x = Tensor::ones((10, 10), DTYPE, &Device::Cpu).unwrap();
        let first = dropout(&x, 0.5, &mut StdRng::seed_from_u64(3)).unwrap();
        let values = to_array1(&first).unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(values.iter().any(|&v| v == 0.0));

        let again = dropout(&x, 0.5, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(to_array1(&again).unwrap(), values);
    }
}
