//! The two demand regressors
//!
//! Both read windows shaped `(batch, window, features)` and emit one
//! normalized demand value per window. Layers come from `candle_nn`; the
//! architecture of each network is captured by a serializable description so a
//! persisted artifact can rebuild it before restoring the weights.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN, lstm};
use candle_nn::{
    AdamW, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, Optimizer, batch_norm, linear,
};
use ndarray::{Array1, ArrayView1, ArrayView3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::{
    DTYPE, ParamError, ParamStore, WeightSnapshot, dropout, targets_tensor, to_array1,
    windows_tensor,
};
use super::training::{FeedForwardConfig, RecurrentConfig};

/// Which regressor an artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "recurrent")]
    Recurrent,
    #[serde(rename = "feedforward")]
    FeedForward,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Recurrent => "recurrent",
            ModelKind::FeedForward => "feedforward",
        }
    }

    /// Artifact file name inside the model directory
    pub fn file_name(self) -> &'static str {
        match self {
            ModelKind::Recurrent => "recurrent.bin",
            ModelKind::FeedForward => "feedforward.bin",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recurrent" | "lstm" => Ok(ModelKind::Recurrent),
            "feedforward" | "bp" => Ok(ModelKind::FeedForward),
            other => Err(format!("unknown model kind: {}", other)),
        }
    }
}

/// Common surface of the trainable regressors
pub trait Regressor {
    fn kind(&self) -> ModelKind;

    /// `(window, features)` of one input sample
    fn window_shape(&self) -> [usize; 2];

    /// Shape of one sample as the network consumes it
    fn input_shape(&self) -> Vec<usize>;

    /// Variables the optimizer updates
    fn params(&self) -> &ParamStore;

    /// Inference pass, one value per window
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Training pass with dropout active and batch statistics updated
    fn forward_train<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor>;

    /// Regularization added to the data loss, as a scalar tensor
    fn penalty(&self) -> Result<Tensor> {
        Tensor::zeros((), DTYPE, &Device::Cpu)
    }

    fn penalty_value(&self) -> Result<f64> {
        self.penalty()?.to_scalar::<f64>()
    }

    /// Normalized predictions, one per window
    fn predict(&self, x: ArrayView3<f64>) -> Result<Array1<f64>> {
        to_array1(&self.forward(&windows_tensor(x)?)?)
    }

    /// One optimizer step on a batch; returns the batch loss (MSE plus any
    /// weight penalty) measured before the update
    fn train_batch<R: Rng>(
        &self,
        x: ArrayView3<f64>,
        y: ArrayView1<f64>,
        optimizer: &mut AdamW,
        rng: &mut R,
    ) -> Result<f64> {
        let target = targets_tensor(y)?;
        let output = self.forward_train(&windows_tensor(x)?, rng)?;
        let loss = candle_nn::loss::mse(&output, &target)?.add(&self.penalty()?)?;
        let value = loss.to_scalar::<f64>()?;
        optimizer.backward_step(&loss)?;
        Ok(value)
    }

    /// Whether a window tensor fits this network
    fn accepts(&self, x: ArrayView3<f64>) -> bool {
        let (_, w, f) = x.dim();
        [w, f] == self.window_shape()
    }
}

type DropFn<'a> = dyn FnMut(&Tensor, f64) -> Result<Tensor> + 'a;

fn no_dropout(x: &Tensor, _rate: f64) -> Result<Tensor> {
    Ok(x.clone())
}

// ==================== Recurrent ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentArchitecture {
    pub window: usize,
    pub features: usize,
    pub first_units: usize,
    pub second_units: usize,
    pub dense_units: usize,
    pub dropout: f64,
}

impl RecurrentArchitecture {
    pub fn new(window: usize, features: usize, config: &RecurrentConfig) -> Self {
        Self {
            window,
            features,
            first_units: config.first_units,
            second_units: config.second_units,
            dense_units: config.dense_units,
            dropout: config.dropout,
        }
    }
}

/// Stacked LSTM regressor
///
/// `LSTM(full sequence) → Dropout → LSTM(last state) → Dropout → Dense(ReLU) → Dense(1)`
///
/// Clones share weights with the original.
#[derive(Clone)]
pub struct RecurrentNet {
    arch: RecurrentArchitecture,
    params: ParamStore,
    first: LSTM,
    second: LSTM,
    hidden: Linear,
    output: Linear,
}

impl fmt::Debug for RecurrentNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentNet")
            .field("arch", &self.arch)
            .field("params", &self.params)
            .finish()
    }
}

impl RecurrentNet {
    pub fn new<R: Rng>(
        window: usize,
        features: usize,
        config: &RecurrentConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let net = Self::build(RecurrentArchitecture::new(window, features, config))?;
        net.params.initialize(rng)?;
        Ok(net)
    }

    /// Layers for `arch` with candle's default initialization
    pub fn build(arch: RecurrentArchitecture) -> Result<Self> {
        let params = ParamStore::new();
        let (first, second, hidden, output) = {
            let vb = params.builder();
            (
                lstm(arch.features, arch.first_units, LSTMConfig::default(), vb.pp("lstm1"))?,
                lstm(arch.first_units, arch.second_units, LSTMConfig::default(), vb.pp("lstm2"))?,
                linear(arch.second_units, arch.dense_units, vb.pp("dense"))?,
                linear(arch.dense_units, 1, vb.pp("output"))?,
            )
        };
        Ok(Self {
            arch,
            params,
            first,
            second,
            hidden,
            output,
        })
    }

    /// Rebuild a trained network from its architecture and weights
    pub fn from_snapshot(
        arch: RecurrentArchitecture,
        snapshot: &WeightSnapshot,
    ) -> std::result::Result<Self, ParamError> {
        let net = Self::build(arch)?;
        net.params.restore(snapshot)?;
        Ok(net)
    }

    pub fn architecture(&self) -> &RecurrentArchitecture {
        &self.arch
    }

    fn run(&self, x: &Tensor, drop: &mut DropFn<'_>) -> Result<Tensor> {
        let (n, steps, _) = x.dims3()?;
        if steps == 0 {
            return Tensor::zeros(n, DTYPE, &Device::Cpu);
        }
        let states = self.first.seq(x)?;
        let sequence = drop(&self.first.states_to_tensor(&states)?, self.arch.dropout)?;
        let states = self.second.seq(&sequence)?;
        let Some(last) = states.last() else {
            return Tensor::zeros(n, DTYPE, &Device::Cpu);
        };
        let last = drop(last.h(), self.arch.dropout)?;
        let hidden = self.hidden.forward(&last)?.relu()?;
        self.output.forward(&hidden)?.squeeze(1)
    }
}

impl Regressor for RecurrentNet {
    fn kind(&self) -> ModelKind {
        ModelKind::Recurrent
    }

    fn window_shape(&self) -> [usize; 2] {
        [self.arch.window, self.arch.features]
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.arch.window, self.arch.features]
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.run(x, &mut no_dropout)
    }

    fn forward_train<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        self.run(x, &mut |t: &Tensor, rate: f64| dropout(t, rate, &mut *rng))
    }
}

// ==================== Feed-forward ====================

/// Hidden layers (by position) that carry L2 and dropout
const REGULARIZED_LAYERS: usize = 2;
/// Hidden layers (by position) followed by batch normalization
const NORMALIZED_LAYERS: usize = 3;

/// Keras-style batch normalization: moving averages keep 99% of their value
fn norm_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: 1e-3,
        remove_mean: true,
        affine: true,
        momentum: 0.01,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardArchitecture {
    pub window: usize,
    pub features: usize,
    pub hidden_units: Vec<usize>,
    /// Weight penalty on the leading hidden layers
    pub l2: f64,
    pub dropout: f64,
}

impl FeedForwardArchitecture {
    pub fn new(window: usize, features: usize, config: &FeedForwardConfig) -> Self {
        Self {
            window,
            features,
            hidden_units: config.hidden_units.clone(),
            l2: config.l2,
            dropout: config.dropout,
        }
    }
}

#[derive(Debug, Clone)]
struct HiddenLayer {
    dense: Linear,
    norm: Option<BatchNorm>,
    l2: f64,
    dropout: f64,
}

/// Multi-layer perceptron over the flattened window
///
/// `Dense(ReLU)` per hidden width; the first three are batch-normalized and
/// the first two carry L2 and dropout. Clones share weights.
#[derive(Clone)]
pub struct FeedForwardNet {
    arch: FeedForwardArchitecture,
    params: ParamStore,
    hidden: Vec<HiddenLayer>,
    output: Linear,
}

impl fmt::Debug for FeedForwardNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForwardNet")
            .field("arch", &self.arch)
            .field("params", &self.params)
            .finish()
    }
}

impl FeedForwardNet {
    pub fn new<R: Rng>(
        window: usize,
        features: usize,
        config: &FeedForwardConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let net = Self::build(FeedForwardArchitecture::new(window, features, config))?;
        net.params.initialize(rng)?;
        Ok(net)
    }

    pub fn build(arch: FeedForwardArchitecture) -> Result<Self> {
        let params = ParamStore::new();
        let (hidden, output) = {
            let vb = params.builder();
            let mut hidden = Vec::with_capacity(arch.hidden_units.len());
            let mut inputs = arch.window * arch.features;
            for (position, &units) in arch.hidden_units.iter().enumerate() {
                let regularized = position < REGULARIZED_LAYERS;
                let norm = if position < NORMALIZED_LAYERS {
                    Some(batch_norm(units, norm_config(), vb.pp(format!("norm{}", position)))?)
                } else {
                    None
                };
                hidden.push(HiddenLayer {
                    dense: linear(inputs, units, vb.pp(format!("dense{}", position)))?,
                    norm,
                    l2: if regularized { arch.l2 } else { 0.0 },
                    dropout: if regularized { arch.dropout } else { 0.0 },
                });
                inputs = units;
            }
            (hidden, linear(inputs, 1, vb.pp("output"))?)
        };
        Ok(Self {
            arch,
            params,
            hidden,
            output,
        })
    }

    pub fn from_snapshot(
        arch: FeedForwardArchitecture,
        snapshot: &WeightSnapshot,
    ) -> std::result::Result<Self, ParamError> {
        let net = Self::build(arch)?;
        net.params.restore(snapshot)?;
        Ok(net)
    }

    pub fn architecture(&self) -> &FeedForwardArchitecture {
        &self.arch
    }

    fn run(&self, x: &Tensor, train: bool, drop: &mut DropFn<'_>) -> Result<Tensor> {
        let (n, window, features) = x.dims3()?;
        // row-major per sample: step 0 features, then step 1, ...
        let mut h = x.reshape((n, window * features))?;
        for layer in &self.hidden {
            h = layer.dense.forward(&h)?.relu()?;
            if let Some(norm) = &layer.norm {
                h = norm.forward_t(&h, train)?;
            }
            if layer.dropout > 0.0 {
                h = drop(&h, layer.dropout)?;
            }
        }
        self.output.forward(&h)?.squeeze(1)
    }
}

impl Regressor for FeedForwardNet {
    fn kind(&self) -> ModelKind {
        ModelKind::FeedForward
    }

    fn window_shape(&self) -> [usize; 2] {
        [self.arch.window, self.arch.features]
    }

    fn input_shape(&self) -> Vec<usize> {
        vec![self.arch.window * self.arch.features]
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.run(x, false, &mut no_dropout)
    }

    fn forward_train<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        self.run(x, true, &mut |t: &Tensor, rate: f64| dropout(t, rate, &mut *rng))
    }

    fn penalty(&self) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DTYPE, &Device::Cpu)?;
        for layer in self.hidden.iter().filter(|layer| layer.l2 > 0.0) {
            let squares = layer.dense.weight().sqr()?.sum_all()?;
            total = total.add(&squares.affine(layer.l2, 0.0)?)?;
        }
        Ok(total)
    }
}
