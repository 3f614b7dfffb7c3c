//! Training procedures for the recurrent and feed-forward regressors

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use ndarray::{ArrayView1, ArrayView3, Axis};
use candle_nn::Optimizer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ACCEPTABLE_R2;
use super::features::FeatureLayout;
use super::layers::{ParamError, adam};
use super::network::{FeedForwardNet, ModelKind, RecurrentNet, Regressor};
use super::persistence::{ModelArtifact, ModelWeights};
use super::scaler::ScalerBundle;
use super::sequence::TensorSet;

/// Errors that abort a training run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("training split is empty")]
    EmptyTrainingSet,
    #[error("validation split is empty")]
    EmptyValidationSet,
    #[error("{split} split has {samples} windows but {targets} targets")]
    LengthMismatch {
        split: &'static str,
        samples: usize,
        targets: usize,
    },
    #[error("{split} windows are shaped {found:?}, expected {expected:?}")]
    ShapeMismatch {
        split: &'static str,
        expected: [usize; 2],
        found: [usize; 2],
    },
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),
    #[error("tensor backend failed: {0}")]
    Backend(String),
}

impl From<candle_core::Error> for TrainingError {
    fn from(err: candle_core::Error) -> Self {
        TrainingError::Backend(err.to_string())
    }
}

impl From<ParamError> for TrainingError {
    fn from(err: ParamError) -> Self {
        TrainingError::Backend(err.to_string())
    }
}

/// Hyperparameters of the recurrent regressor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub first_units: usize,
    pub second_units: usize,
    pub dense_units: usize,
    pub dropout: f64,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
            learning_rate: 1e-3,
            patience: 3,
            min_delta: 0.0,
            first_units: 64,
            second_units: 32,
            dense_units: 16,
            dropout: 0.2,
        }
    }
}

/// Hyperparameters of the feed-forward regressor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedForwardConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub hidden_units: Vec<usize>,
    /// Weight penalty on the first two hidden layers
    pub l2: f64,
    pub dropout: f64,
    pub plateau_factor: f64,
    pub plateau_patience: usize,
    pub min_learning_rate: f64,
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 3e-4,
            patience: 10,
            min_delta: 1e-5,
            hidden_units: vec![512, 256, 128, 64, 32],
            l2: 5e-5,
            dropout: 0.05,
            plateau_factor: 0.7,
            plateau_patience: 3,
            min_learning_rate: 1e-5,
        }
    }
}

// ==================== Callbacks ====================

/// Outcome of feeding one validation loss to `EarlyStopping`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Improved,
    Wait,
    Stop,
}

/// Stops training once the validation loss has not improved by more than
/// `min_delta` for `patience` consecutive epochs
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn observe(&mut self, loss: f64) -> StopDecision {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Wait
        }
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// improvement, never going below `min_rate`
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    min_rate: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    const MIN_DELTA: f64 = 1e-4;

    pub fn new(factor: f64, patience: usize, min_rate: f64) -> Self {
        Self {
            factor,
            patience,
            min_rate,
            min_delta: Self::MIN_DELTA,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Learning rate to use for the next epoch
    pub fn observe(&mut self, loss: f64, rate: f64) -> f64 {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return rate;
        }
        self.wait += 1;
        if self.wait >= self.patience && rate > self.min_rate {
            self.wait = 0;
            return (rate * self.factor).max(self.min_rate);
        }
        rate
    }
}

// ==================== History ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
}

/// Per-epoch losses of one training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    /// Epoch whose weights were kept (0 when no epoch improved)
    pub best_epoch: usize,
    pub stopped_early: bool,
}

impl TrainingHistory {
    pub fn best_val_loss(&self) -> Option<f64> {
        self.epochs
            .iter()
            .find(|e| e.epoch == self.best_epoch)
            .map(|e| e.val_loss)
    }
}

// ==================== Metrics ====================

/// Regression quality in original units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub samples: usize,
}

impl Metrics {
    pub fn compute(predictions: &[f64], truths: &[f64]) -> Self {
        let n = predictions.len().min(truths.len());
        if n == 0 {
            return Self {
                mae: 0.0,
                rmse: 0.0,
                r2: 0.0,
                samples: 0,
            };
        }
        let count = n as f64;
        let pairs = || predictions.iter().zip(truths).take(n);

        let mae = pairs().map(|(p, t)| (p - t).abs()).sum::<f64>() / count;
        let ss_res = pairs().map(|(p, t)| (p - t).powi(2)).sum::<f64>();
        let mean = truths.iter().take(n).sum::<f64>() / count;
        let ss_tot = truths.iter().take(n).map(|t| (t - mean).powi(2)).sum::<f64>();

        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Self {
            mae,
            rmse: (ss_res / count).sqrt(),
            r2,
            samples: n,
        }
    }

    /// Fit for deployment
    pub fn is_acceptable(&self) -> bool {
        self.r2 >= ACCEPTABLE_R2
    }

    /// R² as a percentage, the figure reported with each forecast
    pub fn accuracy_percent(&self) -> f64 {
        self.r2 * 100.0
    }
}

fn normalized_mse<M: Regressor>(
    model: &M,
    x: ArrayView3<f64>,
    y: ArrayView1<f64>,
) -> candle_core::Result<f64> {
    let predictions = model.predict(x)?;
    let n = y.len().max(1) as f64;
    Ok((&predictions - &y).iter().map(|d| d * d).sum::<f64>() / n)
}

/// Score a model on windows with normalized targets, in original units
pub fn evaluate<M: Regressor>(
    model: &M,
    x: ArrayView3<f64>,
    y: ArrayView1<f64>,
    scalers: &ScalerBundle,
) -> candle_core::Result<Metrics> {
    let predictions: Vec<f64> = model
        .predict(x)?
        .iter()
        .map(|&p| scalers.unscale_target(p))
        .collect();
    let truths: Vec<f64> = y.iter().map(|&t| scalers.unscale_target(t)).collect();
    Ok(Metrics::compute(&predictions, &truths))
}

// ==================== Fit loop ====================

/// Optimizer schedule of one fit
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub early_stopping: EarlyStopping,
    pub plateau: Option<PlateauScheduler>,
}

impl From<&RecurrentConfig> for FitOptions {
    fn from(config: &RecurrentConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            early_stopping: EarlyStopping::new(config.patience, config.min_delta),
            plateau: None,
        }
    }
}

impl From<&FeedForwardConfig> for FitOptions {
    fn from(config: &FeedForwardConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            early_stopping: EarlyStopping::new(config.patience, config.min_delta),
            plateau: Some(PlateauScheduler::new(
                config.plateau_factor,
                config.plateau_patience,
                config.min_learning_rate,
            )),
        }
    }
}

/// Check tensor shapes against what a network expects
pub fn validate_tensors(data: &TensorSet, window_shape: [usize; 2]) -> Result<(), TrainingError> {
    let (train_n, train_w, train_f) = data.x_train.dim();
    let (val_n, val_w, val_f) = data.x_val.dim();
    if train_n == 0 {
        return Err(TrainingError::EmptyTrainingSet);
    }
    if val_n == 0 {
        return Err(TrainingError::EmptyValidationSet);
    }
    if train_n != data.y_train.len() {
        return Err(TrainingError::LengthMismatch {
            split: "training",
            samples: train_n,
            targets: data.y_train.len(),
        });
    }
    if val_n != data.y_val.len() {
        return Err(TrainingError::LengthMismatch {
            split: "validation",
            samples: val_n,
            targets: data.y_val.len(),
        });
    }
    if [train_w, train_f] != window_shape {
        return Err(TrainingError::ShapeMismatch {
            split: "training",
            expected: window_shape,
            found: [train_w, train_f],
        });
    }
    if [val_w, val_f] != window_shape {
        return Err(TrainingError::ShapeMismatch {
            split: "validation",
            expected: window_shape,
            found: [val_w, val_f],
        });
    }
    Ok(())
}

/// Mini-batch training with early stopping
///
/// The returned model carries the weights of the best validation epoch.
pub fn fit<M: Regressor>(
    model: M,
    data: &TensorSet,
    mut options: FitOptions,
    rng: &mut StdRng,
) -> Result<(M, TrainingHistory), TrainingError> {
    if options.batch_size == 0 {
        return Err(TrainingError::InvalidConfig("batch_size must be at least 1".into()));
    }
    if options.epochs == 0 {
        return Err(TrainingError::InvalidConfig("epochs must be at least 1".into()));
    }
    validate_tensors(data, model.window_shape())?;

    let kind = model.kind();
    let mut indices: Vec<usize> = (0..data.train_len()).collect();
    let mut rate = options.learning_rate;
    let mut optimizer = adam(model.params(), rate)?;
    let mut best = model.params().snapshot()?;
    let mut history = TrainingHistory::default();

    for epoch in 1..=options.epochs {
        indices.shuffle(rng);

        let mut total = 0.0;
        for batch in indices.chunks(options.batch_size) {
            let x = data.x_train.select(Axis(0), batch);
            let y = data.y_train.select(Axis(0), batch);
            let loss = model.train_batch(x.view(), y.view(), &mut optimizer, rng)?;
            total += loss * batch.len() as f64;
        }
        let train_loss = total / indices.len() as f64;
        let val_loss = normalized_mse(&model, data.x_val.view(), data.y_val.view())?
            + model.penalty_value()?;

        tracing::info!(
            "[{}] epoch {}/{}: loss={:.6} val_loss={:.6} lr={:.2e}",
            kind,
            epoch,
            options.epochs,
            train_loss,
            val_loss,
            rate
        );
        history.epochs.push(EpochRecord {
            epoch,
            train_loss,
            val_loss,
            learning_rate: rate,
        });

        match options.early_stopping.observe(val_loss) {
            StopDecision::Improved => {
                best = model.params().snapshot()?;
                history.best_epoch = epoch;
            }
            StopDecision::Wait => {}
            StopDecision::Stop => {
                tracing::info!(
                    "[{}] early stop after epoch {}, keeping epoch {}",
                    kind,
                    epoch,
                    history.best_epoch
                );
                history.stopped_early = true;
                break;
            }
        }

        if let Some(plateau) = options.plateau.as_mut() {
            let next = plateau.observe(val_loss, rate);
            if next < rate {
                tracing::info!("[{}] reducing learning rate to {:.2e}", kind, next);
                optimizer.set_learning_rate(next);
            }
            rate = next;
        }
    }

    model.params().restore(&best)?;
    Ok((model, history))
}

// ==================== Training runs ====================

/// Inputs shared by both training procedures
#[derive(Debug, Clone, Copy)]
pub struct TrainingRun<'a> {
    pub data: &'a TensorSet,
    pub scalers: &'a ScalerBundle,
    pub layout: FeatureLayout,
    pub seed: u64,
    pub trained_at: DateTime<Utc>,
}

impl TrainingRun<'_> {
    fn window_shape(&self) -> [usize; 2] {
        let (_, w, f) = self.data.x_train.dim();
        [w, f]
    }

    fn check_layout(&self) -> Result<[usize; 2], TrainingError> {
        let shape = self.window_shape();
        if shape[1] != self.layout.len() {
            return Err(TrainingError::ShapeMismatch {
                split: "training",
                expected: [shape[0], self.layout.len()],
                found: shape,
            });
        }
        Ok(shape)
    }

    fn finish<M: Regressor>(
        &self,
        model: &M,
        history: TrainingHistory,
        weights: ModelWeights,
    ) -> Result<(ModelArtifact, Metrics), TrainingError> {
        let metrics =
            evaluate(model, self.data.x_val.view(), self.data.y_val.view(), self.scalers)?;
        let kind = model.kind();
        tracing::info!(
            "[{}] validation: MAE={:.2} RMSE={:.2} R²={:.4} over {} windows",
            kind,
            metrics.mae,
            metrics.rmse,
            metrics.r2,
            metrics.samples
        );
        if !metrics.is_acceptable() {
            tracing::warn!(
                "[{}] R² {:.4} is below the deployment threshold {}",
                kind,
                metrics.r2,
                ACCEPTABLE_R2
            );
        }
        let artifact = ModelArtifact::new(
            self.layout,
            model.window_shape(),
            self.trained_at,
            metrics,
            history,
            weights,
        );
        Ok((artifact, metrics))
    }

    pub fn recurrent(
        &self,
        config: &RecurrentConfig,
    ) -> Result<(ModelArtifact, Metrics), TrainingError> {
        let [window, features] = self.check_layout()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let model = RecurrentNet::new(window, features, config, &mut rng)?;
        let (model, history) = fit(model, self.data, FitOptions::from(config), &mut rng)?;
        let weights = ModelWeights::Recurrent(model.clone());
        self.finish(&model, history, weights)
    }

    pub fn feedforward(
        &self,
        config: &FeedForwardConfig,
    ) -> Result<(ModelArtifact, Metrics), TrainingError> {
        let [window, features] = self.check_layout()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let model = FeedForwardNet::new(window, features, config, &mut rng)?;
        let (model, history) = fit(model, self.data, FitOptions::from(config), &mut rng)?;
        let weights = ModelWeights::FeedForward(model.clone());
        self.finish(&model, history, weights)
    }
}

// ==================== Comparison ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub kind: ModelKind,
    pub metrics: Metrics,
    pub acceptable: bool,
}

/// Side-by-side validation metrics of the trained models
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub rows: Vec<ComparisonRow>,
}

impl ModelComparison {
    pub fn from_artifacts<'a>(artifacts: impl IntoIterator<Item = &'a ModelArtifact>) -> Self {
        let rows = artifacts
            .into_iter()
            .map(|a| ComparisonRow {
                kind: a.kind(),
                metrics: a.metrics,
                acceptable: a.metrics.is_acceptable(),
            })
            .collect();
        Self { rows }
    }

    /// Model with the highest R²
    pub fn best(&self) -> Option<&ComparisonRow> {
        self.rows
            .iter()
            .max_by(|a, b| a.metrics.r2.total_cmp(&b.metrics.r2))
    }

    /// Plain-text table
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:>10} {:>10} {:>8} {:>8}",
            "model", "MAE", "RMSE", "R² %", "deploy"
        );
        for row in &self.rows {
            let _ = writeln!(
                out,
                "{:<12} {:>10.2} {:>10.2} {:>8.2} {:>8}",
                row.kind.as_str(),
                row.metrics.mae,
                row.metrics.rmse,
                row.metrics.accuracy_percent(),
                if row.acceptable { "yes" } else { "no" }
            );
        }
        out
    }
}
