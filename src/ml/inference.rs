//! Scoring live dispatch queries against the trained models
//!
//! Models and scalers are loaded once into `LoadedModels` and shared
//! read-only through an `Arc`; concurrent predictions never mutate them.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::features::{
    DemandSlot, FeatureError, FeatureLayout, Region, SlotKey, TimePeriod, WeatherType,
    aggregate_slots, encode_slot_features,
};
use super::network::ModelKind;
use super::persistence::{ArtifactPaths, DataLoadError, ModelArtifact, load_scalers};
use super::scaler::{ScalerBundle, ScalerError};
use crate::traits::{Clock, HistorySource, PredictionSink};

/// Why a dispatch query was rejected
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("{region} has {found} observed slots before the query, {required} are needed")]
    InsufficientHistory {
        region: Region,
        found: usize,
        required: usize,
    },
    #[error("{feature} = {value} lies outside the fitted range [{min}, {max}]")]
    OutOfRange {
        feature: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error(transparent)]
    Scaler(#[from] ScalerError),
    #[error(transparent)]
    Model(#[from] DataLoadError),
    #[error("{model} estimate {value} is not a representable vehicle count")]
    NonFiniteEstimate { model: ModelKind, value: f64 },
    #[error("history source failed: {0}")]
    History(String),
    #[error("failed to record prediction: {0}")]
    Sink(String),
}

/// How the input window of a query is assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Every step is the query vector with placeholder ride statistics
    #[default]
    Placeholder,
    /// The most recent observed slots of the region before the query
    Recent,
}

/// What to do with inputs outside the scaler's fitted bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtrapolationPolicy {
    #[default]
    Extrapolate,
    Reject,
}

/// Ride statistics assumed when no history is consulted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderValues {
    /// Minutes
    pub duration: f64,
    /// Kilometres
    pub distance: f64,
    /// Metres per second
    pub windspeed: f64,
}

impl Default for PlaceholderValues {
    fn default() -> Self {
        Self {
            duration: 15.2,
            distance: 3.5,
            windspeed: 2.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub history_mode: HistoryMode,
    pub placeholder: PlaceholderValues,
    pub extrapolation: ExtrapolationPolicy,
    /// How far back `Recent` mode looks for slots
    pub history_lookback_days: i64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            history_mode: HistoryMode::default(),
            placeholder: PlaceholderValues::default(),
            extrapolation: ExtrapolationPolicy::default(),
            history_lookback_days: 14,
        }
    }
}

/// A dispatch request as submitted by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchQuery {
    pub region: String,
    pub time_period: String,
    pub weather: String,
    pub temperature: f64,
    pub predict_date: NaiveDate,
}

/// A dispatch request with every category resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchContext {
    pub region: Region,
    pub period: TimePeriod,
    pub weather: WeatherType,
    pub temperature: f64,
    pub date: NaiveDate,
}

impl DispatchQuery {
    pub fn parse(&self) -> Result<DispatchContext, FeatureError> {
        if !self.temperature.is_finite() {
            return Err(FeatureError::NonFinite {
                field: "temperature",
                value: self.temperature,
            });
        }
        Ok(DispatchContext {
            region: self.region.parse()?,
            period: self.time_period.parse()?,
            weather: self.weather.parse()?,
            temperature: self.temperature,
            date: self.predict_date,
        })
    }
}

/// One stored forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub region: Region,
    pub time_period: TimePeriod,
    pub predict_date: NaiveDate,
    /// Vehicles to dispatch
    pub demand_count: u32,
    pub model_used: ModelKind,
    /// Validation R² of the model used, in percent
    pub accuracy: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// The record handed to the sink
    pub record: PredictionRecord,
    /// Unrounded recurrent estimate in vehicles
    pub recurrent_estimate: f64,
    /// Unrounded feed-forward estimate, kept for comparison
    pub feedforward_estimate: f64,
    /// `None` when the feed-forward estimate is not a usable count
    pub feedforward_demand: Option<u32>,
}

/// Round half away from zero, clamping negative demand to zero
///
/// Returns `None` for NaN, infinities and counts beyond `u32::MAX`.
pub fn round_demand(estimate: f64) -> Option<u32> {
    if !estimate.is_finite() {
        return None;
    }
    let rounded = estimate.round().max(0.0);
    if rounded > f64::from(u32::MAX) {
        return None;
    }
    Some(rounded as u32)
}

/// Both trained models and their scalers, validated against each other
#[derive(Debug, Clone)]
pub struct LoadedModels {
    recurrent: ModelArtifact,
    feedforward: ModelArtifact,
    scalers: ScalerBundle,
}

impl LoadedModels {
    pub fn new(
        recurrent: ModelArtifact,
        feedforward: ModelArtifact,
        scalers: ScalerBundle,
    ) -> Result<Self, DataLoadError> {
        for (artifact, kind) in [
            (&recurrent, ModelKind::Recurrent),
            (&feedforward, ModelKind::FeedForward),
        ] {
            if artifact.kind() != kind {
                return Err(DataLoadError::Malformed {
                    path: kind.file_name().to_string(),
                    reason: format!("holds a {} model", artifact.kind()),
                });
            }
            if artifact.layout != FeatureLayout::Slot {
                return Err(DataLoadError::ShapeMismatch {
                    what: format!("{} feature width", kind),
                    expected: vec![DemandSlot::NUM_FEATURES],
                    found: vec![artifact.window_shape[1]],
                });
            }
        }
        if recurrent.window_shape != feedforward.window_shape {
            return Err(DataLoadError::ShapeMismatch {
                what: "feedforward window".to_string(),
                expected: recurrent.window_shape.to_vec(),
                found: feedforward.window_shape.to_vec(),
            });
        }
        if scalers.features.n_features() != DemandSlot::NUM_FEATURES {
            return Err(DataLoadError::ShapeMismatch {
                what: "feature scaler".to_string(),
                expected: vec![DemandSlot::NUM_FEATURES],
                found: vec![scalers.features.n_features()],
            });
        }
        Ok(Self {
            recurrent,
            feedforward,
            scalers,
        })
    }

    /// Load both artifacts and the scalers from the model directory
    pub fn load(paths: &ArtifactPaths) -> Result<Self, DataLoadError> {
        let recurrent = ModelArtifact::load(&paths.model(ModelKind::Recurrent))?;
        let feedforward = ModelArtifact::load(&paths.model(ModelKind::FeedForward))?;
        let scalers = load_scalers(paths)?;
        let models = Self::new(recurrent, feedforward, scalers)?;
        tracing::info!("Loaded {}", models.recurrent.summary());
        tracing::info!("Loaded {}", models.feedforward.summary());
        Ok(models)
    }

    /// Load from a single directory holding both models and scalers
    pub fn load_dir(dir: &Path) -> Result<Self, DataLoadError> {
        Self::load(&ArtifactPaths::new(dir, dir))
    }

    pub fn window(&self) -> usize {
        self.recurrent.window_shape[0]
    }

    pub fn recurrent(&self) -> &ModelArtifact {
        &self.recurrent
    }

    pub fn feedforward(&self) -> &ModelArtifact {
        &self.feedforward
    }

    pub fn scalers(&self) -> &ScalerBundle {
        &self.scalers
    }

    /// Accuracy reported with every forecast
    pub fn accuracy(&self) -> f64 {
        self.recurrent.metrics.accuracy_percent()
    }
}

/// Scores dispatch queries and records each successful forecast
#[derive(Clone)]
pub struct InferenceService {
    models: Arc<LoadedModels>,
    config: InferenceConfig,
    clock: Arc<dyn Clock>,
}

impl InferenceService {
    pub fn new(models: Arc<LoadedModels>, config: InferenceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            models,
            config,
            clock,
        }
    }

    pub fn models(&self) -> &Arc<LoadedModels> {
        &self.models
    }

    async fn window_rows<H: HistorySource>(
        &self,
        ctx: &DispatchContext,
        history: &H,
    ) -> Result<Vec<Vec<f64>>, InferenceError> {
        let window = self.models.window();
        match self.config.history_mode {
            HistoryMode::Placeholder => {
                let p = self.config.placeholder;
                let row = encode_slot_features(
                    p.duration,
                    p.distance,
                    ctx.temperature,
                    p.windspeed,
                    ctx.period,
                    ctx.region,
                    ctx.weather,
                )?;
                Ok(vec![row; window])
            }
            HistoryMode::Recent => {
                let until = SlotKey::new(ctx.date, ctx.period).start();
                let from = until - Duration::days(self.config.history_lookback_days);
                let rides = history
                    .rides_between(ctx.region, from, until)
                    .await
                    .map_err(|e| InferenceError::History(format!("{:#}", e)))?;

                let slots: Vec<DemandSlot> = aggregate_slots(&rides)
                    .slots
                    .into_iter()
                    .filter(|s| s.region == ctx.region && s.key.start() < until)
                    .collect();
                if slots.len() < window {
                    return Err(InferenceError::InsufficientHistory {
                        region: ctx.region,
                        found: slots.len(),
                        required: window,
                    });
                }
                slots[slots.len() - window..]
                    .iter()
                    .map(|s| s.encode().map_err(InferenceError::from))
                    .collect()
            }
        }
    }

    fn check_range(&self, rows: &[Vec<f64>]) -> Result<(), InferenceError> {
        for row in rows {
            let Some((column, value, bounds)) = self.models.scalers.features.first_out_of_range(row)
            else {
                continue;
            };
            let feature = DemandSlot::FEATURE_NAMES
                .get(column)
                .copied()
                .unwrap_or("feature");
            match self.config.extrapolation {
                ExtrapolationPolicy::Reject => {
                    return Err(InferenceError::OutOfRange {
                        feature,
                        value,
                        min: bounds.min,
                        max: bounds.max,
                    });
                }
                ExtrapolationPolicy::Extrapolate => {
                    tracing::debug!(
                        "{} = {} outside [{}, {}], extrapolating",
                        feature,
                        value,
                        bounds.min,
                        bounds.max
                    );
                }
            }
        }
        Ok(())
    }

    fn scaled_window(&self, rows: &[Vec<f64>]) -> Result<Array3<f64>, InferenceError> {
        let width = self.models.scalers.features.n_features();
        let mut x = Array3::zeros((1, rows.len(), width));
        for (t, row) in rows.iter().enumerate() {
            let scaled = self.models.scalers.features.transform(row)?;
            for (f, value) in scaled.into_iter().enumerate() {
                x[[0, t, f]] = value;
            }
        }
        Ok(x)
    }

    /// Forecast demand for one query and hand the record to `sink`
    ///
    /// The recurrent estimate is authoritative. Nothing reaches the sink
    /// when any step fails.
    pub async fn predict<H: HistorySource, S: PredictionSink>(
        &self,
        query: &DispatchQuery,
        history: &H,
        sink: &S,
    ) -> Result<Forecast, InferenceError> {
        let ctx = query.parse()?;
        let rows = self.window_rows(&ctx, history).await?;
        self.check_range(&rows)?;
        let x = self.scaled_window(&rows)?;

        let scalers = &self.models.scalers;
        let first = |values: ndarray::Array1<f64>| values.first().copied().unwrap_or(f64::NAN);
        let recurrent_estimate =
            scalers.unscale_target(first(self.models.recurrent.predict(x.view())?));
        let feedforward_estimate =
            scalers.unscale_target(first(self.models.feedforward.predict(x.view())?));

        let Some(demand_count) = round_demand(recurrent_estimate) else {
            return Err(InferenceError::NonFiniteEstimate {
                model: ModelKind::Recurrent,
                value: recurrent_estimate,
            });
        };
        if recurrent_estimate < -0.5 {
            tracing::warn!(
                "Negative demand estimate {:.2} for {} {} clamped to zero",
                recurrent_estimate,
                ctx.region,
                ctx.period
            );
        }

        let record = PredictionRecord {
            region: ctx.region,
            time_period: ctx.period,
            predict_date: ctx.date,
            demand_count,
            model_used: ModelKind::Recurrent,
            accuracy: self.models.accuracy(),
            created_at: self.clock.now_utc(),
        };
        sink.record(&record)
            .await
            .map_err(|e| InferenceError::Sink(format!("{:#}", e)))?;

        let feedforward_demand = round_demand(feedforward_estimate);
        if feedforward_demand.is_none() {
            tracing::warn!("Feed-forward estimate {} is not a usable count", feedforward_estimate);
        }
        tracing::debug!(
            "{} {} on {}: recurrent {:.2} → {}, feedforward {:.2}",
            ctx.region,
            ctx.period,
            ctx.date,
            recurrent_estimate,
            demand_count,
            feedforward_estimate
        );

        Ok(Forecast {
            record,
            recurrent_estimate,
            feedforward_estimate,
            feedforward_demand,
        })
    }
}
