//! Machine learning core for vehicle demand forecasting
//!
//! The pipeline turns raw ride and weather records into normalized,
//! fixed-width time windows, trains a recurrent and a feed-forward regressor
//! on them, and scores live dispatch queries against the trained models.

pub mod dataset;
pub mod features;
pub mod inference;
pub mod layers;
pub mod network;
pub mod persistence;
pub mod preprocess;
pub mod scaler;
pub mod sequence;
pub mod training;

pub use dataset::{LoadReport, RowRejection};
pub use features::{
    DemandSlot, FeatureError, FeatureLayout, HourlyRecord, Region, RideRecord, Season, SlotKey,
    TimePeriod, WeatherSituation, WeatherType,
};
pub use inference::{
    DispatchContext, DispatchQuery, ExtrapolationPolicy, Forecast, HistoryMode, InferenceConfig,
    InferenceError, InferenceService, LoadedModels, PlaceholderValues, PredictionRecord,
};
pub use layers::{ParamError, WeightSnapshot};
pub use network::{
    FeedForwardArchitecture, FeedForwardNet, ModelKind, RecurrentArchitecture, RecurrentNet,
    Regressor,
};
pub use persistence::{
    ArtifactPaths, DataLoadError, ModelArtifact, ModelWeights, NetworkArchitecture,
};
pub use preprocess::{PreparedDataset, PreprocessConfig, PreprocessError, PreprocessSummary};
pub use scaler::{ColumnBounds, DegeneratePolicy, MinMaxScaler, ScalerBundle, ScalerError};
pub use sequence::{SequenceError, TensorSet, WindowSet, build_windows, chronological_split};
pub use training::{
    FeedForwardConfig, Metrics, ModelComparison, RecurrentConfig, TrainingError, TrainingHistory,
    TrainingRun,
};

/// Number of consecutive time steps fed to the models for one forecast.
pub const WINDOW_SIZE: usize = 24;

/// Share of windows (chronologically first) used for training.
pub const TRAIN_RATIO: f64 = 0.8;

/// Validation R² at or above which a model is fit for deployment.
pub const ACCEPTABLE_R2: f64 = 0.75;
