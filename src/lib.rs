//! Bike Demand Library
//!
//! This module exposes the forecasting core, its configuration and the
//! PostgreSQL store for testing and reuse by outer layers.

pub mod config;
pub mod db;
pub mod ml;
pub mod traits;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{Database, PredictionRow, RideRow};
pub use ml::{
    DispatchQuery, Forecast, InferenceService, LoadedModels, ModelKind, PredictionRecord,
};
pub use traits::{
    Clock, HistorySource, MemoryHistory, MemorySink, MockClock, PredictionSink, SystemClock,
};
