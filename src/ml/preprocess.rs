//! Offline preprocessing: corpus → normalized windows + fitted scalers

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dataset::DatasetError;
use super::features::{
    DemandSlot, FeatureError, FeatureLayout, HourlyRecord, Region, RideRecord, aggregate_slots,
};
use super::persistence::{ArtifactPaths, DataLoadError, save_scalers, save_tensors};
use super::scaler::{DegeneratePolicy, MinMaxScaler, ScalerBundle, ScalerError};
use super::sequence::{SequenceError, TensorSet, WindowSet, build_windows, chronological_split};
use super::{TRAIN_RATIO, WINDOW_SIZE};

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Scaler(#[from] ScalerError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Persist(#[from] DataLoadError),
    #[error("corpus has no usable rows")]
    NoRecords,
    #[error("{rows} rows yield no windows of width {window}")]
    TooShort { rows: usize, window: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub window: usize,
    pub train_ratio: f64,
    pub degenerate: DegeneratePolicy,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            window: WINDOW_SIZE,
            train_ratio: TRAIN_RATIO,
            degenerate: DegeneratePolicy::default(),
        }
    }
}

/// Counts reported after a preprocessing run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSummary {
    /// Rows (hourly records or slots) that fed the scaler
    pub rows: usize,
    /// Rides outside every dispatch period
    pub skipped_rides: usize,
    pub windows: usize,
    pub train: usize,
    pub validation: usize,
}

/// Tensors and scalers ready to be written to disk
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub layout: FeatureLayout,
    pub tensors: TensorSet,
    pub scalers: ScalerBundle,
    pub summary: PreprocessSummary,
}

impl PreparedDataset {
    pub fn save(&self, paths: &ArtifactPaths) -> Result<(), DataLoadError> {
        save_tensors(paths, &self.tensors)?;
        save_scalers(paths, &self.scalers)?;
        tracing::info!(
            "Wrote {} training and {} validation windows to {}",
            self.summary.train,
            self.summary.validation,
            paths.data_dir.display()
        );
        Ok(())
    }
}

fn fit_scalers(
    rows: &[Vec<f64>],
    targets: &[f64],
    policy: DegeneratePolicy,
) -> Result<ScalerBundle, ScalerError> {
    Ok(ScalerBundle {
        features: MinMaxScaler::fit(rows, policy)?,
        target: MinMaxScaler::fit_column(targets, policy)?,
    })
}

/// Encoded rows of one time-ordered series, already scaled
struct ScaledSeries {
    matrix: Array2<f64>,
    target: Array1<f64>,
    times: Vec<NaiveDateTime>,
}

fn scale_series(
    rows: &[Vec<f64>],
    targets: &[f64],
    times: Vec<NaiveDateTime>,
    scalers: &ScalerBundle,
) -> Result<ScaledSeries, ScalerError> {
    let mut matrix = Array2::zeros((rows.len(), scalers.features.n_features()));
    for (mut out, row) in matrix.rows_mut().into_iter().zip(rows) {
        let scaled = scalers.features.transform(row)?;
        out.assign(&Array1::from(scaled));
    }
    let target = targets.iter().map(|&t| scalers.scale_target(t)).collect();
    Ok(ScaledSeries {
        matrix,
        target,
        times,
    })
}

fn finish(
    layout: FeatureLayout,
    windows: WindowSet,
    rows: usize,
    scalers: ScalerBundle,
    config: &PreprocessConfig,
) -> Result<PreparedDataset, PreprocessError> {
    if windows.is_empty() {
        return Err(PreprocessError::TooShort {
            rows,
            window: config.window,
        });
    }
    let tensors = chronological_split(&windows, config.train_ratio)?;
    let summary = PreprocessSummary {
        rows,
        skipped_rides: 0,
        windows: windows.len(),
        train: tensors.train_len(),
        validation: tensors.val_len(),
    };
    tracing::info!(
        "Built {} windows of shape {:?} from {} rows ({} train / {} validation)",
        summary.windows,
        windows.sample_shape(),
        rows,
        summary.train,
        summary.validation
    );
    Ok(PreparedDataset {
        layout,
        tensors,
        scalers,
        summary,
    })
}

/// Hourly weather corpus → one series windowed in timestamp order
pub fn prepare_hourly(
    records: &[HourlyRecord],
    config: &PreprocessConfig,
) -> Result<PreparedDataset, PreprocessError> {
    if records.is_empty() {
        return Err(PreprocessError::NoRecords);
    }
    let mut ordered: Vec<&HourlyRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.timestamp);

    let rows = ordered
        .iter()
        .map(|r| r.encode())
        .collect::<Result<Vec<_>, _>>()?;
    let targets: Vec<f64> = ordered.iter().map(|r| r.count).collect();
    let times: Vec<NaiveDateTime> = ordered.iter().map(|r| r.timestamp).collect();

    let scalers = fit_scalers(&rows, &targets, config.degenerate)?;
    let series = scale_series(&rows, &targets, times, &scalers)?;
    let windows = build_windows(
        series.matrix.view(),
        series.target.view(),
        &series.times,
        config.window,
    )?;

    finish(FeatureLayout::Hourly, windows, rows.len(), scalers, config)
}

/// Dispatch slots → per-region series windowed separately, then merged by
/// target time
///
/// One scaler is fitted over every region, so the codes stay comparable.
pub fn prepare_slots(
    slots: &[DemandSlot],
    config: &PreprocessConfig,
) -> Result<PreparedDataset, PreprocessError> {
    if slots.is_empty() {
        return Err(PreprocessError::NoRecords);
    }
    let rows = slots
        .iter()
        .map(|s| s.encode())
        .collect::<Result<Vec<_>, _>>()?;
    let targets: Vec<f64> = slots.iter().map(DemandSlot::target).collect();
    let scalers = fit_scalers(&rows, &targets, config.degenerate)?;

    let mut by_region: BTreeMap<Region, Vec<usize>> = BTreeMap::new();
    for (index, slot) in slots.iter().enumerate() {
        by_region.entry(slot.region).or_default().push(index);
    }

    let mut sets = Vec::with_capacity(by_region.len());
    for (region, mut indices) in by_region {
        indices.sort_by_key(|&i| slots[i].key);
        let region_rows: Vec<Vec<f64>> = indices.iter().map(|&i| rows[i].clone()).collect();
        let region_targets: Vec<f64> = indices.iter().map(|&i| targets[i]).collect();
        let times = indices.iter().map(|&i| slots[i].key.start()).collect();

        let series = scale_series(&region_rows, &region_targets, times, &scalers)?;
        let windows = build_windows(
            series.matrix.view(),
            series.target.view(),
            &series.times,
            config.window,
        )?;
        tracing::debug!(
            "{}: {} slots, {} windows",
            region,
            indices.len(),
            windows.len()
        );
        sets.push(windows);
    }

    let merged = WindowSet::merge_chronological(sets)?;
    finish(FeatureLayout::Slot, merged, rows.len(), scalers, config)
}

/// Ride export → slots → windows
pub fn prepare_rides(
    rides: &[RideRecord],
    config: &PreprocessConfig,
) -> Result<PreparedDataset, PreprocessError> {
    let aggregation = aggregate_slots(rides);
    if aggregation.skipped > 0 {
        tracing::warn!(
            "{} rides fall outside every dispatch period and were skipped",
            aggregation.skipped
        );
    }
    let mut prepared = prepare_slots(&aggregation.slots, config)?;
    prepared.summary.skipped_rides = aggregation.skipped;
    Ok(prepared)
}
