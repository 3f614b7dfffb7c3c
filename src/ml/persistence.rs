//! Model, scaler and tensor files

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array3, ArrayView3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::features::FeatureLayout;
use super::layers::{ParamError, WeightSnapshot};
use super::network::{
    FeedForwardArchitecture, FeedForwardNet, ModelKind, RecurrentArchitecture, RecurrentNet,
    Regressor,
};
use super::scaler::{MinMaxScaler, ScalerBundle};
use super::sequence::TensorSet;
use super::training::{Metrics, TrainingHistory};

/// Errors reading or writing persisted pipeline state
#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("failed to encode {path}: {reason}")]
    Encode { path: String, reason: String },
    #[error("{path} was written by format version {found}, this build reads up to {expected}")]
    VersionMismatch {
        path: String,
        expected: u32,
        found: u32,
    },
    #[error("{what} is shaped {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("tensor backend failed: {0}")]
    Backend(#[from] candle_core::Error),
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), DataLoadError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DataLoadError::Io {
            path: display(parent),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| DataLoadError::Io {
        path: display(path),
        source,
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, DataLoadError> {
    if !path.exists() {
        return Err(DataLoadError::NotFound(display(path)));
    }
    fs::read(path).map_err(|source| DataLoadError::Io {
        path: display(path),
        source,
    })
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<(), DataLoadError> {
    let bytes = bincode::serialize(value).map_err(|e| DataLoadError::Encode {
        path: display(path),
        reason: e.to_string(),
    })?;
    write_bytes(path, &bytes)
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let bytes = read_bytes(path)?;
    bincode::deserialize(&bytes).map_err(|e| DataLoadError::Malformed {
        path: display(path),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DataLoadError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| DataLoadError::Encode {
        path: display(path),
        reason: e.to_string(),
    })?;
    write_bytes(path, text.as_bytes())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let bytes = read_bytes(path)?;
    serde_json::from_slice(&bytes).map_err(|e| DataLoadError::Malformed {
        path: display(path),
        reason: e.to_string(),
    })
}

// ==================== Paths ====================

/// Where the pipeline keeps its files
///
/// Tensors live in `data_dir`; scalers and model artifacts in `model_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(data_dir: impl Into<PathBuf>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            model_dir: model_dir.into(),
        }
    }

    pub fn x_train(&self) -> PathBuf {
        self.data_dir.join("x_train.bin")
    }

    pub fn y_train(&self) -> PathBuf {
        self.data_dir.join("y_train.bin")
    }

    pub fn x_val(&self) -> PathBuf {
        self.data_dir.join("x_val.bin")
    }

    pub fn y_val(&self) -> PathBuf {
        self.data_dir.join("y_val.bin")
    }

    pub fn scaler_x(&self) -> PathBuf {
        self.model_dir.join("scaler_x.json")
    }

    pub fn scaler_y(&self) -> PathBuf {
        self.model_dir.join("scaler_y.json")
    }

    pub fn model(&self, kind: ModelKind) -> PathBuf {
        self.model_dir.join(kind.file_name())
    }
}

// ==================== Tensors ====================

pub fn save_tensors(paths: &ArtifactPaths, tensors: &TensorSet) -> Result<(), DataLoadError> {
    write_bincode(&paths.x_train(), &tensors.x_train)?;
    write_bincode(&paths.y_train(), &tensors.y_train)?;
    write_bincode(&paths.x_val(), &tensors.x_val)?;
    write_bincode(&paths.y_val(), &tensors.y_val)?;
    Ok(())
}

/// Load the four training tensors, checking they agree with each other
pub fn load_tensors(paths: &ArtifactPaths) -> Result<TensorSet, DataLoadError> {
    let x_train: Array3<f64> = read_bincode(&paths.x_train())?;
    let y_train: Array1<f64> = read_bincode(&paths.y_train())?;
    let x_val: Array3<f64> = read_bincode(&paths.x_val())?;
    let y_val: Array1<f64> = read_bincode(&paths.y_val())?;

    if x_train.dim().0 != y_train.len() {
        return Err(DataLoadError::ShapeMismatch {
            what: display(&paths.y_train()),
            expected: vec![x_train.dim().0],
            found: vec![y_train.len()],
        });
    }
    if x_val.dim().0 != y_val.len() {
        return Err(DataLoadError::ShapeMismatch {
            what: display(&paths.y_val()),
            expected: vec![x_val.dim().0],
            found: vec![y_val.len()],
        });
    }
    let (_, tw, tf) = x_train.dim();
    let (_, vw, vf) = x_val.dim();
    if x_val.dim().0 > 0 && (tw, tf) != (vw, vf) {
        return Err(DataLoadError::ShapeMismatch {
            what: display(&paths.x_val()),
            expected: vec![tw, tf],
            found: vec![vw, vf],
        });
    }

    tracing::info!(
        "Loaded tensors: train {:?}, validation {:?}",
        x_train.shape(),
        x_val.shape()
    );
    Ok(TensorSet {
        x_train,
        y_train,
        x_val,
        y_val,
    })
}

// ==================== Scalers ====================

pub fn save_scalers(paths: &ArtifactPaths, scalers: &ScalerBundle) -> Result<(), DataLoadError> {
    write_json(&paths.scaler_x(), &scalers.features)?;
    write_json(&paths.scaler_y(), &scalers.target)?;
    Ok(())
}

pub fn load_scalers(paths: &ArtifactPaths) -> Result<ScalerBundle, DataLoadError> {
    let features: MinMaxScaler = read_json(&paths.scaler_x())?;
    let target: MinMaxScaler = read_json(&paths.scaler_y())?;
    if target.n_features() != 1 {
        return Err(DataLoadError::ShapeMismatch {
            what: display(&paths.scaler_y()),
            expected: vec![1],
            found: vec![target.n_features()],
        });
    }
    Ok(ScalerBundle { features, target })
}

// ==================== Model artifacts ====================

/// Architecture of either regressor, enough to rebuild its layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkArchitecture {
    Recurrent(RecurrentArchitecture),
    FeedForward(FeedForwardArchitecture),
}

impl NetworkArchitecture {
    fn window_shape(&self) -> [usize; 2] {
        match self {
            NetworkArchitecture::Recurrent(arch) => [arch.window, arch.features],
            NetworkArchitecture::FeedForward(arch) => [arch.window, arch.features],
        }
    }
}

/// A trained regressor of either kind
#[derive(Debug, Clone)]
pub enum ModelWeights {
    Recurrent(RecurrentNet),
    FeedForward(FeedForwardNet),
}

impl ModelWeights {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelWeights::Recurrent(net) => net.kind(),
            ModelWeights::FeedForward(net) => net.kind(),
        }
    }

    fn window_shape(&self) -> [usize; 2] {
        match self {
            ModelWeights::Recurrent(net) => net.window_shape(),
            ModelWeights::FeedForward(net) => net.window_shape(),
        }
    }

    fn input_shape(&self) -> Vec<usize> {
        match self {
            ModelWeights::Recurrent(net) => net.input_shape(),
            ModelWeights::FeedForward(net) => net.input_shape(),
        }
    }

    fn predict(&self, x: ArrayView3<f64>) -> candle_core::Result<Array1<f64>> {
        match self {
            ModelWeights::Recurrent(net) => net.predict(x),
            ModelWeights::FeedForward(net) => net.predict(x),
        }
    }

    pub fn architecture(&self) -> NetworkArchitecture {
        match self {
            ModelWeights::Recurrent(net) => {
                NetworkArchitecture::Recurrent(net.architecture().clone())
            }
            ModelWeights::FeedForward(net) => {
                NetworkArchitecture::FeedForward(net.architecture().clone())
            }
        }
    }

    pub fn snapshot(&self) -> candle_core::Result<WeightSnapshot> {
        match self {
            ModelWeights::Recurrent(net) => net.params().snapshot(),
            ModelWeights::FeedForward(net) => net.params().snapshot(),
        }
    }

    /// Rebuild the layers for `arch` and load `snapshot` into them
    pub fn restore(
        arch: NetworkArchitecture,
        snapshot: &WeightSnapshot,
    ) -> Result<Self, ParamError> {
        Ok(match arch {
            NetworkArchitecture::Recurrent(arch) => {
                ModelWeights::Recurrent(RecurrentNet::from_snapshot(arch, snapshot)?)
            }
            NetworkArchitecture::FeedForward(arch) => {
                ModelWeights::FeedForward(FeedForwardNet::from_snapshot(arch, snapshot)?)
            }
        })
    }
}

/// On-disk form of a `ModelArtifact`
#[derive(Debug, Serialize, Deserialize)]
struct StoredArtifact {
    version: u32,
    layout: FeatureLayout,
    window_shape: [usize; 2],
    trained_at: DateTime<Utc>,
    metrics: Metrics,
    history: TrainingHistory,
    network: NetworkArchitecture,
    weights: WeightSnapshot,
}

/// A trained model with everything needed to serve and judge it
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    /// Format version for backward compatibility
    pub version: u32,
    pub layout: FeatureLayout,
    /// `(window, features)` the model was trained on
    pub window_shape: [usize; 2],
    pub trained_at: DateTime<Utc>,
    /// Validation metrics in original units
    pub metrics: Metrics,
    pub history: TrainingHistory,
    pub weights: ModelWeights,
}

impl ModelArtifact {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(
        layout: FeatureLayout,
        window_shape: [usize; 2],
        trained_at: DateTime<Utc>,
        metrics: Metrics,
        history: TrainingHistory,
        weights: ModelWeights,
    ) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            layout,
            window_shape,
            trained_at,
            metrics,
            history,
            weights,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.weights.kind()
    }

    /// Shape of one sample as the network consumes it: `[24, F]` or `[24 * F]`
    pub fn input_shape(&self) -> Vec<usize> {
        self.weights.input_shape()
    }

    /// Normalized predictions for `(n, window, features)` windows
    pub fn predict(&self, x: ArrayView3<f64>) -> Result<Array1<f64>, DataLoadError> {
        let (_, w, f) = x.dim();
        let expected = self.weights.window_shape();
        if [w, f] != expected {
            return Err(DataLoadError::ShapeMismatch {
                what: format!("{} input", self.kind()),
                expected: expected.to_vec(),
                found: vec![w, f],
            });
        }
        Ok(self.weights.predict(x)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), DataLoadError> {
        let weights = self.weights.snapshot().map_err(|e| DataLoadError::Encode {
            path: display(path),
            reason: e.to_string(),
        })?;
        let stored = StoredArtifact {
            version: self.version,
            layout: self.layout,
            window_shape: self.window_shape,
            trained_at: self.trained_at,
            metrics: self.metrics,
            history: self.history.clone(),
            network: self.weights.architecture(),
            weights,
        };
        write_bincode(path, &stored)?;
        tracing::info!("Saved {} model to {}", self.kind(), path.display());
        Ok(())
    }

    /// Read an artifact and rebuild its network
    ///
    /// Every stored tensor must match the layer shapes implied by the
    /// stored architecture.
    pub fn load(path: &Path) -> Result<Self, DataLoadError> {
        let stored: StoredArtifact = read_bincode(path)?;

        if stored.version > Self::CURRENT_VERSION {
            return Err(DataLoadError::VersionMismatch {
                path: display(path),
                expected: Self::CURRENT_VERSION,
                found: stored.version,
            });
        }
        if stored.window_shape != stored.network.window_shape() {
            return Err(DataLoadError::Malformed {
                path: display(path),
                reason: format!(
                    "header shape {:?} disagrees with network {:?}",
                    stored.window_shape,
                    stored.network.window_shape()
                ),
            });
        }

        let restored = ModelWeights::restore(stored.network, &stored.weights);
        let weights = restored.map_err(|e| match e {
            ParamError::Shape {
                name,
                expected,
                found,
            } => DataLoadError::ShapeMismatch {
                what: format!("{} weight {}", display(path), name),
                expected,
                found,
            },
            other => DataLoadError::Malformed {
                path: display(path),
                reason: other.to_string(),
            },
        })?;

        Ok(Self {
            version: stored.version,
            layout: stored.layout,
            window_shape: stored.window_shape,
            trained_at: stored.trained_at,
            metrics: stored.metrics,
            history: stored.history,
            weights,
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "{} v{}: input {:?}, MAE={:.2} RMSE={:.2} R²={:.4}, best epoch {} of {}, trained {}",
            self.kind(),
            self.version,
            self.input_shape(),
            self.metrics.mae,
            self.metrics.rmse,
            self.metrics.r2,
            self.history.best_epoch,
            self.history.epochs.len(),
            self.trained_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::scaler::DegeneratePolicy;
    use crate::ml::training::{FeedForwardConfig, RecurrentConfig};
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn metrics() -> Metrics {
        Metrics {
            mae: 88.8,
            rmse: 126.02,
            r2: 0.82,
            samples: 196,
        }
    }

    fn recurrent_artifact() -> ModelArtifact {
        let mut rng = StdRng::seed_from_u64(1);
        let config = RecurrentConfig {
            first_units: 4,
            second_units: 3,
            dense_units: 2,
            ..RecurrentConfig::default()
        };
        let net = RecurrentNet::new(24, 7, &config, &mut rng).unwrap();
        ModelArtifact::new(
            FeatureLayout::Slot,
            [24, 7],
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap(),
            metrics(),
            TrainingHistory::default(),
            ModelWeights::Recurrent(net),
        )
    }

    fn paths(dir: &Path) -> ArtifactPaths {
        ArtifactPaths::new(dir.join("data"), dir.join("models"))
    }

    #[test]
    fn test_artifact_save_and_load() {
        let dir = tempdir().unwrap();
        let path = paths(dir.path()).model(ModelKind::Recurrent);
        let artifact = recurrent_artifact();
        artifact.save(&path).unwrap();

        let loaded = ModelArtifact::load(&path).unwrap();
        assert_eq!(loaded.kind(), ModelKind::Recurrent);
        assert_eq!(loaded.input_shape(), vec![24, 7]);
        assert_eq!(loaded.metrics, artifact.metrics);

        let x = Array3::from_elem((2, 24, 7), 0.5);
        assert_eq!(loaded.predict(x.view()).unwrap(), artifact.predict(x.view()).unwrap());
    }

    #[test]
    fn test_feedforward_artifact_input_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = FeedForwardConfig {
            hidden_units: vec![8, 4],
            ..FeedForwardConfig::default()
        };
        let net = FeedForwardNet::new(24, 7, &config, &mut rng).unwrap();
        let artifact = ModelArtifact::new(
            FeatureLayout::Slot,
            [24, 7],
            Utc::now(),
            metrics(),
            TrainingHistory::default(),
            ModelWeights::FeedForward(net),
        );
        assert_eq!(artifact.input_shape(), vec![168]);
        assert_eq!(artifact.kind(), ModelKind::FeedForward);
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let artifact = recurrent_artifact();
        let x = Array3::zeros((1, 24, 11));
        assert!(matches!(
            artifact.predict(x.view()),
            Err(DataLoadError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_nonexistent() {
        let result = ModelArtifact::load(Path::new("/nonexistent/path/recurrent.bin"));
        assert!(matches!(result, Err(DataLoadError::NotFound(_))));
    }

    #[test]
    fn test_load_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recurrent.bin");
        fs::write(&path, b"not a model").unwrap();
        assert!(matches!(
            ModelArtifact::load(&path),
            Err(DataLoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_newer_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recurrent.bin");
        let mut artifact = recurrent_artifact();
        artifact.version = ModelArtifact::CURRENT_VERSION + 1;
        artifact.save(&path).unwrap();
        assert!(matches!(
            ModelArtifact::load(&path),
            Err(DataLoadError::VersionMismatch { found: 2, .. })
        ));
    }

    #[test]
    fn test_load_rejects_weights_for_other_input_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recurrent.bin");
        recurrent_artifact().save(&path).unwrap();

        // claim 11 features while the stored first layer was built for 7
        let mut stored: StoredArtifact = read_bincode(&path).unwrap();
        stored.window_shape = [24, 11];
        if let NetworkArchitecture::Recurrent(arch) = &mut stored.network {
            arch.features = 11;
        }
        write_bincode(&path, &stored).unwrap();

        match ModelArtifact::load(&path) {
            Err(DataLoadError::ShapeMismatch {
                what,
                expected,
                found,
            }) => {
                assert!(what.contains("lstm1.weight_ih_l0"), "{}", what);
                assert_eq!(expected, vec![16, 11]);
                assert_eq!(found, vec![16, 7]);
            }
            other => panic!("expected a shape mismatch, got {:?}", other.map(|a| a.kind())),
        }
    }

    #[test]
    fn test_load_rejects_truncated_tensor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recurrent.bin");
        recurrent_artifact().save(&path).unwrap();

        let mut stored: StoredArtifact = read_bincode(&path).unwrap();
        if let Some(tensor) = stored.weights.tensors.get_mut("output.weight") {
            tensor.values.pop();
        }
        write_bincode(&path, &stored).unwrap();

        assert!(matches!(
            ModelArtifact::load(&path),
            Err(DataLoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_rejects_header_disagreeing_with_network() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recurrent.bin");
        recurrent_artifact().save(&path).unwrap();

        let mut stored: StoredArtifact = read_bincode(&path).unwrap();
        stored.window_shape = [12, 7];
        write_bincode(&path, &stored).unwrap();

        assert!(matches!(
            ModelArtifact::load(&path),
            Err(DataLoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_summary() {
        let summary = recurrent_artifact().summary();
        assert!(summary.starts_with("recurrent v1"));
        assert!(summary.contains("R²=0.8200"));
        assert!(summary.contains("2024-06-01 08:30 UTC"));
    }

    #[test]
    fn test_tensors_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let tensors = TensorSet {
            x_train: Array3::from_shape_fn((5, 24, 7), |(i, t, f)| (i + t + f) as f64 * 0.01),
            y_train: Array1::linspace(0.0, 1.0, 5),
            x_val: Array3::from_elem((2, 24, 7), 0.25),
            y_val: Array1::from(vec![0.1, 0.9]),
        };
        save_tensors(&paths, &tensors).unwrap();

        assert!(paths.x_train().exists());
        assert_eq!(load_tensors(&paths).unwrap(), tensors);
    }

    #[test]
    fn test_tensors_missing_file_is_fatal() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_tensors(&paths(dir.path())),
            Err(DataLoadError::NotFound(_))
        ));
    }

    #[test]
    fn test_tensors_length_mismatch() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let tensors = TensorSet {
            x_train: Array3::zeros((5, 2, 1)),
            y_train: Array1::zeros(4),
            x_val: Array3::zeros((1, 2, 1)),
            y_val: Array1::zeros(1),
        };
        save_tensors(&paths, &tensors).unwrap();
        assert!(matches!(
            load_tensors(&paths),
            Err(DataLoadError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_scalers_roundtrip_is_exact() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let rows = vec![vec![0.1 + 0.2, -7.25], vec![1.0 / 3.0, 1e9]];
        let bundle = ScalerBundle {
            features: MinMaxScaler::fit(&rows, DegeneratePolicy::Reject).unwrap(),
            target: MinMaxScaler::fit_column(&[1.0, 977.0], DegeneratePolicy::Reject).unwrap(),
        };
        save_scalers(&paths, &bundle).unwrap();

        let text = fs::read_to_string(paths.scaler_x()).unwrap();
        assert!(text.contains("\"min\""));
        assert_eq!(load_scalers(&paths).unwrap(), bundle);
    }

    #[test]
    fn test_target_scaler_must_be_single_column() {
        let dir = tempdir().unwrap();
        let paths = paths(dir.path());
        let rows = vec![vec![0.0, 1.0], vec![1.0, 2.0]];
        let wide = MinMaxScaler::fit(&rows, DegeneratePolicy::Reject).unwrap();
        save_scalers(
            &paths,
            &ScalerBundle {
                features: wide.clone(),
                target: wide,
            },
        )
        .unwrap();
        assert!(matches!(
            load_scalers(&paths),
            Err(DataLoadError::ShapeMismatch { .. })
        ));
    }
}
