use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::ml::{
    ArtifactPaths, FeedForwardConfig, InferenceConfig, PreprocessConfig, RecurrentConfig,
};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub recurrent: RecurrentConfig,
    #[serde(default)]
    pub feedforward: FeedForwardConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Only the commands that touch the ride store need this.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Prepared tensor files
    pub data_dir: PathBuf,
    /// Scalers and trained models
    pub model_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_dir: PathBuf::from("models"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TrainingConfig {
    /// Seeds weight initialization, dropout and batch shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    /// Load with `local_file` in place of `./config.toml`.
    pub fn load_from(local_file: &Path) -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL").ok();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bike-demand");

        let defaults = PathsConfig::default();
        let builder = Config::builder()
            // 1. Default values
            .set_default("database.url", database_url)?
            .set_default("paths.data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("paths.model_dir", defaults.model_dir.to_string_lossy().to_string())?
            .set_default("training.seed", TrainingConfig::default().seed)?
            // 2. Local config file (optional)
            .add_source(File::from(local_file.to_path_buf()).required(false))
            // 3. User config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            // 4. Environment variables (BIKE_DEMAND__TRAINING__SEED=...)
            .add_source(Environment::with_prefix("BIKE_DEMAND").separator("__"));

        let s = builder.build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no pipeline stage can run with.
    pub fn validate(&self) -> Result<()> {
        let ratio = self.preprocess.train_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            anyhow::bail!("preprocess.train_ratio must lie in (0, 1), got {}", ratio);
        }
        if self.preprocess.window == 0 {
            anyhow::bail!("preprocess.window must be positive");
        }
        if self.inference.history_lookback_days <= 0 {
            anyhow::bail!("inference.history_lookback_days must be positive");
        }
        Ok(())
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.paths.data_dir, &self.paths.model_dir)
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("DATABASE_URL must be set (via .env file or environment variable)")
    }
}
