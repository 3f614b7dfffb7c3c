use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bike_demand::ml::dataset::{load_hourly_csv, load_rides_csv};
use bike_demand::ml::persistence::{load_scalers, load_tensors};
use bike_demand::ml::preprocess::{prepare_hourly, prepare_rides};
use bike_demand::ml::training::TrainingRun;
use bike_demand::ml::{
    DispatchQuery, FeatureLayout, InferenceService, LoadedModels, ModelArtifact, ModelComparison,
    ModelKind, PreparedDataset,
};
use bike_demand::traits::{HistorySource, MemoryHistory, MemorySink, PredictionSink};
use bike_demand::{Clock, SystemClock, config::AppConfig, db::Database};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "bike-demand")]
#[command(about = "Bike-sharing demand forecasting - preprocess, train and score dispatch queries")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build normalized training windows and fit the scalers
    Preprocess {
        /// CSV corpus; rides are read from the database when omitted
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Corpus::Rides)]
        corpus: Corpus,
    },
    /// Load a ride CSV export into the database
    ImportRides {
        #[arg(long)]
        input: PathBuf,
    },
    /// Train models on the prepared windows
    Train {
        #[arg(long, value_enum, default_value_t = ModelChoice::Both)]
        model: ModelChoice,
    },
    /// Forecast vehicle demand for one region and period
    Predict {
        #[arg(long)]
        region: String,
        #[arg(long)]
        period: String,
        #[arg(long)]
        weather: String,
        #[arg(long, allow_negative_numbers = true)]
        temperature: f64,
        /// Day being forecast (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
        /// Ride CSV used as history when no database is configured
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Print validation metrics of the trained models side by side
    #[command(alias = "evaluate")]
    Compare,
    /// List stored predictions for a date as JSON lines
    Predictions {
        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Corpus {
    Hourly,
    Rides,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModelChoice {
    Recurrent,
    Feedforward,
    Both,
}

impl ModelChoice {
    fn kinds(self) -> &'static [ModelKind] {
        match self {
            ModelChoice::Recurrent => &[ModelKind::Recurrent],
            ModelChoice::Feedforward => &[ModelKind::FeedForward],
            ModelChoice::Both => &[ModelKind::Recurrent, ModelKind::FeedForward],
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("bike_demand=debug");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let config = Arc::new(config);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    match args.command {
        Command::Preprocess { input, corpus } => run_preprocess(&rt, &config, input, corpus),
        Command::ImportRides { input } => rt.block_on(import_rides(&config, input)),
        Command::Train { model } => run_train(&config, model),
        Command::Predict {
            region,
            period,
            weather,
            temperature,
            date,
            history,
        } => {
            let query = DispatchQuery {
                region,
                time_period: period,
                weather,
                temperature,
                predict_date: date,
            };
            rt.block_on(run_predict(config, query, history))
        }
        Command::Compare => run_compare(&config),
        Command::Predictions { date } => rt.block_on(list_predictions(&config, date)),
    }
}

fn run_preprocess(
    rt: &tokio::runtime::Runtime,
    config: &AppConfig,
    input: Option<PathBuf>,
    corpus: Corpus,
) -> Result<()> {
    let prepared: PreparedDataset = match (corpus, input) {
        (Corpus::Hourly, Some(path)) => {
            let report = load_hourly_csv(&path).context("Failed to load hourly corpus")?;
            report.log_summary("hourly");
            prepare_hourly(&report.records, &config.preprocess)?
        }
        (Corpus::Hourly, None) => anyhow::bail!("--input is required for the hourly corpus"),
        (Corpus::Rides, Some(path)) => {
            let report = load_rides_csv(&path).context("Failed to load ride corpus")?;
            report.log_summary("rides");
            prepare_rides(&report.records, &config.preprocess)?
        }
        (Corpus::Rides, None) => {
            let rides = rt.block_on(async {
                let database = Database::new(config.database_url()?).await?;
                database.get_all_rides().await
            })?;
            tracing::info!("Loaded {} rides from the database", rides.len());
            prepare_rides(&rides, &config.preprocess)?
        }
    };

    prepared
        .save(&config.artifact_paths())
        .context("Failed to write prepared dataset")?;
    let s = &prepared.summary;
    tracing::info!(
        "Preprocessing done: {} rows → {} windows ({} train / {} validation), {} rides skipped",
        s.rows,
        s.windows,
        s.train,
        s.validation,
        s.skipped_rides
    );
    Ok(())
}

async fn import_rides(config: &AppConfig, input: PathBuf) -> Result<()> {
    let report = load_rides_csv(&input).context("Failed to load ride corpus")?;
    report.log_summary("rides");

    tracing::info!("Connecting to database...");
    let database = Database::new(config.database_url()?).await?;
    database.batch_insert_rides(&report.records).await?;
    tracing::info!("Imported {} rides", report.accepted());
    Ok(())
}

fn run_train(config: &AppConfig, choice: ModelChoice) -> Result<()> {
    let paths = config.artifact_paths();
    let data = load_tensors(&paths).context("Failed to load prepared tensors")?;
    let scalers = load_scalers(&paths).context("Failed to load scalers")?;

    let (_, _, width) = data.x_train.dim();
    let layout = FeatureLayout::from_width(width)
        .with_context(|| format!("No feature layout has {} columns", width))?;
    tracing::info!(
        "Training on {} windows, validating on {} ({:?} layout)",
        data.train_len(),
        data.val_len(),
        layout
    );

    let run = TrainingRun {
        data: &data,
        scalers: &scalers,
        layout,
        seed: config.training.seed,
        trained_at: SystemClock.now_utc(),
    };

    let mut artifacts = Vec::new();
    for &kind in choice.kinds() {
        let (artifact, _) = match kind {
            ModelKind::Recurrent => run.recurrent(&config.recurrent)?,
            ModelKind::FeedForward => run.feedforward(&config.feedforward)?,
        };
        artifact.save(&paths.model(kind))?;
        artifacts.push(artifact);
    }

    if artifacts.len() > 1 {
        println!("{}", ModelComparison::from_artifacts(&artifacts).render());
    }
    Ok(())
}

async fn run_predict(
    config: Arc<AppConfig>,
    query: DispatchQuery,
    history: Option<PathBuf>,
) -> Result<()> {
    let models = LoadedModels::load(&config.artifact_paths()).context("Failed to load models")?;
    let service = InferenceService::new(
        Arc::new(models),
        config.inference.clone(),
        Arc::new(SystemClock),
    );

    match config.database.url.as_deref() {
        Some(url) => {
            let database = Database::new(url).await?;
            score(&service, &query, &database, &database).await
        }
        None => {
            let rides = match history {
                Some(path) => load_rides_csv(&path)
                    .context("Failed to load ride history")?
                    .records,
                None => Vec::new(),
            };
            tracing::warn!("DATABASE_URL is not set, the prediction will not be stored");
            let sink = MemorySink::new();
            score(&service, &query, &MemoryHistory::new(rides), &sink).await
        }
    }
}

async fn score<H: HistorySource, S: PredictionSink>(
    service: &InferenceService,
    query: &DispatchQuery,
    history: &H,
    sink: &S,
) -> Result<()> {
    let forecast = service.predict(query, history, sink).await?;
    let record = &forecast.record;
    let feedforward = forecast
        .feedforward_demand
        .map_or_else(|| "n/a".to_string(), |count| count.to_string());
    println!(
        "{} {} on {}: dispatch {} vehicles ({} model, accuracy {:.2}%; feedforward says {})",
        record.region,
        record.time_period,
        record.predict_date,
        record.demand_count,
        record.model_used,
        record.accuracy,
        feedforward
    );
    Ok(())
}

fn run_compare(config: &AppConfig) -> Result<()> {
    let paths = config.artifact_paths();
    let mut artifacts = Vec::new();
    for kind in [ModelKind::Recurrent, ModelKind::FeedForward] {
        match ModelArtifact::load(&paths.model(kind)) {
            Ok(artifact) => {
                tracing::info!("{}", artifact.summary());
                artifacts.push(artifact);
            }
            Err(e) => tracing::warn!("Skipping {} model: {}", kind, e),
        }
    }
    if artifacts.is_empty() {
        anyhow::bail!("No trained models found in {}", paths.model_dir.display());
    }

    let comparison = ModelComparison::from_artifacts(&artifacts);
    println!("{}", comparison.render());
    if let Some(best) = comparison.best() {
        println!(
            "Best model: {} (R² {:.4}){}",
            best.kind,
            best.metrics.r2,
            if best.acceptable { "" } else { ", below the deployment threshold" }
        );
    }
    Ok(())
}

async fn list_predictions(config: &AppConfig, date: NaiveDate) -> Result<()> {
    let database = Database::new(config.database_url()?).await?;
    let rows = database.get_predictions_for_date(date).await?;
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    tracing::info!("{} predictions stored for {}", rows.len(), date);
    Ok(())
}
