use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::ml::{FeatureError, ModelKind, PredictionRecord, Region, RideRecord};
use crate::traits::{HistorySource, PredictionSink};

/// A ride as stored in `ride_records`.
#[derive(Debug, Clone, FromRow)]
pub struct RideRow {
    /// Populated by SQLx.
    #[allow(dead_code)]
    pub id: i64,
    pub region: String,
    pub ride_datetime: NaiveDateTime,
    pub duration: f64,
    pub distance: f64,
    pub temperature: f64,
    pub wind_speed: f64,
    pub weather: String,
}

impl RideRow {
    pub fn into_record(self) -> Result<RideRecord, FeatureError> {
        Ok(RideRecord {
            region: self.region.parse()?,
            timestamp: self.ride_datetime,
            duration: self.duration,
            distance: self.distance,
            temperature: self.temperature,
            windspeed: self.wind_speed,
            weather: self.weather.parse()?,
        })
    }
}

/// A forecast as stored in `prediction_results`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PredictionRow {
    #[allow(dead_code)]
    pub id: i64,
    pub region: String,
    pub time_period: String,
    pub predict_date: NaiveDate,
    pub demand_count: i32,
    pub model_used: String,
    pub accuracy: f64,
    pub created_at: DateTime<Utc>,
}

impl PredictionRow {
    pub fn into_record(self) -> Result<PredictionRecord> {
        let model_used: ModelKind = self
            .model_used
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(PredictionRecord {
            region: self.region.parse()?,
            time_period: self.time_period.parse()?,
            predict_date: self.predict_date,
            demand_count: u32::try_from(self.demand_count)
                .context("Stored demand count is negative")?,
            model_used,
            accuracy: self.accuracy,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub async fn insert_ride(&self, ride: &RideRecord) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO ride_records
                (region, ride_datetime, duration, distance, temperature, wind_speed, weather)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(ride.region.as_str())
        .bind(ride.timestamp)
        .bind(ride.duration)
        .bind(ride.distance)
        .bind(ride.temperature)
        .bind(ride.windspeed)
        .bind(ride.weather.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert ride record")?;

        Ok(id)
    }

    /// Insert rides inside one transaction.
    pub async fn batch_insert_rides(&self, rides: &[RideRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;
        for ride in rides {
            sqlx::query(
                "INSERT INTO ride_records
                    (region, ride_datetime, duration, distance, temperature, wind_speed, weather)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(ride.region.as_str())
            .bind(ride.timestamp)
            .bind(ride.duration)
            .bind(ride.distance)
            .bind(ride.temperature)
            .bind(ride.windspeed)
            .bind(ride.weather.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to insert ride record")?;
        }
        tx.commit().await.context("Failed to commit ride batch")?;
        Ok(())
    }

    /// Rides of one region in `[from, until)`, oldest first.
    ///
    /// Rows with labels outside the closed categories are skipped with a warning.
    pub async fn get_rides_range(
        &self,
        region: Region,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Result<Vec<RideRecord>> {
        let rows = sqlx::query_as::<_, RideRow>(
            "SELECT id, region, ride_datetime, duration, distance, temperature, wind_speed, weather
             FROM ride_records
             WHERE region = $1 AND ride_datetime >= $2 AND ride_datetime < $3
             ORDER BY ride_datetime ASC",
        )
        .bind(region.as_str())
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ride history")?;

        let mut rides = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_record() {
                Ok(ride) => rides.push(ride),
                Err(e) => tracing::warn!("Skipping ride {}: {}", id, e),
            }
        }
        Ok(rides)
    }

    /// Every stored ride, oldest first.
    pub async fn get_all_rides(&self) -> Result<Vec<RideRecord>> {
        let rows = sqlx::query_as::<_, RideRow>(
            "SELECT id, region, ride_datetime, duration, distance, temperature, wind_speed, weather
             FROM ride_records
             ORDER BY ride_datetime ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch rides")?;

        let total = rows.len();
        let rides: Vec<RideRecord> = rows
            .into_iter()
            .filter_map(|row| row.into_record().ok())
            .collect();
        if rides.len() < total {
            tracing::warn!("Skipped {} stored rides with unknown labels", total - rides.len());
        }
        Ok(rides)
    }

    pub async fn insert_prediction(&self, record: &PredictionRecord) -> Result<i64> {
        let demand_count =
            i32::try_from(record.demand_count).context("Demand count exceeds column range")?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO prediction_results
                (region, time_period, predict_date, demand_count, model_used, accuracy, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(record.region.as_str())
        .bind(record.time_period.as_str())
        .bind(record.predict_date)
        .bind(demand_count)
        .bind(record.model_used.as_str())
        .bind(record.accuracy)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert prediction result")?;

        Ok(id)
    }

    /// Predictions made for a date, newest first.
    pub async fn get_predictions_for_date(&self, date: NaiveDate) -> Result<Vec<PredictionRow>> {
        let rows = sqlx::query_as::<_, PredictionRow>(
            "SELECT id, region, time_period, predict_date, demand_count, model_used, accuracy, created_at
             FROM prediction_results
             WHERE predict_date = $1
             ORDER BY created_at DESC",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch predictions for date")?;

        Ok(rows)
    }
}

impl HistorySource for Database {
    async fn rides_between(
        &self,
        region: Region,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Result<Vec<RideRecord>> {
        self.get_rides_range(region, from, until).await
    }
}

impl PredictionSink for Database {
    async fn record(&self, prediction: &PredictionRecord) -> Result<()> {
        self.insert_prediction(prediction).await.map(|_| ())
    }
}
