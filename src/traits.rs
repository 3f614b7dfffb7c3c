//! Abstractions for time and side effects to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for deterministic testing
//! - `HistorySource`: Where recent rides come from when scoring a query
//! - `PredictionSink`: Where finished forecasts are recorded

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, Local, NaiveDateTime, Utc};

use crate::ml::{PredictionRecord, Region, RideRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// This allows injecting mock clocks during testing to create
/// deterministic, reproducible tests for time-dependent logic.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current time in the local timezone.
    fn now_local(&self) -> DateTime<Local>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *lock(&self.utc_time) = time;
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = lock(&self.utc_time);
        *time += duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *lock(&self.utc_time)
    }

    fn now_local(&self) -> DateTime<Local> {
        self.now_utc().with_timezone(&Local)
    }
}

// ==================== History Source ====================

/// Upstream store of observed rides.
pub trait HistorySource: Send + Sync {
    /// Rides of `region` that started in `[from, until)`, oldest first.
    fn rides_between(
        &self,
        region: Region,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> impl Future<Output = Result<Vec<RideRecord>>> + Send;
}

/// In-memory ride history for tests and offline scoring.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    rides: Arc<Mutex<Vec<RideRecord>>>,
}

impl MemoryHistory {
    pub fn new(rides: Vec<RideRecord>) -> Self {
        Self {
            rides: Arc::new(Mutex::new(rides)),
        }
    }

    pub fn push(&self, ride: RideRecord) {
        lock(&self.rides).push(ride);
    }

    pub fn len(&self) -> usize {
        lock(&self.rides).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySource for MemoryHistory {
    async fn rides_between(
        &self,
        region: Region,
        from: NaiveDateTime,
        until: NaiveDateTime,
    ) -> Result<Vec<RideRecord>> {
        let mut rides: Vec<RideRecord> = lock(&self.rides)
            .iter()
            .filter(|r| r.region == region && r.timestamp >= from && r.timestamp < until)
            .cloned()
            .collect();
        rides.sort_by_key(|r| r.timestamp);
        Ok(rides)
    }
}

// ==================== Prediction Sink ====================

/// Downstream store of finished forecasts.
pub trait PredictionSink: Send + Sync {
    fn record(&self, prediction: &PredictionRecord) -> impl Future<Output = Result<()>> + Send;
}

/// Sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<PredictionRecord>>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Get all records written so far.
    pub fn records(&self) -> Vec<PredictionRecord> {
        lock(&self.records).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.records).len()
    }
}

impl PredictionSink for MemorySink {
    async fn record(&self, prediction: &PredictionRecord) -> Result<()> {
        if self.fail {
            bail!("prediction store unavailable");
        }
        lock(&self.records).push(prediction.clone());
        Ok(())
    }
}
