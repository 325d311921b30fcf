// Workout history for the treadlink CLI
//
// Every finished walk is stored as one JSON record in a local sled database.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::PathBuf;
use treadlink_core::WorkoutSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkoutRecord {
    /// Unique record ID
    pub id: String,

    /// When the walk was saved (unix seconds)
    pub timestamp: u64,

    pub steps: u32,

    pub distance_km: f64,

    pub duration_secs: u32,

    /// Whole minutes, the unit the walk log has always used
    pub duration_minutes: u32,
}

impl WorkoutRecord {
    pub fn from_summary(summary: &WorkoutSummary) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            steps: summary.steps,
            distance_km: summary.distance_km,
            duration_secs: summary.duration_secs,
            duration_minutes: summary.duration_minutes(),
        }
    }

    pub fn formatted_time(&self) -> String {
        let dt = DateTime::from_timestamp(self.timestamp as i64, 0).unwrap_or_else(Utc::now);
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

pub struct WorkoutStore {
    db: Db,
}

impl WorkoutStore {
    /// Open or create the workout database
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = sled::open(path).context("Failed to open workout database")?;
        Ok(Self { db })
    }

    /// Store a record
    pub fn add(&self, record: &WorkoutRecord) -> Result<()> {
        // timestamp_id keeps keys in chronological order
        let key = format!("{:020}_{}", record.timestamp, record.id);
        let value = serde_json::to_vec(record).context("Failed to serialize workout record")?;

        self.db
            .insert(key.as_bytes(), value)
            .context("Failed to insert workout record")?;
        self.db.flush().context("Failed to flush workout database")?;

        Ok(())
    }

    /// Most recent records first
    pub fn recent(&self, limit: usize) -> Result<Vec<WorkoutRecord>> {
        let mut records = Vec::new();

        for item in self.db.iter().rev() {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);

            if records.len() >= limit {
                break;
            }
        }

        Ok(records)
    }

    pub fn latest(&self) -> Result<Option<WorkoutRecord>> {
        Ok(self.recent(1)?.into_iter().next())
    }

    pub fn count(&self) -> usize {
        self.db.len()
    }

    pub fn totals(&self) -> Result<WorkoutTotals> {
        let mut totals = WorkoutTotals::default();

        for item in self.db.iter() {
            let (_, value) = item?;
            let record: WorkoutRecord = serde_json::from_slice(&value)?;
            totals.walks += 1;
            totals.steps += u64::from(record.steps);
            totals.distance_km += record.distance_km;
            totals.minutes += u64::from(record.duration_minutes);
        }

        Ok(totals)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkoutTotals {
    pub walks: usize,
    pub steps: u64,
    pub distance_km: f64,
    pub minutes: u64,
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
