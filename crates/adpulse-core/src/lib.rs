//! Core domain model and pure metric computation for AdPulse.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-core";

/// Rolling aggregation windows, in trailing calendar days. The 90-day window
/// subsumes every other window, which is why a refresh fetches exactly 90
/// days of facts once and derives all windows from that single dataset.
pub const WINDOW_DAYS: [u32; 6] = [4, 7, 14, 30, 60, 90];

/// Longest window; fixes the fetch range for a refresh.
pub const FETCH_RANGE_DAYS: u32 = 90;

/// CPL threshold applied when an entity has no configured threshold row.
/// Applied explicitly by [`Rating::classify`], never hidden inside a lookup.
pub const DEFAULT_CPL_THRESHOLD: f64 = 3.5;

/// Cache period label covering the whole fetched range rather than a fixed
/// trailing window.
pub const PERIOD_ALL: &str = "all";

/// One day of reporting data for one entity, normalized from a raw reporting
/// row. Intermediate value: consumed by aggregation, never persisted.
///
/// Rows where cost, leads, clicks and impressions are all zero are filtered
/// out at normalization time and never become a `RawFact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    pub entity_key: String,
    pub day: NaiveDate,
    pub leads: i64,
    pub cost: f64,
    pub clicks: i64,
    pub impressions: i64,
    /// Average view duration reported for that day, seconds. 0 when the
    /// reporting row carries no duration column.
    pub avg_duration: f64,
}

/// Sums over the facts of one entity whose day falls inside one trailing
/// window (or the whole fetched range).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub entity_key: String,
    /// Trailing window length in days; `None` for the whole-range aggregate.
    pub window_days: Option<u32>,
    pub leads: i64,
    pub cost: f64,
    pub clicks: i64,
    pub impressions: i64,
    /// Mean of the per-day average durations over days with data.
    pub avg_duration: f64,
    pub days_with_data: u32,
}

impl WindowAggregate {
    /// Empty aggregate for an entity with no activity in the window. Still a
    /// valid, cacheable result.
    pub fn empty(entity_key: impl Into<String>, window_days: Option<u32>) -> Self {
        Self {
            entity_key: entity_key.into(),
            window_days,
            leads: 0,
            cost: 0.0,
            clicks: 0,
            impressions: 0,
            avg_duration: 0.0,
            days_with_data: 0,
        }
    }

    /// Cache period label: `"4d"`, `"7d"`, ... or `"all"`.
    pub fn period(&self) -> String {
        match self.window_days {
            Some(days) => format!("{days}d"),
            None => PERIOD_ALL.to_string(),
        }
    }
}

/// Performance ratios derived from aggregate sums. Division by a zero
/// denominator is defined as 0, never NaN or infinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub cpl: f64,
    pub ctr_percent: f64,
    pub cpc: f64,
    pub cpm: f64,
}

impl DerivedMetrics {
    pub fn compute(leads: i64, cost: f64, clicks: i64, impressions: i64) -> Self {
        Self {
            cpl: round2(safe_div(cost, leads as f64)),
            ctr_percent: round2(safe_div(clicks as f64, impressions as f64) * 100.0),
            cpc: round2(safe_div(cost, clicks as f64)),
            cpm: round2(safe_div(cost, impressions as f64) * 1000.0),
        }
    }

    pub fn from_aggregate(agg: &WindowAggregate) -> Self {
        Self::compute(agg.leads, agg.cost, agg.clicks, agg.impressions)
    }

    pub fn from_cache(record: &CacheRecord) -> Self {
        Self::compute(record.leads, record.cost, record.clicks, record.impressions)
    }
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Half-up rounding to two decimal places; non-finite input collapses to 0.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

/// Ordinal performance classification of CPL against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rating {
    A,
    B,
    C,
    D,
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl Rating {
    /// Classify `cpl / threshold`. A missing threshold falls back to
    /// [`DEFAULT_CPL_THRESHOLD`]; a zero CPL or an explicit zero threshold
    /// is unratable.
    pub fn classify(cpl: f64, threshold: Option<f64>) -> Self {
        let threshold = threshold.unwrap_or(DEFAULT_CPL_THRESHOLD);
        if cpl <= 0.0 || threshold <= 0.0 {
            return Rating::NotApplicable;
        }
        let pct = cpl / threshold * 100.0;
        if pct <= 35.0 {
            Rating::A
        } else if pct <= 65.0 {
            Rating::B
        } else if pct <= 90.0 {
            Rating::C
        } else {
            Rating::D
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::A => "A",
            Rating::B => "B",
            Rating::C => "C",
            Rating::D => "D",
            Rating::NotApplicable => "N/A",
        }
    }
}

/// Cached aggregate for one `(entity_key, period)`. Written whole on every
/// successful aggregation, never partially updated, never deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub entity_key: String,
    pub period: String,
    pub leads: i64,
    pub cost: f64,
    pub clicks: i64,
    pub impressions: i64,
    pub avg_duration: f64,
    pub days_count: i32,
    pub cached_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn from_aggregate(agg: &WindowAggregate, cached_at: DateTime<Utc>) -> Self {
        Self {
            entity_key: agg.entity_key.clone(),
            period: agg.period(),
            leads: agg.leads,
            cost: agg.cost,
            clicks: agg.clicks,
            impressions: agg.impressions,
            avg_duration: agg.avg_duration,
            days_count: agg.days_with_data as i32,
            cached_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One row per refresh run; the single piece of state shared across the
/// invocations of a continuation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub is_manual: bool,
    pub videos_total: i64,
    pub videos_processed: i64,
    pub videos_success: i64,
}
