//! Step detection over per-category traffic series.

pub mod regions;
pub mod stats;
pub mod steps;

pub use steps::{detect_step, detect_steps, LegacyCategory, StepAnomaly};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fewer buckets than this and detection yields nothing.
pub const MIN_POINTS: usize = 8;
/// Buckets excluded at each end of the series (partial bucket, ingestion delay).
pub const DEFAULT_MARGIN: usize = 2;
/// Minimum index distance between two reported anomalies.
pub const MIN_GAP: usize = 2;
/// Default cap on reported anomalies.
pub const DEFAULT_MAX_COUNT: usize = 5;
/// Longest accepted bucket width (one week).
pub const MAX_BUCKET_SECONDS: i64 = 7 * 24 * 3600;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("series for {category} has {have} buckets, expected {expected}")]
    LengthMismatch {
        category: Category,
        expected: usize,
        have: usize,
    },

    #[error("series for {0} supplied twice")]
    DuplicateCategory(Category),

    #[error("no category series supplied")]
    Empty,

    #[error("bucket width of {0} seconds is outside 1..={max}", max = MAX_BUCKET_SECONDS)]
    InvalidBucket(i64),

    #[error("series time range falls outside the representable calendar")]
    TimeOutOfRange,
}

/// Traffic category of a request, derived from its status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// 1xx-3xx
    Green,
    /// 4xx
    Yellow,
    /// 5xx
    Red,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Green => "green",
            Category::Yellow => "yellow",
            Category::Red => "red",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Category::Yellow | Category::Red)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "green" | "ok" | "success" => Ok(Category::Green),
            "yellow" | "client" | "4xx" => Ok(Category::Yellow),
            "red" | "server" | "5xx" => Ok(Category::Red),
            other => anyhow::bail!("unknown category '{}'", other),
        }
    }
}

/// Direction of a deviation from baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyType {
    Spike,
    Dip,
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyType::Spike => write!(f, "spike"),
            AnomalyType::Dip => write!(f, "dip"),
        }
    }
}

/// An anomaly reported to the caller. `rank` 1 is the highest score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedAnomaly {
    pub start_index: usize,
    pub end_index: usize,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    /// Peak deviation ratio from baseline (1.0 = +100%).
    pub magnitude: f64,
    pub category: Category,
    pub duration: usize,
    pub score: f64,
    pub rank: usize,
}

impl DetectedAnomaly {
    /// Wall-clock window covered by this anomaly. The end is the start of the
    /// bucket following `end_index`. `None` when the window is not representable.
    pub fn time_window(&self, series_start: DateTime<Utc>, bucket: Duration) -> Option<TimeWindow> {
        Some(TimeWindow {
            start: bucket_offset(series_start, bucket, self.start_index)?,
            end: bucket_offset(series_start, bucket, self.end_index.checked_add(1)?)?,
        })
    }
}

/// Start of bucket `index`, or `None` on overflow.
pub fn bucket_offset(series_start: DateTime<Utc>, bucket: Duration, index: usize) -> Option<DateTime<Utc>> {
    let n = i32::try_from(index).ok()?;
    series_start.checked_add_signed(bucket.checked_mul(n)?)
}

/// Half-open wall-clock interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Length in minutes, never below one.
    pub fn minutes(&self) -> f64 {
        let secs = (self.end - self.start).num_seconds() as f64;
        (secs / 60.0).max(1.0)
    }
}

/// One to three equal-length per-category count series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSeries {
    series: Vec<(Category, Vec<f64>)>,
}

impl TrafficSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a category's series. Every series must have the same length.
    pub fn with(mut self, category: Category, values: Vec<f64>) -> Result<Self, DetectError> {
        if self.get(category).is_some() {
            return Err(DetectError::DuplicateCategory(category));
        }
        if let Some((_, first)) = self.series.first() {
            if first.len() != values.len() {
                return Err(DetectError::LengthMismatch {
                    category,
                    expected: first.len(),
                    have: values.len(),
                });
            }
        }
        self.series.push((category, values));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.series.first().map(|(_, v)| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, category: Category) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, v)| v.as_slice())
    }

    pub fn categories(&self) -> impl Iterator<Item = (Category, &[f64])> {
        self.series.iter().map(|(c, v)| (*c, v.as_slice()))
    }
}

/// Tunables for `detect_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOptions {
    pub min_points: usize,
    pub start_margin: usize,
    pub end_margin: usize,
    pub min_gap: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            min_points: MIN_POINTS,
            start_margin: DEFAULT_MARGIN,
            end_margin: DEFAULT_MARGIN,
            min_gap: MIN_GAP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_series_rejects_length_mismatch() {
        let err = TrafficSeries::new()
            .with(Category::Green, vec![1.0; 10])
            .unwrap()
            .with(Category::Red, vec![1.0; 9])
            .unwrap_err();
        assert_eq!(
            err,
            DetectError::LengthMismatch {
                category: Category::Red,
                expected: 10,
                have: 9
            }
        );
    }

    #[test]
    fn test_time_window_covers_last_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let anomaly = DetectedAnomaly {
            start_index: 3,
            end_index: 4,
            kind: AnomalyType::Spike,
            magnitude: 1.0,
            category: Category::Red,
            duration: 2,
            score: 1.0,
            rank: 1,
        };
        let window = anomaly.time_window(start, Duration::minutes(5)).unwrap();
        assert_eq!(window.start, start + Duration::minutes(15));
        assert_eq!(window.end, start + Duration::minutes(25));
        assert_eq!(window.minutes(), 10.0);

        // Past the end of the calendar there is no window, and no panic.
        assert!(anomaly.time_window(DateTime::<Utc>::MAX_UTC, Duration::minutes(5)).is_none());
        assert!(anomaly.time_window(start, Duration::weeks(10_000_000)).is_none());
    }

    #[test]
    fn test_category_parse_aliases() {
        assert_eq!("5xx".parse::<Category>().unwrap(), Category::Red);
        assert_eq!("client".parse::<Category>().unwrap(), Category::Yellow);
        assert!("purple".parse::<Category>().is_err());
    }
}
