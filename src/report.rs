//! Detection reports: a series document in, ranked anomalies with ids out.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::{
    bucket_offset, detect_step, detect_steps, Category, DetectError, DetectOptions, DetectedAnomaly,
    StepAnomaly, TimeWindow, TrafficSeries, MAX_BUCKET_SECONDS,
};
use crate::filters::FilterMap;
use crate::identity::{generate_id, AnomalyId};

fn default_bucket_seconds() -> i64 {
    60
}

/// Per-category request counts, one value per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInput {
    /// Start of the first bucket. Without it anomalies carry no window or id.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub green: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yellow: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red: Option<Vec<f64>>,
}

impl SeriesInput {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read series file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse series file: {}", path.display()))
    }

    pub fn bucket(&self) -> Result<Duration, DetectError> {
        if !(1..=MAX_BUCKET_SECONDS).contains(&self.bucket_seconds) {
            return Err(DetectError::InvalidBucket(self.bucket_seconds));
        }
        Duration::try_seconds(self.bucket_seconds).ok_or(DetectError::InvalidBucket(self.bucket_seconds))
    }

    pub fn to_series(&self) -> Result<TrafficSeries, DetectError> {
        let mut series = TrafficSeries::new();
        for (category, values) in [
            (Category::Green, &self.green),
            (Category::Yellow, &self.yellow),
            (Category::Red, &self.red),
        ] {
            if let Some(values) = values {
                series = series.with(category, values.clone())?;
            }
        }
        if series.categories().next().is_none() {
            return Err(DetectError::Empty);
        }
        Ok(series)
    }

    /// Wall-clock span of `buckets` buckets from `start`.
    pub fn range(&self, buckets: usize) -> Result<Option<TimeWindow>, DetectError> {
        let bucket = self.bucket()?;
        let Some(start) = self.start else {
            return Ok(None);
        };
        let end = bucket_offset(start, bucket, buckets).ok_or(DetectError::TimeOutOfRange)?;
        Ok(Some(TimeWindow::new(start, end)))
    }

    /// Series plus the checks that must pass before detection runs.
    fn validated(&self) -> Result<(TrafficSeries, Option<TimeWindow>), DetectError> {
        let series = self.to_series()?;
        let range = self.range(series.len())?;
        Ok((series, range))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedAnomaly {
    #[serde(flatten)]
    pub anomaly: DetectedAnomaly,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<AnomalyId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    pub buckets: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TimeWindow>,
    pub anomalies: Vec<ReportedAnomaly>,
}

/// Run `detect_steps` and attach windows and ids.
pub fn build_report(
    input: &SeriesInput,
    time_filter: &str,
    filters: &FilterMap,
    max_count: usize,
    options: &DetectOptions,
) -> Result<DetectionReport, DetectError> {
    let (series, range) = input.validated()?;
    let bucket = input.bucket()?;
    let filter_string = filters.canonical();

    let anomalies = detect_steps(&series, max_count, options)
        .into_iter()
        .map(|anomaly| {
            let window = match input.start {
                Some(start) => Some(
                    anomaly
                        .time_window(start, bucket)
                        .ok_or(DetectError::TimeOutOfRange)?,
                ),
                None => None,
            };
            let id = window.map(|w| {
                generate_id(time_filter, &filter_string, w.start, w.end, anomaly.category.as_str())
            });
            Ok(ReportedAnomaly { anomaly, window, id })
        })
        .collect::<Result<Vec<_>, DetectError>>()?;

    Ok(DetectionReport {
        buckets: series.len(),
        range,
        anomalies,
    })
}

/// Single best anomaly from the legacy two-category detector.
pub fn legacy_report(input: &SeriesInput, options: &DetectOptions) -> Result<Option<StepAnomaly>, DetectError> {
    let (series, _) = input.validated()?;
    Ok(detect_step(&series, options))
}
