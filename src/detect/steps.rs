//! Adaptive-threshold step detection.
//!
//! Each category is measured against its own median baseline. The anomaly
//! threshold is one standard deviation of the deviation-ratio sequence, so
//! noisy categories need proportionally larger excursions to register.

use crate::detect::regions::{find_regions, AnomalyRegion, Direction};
use crate::detect::stats::TimeSeries;
use crate::detect::{AnomalyType, Category, DetectOptions, DetectedAnomaly, TrafficSeries};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Operational priority of a (category, direction) signal.
fn category_weight(category: Category, kind: AnomalyType) -> f64 {
    match (category, kind) {
        (Category::Red, AnomalyType::Spike) => 2.0,
        (Category::Yellow, AnomalyType::Spike) => 2.0,
        (Category::Green, AnomalyType::Dip) => 2.0,
        (Category::Green, AnomalyType::Spike) => 2.0,
        (Category::Yellow, AnomalyType::Dip) => 1.0,
        (Category::Red, AnomalyType::Dip) => 1.0,
    }
}

/// Baseline, per-bucket deviation ratios and 1-sigma threshold of one series.
#[derive(Debug, Clone, PartialEq)]
struct Profile {
    baseline: f64,
    deviations: Vec<f64>,
    threshold: f64,
}

fn profile(values: &[f64], options: &DetectOptions) -> Option<Profile> {
    let len = values.len();
    if options.start_margin + options.end_margin >= len {
        return None;
    }
    let valid = options.start_margin..len - options.end_margin;

    let baseline = TimeSeries::new(&values[valid.clone()]).median();
    let deviations: Vec<f64> = values
        .iter()
        .map(|&v| if baseline > 0.0 { (v - baseline) / baseline } else { 0.0 })
        .collect();
    let threshold = TimeSeries::new(&deviations[valid]).std_dev();

    Some(Profile {
        baseline,
        deviations,
        threshold,
    })
}

/// A scored region awaiting selection.
#[derive(Debug, Clone)]
struct Candidate<S> {
    region: AnomalyRegion,
    kind: AnomalyType,
    signal: S,
    score: f64,
}

/// Score every above/below region of `values` with `weight(kind)`.
fn score_regions<S: Copy>(
    values: &[f64],
    signal: S,
    options: &DetectOptions,
    weight: impl Fn(AnomalyType) -> f64,
) -> Vec<Candidate<S>> {
    let Some(profile) = profile(values, options) else {
        return Vec::new();
    };
    // A flat series has nothing to report.
    if profile.threshold <= 0.0 || !profile.threshold.is_finite() {
        return Vec::new();
    }
    debug!(
        baseline = profile.baseline,
        threshold = profile.threshold,
        "category profile"
    );

    let mut candidates = Vec::new();
    for (kind, direction) in [
        (AnomalyType::Spike, Direction::Above),
        (AnomalyType::Dip, Direction::Below),
    ] {
        let w = weight(kind);
        if w <= 0.0 {
            continue;
        }
        for region in find_regions(
            &profile.deviations,
            profile.threshold,
            direction,
            options.start_margin,
            options.end_margin,
        ) {
            let score = region.peak_deviation * (region.duration as f64).sqrt() * w;
            candidates.push(Candidate {
                region,
                kind,
                signal,
                score,
            });
        }
    }
    candidates
}

/// Greedy non-overlapping selection in descending score order.
///
/// The exclusion zone around a selected region extends `max(min_gap, width)`
/// buckets on both sides, so a second burst right after a long one is treated
/// as its continuation.
fn select<S>(mut candidates: Vec<Candidate<S>>, max_count: usize, min_gap: usize) -> Vec<Candidate<S>> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.region.start.cmp(&b.region.start))
    });

    let mut selected: Vec<Candidate<S>> = Vec::new();
    for candidate in candidates {
        if selected.len() >= max_count {
            break;
        }
        let clear = selected.iter().all(|s| {
            let buffer = min_gap.max(s.region.duration);
            candidate.region.start > s.region.end + buffer
                || candidate.region.end + buffer < s.region.start
        });
        if clear {
            selected.push(candidate);
        }
    }
    selected
}

/// Detect up to `max_count` ranked anomalies across all categories present.
///
/// Never fails: short series, flat series and series without qualifying
/// regions all produce an empty result.
pub fn detect_steps(
    series: &TrafficSeries,
    max_count: usize,
    options: &DetectOptions,
) -> Vec<DetectedAnomaly> {
    if series.len() < options.min_points || max_count == 0 {
        return Vec::new();
    }

    let candidates: Vec<Candidate<Category>> = series
        .categories()
        .flat_map(|(category, values)| {
            score_regions(values, category, options, |kind| category_weight(category, kind))
        })
        .collect();
    let total = candidates.len();

    let anomalies: Vec<DetectedAnomaly> = select(candidates, max_count, options.min_gap)
        .into_iter()
        .enumerate()
        .map(|(i, c)| DetectedAnomaly {
            start_index: c.region.start,
            end_index: c.region.end,
            kind: c.kind,
            magnitude: c.region.peak_deviation,
            category: c.signal,
            duration: c.region.duration,
            score: c.score,
            rank: i + 1,
        })
        .collect();

    debug!(candidates = total, selected = anomalies.len(), "step detection complete");
    anomalies
}

/// Coarse two-category model used by `detect_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyCategory {
    /// 4xx plus double-weighted 5xx.
    Error,
    Success,
}

impl LegacyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyCategory::Error => "error",
            LegacyCategory::Success => "success",
        }
    }
}

/// Single best anomaly from `detect_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAnomaly {
    pub start_index: usize,
    pub end_index: usize,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub magnitude: f64,
    pub category: LegacyCategory,
    pub duration: usize,
    pub score: f64,
}

fn legacy_weight(category: LegacyCategory, kind: AnomalyType) -> f64 {
    match (category, kind) {
        (LegacyCategory::Error, AnomalyType::Spike) => 10.0,
        (LegacyCategory::Success, AnomalyType::Dip) => 10.0,
        (LegacyCategory::Success, AnomalyType::Spike) => 1.0,
        (LegacyCategory::Error, AnomalyType::Dip) => 0.0,
    }
}

/// Legacy single-result detector over a combined error series and the
/// success series. Shares region finding, scoring and selection with
/// `detect_steps`.
pub fn detect_step(series: &TrafficSeries, options: &DetectOptions) -> Option<StepAnomaly> {
    let len = series.len();
    if len < options.min_points {
        return None;
    }

    let client = series.get(Category::Yellow);
    let server = series.get(Category::Red);
    let mut candidates = Vec::new();

    if client.is_some() || server.is_some() {
        let errors: Vec<f64> = (0..len)
            .map(|i| {
                client.map(|v| v[i]).unwrap_or(0.0) + 2.0 * server.map(|v| v[i]).unwrap_or(0.0)
            })
            .collect();
        candidates.extend(score_regions(&errors, LegacyCategory::Error, options, |kind| {
            legacy_weight(LegacyCategory::Error, kind)
        }));
    }
    if let Some(success) = series.get(Category::Green) {
        candidates.extend(score_regions(success, LegacyCategory::Success, options, |kind| {
            legacy_weight(LegacyCategory::Success, kind)
        }));
    }

    select(candidates, 1, options.min_gap)
        .into_iter()
        .next()
        .map(|c| StepAnomaly {
            start_index: c.region.start,
            end_index: c.region.end,
            kind: c.kind,
            magnitude: c.region.peak_deviation,
            category: c.signal,
            duration: c.region.duration,
            score: c.score,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_with(len: usize, base: f64, bumps: &[(usize, usize, f64)]) -> Vec<f64> {
        let mut v = vec![base; len];
        for &(from, to, value) in bumps {
            for x in v.iter_mut().take(to + 1).skip(from) {
                *x = value;
            }
        }
        v
    }

    #[test]
    fn test_short_series_yields_nothing() {
        let series = TrafficSeries::new()
            .with(Category::Red, vec![1.0, 1.0, 1.0, 90.0, 1.0, 1.0, 1.0])
            .unwrap();
        let opts = DetectOptions::default();
        assert!(detect_steps(&series, 5, &opts).is_empty());
        assert!(detect_step(&series, &opts).is_none());
    }

    #[test]
    fn test_flat_series_yields_nothing() {
        let series = TrafficSeries::new()
            .with(Category::Green, vec![500.0; 30])
            .unwrap()
            .with(Category::Yellow, vec![20.0; 30])
            .unwrap()
            .with(Category::Red, vec![0.0; 30])
            .unwrap();
        let opts = DetectOptions::default();
        assert!(detect_steps(&series, 5, &opts).is_empty());
        assert!(detect_step(&series, &opts).is_none());
    }

    #[test]
    fn test_zero_baseline_produces_no_deviation() {
        let p = profile(&[0.0, 0.0, 0.0, 0.0, 0.0, 7.0, 0.0, 0.0, 0.0, 0.0], &DetectOptions::default())
            .unwrap();
        assert_eq!(p.baseline, 0.0);
        assert!(p.deviations.iter().all(|d| *d == 0.0));
    }

    #[test]
    fn test_red_spike_detected_and_ranked() {
        let red = flat_with(30, 10.0, &[(12, 14, 80.0)]);
        let series = TrafficSeries::new().with(Category::Red, red).unwrap();
        let found = detect_steps(&series, 5, &DetectOptions::default());
        assert_eq!(found.len(), 1);
        let a = &found[0];
        assert_eq!((a.start_index, a.end_index, a.duration), (12, 14, 3));
        assert_eq!(a.kind, AnomalyType::Spike);
        assert_eq!(a.category, Category::Red);
        assert_eq!(a.rank, 1);
        assert!((a.magnitude - 7.0).abs() < 1e-9);
        assert!((a.score - 7.0 * 3f64.sqrt() * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_drop_detected_as_dip() {
        let green = flat_with(24, 1000.0, &[(9, 12, 200.0)]);
        let series = TrafficSeries::new().with(Category::Green, green).unwrap();
        let found = detect_steps(&series, 5, &DetectOptions::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyType::Dip);
        assert_eq!((found[0].start_index, found[0].end_index), (9, 12));
    }

    #[test]
    fn test_ranks_follow_descending_score_and_respect_gap() {
        let red = flat_with(40, 10.0, &[(5, 6, 60.0), (20, 21, 90.0)]);
        let yellow = flat_with(40, 100.0, &[(30, 31, 400.0)]);
        let series = TrafficSeries::new()
            .with(Category::Red, red)
            .unwrap()
            .with(Category::Yellow, yellow)
            .unwrap();
        let opts = DetectOptions::default();
        let found = detect_steps(&series, 5, &opts);
        assert!(found.len() >= 2);

        for (i, a) in found.iter().enumerate() {
            assert_eq!(a.rank, i + 1);
        }
        for w in found.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
        for (i, a) in found.iter().enumerate() {
            for b in found.iter().skip(i + 1) {
                assert!(a.end_index + opts.min_gap < b.start_index || b.end_index + opts.min_gap < a.start_index);
            }
        }
    }

    #[test]
    fn test_max_count_caps_result() {
        let red = flat_with(60, 10.0, &[(5, 5, 50.0), (15, 15, 60.0), (25, 25, 70.0), (35, 35, 80.0)]);
        let series = TrafficSeries::new().with(Category::Red, red).unwrap();
        let found = detect_steps(&series, 2, &DetectOptions::default());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].start_index, 35);
        assert_eq!(found[1].start_index, 25);
    }

    #[test]
    fn test_selection_widens_exclusion_by_selected_width() {
        // Two 6-bucket 5xx bursts separated by three quiet buckets.
        let red = flat_with(32, 100.0, &[(10, 15, 1000.0), (19, 24, 900.0)]);
        let series = TrafficSeries::new().with(Category::Red, red).unwrap();
        let opts = DetectOptions::default();

        // The plain gap alone would admit the second burst.
        assert!(15 + opts.min_gap < 19);

        let found = detect_steps(&series, 5, &opts);
        assert!(found.iter().any(|a| a.start_index == 10 && a.end_index == 15));
        assert!(!found.iter().any(|a| a.start_index == 19 && a.end_index == 24));
    }

    #[test]
    fn test_legacy_error_spike_wins() {
        let ok_noise = [
            0.0, 250.0, -300.0, 120.0, -80.0, 310.0, -150.0, 60.0, 661.0, -220.0, 180.0, -90.0, 40.0,
            -260.0, 200.0, -30.0, 140.0, -110.0, 90.0, -50.0,
        ];
        let client_noise = [
            50.0, -120.0, 80.0, -60.0, 140.0, -30.0, 100.0, -90.0, 0.0, 70.0, -150.0, 20.0, 110.0,
            -40.0, -100.0, 60.0, -20.0, 130.0, -70.0, 30.0,
        ];
        let ok: Vec<f64> = ok_noise.iter().map(|n| 71000.0 + n).collect();
        let mut client: Vec<f64> = client_noise.iter().map(|n| 12300.0 + n).collect();
        client[8] = 28932.0;
        assert_eq!(ok[8], 71661.0);

        let series = TrafficSeries::new()
            .with(Category::Green, ok)
            .unwrap()
            .with(Category::Yellow, client)
            .unwrap();
        let step = detect_step(&series, &DetectOptions::default()).expect("error spike");
        assert_eq!(step.kind, AnomalyType::Spike);
        assert_eq!(step.category, LegacyCategory::Error);
        assert_eq!(step.start_index, 8);
    }

    #[test]
    fn test_legacy_ignores_error_drop() {
        let yellow = flat_with(20, 500.0, &[(8, 10, 50.0)]);
        let series = TrafficSeries::new().with(Category::Yellow, yellow).unwrap();
        assert!(detect_step(&series, &DetectOptions::default()).is_none());
    }
}
