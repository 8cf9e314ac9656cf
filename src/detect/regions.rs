//! Contiguous above/below-threshold runs in a deviation sequence.

use serde::Serialize;

/// Which side of the threshold counts as anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `deviation > threshold`
    Above,
    /// `deviation < -threshold`
    Below,
}

/// A maximal run of anomalous buckets. Indices are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRegion {
    pub start: usize,
    pub end: usize,
    pub duration: usize,
    pub total_deviation: f64,
    pub peak_deviation: f64,
    pub avg_deviation: f64,
}

/// Accumulates one open run while scanning.
struct OpenRegion {
    start: usize,
    total: f64,
    peak: f64,
}

impl OpenRegion {
    fn close(self, end: usize) -> AnomalyRegion {
        let duration = end - self.start + 1;
        AnomalyRegion {
            start: self.start,
            end,
            duration,
            total_deviation: self.total,
            peak_deviation: self.peak,
            avg_deviation: self.total / duration as f64,
        }
    }
}

/// Scan `deviations[start_margin..len - end_margin]` for maximal runs exceeding
/// `threshold` in `direction`. Deviation magnitudes are absolute values.
pub fn find_regions(
    deviations: &[f64],
    threshold: f64,
    direction: Direction,
    start_margin: usize,
    end_margin: usize,
) -> Vec<AnomalyRegion> {
    let len = deviations.len();
    if start_margin + end_margin >= len {
        return Vec::new();
    }
    let last_valid = len - end_margin - 1;

    let mut regions = Vec::new();
    let mut open: Option<OpenRegion> = None;

    for (i, &dev) in deviations
        .iter()
        .enumerate()
        .take(last_valid + 1)
        .skip(start_margin)
    {
        let hit = match direction {
            Direction::Above => dev > threshold,
            Direction::Below => dev < -threshold,
        };

        if hit {
            let magnitude = dev.abs();
            match open.as_mut() {
                Some(region) => {
                    region.total += magnitude;
                    region.peak = region.peak.max(magnitude);
                }
                None => {
                    open = Some(OpenRegion {
                        start: i,
                        total: magnitude,
                        peak: magnitude,
                    });
                }
            }
        } else if let Some(region) = open.take() {
            regions.push(region.close(i - 1));
        }
    }

    // Still open at the scan boundary.
    if let Some(region) = open.take() {
        regions.push(region.close(last_valid));
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_spike_run() {
        let devs = [0.0, 0.0, 0.1, 0.9, 1.2, 0.8, 0.0, 0.0, 0.0, 0.0];
        let regions = find_regions(&devs, 0.5, Direction::Above, 2, 2);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!((r.start, r.end, r.duration), (3, 5, 3));
        assert!((r.peak_deviation - 1.2).abs() < 1e-12);
        assert!((r.total_deviation - 2.9).abs() < 1e-12);
        assert!((r.avg_deviation - 2.9 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_dip_uses_absolute_deviation() {
        let devs = [0.0, 0.0, -0.7, -0.9, 0.0, 0.0, 0.0, 0.0];
        let regions = find_regions(&devs, 0.5, Direction::Below, 2, 2);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].start, regions[0].end), (2, 3));
        assert!((regions[0].peak_deviation - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_margins_are_excluded() {
        let devs = [5.0, 5.0, 0.0, 0.0, 0.0, 0.0, 5.0, 5.0];
        assert!(find_regions(&devs, 1.0, Direction::Above, 2, 2).is_empty());
    }

    #[test]
    fn test_region_open_at_boundary_closes_at_last_valid() {
        let devs = [0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 9.0, 9.0];
        let regions = find_regions(&devs, 1.0, Direction::Above, 2, 2);
        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].start, regions[0].end, regions[0].duration), (4, 5, 2));
    }

    #[test]
    fn test_multiple_regions_and_zero_threshold() {
        let devs = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        let regions = find_regions(&devs, 0.5, Direction::Above, 2, 2);
        assert_eq!(regions.len(), 2);

        // Nothing exceeds a zero threshold on a flat sequence.
        let flat = [0.0; 12];
        assert!(find_regions(&flat, 0.0, Direction::Above, 2, 2).is_empty());
        assert!(find_regions(&flat, 0.0, Direction::Below, 2, 2).is_empty());
    }

    #[test]
    fn test_margins_wider_than_series() {
        let devs = [3.0; 4];
        assert!(find_regions(&devs, 1.0, Direction::Above, 2, 2).is_empty());
    }
}
