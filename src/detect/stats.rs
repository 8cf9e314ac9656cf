/// A simple series of values for statistical analysis.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Median; the mean of the two middle values for even lengths.
    pub fn median(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ts = TimeSeries::new(&values);
        assert_eq!(ts.mean(), 3.0);
        // Variance of 1..5 is 2.0
        assert!((ts.variance() - 2.0).abs() < 1e-12);
        assert!((ts.std_dev() - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(ts.median(), 3.0);
    }

    #[test]
    fn test_median_even_and_unsorted() {
        let values = [9.0, 1.0, 4.0, 2.0];
        assert_eq!(TimeSeries::new(&values).median(), 3.0);
    }

    #[test]
    fn test_empty_series_is_zero() {
        let ts = TimeSeries::new(&[]);
        assert!(ts.is_empty());
        assert_eq!(ts.median(), 0.0);
        assert_eq!(ts.std_dev(), 0.0);
    }
}
