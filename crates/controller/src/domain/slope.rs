use std::collections::VecDeque;

/// Bounded history of usage percentages and its least-squares trend.
#[derive(Debug, Clone)]
pub struct SlopeEstimator {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SlopeEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes a sample, evicting the oldest one when the window is full.
    pub fn add_sample(&mut self, percent_usage: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(percent_usage);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Least-squares slope of `(index, percentage)` over the window.
    ///
    /// Until the window is full the history length is returned instead, which
    /// keeps a warming-up entity out of the flat band once it has two samples.
    pub fn slope(&self) -> f64 {
        if !self.is_full() {
            return self.samples.len() as f64;
        }

        let n = self.samples.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = self.samples.iter().sum::<f64>() / n;

        let (num, den) = self
            .samples
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(num, den), (i, y)| {
                let dx = i as f64 - mean_x;
                (num + dx * (y - mean_y), den + dx * dx)
            });

        if den == 0.0 {
            return 0.0;
        }
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(values: &[f64]) -> SlopeEstimator {
        let mut estimator = SlopeEstimator::new(values.len());
        for v in values {
            estimator.add_sample(*v);
        }
        estimator
    }

    #[test]
    fn placeholder_until_full() {
        let mut estimator = SlopeEstimator::new(5);
        assert_eq!(estimator.slope(), 0.0);

        estimator.add_sample(10.0);
        estimator.add_sample(90.0);
        assert_eq!(estimator.slope(), 2.0);
        assert!(!estimator.is_full());
    }

    #[test]
    fn linear_series_slope() {
        let estimator = filled(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        assert!((estimator.slope() - 10.0).abs() < 1e-9);

        let estimator = filled(&[50.0, 40.0, 30.0, 20.0, 10.0]);
        assert!((estimator.slope() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn constant_series_is_flat() {
        let estimator = filled(&[42.0; 5]);
        assert!(estimator.slope().abs() < 1e-9);
    }

    #[test]
    fn oldest_sample_is_evicted() {
        let mut estimator = SlopeEstimator::new(3);
        for v in [100.0, 0.0, 0.0, 0.0] {
            estimator.add_sample(v);
        }
        assert_eq!(estimator.len(), 3);
        assert!(estimator.slope().abs() < 1e-9);
    }

    #[test]
    fn single_sample_window() {
        let estimator = filled(&[12.0]);
        assert_eq!(estimator.slope(), 0.0);
    }
}
