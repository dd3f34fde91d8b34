// Population standard deviation tracking for anomaly checks.
use parking_lot::Mutex;
use std::collections::HashMap;

/// Below this many samples every value is treated as ordinary.
pub const MIN_SAMPLES: usize = 10;

/// Running population standard deviation of one named series.
///
/// The full history is kept and σ is recomputed over all of it on every push.
/// Sample rates are one per sweep, so the linear cost does not matter.
#[derive(Debug, Clone, Default)]
pub struct StandardDeviation {
    name: String,
    sum: f64,
    mean: f64,
    samples: Vec<f64>,
    sigma: f64,
}

impl StandardDeviation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add `sample` and return `(σ, is_ordinary)`, where ordinary means within
    /// 2σ of the mean (including the new sample) or too little history to tell.
    pub fn push(&mut self, sample: f64) -> (f64, bool) {
        self.samples.push(sample);
        self.sum += sample;
        let count = self.samples.len() as f64;
        self.mean = self.sum / count;

        let squares: f64 = self
            .samples
            .iter()
            .map(|value| (value - self.mean).powi(2))
            .sum();
        self.sigma = (squares / count).sqrt();

        let ordinary =
            self.samples.len() < MIN_SAMPLES || (sample - self.mean).abs() < 2.0 * self.sigma;
        (self.sigma, ordinary)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Process-wide registry of named series.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    series: Mutex<HashMap<String, StandardDeviation>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, series: &str, sample: f64) -> (f64, bool) {
        let mut all = self.series.lock();
        all.entry(series.to_string())
            .or_insert_with(|| StandardDeviation::new(series))
            .push(sample)
    }
}
