use crate::config::OutlierConfig;

/// Deviations below this are treated as zero when the baseline has
/// collapsed to a constant signal.
pub const STD_DEV_TOLERANCE: f64 = 1e-9;

/// Per-tag expanding-window accumulator for the outlier detector.
///
/// Running mean and sum-of-squared-deviations are maintained with Welford's
/// incremental update, so each new sample costs O(1) regardless of how much
/// history the baseline has absorbed. This is an expanding window, not a
/// sliding one: the accumulator only ever grows until one of the reset
/// triggers clears it (outlier detection toggled, bad quality, failed
/// numeric conversion).
#[derive(Debug, Clone, Default)]
pub struct BaselineState {
    count: u64,
    mean: f64,
    m2: f64,
    established: bool,
}

impl BaselineState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Sample standard deviation (N−1 denominator). Zero until two samples
    /// have been absorbed.
    pub fn sample_std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Feed one sample; returns whether it is an outlier.
    ///
    /// While the baseline is still accumulating, every sample is absorbed
    /// and none is flagged. Establishment is a one-time edge at the
    /// configured sample count, and the establishing sample itself is never
    /// an outlier. After establishment, a sample is judged against the
    /// running statistics first and then absorbed into them.
    pub fn observe(&mut self, value: f64, config: &OutlierConfig) -> bool {
        if !self.established {
            self.push(value);
            if self.count >= u64::from(config.baseline_samples.max(1)) {
                self.established = true;
            }
            return false;
        }

        let deviation = (value - self.mean).abs();
        let std_dev = self.sample_std_dev();
        let outlier = if std_dev <= STD_DEV_TOLERANCE {
            // Constant signal: any change at all is suspicious.
            deviation > STD_DEV_TOLERANCE
        } else {
            deviation > config.std_dev_factor * std_dev
        };
        self.push(value);
        outlier
    }
}
