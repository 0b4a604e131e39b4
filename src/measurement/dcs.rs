//! Dark-count acquisitions.
//!
//! A dark-count measurement records long untriggered windows of the anode
//! signal with the light source off. Pulses in those windows are thermal
//! electrons, so the only derived quantity is a rate: sustained negative
//! excursions per second of live time.

use tracing::warn;

use crate::measurement::MeasurementMetadata;

/// Minimum number of consecutive below-threshold samples for an excursion
/// to count as a pulse rather than a noise spike.
pub const MIN_PULSE_WIDTH_SAMPLES: usize = 3;

/// One dark-count acquisition: a set of untriggered signal windows with a
/// shared time axis per window.
#[derive(Debug, Clone, Default)]
pub struct DcsMeasurement {
    /// Signal samples per window, mV.
    pub samples: Vec<Vec<f64>>,
    /// Time axis per window, ns.
    pub times: Vec<Vec<f64>>,
    pub metadata: MeasurementMetadata,
}

impl DcsMeasurement {
    pub fn new(samples: Vec<Vec<f64>>, times: Vec<Vec<f64>>) -> Self {
        if samples.len() != times.len() {
            warn!(
                samples = samples.len(),
                times = times.len(),
                "dark-count window arrays disagree, truncating to the shorter"
            );
        }
        let n = samples.len().min(times.len());
        Self {
            samples: samples.into_iter().take(n).collect(),
            times: times.into_iter().take(n).collect(),
            metadata: MeasurementMetadata::default(),
        }
    }

    /// Total live time across all windows, seconds.
    pub fn elapsed_s(&self) -> f64 {
        self.times
            .iter()
            .filter_map(|t| match (t.first(), t.last()) {
                (Some(first), Some(last)) => Some((last - first) * 1e-9),
                _ => None,
            })
            .sum()
    }

    /// Count pulses: excursions below `threshold_mv` sustained for at least
    /// [`MIN_PULSE_WIDTH_SAMPLES`], each counted once however long it lasts.
    pub fn count_pulses(&self, threshold_mv: f64) -> u64 {
        let mut count = 0;
        for window in &self.samples {
            let mut run = 0usize;
            let mut counted = false;
            for &v in window {
                if v < threshold_mv {
                    run += 1;
                    if run >= MIN_PULSE_WIDTH_SAMPLES && !counted {
                        count += 1;
                        counted = true;
                    }
                } else {
                    run = 0;
                    counted = false;
                }
            }
        }
        count
    }

    /// Fill the dark-count metadata fields and return the rate in hertz.
    ///
    /// A zero live time yields a zero rate rather than an infinity.
    pub fn compute_dark_rate(&mut self, threshold_mv: f64) -> f64 {
        let elapsed = self.elapsed_s();
        let count = self.count_pulses(threshold_mv);
        let rate = if elapsed > 0.0 {
            count as f64 / elapsed
        } else {
            warn!("dark-count acquisition has zero live time");
            0.0
        };
        self.metadata.signal_threshold_mv = threshold_mv;
        self.metadata.dark_duration_s = elapsed;
        self.metadata.dark_count = count as f64;
        self.metadata.dark_rate_hz = rate;
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `n` windows of `len` samples at 1 ns spacing, with a 5-sample pulse
    /// injected at each index in `pulses`.
    fn windows(n: usize, len: usize, pulses: &[usize]) -> DcsMeasurement {
        let times: Vec<Vec<f64>> = (0..n)
            .map(|_| (0..len).map(|i| i as f64).collect())
            .collect();
        let samples: Vec<Vec<f64>> = (0..n)
            .map(|_| {
                let mut w = vec![0.0; len];
                for &p in pulses {
                    for s in w.iter_mut().skip(p).take(5) {
                        *s = -10.0;
                    }
                }
                w
            })
            .collect();
        DcsMeasurement::new(samples, times)
    }

    #[test]
    fn rate_is_count_over_elapsed() {
        // 4 windows of 1000 ns with 2 pulses each: 8 pulses in 4 us.
        let mut m = windows(4, 1001, &[100, 600]);
        let rate = m.compute_dark_rate(-4.0);
        assert!((rate - 8.0 / 4.0e-6).abs() / rate < 1e-9);
        assert_eq!(m.metadata.dark_count, 8.0);
        assert!((m.metadata.dark_duration_s - 4.0e-6).abs() < 1e-15);
    }

    #[test]
    fn narrow_spikes_are_not_counted() {
        let times = vec![(0..1000).map(|i| i as f64).collect::<Vec<f64>>()];
        let mut w = vec![0.0; 1000];
        w[200] = -10.0; // single-sample spike
        w[500] = -10.0;
        w[501] = -10.0; // two-sample spike
        let mut m = DcsMeasurement::new(vec![w], times);
        assert_eq!(m.count_pulses(-4.0), 0);
        assert_eq!(m.compute_dark_rate(-4.0), 0.0);
    }

    #[test]
    fn long_excursion_counts_once() {
        let times = vec![(0..1000).map(|i| i as f64).collect::<Vec<f64>>()];
        let mut w = vec![0.0; 1000];
        for s in w.iter_mut().skip(100).take(300) {
            *s = -10.0;
        }
        let m = DcsMeasurement::new(vec![w], times);
        assert_eq!(m.count_pulses(-4.0), 1);
    }

    #[test]
    fn empty_acquisition_has_zero_rate() {
        let mut m = DcsMeasurement::new(Vec::new(), Vec::new());
        assert_eq!(m.compute_dark_rate(-4.0), 0.0);
        assert_eq!(m.metadata.dark_duration_s, 0.0);
    }
}
