//! Acquired waveform batches and their derived statistics.
//!
//! A [`Measurement`] is one batch of digitizer waveforms taken at a fixed
//! bench configuration, together with a flat metadata record describing the
//! configuration and the batch-level statistics computed from it. Scalar
//! statistics land in [`MeasurementMetadata`] so a batch can be summarised,
//! persisted, and compared without re-reading the raw traces.

pub mod dcs;
pub mod stats;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppResult, BenchError};
use crate::measurement::stats::{fit_feature, GaussianFit};
use crate::waveform::Waveform;

/// Histogram bin count used for all per-feature fits.
const FEATURE_BINS: usize = 50;

/// Unset metadata fields keep this sentinel so a reader can tell "never
/// computed" apart from a legitimate zero.
pub const UNSET: f64 = -1.0;

/// Flat per-batch record: bench configuration plus derived statistics.
///
/// All fields are `f64` so the record maps directly onto a set of scalar
/// file attributes. Every field defaults to [`UNSET`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementMetadata {
    /// Rotation stage polar angle in degrees.
    pub theta: f64,
    /// Rotation stage azimuthal angle in degrees.
    pub phi: f64,
    /// PMT bias (dynode-10) voltage in volts.
    pub dy10_v: f64,
    /// Supply readback voltage in volts.
    pub psu_v: f64,
    /// Supply readback current in amperes.
    pub psu_i: f64,
    /// Pulsed light source intensity tune setting.
    pub laser_tune: f64,
    /// Pulsed light source repetition rate in hertz.
    pub laser_freq_hz: f64,
    /// Signal threshold applied to the batch, in millivolts.
    pub signal_threshold_mv: f64,
    /// Ambient temperature in celsius.
    pub temperature_c: f64,

    /// Number of waveforms in the batch.
    pub n_waveforms: f64,
    /// Fraction of waveforms carrying a signal pulse.
    pub occupancy: f64,
    pub gain_mean: f64,
    pub gain_fwhm: f64,
    /// Peak charge in picocoulombs.
    pub charge_mean_pc: f64,
    pub charge_fwhm_pc: f64,
    /// Peak pulse amplitude (trace minimum) in millivolts.
    pub amplitude_mean_mv: f64,
    pub amplitude_fwhm_mv: f64,
    pub baseline_mean_mv: f64,
    pub baseline_sigma_mv: f64,
    /// Gain-histogram peak count over valley count.
    pub peak_to_valley: f64,
    pub rise_time_mean_ns: f64,
    pub rise_time_fwhm_ns: f64,
    pub transit_time_mean_ns: f64,
    pub transit_time_fwhm_ns: f64,

    /// Total dark-count acquisition window in seconds.
    pub dark_duration_s: f64,
    pub dark_count: f64,
    pub dark_rate_hz: f64,
}

impl Default for MeasurementMetadata {
    fn default() -> Self {
        Self {
            theta: UNSET,
            phi: UNSET,
            dy10_v: UNSET,
            psu_v: UNSET,
            psu_i: UNSET,
            laser_tune: UNSET,
            laser_freq_hz: UNSET,
            signal_threshold_mv: UNSET,
            temperature_c: UNSET,
            n_waveforms: UNSET,
            occupancy: UNSET,
            gain_mean: UNSET,
            gain_fwhm: UNSET,
            charge_mean_pc: UNSET,
            charge_fwhm_pc: UNSET,
            amplitude_mean_mv: UNSET,
            amplitude_fwhm_mv: UNSET,
            baseline_mean_mv: UNSET,
            baseline_sigma_mv: UNSET,
            peak_to_valley: UNSET,
            rise_time_mean_ns: UNSET,
            rise_time_fwhm_ns: UNSET,
            transit_time_mean_ns: UNSET,
            transit_time_fwhm_ns: UNSET,
            dark_duration_s: UNSET,
            dark_count: UNSET,
            dark_rate_hz: UNSET,
        }
    }
}

/// One batch of waveforms acquired at a fixed bench configuration.
#[derive(Debug, Clone, Default)]
pub struct Measurement {
    waveforms: Vec<Waveform>,
    pub metadata: MeasurementMetadata,
    filtered_by_threshold: bool,
}

impl Measurement {
    pub fn new(waveforms: Vec<Waveform>) -> Self {
        let metadata = MeasurementMetadata {
            n_waveforms: waveforms.len() as f64,
            ..Default::default()
        };
        Self {
            waveforms,
            metadata,
            filtered_by_threshold: false,
        }
    }

    pub fn waveforms(&self) -> &[Waveform] {
        &self.waveforms
    }

    pub fn len(&self) -> usize {
        self.waveforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }

    pub fn push(&mut self, waveform: Waveform) {
        self.waveforms.push(waveform);
        self.metadata.n_waveforms = self.waveforms.len() as f64;
    }

    /// Drop the raw traces, keeping the metadata record.
    pub fn clear(&mut self) {
        self.waveforms.clear();
    }

    /// Fraction of waveforms whose minimum falls strictly below `threshold_mv`.
    ///
    /// The occupancy is always evaluated over the full batch. If the batch
    /// was previously reduced with [`filter_by_threshold`] the returned
    /// fraction is of the surviving set, which is no longer the acquisition
    /// occupancy, so a warning is logged.
    ///
    /// [`filter_by_threshold`]: Measurement::filter_by_threshold
    pub fn occupancy(&self, threshold_mv: f64) -> f64 {
        if self.waveforms.is_empty() {
            return 0.0;
        }
        if self.filtered_by_threshold {
            warn!("occupancy requested on a threshold-filtered batch");
        }
        let hits = self
            .waveforms
            .iter()
            .filter(|w| w.min_value() < threshold_mv)
            .count();
        hits as f64 / self.waveforms.len() as f64
    }

    /// Keep only waveforms whose minimum is at or below `threshold_mv`.
    ///
    /// This is irreversible for the batch: the dropped traces are gone and
    /// subsequent occupancy values refer to the reduced set.
    pub fn filter_by_threshold(&mut self, threshold_mv: f64) {
        self.waveforms.retain(|w| w.min_value() <= threshold_mv);
        self.metadata.n_waveforms = self.waveforms.len() as f64;
        self.filtered_by_threshold = true;
    }

    /// Sample-wise mean of all traces in the batch.
    ///
    /// Fails if the batch is empty or traces disagree in length.
    pub fn average_waveform(&self) -> AppResult<Waveform> {
        let first = self
            .waveforms
            .first()
            .ok_or_else(|| BenchError::Degenerate("cannot average an empty batch".into()))?;
        let n = first.len();
        if self.waveforms.iter().any(|w| w.len() != n) {
            return Err(BenchError::Degenerate(
                "cannot average waveforms of unequal length".into(),
            ));
        }
        let scale = 1.0 / self.waveforms.len() as f64;
        let mut signal = vec![0.0; n];
        let mut trigger = vec![0.0; n];
        for w in &self.waveforms {
            for (acc, &v) in signal.iter_mut().zip(w.signal()) {
                *acc += v * scale;
            }
            for (acc, &v) in trigger.iter_mut().zip(w.trigger()) {
                *acc += v * scale;
            }
        }
        Waveform::new(first.time().to_vec(), signal, trigger)
    }

    /// Fill the metadata record with batch statistics.
    ///
    /// Features are histogrammed over signal-carrying waveforms and fitted
    /// with a Gaussian peak. A feature whose fit fails is logged and left at
    /// its sentinel; the remaining features are still computed.
    pub fn compute_statistics(&mut self, threshold_mv: f64) {
        self.metadata.signal_threshold_mv = threshold_mv;
        self.metadata.n_waveforms = self.waveforms.len() as f64;
        self.metadata.occupancy = self.occupancy(threshold_mv);

        let baselines: Vec<f64> = self.waveforms.iter().map(|w| w.baseline()).collect();
        if !baselines.is_empty() {
            let mean = baselines.iter().sum::<f64>() / baselines.len() as f64;
            let var = baselines.iter().map(|b| (b - mean) * (b - mean)).sum::<f64>()
                / baselines.len() as f64;
            self.metadata.baseline_mean_mv = mean;
            self.metadata.baseline_sigma_mv = var.sqrt();
        }

        let signal: Vec<&Waveform> = self
            .waveforms
            .iter()
            .filter(|w| w.min_value() < threshold_mv)
            .collect();
        if signal.is_empty() {
            return;
        }

        let gains: Vec<f64> = signal.iter().map(|w| w.gain()).collect();
        if let Some(fit) = self.fit_or_warn("gain", &gains) {
            self.metadata.gain_mean = fit.mean;
            self.metadata.gain_fwhm = fit.fwhm();
            self.metadata.peak_to_valley = peak_to_valley(&gains, fit.mean);
        }

        let charges_pc: Vec<f64> = signal.iter().map(|w| w.charge().abs() * 1e12).collect();
        if let Some(fit) = self.fit_or_warn("charge", &charges_pc) {
            self.metadata.charge_mean_pc = fit.mean;
            self.metadata.charge_fwhm_pc = fit.fwhm();
        }

        let amplitudes: Vec<f64> = signal.iter().map(|w| w.min_value()).collect();
        if let Some(fit) = self.fit_or_warn("amplitude", &amplitudes) {
            self.metadata.amplitude_mean_mv = fit.mean;
            self.metadata.amplitude_fwhm_mv = fit.fwhm();
        }

        let transits: Vec<f64> = signal.iter().map(|w| w.transit_time()).collect();
        if let Some(fit) = self.fit_or_warn("transit time", &transits) {
            self.metadata.transit_time_mean_ns = fit.mean;
            self.metadata.transit_time_fwhm_ns = fit.fwhm();
        }

        let rise_times: Vec<f64> = signal.iter().filter_map(|w| w.rise_time()).collect();
        if let Some(fit) = self.fit_or_warn("rise time", &rise_times) {
            self.metadata.rise_time_mean_ns = fit.mean;
            self.metadata.rise_time_fwhm_ns = fit.fwhm();
        }
    }

    fn fit_or_warn(&self, feature: &str, values: &[f64]) -> Option<GaussianFit> {
        match fit_feature(values, FEATURE_BINS) {
            Ok(fit) => Some(fit),
            Err(err) => {
                warn!(feature, %err, "feature fit failed, leaving sentinel");
                None
            }
        }
    }
}

/// Peak-to-valley ratio of the single-photoelectron gain distribution.
///
/// The valley is the minimum bin count between zero gain and the fitted peak
/// position. A zero-count valley yields the sentinel rather than infinity.
fn peak_to_valley(gains: &[f64], peak_gain: f64) -> f64 {
    let hist = stats::Histogram::from_values(gains, FEATURE_BINS);
    if hist.is_empty() {
        return UNSET;
    }
    let mut peak_count: f64 = 0.0;
    let mut valley: f64 = f64::INFINITY;
    for (i, &c) in hist.counts().iter().enumerate() {
        let x = hist.center(i);
        if x < peak_gain && x > 0.0 {
            valley = valley.min(c);
        }
        peak_count = peak_count.max(c);
    }
    if !valley.is_finite() || valley <= 0.0 {
        return UNSET;
    }
    peak_count / valley
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::synthetic;

    fn batch(n_signal: usize, n_quiet: usize) -> Measurement {
        let mut waveforms = Vec::new();
        for _ in 0..n_signal {
            waveforms.push(synthetic(500, 10, Some((215.0, 10.0))));
        }
        for _ in 0..n_quiet {
            waveforms.push(synthetic(500, 10, None));
        }
        Measurement::new(waveforms)
    }

    #[test]
    fn occupancy_counts_strictly_below_threshold() {
        let m = batch(3, 7);
        assert!((m.occupancy(-4.0) - 0.3).abs() < 1e-12);
        assert_eq!(m.occupancy(-20.0), 0.0);
    }

    #[test]
    fn occupancy_of_empty_batch_is_zero() {
        let m = Measurement::new(Vec::new());
        assert_eq!(m.occupancy(-4.0), 0.0);
    }

    #[test]
    fn filter_drops_quiet_waveforms() {
        let mut m = batch(3, 7);
        m.filter_by_threshold(-4.0);
        assert_eq!(m.len(), 3);
        assert_eq!(m.metadata.n_waveforms, 3.0);
        // The surviving set is all signal.
        assert!((m.occupancy(-4.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn average_waveform_requires_equal_lengths() {
        let mut m = batch(2, 0);
        m.push(synthetic(400, 10, None));
        assert!(m.average_waveform().is_err());
    }

    #[test]
    fn average_waveform_of_identical_traces_is_the_trace() {
        let m = batch(4, 0);
        let avg = m.average_waveform().unwrap();
        let one = &m.waveforms()[0];
        for (a, b) in avg.signal().iter().zip(one.signal()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn statistics_fill_occupancy_and_baseline() {
        let mut m = batch(5, 5);
        m.compute_statistics(-4.0);
        assert!((m.metadata.occupancy - 0.5).abs() < 1e-12);
        assert!(m.metadata.baseline_mean_mv.abs() < 0.5);
        assert_eq!(m.metadata.n_waveforms, 10.0);
        assert_eq!(m.metadata.signal_threshold_mv, -4.0);
    }

    #[test]
    fn statistics_on_quiet_batch_leave_feature_sentinels() {
        let mut m = batch(0, 6);
        m.compute_statistics(-4.0);
        assert_eq!(m.metadata.occupancy, 0.0);
        assert_eq!(m.metadata.gain_mean, UNSET);
        assert_eq!(m.metadata.transit_time_mean_ns, UNSET);
    }

    #[test]
    fn clear_keeps_metadata() {
        let mut m = batch(3, 0);
        m.compute_statistics(-4.0);
        let occupancy = m.metadata.occupancy;
        m.clear();
        assert!(m.is_empty());
        assert_eq!(m.metadata.occupancy, occupancy);
    }

    #[test]
    fn metadata_defaults_are_sentinels() {
        let md = MeasurementMetadata::default();
        assert_eq!(md.theta, UNSET);
        assert_eq!(md.dark_rate_hz, UNSET);
    }
}
