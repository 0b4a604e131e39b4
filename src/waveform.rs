//! Single-trace feature extraction.
//!
//! A [`Waveform`] is one digitized trace: a time axis (ns), the PMT anode
//! signal (mV), and the optical trigger reference (mV), all sample-aligned.
//! It exposes the derived quantities the calibration needs — pulse minimum,
//! trigger and transit time, rise time, an adaptive integration window,
//! charge, and gain — as functions of the stored arrays.
//!
//! The arrays are immutable after construction except for
//! [`Waveform::subtract_baseline`], which shifts the signal and invalidates
//! the memoized charge. The numeric constants below are fixed calibration
//! parameters of the bench, not tunables; they must be reproduced exactly
//! for bit-compatible gain values across analyses.

use once_cell::sync::OnceCell;

use crate::error::{AppResult, BenchError};

/// Termination resistance of the digitizer input, ohms.
pub const TERMINATION_OHMS: f64 = 50.0;

/// Trigger channel crossing level, mV.
pub const TRIGGER_LEVEL_MV: f64 = 2000.0;

/// Sample index substituted when the trigger channel never crosses.
pub const DEFAULT_TRIGGER_INDEX: usize = 100;

/// Expected single-photoelectron transit-time window relative to the
/// trigger, ns. Doubles as the absolute fallback integration window.
pub const TRANSIT_WINDOW_NS: (f64, f64) = (190.0, 220.0);

/// Default signal threshold for pulse detection, mV (pulses are negative).
pub const DEFAULT_SIGNAL_THRESHOLD_MV: f64 = -4.0;

/// Elementary charge, coulombs (CODATA exact value).
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;

/// Integration window half-widths around the pulse minimum, samples.
const MASK_PRE_SAMPLES: usize = 10;
const MASK_POST_SAMPLES: usize = 15;

/// One digitized trace with memoized derived features.
#[derive(Debug)]
pub struct Waveform {
    time: Vec<f64>,
    signal: Vec<f64>,
    trigger: Vec<f64>,
    signal_threshold: Option<f64>,
    charge_cache: OnceCell<f64>,
}

impl Clone for Waveform {
    fn clone(&self) -> Self {
        Self {
            time: self.time.clone(),
            signal: self.signal.clone(),
            trigger: self.trigger.clone(),
            signal_threshold: self.signal_threshold,
            charge_cache: self.charge_cache.clone(),
        }
    }
}

impl Waveform {
    /// Build a waveform from sample-aligned arrays.
    ///
    /// Fails if the arrays differ in length or are empty. The signal
    /// threshold defaults to [`DEFAULT_SIGNAL_THRESHOLD_MV`].
    pub fn new(time: Vec<f64>, signal: Vec<f64>, trigger: Vec<f64>) -> AppResult<Self> {
        if time.len() != signal.len() || time.len() != trigger.len() {
            return Err(BenchError::Degenerate(format!(
                "waveform arrays must be equal length (time={}, signal={}, trigger={})",
                time.len(),
                signal.len(),
                trigger.len()
            )));
        }
        if time.is_empty() {
            return Err(BenchError::Degenerate("waveform arrays are empty".into()));
        }
        Ok(Self {
            time,
            signal,
            trigger,
            signal_threshold: Some(DEFAULT_SIGNAL_THRESHOLD_MV),
            charge_cache: OnceCell::new(),
        })
    }

    /// Same as [`Waveform::new`] with an explicit threshold; `None` disables
    /// pulse detection (every waveform counts as having signal).
    pub fn with_threshold(
        time: Vec<f64>,
        signal: Vec<f64>,
        trigger: Vec<f64>,
        signal_threshold: Option<f64>,
    ) -> AppResult<Self> {
        let mut wf = Self::new(time, signal, trigger)?;
        wf.signal_threshold = signal_threshold;
        Ok(wf)
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn signal(&self) -> &[f64] {
        &self.signal
    }

    pub fn trigger(&self) -> &[f64] {
        &self.trigger
    }

    pub fn signal_threshold(&self) -> Option<f64> {
        self.signal_threshold
    }

    /// Index of the signal minimum.
    pub fn min_index(&self) -> usize {
        let mut idx = 0;
        let mut min = self.signal[0];
        for (i, &v) in self.signal.iter().enumerate().skip(1) {
            if v < min {
                min = v;
                idx = i;
            }
        }
        idx
    }

    /// Minimum signal value, mV.
    pub fn min_value(&self) -> f64 {
        self.signal[self.min_index()]
    }

    /// Time of the signal minimum, ns.
    pub fn min_time(&self) -> f64 {
        self.time[self.min_index()]
    }

    /// Whether the trace contains a pulse: minimum below the threshold.
    /// Always true when the threshold is disabled.
    pub fn has_signal(&self) -> bool {
        match self.signal_threshold {
            Some(thr) => self.min_value() < thr,
            None => true,
        }
    }

    /// Index of the first upward crossing of the trigger channel through
    /// [`TRIGGER_LEVEL_MV`]; falls back to [`DEFAULT_TRIGGER_INDEX`]
    /// (clamped to the trace) when no crossing exists.
    pub fn trigger_index(&self) -> usize {
        for i in 1..self.trigger.len() {
            if self.trigger[i - 1] < TRIGGER_LEVEL_MV && self.trigger[i] >= TRIGGER_LEVEL_MV {
                return i;
            }
        }
        DEFAULT_TRIGGER_INDEX.min(self.trigger.len() - 1)
    }

    /// Time of the trigger crossing, ns.
    pub fn trigger_time(&self) -> f64 {
        self.time[self.trigger_index()]
    }

    /// Delay between the trigger reference and the pulse minimum, ns.
    pub fn transit_time(&self) -> f64 {
        self.min_time() - self.trigger_time()
    }

    /// First time the signal drops below the threshold, ns. `None` when the
    /// trace never crosses (or the threshold is disabled).
    pub fn threshold_crossing_time(&self) -> Option<f64> {
        let thr = self.signal_threshold?;
        self.signal
            .iter()
            .position(|&v| v < thr)
            .map(|i| self.time[i])
    }

    /// Leading-edge rise time: pulse minimum minus threshold crossing, ns.
    pub fn rise_time(&self) -> Option<f64> {
        Some(self.min_time() - self.threshold_crossing_time()?)
    }

    /// Mean of the signal before the trigger crossing, mV. Falls back to the
    /// full-trace mean for traces where the trigger sits at sample zero.
    pub fn baseline(&self) -> f64 {
        let end = self.trigger_index();
        let window = if end > 0 {
            &self.signal[..end]
        } else {
            &self.signal[..]
        };
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// Subtract the pre-trigger baseline from the signal in place.
    ///
    /// The only permitted mutation; it invalidates the memoized charge so a
    /// later [`Waveform::charge`] recomputes against the shifted samples.
    pub fn subtract_baseline(&mut self) {
        let baseline = self.baseline();
        for v in &mut self.signal {
            *v -= baseline;
        }
        self.charge_cache = OnceCell::new();
    }

    /// Integration window as a contiguous sample range.
    ///
    /// If the pulse minimum lands inside the expected transit-time window
    /// relative to the trigger, the window is centered on the minimum
    /// (−10/+15 samples, clamped). Otherwise the trigger-pulse coincidence
    /// is assumed lost and the fixed absolute window
    /// [`TRANSIT_WINDOW_NS`] on the time axis is used instead, which avoids
    /// integrating noise far from the expected pulse location.
    pub fn mask(&self) -> std::ops::Range<usize> {
        let (lo, hi) = TRANSIT_WINDOW_NS;
        let transit = self.transit_time();
        if (lo..=hi).contains(&transit) {
            let min_idx = self.min_index();
            let start = min_idx.saturating_sub(MASK_PRE_SAMPLES);
            let end = (min_idx + MASK_POST_SAMPLES + 1).min(self.len());
            start..end
        } else {
            let start = self.time.partition_point(|&t| t < lo);
            let end = self.time.partition_point(|&t| t <= hi);
            start..end
        }
    }

    /// Integrated anode charge over the mask, coulombs.
    ///
    /// Trapezoidal integral of the masked signal, converted mV→V and ns→s,
    /// divided by the 50 Ω termination. A mask selecting fewer than two
    /// samples yields 0 (pathological traces must not raise). Memoized;
    /// repeated calls return the identical cached value.
    pub fn charge(&self) -> f64 {
        *self.charge_cache.get_or_init(|| {
            let range = self.mask();
            if range.len() < 2 {
                return 0.0;
            }
            let mut area_mv_ns = 0.0;
            for i in range.start..range.end - 1 {
                let dt = self.time[i + 1] - self.time[i];
                area_mv_ns += 0.5 * (self.signal[i] + self.signal[i + 1]) * dt;
            }
            // mV·ns → V·s, then through the termination resistance.
            area_mv_ns * 1e-3 * 1e-9 / TERMINATION_OHMS
        })
    }

    /// Electron-multiplication gain: |charge| over the elementary charge.
    /// Idempotent through the charge memoization.
    pub fn gain(&self) -> f64 {
        self.charge().abs() / ELEMENTARY_CHARGE
    }
}

/// Test trace with dt = 1 ns, trigger rising at `trigger_idx`, and an
/// optional negative gaussian pulse `(center_ns, amplitude_mv)` of 4 ns
/// sigma. Shared across the crate's unit tests.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) fn synthetic(n: usize, trigger_idx: usize, pulse: Option<(f64, f64)>) -> Waveform {
    let time: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let trigger: Vec<f64> = (0..n)
        .map(|i| if i >= trigger_idx { 3000.0 } else { 0.0 })
        .collect();
    let signal: Vec<f64> = time
        .iter()
        .map(|&t| match pulse {
            Some((pulse_ns, amp_mv)) => {
                let z = (t - pulse_ns) / 4.0;
                -amp_mv * (-0.5 * z * z).exp()
            }
            None => 0.0,
        })
        .collect();
    Waveform::new(time, signal, trigger).unwrap()
}
