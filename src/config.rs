//! Layered settings.
//!
//! Settings come from an optional TOML file overlaid with `PMT__`-prefixed
//! environment variables, so a deployment can pin a full file while a quick
//! bench session overrides a single knob from the shell. Every field has a
//! default; an empty configuration is valid and describes the simulated
//! bench.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppResult, BenchError};
use crate::hardware::mock::MockBenchConfig;
use crate::tuning::{HvSettle, StepDirection, TuneParams};
use crate::waveform::DEFAULT_SIGNAL_THRESHOLD_MV;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tracing filter directive, e.g. `info` or `pmt_daq=debug`.
    pub log_level: String,
    pub acquisition: AcquisitionSettings,
    pub occupancy: TuneSettings,
    pub gain: TuneSettings,
    pub hv: HvSettings,
    pub mock: MockBenchConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            acquisition: AcquisitionSettings::default(),
            occupancy: TuneSettings::default_occupancy(),
            gain: TuneSettings::default_gain(),
            hv: HvSettings::default(),
            mock: MockBenchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Waveforms per triggered batch outside the tuning loops.
    pub waveforms_per_batch: usize,
    pub dark_windows: usize,
    pub dark_window_samples: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            waveforms_per_batch: 10_000,
            dark_windows: 100,
            dark_window_samples: 100_000,
        }
    }
}

/// One tuning loop as written in the settings file. Converted to
/// [`TuneParams`] for the procedures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default = "TuneSettings::default_occupancy")]
pub struct TuneSettings {
    pub band_min: f64,
    pub band_max: f64,
    pub step: f64,
    pub direction: StepDirection,
    pub max_iter: usize,
    pub settle_ms: u64,
    pub waveforms_per_step: usize,
    pub signal_threshold_mv: f64,
}

impl TuneSettings {
    fn default_occupancy() -> Self {
        Self {
            band_min: 0.05,
            band_max: 0.15,
            step: 0.5,
            direction: StepDirection::Direct,
            max_iter: 50,
            settle_ms: 200,
            waveforms_per_step: 1000,
            signal_threshold_mv: DEFAULT_SIGNAL_THRESHOLD_MV,
        }
    }

    fn default_gain() -> Self {
        Self {
            band_min: 0.95e7,
            band_max: 1.05e7,
            step: 10.0,
            direction: StepDirection::Direct,
            max_iter: 30,
            settle_ms: 1000,
            waveforms_per_step: 1000,
            signal_threshold_mv: DEFAULT_SIGNAL_THRESHOLD_MV,
        }
    }

    pub fn to_params(&self) -> TuneParams {
        TuneParams {
            band: (self.band_min, self.band_max),
            step: self.step,
            direction: self.direction,
            max_iter: self.max_iter,
            settle: Duration::from_millis(self.settle_ms),
            waveforms_per_step: self.waveforms_per_step,
            signal_threshold: self.signal_threshold_mv,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HvSettings {
    pub tolerance_v: f64,
    pub max_iter: usize,
    pub wait_ms: u64,
}

impl Default for HvSettings {
    fn default() -> Self {
        Self {
            tolerance_v: 0.5,
            max_iter: 20,
            wait_ms: 500,
        }
    }
}

impl HvSettings {
    pub fn to_settle(&self) -> HvSettle {
        HvSettle {
            tolerance_v: self.tolerance_v,
            max_iter: self.max_iter,
            wait: Duration::from_millis(self.wait_ms),
        }
    }
}

impl Settings {
    /// Load settings from `config/default.toml` (if present), then the
    /// given file (if any), then `PMT__`-prefixed environment variables,
    /// later sources overriding earlier ones.
    pub fn new(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder =
            Config::builder().add_source(File::with_name("config/default").required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(Environment::with_prefix("PMT").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Reject parameter combinations under which a tuning loop cannot make
    /// progress.
    pub fn validate(&self) -> AppResult<()> {
        for (name, tune) in [("occupancy", &self.occupancy), ("gain", &self.gain)] {
            if tune.band_min >= tune.band_max {
                return Err(BenchError::Configuration(format!(
                    "{name}: band_min {} must be below band_max {}",
                    tune.band_min, tune.band_max
                )));
            }
            if tune.step <= 0.0 {
                return Err(BenchError::Configuration(format!(
                    "{name}: step must be positive, got {}",
                    tune.step
                )));
            }
            if tune.max_iter == 0 || tune.waveforms_per_step == 0 {
                return Err(BenchError::Configuration(format!(
                    "{name}: max_iter and waveforms_per_step must be nonzero"
                )));
            }
        }
        if self.hv.tolerance_v <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "hv: tolerance_v must be positive, got {}",
                self.hv.tolerance_v
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            log_level = "debug"

            [occupancy]
            band_min = 0.08
            band_max = 0.12
            "#,
        )
        .unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.occupancy.band_min, 0.08);
        // Untouched sections keep their defaults.
        assert_eq!(settings.gain.max_iter, 30);
        assert_eq!(settings.hv.max_iter, 20);
    }

    #[test]
    fn inverted_band_is_rejected() {
        let mut settings = Settings::default();
        settings.gain.band_min = 2.0e7;
        settings.gain.band_max = 1.0e7;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("band_min"));
    }

    #[test]
    fn zero_step_is_rejected() {
        let mut settings = Settings::default();
        settings.occupancy.step = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tune_settings_convert_to_params() {
        let tune = TuneSettings::default_occupancy();
        let params = tune.to_params();
        assert_eq!(params.band, (0.05, 0.15));
        assert_eq!(params.settle, Duration::from_millis(200));
        assert_eq!(params.direction, StepDirection::Direct);
    }
}
