//! Photomultiplier calibration bench: waveform analysis and closed-loop
//! parameter tuning.
//!
//! The crate splits into three layers:
//!
//! * analysis: [`waveform`] extracts per-trace features (charge, gain,
//!   transit and rise time), [`measurement`] aggregates batches and fits
//!   their feature distributions, [`measurement::dcs`] derives dark rates;
//! * instruments: [`capabilities`] defines the async traits the bench
//!   needs, [`hardware::mock`] implements them against a simulated bench;
//! * procedures: [`tuning`] closes the loop between a measured statistic
//!   and a single instrument knob.
//!
//! [`config`] loads layered settings and [`storage`] (behind the
//! `storage_hdf5` feature) persists batches to HDF5.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
#[cfg(feature = "storage_hdf5")]
pub mod storage;
pub mod tuning;
pub mod waveform;

pub use capabilities::{BiasSupply, PulsedLightSource, RotationStage, WaveformSource};
pub use self::config::Settings;
pub use error::{AppResult, BenchError};
pub use measurement::dcs::DcsMeasurement;
pub use measurement::{Measurement, MeasurementMetadata};
pub use tuning::{tune_gain, tune_occupancy, HvSettle, StepDirection, TuneOutcome, TuneParams};
pub use waveform::Waveform;
