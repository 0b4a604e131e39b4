//! Capability traits for the bench instruments.
//!
//! Each trait covers one narrow concern so procedures can depend on exactly
//! the capabilities they exercise. Implementations take `&self` and use
//! interior mutability; handles are shared across tasks, so every trait is
//! `Send + Sync`. Methods return `anyhow::Result` and drivers attach their
//! own context, the procedures map failures into bench errors at the call
//! site.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::measurement::dcs::DcsMeasurement;
use crate::measurement::Measurement;

/// A digitizer that can deliver batches of triggered waveforms.
#[async_trait]
pub trait WaveformSource: Send + Sync {
    /// Acquire `count` triggered waveforms as one batch.
    async fn block_measurement(&self, count: usize) -> Result<Measurement>;

    /// Acquire `windows` untriggered windows of `samples` samples each,
    /// for dark-count analysis.
    async fn dcs_measurement(&self, windows: usize, samples: usize) -> Result<DcsMeasurement>;
}

/// A pulsed light source with a continuously variable intensity.
#[async_trait]
pub trait PulsedLightSource: Send + Sync {
    /// Whether the source is currently emitting.
    async fn emission_on(&self) -> Result<bool>;

    /// Switch the source into pulsed emission.
    async fn turn_on_pulsed(&self) -> Result<()>;

    /// Set the intensity tune. Larger tune values mean dimmer pulses on
    /// some heads and brighter on others; callers carry the direction.
    async fn set_intensity_tune(&self, tune: f64) -> Result<()>;

    /// Current intensity tune setpoint.
    async fn intensity_tune(&self) -> Result<f64>;
}

/// A high-voltage bias supply with slow settling.
#[async_trait]
pub trait BiasSupply: Send + Sync {
    async fn is_on(&self) -> Result<bool>;

    async fn turn_on(&self) -> Result<()>;

    /// Ramp to `target_v` and poll the readback every `wait` until it is
    /// within `tolerance_v` or `max_iter` polls have elapsed. Returns the
    /// final readback voltage either way.
    async fn set_voltage(
        &self,
        target_v: f64,
        tolerance_v: f64,
        max_iter: usize,
        wait: Duration,
    ) -> Result<f64>;

    /// Current readback voltage.
    async fn voltage(&self) -> Result<f64>;
}

/// A two-axis rotation stage carrying the photomultiplier.
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Drive both axes to their home switches.
    async fn go_home(&self) -> Result<()>;

    /// Current `(theta, phi)` position in degrees.
    async fn position(&self) -> Result<(f64, f64)>;

    /// Whether a homing run has completed since power-up.
    async fn is_homed(&self) -> Result<bool>;
}
