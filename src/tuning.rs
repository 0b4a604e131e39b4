//! Closed-loop tuning of the light intensity and the PMT bias.
//!
//! Both loops share one scheme: read a batch statistic, compare it against
//! an acceptance band, and nudge a single knob by a fixed step until the
//! statistic lands in the band or the iteration cap is hit. Hitting the cap
//! is a soft failure reported in the outcome, not an error; the procedures
//! only fail hard on instrument errors and unmet preconditions.
//!
//! [`tune_gain`] nests [`tune_occupancy`]: the single-photoelectron gain is
//! only meaningful at low occupancy, so every bias step re-tunes the light
//! first.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::{BiasSupply, PulsedLightSource, RotationStage, WaveformSource};
use crate::error::{AppResult, BenchError};
use crate::measurement::stats::fit_feature;
use crate::measurement::Measurement;

/// Bins used when fitting the per-step gain distribution.
const GAIN_FIT_BINS: usize = 50;

/// How the measured statistic responds to a knob increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepDirection {
    /// Raising the knob raises the statistic.
    Direct,
    /// Raising the knob lowers the statistic.
    Inverse,
}

/// Parameters of one tuning loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneParams {
    /// Acceptance band `(min, max)` for the measured statistic.
    pub band: (f64, f64),
    /// Knob increment per iteration, in knob units.
    pub step: f64,
    pub direction: StepDirection,
    pub max_iter: usize,
    /// Settling delay between moving the knob and acquiring.
    pub settle: Duration,
    pub waveforms_per_step: usize,
    /// Signal threshold used for occupancy and signal selection, mV.
    pub signal_threshold: f64,
}

/// Bias-supply settling policy passed through to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HvSettle {
    pub tolerance_v: f64,
    pub max_iter: usize,
    pub wait: Duration,
}

/// Result of a tuning loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuneOutcome {
    /// Whether the statistic landed in the band before the iteration cap.
    pub converged: bool,
    pub iterations: usize,
    /// Last measured statistic.
    pub value: f64,
    /// Final knob setpoint.
    pub knob: f64,
}

/// Next knob setpoint given the last measurement, or `None` when the
/// statistic already sits in the band.
pub fn next_knob(measured: f64, knob: f64, params: &TuneParams) -> Option<f64> {
    let (lo, hi) = params.band;
    let signed_step = match params.direction {
        StepDirection::Direct => params.step,
        StepDirection::Inverse => -params.step,
    };
    if measured < lo {
        Some(knob + signed_step)
    } else if measured > hi {
        Some(knob - signed_step)
    } else {
        None
    }
}

/// Tune the light-source intensity until the occupancy sits in the band.
///
/// Precondition: the source must emit. A source found off is switched to
/// pulsed emission once; if it still reports off the loop refuses to run,
/// since stepping the tune of a dark source can never converge.
///
/// The starting knob is `start`, or the live intensity setpoint when
/// `start` is `None`.
pub async fn tune_occupancy(
    light: &dyn PulsedLightSource,
    digitizer: &dyn WaveformSource,
    params: &TuneParams,
    start: Option<f64>,
) -> AppResult<TuneOutcome> {
    if !light.emission_on().await.map_err(BenchError::instrument)? {
        light.turn_on_pulsed().await.map_err(BenchError::instrument)?;
        if !light.emission_on().await.map_err(BenchError::instrument)? {
            return Err(BenchError::Precondition(
                "light source did not switch to pulsed emission".into(),
            ));
        }
    }

    let mut knob = match start {
        Some(v) => v,
        None => light.intensity_tune().await.map_err(BenchError::instrument)?,
    };
    let mut occupancy = f64::NAN;

    for iteration in 1..=params.max_iter {
        light
            .set_intensity_tune(knob)
            .await
            .map_err(BenchError::instrument)?;
        tokio::time::sleep(params.settle).await;

        let batch = digitizer
            .block_measurement(params.waveforms_per_step)
            .await
            .map_err(BenchError::instrument)?;
        occupancy = batch.occupancy(params.signal_threshold);
        debug!(iteration, knob, occupancy, "occupancy step");

        match next_knob(occupancy, knob, params) {
            None => {
                info!(iteration, knob, occupancy, "occupancy tuned");
                return Ok(TuneOutcome {
                    converged: true,
                    iterations: iteration,
                    value: occupancy,
                    knob,
                });
            }
            Some(next) => knob = next,
        }
    }

    warn!(
        occupancy,
        knob,
        max_iter = params.max_iter,
        "occupancy did not reach the band"
    );
    Ok(TuneOutcome {
        converged: false,
        iterations: params.max_iter,
        value: occupancy,
        knob,
    })
}

/// Tune the PMT bias until the single-photoelectron gain sits in the band.
///
/// Preconditions: the supply must be on (a supply found off is switched on
/// once) and the rotation stage must be homed (an unhomed stage is homed
/// once), so the gain is measured at a defined bias and orientation.
///
/// Every bias step first re-tunes the occupancy with `occupancy_params`; a
/// non-converged inner loop is logged and the gain step proceeds anyway.
/// The starting bias is `start`, or the live readback when `start` is
/// `None`.
#[allow(clippy::too_many_arguments)]
pub async fn tune_gain(
    light: &dyn PulsedLightSource,
    supply: &dyn BiasSupply,
    stage: &dyn RotationStage,
    digitizer: &dyn WaveformSource,
    occupancy_params: &TuneParams,
    gain_params: &TuneParams,
    hv: &HvSettle,
    start: Option<f64>,
) -> AppResult<TuneOutcome> {
    if !supply.is_on().await.map_err(BenchError::instrument)? {
        supply.turn_on().await.map_err(BenchError::instrument)?;
        if !supply.is_on().await.map_err(BenchError::instrument)? {
            return Err(BenchError::Precondition(
                "bias supply did not switch on".into(),
            ));
        }
    }
    if !stage.is_homed().await.map_err(BenchError::instrument)? {
        stage.go_home().await.map_err(BenchError::instrument)?;
        if !stage.is_homed().await.map_err(BenchError::instrument)? {
            return Err(BenchError::Precondition(
                "rotation stage did not report homed".into(),
            ));
        }
    }

    let mut knob = match start {
        Some(v) => v,
        None => supply.voltage().await.map_err(BenchError::instrument)?,
    };
    let mut gain = f64::NAN;

    for iteration in 1..=gain_params.max_iter {
        let inner = tune_occupancy(light, digitizer, occupancy_params, None).await?;
        if !inner.converged {
            warn!(
                occupancy = inner.value,
                "proceeding with untuned occupancy"
            );
        }

        let readback = supply
            .set_voltage(knob, hv.tolerance_v, hv.max_iter, hv.wait)
            .await
            .map_err(BenchError::instrument)?;
        tokio::time::sleep(gain_params.settle).await;

        let batch = digitizer
            .block_measurement(gain_params.waveforms_per_step)
            .await
            .map_err(BenchError::instrument)?;
        gain = batch_gain(&batch, gain_params.signal_threshold);
        debug!(iteration, knob, readback, gain, "gain step");

        match next_knob(gain, knob, gain_params) {
            None => {
                info!(iteration, knob, gain, "gain tuned");
                return Ok(TuneOutcome {
                    converged: true,
                    iterations: iteration,
                    value: gain,
                    knob,
                });
            }
            Some(next) => knob = next,
        }
    }

    warn!(
        gain,
        knob,
        max_iter = gain_params.max_iter,
        "gain did not reach the band"
    );
    Ok(TuneOutcome {
        converged: false,
        iterations: gain_params.max_iter,
        value: gain,
        knob,
    })
}

/// Fitted gain of the signal-carrying waveforms in a batch.
///
/// A batch with no signal, or one whose gain histogram cannot be fitted,
/// yields 0 so the loop steps towards more gain instead of failing.
fn batch_gain(batch: &Measurement, threshold_mv: f64) -> f64 {
    let gains: Vec<f64> = batch
        .waveforms()
        .iter()
        .filter(|w| w.min_value() < threshold_mv)
        .map(|w| w.gain())
        .collect();
    if gains.is_empty() {
        warn!("no signal waveforms in gain batch");
        return 0.0;
    }
    match fit_feature(&gains, GAIN_FIT_BINS) {
        Ok(fit) => fit.mean,
        Err(err) => {
            warn!(%err, "gain fit failed, treating batch as zero gain");
            0.0
        }
    }
}
