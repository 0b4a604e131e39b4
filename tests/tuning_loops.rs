//! End-to-end tuning against the simulated bench.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pmt_daq::capabilities::{BiasSupply, PulsedLightSource, RotationStage, WaveformSource};
use pmt_daq::hardware::mock::{MockBench, MockBenchConfig};
use pmt_daq::{tune_gain, tune_occupancy, BenchError, HvSettle, StepDirection, TuneParams};

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn occupancy_params() -> TuneParams {
    TuneParams {
        band: (0.05, 0.15),
        step: 0.5,
        direction: StepDirection::Direct,
        max_iter: 20,
        settle: Duration::from_millis(0),
        waveforms_per_step: 200,
        signal_threshold: -4.0,
    }
}

fn gain_params() -> TuneParams {
    TuneParams {
        band: (0.95e7, 1.05e7),
        step: 10.0,
        direction: StepDirection::Direct,
        max_iter: 15,
        settle: Duration::from_millis(0),
        waveforms_per_step: 200,
        signal_threshold: -4.0,
    }
}

fn bench_with_short_traces() -> MockBench {
    MockBench::new(MockBenchConfig {
        trace_samples: 256,
        ..MockBenchConfig::default()
    })
}

/// Bench with the bias already at nominal, so pulses are visible above the
/// signal threshold and occupancy can be tuned in isolation.
async fn biased_bench() -> MockBench {
    let bench = MockBench::new(MockBenchConfig::default());
    bench
        .bias_supply()
        .set_voltage(1000.0, 0.5, 50, Duration::from_millis(0))
        .await
        .unwrap();
    bench
}

fn hv_settle() -> HvSettle {
    HvSettle {
        tolerance_v: 0.5,
        max_iter: 50,
        wait: Duration::from_millis(0),
    }
}

#[tokio::test]
async fn occupancy_tunes_from_a_dark_start() {
    init_logs();
    let bench = biased_bench().await;
    let light = bench.light_source();
    let digitizer = bench.digitizer();
    let params = occupancy_params();

    // The loop must turn the light on itself.
    let outcome = tune_occupancy(&light, &digitizer, &params, Some(0.0))
        .await
        .unwrap();

    assert!(outcome.converged, "outcome: {outcome:?}");
    assert!(outcome.value >= params.band.0 && outcome.value <= params.band.1);
    assert!(outcome.knob > 0.0);
    assert!(light.emission_on().await.unwrap());
    // The final setpoint stuck on the instrument.
    assert_eq!(light.intensity_tune().await.unwrap(), outcome.knob);
}

#[tokio::test]
async fn occupancy_reports_soft_failure_for_unreachable_band() {
    init_logs();
    let bench = biased_bench().await;
    let light = bench.light_source();
    let digitizer = bench.digitizer();
    let params = TuneParams {
        band: (2.0, 3.0), // occupancy is a fraction, this can never be hit
        max_iter: 5,
        ..occupancy_params()
    };

    let outcome = tune_occupancy(&light, &digitizer, &params, Some(0.0))
        .await
        .unwrap();

    assert!(!outcome.converged);
    assert_eq!(outcome.iterations, 5);
    assert!(outcome.value <= 1.0);
}

#[tokio::test]
async fn gain_tunes_the_bias_through_nested_loops() {
    init_logs();
    // Short traces keep the nested loops fast; the pulse at 215 ns still
    // fits, and the gain fit needs large batches to populate its histogram.
    let bench = bench_with_short_traces();
    let light = bench.light_source();
    let supply = bench.bias_supply();
    let stage = bench.rotation_stage();
    let digitizer = bench.digitizer();

    let occupancy = TuneParams {
        waveforms_per_step: 300,
        ..occupancy_params()
    };
    let gain = TuneParams {
        waveforms_per_step: 1500,
        ..gain_params()
    };

    // Start well below the nominal bias; the loop must climb to it, turning
    // the supply on and homing the stage along the way.
    let outcome = tune_gain(
        &light,
        &supply,
        &stage,
        &digitizer,
        &occupancy,
        &gain,
        &hv_settle(),
        Some(900.0),
    )
    .await
    .unwrap();

    assert!(outcome.converged, "outcome: {outcome:?}");
    let (lo, hi) = gain_params().band;
    assert!(outcome.value >= lo && outcome.value <= hi);
    assert!((outcome.knob - 1000.0).abs() < 15.0, "knob {}", outcome.knob);
    assert!(supply.is_on().await.unwrap());
    assert!(stage.is_homed().await.unwrap());
    // Occupancy stayed tuned by the inner loop.
    let batch = digitizer.block_measurement(300).await.unwrap();
    let occupancy = batch.occupancy(-4.0);
    assert!((0.05..=0.15).contains(&occupancy), "occupancy {occupancy}");
}

/// A light source whose emission can never be established.
struct DeadLight;

#[async_trait]
impl PulsedLightSource for DeadLight {
    async fn emission_on(&self) -> Result<bool> {
        Ok(false)
    }
    async fn turn_on_pulsed(&self) -> Result<()> {
        Ok(())
    }
    async fn set_intensity_tune(&self, _tune: f64) -> Result<()> {
        Ok(())
    }
    async fn intensity_tune(&self) -> Result<f64> {
        Ok(0.0)
    }
}

#[tokio::test]
async fn occupancy_refuses_to_run_without_emission() {
    init_logs();
    let bench = MockBench::new(MockBenchConfig::default());
    let digitizer = bench.digitizer();

    let err = tune_occupancy(&DeadLight, &digitizer, &occupancy_params(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, BenchError::Precondition(_)), "got {err}");
}
