//! Simulated bench.
//!
//! One shared [`BenchState`] models the physics; each instrument handle is a
//! thin view on it, so turning the light up through the light-source handle
//! changes what the digitizer handle sees. The model is intentionally
//! simple but monotonic in both knobs, which is what the tuning loops rely
//! on:
//!
//! * occupancy rises with the intensity tune as `1 - exp(-tune / scale)`,
//! * gain follows a power law in the bias, `g0 * (hv / hv0)^k`,
//! * pulse amplitude is derived from the gain so that integrating the
//!   simulated trace returns that gain.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::capabilities::{BiasSupply, PulsedLightSource, RotationStage, WaveformSource};
use crate::measurement::dcs::DcsMeasurement;
use crate::measurement::Measurement;
use crate::waveform::{Waveform, ELEMENTARY_CHARGE, TERMINATION_OHMS};

fn default_nominal_hv_v() -> f64 {
    1000.0
}
fn default_gain_at_nominal() -> f64 {
    1.0e7
}
fn default_gain_exponent() -> f64 {
    7.0
}
fn default_occupancy_scale() -> f64 {
    10.0
}
fn default_trace_samples() -> usize {
    500
}
fn default_trigger_index() -> usize {
    10
}
fn default_pulse_time_ns() -> f64 {
    215.0
}
fn default_pulse_sigma_ns() -> f64 {
    4.0
}
fn default_noise_mv() -> f64 {
    0.5
}
fn default_command_latency_ms() -> u64 {
    1
}
fn default_dark_pulses_per_window() -> usize {
    2
}
fn default_seed() -> u64 {
    0x00d1_617a
}

/// Simulation parameters, loadable from the `[mock]` table of a settings
/// file. Every field has a sensible default, so `{}` is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockBenchConfig {
    /// Bias at which the gain equals `gain_at_nominal`, volts.
    pub nominal_hv_v: f64,
    pub gain_at_nominal: f64,
    /// Power-law exponent of gain versus bias.
    pub gain_exponent: f64,
    /// Intensity-tune scale in `occupancy = 1 - exp(-tune / scale)`.
    pub occupancy_scale: f64,
    pub trace_samples: usize,
    pub trigger_index: usize,
    pub pulse_time_ns: f64,
    pub pulse_sigma_ns: f64,
    /// Uniform noise amplitude added to every sample, mV.
    pub noise_mv: f64,
    pub command_latency_ms: u64,
    pub dark_pulses_per_window: usize,
    pub seed: u64,
}

impl Default for MockBenchConfig {
    fn default() -> Self {
        Self {
            nominal_hv_v: default_nominal_hv_v(),
            gain_at_nominal: default_gain_at_nominal(),
            gain_exponent: default_gain_exponent(),
            occupancy_scale: default_occupancy_scale(),
            trace_samples: default_trace_samples(),
            trigger_index: default_trigger_index(),
            pulse_time_ns: default_pulse_time_ns(),
            pulse_sigma_ns: default_pulse_sigma_ns(),
            noise_mv: default_noise_mv(),
            command_latency_ms: default_command_latency_ms(),
            dark_pulses_per_window: default_dark_pulses_per_window(),
            seed: default_seed(),
        }
    }
}

/// Mutable bench state shared by all instrument handles.
#[derive(Debug)]
struct BenchState {
    intensity_tune: f64,
    hv_v: f64,
    emission_on: bool,
    supply_on: bool,
    homed: bool,
    position: (f64, f64),
    rng: StdRng,
}

/// The simulated bench. Hand out instrument handles with the accessor
/// methods; all handles share this bench's state.
#[derive(Debug, Clone)]
pub struct MockBench {
    state: Arc<RwLock<BenchState>>,
    config: Arc<MockBenchConfig>,
}

impl MockBench {
    pub fn new(config: MockBenchConfig) -> Self {
        let state = BenchState {
            intensity_tune: 0.0,
            hv_v: 0.0,
            emission_on: false,
            supply_on: false,
            homed: false,
            position: (0.0, 0.0),
            rng: StdRng::seed_from_u64(config.seed),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            config: Arc::new(config),
        }
    }

    pub fn light_source(&self) -> MockLightSource {
        MockLightSource(self.clone())
    }

    pub fn bias_supply(&self) -> MockBiasSupply {
        MockBiasSupply(self.clone())
    }

    pub fn rotation_stage(&self) -> MockRotationStage {
        MockRotationStage(self.clone())
    }

    pub fn digitizer(&self) -> MockDigitizer {
        MockDigitizer(self.clone())
    }

    async fn latency(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.command_latency_ms)).await;
    }

    fn occupancy_for(&self, tune: f64, emission_on: bool) -> f64 {
        if !emission_on {
            return 0.0;
        }
        1.0 - (-tune.max(0.0) / self.config.occupancy_scale).exp()
    }

    fn gain_for(&self, hv_v: f64) -> f64 {
        if hv_v <= 0.0 {
            return 0.0;
        }
        self.config.gain_at_nominal * (hv_v / self.config.nominal_hv_v).powf(self.config.gain_exponent)
    }

    /// Amplitude that makes the integrated gaussian pulse carry `gain`
    /// photoelectrons of charge through the termination resistance.
    fn amplitude_mv_for(&self, gain: f64) -> f64 {
        let area_vs = gain * ELEMENTARY_CHARGE * TERMINATION_OHMS;
        let amp_v = area_vs
            / ((2.0 * std::f64::consts::PI).sqrt() * self.config.pulse_sigma_ns * 1e-9);
        amp_v * 1e3
    }

    #[allow(clippy::unwrap_used)]
    fn trace(&self, state: &mut BenchState, with_pulse: bool, amplitude_mv: f64) -> Waveform {
        let cfg = &self.config;
        let n = cfg.trace_samples;
        let time: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let trigger: Vec<f64> = (0..n)
            .map(|i| if i >= cfg.trigger_index { 3000.0 } else { 0.0 })
            .collect();
        let signal: Vec<f64> = time
            .iter()
            .map(|&t| {
                let noise = state.rng.gen_range(-cfg.noise_mv..=cfg.noise_mv);
                if with_pulse {
                    let z = (t - cfg.pulse_time_ns) / cfg.pulse_sigma_ns;
                    noise - amplitude_mv * (-0.5 * z * z).exp()
                } else {
                    noise
                }
            })
            .collect();
        // The arrays are nonempty and equal length by construction.
        Waveform::new(time, signal, trigger).unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct MockLightSource(MockBench);

#[async_trait]
impl PulsedLightSource for MockLightSource {
    async fn emission_on(&self) -> anyhow::Result<bool> {
        Ok(self.0.state.read().await.emission_on)
    }

    async fn turn_on_pulsed(&self) -> anyhow::Result<()> {
        self.0.latency().await;
        self.0.state.write().await.emission_on = true;
        debug!("mock light source emitting");
        Ok(())
    }

    async fn set_intensity_tune(&self, tune: f64) -> anyhow::Result<()> {
        self.0.latency().await;
        self.0.state.write().await.intensity_tune = tune;
        Ok(())
    }

    async fn intensity_tune(&self) -> anyhow::Result<f64> {
        Ok(self.0.state.read().await.intensity_tune)
    }
}

#[derive(Debug, Clone)]
pub struct MockBiasSupply(MockBench);

#[async_trait]
impl BiasSupply for MockBiasSupply {
    async fn is_on(&self) -> anyhow::Result<bool> {
        Ok(self.0.state.read().await.supply_on)
    }

    async fn turn_on(&self) -> anyhow::Result<()> {
        self.0.latency().await;
        self.0.state.write().await.supply_on = true;
        debug!("mock bias supply on");
        Ok(())
    }

    async fn set_voltage(
        &self,
        target_v: f64,
        tolerance_v: f64,
        max_iter: usize,
        wait: Duration,
    ) -> anyhow::Result<f64> {
        // First-order ramp towards the target, polled like real hardware.
        for _ in 0..max_iter {
            {
                let mut state = self.0.state.write().await;
                state.hv_v += 0.8 * (target_v - state.hv_v);
                if (target_v - state.hv_v).abs() <= tolerance_v {
                    return Ok(state.hv_v);
                }
            }
            tokio::time::sleep(wait).await;
        }
        Ok(self.0.state.read().await.hv_v)
    }

    async fn voltage(&self) -> anyhow::Result<f64> {
        Ok(self.0.state.read().await.hv_v)
    }
}

#[derive(Debug, Clone)]
pub struct MockRotationStage(MockBench);

#[async_trait]
impl RotationStage for MockRotationStage {
    async fn go_home(&self) -> anyhow::Result<()> {
        self.0.latency().await;
        let mut state = self.0.state.write().await;
        state.position = (0.0, 0.0);
        state.homed = true;
        debug!("mock rotation stage homed");
        Ok(())
    }

    async fn position(&self) -> anyhow::Result<(f64, f64)> {
        Ok(self.0.state.read().await.position)
    }

    async fn is_homed(&self) -> anyhow::Result<bool> {
        Ok(self.0.state.read().await.homed)
    }
}

#[derive(Debug, Clone)]
pub struct MockDigitizer(MockBench);

#[async_trait]
impl WaveformSource for MockDigitizer {
    async fn block_measurement(&self, count: usize) -> anyhow::Result<Measurement> {
        self.0.latency().await;
        let mut state = self.0.state.write().await;

        let occupancy = self.0.occupancy_for(state.intensity_tune, state.emission_on);
        let gain = self.0.gain_for(state.hv_v);
        let amplitude_mv = self.0.amplitude_mv_for(gain);
        // Deterministic hit count so occupancy measurements are exact.
        let n_signal = (occupancy * count as f64).round() as usize;

        let mut waveforms = Vec::with_capacity(count);
        for i in 0..count {
            let with_pulse = i < n_signal;
            waveforms.push(self.0.trace(&mut state, with_pulse, amplitude_mv));
        }

        let mut batch = Measurement::new(waveforms);
        batch.metadata.laser_tune = state.intensity_tune;
        batch.metadata.dy10_v = state.hv_v;
        batch.metadata.theta = state.position.0;
        batch.metadata.phi = state.position.1;
        Ok(batch)
    }

    async fn dcs_measurement(
        &self,
        windows: usize,
        samples: usize,
    ) -> anyhow::Result<DcsMeasurement> {
        self.0.latency().await;
        let cfg = &self.0.config;
        let mut state = self.0.state.write().await;

        let mut all_samples = Vec::with_capacity(windows);
        let mut all_times = Vec::with_capacity(windows);
        for _ in 0..windows {
            let time: Vec<f64> = (0..samples).map(|i| i as f64).collect();
            let mut window: Vec<f64> = (0..samples)
                .map(|_| state.rng.gen_range(-cfg.noise_mv..=cfg.noise_mv))
                .collect();
            // Spread the injected dark pulses evenly through the window.
            if cfg.dark_pulses_per_window > 0 && samples > 10 {
                let spacing = samples / cfg.dark_pulses_per_window;
                for p in 0..cfg.dark_pulses_per_window {
                    let at = p * spacing + spacing / 2;
                    for s in window.iter_mut().skip(at).take(5) {
                        *s = -10.0;
                    }
                }
            }
            all_samples.push(window);
            all_times.push(time);
        }

        Ok(DcsMeasurement::new(all_samples, all_times))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_follows_power_law() {
        let bench = MockBench::new(MockBenchConfig::default());
        let nominal = bench.gain_for(1000.0);
        assert!((nominal - 1.0e7).abs() / nominal < 1e-12);
        // 2^7 = 128x at double the bias.
        assert!((bench.gain_for(2000.0) / nominal - 128.0).abs() < 1e-9);
        assert_eq!(bench.gain_for(0.0), 0.0);
    }

    #[test]
    fn occupancy_saturates_with_tune() {
        let bench = MockBench::new(MockBenchConfig::default());
        assert_eq!(bench.occupancy_for(5.0, false), 0.0);
        let low = bench.occupancy_for(1.0, true);
        let high = bench.occupancy_for(30.0, true);
        assert!(low > 0.0 && low < high && high < 1.0);
        assert!(high > 0.9);
    }

    #[tokio::test]
    async fn digitizer_occupancy_matches_the_model() {
        let bench = MockBench::new(MockBenchConfig::default());
        bench.light_source().turn_on_pulsed().await.unwrap();
        bench.light_source().set_intensity_tune(2.0).await.unwrap();
        bench
            .bias_supply()
            .set_voltage(1000.0, 0.5, 50, Duration::from_millis(0))
            .await
            .unwrap();

        let batch = bench.digitizer().block_measurement(200).await.unwrap();
        let expected = 1.0 - (-2.0f64 / 10.0).exp();
        let measured = batch.occupancy(-4.0);
        assert!(
            (measured - expected).abs() < 0.01,
            "occupancy {measured} vs {expected}"
        );
        assert_eq!(batch.metadata.laser_tune, 2.0);
    }

    #[tokio::test]
    async fn digitizer_gain_matches_the_model() {
        let bench = MockBench::new(MockBenchConfig::default());
        bench.light_source().turn_on_pulsed().await.unwrap();
        bench.light_source().set_intensity_tune(3.0).await.unwrap();
        bench
            .bias_supply()
            .set_voltage(1000.0, 0.1, 50, Duration::from_millis(0))
            .await
            .unwrap();

        let batch = bench.digitizer().block_measurement(100).await.unwrap();
        let gains: Vec<f64> = batch
            .waveforms()
            .iter()
            .filter(|w| w.has_signal())
            .map(|w| w.gain())
            .collect();
        assert!(!gains.is_empty());
        let mean = gains.iter().sum::<f64>() / gains.len() as f64;
        assert!(
            (mean - 1.0e7).abs() / 1.0e7 < 0.1,
            "mean gain {mean:.3e} vs 1e7"
        );
    }

    #[tokio::test]
    async fn supply_settles_within_tolerance() {
        let bench = MockBench::new(MockBenchConfig::default());
        let supply = bench.bias_supply();
        let v = supply
            .set_voltage(1500.0, 0.5, 50, Duration::from_millis(0))
            .await
            .unwrap();
        assert!((v - 1500.0).abs() <= 0.5);
        assert!((supply.voltage().await.unwrap() - v).abs() < 1e-12);
    }

    #[tokio::test]
    async fn handles_share_state() {
        let bench = MockBench::new(MockBenchConfig::default());
        let light_a = bench.light_source();
        let light_b = bench.light_source();
        light_a.set_intensity_tune(7.5).await.unwrap();
        assert_eq!(light_b.intensity_tune().await.unwrap(), 7.5);
    }

    #[tokio::test]
    async fn dark_windows_carry_injected_pulses() {
        let bench = MockBench::new(MockBenchConfig::default());
        let mut dcs = bench.digitizer().dcs_measurement(3, 1000).await.unwrap();
        let rate = dcs.compute_dark_rate(-4.0);
        assert_eq!(dcs.metadata.dark_count, 6.0);
        assert!(rate > 0.0);
    }
}
