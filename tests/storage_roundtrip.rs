//! HDF5 round trips, exercised only with `--features storage_hdf5`.
#![cfg(feature = "storage_hdf5")]

use pmt_daq::hardware::mock::{MockBench, MockBenchConfig};
use pmt_daq::storage::{
    configuration_key, read_dcs, read_measurement, write_dcs, write_measurement,
};

async fn prepared_bench() -> MockBench {
    let bench = MockBench::new(MockBenchConfig::default());
    bench.light_source().turn_on_pulsed().await.unwrap();
    bench.light_source().set_intensity_tune(2.0).await.unwrap();
    bench
        .bias_supply()
        .set_voltage(1000.0, 0.5, 50, std::time::Duration::from_millis(0))
        .await
        .unwrap();
    bench
}

#[tokio::test]
async fn measurement_round_trips_through_a_file() {
    let bench = prepared_bench().await;
    let mut batch = bench.digitizer().block_measurement(50).await.unwrap();
    batch.metadata.theta = 45.0;
    batch.metadata.phi = 90.0;
    batch.compute_statistics(-4.0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        write_measurement(&file.group("/").unwrap(), &batch).unwrap();
    }

    let file = hdf5::File::open(&path).unwrap();
    let key = configuration_key(45.0, 90.0, batch.metadata.dy10_v);
    let restored = read_measurement(&file.group("/").unwrap(), &key).unwrap();

    assert_eq!(restored.len(), batch.len());
    assert_eq!(restored.metadata, batch.metadata);
    for (a, b) in restored.waveforms().iter().zip(batch.waveforms()) {
        assert_eq!(a.signal(), b.signal());
        assert_eq!(a.time(), b.time());
    }
    // Derived features survive the trip bit for bit.
    assert_eq!(
        restored.waveforms()[0].gain().to_bits(),
        batch.waveforms()[0].gain().to_bits()
    );
}

#[tokio::test]
async fn dark_counts_round_trip_at_reduced_precision() {
    let bench = prepared_bench().await;
    let mut dcs = bench.digitizer().dcs_measurement(4, 2000).await.unwrap();
    dcs.metadata.theta = 0.0;
    dcs.metadata.phi = 0.0;
    let rate = dcs.compute_dark_rate(-4.0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dark.h5");
    {
        let file = hdf5::File::create(&path).unwrap();
        write_dcs(&file.group("/").unwrap(), &dcs).unwrap();
    }

    let file = hdf5::File::open(&path).unwrap();
    let key = format!("dcs_{}", configuration_key(0.0, 0.0, dcs.metadata.dy10_v));
    let mut restored = read_dcs(&file.group("/").unwrap(), &key).unwrap();

    assert_eq!(restored.samples.len(), 4);
    assert_eq!(restored.metadata.dark_rate_hz, rate);
    // Samples went through f32, but pulse counting is threshold-based and
    // must see the same pulses.
    assert_eq!(restored.compute_dark_rate(-4.0), rate);
    for (a, b) in restored.samples[0].iter().zip(&dcs.samples[0]) {
        assert!((a - b).abs() < 1e-3);
    }
}
