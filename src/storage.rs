//! HDF5 persistence for measurements.
//!
//! Enabled by the `storage_hdf5` feature. Each bench configuration maps to
//! one group named by its angles and bias; a triggered batch is stored as a
//! single 3-D dataset `waveforms` of shape `[n, samples, 3]` holding time,
//! signal, and trigger planes, with the metadata record attached as scalar
//! `f64` attributes. Dark-count acquisitions store their samples as `f32`
//! (noise-dominated, half the disk) and their time axes as `f64`.

use hdf5::Group;
use ndarray::{Array2, Array3};

use crate::error::{AppResult, BenchError};
use crate::measurement::dcs::DcsMeasurement;
use crate::measurement::{Measurement, MeasurementMetadata};
use crate::waveform::Waveform;

fn storage_err(err: hdf5::Error) -> BenchError {
    BenchError::Storage(err.to_string())
}

/// Group name for a bench configuration, one decimal per axis.
pub fn configuration_key(theta: f64, phi: f64, dy10_v: f64) -> String {
    format!("theta{theta:.1}_phi{phi:.1}_dy10{dy10_v:.1}")
}

macro_rules! metadata_fields {
    ($macro_cb:ident) => {
        $macro_cb!(
            theta,
            phi,
            dy10_v,
            psu_v,
            psu_i,
            laser_tune,
            laser_freq_hz,
            signal_threshold_mv,
            temperature_c,
            n_waveforms,
            occupancy,
            gain_mean,
            gain_fwhm,
            charge_mean_pc,
            charge_fwhm_pc,
            amplitude_mean_mv,
            amplitude_fwhm_mv,
            baseline_mean_mv,
            baseline_sigma_mv,
            peak_to_valley,
            rise_time_mean_ns,
            rise_time_fwhm_ns,
            transit_time_mean_ns,
            transit_time_fwhm_ns,
            dark_duration_s,
            dark_count,
            dark_rate_hz
        )
    };
}

fn write_metadata(group: &Group, metadata: &MeasurementMetadata) -> AppResult<()> {
    macro_rules! write_attrs {
        ($($field:ident),+) => {
            $(
                group
                    .new_attr::<f64>()
                    .create(stringify!($field))
                    .map_err(storage_err)?
                    .write_scalar(&metadata.$field)
                    .map_err(storage_err)?;
            )+
        };
    }
    metadata_fields!(write_attrs);
    Ok(())
}

fn read_metadata(group: &Group) -> AppResult<MeasurementMetadata> {
    let mut metadata = MeasurementMetadata::default();
    macro_rules! read_attrs {
        ($($field:ident),+) => {
            $(
                metadata.$field = group
                    .attr(stringify!($field))
                    .map_err(storage_err)?
                    .read_scalar::<f64>()
                    .map_err(storage_err)?;
            )+
        };
    }
    metadata_fields!(read_attrs);
    Ok(metadata)
}

/// Write one triggered batch under `parent`, in a subgroup named by the
/// metadata's configuration key.
///
/// Fails on heterogeneous waveform lengths, since the traces must pack
/// into one rectangular dataset.
pub fn write_measurement(parent: &Group, measurement: &Measurement) -> AppResult<()> {
    let md = &measurement.metadata;
    let key = configuration_key(md.theta, md.phi, md.dy10_v);
    let group = parent.create_group(&key).map_err(storage_err)?;
    write_metadata(&group, md)?;

    let waveforms = measurement.waveforms();
    let samples = waveforms.first().map_or(0, Waveform::len);
    if waveforms.iter().any(|w| w.len() != samples) {
        return Err(BenchError::Storage(format!(
            "cannot pack unequal-length waveforms into group {key}"
        )));
    }

    let mut packed = Array3::<f64>::zeros((waveforms.len(), samples, 3));
    for (i, w) in waveforms.iter().enumerate() {
        for s in 0..samples {
            packed[[i, s, 0]] = w.time()[s];
            packed[[i, s, 1]] = w.signal()[s];
            packed[[i, s, 2]] = w.trigger()[s];
        }
    }
    group
        .new_dataset::<f64>()
        .shape((waveforms.len(), samples, 3))
        .create("waveforms")
        .map_err(storage_err)?
        .write(&packed)
        .map_err(storage_err)?;
    Ok(())
}

/// Read one triggered batch back from a configuration subgroup of `parent`.
pub fn read_measurement(parent: &Group, key: &str) -> AppResult<Measurement> {
    let group = parent.group(key).map_err(storage_err)?;
    let metadata = read_metadata(&group)?;

    let ds = group.dataset("waveforms").map_err(storage_err)?;
    let shape = ds.shape();
    if shape.len() != 3 || shape[2] != 3 {
        return Err(BenchError::Storage(format!(
            "dataset {key}/waveforms has unexpected shape {shape:?}"
        )));
    }
    let raw = ds.read_raw::<f64>().map_err(storage_err)?;
    let (count, samples) = (shape[0], shape[1]);

    let mut measurement = Measurement::new(Vec::new());
    for i in 0..count {
        let mut time = Vec::with_capacity(samples);
        let mut signal = Vec::with_capacity(samples);
        let mut trigger = Vec::with_capacity(samples);
        for s in 0..samples {
            let base = (i * samples + s) * 3;
            time.push(raw[base]);
            signal.push(raw[base + 1]);
            trigger.push(raw[base + 2]);
        }
        measurement.push(Waveform::with_threshold(
            time,
            signal,
            trigger,
            Some(metadata.signal_threshold_mv),
        )?);
    }
    measurement.metadata = metadata;
    Ok(measurement)
}

/// Write a dark-count acquisition under `parent` as `dcs_<key>`.
pub fn write_dcs(parent: &Group, dcs: &DcsMeasurement) -> AppResult<()> {
    let md = &dcs.metadata;
    let key = format!("dcs_{}", configuration_key(md.theta, md.phi, md.dy10_v));
    let group = parent.create_group(&key).map_err(storage_err)?;
    write_metadata(&group, md)?;

    let windows = dcs.samples.len();
    let samples = dcs.samples.first().map_or(0, Vec::len);
    if dcs.samples.iter().any(|w| w.len() != samples)
        || dcs.times.iter().any(|t| t.len() != samples)
    {
        return Err(BenchError::Storage(format!(
            "cannot pack unequal-length dark windows into group {key}"
        )));
    }

    let mut sample_arr = Array2::<f32>::zeros((windows, samples));
    let mut time_arr = Array2::<f64>::zeros((windows, samples));
    for (i, (w, t)) in dcs.samples.iter().zip(&dcs.times).enumerate() {
        for s in 0..samples {
            sample_arr[[i, s]] = w[s] as f32;
            time_arr[[i, s]] = t[s];
        }
    }
    group
        .new_dataset::<f32>()
        .shape((windows, samples))
        .create("samples")
        .map_err(storage_err)?
        .write(&sample_arr)
        .map_err(storage_err)?;
    group
        .new_dataset::<f64>()
        .shape((windows, samples))
        .create("times")
        .map_err(storage_err)?
        .write(&time_arr)
        .map_err(storage_err)?;
    Ok(())
}

/// Read a dark-count acquisition from a `dcs_*` subgroup of `parent`.
pub fn read_dcs(parent: &Group, key: &str) -> AppResult<DcsMeasurement> {
    let group = parent.group(key).map_err(storage_err)?;
    let metadata = read_metadata(&group)?;

    let sample_ds = group.dataset("samples").map_err(storage_err)?;
    let time_ds = group.dataset("times").map_err(storage_err)?;
    let shape = sample_ds.shape();
    if shape.len() != 2 || time_ds.shape() != shape {
        return Err(BenchError::Storage(format!(
            "dark-count datasets in {key} have mismatched shapes"
        )));
    }
    let raw_samples = sample_ds.read_raw::<f32>().map_err(storage_err)?;
    let raw_times = time_ds.read_raw::<f64>().map_err(storage_err)?;
    let (windows, samples) = (shape[0], shape[1]);

    let sample_rows = (0..windows)
        .map(|i| {
            raw_samples[i * samples..(i + 1) * samples]
                .iter()
                .map(|&v| f64::from(v))
                .collect()
        })
        .collect();
    let time_rows = (0..windows)
        .map(|i| raw_times[i * samples..(i + 1) * samples].to_vec())
        .collect();

    let mut dcs = DcsMeasurement::new(sample_rows, time_rows);
    dcs.metadata = metadata;
    Ok(dcs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_key_formats_one_decimal() {
        assert_eq!(
            configuration_key(45.0, 90.25, 1012.34),
            "theta45.0_phi90.2_dy101012.3"
        );
    }
}
