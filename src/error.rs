//! Custom error types for the calibration bench.
//!
//! This module defines the primary error type, `BenchError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! instrument faults and statistical fit failures.
//!
//! ## Error taxonomy
//!
//! - **`Config` / `Configuration`**: file parsing errors from the `config`
//!   crate, and semantic errors (values that parse but are logically invalid,
//!   e.g. an inverted target band). Caught during the validation step.
//! - **`Io`**: wraps `std::io::Error` for file I/O.
//! - **`Instrument`**: errors originating from instrument drivers. Anything
//!   from a communication failure to an out-of-range setpoint.
//! - **`Precondition`**: an instrument could not be brought into the state a
//!   tuning loop requires before it starts. These are fatal; running the loop
//!   against misconfigured hardware would produce meaningless setpoints.
//! - **`Fit`**: a Gaussian fit did not converge. These are caught locally by
//!   batch aggregation (the affected feature stays at its sentinel) and only
//!   escape when a caller asks for the fit result directly.
//! - **`Degenerate`**: input data cannot support the requested computation
//!   (mismatched array lengths, empty batches where a shape is required).
//! - **`Storage`**: persistence-layer failures.
//! - **`FeatureNotEnabled`**: functionality compiled out via feature flags.
//!
//! Soft convergence failures of the tuning loops are deliberately NOT errors:
//! they are reported through `TuneOutcome::converged` plus a logged warning,
//! and the caller decides whether to proceed, retry, or abort.

use thiserror::Error;

use crate::measurement::stats::FitError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Gaussian fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("Degenerate data: {0}")]
    Degenerate(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl BenchError {
    /// Wrap a driver-level error (the capability traits speak `anyhow`).
    pub fn instrument(err: anyhow::Error) -> Self {
        BenchError::Instrument(err.to_string())
    }
}
