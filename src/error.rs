//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failures the acquisition core has to
//! distinguish:
//!
//! - **`Configuration`**: semantic errors in a device property batch, such as
//!   an unsupported binning factor or a property the camera rejects. These are
//!   recovered locally: the controller records them and stays unconfigured.
//! - **`Device`**: driver-level failures from a camera, QPD or stage
//!   capability. Poll-time occurrences are transient; start/stop-time
//!   occurrences abort the transition and are surfaced to the caller.
//! - **`Io`**: wraps `std::io::Error` from film persisters.
//! - **`Protocol`**: an operation issued in a state where it is not legal,
//!   e.g. `start` without a prior successful `configure`. Reported, never a
//!   crash.
//! - **`StopTimeout`**: a stop request that the acquisition loop failed to
//!   acknowledge within the configured bound.
//! - **`ConfigFile`**: wraps errors from the figment settings layer.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error taxonomy.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Semantic error in a device property batch (bad name, bad value,
    /// unsupported or mismatched binning, reserved-key collision).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Driver-level failure reported by a device capability.
    #[error("Device error: {0}")]
    Device(String),

    /// I/O failure from a film persister.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation issued in a state where it is not legal.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The acquisition loop did not acknowledge a stop request in time.
    #[error("Stop request did not converge within the configured timeout")]
    StopTimeout,

    /// The control loop task terminated abnormally during shutdown.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Settings file or environment parsing error.
    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] figment::Error),
}
