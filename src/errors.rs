//! # Error Type
//!
//! One wrapping error type for the crate. Sub-modules return the specific
//! variant that applies; `main` only cares about the `ConfigInvalid` case,
//! which maps to a distinct process exit code.

use thiserror::Error;

/// The main error type used throughout this crate.
#[derive(Debug, Error)]
pub enum FailoverError {
    /// Configuration file missing, unreadable, or failing validation.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// A NetworkManager or ModemManager D-Bus call failed.
    #[error("D-Bus transport error: {0}")]
    Transport(String),

    /// An activation/deactivation/SIM-switch wait exceeded its budget.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The connectivity prober did not see the expected payload.
    #[error("probe failed for {0}")]
    ProbeFailure(String),

    /// A profile or its device could not be found.
    #[error("{0} not found")]
    Missing(String),
}

impl From<dbus::Error> for FailoverError {
    fn from(error: dbus::Error) -> Self {
        FailoverError::Transport(format!(
            "{}: {}",
            error.name().unwrap_or("unknown"),
            error.message().unwrap_or("")
        ))
    }
}

impl From<std::io::Error> for FailoverError {
    fn from(error: std::io::Error) -> Self {
        FailoverError::Transport(error.to_string())
    }
}
