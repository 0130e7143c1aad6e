//! Custom error types for the scanner core.
//!
//! This module defines the primary error type, `ScanError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration and I/O issues to
//! hardware call failures.
//!
//! ## Error Hierarchy
//!
//! `ScanError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically related to file parsing
//!   or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such as values
//!   that parse fine but are logically invalid (e.g., an input rate that is not an integer
//!   multiple of the output rate). These are caught during the validation step.
//! - **`Device`**: A failed call into the analog/digital I/O hardware. Carries the name of
//!   the call and the raw driver status code so faults can be traced back to the exact
//!   hardware operation.
//! - **`Io`**: Wraps standard `std::io::Error`, covering file I/O such as waveform dumps.
//! - **`Storage`**: Wraps errors from the image store collaborator.
//!
//! By using `#[from]`, `ScanError` can be seamlessly created from underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device call '{call}' failed with status {status}")]
    Device {
        /// Name of the hardware call that failed.
        call: &'static str,
        /// Raw status code reported by the driver.
        status: i32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image store error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Scanner control queue is full")]
    ControlQueueFull,

    #[error("Scanner acquisition thread is no longer running")]
    ControllerGone,

    #[error("Scanner has already been closed")]
    AlreadyClosed,

    #[error("Scanner acquisition thread panicked")]
    ThreadPanicked,
}
