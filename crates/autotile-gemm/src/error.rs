//! Error types for benchmark planning and execution.

use thiserror::Error;

/// Errors that can occur while planning or running a benchmark.
///
/// Every variant is fatal for the run that raised it: there is no retry,
/// no automatic tile shrinking and no fallback from one-shot to tiled.
#[derive(Debug, Error)]
pub enum BenchError {
    /// The precision label is not one of the recognised spellings.
    #[error("Unsupported precision: {0}")]
    UnsupportedPrecision(String),

    /// No compute device could be acquired.
    #[error("Compute device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device memory was exhausted while allocating a tile.
    #[error(
        "Allocation of {requested_bytes} bytes failed ({free_bytes} bytes free on device)"
    )]
    AllocationFailure {
        /// Size of the failed request.
        requested_bytes: u64,
        /// Free device memory at the time of the request.
        free_bytes: u64,
    },

    /// Operand shapes do not agree.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific failure (driver, BLAS, RNG).
    #[error("Device error: {0}")]
    Device(String),
}

impl BenchError {
    /// Whether the error is an out-of-memory condition.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, BenchError::AllocationFailure { .. })
    }
}

/// Result type for benchmark operations.
pub type Result<T> = std::result::Result<T, BenchError>;
