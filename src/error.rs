//! Error types for SH power computation
//!
//! Only fatal preconditions surface as errors. Per-voxel anomalies are
//! counted in [`crate::driver::RunReport`] instead.

use thiserror::Error;

/// Errors returned by shpower-core operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// NIfTI decode failure or malformed image bytes
    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// b-value / b-vector tables that cannot describe the acquisition
    #[error("invalid acquisition: {0}")]
    InvalidAcquisition(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("linear algebra error: {0}")]
    LinearAlgebra(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidAcquisition("3 bvals but 4 bvecs".to_string());
        assert_eq!(err.to_string(), "invalid acquisition: 3 bvals but 4 bvecs");
    }

    #[test]
    fn test_io_error_conversion() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/nonexistent/shpower/file")?)
        }
        match open_missing() {
            Err(Error::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other.map(|_| ())),
        }
    }
}
