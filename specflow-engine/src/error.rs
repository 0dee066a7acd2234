//! Engine error types.

use thiserror::Error;

/// A rejected property value; the previous settings stay in force.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fft size must be a positive number of samples")]
    ZeroFftSize,
    #[error("overlap ({overlap}) must be less than fft size ({fft_size})")]
    OverlapTooLarge { overlap: usize, fft_size: usize },
    #[error("averaging count must be at least 1")]
    ZeroNumAvg,
}

/// A worker thread refused to join within the stop timeout.
#[derive(Error, Debug)]
#[error("worker thread for stream `{stream_id}` did not die")]
pub struct StopError {
    pub stream_id: String,
}
