//! Error types for the timing core.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Tempo out of range: {0} BPM")]
    InvalidTempo(f64),
    #[error("Invalid resolution: {0} clocks per beat")]
    InvalidResolution(u32),
    #[error("Invalid meter: {0} beats per measure")]
    InvalidMeter(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
