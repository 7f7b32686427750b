//! Daemon errors.

use std::io;

use thiserror::Error;

use saa716x::error::{ConfigError, DemuxError, DeviceError};

#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Board(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error("Invalid PID: {0}")]
    InvalidPid(String),
}
