//! Error types for all ULINK driver operations.

use thiserror::Error;

use crate::statemachine::TapState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no ULINK adapter found on the USB bus")]
    DeviceNotFound,

    #[error("USB transfer failed")]
    Transport(#[from] rusb::Error),

    #[error("short bulk write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("bulk read returned {read} bytes, expected {expected}")]
    ShortRead { read: usize, expected: usize },

    #[error("adapter is not responding; disconnect it from the USB port, re-connect and retry")]
    Unresponsive,

    #[error("duplicate {0} payload allocation for a queued command")]
    DuplicatePayload(&'static str),

    #[error("scan command carries {0} bits, more than one command can hold")]
    OversizedScan(usize),

    #[error("zero-length scan")]
    EmptyScan,

    #[error("TDI buffer holds {have} bytes, scan needs {need}")]
    ShortTdiBuffer { have: usize, need: usize },

    #[error("{0} is not a stable TAP state")]
    UnstableState(TapState),

    #[error("no TMS path from {0} to {1}")]
    NoTmsPath(TapState, TapState),

    #[error("TAP cannot step from {0} to {1}")]
    InvalidPath(TapState, TapState),

    #[error("RCLK is not supported")]
    RclkUnsupported,

    #[error("TCK frequency {0} kHz is above the adapter limit of 150 kHz")]
    UnsupportedTckRate(u16),

    #[error("unknown speed index {0}")]
    UnknownSpeedIndex(u8),

    #[error("could not read firmware image")]
    FirmwareRead(#[source] std::io::Error),

    #[error("could not parse firmware image: {0}")]
    FirmwareParse(String),

    #[error("firmware download failed: {0}")]
    FirmwareDownload(&'static str),
}
