//! Error types for the master MIDI bus.

use thiserror::Error;

use crate::port::PortAddr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot open MIDI transport: {0}")]
    FatalInit(String),

    #[error("Cannot register port '{name}': {reason}")]
    PortRegistration { name: String, reason: String },

    #[error("Cannot subscribe {addr}: {reason}")]
    Subscription { addr: PortAddr, reason: String },

    #[error("SysEx message truncated after {0} bytes")]
    SysExTruncated(usize),

    #[error("Send failed on bus {bus}: {reason}")]
    SendFailure { bus: usize, reason: String },

    #[error("MIDI back-end error: {0}")]
    Backend(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Back-end '{0}' is not compiled into this build")]
    BackendUnavailable(&'static str),

    #[error("Master bus is not initialized")]
    NotInitialized,
}

#[cfg(feature = "alsa")]
impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

#[cfg(feature = "jack")]
impl From<jack::Error> for Error {
    fn from(e: jack::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
