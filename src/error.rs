//! Centralized error type for the seqbus umbrella crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("MIDI bus: {0}")]
    Bus(#[from] seqbus_io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
