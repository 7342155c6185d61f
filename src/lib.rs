//! # seqbus - Master MIDI bus
//!
//! MIDI I/O core of a live pattern sequencer: owns the process's MIDI
//! ports, drives the transport's tempo queue, decodes incoming MIDI and
//! follows device hot-plug.
//!
//! ## Architecture
//!
//! - **seqbus-midi** - `Event`, `ByteContainer`, MIDI status constants
//! - **seqbus-io** - `MasterBus`, bus arrays, back-end drivers (ALSA, JACK,
//!   memory), tempo queue, clock, input thread
//!
//! ## Quick Start
//!
//! ```ignore
//! use seqbus::prelude::*;
//!
//! let bus = seqbus::open("seqbus.toml")?;
//! bus.set_beats_per_minute(128.0)?;
//! bus.start()?;
//! bus.play(0, &Event::note_on(0, 0, 60, 100), 0);
//! bus.flush();
//! ```
//!
//! ## Feature Flags
//!
//! - `alsa` - ALSA sequencer back-end
//! - `jack` - JACK MIDI back-end

use std::path::Path;

pub mod error;
pub use error::{Error, Result};

/// Re-export of seqbus-midi for direct access
pub use seqbus_midi as midi;

/// Re-export of seqbus-io for direct access
pub use seqbus_io as io;

pub use seqbus_io::{
    BackendKind, BusConfig, ClockMode, Direction, InputThread, MasterBus, MasterBusBuilder,
    PortAddr, PortState, QueueTempo,
};
pub use seqbus_midi::{Event, Pulse};

/// Loads a TOML bus configuration, then builds and initializes the bus.
pub fn open(path: impl AsRef<Path>) -> Result<MasterBus> {
    let config = BusConfig::load(path)?;
    Ok(MasterBus::builder().config(config).build_and_init()?)
}

pub mod prelude {
    pub use crate::{
        BackendKind, BusConfig, ClockMode, Event, InputThread, MasterBus, PortAddr, PortState,
        Pulse,
    };
}
