//! Master MIDI bus for the seqbus pattern sequencer.
//!
//! Owns the process's MIDI ports, drives the transport's tempo queue,
//! decodes incoming MIDI into [`Event`]s and follows device hot-plug.
//!
//! Feature gates: `alsa` (ALSA sequencer back-end), `jack` (JACK MIDI
//! back-end). The in-process memory back-end is always built.
//!
//! # Example
//!
//! ```ignore
//! use seqbus_io::{BackendKind, MasterBus, InputThread};
//! use std::sync::Arc;
//!
//! let bus = Arc::new(
//!     MasterBus::builder()
//!         .backend(BackendKind::Alsa)
//!         .input(0, true)
//!         .build_and_init()?,
//! );
//! let (_input, events) = InputThread::spawn(bus.clone(), 1024)?;
//!
//! bus.start()?;
//! bus.play(0, &Event::note_on(0, 0, 60, 100), 0);
//! bus.flush();
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{BackendKind, BusConfig};

pub mod backend;
pub use backend::memory::{MemoryBackend, MemoryHandle, SentMessage};
pub use backend::{BackendDriver, InputWaiter, Packet, PortHandle, QueueTempo};

#[cfg(feature = "alsa")]
pub use backend::alsa_seq::AlsaDriver;
#[cfg(feature = "jack")]
pub use backend::jack_midi::JackDriver;

pub mod port;
pub use port::{BusArray, ClockMode, Direction, PortAddr, PortCaps, PortEndpoint, PortState, RemotePort};

pub mod clock;
pub mod decode;
pub mod tempo;

mod master;
pub use master::{
    MasterBus, MasterBusBuilder, MANUAL_INPUT_BUSES, MANUAL_OUTPUT_BUSES, SYSEX_CONTINUATION_WAIT,
};

mod input;
pub use input::{InputThread, DEFAULT_INPUT_CAPACITY};

pub use seqbus_midi::{ByteContainer, Event, Pulse};
