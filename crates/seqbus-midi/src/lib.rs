//! MIDI data types for the seqbus master MIDI bus.
//!
//! - [`Event`]: a MIDI message stamped with a sequencer tick
//! - [`ByteContainer`]: append-only byte buffer used to serialize outbound messages
//! - [`status`]: status byte constants and classification helpers

pub mod container;
pub mod event;
pub mod status;

pub use container::ByteContainer;
pub use event::Event;

/// Sequencer time in pulses (ticks).
pub type Pulse = i64;
