//! MIDI clock generation for one output bus.
//!
//! A bus in `Pos` or `Mod` mode receives Start/Stop/Continue, Song Position
//! Pointer and one 0xF8 per 24th of a quarter note. `Mod` buses hold their
//! clock until the next multiple of `clock_mod` sixteenth notes.

use seqbus_midi::{status, Pulse};
use smallvec::SmallVec;

use crate::port::ClockMode;
use crate::tempo::{ticks_per_midi_clock, ticks_per_sixteenth};

/// A realtime or system-common message produced by the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockMessage {
    pub tick: Pulse,
    bytes: [u8; 3],
    len: u8,
}

impl ClockMessage {
    fn realtime(tick: Pulse, status: u8) -> Self {
        Self {
            tick,
            bytes: [status, 0, 0],
            len: 1,
        }
    }

    fn song_position(tick: Pulse, sixteenths: Pulse) -> Self {
        let beats = sixteenths.clamp(0, 0x3FFF) as u16;
        Self {
            tick,
            bytes: [
                status::SONG_POSITION,
                (beats & 0x7F) as u8,
                ((beats >> 7) & 0x7F) as u8,
            ],
            len: 3,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

pub type ClockBurst = SmallVec<[ClockMessage; 4]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockState {
    mode: ClockMode,
    /// Last tick for which clock output was considered.
    last_tick: Pulse,
}

impl Default for ClockState {
    fn default() -> Self {
        Self::new(ClockMode::Off)
    }
}

impl ClockState {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            last_tick: -1,
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ClockMode) {
        self.mode = mode;
    }

    pub fn start(&mut self) -> ClockBurst {
        let mut out = ClockBurst::new();
        self.last_tick = -1;
        if self.mode.is_on() {
            out.push(ClockMessage::realtime(0, status::START));
        }
        out
    }

    pub fn stop(&mut self, tick: Pulse) -> ClockBurst {
        let mut out = ClockBurst::new();
        if self.mode.is_on() {
            out.push(ClockMessage::realtime(tick, status::STOP));
        }
        out
    }

    /// Song Position Pointer then Continue; clocking resumes on the next
    /// sixteenth-note boundary.
    pub fn continue_from(&mut self, tick: Pulse, ppqn: u32) -> ClockBurst {
        let mut out = ClockBurst::new();
        let pp16th = ticks_per_sixteenth(ppqn);
        self.last_tick = round_up(tick, pp16th) - 1;
        if self.mode.is_on() {
            out.push(ClockMessage::song_position(tick, tick / pp16th));
            out.push(ClockMessage::realtime(tick, status::CONTINUE));
        }
        out
    }

    /// Prepares clock output for playback starting at `tick`.
    pub fn init(&mut self, tick: Pulse, ppqn: u32, clock_mod: u32) -> ClockBurst {
        match self.mode {
            ClockMode::Off => ClockBurst::new(),
            ClockMode::Pos if tick != 0 => self.continue_from(tick, ppqn),
            _ => {
                let out = self.start();
                if self.mode == ClockMode::Mod {
                    let span = ticks_per_sixteenth(ppqn) * clock_mod.max(1) as Pulse;
                    self.last_tick = round_up(tick, span) - 1;
                } else {
                    self.last_tick = tick - 1;
                }
                out
            }
        }
    }

    /// One 0xF8 per MIDI clock boundary in `(last_tick, tick]`.
    pub fn clock(&mut self, tick: Pulse, ppqn: u32) -> ClockBurst {
        let mut out = ClockBurst::new();
        if !self.mode.is_on() || self.last_tick >= tick {
            return out;
        }
        let step = ticks_per_midi_clock(ppqn);
        let mut t = round_up(self.last_tick + 1, step);
        while t <= tick {
            out.push(ClockMessage::realtime(t, status::CLOCK));
            t += step;
        }
        self.last_tick = tick;
        out
    }
}

/// Smallest multiple of `step` that is `>= tick`.
fn round_up(tick: Pulse, step: Pulse) -> Pulse {
    let rem = tick.rem_euclid(step);
    if rem == 0 {
        tick
    } else {
        tick - rem + step
    }
}
