//! Tempo and tick/frame conversion.

use seqbus_midi::Pulse;

pub const DEFAULT_PPQN: u32 = 192;
pub const DEFAULT_BPM: f64 = 120.0;

/// Largest tempo a MIDI Set Tempo message can carry (24 bits).
pub const MAX_TEMPO_US: u32 = 0x00FF_FFFF;
pub const MIN_TEMPO_US: u32 = 1;

/// MIDI clock ticks per quarter note.
pub const MIDI_CLOCKS_PER_QUARTER: u32 = 24;

/// Microseconds per quarter note for `bpm`, rounded and clamped to the
/// MIDI tempo range.
pub fn tempo_us_from_bpm(bpm: f64) -> u32 {
    let us = (60_000_000.0 / bpm).round();
    if us.is_nan() || us < MIN_TEMPO_US as f64 {
        MIN_TEMPO_US
    } else if us > MAX_TEMPO_US as f64 {
        MAX_TEMPO_US
    } else {
        us as u32
    }
}

pub fn bpm_from_tempo_us(tempo_us: u32) -> f64 {
    60_000_000.0 / tempo_us.max(MIN_TEMPO_US) as f64
}

/// Audio frames spanned by `ticks` at the given tempo.
#[inline]
pub fn ticks_to_frames(ticks: Pulse, tempo_us: u32, ppqn: u32, sample_rate: u32) -> i64 {
    let num = ticks as i128 * tempo_us as i128 * sample_rate as i128;
    let den = ppqn.max(1) as i128 * 1_000_000;
    (num / den) as i64
}

/// Inverse of [`ticks_to_frames`].
#[inline]
pub fn frames_to_ticks(frames: i64, tempo_us: u32, ppqn: u32, sample_rate: u32) -> Pulse {
    let num = frames as i128 * ppqn as i128 * 1_000_000;
    let den = tempo_us.max(MIN_TEMPO_US) as i128 * sample_rate.max(1) as i128;
    (num / den) as Pulse
}

/// Pulses between two MIDI clock messages.
#[inline]
pub fn ticks_per_midi_clock(ppqn: u32) -> Pulse {
    (ppqn / MIDI_CLOCKS_PER_QUARTER).max(1) as Pulse
}

/// Pulses per sixteenth note, the unit of Song Position Pointer.
#[inline]
pub fn ticks_per_sixteenth(ppqn: u32) -> Pulse {
    (ppqn / 4).max(1) as Pulse
}
