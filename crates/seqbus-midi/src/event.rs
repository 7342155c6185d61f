//! Sequencer MIDI event.

use serde::{Deserialize, Serialize};

use crate::container::ByteContainer;
use crate::status::{self, CHANNEL_MASK, KIND_MASK};
use crate::Pulse;

/// One MIDI message stamped with a sequencer tick.
///
/// The status byte keeps its channel nibble. SysEx bytes are only present
/// when the status is `0xF0`; they include the leading `F0` and, once the
/// message is complete, the trailing `F7`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    tick: Pulse,
    status: u8,
    data: [u8; 2],
    sysex: Vec<u8>,
    /// Tick of the paired Note-Off when this is a linked Note-On.
    linked: Option<Pulse>,
}

impl Event {
    #[inline]
    pub fn new(tick: Pulse, status: u8, data1: u8, data2: u8) -> Self {
        Self {
            tick,
            status,
            data: [data1 & 0x7F, data2 & 0x7F],
            sysex: Vec::new(),
            linked: None,
        }
    }

    #[inline]
    pub fn note_on(tick: Pulse, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(tick, status::NOTE_ON | channel.min(15), note, velocity)
    }

    #[inline]
    pub fn note_off(tick: Pulse, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(tick, status::NOTE_OFF | channel.min(15), note, velocity)
    }

    #[inline]
    pub fn control_change(tick: Pulse, channel: u8, control: u8, value: u8) -> Self {
        Self::new(tick, status::CONTROL_CHANGE | channel.min(15), control, value)
    }

    #[inline]
    pub fn program_change(tick: Pulse, channel: u8, program: u8) -> Self {
        Self::new(tick, status::PROGRAM_CHANGE | channel.min(15), program, 0)
    }

    /// `value`: signed 14-bit (-8192 to 8191).
    pub fn pitch_bend(tick: Pulse, channel: u8, value: i16) -> Self {
        let unsigned = (value as i32 + 8192).clamp(0, 16383) as u16;
        Self::new(
            tick,
            status::PITCH_WHEEL | channel.min(15),
            (unsigned & 0x7F) as u8,
            ((unsigned >> 7) & 0x7F) as u8,
        )
    }

    /// A SysEx event; `payload` is expected to be framed by `F0 ... F7`.
    pub fn sysex(tick: Pulse, payload: &[u8]) -> Self {
        Self {
            tick,
            status: status::SYSEX,
            data: [0, 0],
            sysex: payload.to_vec(),
            linked: None,
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Pulse {
        self.tick
    }

    #[inline]
    pub fn set_timestamp(&mut self, tick: Pulse) {
        self.tick = tick;
    }

    /// Full status byte, channel included.
    #[inline]
    pub fn status(&self) -> u8 {
        self.status
    }

    /// Stores `status` as-is, keeping the channel nibble. SysEx bytes are
    /// dropped when the new status is not SysEx.
    pub fn set_status_keep_channel(&mut self, status: u8) {
        self.status = status;
        if status != status::SYSEX {
            self.sysex.clear();
        }
    }

    /// Message kind: the high nibble for channel messages, the whole byte
    /// for system messages.
    #[inline]
    pub fn kind(&self) -> u8 {
        if status::is_channel_message(self.status) {
            self.status & KIND_MASK
        } else {
            self.status
        }
    }

    #[inline]
    pub fn channel(&self) -> Option<u8> {
        status::is_channel_message(self.status).then_some(self.status & CHANNEL_MASK)
    }

    #[inline]
    pub fn data(&self) -> (u8, u8) {
        (self.data[0], self.data[1])
    }

    pub fn set_data(&mut self, data1: u8, data2: u8) {
        self.data = [data1 & 0x7F, data2 & 0x7F];
    }

    pub fn is_channel_message(&self) -> bool {
        status::is_channel_message(self.status)
    }

    pub fn is_note_on(&self) -> bool {
        self.kind() == status::NOTE_ON
    }

    pub fn is_note_off(&self) -> bool {
        self.kind() == status::NOTE_OFF
    }

    /// A Note-On carrying velocity 0, which devices send in place of Note-Off.
    pub fn is_note_off_recorded(&self) -> bool {
        self.is_note_on() && self.data[1] == 0
    }

    /// Rewrites a velocity-0 Note-On as Note-Off on the same channel.
    /// Returns `true` when the event was rewritten.
    pub fn normalize_note_off(&mut self) -> bool {
        if self.is_note_off_recorded() {
            self.status = status::NOTE_OFF | (self.status & CHANNEL_MASK);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_sysex(&self) -> bool {
        self.status == status::SYSEX
    }

    pub fn sysex_bytes(&self) -> &[u8] {
        &self.sysex
    }

    /// Clears any collected SysEx bytes and marks the event as SysEx.
    pub fn restart_sysex(&mut self) {
        self.status = status::SYSEX;
        self.data = [0, 0];
        self.sysex.clear();
    }

    /// Appends one SysEx chunk. Bytes after the terminating `F7` are
    /// ignored. Returns `true` once the message is terminated.
    pub fn append_sysex(&mut self, chunk: &[u8]) -> bool {
        match chunk.iter().position(|&b| b == status::SYSEX_END) {
            Some(end) => {
                self.sysex.extend_from_slice(&chunk[..=end]);
                true
            }
            None => {
                self.sysex.extend_from_slice(chunk);
                false
            }
        }
    }

    pub fn linked(&self) -> Option<Pulse> {
        self.linked
    }

    pub fn is_linked(&self) -> bool {
        self.linked.is_some()
    }

    /// Pairs this Note-On with `note_off`.
    pub fn link(&mut self, note_off: &Event) {
        self.linked = Some(note_off.tick);
    }

    pub fn unlink(&mut self) {
        self.linked = None;
    }

    /// Number of bytes this event occupies on the wire.
    pub fn message_len(&self) -> usize {
        if self.is_sysex() {
            self.sysex.len()
        } else {
            1 + status::data_len(self.status).unwrap_or(0)
        }
    }

    /// Serializes the event, replacing the channel nibble of channel
    /// messages with `channel`.
    pub fn write_to(&self, out: &mut ByteContainer, channel: u8) {
        if self.is_sysex() {
            out.put_slice(&self.sysex);
            return;
        }
        let status = if self.is_channel_message() {
            (self.status & KIND_MASK) | (channel & CHANNEL_MASK)
        } else {
            self.status
        };
        out.put(status);
        let count = status::data_len(status).unwrap_or(0);
        for &byte in self.data.iter().take(count) {
            out.put(byte);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_zero_velocity_normalizes() {
        let mut ev = Event::new(10, 0x93, 0x3C, 0x00);
        assert!(ev.is_note_off_recorded());
        assert!(ev.normalize_note_off());
        assert_eq!(ev.status(), 0x83);
        assert_eq!(ev.channel(), Some(3));
        assert_eq!(ev.data(), (0x3C, 0));
    }

    #[test]
    fn test_note_on_with_velocity_is_untouched() {
        let mut ev = Event::note_on(0, 9, 36, 100);
        assert!(!ev.normalize_note_off());
        assert_eq!(ev.status(), 0x99);
    }

    #[test]
    fn test_constructors_mask_and_clamp() {
        let ev = Event::note_on(0, 20, 200, 255);
        assert_eq!(ev.status(), 0x9F);
        assert_eq!(ev.data(), (200 & 0x7F, 0x7F));

        let bend = Event::pitch_bend(0, 0, 0);
        assert_eq!(bend.data(), (0x00, 0x40));
        let bend_max = Event::pitch_bend(0, 0, i16::MAX);
        assert_eq!(bend_max.data(), (0x7F, 0x7F));
    }

    #[test]
    fn test_write_to_replaces_channel() {
        let ev = Event::note_on(0, 0, 60, 100);
        let mut bc = ByteContainer::new();
        ev.write_to(&mut bc, 5);
        assert_eq!(bc.as_slice(), &[0x95, 60, 100]);

        let pc = Event::program_change(0, 0, 12);
        let mut bc = ByteContainer::new();
        pc.write_to(&mut bc, 2);
        assert_eq!(bc.as_slice(), &[0xC2, 12]);
    }

    #[test]
    fn test_write_to_system_messages() {
        let clock = Event::new(0, status::CLOCK, 0, 0);
        let mut bc = ByteContainer::new();
        clock.write_to(&mut bc, 7);
        assert_eq!(bc.as_slice(), &[0xF8]);

        let spp = Event::new(0, status::SONG_POSITION, 0x10, 0x01);
        let mut bc = ByteContainer::new();
        spp.write_to(&mut bc, 0);
        assert_eq!(bc.as_slice(), &[0xF2, 0x10, 0x01]);
    }

    #[test]
    fn test_sysex_append_stops_at_terminator() {
        let mut ev = Event::default();
        ev.restart_sysex();
        assert!(!ev.append_sysex(&[0xF0, 0x7E, 0x7F]));
        assert!(!ev.append_sysex(&[0x06, 0x01]));
        assert!(ev.append_sysex(&[0xF7, 0x00]));
        assert_eq!(ev.sysex_bytes(), &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert_eq!(ev.message_len(), 6);
    }

    #[test]
    fn test_non_sysex_status_clears_payload() {
        let mut ev = Event::sysex(0, &[0xF0, 0x01, 0xF7]);
        ev.set_status_keep_channel(0x91);
        assert!(ev.sysex_bytes().is_empty());
        assert_eq!(ev.channel(), Some(1));
    }

    #[test]
    fn test_link_note_pair() {
        let mut on = Event::note_on(0, 0, 60, 90);
        let off = Event::note_off(96, 0, 60, 0);
        on.link(&off);
        assert_eq!(on.linked(), Some(96));
        on.unlink();
        assert!(!on.is_linked());
    }
}
