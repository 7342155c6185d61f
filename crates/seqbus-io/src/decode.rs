//! Turns decoded back-end bytes into [`Event`]s.

use seqbus_midi::{status, Event, Pulse};

/// Size of the stack buffer inbound packets are decoded into.
pub const DECODE_BUFFER_SIZE: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// The event is ready.
    Complete,
    /// A SysEx message is open; more packets are needed.
    NeedMore,
    /// Nothing to decode.
    Empty,
    /// Valid input that this bus does not deliver.
    Dropped,
    /// The SysEx message outgrew the size limit. The rest of it is
    /// skipped.
    Overflow,
}

#[derive(Debug, Clone)]
pub struct EventDecoder {
    sysex_enabled: bool,
    max_sysex: usize,
    running_status: Option<u8>,
    /// Inside an oversized SysEx message: data bytes up to `F7` are dropped.
    skipping_sysex: bool,
}

impl EventDecoder {
    pub fn new(sysex_enabled: bool, max_sysex: usize) -> Self {
        Self {
            sysex_enabled,
            max_sysex,
            running_status: None,
            skipping_sysex: false,
        }
    }

    pub fn sysex_enabled(&self) -> bool {
        self.sysex_enabled
    }

    pub fn max_sysex(&self) -> usize {
        self.max_sysex
    }

    /// Decodes the first packet of a message into `event`.
    pub fn decode(&mut self, bytes: &[u8], tick: Pulse, event: &mut Event) -> DecodeStep {
        let Some(&first) = bytes.first() else {
            return DecodeStep::Empty;
        };
        if self.skipping_sysex {
            if !status::is_status(first) || first == status::SYSEX_END {
                if bytes.contains(&status::SYSEX_END) {
                    self.skipping_sysex = false;
                }
                return DecodeStep::Dropped;
            }
            if !status::is_realtime(first) {
                self.skipping_sysex = false;
            }
        }
        let (status, data) = if status::is_status(first) {
            (first, &bytes[1..])
        } else {
            match self.running_status {
                Some(running) => (running, bytes),
                None => return DecodeStep::Dropped,
            }
        };

        event.set_timestamp(tick);
        event.unlink();

        if status == status::SYSEX {
            self.running_status = None;
            if !self.sysex_enabled {
                return DecodeStep::Dropped;
            }
            event.restart_sysex();
            return self.append_sysex(bytes, event);
        }

        if status::is_channel_message(status) {
            self.running_status = Some(status);
        } else if !status::is_realtime(status) {
            self.running_status = None;
        }

        event.set_status_keep_channel(status);
        event.set_data(
            data.first().copied().unwrap_or(0),
            data.get(1).copied().unwrap_or(0),
        );
        event.normalize_note_off();
        DecodeStep::Complete
    }

    /// Appends a continuation packet to an open SysEx message.
    pub fn continue_sysex(&mut self, bytes: &[u8], event: &mut Event) -> DecodeStep {
        if bytes.is_empty() {
            return DecodeStep::Empty;
        }
        self.append_sysex(bytes, event)
    }

    fn append_sysex(&mut self, bytes: &[u8], event: &mut Event) -> DecodeStep {
        let end = bytes
            .iter()
            .position(|&b| b == status::SYSEX_END)
            .map_or(bytes.len(), |i| i + 1);
        if event.sysex_bytes().len() + end > self.max_sysex {
            self.skipping_sysex = bytes[end - 1] != status::SYSEX_END;
            return DecodeStep::Overflow;
        }
        if event.append_sysex(bytes) {
            DecodeStep::Complete
        } else {
            DecodeStep::NeedMore
        }
    }
}

/// Splits a framed SysEx payload into chunks of at most `chunk` bytes.
///
/// A lone trailing `F7` is kept with the chunk before it, so no chunk is
/// just the terminator.
pub fn sysex_chunks(payload: &[u8], chunk: Option<usize>) -> SysexChunks<'_> {
    SysexChunks {
        rest: payload,
        size: chunk.unwrap_or(payload.len()).max(1),
    }
}

pub struct SysexChunks<'a> {
    rest: &'a [u8],
    size: usize,
}

impl<'a> Iterator for SysexChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let take = if self.rest.len() == self.size + 1 && self.rest.last() == Some(&status::SYSEX_END) {
            self.rest.len()
        } else {
            self.size.min(self.rest.len())
        };
        let (head, tail) = self.rest.split_at(take);
        self.rest = tail;
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_velocity_zero_becomes_note_off() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[0x93, 0x3C, 0x00], 42, &mut ev), DecodeStep::Complete);
        assert_eq!(ev.status(), 0x83);
        assert_eq!(ev.data(), (0x3C, 0x00));
        assert_eq!(ev.timestamp(), 42);
    }

    #[test]
    fn test_channel_nibble_is_kept() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        decoder.decode(&[0xBA, 7, 100], 0, &mut ev);
        assert_eq!(ev.status(), 0xBA);
        assert_eq!(ev.channel(), Some(10));
    }

    #[test]
    fn test_short_message_pads_data() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::note_on(0, 0, 1, 2);
        decoder.decode(&[0xC4, 9], 5, &mut ev);
        assert_eq!(ev.status(), 0xC4);
        assert_eq!(ev.data(), (9, 0));
    }

    #[test]
    fn test_empty_packet() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[], 0, &mut ev), DecodeStep::Empty);
    }

    #[test]
    fn test_running_status() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        decoder.decode(&[0x91, 60, 100], 0, &mut ev);
        assert_eq!(decoder.decode(&[62, 0], 1, &mut ev), DecodeStep::Complete);
        assert_eq!(ev.status(), 0x81);
        assert_eq!(ev.data(), (62, 0));

        // realtime bytes do not cancel running status
        decoder.decode(&[0xF8], 2, &mut ev);
        decoder.decode(&[64, 90], 3, &mut ev);
        assert_eq!(ev.status(), 0x91);

        // system common does
        decoder.decode(&[0xF2, 0, 0], 4, &mut ev);
        assert_eq!(decoder.decode(&[64, 90], 5, &mut ev), DecodeStep::Dropped);
    }

    #[test]
    fn test_sysex_reassembly() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[0xF0, 0x7E, 0x7F], 9, &mut ev), DecodeStep::NeedMore);
        assert_eq!(decoder.continue_sysex(&[0x06, 0x01], &mut ev), DecodeStep::NeedMore);
        assert_eq!(decoder.continue_sysex(&[0xF7], &mut ev), DecodeStep::Complete);
        assert!(ev.is_sysex());
        assert_eq!(ev.sysex_bytes(), &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert_eq!(ev.timestamp(), 9);
    }

    #[test]
    fn test_sysex_single_packet() {
        let mut decoder = EventDecoder::new(true, 0x10000);
        let mut ev = Event::default();
        assert_eq!(
            decoder.decode(&[0xF0, 0x41, 0xF7], 0, &mut ev),
            DecodeStep::Complete
        );
        assert_eq!(decoder.continue_sysex(&[], &mut ev), DecodeStep::Empty);
    }

    #[test]
    fn test_sysex_disabled_is_dropped() {
        let mut decoder = EventDecoder::new(false, 0x10000);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[0xF0, 1, 0xF7], 0, &mut ev), DecodeStep::Dropped);
    }

    #[test]
    fn test_sysex_chunks() {
        let payload: Vec<u8> = std::iter::once(0xF0)
            .chain(1..=8)
            .chain(std::iter::once(0xF7))
            .collect();
        let chunks: Vec<_> = sysex_chunks(&payload, Some(4)).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], &[0xF0, 1, 2, 3]);
        assert_eq!(chunks[2], &[8, 0xF7]);
        assert_eq!(sysex_chunks(&payload, None).count(), 1);
    }

    #[test]
    fn test_sysex_chunks_keep_terminator_attached() {
        let mut payload = vec![0xF0];
        payload.extend(std::iter::repeat(0x01).take(255));
        payload.push(0xF7);
        assert_eq!(payload.len(), 257);

        let chunks: Vec<_> = sysex_chunks(&payload, Some(0x100)).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 257);

        payload.insert(1, 0x02);
        let chunks: Vec<_> = sysex_chunks(&payload, Some(0x100)).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], &[0x01, 0xF7]);
        assert!(sysex_chunks(&payload, Some(0x100)).all(|c| c != [0xF7]));
    }

    #[test]
    fn test_oversized_sysex_is_cut_and_skipped() {
        let mut decoder = EventDecoder::new(true, 8);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[0xF0, 1, 2, 3], 0, &mut ev), DecodeStep::NeedMore);
        assert_eq!(decoder.continue_sysex(&[4, 5, 6, 7, 8], &mut ev), DecodeStep::Overflow);

        // the tail of the message is swallowed, realtime still gets through
        assert_eq!(decoder.decode(&[9, 10], 0, &mut ev), DecodeStep::Dropped);
        assert_eq!(decoder.decode(&[0xF8], 1, &mut ev), DecodeStep::Complete);
        assert_eq!(decoder.decode(&[11, 0xF7], 2, &mut ev), DecodeStep::Dropped);

        assert_eq!(decoder.decode(&[0x90, 60, 100], 3, &mut ev), DecodeStep::Complete);
        assert_eq!(ev.status(), 0x90);
    }

    #[test]
    fn test_sysex_at_the_limit_is_accepted() {
        let mut decoder = EventDecoder::new(true, 4);
        let mut ev = Event::default();
        assert_eq!(decoder.decode(&[0xF0, 1, 2, 0xF7], 0, &mut ev), DecodeStep::Complete);
        assert_eq!(decoder.decode(&[0xF0, 1, 2, 3, 0xF7], 0, &mut ev), DecodeStep::Overflow);
        // terminated in the same packet, so nothing is skipped afterwards
        assert_eq!(decoder.decode(&[0xC0, 5], 1, &mut ev), DecodeStep::Complete);
    }
}
