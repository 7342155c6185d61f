//! MIDI status byte constants and classification helpers.

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const AFTERTOUCH: u8 = 0xA0;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_PRESSURE: u8 = 0xD0;
pub const PITCH_WHEEL: u8 = 0xE0;

pub const SYSEX: u8 = 0xF0;
pub const QUARTER_FRAME: u8 = 0xF1;
pub const SONG_POSITION: u8 = 0xF2;
pub const SONG_SELECT: u8 = 0xF3;
pub const TUNE_REQUEST: u8 = 0xF6;
pub const SYSEX_END: u8 = 0xF7;

pub const CLOCK: u8 = 0xF8;
pub const START: u8 = 0xFA;
pub const CONTINUE: u8 = 0xFB;
pub const STOP: u8 = 0xFC;
pub const ACTIVE_SENSING: u8 = 0xFE;
pub const RESET: u8 = 0xFF;

/// Mask selecting the message kind of a channel status byte.
pub const KIND_MASK: u8 = 0xF0;
/// Mask selecting the channel nibble of a channel status byte.
pub const CHANNEL_MASK: u8 = 0x0F;

#[inline]
pub fn is_status(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// Channel voice messages, 0x80 through 0xEF.
#[inline]
pub fn is_channel_message(status: u8) -> bool {
    (NOTE_OFF..SYSEX).contains(&status)
}

#[inline]
pub fn is_realtime(status: u8) -> bool {
    status >= CLOCK
}

/// Number of data bytes that follow `status`, or `None` for SysEx and
/// undefined system bytes.
pub fn data_len(status: u8) -> Option<usize> {
    if is_channel_message(status) {
        return Some(match status & KIND_MASK {
            PROGRAM_CHANGE | CHANNEL_PRESSURE => 1,
            _ => 2,
        });
    }
    match status {
        QUARTER_FRAME | SONG_SELECT => Some(1),
        SONG_POSITION => Some(2),
        TUNE_REQUEST | SYSEX_END => Some(0),
        s if is_realtime(s) => Some(0),
        _ => None,
    }
}
