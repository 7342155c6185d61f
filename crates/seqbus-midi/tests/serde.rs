//! Serde tests for seqbus-midi events.

use seqbus_midi::Event;

/// Linked notes and SysEx payloads survive a binary encoding.
#[test]
fn test_event_bincode_preserves_link_and_sysex() {
    let mut on = Event::note_on(384, 2, 64, 110);
    on.link(&Event::note_off(480, 2, 64, 0));

    let bytes = bincode::serialize(&on).unwrap();
    let decoded: Event = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, on);
    assert_eq!(decoded.linked(), Some(480));

    let sysex = Event::sysex(0, &[0xF0, 0x43, 0x10, 0x4C, 0xF7]);
    let bytes = bincode::serialize(&sysex).unwrap();
    let decoded: Event = bincode::deserialize(&bytes).unwrap();
    assert!(decoded.is_sysex());
    assert_eq!(decoded.sysex_bytes(), sysex.sysex_bytes());
}
