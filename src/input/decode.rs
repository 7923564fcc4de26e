//! Byte-level MIDI stream decoder.
//!
//! Walks raw receive packets and emits classified messages. Realtime bytes
//! may interleave anywhere, including inside another message or a sysex
//! body, and are surfaced the moment they are seen. Malformed input is
//! counted and skipped, never an error: the wire does not stop for us.
//!
//! Running status is deliberately not supported. A data byte with no
//! status in the same packet is a protocol violation from the kind of
//! senders this core targets, and guessing message boundaries is worse
//! than dropping the byte.

use crate::event::{MidiKind, STATUS_CLOCK, STATUS_EOX, STATUS_SYSEX};
use crate::rt::Counter;

/// One decoded message, before filtering and mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decoded {
    pub kind: MidiKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
}

/// Decoder-side diagnostic counters.
#[derive(Debug, Default)]
pub(crate) struct DecodeStats {
    /// Data bytes with no owning status, and orphan end-of-sysex bytes.
    pub stray_bytes: Counter,
    /// Messages cut short by the packet end or by the next status byte.
    pub truncated: Counter,
    /// Sysex transfers skipped wholesale.
    pub sysex_skipped: Counter,
}

pub(crate) fn decode_packet<F: FnMut(Decoded)>(bytes: &[u8], stats: &DecodeStats, mut on_msg: F) {
    let mut i = 0;
    while i < bytes.len() {
        let status = bytes[i];
        if status < 0x80 {
            stats.stray_bytes.bump();
            i += 1;
            continue;
        }
        if status >= STATUS_CLOCK {
            on_msg(single_byte(status));
            i += 1;
            continue;
        }
        if status == STATUS_SYSEX {
            i = skip_sysex(bytes, i + 1, stats, &mut on_msg);
            continue;
        }
        if status == STATUS_EOX {
            // End-of-sysex with no sysex open.
            stats.stray_bytes.bump();
            i += 1;
            continue;
        }

        let (kind, need) = MidiKind::from_status(status);
        let mut data = [0u8; 2];
        let mut got = 0;
        let mut j = i + 1;
        while got < need && j < bytes.len() {
            let b = bytes[j];
            if b >= STATUS_CLOCK {
                // Interleaved realtime: emit now, keep collecting.
                on_msg(single_byte(b));
                j += 1;
                continue;
            }
            if b >= 0x80 {
                // A new status interrupts this message.
                break;
            }
            data[got] = b;
            got += 1;
            j += 1;
        }
        if got < need {
            stats.truncated.bump();
            i = j;
            continue;
        }
        on_msg(assemble(status, kind, data));
        i = j;
    }
}

/// Consumes a sysex body starting just past the 0xF0. Returns the index
/// of the first byte after the transfer.
fn skip_sysex<F: FnMut(Decoded)>(
    bytes: &[u8],
    mut i: usize,
    stats: &DecodeStats,
    on_msg: &mut F,
) -> usize {
    while i < bytes.len() {
        let b = bytes[i];
        if b == STATUS_EOX {
            i += 1;
            break;
        }
        if b >= STATUS_CLOCK {
            // Realtime is legal even mid-sysex.
            on_msg(single_byte(b));
            i += 1;
            continue;
        }
        if b >= 0x80 {
            // Implicit termination by the next status byte.
            break;
        }
        i += 1;
    }
    stats.sysex_skipped.bump();
    i
}

fn single_byte(status: u8) -> Decoded {
    let (kind, _) = MidiKind::from_status(status);
    Decoded {
        kind,
        channel: 0,
        data1: 0,
        // `Other` keeps the status so the message stays re-encodable.
        data2: if kind == MidiKind::Other { status } else { 0 },
    }
}

fn assemble(status: u8, kind: MidiKind, data: [u8; 2]) -> Decoded {
    let channel = if status < 0xF0 { status & 0x0F } else { 0 };
    match kind {
        // Note-on at velocity zero is a note-off by MIDI convention.
        MidiKind::NoteOn if data[1] == 0 => Decoded {
            kind: MidiKind::NoteOff,
            channel,
            data1: data[0],
            data2: 0,
        },
        MidiKind::Other => Decoded {
            kind,
            channel,
            data1: data[0],
            data2: status,
        },
        _ => Decoded {
            kind,
            channel,
            data1: data[0],
            data2: data[1],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{STATUS_ACTIVE_SENSE, STATUS_QUARTER_FRAME};

    fn decode_all(bytes: &[u8]) -> (Vec<Decoded>, DecodeStats) {
        let stats = DecodeStats::default();
        let mut seen = Vec::new();
        decode_packet(bytes, &stats, |d| seen.push(d));
        (seen, stats)
    }

    #[test]
    fn test_single_channel_message() {
        let (seen, stats) = decode_all(&[0x92, 60, 100]);
        assert_eq!(
            seen,
            vec![Decoded {
                kind: MidiKind::NoteOn,
                channel: 2,
                data1: 60,
                data2: 100,
            }]
        );
        assert_eq!(stats.truncated.get(), 0);
    }

    #[test]
    fn test_note_on_velocity_zero_becomes_note_off() {
        let (seen, _) = decode_all(&[0x90, 60, 0]);
        assert_eq!(seen[0].kind, MidiKind::NoteOff);
        assert_eq!(seen[0].data1, 60);
    }

    #[test]
    fn test_multiple_messages_in_one_packet() {
        let (seen, _) = decode_all(&[0x90, 60, 100, 0xB0, 7, 90, 0xC1, 12]);
        let kinds: Vec<MidiKind> = seen.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MidiKind::NoteOn,
                MidiKind::ControlChange,
                MidiKind::ProgramChange
            ]
        );
        assert_eq!(seen[2].channel, 1);
        assert_eq!(seen[2].data1, 12);
    }

    #[test]
    fn test_interleaved_realtime_is_emitted_first() {
        let (seen, stats) = decode_all(&[0x90, 60, 0xF8, 100]);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, MidiKind::Clock);
        assert_eq!(seen[1].kind, MidiKind::NoteOn);
        assert_eq!(seen[1].data2, 100);
        assert_eq!(stats.truncated.get(), 0);
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let (seen, stats) = decode_all(&[0x90, 60]);
        assert!(seen.is_empty());
        assert_eq!(stats.truncated.get(), 1);
    }

    #[test]
    fn test_status_interrupting_status_truncates_the_first() {
        let (seen, stats) = decode_all(&[0x90, 60, 0x80, 60, 0]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MidiKind::NoteOff);
        assert_eq!(stats.truncated.get(), 1);
    }

    #[test]
    fn test_stray_data_bytes_are_counted() {
        let (seen, stats) = decode_all(&[10, 20, 0xF8]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MidiKind::Clock);
        assert_eq!(stats.stray_bytes.get(), 2);
    }

    #[test]
    fn test_sysex_is_skipped_wholesale() {
        let (seen, stats) = decode_all(&[0xF0, 1, 2, 3, 0xF7, 0x90, 60, 100]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MidiKind::NoteOn);
        assert_eq!(stats.sysex_skipped.get(), 1);
    }

    #[test]
    fn test_realtime_inside_sysex_survives() {
        let (seen, stats) = decode_all(&[0xF0, 1, 0xF8, 2, 0xF7]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MidiKind::Clock);
        assert_eq!(stats.sysex_skipped.get(), 1);
    }

    #[test]
    fn test_unterminated_sysex_consumes_the_packet() {
        let (seen, stats) = decode_all(&[0xF0, 1, 2, 3]);
        assert!(seen.is_empty());
        assert_eq!(stats.sysex_skipped.get(), 1);
    }

    #[test]
    fn test_status_terminates_sysex_implicitly() {
        let (seen, stats) = decode_all(&[0xF0, 1, 2, 0x90, 60, 100]);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MidiKind::NoteOn);
        assert_eq!(stats.sysex_skipped.get(), 1);
    }

    #[test]
    fn test_orphan_eox_is_stray() {
        let (seen, stats) = decode_all(&[0xF7]);
        assert!(seen.is_empty());
        assert_eq!(stats.stray_bytes.get(), 1);
    }

    #[test]
    fn test_quarter_frame_keeps_its_status() {
        let (seen, _) = decode_all(&[STATUS_QUARTER_FRAME, 0x35]);
        assert_eq!(seen[0].kind, MidiKind::Other);
        assert_eq!(seen[0].data1, 0x35);
        assert_eq!(seen[0].data2, STATUS_QUARTER_FRAME);
    }

    #[test]
    fn test_active_sense_decodes() {
        let (seen, _) = decode_all(&[STATUS_ACTIVE_SENSE]);
        assert_eq!(seen[0].kind, MidiKind::ActiveSense);
    }

    #[test]
    fn test_song_position_decodes_14_bits() {
        let (seen, _) = decode_all(&[0xF2, 0x05, 0x40]);
        assert_eq!(seen[0].kind, MidiKind::SongPosition);
        assert_eq!(seen[0].data1, 0x05);
        assert_eq!(seen[0].data2, 0x40);
    }
}
