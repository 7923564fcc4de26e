//! MIDI message model shared by the clock engine and the input pipeline.
//!
//! Two representations exist on purpose:
//! - [`WireMessage`] is the raw byte form as it travels to a device: fixed
//!   3-byte storage, `Copy`, cheap enough for lock-free rings.
//! - [`MidiMessage`] is the decoded record with timing metadata. Records are
//!   pool-allocated and handed to consumers in [`MessageList`] batches.

use std::fmt;

use serde::{Deserialize, Serialize};

// MIDI 1.0 status bytes.
pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_POLY_PRESSURE: u8 = 0xA0;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_CHANNEL_PRESSURE: u8 = 0xD0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;
pub const STATUS_SYSEX: u8 = 0xF0;
pub const STATUS_QUARTER_FRAME: u8 = 0xF1;
pub const STATUS_SONG_POSITION: u8 = 0xF2;
pub const STATUS_SONG_SELECT: u8 = 0xF3;
pub const STATUS_TUNE_REQUEST: u8 = 0xF6;
pub const STATUS_EOX: u8 = 0xF7;
pub const STATUS_CLOCK: u8 = 0xF8;
pub const STATUS_START: u8 = 0xFA;
pub const STATUS_CONTINUE: u8 = 0xFB;
pub const STATUS_STOP: u8 = 0xFC;
pub const STATUS_ACTIVE_SENSE: u8 = 0xFE;
pub const STATUS_RESET: u8 = 0xFF;

/// MIDI clock pulses per quarter note, fixed by the MIDI standard.
pub const MIDI_CLOCKS_PER_BEAT: u32 = 24;

/// MIDI clocks per song-position unit (one sixteenth note).
pub const CLOCKS_PER_SONG_POSITION: u32 = 6;

/// Decoded message kind.
///
/// Note-on with velocity zero is normalized to [`MidiKind::NoteOff`] during
/// decoding, so `NoteOn` here always means an audible onset.
///
/// `Other` carries messages with no dedicated variant (quarter frame, tune
/// request, undefined statuses); the original status byte is preserved in
/// [`MidiMessage::data2`] so the message can still be re-emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MidiKind {
    NoteOff,
    NoteOn,
    PolyPressure,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SongPosition,
    SongSelect,
    Clock,
    Start,
    Continue,
    Stop,
    ActiveSense,
    Other,
}

impl MidiKind {
    /// True for the seven channel-voice kinds.
    #[inline]
    pub fn is_channel_voice(self) -> bool {
        matches!(
            self,
            MidiKind::NoteOff
                | MidiKind::NoteOn
                | MidiKind::PolyPressure
                | MidiKind::ControlChange
                | MidiKind::ProgramChange
                | MidiKind::ChannelPressure
                | MidiKind::PitchBend
        )
    }

    /// True for single-byte realtime kinds (clock and transport).
    #[inline]
    pub fn is_realtime(self) -> bool {
        matches!(
            self,
            MidiKind::Clock
                | MidiKind::Start
                | MidiKind::Continue
                | MidiKind::Stop
                | MidiKind::ActiveSense
        )
    }

    /// Classifies a status byte and returns the expected data byte count.
    ///
    /// Callers must not pass data bytes (`< 0x80`) or sysex framing bytes;
    /// the decoder handles those before classification.
    pub(crate) fn from_status(status: u8) -> (MidiKind, usize) {
        match status & 0xF0 {
            0x80 => (MidiKind::NoteOff, 2),
            0x90 => (MidiKind::NoteOn, 2),
            0xA0 => (MidiKind::PolyPressure, 2),
            0xB0 => (MidiKind::ControlChange, 2),
            0xC0 => (MidiKind::ProgramChange, 1),
            0xD0 => (MidiKind::ChannelPressure, 1),
            0xE0 => (MidiKind::PitchBend, 2),
            _ => match status {
                STATUS_QUARTER_FRAME => (MidiKind::Other, 1),
                STATUS_SONG_POSITION => (MidiKind::SongPosition, 2),
                STATUS_SONG_SELECT => (MidiKind::SongSelect, 1),
                STATUS_CLOCK => (MidiKind::Clock, 0),
                STATUS_START => (MidiKind::Start, 0),
                STATUS_CONTINUE => (MidiKind::Continue, 0),
                STATUS_STOP => (MidiKind::Stop, 0),
                STATUS_ACTIVE_SENSE => (MidiKind::ActiveSense, 0),
                // Tune request, reset, and the undefined statuses.
                _ => (MidiKind::Other, 0),
            },
        }
    }
}

/// A decoded MIDI message with timing metadata.
///
/// Records are allocated from an [`EventPool`](crate::pool::EventPool) and
/// linked into [`MessageList`] batches; consumers release whole batches back
/// to the pool when done.
pub struct MidiMessage {
    pub kind: MidiKind,
    /// Channel 0-15 for channel-voice kinds, 0 otherwise.
    pub channel: u8,
    /// First data byte: note number, controller, program, position LSB.
    pub data1: u8,
    /// Second data byte: velocity, controller value, position MSB. For
    /// [`MidiKind::Other`] this holds the original status byte instead.
    pub data2: u8,
    /// Arrival time in milliseconds, as supplied by the receive callback.
    pub timestamp_ms: u64,
    /// For note-off records: milliseconds since the matching note-on.
    /// Zero when unknown or not applicable.
    pub duration_ms: u32,
    pub(crate) next: Option<Box<MidiMessage>>,
}

impl MidiMessage {
    pub(crate) fn blank() -> Self {
        Self {
            kind: MidiKind::Other,
            channel: 0,
            data1: 0,
            data2: 0,
            timestamp_ms: 0,
            duration_ms: 0,
            next: None,
        }
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.kind == MidiKind::NoteOn
    }

    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.kind == MidiKind::NoteOff
    }

    /// Note number for note and poly-pressure kinds.
    #[inline]
    pub fn note(&self) -> Option<u8> {
        match self.kind {
            MidiKind::NoteOff | MidiKind::NoteOn | MidiKind::PolyPressure => Some(self.data1),
            _ => None,
        }
    }

    /// Velocity for note kinds.
    #[inline]
    pub fn velocity(&self) -> Option<u8> {
        match self.kind {
            MidiKind::NoteOff | MidiKind::NoteOn => Some(self.data2),
            _ => None,
        }
    }

    /// 14-bit pitch bend value, 0x2000 at center.
    #[inline]
    pub fn pitch_bend(&self) -> Option<u16> {
        match self.kind {
            MidiKind::PitchBend => Some(((self.data2 as u16) << 7) | self.data1 as u16),
            _ => None,
        }
    }

    /// 14-bit song position in sixteenth-note units.
    #[inline]
    pub fn song_position(&self) -> Option<u16> {
        match self.kind {
            MidiKind::SongPosition => Some(((self.data2 as u16) << 7) | self.data1 as u16),
            _ => None,
        }
    }
}

// Manual impl: the derived one would walk `next` recursively, which is both
// noisy and a stack hazard for long chains.
impl fmt::Debug for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiMessage")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("data1", &self.data1)
            .field("data2", &self.data2)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}

/// A singly linked batch of [`MidiMessage`] records in arrival order.
///
/// Produced by `drain()` on the input pipeline; the consumer walks or pops
/// the records and hands the remainder back to the pool in one call.
#[derive(Default)]
pub struct MessageList {
    pub(crate) head: Option<Box<MidiMessage>>,
    pub(crate) len: usize,
}

impl MessageList {
    pub fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Detaches and returns the oldest record.
    pub fn pop_front(&mut self) -> Option<Box<MidiMessage>> {
        self.head.take().map(|mut node| {
            self.head = node.next.take();
            self.len -= 1;
            node
        })
    }

    /// Prepends a record. Useful for collecting loose records into a batch
    /// before releasing them to the pool.
    pub fn push_front(&mut self, mut msg: Box<MidiMessage>) {
        msg.next = self.head.take();
        self.head = Some(msg);
        self.len += 1;
    }

    pub fn iter(&self) -> MessageIter<'_> {
        MessageIter {
            next: self.head.as_deref(),
        }
    }
}

impl fmt::Debug for MessageList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageList").field("len", &self.len).finish()
    }
}

// Default recursive drop would overflow the stack on long batches.
impl Drop for MessageList {
    fn drop(&mut self) {
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
    }
}

impl<'a> IntoIterator for &'a MessageList {
    type Item = &'a MidiMessage;
    type IntoIter = MessageIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct MessageIter<'a> {
    next: Option<&'a MidiMessage>,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = &'a MidiMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|msg| {
            self.next = msg.next.as_deref();
            msg
        })
    }
}

/// A MIDI message in raw wire form.
///
/// Fixed-size storage so the type stays `Copy` and can cross SPSC rings
/// without allocation. `len` is 1-3; sysex never takes this form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage {
    pub data: [u8; 3],
    pub len: u8,
}

impl WireMessage {
    /// Single-byte realtime message (clock, start, continue, stop).
    #[inline]
    pub fn realtime(status: u8) -> Self {
        Self {
            data: [status, 0, 0],
            len: 1,
        }
    }

    /// Song position pointer. `units` counts sixteenth notes and is masked
    /// to the 14 bits the wire format can carry.
    pub fn song_position(units: u16) -> Self {
        let u = units & 0x3FFF;
        Self {
            data: [STATUS_SONG_POSITION, (u & 0x7F) as u8, (u >> 7) as u8],
            len: 3,
        }
    }

    /// Re-encodes a decoded message. Returns `None` for an `Other` record
    /// whose preserved status byte is invalid.
    pub fn from_parts(kind: MidiKind, channel: u8, data1: u8, data2: u8) -> Option<Self> {
        let ch = channel & 0x0F;
        let (status, len) = match kind {
            MidiKind::NoteOff => (STATUS_NOTE_OFF | ch, 3u8),
            MidiKind::NoteOn => (STATUS_NOTE_ON | ch, 3),
            MidiKind::PolyPressure => (STATUS_POLY_PRESSURE | ch, 3),
            MidiKind::ControlChange => (STATUS_CONTROL_CHANGE | ch, 3),
            MidiKind::ProgramChange => (STATUS_PROGRAM_CHANGE | ch, 2),
            MidiKind::ChannelPressure => (STATUS_CHANNEL_PRESSURE | ch, 2),
            MidiKind::PitchBend => (STATUS_PITCH_BEND | ch, 3),
            MidiKind::SongPosition => (STATUS_SONG_POSITION, 3),
            MidiKind::SongSelect => (STATUS_SONG_SELECT, 2),
            MidiKind::Clock => (STATUS_CLOCK, 1),
            MidiKind::Start => (STATUS_START, 1),
            MidiKind::Continue => (STATUS_CONTINUE, 1),
            MidiKind::Stop => (STATUS_STOP, 1),
            MidiKind::ActiveSense => (STATUS_ACTIVE_SENSE, 1),
            // `Other` records keep their original status in data2 and the
            // single payload byte, if any, in data1.
            MidiKind::Other => {
                if data2 < 0x80 {
                    return None;
                }
                let (_, need) = MidiKind::from_status(data2);
                (data2, 1 + need as u8)
            }
        };
        let mut data = [0u8; 3];
        data[0] = status;
        if len >= 2 {
            data[1] = data1 & 0x7F;
        }
        if len == 3 {
            data[2] = data2 & 0x7F;
        }
        Some(Self { data, len })
    }

    /// Re-encodes a pooled record, see [`WireMessage::from_parts`].
    #[inline]
    pub fn from_message(msg: &MidiMessage) -> Option<Self> {
        Self::from_parts(msg.kind, msg.channel, msg.data1, msg.data2)
    }

    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0]
    }

    /// Channel for channel-voice statuses, 0 otherwise.
    #[inline]
    pub fn channel(&self) -> u8 {
        if self.data[0] < 0xF0 {
            self.data[0] & 0x0F
        } else {
            0
        }
    }

    /// The valid wire bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}
