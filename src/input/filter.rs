//! Per-kind suppression flags and hot-swappable remap rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::MidiKind;

/// Suppression flags grouped by message kind.
///
/// A set flag drops the message before mapping, echo, and queueing. The
/// default passes everything. Plain `Copy` data so the receive path can
/// read a consistent rule set with one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Note-on and note-off.
    pub notes: bool,
    pub poly_pressure: bool,
    pub control_change: bool,
    pub program_change: bool,
    pub channel_pressure: bool,
    pub pitch_bend: bool,
    /// Timing clock pulses. Suppressing these also starves the tempo
    /// estimator.
    pub clock: bool,
    /// Start, stop, and continue.
    pub transport: bool,
    /// Song position and song select.
    pub song: bool,
    /// Everything decoded as [`MidiKind::Other`].
    pub other: bool,
}

impl FilterRules {
    /// Suppresses nothing; same as `default()`.
    pub fn pass_all() -> Self {
        Self::default()
    }

    /// Suppresses clock, transport, and song messages, keeping channel
    /// voice traffic. For when another component owns sync.
    pub fn block_sync() -> Self {
        Self {
            clock: true,
            transport: true,
            song: true,
            ..Self::default()
        }
    }

    pub fn suppresses(&self, kind: MidiKind) -> bool {
        match kind {
            MidiKind::NoteOff | MidiKind::NoteOn => self.notes,
            MidiKind::PolyPressure => self.poly_pressure,
            MidiKind::ControlChange => self.control_change,
            MidiKind::ProgramChange => self.program_change,
            MidiKind::ChannelPressure => self.channel_pressure,
            MidiKind::PitchBend => self.pitch_bend,
            MidiKind::Clock => self.clock,
            MidiKind::Start | MidiKind::Continue | MidiKind::Stop => self.transport,
            MidiKind::SongPosition | MidiKind::SongSelect => self.song,
            MidiKind::ActiveSense | MidiKind::Other => self.other,
        }
    }
}

/// A channel-voice message as seen by map rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEvent {
    pub kind: MidiKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
}

/// A remap rule applied to channel-voice traffic.
///
/// Wraps a plain closure so rules stay hot-swappable without the receive
/// path caring what they do. Returning `None` drops the message, which
/// the pipeline counts.
pub struct MapRules {
    map: Box<dyn Fn(MapEvent) -> Option<MapEvent> + Send + Sync>,
}

impl MapRules {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(MapEvent) -> Option<MapEvent> + Send + Sync + 'static,
    {
        Self { map: Box::new(map) }
    }

    /// Forces all traffic onto one channel.
    pub fn channel_to(channel: u8) -> Self {
        let channel = channel & 0x0F;
        Self::new(move |mut ev| {
            ev.channel = channel;
            Some(ev)
        })
    }

    /// Transposes notes and key pressure by `semitones`. Notes pushed
    /// outside 0..=127 are dropped rather than folded back in.
    pub fn transpose(semitones: i8) -> Self {
        Self::new(move |mut ev| {
            match ev.kind {
                MidiKind::NoteOn | MidiKind::NoteOff | MidiKind::PolyPressure => {
                    let key = ev.data1 as i16 + semitones as i16;
                    if !(0..=127).contains(&key) {
                        return None;
                    }
                    ev.data1 = key as u8;
                }
                _ => {}
            }
            Some(ev)
        })
    }

    #[inline]
    pub(crate) fn apply(&self, ev: MapEvent) -> Option<MapEvent> {
        (self.map)(ev)
    }
}

impl fmt::Debug for MapRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MapRules(..)")
    }
}
