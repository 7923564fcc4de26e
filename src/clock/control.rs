//! Shared control block between the clock engine and controller threads.
//!
//! The engine owns its tick state outright; everything other threads may
//! touch lives here as lock-free atomics. Setters record requests that the
//! engine consumes at the top of its next tick, getters read values the
//! engine published at the end of its last mutation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF64;

use crate::event::CLOCKS_PER_SONG_POSITION;
use crate::rt::Counter;

use super::{ClockConfig, MAX_TEMPO_BPM, MIN_TEMPO_BPM};

pub(crate) struct ClockControl {
    // Requests, consumed by the engine at tick boundaries.
    pub(crate) enabled: AtomicBool,
    pub(crate) midi_sync: AtomicBool,
    pub(crate) bpm_request: AtomicF64,
    pub(crate) bpm_pending: AtomicBool,
    pub(crate) resolution_request: AtomicU32,
    pub(crate) resolution_pending: AtomicBool,
    pub(crate) start_pending: AtomicBool,
    pub(crate) stop_pending: AtomicBool,
    pub(crate) stop_halts_clocks: AtomicBool,
    pub(crate) continue_pending: AtomicBool,
    pub(crate) continue_sends_position: AtomicBool,
    pub(crate) seek_target: AtomicU64,
    pub(crate) seek_pending: AtomicBool,
    /// Armed signal clock; 0 means disarmed.
    pub(crate) signal_clock: AtomicU64,
    /// Re-entrancy latch for the tick path.
    pub(crate) in_tick: AtomicBool,

    // State published by the engine.
    pub(crate) user_clock: AtomicU64,
    pub(crate) midi_clock: AtomicU64,
    pub(crate) bpm: AtomicF64,
    pub(crate) started: AtomicBool,
    pub(crate) sending_clocks: AtomicBool,
    pub(crate) clocks_per_beat: AtomicU32,
    pub(crate) beats_per_measure: AtomicU32,

    // Diagnostic counters.
    pub(crate) tick_overruns: Counter,
    pub(crate) midi_corrections: Counter,
    pub(crate) user_corrections: Counter,
    pub(crate) forced_resets: Counter,
    pub(crate) signal_overflows: Counter,
    pub(crate) faults: Counter,
}

impl ClockControl {
    pub(crate) fn new(config: &ClockConfig) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            midi_sync: AtomicBool::new(config.midi_sync),
            bpm_request: AtomicF64::new(config.bpm),
            bpm_pending: AtomicBool::new(false),
            resolution_request: AtomicU32::new(config.clocks_per_beat),
            resolution_pending: AtomicBool::new(false),
            start_pending: AtomicBool::new(false),
            stop_pending: AtomicBool::new(false),
            stop_halts_clocks: AtomicBool::new(false),
            continue_pending: AtomicBool::new(false),
            continue_sends_position: AtomicBool::new(false),
            seek_target: AtomicU64::new(0),
            seek_pending: AtomicBool::new(false),
            signal_clock: AtomicU64::new(0),
            in_tick: AtomicBool::new(false),
            user_clock: AtomicU64::new(0),
            midi_clock: AtomicU64::new(0),
            bpm: AtomicF64::new(config.bpm),
            started: AtomicBool::new(false),
            sending_clocks: AtomicBool::new(true),
            clocks_per_beat: AtomicU32::new(config.clocks_per_beat),
            beats_per_measure: AtomicU32::new(config.beats_per_measure),
            tick_overruns: Counter::new(),
            midi_corrections: Counter::new(),
            user_corrections: Counter::new(),
            forced_resets: Counter::new(),
            signal_overflows: Counter::new(),
            faults: Counter::new(),
        }
    }
}

/// Cloneable controller for a [`ClockEngine`](super::ClockEngine).
///
/// Every method is lock-free and safe from any thread, including from
/// inside the engine's own callbacks. Transport and tempo requests take
/// effect at the engine's next tick, not synchronously.
#[derive(Clone)]
pub struct ClockHandle {
    pub(crate) control: Arc<ClockControl>,
}

impl ClockHandle {
    /// Gates the whole tick path. While disabled, ticks return immediately
    /// and queued requests stay queued.
    pub fn set_enabled(&self, enabled: bool) {
        self.control.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.control.enabled.load(Ordering::Acquire)
    }

    /// Gates wire output. The listener keeps observing pulses either way.
    pub fn set_midi_sync(&self, enabled: bool) {
        self.control.midi_sync.store(enabled, Ordering::Release);
    }

    pub fn midi_sync(&self) -> bool {
        self.control.midi_sync.load(Ordering::Acquire)
    }

    /// Requests a tempo change, clamped to the supported range.
    ///
    /// While the transport runs, the change lands exactly on the next MIDI
    /// clock boundary so pulse widths never change mid-pulse; otherwise it
    /// lands at the top of the next tick.
    pub fn set_tempo(&self, bpm: f64) {
        let bpm = if bpm.is_finite() {
            bpm.clamp(MIN_TEMPO_BPM, MAX_TEMPO_BPM)
        } else {
            MIN_TEMPO_BPM
        };
        self.control.bpm_request.store(bpm, Ordering::Release);
        self.control.bpm_pending.store(true, Ordering::Release);
    }

    /// Currently applied tempo; a requested change shows up only after the
    /// engine applies it.
    pub fn tempo_bpm(&self) -> f64 {
        self.control.bpm.load(Ordering::Acquire)
    }

    /// Requests a new user clock resolution in clocks per beat (minimum 1).
    pub fn set_resolution(&self, clocks_per_beat: u32) {
        self.control
            .resolution_request
            .store(clocks_per_beat.max(1), Ordering::Release);
        self.control.resolution_pending.store(true, Ordering::Release);
    }

    pub fn clocks_per_beat(&self) -> u32 {
        self.control.clocks_per_beat.load(Ordering::Acquire)
    }

    /// Starts the transport from clock zero at the next tick.
    pub fn midi_start(&self) {
        self.control.start_pending.store(true, Ordering::Release);
    }

    /// Stops the transport at the next tick, keeping its position.
    /// With `halt_clocks` the wire clock stream stops too.
    pub fn midi_stop(&self, halt_clocks: bool) {
        self.control
            .stop_halts_clocks
            .store(halt_clocks, Ordering::Release);
        self.control.stop_pending.store(true, Ordering::Release);
    }

    /// Resumes a stopped transport from its current position. With
    /// `send_song_position` the wire carries a song position pointer ahead
    /// of the continue message so receivers can realign.
    pub fn midi_continue(&self, send_song_position: bool) {
        self.control
            .continue_sends_position
            .store(send_song_position, Ordering::Release);
        self.control.continue_pending.store(true, Ordering::Release);
    }

    /// Repositions the transport to an absolute user clock, rounded down
    /// to the song-position quantum (a quarter of a beat).
    pub fn set_clock(&self, user_clock: u64) {
        self.control.seek_target.store(user_clock, Ordering::Release);
        self.control.seek_pending.store(true, Ordering::Release);
    }

    /// Arms the one-shot signal: the engine's signal callback fires on the
    /// first tick where the user clock has reached or passed `user_clock`.
    /// Zero disarms. Re-arming from inside the callback is supported.
    pub fn set_next_signal_clock(&self, user_clock: u64) {
        self.control.signal_clock.store(user_clock, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.control.started.load(Ordering::Acquire)
    }

    /// Whether the engine is currently willing to emit wire clocks.
    pub fn is_sending_clocks(&self) -> bool {
        self.control.sending_clocks.load(Ordering::Acquire)
    }

    /// Snapshot of the transport position in every unit a caller needs.
    pub fn position(&self) -> ClockPosition {
        let user_clock = self.control.user_clock.load(Ordering::Acquire);
        let midi_clock = self.control.midi_clock.load(Ordering::Acquire);
        let cpb = self.control.clocks_per_beat.load(Ordering::Acquire).max(1) as u64;
        let meter = self.control.beats_per_measure.load(Ordering::Acquire).max(1) as u64;
        let beat = user_clock / cpb;
        ClockPosition {
            user_clock,
            beat,
            measure: beat / meter,
            midi_clock,
            song_position: midi_clock / CLOCKS_PER_SONG_POSITION as u64,
        }
    }

    /// Snapshot of the engine's diagnostic counters.
    pub fn diagnostics(&self) -> ClockDiagnostics {
        ClockDiagnostics {
            tick_overruns: self.control.tick_overruns.get(),
            midi_clock_corrections: self.control.midi_corrections.get(),
            user_clock_corrections: self.control.user_corrections.get(),
            forced_resets: self.control.forced_resets.get(),
            signal_overflows: self.control.signal_overflows.get(),
            faults: self.control.faults.get(),
        }
    }
}

/// Snapshot of the transport position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPosition {
    /// Absolute position in user clocks.
    pub user_clock: u64,
    /// Whole beats, `user_clock / clocks_per_beat`.
    pub beat: u64,
    /// Whole measures, `beat / beats_per_measure`.
    pub measure: u64,
    /// Absolute position in MIDI clocks (24 per beat).
    pub midi_clock: u64,
    /// Position in sixteenth-note units, `midi_clock / 6`.
    pub song_position: u64,
}

/// Snapshot of the engine's health counters. All values saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockDiagnostics {
    /// Ticks rejected because the previous tick was still running.
    pub tick_overruns: u32,
    /// Extra MIDI clock steps taken to catch up after late ticks.
    pub midi_clock_corrections: u32,
    /// Extra user clock steps taken to catch up after late ticks.
    pub user_clock_corrections: u32,
    /// Accumulator runaways that forced a phase reset.
    pub forced_resets: u32,
    /// Signal callbacks that fired past their armed clock.
    pub signal_overflows: u32,
    /// Panics absorbed by the tick shield.
    pub faults: u32,
}
