//! Dual virtual clocks driven by a 1 ms tick.
//!
//! One engine advances two pulse trains from the same tempo: the MIDI
//! clock at the standard 24 pulses per beat, and the user clock at an
//! arbitrary resolution for schedulers that want finer grain. Fractional
//! accumulators carry the sub-millisecond remainder, so long sessions do
//! not drift no matter how awkward the pulse width is.
//!
//! The engine is single-owner: exactly one thread calls [`ClockEngine::tick`],
//! normally from a 1 ms timer or an audio callback sliced to milliseconds.
//! Everything cross-thread goes through the lock-free [`ClockHandle`].

mod control;

pub use control::{ClockDiagnostics, ClockHandle, ClockPosition};

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{
    WireMessage, CLOCKS_PER_SONG_POSITION, MIDI_CLOCKS_PER_BEAT, STATUS_CLOCK, STATUS_CONTINUE,
    STATUS_START, STATUS_STOP,
};
use crate::output::OutputSink;
use crate::rt;

use control::ClockControl;

/// Slowest tempo the engine accepts.
pub const MIN_TEMPO_BPM: f64 = 20.0;
/// Fastest tempo the engine accepts.
pub const MAX_TEMPO_BPM: f64 = 300.0;
/// Default user clock resolution.
pub const DEFAULT_CLOCKS_PER_BEAT: u32 = 96;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Catch-up steps allowed in one tick before the accumulator is declared
/// runaway and its phase reset.
const MAX_CLOCK_CATCH_UP: u32 = 100;

/// Static clock engine configuration.
///
/// Tempo and resolution can change later through [`ClockHandle`]; meter
/// and the initial sync gate are fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Initial tempo in beats per minute.
    pub bpm: f64,
    /// User clock resolution in clocks per beat.
    pub clocks_per_beat: u32,
    /// Beats per measure, used for position readouts.
    pub beats_per_measure: u32,
    /// Whether wire output starts enabled.
    pub midi_sync: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            clocks_per_beat: DEFAULT_CLOCKS_PER_BEAT,
            beats_per_measure: 4,
            midi_sync: true,
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.bpm.is_finite() || !(MIN_TEMPO_BPM..=MAX_TEMPO_BPM).contains(&self.bpm) {
            return Err(Error::InvalidTempo(self.bpm));
        }
        if self.clocks_per_beat == 0 {
            return Err(Error::InvalidResolution(self.clocks_per_beat));
        }
        if self.beats_per_measure == 0 {
            return Err(Error::InvalidMeter(self.beats_per_measure));
        }
        Ok(())
    }
}

/// What the clock listener observes, in emission order.
///
/// A listener that sees `Pulse { midi_clock: n }` has already seen every
/// transport event that logically precedes pulse `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    Started,
    Stopped,
    Continued,
    Pulse { midi_clock: u64 },
}

/// Observer for transport events and MIDI clock pulses.
///
/// Called synchronously from the tick path: implementations must not
/// block or allocate. Any `FnMut(ClockEvent) + Send` closure qualifies.
pub trait ClockListener: Send {
    fn on_clock(&mut self, event: ClockEvent);
}

impl<F: FnMut(ClockEvent) + Send> ClockListener for F {
    fn on_clock(&mut self, event: ClockEvent) {
        self(event)
    }
}

/// The tick-driven timing engine.
///
/// Owns all mutable timing state; see [`ClockHandle`] for the cross-thread
/// control surface and the module docs for the threading contract.
pub struct ClockEngine {
    control: Arc<ClockControl>,
    bpm: f64,
    /// Tempo accepted from the handle but not yet applied; lands on the
    /// next MIDI clock boundary while the transport runs.
    pending_bpm: Option<f64>,
    clocks_per_beat: u32,
    ms_per_midi_clock: f64,
    ms_per_user_clock: f64,
    midi_accum: f64,
    user_accum: f64,
    midi_clock: u64,
    user_clock: u64,
    started: bool,
    sending_clocks: bool,
    listener: Option<Box<dyn ClockListener>>,
    signal: Option<Box<dyn FnMut(u64) + Send>>,
    sink: Option<Arc<dyn OutputSink>>,
}

impl ClockEngine {
    pub fn new(config: ClockConfig) -> Result<Self> {
        config.validate()?;
        let control = Arc::new(ClockControl::new(&config));
        let mut engine = Self {
            control,
            bpm: config.bpm,
            pending_bpm: None,
            clocks_per_beat: config.clocks_per_beat,
            ms_per_midi_clock: 0.0,
            ms_per_user_clock: 0.0,
            midi_accum: 0.0,
            user_accum: 0.0,
            midi_clock: 0,
            user_clock: 0,
            started: false,
            sending_clocks: true,
            listener: None,
            signal: None,
            sink: None,
        };
        engine.recompute_widths();
        Ok(engine)
    }

    /// Cloneable lock-free controller for this engine.
    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Installs the pulse and transport observer.
    pub fn set_listener<L: ClockListener + 'static>(&mut self, listener: L) {
        self.listener = Some(Box::new(listener));
    }

    /// Installs the one-shot signal callback; it receives the user clock
    /// at which it fired. Arm it through
    /// [`ClockHandle::set_next_signal_clock`].
    pub fn set_signal<F: FnMut(u64) + Send + 'static>(&mut self, signal: F) {
        self.signal = Some(Box::new(signal));
    }

    /// Installs the wire output sink shared with the rest of the system.
    pub fn set_sink(&mut self, sink: Arc<dyn OutputSink>) {
        self.sink = Some(sink);
    }

    #[inline]
    pub fn user_clock(&self) -> u64 {
        self.user_clock
    }

    #[inline]
    pub fn midi_clock(&self) -> u64 {
        self.midi_clock
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[inline]
    pub fn tempo_bpm(&self) -> f64 {
        self.bpm
    }

    /// Advances the engine by one millisecond.
    ///
    /// Never blocks, allocates, or panics outward; a panic in a callback
    /// is absorbed and counted, and a tick arriving while the previous one
    /// still runs is counted as an overrun and skipped.
    pub fn tick(&mut self) {
        let control = Arc::clone(&self.control);
        if !control.enabled.load(Ordering::Acquire) {
            return;
        }
        if control.in_tick.swap(true, Ordering::AcqRel) {
            control.tick_overruns.bump();
            return;
        }
        rt::shield(&control.faults, || self.tick_inner());
        control.in_tick.store(false, Ordering::Release);
    }

    fn tick_inner(&mut self) {
        self.intake_requests();
        if self.apply_transport_flags() {
            // A transport edge owns this tick: restart both pulse phases
            // so the first width after the edge is a full one.
            self.midi_accum = 0.0;
            self.user_accum = 0.0;
            if let Some(bpm) = self.pending_bpm.take() {
                self.apply_tempo(bpm);
            }
        } else {
            if !self.started {
                // No pulse boundary to wait for; take the tempo now.
                if let Some(bpm) = self.pending_bpm.take() {
                    self.apply_tempo(bpm);
                }
            }
            self.advance_midi_clock();
            self.advance_user_clock();
        }
        self.check_signal();
    }

    fn intake_requests(&mut self) {
        let c = Arc::clone(&self.control);
        if c.bpm_pending.swap(false, Ordering::AcqRel) {
            let bpm = c.bpm_request.load(Ordering::Acquire);
            self.pending_bpm = Some(bpm.clamp(MIN_TEMPO_BPM, MAX_TEMPO_BPM));
        }
        if c.resolution_pending.swap(false, Ordering::AcqRel) {
            let cpb = c.resolution_request.load(Ordering::Acquire).max(1);
            if cpb != self.clocks_per_beat {
                self.clocks_per_beat = cpb;
                c.clocks_per_beat.store(cpb, Ordering::Release);
                self.recompute_widths();
            }
        }
        if c.seek_pending.swap(false, Ordering::AcqRel) {
            let target = c.seek_target.load(Ordering::Acquire);
            self.apply_seek(target);
        }
    }

    /// Consumes pending transport edges in fixed order: start, stop,
    /// continue. Returns true if any edge was applied.
    fn apply_transport_flags(&mut self) -> bool {
        let c = Arc::clone(&self.control);
        let mut applied = false;
        if c.start_pending.swap(false, Ordering::AcqRel) {
            self.apply_start();
            applied = true;
        }
        if c.stop_pending.swap(false, Ordering::AcqRel) {
            self.apply_stop(c.stop_halts_clocks.load(Ordering::Acquire));
            applied = true;
        }
        if c.continue_pending.swap(false, Ordering::AcqRel) {
            let send_position = c.continue_sends_position.load(Ordering::Acquire);
            // Continue is only meaningful from a stopped transport.
            if !self.started {
                self.apply_continue(send_position);
                applied = true;
            }
        }
        applied
    }

    fn apply_start(&mut self) {
        self.started = true;
        self.sending_clocks = true;
        self.midi_clock = 0;
        self.user_clock = 0;
        self.publish_transport();
        self.publish_position();
        self.send_transport(WireMessage::realtime(STATUS_START));
        self.notify(ClockEvent::Started);
        // One clock goes out immediately: receivers treat the first pulse
        // after a start as "now", and the transport sits at pulse zero
        // until a full width has elapsed.
        self.send_clock();
        self.notify(ClockEvent::Pulse { midi_clock: 0 });
        debug!(bpm = self.bpm, "transport start");
    }

    fn apply_stop(&mut self, halt_clocks: bool) {
        self.started = false;
        if halt_clocks {
            self.sending_clocks = false;
        }
        self.publish_transport();
        self.send_transport(WireMessage::realtime(STATUS_STOP));
        self.notify(ClockEvent::Stopped);
        debug!(halt_clocks, "transport stop");
    }

    fn apply_continue(&mut self, send_song_position: bool) {
        if send_song_position {
            // Realign receivers before the continue edge.
            let units = self.midi_clock / CLOCKS_PER_SONG_POSITION as u64;
            self.send_transport(WireMessage::song_position((units & 0x3FFF) as u16));
        }
        self.started = true;
        self.sending_clocks = true;
        self.publish_transport();
        self.send_transport(WireMessage::realtime(STATUS_CONTINUE));
        self.notify(ClockEvent::Continued);
        debug!("transport continue");
    }

    fn apply_seek(&mut self, target: u64) {
        // Round down to the song-position quantum so the MIDI clock and
        // a wire song-position pointer can express the same spot.
        let quantum = (self.clocks_per_beat / 4).max(1) as u64;
        let user = target - (target % quantum);
        self.user_clock = user;
        self.midi_clock = user * MIDI_CLOCKS_PER_BEAT as u64 / self.clocks_per_beat as u64;
        self.midi_accum = 0.0;
        self.user_accum = 0.0;
        self.publish_position();
        debug!(requested = target, user_clock = user, "seek");
    }

    fn apply_tempo(&mut self, bpm: f64) {
        self.bpm = bpm;
        self.recompute_widths();
        self.control.bpm.store(bpm, Ordering::Release);
        debug!(bpm, "tempo applied");
    }

    fn recompute_widths(&mut self) {
        self.ms_per_midi_clock = MS_PER_MINUTE / (self.bpm * MIDI_CLOCKS_PER_BEAT as f64);
        self.ms_per_user_clock = MS_PER_MINUTE / (self.bpm * self.clocks_per_beat as f64);
    }

    fn advance_midi_clock(&mut self) {
        self.midi_accum += 1.0;
        if self.midi_accum < self.ms_per_midi_clock {
            return;
        }
        self.midi_accum -= self.ms_per_midi_clock;
        self.step_midi_clock();
        let mut caught_up = 0u32;
        while self.midi_accum >= self.ms_per_midi_clock {
            caught_up += 1;
            if caught_up > MAX_CLOCK_CATCH_UP {
                self.midi_accum = 0.0;
                self.control.forced_resets.bump();
                warn!("midi clock accumulator runaway, phase reset");
                break;
            }
            self.midi_accum -= self.ms_per_midi_clock;
            self.step_midi_clock();
            self.control.midi_corrections.bump();
        }
    }

    fn step_midi_clock(&mut self) {
        if self.started {
            self.midi_clock += 1;
            self.control
                .midi_clock
                .store(self.midi_clock, Ordering::Release);
        }
        self.send_clock();
        self.notify(ClockEvent::Pulse {
            midi_clock: self.midi_clock,
        });
        // Pulse boundary: the deferred tempo may land now.
        if let Some(bpm) = self.pending_bpm.take() {
            self.apply_tempo(bpm);
        }
    }

    fn advance_user_clock(&mut self) {
        self.user_accum += 1.0;
        if self.user_accum < self.ms_per_user_clock {
            return;
        }
        self.user_accum -= self.ms_per_user_clock;
        self.step_user_clock();
        let mut caught_up = 0u32;
        while self.user_accum >= self.ms_per_user_clock {
            caught_up += 1;
            if caught_up > MAX_CLOCK_CATCH_UP {
                self.user_accum = 0.0;
                self.control.forced_resets.bump();
                warn!("user clock accumulator runaway, phase reset");
                break;
            }
            self.user_accum -= self.ms_per_user_clock;
            self.step_user_clock();
            self.control.user_corrections.bump();
        }
    }

    fn step_user_clock(&mut self) {
        if self.started {
            self.user_clock += 1;
            self.control
                .user_clock
                .store(self.user_clock, Ordering::Release);
        }
    }

    fn check_signal(&mut self) {
        let target = self.control.signal_clock.load(Ordering::Acquire);
        if target == 0 || self.user_clock < target {
            return;
        }
        if self.user_clock > target {
            self.control.signal_overflows.bump();
        }
        // Disarm, unless the controller re-armed concurrently.
        let _ = self.control.signal_clock.compare_exchange(
            target,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let fired_at = self.user_clock;
        if let Some(signal) = self.signal.as_mut() {
            signal(fired_at);
        }
    }

    fn send_clock(&mut self) {
        if self.sending_clocks && self.control.midi_sync.load(Ordering::Acquire) {
            if let Some(sink) = &self.sink {
                sink.send(WireMessage::realtime(STATUS_CLOCK));
            }
        }
    }

    fn send_transport(&mut self, msg: WireMessage) {
        if self.control.midi_sync.load(Ordering::Acquire) {
            if let Some(sink) = &self.sink {
                sink.send(msg);
            }
        }
    }

    fn notify(&mut self, event: ClockEvent) {
        if let Some(listener) = self.listener.as_mut() {
            listener.on_clock(event);
        }
    }

    fn publish_transport(&mut self) {
        self.control.started.store(self.started, Ordering::Release);
        self.control
            .sending_clocks
            .store(self.sending_clocks, Ordering::Release);
    }

    fn publish_position(&mut self) {
        self.control
            .user_clock
            .store(self.user_clock, Ordering::Release);
        self.control
            .midi_clock
            .store(self.midi_clock, Ordering::Release);
    }
}

impl fmt::Debug for ClockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockEngine")
            .field("bpm", &self.bpm)
            .field("clocks_per_beat", &self.clocks_per_beat)
            .field("user_clock", &self.user_clock)
            .field("midi_clock", &self.midi_clock)
            .field("started", &self.started)
            .finish()
    }
}
