//! Incoming-clock tempo estimation.
//!
//! Feeds on the arrival times of MIDI clock pulses (24 per quarter note)
//! and maintains two readings: the raw averaged pulse width over a sliding
//! window, and a smoothed tempo that ignores single-pulse jitter but tracks
//! genuine tempo changes immediately.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use atomic_float::AtomicF32;
use serde::{Deserialize, Serialize};

use crate::event::MIDI_CLOCKS_PER_BEAT;

/// Tuning knobs for [`TempoEstimator`]. The defaults suit hardware
/// sequencers and DAW clock output; they rarely need changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Sliding-window length in pulses. 96 pulses is one measure of 4/4
    /// at the wire clock rate.
    pub window: usize,
    /// A pulse gap longer than this means the stream was interrupted;
    /// the bridged delta is discarded and the window restarts.
    pub gap_ms: u32,
    /// Deltas below this are startup flushes, not pulse widths.
    pub noise_floor_ms: u32,
    /// Smoothed tempo follows immediately when the instantaneous tempo
    /// differs by more than this (in tenths of a BPM).
    pub jump_threshold_x10: i32,
    /// Consecutive same-direction pulses needed before a one-tenth-BPM
    /// nudge, when the difference stays under the jump threshold.
    pub trend_threshold: i32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            window: 96,
            gap_ms: 500,
            noise_floor_ms: 5,
            jump_threshold_x10: 10,
            trend_threshold: 24,
        }
    }
}

/// Lock-free view of the estimator's current readings.
///
/// The estimator publishes here after every accepted pulse; any thread may
/// read without coordinating with the receive path.
#[derive(Debug)]
pub struct TempoReadout {
    pulse_width_ms: AtomicF32,
    smoothed_x10: AtomicI32,
}

impl TempoReadout {
    fn new() -> Self {
        Self {
            pulse_width_ms: AtomicF32::new(0.0),
            smoothed_x10: AtomicI32::new(0),
        }
    }

    fn publish(&self, pulse_width_ms: f32, smoothed_x10: i32) {
        self.pulse_width_ms.store(pulse_width_ms, Ordering::Release);
        self.smoothed_x10.store(smoothed_x10, Ordering::Release);
    }

    /// Averaged pulse width in milliseconds, 0.0 before the first reading.
    #[inline]
    pub fn pulse_width_ms(&self) -> f32 {
        self.pulse_width_ms.load(Ordering::Acquire)
    }

    /// Instantaneous tempo derived from the averaged pulse width, 0.0
    /// before the first reading.
    #[inline]
    pub fn tempo_bpm(&self) -> f32 {
        let width = self.pulse_width_ms();
        if width > 0.0 {
            60_000.0 / (width * MIDI_CLOCKS_PER_BEAT as f32)
        } else {
            0.0
        }
    }

    /// Smoothed tempo in tenths of a BPM (1205 = 120.5 BPM).
    #[inline]
    pub fn smoothed_tempo_x10(&self) -> i32 {
        self.smoothed_x10.load(Ordering::Acquire)
    }

    /// Smoothed tempo in BPM.
    #[inline]
    pub fn smoothed_tempo_bpm(&self) -> f32 {
        self.smoothed_tempo_x10() as f32 / 10.0
    }

    pub fn snapshot(&self) -> TempoSnapshot {
        TempoSnapshot {
            pulse_width_ms: self.pulse_width_ms(),
            tempo_bpm: self.tempo_bpm(),
            smoothed_tempo_x10: self.smoothed_tempo_x10(),
        }
    }
}

/// Point-in-time copy of the estimator readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoSnapshot {
    pub pulse_width_ms: f32,
    pub tempo_bpm: f32,
    pub smoothed_tempo_x10: i32,
}

/// Estimates the sender's tempo from MIDI clock arrival times.
///
/// Owned by whoever drives the receive path; readers go through the shared
/// [`TempoReadout`] instead.
pub struct TempoEstimator {
    cfg: TempoConfig,
    samples: Box<[u32]>,
    write: usize,
    active: usize,
    sum: u64,
    last_ms: Option<u64>,
    smoothed_x10: i32,
    jitter: i32,
    readout: Arc<TempoReadout>,
}

impl TempoEstimator {
    pub fn new() -> Self {
        Self::with_config(TempoConfig::default())
    }

    /// A zero-length window is bumped to one sample.
    pub fn with_config(cfg: TempoConfig) -> Self {
        let window = cfg.window.max(1);
        Self {
            cfg,
            samples: vec![0; window].into_boxed_slice(),
            write: 0,
            active: 0,
            sum: 0,
            last_ms: None,
            smoothed_x10: 0,
            jitter: 0,
            readout: Arc::new(TempoReadout::new()),
        }
    }

    /// Shared handle for reading the current estimate from other threads.
    pub fn readout(&self) -> Arc<TempoReadout> {
        Arc::clone(&self.readout)
    }

    /// Records the arrival of one MIDI clock pulse.
    ///
    /// The first pulse after construction, a reset, or a discarded delta
    /// only arms the pairing; estimates start with the second pulse.
    pub fn on_pulse(&mut self, now_ms: u64) {
        let last = match self.last_ms.replace(now_ms) {
            Some(last) => last,
            None => return,
        };
        if now_ms < last {
            // Host clock rewound underneath us; measure fresh from here.
            self.reset_window();
            return;
        }
        let delta = now_ms - last;
        if delta > self.cfg.gap_ms as u64 || delta < self.cfg.noise_floor_ms as u64 {
            // Stream interruption or startup flush, either way not a width.
            self.reset_window();
            return;
        }

        if self.active == self.samples.len() {
            self.sum -= self.samples[self.write] as u64;
        } else {
            self.active += 1;
        }
        self.samples[self.write] = delta as u32;
        self.sum += delta;
        self.write = (self.write + 1) % self.samples.len();

        let width = self.sum as f32 / self.active as f32;
        let tempo = 60_000.0 / (width * MIDI_CLOCKS_PER_BEAT as f32);
        let tempo_x10 = (tempo * 10.0).round() as i32;

        let diff = tempo_x10 - self.smoothed_x10;
        if diff.abs() > self.cfg.jump_threshold_x10 {
            self.smoothed_x10 = tempo_x10;
            self.jitter = 0;
        } else if diff > 0 {
            self.jitter += 1;
            if self.jitter > self.cfg.trend_threshold {
                self.smoothed_x10 += 1;
                self.jitter = 0;
            }
        } else if diff < 0 {
            self.jitter -= 1;
            if self.jitter < -self.cfg.trend_threshold {
                self.smoothed_x10 -= 1;
                self.jitter = 0;
            }
        } else if self.jitter != 0 {
            // Back on target: relax the trend instead of carrying it over.
            self.jitter -= self.jitter.signum();
        }

        self.readout.publish(width, self.smoothed_x10);
    }

    /// Clears the window and the pulse pairing. The last published readings
    /// stay visible until new pulses arrive.
    pub fn reset(&mut self) {
        self.reset_window();
        self.last_ms = None;
    }

    /// Samples currently contributing to the average.
    pub fn active_samples(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn pulse_width_ms(&self) -> f32 {
        self.readout.pulse_width_ms()
    }

    #[inline]
    pub fn tempo_bpm(&self) -> f32 {
        self.readout.tempo_bpm()
    }

    #[inline]
    pub fn smoothed_tempo_x10(&self) -> i32 {
        self.readout.smoothed_tempo_x10()
    }

    fn reset_window(&mut self) {
        self.write = 0;
        self.active = 0;
        self.sum = 0;
        self.jitter = 0;
    }
}

impl Default for TempoEstimator {
    fn default() -> Self {
        Self::new()
    }
}
