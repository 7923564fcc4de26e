//! Real-time MIDI timing core.
//!
//! Provides virtual clocks driven by a millisecond tick, incoming-clock
//! tempo estimation, and a realtime-safe receive pipeline with pooled
//! event records.
//!
//! # Features
//!
//! - **Virtual clocks**: a 24-pulse MIDI clock and a user-resolution
//!   clock advanced together by [`ClockEngine::tick`]
//! - **Transport**: start, stop, continue, and song-position seeks with
//!   the matching wire messages
//! - **Tempo estimation**: smoothed BPM from incoming clock pulses, with
//!   gap and jitter handling
//! - **Receive pipeline**: byte decoding, per-kind filters, remap rules,
//!   low-latency echo, and note-off durations
//! - **Event pool**: recycled message records so the steady state never
//!   allocates
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use beatclock::{ClockConfig, ClockEngine, EventPool, InputPipeline, wire_channel};
//!
//! let (sink, wire) = wire_channel();
//! let mut engine = ClockEngine::new(ClockConfig::default())?;
//! engine.set_sink(Arc::new(sink));
//!
//! let pool = Arc::new(EventPool::new());
//! let mut pipeline = InputPipeline::new(Arc::clone(&pool));
//! let handle = pipeline.handle();
//!
//! // Driver timer, once per millisecond:
//! engine.tick();
//!
//! // Driver receive callback:
//! pipeline.on_packet(&[0x90, 60, 100], now_ms);
//!
//! // Any other thread:
//! let records = handle.drain();
//! for msg in &records {
//!     println!("{:?} at {} ms", msg.kind, msg.timestamp_ms);
//! }
//! pool.release(records);
//! # Ok::<(), beatclock::Error>(())
//! ```

// Error types
pub mod error;
pub use error::{Error, Result};

// Message records and wire encoding
pub mod event;
pub use event::{
    MessageList, MidiKind, MidiMessage, WireMessage, CLOCKS_PER_SONG_POSITION,
    MIDI_CLOCKS_PER_BEAT,
};

// Virtual clocks and transport
pub mod clock;
pub use clock::{
    ClockConfig, ClockDiagnostics, ClockEngine, ClockEvent, ClockHandle, ClockListener,
    ClockPosition, DEFAULT_CLOCKS_PER_BEAT, MAX_TEMPO_BPM, MIN_TEMPO_BPM,
};

// Incoming-clock tempo estimation
pub mod tempo;
pub use tempo::{TempoConfig, TempoEstimator, TempoReadout, TempoSnapshot};

// Receive pipeline
pub mod input;
pub use input::{
    FilterRules, InputPipeline, MapEvent, MapRules, PipelineDiagnostics, PipelineHandle,
};

// Event pool
pub mod pool;
pub use pool::{EventPool, DEFAULT_POOL_CAPACITY};

// Output sinks
pub mod output;
pub use output::{
    wire_channel, wire_channel_with_capacity, FnSink, NullSink, OutputSink, WireReceiver, WireSink,
};

pub(crate) mod rt;
