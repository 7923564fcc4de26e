//! Receive-side MIDI pipeline: decode, filter, map, echo, queue.
//!
//! [`InputPipeline::on_packet`] is the driver-facing entry point and is
//! safe to call from a realtime receive callback: it takes no contended
//! locks, allocates only when the event pool is dry, and absorbs panics
//! from user map rules. Everything it produces lands in a pending queue
//! that any other thread drains through a [`PipelineHandle`].
//!
//! Channel-voice traffic additionally gets note pairing: a note-off is
//! matched to its oldest open note-on on the same channel and key, and
//! carries the elapsed hold time when it is queued.

mod decode;
mod filter;

pub use filter::{FilterRules, MapEvent, MapRules};

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::event::{MessageList, MidiKind, MidiMessage, WireMessage};
use crate::output::OutputSink;
use crate::pool::EventPool;
use crate::rt::{self, Counter};
use crate::tempo::{TempoConfig, TempoEstimator, TempoReadout, TempoSnapshot};

use decode::{decode_packet, DecodeStats, Decoded};

/// Open note-ons tracked at once; past this the oldest is forgotten and
/// its note-off will later report as unmatched.
const MAX_HELD_NOTES: usize = 64;

/// FIFO of queued records with O(1) append from the receive path.
struct PendingQueue {
    head: Option<Box<MidiMessage>>,
    /// Points at the last node of the chain rooted in `head`; null when
    /// the queue is empty.
    tail: *mut MidiMessage,
    len: usize,
}

// SAFETY: `tail` is either null or points into the boxed chain owned by
// `head`. Box contents have stable addresses, so moving the queue between
// threads moves the chain along with the pointer into it.
unsafe impl Send for PendingQueue {}

impl PendingQueue {
    fn new() -> Self {
        Self {
            head: None,
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    fn push(&mut self, mut msg: Box<MidiMessage>) {
        msg.next = None;
        let raw: *mut MidiMessage = &mut *msg;
        if self.tail.is_null() {
            self.head = Some(msg);
        } else {
            // SAFETY: non-null `tail` addresses the current last node,
            // which is alive inside `head`'s chain and has no successor.
            unsafe {
                (*self.tail).next = Some(msg);
            }
        }
        self.tail = raw;
        self.len += 1;
    }

    fn take(&mut self) -> MessageList {
        self.tail = ptr::null_mut();
        let len = std::mem::replace(&mut self.len, 0);
        MessageList {
            head: self.head.take(),
            len,
        }
    }
}

#[derive(Default)]
struct PipelineStats {
    decode: DecodeStats,
    receive_overruns: Counter,
    filtered: Counter,
    mapped_away: Counter,
    unmatched_note_offs: Counter,
    queued: Counter,
    faults: Counter,
}

/// Point-in-time copy of the pipeline's diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineDiagnostics {
    /// Packets dropped because another packet was still being processed.
    pub receive_overruns: u32,
    /// Data bytes with no owning status byte.
    pub stray_bytes: u32,
    /// Messages cut short by the packet end or the next status byte.
    pub truncated_messages: u32,
    /// Sysex transfers skipped.
    pub sysex_skipped: u32,
    /// Messages dropped by the filter rules.
    pub filtered: u32,
    /// Messages dropped by a map rule returning `None`.
    pub mapped_away: u32,
    /// Note-offs that found no open note-on to pair with.
    pub unmatched_note_offs: u32,
    /// Records handed to the pending queue.
    pub queued: u32,
    /// Panics absorbed by the receive shield.
    pub faults: u32,
}

/// Sized wrapper so a trait-object sink can live inside `ArcSwapOption`.
struct EchoSlot(Arc<dyn OutputSink>);

struct PipelineShared {
    queue: Mutex<PendingQueue>,
    filters: ArcSwap<FilterRules>,
    input_map: ArcSwapOption<MapRules>,
    echo_map: ArcSwapOption<MapRules>,
    echo_sink: ArcSwapOption<EchoSlot>,
    stats: PipelineStats,
    in_receive: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct HeldNote {
    channel: u8,
    key: u8,
    at_ms: u64,
}

/// Owns the receive path. Lives on (or is driven from) the MIDI input
/// thread; everyone else talks to it through a [`PipelineHandle`].
pub struct InputPipeline {
    shared: Arc<PipelineShared>,
    pool: Arc<EventPool>,
    tempo: TempoEstimator,
    held: SmallVec<[HeldNote; MAX_HELD_NOTES]>,
}

impl InputPipeline {
    pub fn new(pool: Arc<EventPool>) -> Self {
        Self::with_tempo_config(pool, TempoConfig::default())
    }

    pub fn with_tempo_config(pool: Arc<EventPool>, tempo: TempoConfig) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                queue: Mutex::new(PendingQueue::new()),
                filters: ArcSwap::new(Arc::new(FilterRules::default())),
                input_map: ArcSwapOption::empty(),
                echo_map: ArcSwapOption::empty(),
                echo_sink: ArcSwapOption::empty(),
                stats: PipelineStats::default(),
                in_receive: AtomicBool::new(false),
            }),
            pool,
            tempo: TempoEstimator::with_config(tempo),
            held: SmallVec::new(),
        }
    }

    /// Control and consumer surface, cloneable and thread-safe.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
            tempo: self.tempo.readout(),
        }
    }

    /// Shared tempo readout fed by incoming clock pulses.
    pub fn tempo_readout(&self) -> Arc<TempoReadout> {
        self.tempo.readout()
    }

    /// Feeds one receive packet through the pipeline.
    ///
    /// `now_ms` is the driver's arrival timestamp for the whole packet.
    /// It should not decrease between calls; if it does, note durations
    /// clamp to zero and the tempo estimator starts over.
    pub fn on_packet(&mut self, bytes: &[u8], now_ms: u64) {
        let shared = Arc::clone(&self.shared);
        if shared.in_receive.swap(true, Ordering::AcqRel) {
            shared.stats.receive_overruns.bump();
            debug!(len = bytes.len(), "receive packet overlapped, dropped");
            return;
        }
        rt::shield(&shared.stats.faults, || self.process_packet(bytes, now_ms));
        shared.in_receive.store(false, Ordering::Release);
    }

    /// Takes every queued record. Same as [`PipelineHandle::drain`].
    pub fn drain(&self) -> MessageList {
        self.shared.queue.lock().take()
    }

    fn process_packet(&mut self, bytes: &[u8], now_ms: u64) {
        let shared = Arc::clone(&self.shared);
        decode_packet(bytes, &shared.stats.decode, |decoded| {
            self.route(decoded, now_ms);
        });
    }

    fn route(&mut self, decoded: Decoded, now_ms: u64) {
        if decoded.kind == MidiKind::ActiveSense {
            // Keepalive chatter never leaves the decoder.
            return;
        }
        let filters = **self.shared.filters.load();
        if filters.suppresses(decoded.kind) {
            self.shared.stats.filtered.bump();
            return;
        }
        if decoded.kind.is_channel_voice() {
            self.route_channel_voice(decoded, now_ms);
        } else {
            if decoded.kind == MidiKind::Clock {
                self.tempo.on_pulse(now_ms);
            }
            self.echo_passthrough(decoded);
            self.enqueue(decoded, now_ms, 0);
        }
    }

    fn route_channel_voice(&mut self, decoded: Decoded, now_ms: u64) {
        let mut ev = MapEvent {
            kind: decoded.kind,
            channel: decoded.channel,
            data1: decoded.data1,
            data2: decoded.data2,
        };
        if let Some(map) = self.shared.input_map.load().as_deref() {
            match map.apply(ev) {
                Some(mapped) => ev = mapped,
                None => {
                    self.shared.stats.mapped_away.bump();
                    return;
                }
            }
        }
        self.echo_channel_voice(ev);
        // Note pairing works on the post-map identity, the one the
        // consumer will see.
        let mut duration_ms = 0;
        match ev.kind {
            MidiKind::NoteOn => self.hold_note(ev.channel, ev.data1, now_ms),
            MidiKind::NoteOff => duration_ms = self.release_note(ev.channel, ev.data1, now_ms),
            _ => {}
        }
        let mapped = Decoded {
            kind: ev.kind,
            channel: ev.channel,
            data1: ev.data1,
            data2: ev.data2,
        };
        self.enqueue(mapped, now_ms, duration_ms);
    }

    fn echo_channel_voice(&self, ev: MapEvent) {
        let sink = self.shared.echo_sink.load();
        if let Some(slot) = sink.as_deref() {
            let mut out = ev;
            if let Some(map) = self.shared.echo_map.load().as_deref() {
                match map.apply(out) {
                    Some(mapped) => out = mapped,
                    None => return,
                }
            }
            if let Some(wire) = WireMessage::from_parts(out.kind, out.channel, out.data1, out.data2)
            {
                slot.0.send(wire);
            }
        }
    }

    fn echo_passthrough(&self, decoded: Decoded) {
        let sink = self.shared.echo_sink.load();
        if let Some(slot) = sink.as_deref() {
            if let Some(wire) =
                WireMessage::from_parts(decoded.kind, decoded.channel, decoded.data1, decoded.data2)
            {
                slot.0.send(wire);
            }
        }
    }

    fn hold_note(&mut self, channel: u8, key: u8, now_ms: u64) {
        if self.held.len() == MAX_HELD_NOTES {
            // Oldest loses; its note-off will report as unmatched.
            self.held.remove(0);
        }
        self.held.push(HeldNote {
            channel,
            key,
            at_ms: now_ms,
        });
    }

    fn release_note(&mut self, channel: u8, key: u8, now_ms: u64) -> u32 {
        let found = self
            .held
            .iter()
            .position(|held| held.channel == channel && held.key == key);
        match found {
            Some(idx) => {
                let held = self.held.remove(idx);
                now_ms.saturating_sub(held.at_ms).min(u32::MAX as u64) as u32
            }
            None => {
                self.shared.stats.unmatched_note_offs.bump();
                0
            }
        }
    }

    fn enqueue(&mut self, decoded: Decoded, now_ms: u64, duration_ms: u32) {
        let mut msg = self.pool.acquire();
        msg.kind = decoded.kind;
        msg.channel = decoded.channel;
        msg.data1 = decoded.data1;
        msg.data2 = decoded.data2;
        msg.timestamp_ms = now_ms;
        msg.duration_ms = duration_ms;
        self.shared.queue.lock().push(msg);
        self.shared.stats.queued.bump();
    }
}

impl fmt::Debug for InputPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPipeline")
            .field("pending", &self.shared.queue.lock().len)
            .field("held_notes", &self.held.len())
            .finish()
    }
}

/// Cloneable consumer and control surface for an [`InputPipeline`].
///
/// Rule swaps are atomic and take effect per message; a packet already
/// being decoded may see both the old and the new rules across its
/// messages, never a torn rule set within one.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
    tempo: Arc<TempoReadout>,
}

impl PipelineHandle {
    /// Takes every queued record, leaving the queue empty. Hand the list
    /// back to the [`EventPool`] when done with it.
    pub fn drain(&self) -> MessageList {
        self.shared.queue.lock().take()
    }

    /// Records currently waiting to be drained.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().len
    }

    pub fn set_filters(&self, filters: FilterRules) {
        self.shared.filters.store(Arc::new(filters));
    }

    pub fn filters(&self) -> FilterRules {
        **self.shared.filters.load()
    }

    /// Remap applied to channel-voice traffic before note pairing and
    /// queueing. `None` clears it.
    pub fn set_input_map(&self, map: Option<MapRules>) {
        self.shared.input_map.store(map.map(Arc::new));
    }

    /// Extra remap applied only to the echoed copy. `None` clears it.
    pub fn set_echo_map(&self, map: Option<MapRules>) {
        self.shared.echo_map.store(map.map(Arc::new));
    }

    /// Sink receiving a low-latency echo of incoming traffic. `None`
    /// disables echo.
    pub fn set_echo_sink(&self, sink: Option<Arc<dyn OutputSink>>) {
        self.shared.echo_sink.store(sink.map(|s| Arc::new(EchoSlot(s))));
    }

    pub fn tempo(&self) -> TempoSnapshot {
        self.tempo.snapshot()
    }

    pub fn tempo_readout(&self) -> Arc<TempoReadout> {
        Arc::clone(&self.tempo)
    }

    pub fn diagnostics(&self) -> PipelineDiagnostics {
        let stats = &self.shared.stats;
        PipelineDiagnostics {
            receive_overruns: stats.receive_overruns.get(),
            stray_bytes: stats.decode.stray_bytes.get(),
            truncated_messages: stats.decode.truncated.get(),
            sysex_skipped: stats.decode.sysex_skipped.get(),
            filtered: stats.filtered.get(),
            mapped_away: stats.mapped_away.get(),
            unmatched_note_offs: stats.unmatched_note_offs.get(),
            queued: stats.queued.get(),
            faults: stats.faults.get(),
        }
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{STATUS_ACTIVE_SENSE, STATUS_CLOCK, STATUS_QUARTER_FRAME, STATUS_START};
    use crate::output::FnSink;

    fn pipeline() -> (InputPipeline, PipelineHandle, Arc<EventPool>) {
        let pool = Arc::new(EventPool::new());
        let pipeline = InputPipeline::new(Arc::clone(&pool));
        let handle = pipeline.handle();
        (pipeline, handle, pool)
    }

    fn kinds(list: &MessageList) -> Vec<MidiKind> {
        list.iter().map(|msg| msg.kind).collect()
    }

    #[test]
    fn test_note_on_queues_one_record() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100], 10);

        let list = handle.drain();
        assert_eq!(list.len(), 1);
        let msg = list.iter().next().unwrap();
        assert_eq!(msg.kind, MidiKind::NoteOn);
        assert_eq!(msg.channel, 0);
        assert_eq!(msg.data1, 60);
        assert_eq!(msg.data2, 100);
        assert_eq!(msg.timestamp_ms, 10);
        assert_eq!(msg.duration_ms, 0);
    }

    #[test]
    fn test_note_off_carries_hold_duration() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100], 1_000);
        pipeline.on_packet(&[0x80, 60, 64], 1_500);

        let list = handle.drain();
        assert_eq!(list.len(), 2);
        let off = list.iter().nth(1).unwrap();
        assert_eq!(off.kind, MidiKind::NoteOff);
        assert_eq!(off.duration_ms, 500);
    }

    #[test]
    fn test_velocity_zero_note_off_pairs_too() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100], 0);
        pipeline.on_packet(&[0x90, 60, 0], 250);

        let list = handle.drain();
        let off = list.iter().nth(1).unwrap();
        assert_eq!(off.kind, MidiKind::NoteOff);
        assert_eq!(off.duration_ms, 250);
    }

    #[test]
    fn test_stacked_notes_pair_oldest_first() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100], 100);
        pipeline.on_packet(&[0x90, 60, 100], 200);
        pipeline.on_packet(&[0x80, 60, 0], 300);
        pipeline.on_packet(&[0x80, 60, 0], 450);

        let list = handle.drain();
        let durations: Vec<u32> = list.iter().map(|msg| msg.duration_ms).collect();
        assert_eq!(durations, vec![0, 0, 200, 250]);
    }

    #[test]
    fn test_unmatched_note_off_counts_and_still_queues() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x80, 60, 0], 50);

        let list = handle.drain();
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().duration_ms, 0);
        assert_eq!(handle.diagnostics().unmatched_note_offs, 1);
    }

    #[test]
    fn test_notes_pair_per_channel() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100], 0);
        pipeline.on_packet(&[0x91, 60, 100], 100);
        // Channel 1 releases first; it must not steal channel 0's note.
        pipeline.on_packet(&[0x81, 60, 0], 400);
        pipeline.on_packet(&[0x80, 60, 0], 1_000);

        let list = handle.drain();
        let durations: Vec<u32> = list.iter().map(|msg| msg.duration_ms).collect();
        assert_eq!(durations, vec![0, 0, 300, 1_000]);
        assert_eq!(handle.diagnostics().unmatched_note_offs, 0);
    }

    #[test]
    fn test_filters_suppress_before_queue() {
        let (mut pipeline, handle, _pool) = pipeline();
        handle.set_filters(FilterRules {
            notes: true,
            ..FilterRules::default()
        });
        pipeline.on_packet(&[0x90, 60, 100, STATUS_CLOCK], 0);

        let list = handle.drain();
        assert_eq!(kinds(&list), vec![MidiKind::Clock]);
        assert_eq!(handle.diagnostics().filtered, 1);
    }

    #[test]
    fn test_input_map_rewrites_queued_records() {
        let (mut pipeline, handle, _pool) = pipeline();
        handle.set_input_map(Some(MapRules::channel_to(5)));
        pipeline.on_packet(&[0x90, 60, 100], 0);

        let list = handle.drain();
        assert_eq!(list.iter().next().unwrap().channel, 5);
    }

    #[test]
    fn test_input_map_can_drop_records() {
        let (mut pipeline, handle, _pool) = pipeline();
        handle.set_input_map(Some(MapRules::new(|_| None)));
        pipeline.on_packet(&[0x90, 60, 100], 0);

        assert!(handle.drain().is_empty());
        assert_eq!(handle.diagnostics().mapped_away, 1);
    }

    #[test]
    fn test_map_drop_skips_note_pairing() {
        let (mut pipeline, handle, _pool) = pipeline();
        // Drop note-ons only; the later note-off must come up unmatched.
        handle.set_input_map(Some(MapRules::new(|ev| {
            (ev.kind != MidiKind::NoteOn).then_some(ev)
        })));
        pipeline.on_packet(&[0x90, 60, 100], 0);
        pipeline.on_packet(&[0x80, 60, 0], 500);

        let diag = handle.diagnostics();
        assert_eq!(diag.mapped_away, 1);
        assert_eq!(diag.unmatched_note_offs, 1);
    }

    #[test]
    fn test_echo_map_applies_to_echo_only() {
        let (mut pipeline, handle, _pool) = pipeline();
        let echoed = Arc::new(Mutex::new(Vec::new()));
        let tap = Arc::clone(&echoed);
        handle.set_echo_sink(Some(Arc::new(FnSink::new(move |msg: WireMessage| {
            tap.lock().push(msg);
        }))));
        handle.set_echo_map(Some(MapRules::channel_to(9)));
        pipeline.on_packet(&[0x90, 60, 100], 0);

        let echoed = echoed.lock();
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].bytes(), &[0x99, 60, 100]);
        // The queued record keeps the original channel.
        let list = handle.drain();
        assert_eq!(list.iter().next().unwrap().channel, 0);
    }

    #[test]
    fn test_realtime_echoes_verbatim() {
        let (mut pipeline, handle, _pool) = pipeline();
        let echoed = Arc::new(Mutex::new(Vec::new()));
        let tap = Arc::clone(&echoed);
        handle.set_echo_sink(Some(Arc::new(FnSink::new(move |msg: WireMessage| {
            tap.lock().push(msg);
        }))));
        pipeline.on_packet(&[STATUS_START, STATUS_QUARTER_FRAME, 0x35], 0);

        let echoed = echoed.lock();
        assert_eq!(echoed.len(), 2);
        assert_eq!(echoed[0].bytes(), &[STATUS_START]);
        assert_eq!(echoed[1].bytes(), &[STATUS_QUARTER_FRAME, 0x35]);
    }

    #[test]
    fn test_active_sense_vanishes() {
        let (mut pipeline, handle, _pool) = pipeline();
        let echoed = Arc::new(Mutex::new(Vec::new()));
        let tap = Arc::clone(&echoed);
        handle.set_echo_sink(Some(Arc::new(FnSink::new(move |msg: WireMessage| {
            tap.lock().push(msg);
        }))));
        pipeline.on_packet(&[STATUS_ACTIVE_SENSE], 0);

        assert!(handle.drain().is_empty());
        assert!(echoed.lock().is_empty());
        assert_eq!(handle.diagnostics().queued, 0);
    }

    #[test]
    fn test_clock_pulses_feed_the_tempo_estimator() {
        let (mut pipeline, handle, _pool) = pipeline();
        for n in 0..25u64 {
            pipeline.on_packet(&[STATUS_CLOCK], n * 20);
        }

        let tempo = handle.tempo();
        assert_eq!(tempo.pulse_width_ms, 20.0);
        assert_eq!(tempo.tempo_bpm, 125.0);
        assert_eq!(handle.drain().len(), 25);
    }

    #[test]
    fn test_filtered_clock_starves_the_estimator() {
        let (mut pipeline, handle, _pool) = pipeline();
        handle.set_filters(FilterRules::block_sync());
        for n in 0..25u64 {
            pipeline.on_packet(&[STATUS_CLOCK], n * 20);
        }

        assert_eq!(handle.tempo().pulse_width_ms, 0.0);
        assert!(handle.drain().is_empty());
        assert_eq!(handle.diagnostics().filtered, 25);
    }

    #[test]
    fn test_sysex_is_counted_not_queued() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0xF0, 1, 2, 3, 0xF7, 0x90, 60, 100], 0);

        let list = handle.drain();
        assert_eq!(kinds(&list), vec![MidiKind::NoteOn]);
        assert_eq!(handle.diagnostics().sysex_skipped, 1);
    }

    #[test]
    fn test_overlapping_receive_drops_the_packet() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.shared.in_receive.store(true, Ordering::Release);
        pipeline.on_packet(&[0x90, 60, 100], 0);
        assert_eq!(handle.diagnostics().receive_overruns, 1);
        assert!(handle.drain().is_empty());

        pipeline.shared.in_receive.store(false, Ordering::Release);
        pipeline.on_packet(&[0x90, 60, 100], 0);
        assert_eq!(handle.drain().len(), 1);
    }

    #[test]
    fn test_panic_in_map_rule_is_contained() {
        let (mut pipeline, handle, _pool) = pipeline();
        let armed = AtomicBool::new(true);
        handle.set_input_map(Some(MapRules::new(move |ev| {
            if armed.swap(false, Ordering::AcqRel) {
                panic!("rule blew up");
            }
            Some(ev)
        })));

        pipeline.on_packet(&[0x90, 60, 100], 0);
        assert_eq!(handle.diagnostics().faults, 1);
        assert!(handle.drain().is_empty());

        pipeline.on_packet(&[0x90, 62, 100], 10);
        assert_eq!(handle.drain().len(), 1);
        assert_eq!(handle.diagnostics().faults, 1);
    }

    #[test]
    fn test_drained_records_recycle_through_the_pool() {
        let (mut pipeline, handle, pool) = pipeline();
        for round in 0..10u64 {
            for n in 0..16u8 {
                pipeline.on_packet(&[0x90, 60 + (n % 12), 100], round * 100 + n as u64);
            }
            pool.release(handle.drain());
        }
        assert_eq!(pool.allocated_total(), 16);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_packet_order_is_preserved() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, 100, 0xB0, 7, 90, STATUS_CLOCK], 0);

        let list = handle.drain();
        assert_eq!(
            kinds(&list),
            vec![MidiKind::NoteOn, MidiKind::ControlChange, MidiKind::Clock]
        );
    }

    #[test]
    fn test_interleaved_realtime_queues_first() {
        let (mut pipeline, handle, _pool) = pipeline();
        pipeline.on_packet(&[0x90, 60, STATUS_CLOCK, 100], 0);

        let list = handle.drain();
        assert_eq!(kinds(&list), vec![MidiKind::Clock, MidiKind::NoteOn]);
    }

    #[test]
    fn test_pending_len_tracks_queue_depth() {
        let (mut pipeline, handle, _pool) = pipeline();
        assert_eq!(handle.pending_len(), 0);
        pipeline.on_packet(&[0x90, 60, 100, 0x80, 60, 0], 0);
        assert_eq!(handle.pending_len(), 2);
        handle.drain();
        assert_eq!(handle.pending_len(), 0);
    }

    #[test]
    fn test_held_note_overflow_forgets_the_oldest() {
        let (mut pipeline, handle, _pool) = pipeline();
        // One more note-on than the tracker holds, all distinct keys.
        for n in 0..=MAX_HELD_NOTES as u8 {
            pipeline.on_packet(&[0x90, n, 100], n as u64);
        }
        // Key 0 was evicted; its off is unmatched. Key 1 still pairs.
        pipeline.on_packet(&[0x80, 0, 0], 1_000);
        pipeline.on_packet(&[0x80, 1, 0], 1_000);

        let diag = handle.diagnostics();
        assert_eq!(diag.unmatched_note_offs, 1);
        let list = handle.drain();
        let last = list.iter().last().unwrap();
        assert_eq!(last.data1, 1);
        assert_eq!(last.duration_ms, 999);
    }
}
