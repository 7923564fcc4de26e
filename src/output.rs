//! Output seam for wire messages leaving the timing core.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

use crate::event::WireMessage;
use crate::rt::Counter;

/// Default capacity for the wire output ring buffer
const DEFAULT_CAPACITY: usize = 256;

/// Delivery seam for outgoing wire messages.
///
/// `send` is called from the tick and receive hot paths, so implementations
/// must not block, allocate, or panic; when a message cannot be delivered,
/// drop it and account for it.
pub trait OutputSink: Send + Sync {
    fn send(&self, msg: WireMessage);
}

/// Discards everything. Useful when clock output is disabled but the
/// wiring expects a sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    #[inline]
    fn send(&self, _msg: WireMessage) {}
}

/// Adapter turning a closure into a sink, mainly for tests and embedding.
pub struct FnSink<F: Fn(WireMessage) + Send + Sync>(F);

impl<F: Fn(WireMessage) + Send + Sync> FnSink<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F: Fn(WireMessage) + Send + Sync> OutputSink for FnSink<F> {
    #[inline]
    fn send(&self, msg: WireMessage) {
        (self.0)(msg)
    }
}

/// Sink half of a wire channel.
///
/// The clock engine and the echo path may share one sink, so pushes onto
/// the SPSC ring go through a try-lock. Contention or a full ring drops
/// the message and bumps a counter instead of stalling the caller.
pub struct WireSink {
    producer: Mutex<HeapProd<WireMessage>>,
    dropped: Counter,
}

impl WireSink {
    /// Messages dropped because the ring was full or the producer was
    /// momentarily contended.
    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }
}

impl OutputSink for WireSink {
    #[inline]
    fn send(&self, msg: WireMessage) {
        match self.producer.try_lock() {
            Some(mut producer) => {
                if producer.try_push(msg).is_err() {
                    self.dropped.bump();
                }
            }
            None => self.dropped.bump(),
        }
    }
}

/// Receiver half of a wire channel, owned by the device writer thread.
pub struct WireReceiver {
    consumer: HeapCons<WireMessage>,
}

impl WireReceiver {
    /// Pop a single message
    #[inline]
    pub fn pop(&mut self) -> Option<WireMessage> {
        self.consumer.try_pop()
    }

    /// Drain all pending messages into a vector
    pub fn drain_all(&mut self) -> Vec<WireMessage> {
        let count = self.consumer.occupied_len();
        let mut messages = Vec::with_capacity(count);
        while let Some(msg) = self.consumer.try_pop() {
            messages.push(msg);
        }
        messages
    }

    /// Check if there are pending messages
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.consumer.is_empty()
    }

    /// Get number of pending messages
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.consumer.occupied_len()
    }
}

/// Create a new wire output channel
pub fn wire_channel() -> (WireSink, WireReceiver) {
    wire_channel_with_capacity(DEFAULT_CAPACITY)
}

/// Create a new wire output channel with specified capacity
pub fn wire_channel_with_capacity(capacity: usize) -> (WireSink, WireReceiver) {
    let rb = HeapRb::new(capacity);
    let (producer, consumer) = rb.split();
    (
        WireSink {
            producer: Mutex::new(producer),
            dropped: Counter::new(),
        },
        WireReceiver { consumer },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{STATUS_CLOCK, STATUS_START};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_channel_send_and_drain() {
        let (sink, mut receiver) = wire_channel();
        sink.send(WireMessage::realtime(STATUS_START));
        sink.send(WireMessage::realtime(STATUS_CLOCK));
        let messages = receiver.drain_all();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status(), STATUS_START);
        assert_eq!(messages[1].status(), STATUS_CLOCK);
        assert!(!receiver.has_pending());
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_capacity_overflow_drops_and_counts() {
        let (sink, mut receiver) = wire_channel_with_capacity(4);
        for _ in 0..6 {
            sink.send(WireMessage::realtime(STATUS_CLOCK));
        }
        assert_eq!(sink.dropped(), 2);
        assert_eq!(receiver.pending_count(), 4);
        // Draining frees space for the next burst.
        receiver.drain_all();
        sink.send(WireMessage::realtime(STATUS_CLOCK));
        assert_eq!(receiver.pending_count(), 1);
        assert_eq!(sink.dropped(), 2);
    }

    #[test]
    fn test_fn_sink_forwards() {
        let hits = AtomicUsize::new(0);
        let sink = FnSink::new(|msg: WireMessage| {
            assert_eq!(msg.status(), STATUS_CLOCK);
            hits.fetch_add(1, Ordering::Relaxed);
        });
        sink.send(WireMessage::realtime(STATUS_CLOCK));
        sink.send(WireMessage::realtime(STATUS_CLOCK));
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
