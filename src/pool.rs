//! Pooled allocation for MIDI message records.
//!
//! Records cycle between the pool's free list and the [`MessageList`]
//! batches handed to consumers. Steady state performs no heap allocation:
//! `acquire` pops a recycled record and only falls back to the global
//! allocator while the working set is still growing.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::event::{MessageList, MidiMessage};

/// Records preallocated by [`EventPool::default`].
pub const DEFAULT_POOL_CAPACITY: usize = 256;

#[derive(Default)]
struct FreeList {
    head: Option<Box<MidiMessage>>,
    len: usize,
}

/// Recycling allocator for [`MidiMessage`] records.
///
/// Shared between the receive path (`acquire`) and the consumer thread
/// (`release`); both sides touch the free list only inside a short lock.
pub struct EventPool {
    free: Mutex<FreeList>,
    live: AtomicUsize,
    high_water: AtomicUsize,
    allocated: AtomicUsize,
}

impl EventPool {
    /// Creates an empty pool that grows on demand.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(FreeList::default()),
            live: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Creates a pool with `capacity` records already on the free list, so
    /// a sized workload never allocates after construction.
    pub fn with_capacity(capacity: usize) -> Self {
        let pool = Self::new();
        {
            let mut free = pool.free.lock();
            for _ in 0..capacity {
                let mut node = Box::new(MidiMessage::blank());
                node.next = free.head.take();
                free.head = Some(node);
            }
            free.len = capacity;
        }
        pool.allocated.store(capacity, Ordering::Relaxed);
        pool
    }

    /// Takes a blank record, recycling one from the free list when possible.
    pub fn acquire(&self) -> Box<MidiMessage> {
        let recycled = {
            let mut free = self.free.lock();
            free.head.take().map(|mut node| {
                free.head = node.next.take();
                free.len -= 1;
                node
            })
        };
        let node = match recycled {
            Some(mut node) => {
                // Recycled records keep their allocation, not their contents.
                *node = MidiMessage::blank();
                node
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::new(MidiMessage::blank())
            }
        };
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(live, Ordering::Relaxed);
        node
    }

    /// Returns a whole batch to the free list in one splice.
    ///
    /// Counters assume records come back to the pool they were acquired
    /// from; mixing pools skews `live` and `free_len`, nothing worse.
    pub fn release(&self, mut batch: MessageList) {
        let count = batch.len();
        let mut tail: *mut MidiMessage = match batch.head.as_deref_mut() {
            Some(head) => head,
            None => return,
        };
        // SAFETY: `tail` always points at a node owned by `batch`, and the
        // chain is not mutated while we walk it.
        unsafe {
            while let Some(next) = (*tail).next.as_deref_mut() {
                tail = next;
            }
        }
        let head = batch.head.take();
        batch.len = 0;
        {
            let mut free = self.free.lock();
            // SAFETY: `tail` is the last node of the chain rooted at `head`,
            // which we now own; linking the old free head after it keeps
            // every node reachable exactly once.
            unsafe {
                (*tail).next = free.head.take();
            }
            free.head = head;
            free.len += count;
        }
        self.live.fetch_sub(count, Ordering::Relaxed);
    }

    /// Releases a single detached record, e.g. one popped off a batch.
    pub fn release_one(&self, msg: Box<MidiMessage>) {
        let mut batch = MessageList::new();
        batch.push_front(msg);
        self.release(batch);
    }

    /// Records currently on the free list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len
    }

    /// Records currently held by consumers or in flight.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Peak of [`EventPool::live`] over the pool's lifetime.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Total records ever allocated, preallocation included. Stops growing
    /// once the working set is covered.
    pub fn allocated_total(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("free_len", &self.free_len())
            .field("live", &self.live())
            .field("high_water", &self.high_water())
            .field("allocated_total", &self.allocated_total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start_allocates_on_demand() {
        let pool = EventPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.allocated_total(), 2);
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.free_len(), 0);
        pool.release_one(a);
        pool.release_one(b);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_preallocated_pool_does_not_allocate() {
        let pool = EventPool::with_capacity(4);
        assert_eq!(pool.free_len(), 4);
        let mut batch = MessageList::new();
        for _ in 0..4 {
            batch.push_front(pool.acquire());
        }
        assert_eq!(pool.allocated_total(), 4, "acquire must recycle, not allocate");
        assert_eq!(pool.free_len(), 0);
        pool.release(batch);
        assert_eq!(pool.free_len(), 4);
    }

    #[test]
    fn test_recycled_records_come_back_blank() {
        let pool = EventPool::with_capacity(1);
        let mut msg = pool.acquire();
        msg.data1 = 99;
        msg.timestamp_ms = 1234;
        msg.duration_ms = 55;
        pool.release_one(msg);
        let again = pool.acquire();
        assert_eq!(again.data1, 0);
        assert_eq!(again.timestamp_ms, 0);
        assert_eq!(again.duration_ms, 0);
    }

    #[test]
    fn test_release_splices_whole_batch() {
        let pool = EventPool::new();
        let mut batch = MessageList::new();
        for _ in 0..8 {
            batch.push_front(pool.acquire());
        }
        pool.release(batch);
        assert_eq!(pool.free_len(), 8);
        assert_eq!(pool.live(), 0);
        // Every record is reachable again.
        for _ in 0..8 {
            let _ = pool.acquire();
        }
        assert_eq!(pool.allocated_total(), 8);
    }

    #[test]
    fn test_allocation_reaches_fixpoint() {
        let pool = EventPool::new();
        for _ in 0..10 {
            let mut batch = MessageList::new();
            for _ in 0..16 {
                batch.push_front(pool.acquire());
            }
            pool.release(batch);
        }
        assert_eq!(
            pool.allocated_total(),
            16,
            "steady-state traffic must stop allocating after the first burst"
        );
        assert_eq!(pool.high_water(), 16);
    }

    #[test]
    fn test_release_empty_batch_is_noop() {
        let pool = EventPool::with_capacity(2);
        pool.release(MessageList::new());
        assert_eq!(pool.free_len(), 2);
        assert_eq!(pool.live(), 0);
    }
}
