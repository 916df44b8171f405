//! In-memory ring buffer: one producer, many consumers, fixed-capacity
//! broadcast of block-sized records.
//!
//! # Architecture
//!
//! The ring is a fixed-size array of `N` slots (`N >= 3`), each big
//! enough to hold one block. A single mutex plus one condition variable
//! guard the whole structure — the producer signals every waiting
//! reader on each release, and readers track their own read index so no
//! per-reader signalling is needed (`spec.md` §4.2, §5).
//!
//! Readers come in two flavours:
//!
//! - **reserved** readers (the disk writer) throttle the producer: if
//!   the producer is about to overwrite the slot a reserved reader is
//!   still sitting on, the producer blocks until that reader releases
//!   it. This bounds how far the disk writer can lag.
//! - **unreserved** readers (live subscribers) never block the
//!   producer. If the producer overtakes one, that reader is marked
//!   underflowed once, then resynced to the producer's current
//!   position on its next call.
//!
//! Consecutive gap releases with no valid block in between are
//! coalesced into a single gap event via a producer-local `in_gap` flag
//! (`spec.md` §8, "gap coalescing").
//!
//! # Memory layout
//! ```text
//! RingBuffer
//!   slots: [Slot; N]       fixed-size, allocated once at startup
//!   producer_index: usize  next slot the producer will fill
//!   in_gap: bool           producer-local gap-coalescing flag
//!   readers: Vec<Reader>   arena of reader state, indexed by ReaderId
//! ```

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Opaque handle to a reader registered with a [`RingBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderId(usize);

/// One block-sized slot plus the metadata recorded at release time.
struct Slot<T> {
    data: T,
    /// Producer-assigned sequence number of the last block written into
    /// this slot (monotonically increasing, never wraps within `u64`
    /// range for any realistic run length).
    seq: u64,
    gap: bool,
    timestamp_us: u64,
}

struct ReaderState {
    /// Next sequence number this reader wants to consume.
    next_seq: u64,
    reserved: bool,
    /// Set once when the producer has overtaken this (unreserved)
    /// reader; cleared (and the reader resynced) on the following call.
    underflowed: bool,
    /// `None` once the reader has been closed via [`RingBuffer::close_reader`].
    active: bool,
}

struct RingState<T> {
    slots: Vec<Slot<T>>,
    /// Sequence number that will be assigned to the next produced block.
    next_seq: u64,
    in_gap: bool,
    readers: Vec<ReaderState>,
}

/// Single-producer, multi-consumer ring of fixed-size blocks.
pub struct RingBuffer<T> {
    state: Mutex<RingState<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T>
where
    T: Default,
{
    /// Allocate a ring of `capacity` slots, each initialised via `T::default()`.
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity >= 3, "ring buffer must have at least 3 slots");
        let slots = (0..capacity)
            .map(|_| Slot {
                data: T::default(),
                seq: 0,
                gap: true,
                timestamp_us: 0,
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(RingState {
                slots,
                next_seq: 0,
                in_gap: false,
                readers: Vec::new(),
            }),
            cond: Condvar::new(),
            capacity,
        })
    }
}

impl<T> RingBuffer<T> {
    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new reader, initialised at the producer's current
    /// position (it will only see blocks produced from now on).
    pub fn open_reader(&self, reserved: bool) -> ReaderId {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        let next_seq = state.next_seq;
        state.readers.push(ReaderState {
            next_seq,
            reserved,
            underflowed: false,
            active: true,
        });
        ReaderId(state.readers.len() - 1)
    }

    /// Mark a reader as closed. Its slot in the reader table is not
    /// reused (arena-style, no reuse needed for this workload); a
    /// closed reader's `next_seq` no longer constrains the producer.
    pub fn close_reader(&self, reader: ReaderId) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        if let Some(r) = state.readers.get_mut(reader.0) {
            r.active = false;
        }
        self.cond.notify_all();
    }

    /// Obtain the slot index the producer should fill next, blocking
    /// only if a **reserved** reader still holds the exact slot about
    /// to be reused.
    fn get_write_slot_index(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        loop {
            let seq = state.next_seq;
            let idx = (seq as usize) % self.capacity;
            let blocked = state.readers.iter().any(|r| {
                r.active && r.reserved && seq >= self.capacity as u64 && r.next_seq <= seq - self.capacity as u64
            });
            if !blocked {
                return idx;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Release the write slot just filled (or skipped, on a gap),
    /// recording the wall-clock timestamp and advancing the producer
    /// index. Consecutive gap releases are coalesced: a gap release
    /// while already `in_gap` consumes no slot and returns `None` (no
    /// new data was written).
    ///
    /// `fill` is called with the slot to overwrite, only when this
    /// release is not a coalesced no-op.
    pub fn release_write_slot(
        &self,
        gap: bool,
        timestamp_us: u64,
        fill: impl FnOnce(&mut T),
    ) -> Option<usize> {
        let idx = self.get_write_slot_index();
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();

        if gap && state.in_gap {
            // Coalesce: no new slot consumed, no signal needed since
            // nothing observable changed.
            return None;
        }

        if !gap {
            fill(&mut state.slots[idx].data);
        }

        let seq = state.next_seq;
        state.slots[idx].seq = seq;
        state.slots[idx].gap = gap;
        state.slots[idx].timestamp_us = timestamp_us;
        state.next_seq = seq + 1;
        state.in_gap = gap;

        self.cond.notify_all();
        Some(idx)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Fetch the next block for `reader`, advancing its position. Blocks
    /// until data is available or the reader is closed. Clones the slot
    /// contents out while the mutex is held, so the return value carries
    /// no lifetime tied to an internal lock.
    pub fn get_read_slot_cloned(&self, reader: ReaderId) -> ReadOutcomeOwned<T> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        loop {
            let Some(r) = state.readers.get(reader.0) else {
                return ReadOutcomeOwned::Closed;
            };
            if !r.active {
                return ReadOutcomeOwned::Closed;
            }

            if r.underflowed {
                let resynced = state.next_seq;
                let r = &mut state.readers[reader.0];
                r.underflowed = false;
                r.next_seq = resynced;
                return ReadOutcomeOwned::Underflow;
            }

            let want = r.next_seq;
            if want >= state.next_seq {
                state = self.cond.wait(state).unwrap();
                continue;
            }

            if !r.reserved && state.next_seq.saturating_sub(want) > self.capacity as u64 {
                let r = &mut state.readers[reader.0];
                r.next_seq = state.next_seq;
                return ReadOutcomeOwned::Underflow;
            }

            let idx = (want as usize) % self.capacity;
            if state.slots[idx].seq != want {
                let r = &mut state.readers[reader.0];
                r.next_seq = state.next_seq;
                return ReadOutcomeOwned::Underflow;
            }

            state.readers[reader.0].next_seq = want + 1;

            let slot = &state.slots[idx];
            if slot.gap {
                return ReadOutcomeOwned::Gap;
            }
            return ReadOutcomeOwned::Data(slot.data.clone(), slot.timestamp_us, want);
        }
    }

    /// Non-blocking poll: returns `None` if no new data is available
    /// for `reader` right now, without waiting. Used by the transform
    /// engine's shutdown path to drain without hanging forever.
    pub fn try_get_read_slot(&self, reader: ReaderId) -> Option<ReadOutcomeOwned<T>> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        let r = state.readers.get(reader.0)?;
        if !r.active {
            return Some(ReadOutcomeOwned::Closed);
        }
        if want_has_data(&state, r) {
            drop(state);
            Some(self.get_read_slot_cloned(reader))
        } else {
            None
        }
    }

    /// Block up to `timeout` for new data; returns `None` on timeout.
    pub fn get_read_slot_timeout(&self, reader: ReaderId, timeout: Duration) -> Option<ReadOutcomeOwned<T>> {
        let deadline = Instant::now() + timeout;
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        loop {
            let r = state.readers.get(reader.0)?;
            if !r.active || r.underflowed || want_has_data(&state, r) {
                drop(state);
                return Some(self.get_read_slot_cloned(reader));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next_state, timed_out) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next_state;
            if timed_out.timed_out() && !want_has_data(&state, &state.readers[reader.0]) {
                return None;
            }
        }
    }
}

fn want_has_data<T>(state: &RingState<T>, r: &ReaderState) -> bool {
    r.next_seq < state.next_seq
}

/// Result of [`RingBuffer::get_read_slot_cloned`] and friends. The block
/// is cloned out from behind the lock so callers can hold it across
/// `.await` points.
pub enum ReadOutcomeOwned<T> {
    Data(T, u64, u64),
    Gap,
    Underflow,
    Closed,
}
