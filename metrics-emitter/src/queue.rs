use std::collections::VecDeque;

use bytes::Bytes;

/// A formatted payload waiting to be written to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    seq: u64,
    payload: Bytes,
}

impl QueueEntry {
    /// Returns the position of this entry in submission order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the formatted payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Unbounded FIFO of formatted payloads.
///
/// Submitting a metric only ever enqueues, regardless of the state of the transport: the queue absorbs bursts while
/// disconnected and is drained once the transport becomes writable again. Nothing is dropped on disconnection, only
/// an explicit [`clear`][DeliveryQueue::clear] discards entries.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
}

impl DeliveryQueue {
    /// Creates an empty `DeliveryQueue`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload, returning its sequence number.
    pub fn enqueue(&mut self, payload: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueueEntry { seq, payload });
        seq
    }

    /// Hands entries to `sink` in order, until the queue is empty or `sink` rejects an entry.
    ///
    /// An entry is consumed when `sink` returns `true`. The first rejected entry stays at the head of the queue,
    /// along with everything behind it.
    ///
    /// Returns the number of entries consumed.
    pub fn drain<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let mut consumed = 0;
        while let Some(entry) = self.entries.front() {
            if !sink(entry) {
                break;
            }

            self.entries.pop_front();
            consumed += 1;
        }
        consumed
    }

    /// Moves every entry out into a new queue, leaving this one empty.
    ///
    /// Sequence numbering continues where it left off, so entries enqueued afterwards still sort after the ones
    /// taken.
    pub fn take(&mut self) -> DeliveryQueue {
        DeliveryQueue { entries: std::mem::take(&mut self.entries), next_seq: self.next_seq }
    }

    /// Puts entries previously obtained through [`take`][DeliveryQueue::take] back in front of this queue.
    pub fn restore(&mut self, mut earlier: DeliveryQueue) {
        if earlier.entries.is_empty() {
            return;
        }

        earlier.entries.append(&mut self.entries);
        self.entries = earlier.entries;
    }

    /// Discards every entry, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no queued entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
