//! Outbound ASDU queues.
//!
//! Two tiers with different pressure behaviour:
//!
//! - [`MessageQueue`]: the persistent low-priority event ring. Entries
//!   carry a timestamp and a three-way state so an activating connection
//!   can resume delivery where a dead one left off. When full, the oldest
//!   entries are evicted to make room; enqueueing never fails.
//! - [`HighPrioQueue`]: the transient ring for command responses. No
//!   states, no timestamps; enqueueing fails when full and the caller
//!   drops or retries.
//!
//! Both store entries contiguously in a fixed circular byte buffer with
//! three cursors: `first` (oldest live entry), `last` (newest) and
//! `last_in_buffer`, the wrap marker - the last entry before the physical
//! end of the buffer, after which the ring continues at offset zero.

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::apci::ASDU_IN_FRAME_MAX;

// timestamp u64 + state u8 + size u8
const ENTRY_HEADER_SIZE: usize = 10;

const HIGH_PRIO_HEADER_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Free,
    Waiting,
    SentUnconfirmed,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryState::Waiting,
            2 => EntryState::SentUnconfirmed,
            _ => EntryState::Free,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EntryState::Free => 0,
            EntryState::Waiting => 1,
            EntryState::SentUnconfirmed => 2,
        }
    }
}

/// Opaque reference to a low-priority queue entry handed out by
/// [`MessageQueue::next_waiting`] and consumed by
/// [`MessageQueue::mark_confirmed`].
///
/// The timestamp doubles as the staleness check: a handle whose entry was
/// evicted in the meantime is older than everything still in the queue
/// and the confirmation is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    offset: usize,
    timestamp: u64,
}

impl EntryHandle {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

struct MessageQueueInner {
    buffer: Box<[u8]>,
    entry_counter: usize,
    first: Option<usize>,
    last: Option<usize>,
    last_in_buffer: Option<usize>,
    oldest_timestamp: u64,
}

/// Low-priority persistent ASDU ring. See the module docs.
pub struct MessageQueue {
    inner: Mutex<MessageQueueInner>,
}

impl MessageQueueInner {
    fn read_header(&self, offset: usize) -> (u64, EntryState, usize) {
        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&self.buffer[offset..offset + 8]);

        (
            u64::from_le_bytes(timestamp_bytes),
            EntryState::from_u8(self.buffer[offset + 8]),
            self.buffer[offset + 9] as usize,
        )
    }

    fn write_header(&mut self, offset: usize, timestamp: u64, state: EntryState, size: usize) {
        self.buffer[offset..offset + 8].copy_from_slice(&timestamp.to_le_bytes());
        self.buffer[offset + 8] = state.as_u8();
        self.buffer[offset + 9] = size as u8;
    }

    fn write_state(&mut self, offset: usize, state: EntryState) {
        self.buffer[offset + 8] = state.as_u8();
    }

    /// Offset of the entry following `offset`, honouring the wrap marker.
    fn next_offset(&self, offset: usize) -> usize {
        if Some(offset) == self.last_in_buffer {
            0
        } else {
            let (_, _, size) = self.read_header(offset);
            offset + ENTRY_HEADER_SIZE + size
        }
    }
}

impl MessageQueue {
    /// A queue sized for `max_entries` full-length ASDUs. Shorter ASDUs
    /// pack tighter, so the entry capacity is a lower bound.
    pub fn new(max_entries: usize) -> Self {
        let size = max_entries * (ENTRY_HEADER_SIZE + 256);

        debug!(size, "event queue buffer allocated");

        Self {
            inner: Mutex::new(MessageQueueInner {
                buffer: vec![0; size].into_boxed_slice(),
                entry_counter: 0,
                first: None,
                last: None,
                last_in_buffer: None,
                oldest_timestamp: 0,
            }),
        }
    }

    /// Appends an ASDU, evicting from the oldest end until it fits. Only
    /// an ASDU too large for any frame is refused.
    pub fn enqueue(&self, asdu_bytes: &[u8], now_ms: u64) {
        if asdu_bytes.len() > ASDU_IN_FRAME_MAX {
            warn!(size = asdu_bytes.len(), "ASDU too large, not queued");
            return;
        }

        let entry_size = ENTRY_HEADER_SIZE + asdu_bytes.len();

        let q = &mut *self.inner.lock().unwrap();

        let mut next = if q.entry_counter == 0 {
            q.first = Some(0);
            q.oldest_timestamp = now_ms;
            q.last_in_buffer = Some(0);
            0
        } else {
            let last = q.last.expect("cursors set while entries exist");
            let (_, _, size) = q.read_header(last);
            last + ENTRY_HEADER_SIZE + size
        };

        if next + entry_size > q.buffer.len() {
            next = 0;
            q.last_in_buffer = q.last;
        }

        if q.entry_counter > 0 {
            let mut first = q.first.expect("cursors set while entries exist");

            if next <= first {
                // Evict oldest entries until the new one fits.
                while next + entry_size > first && q.entry_counter > 0 {
                    if Some(first) != q.last {
                        if Some(first) != q.last_in_buffer {
                            first = q.next_offset(first);
                            q.entry_counter -= 1;
                            let (timestamp, _, _) = q.read_header(first);
                            q.oldest_timestamp = timestamp;
                        } else {
                            // The survivors wrapped; the region up to the
                            // old end is free now.
                            first = 0;
                            let (timestamp, _, _) = q.read_header(first);
                            q.oldest_timestamp = timestamp;
                            q.entry_counter -= 1;
                            break;
                        }
                    } else {
                        // Evicting the final entry resets the ring to
                        // just the incoming one.
                        first = next;
                        q.oldest_timestamp = now_ms;
                        q.last_in_buffer = Some(next);
                        q.entry_counter = 0;
                    }
                }
            } else {
                q.last_in_buffer = Some(next);
            }

            q.first = Some(first);
        }

        q.last = Some(next);
        q.entry_counter += 1;

        q.write_header(next, now_ms, EntryState::Waiting, asdu_bytes.len());
        let data_start = next + ENTRY_HEADER_SIZE;
        q.buffer[data_start..data_start + asdu_bytes.len()].copy_from_slice(asdu_bytes);

        debug!(
            entries = q.entry_counter,
            offset = next,
            size = asdu_bytes.len(),
            "ASDU queued"
        );
    }

    /// Finds the oldest entry still waiting for transmission, flips it to
    /// sent-but-unconfirmed and copies its payload into `out`. Returns
    /// the confirmation handle and the payload size.
    pub fn next_waiting(&self, out: &mut [u8]) -> Option<(EntryHandle, usize)> {
        let q = &mut *self.inner.lock().unwrap();

        if q.entry_counter == 0 {
            return None;
        }

        let mut offset = q.first.expect("cursors set while entries exist");
        let (mut timestamp, mut state, mut size) = q.read_header(offset);

        while state != EntryState::Waiting {
            if Some(offset) == q.last {
                break;
            }

            offset = q.next_offset(offset);
            let header = q.read_header(offset);
            timestamp = header.0;
            state = header.1;
            size = header.2;
        }

        if state != EntryState::Waiting {
            return None;
        }

        q.write_state(offset, EntryState::SentUnconfirmed);

        let data_start = offset + ENTRY_HEADER_SIZE;
        out[..size].copy_from_slice(&q.buffer[data_start..data_start + size]);

        Some((EntryHandle { offset, timestamp }, size))
    }

    /// Confirms a previously dequeued entry. A handle older than the
    /// oldest live entry refers to an evicted slot and is ignored.
    pub fn mark_confirmed(&self, handle: EntryHandle) {
        let q = &mut *self.inner.lock().unwrap();

        if q.entry_counter > 0 && handle.timestamp >= q.oldest_timestamp {
            q.write_state(handle.offset, EntryState::Free);
        }
    }

    /// Flips every sent-but-unconfirmed entry back to waiting, so the
    /// next connection to activate retransmits them. Called when an
    /// active connection is torn down.
    pub fn revert_unconfirmed_to_waiting(&self) {
        let q = &mut *self.inner.lock().unwrap();

        if q.entry_counter == 0 {
            return;
        }

        let mut offset = q.first.expect("cursors set while entries exist");

        loop {
            let (_, state, _) = q.read_header(offset);

            if state == EntryState::SentUnconfirmed {
                q.write_state(offset, EntryState::Waiting);
            }

            if Some(offset) == q.last {
                break;
            }

            offset = q.next_offset(offset);
        }
    }

    /// Empties the queue.
    pub fn release_all(&self) {
        let q = &mut *self.inner.lock().unwrap();

        q.first = None;
        q.last = None;
        q.last_in_buffer = None;
        q.entry_counter = 0;
    }

    pub fn is_asdu_available(&self) -> bool {
        self.inner.lock().unwrap().entry_counter > 0
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entry_counter
    }
}

struct HighPrioQueueInner {
    buffer: Box<[u8]>,
    entry_counter: usize,
    first: Option<usize>,
    last: Option<usize>,
    last_in_buffer: Option<usize>,
}

/// Transient high-priority ASDU ring. See the module docs.
pub struct HighPrioQueue {
    inner: Mutex<HighPrioQueueInner>,
}

impl HighPrioQueueInner {
    fn read_size(&self, offset: usize) -> usize {
        u16::from_le_bytes([self.buffer[offset], self.buffer[offset + 1]]) as usize
    }
}

impl HighPrioQueue {
    pub fn new(max_entries: usize) -> Self {
        let size = max_entries * (HIGH_PRIO_HEADER_SIZE + 256);

        Self {
            inner: Mutex::new(HighPrioQueueInner {
                buffer: vec![0; size].into_boxed_slice(),
                entry_counter: 0,
                first: None,
                last: None,
                last_in_buffer: None,
            }),
        }
    }

    /// Appends an ASDU. Returns false when it does not fit; high-priority
    /// messages are transient and the caller drops them under pressure.
    pub fn enqueue(&self, asdu_bytes: &[u8]) -> bool {
        if asdu_bytes.len() > ASDU_IN_FRAME_MAX {
            warn!(size = asdu_bytes.len(), "ASDU too large, not queued");
            return false;
        }

        let entry_size = HIGH_PRIO_HEADER_SIZE + asdu_bytes.len();

        let q = &mut *self.inner.lock().unwrap();

        let mut next = if q.entry_counter == 0 {
            q.first = Some(0);
            q.last_in_buffer = Some(0);
            0
        } else {
            let last = q.last.expect("cursors set while entries exist");
            last + HIGH_PRIO_HEADER_SIZE + q.read_size(last)
        };

        if next + entry_size > q.buffer.len() {
            next = 0;
            q.last_in_buffer = q.last;
        }

        if q.entry_counter > 0 {
            let first = q.first.expect("cursors set while entries exist");

            if next <= first {
                if next + entry_size > first {
                    return false;
                }
            } else {
                q.last_in_buffer = Some(next);
            }
        }

        q.last = Some(next);
        q.entry_counter += 1;

        q.buffer[next..next + 2].copy_from_slice(&(asdu_bytes.len() as u16).to_le_bytes());
        let data_start = next + HIGH_PRIO_HEADER_SIZE;
        q.buffer[data_start..data_start + asdu_bytes.len()].copy_from_slice(asdu_bytes);

        debug!(
            entries = q.entry_counter,
            offset = next,
            size = asdu_bytes.len(),
            "ASDU queued (high priority)"
        );

        true
    }

    /// Pops the oldest entry into `out`, returning its size.
    pub fn next(&self, out: &mut [u8]) -> Option<usize> {
        let q = &mut *self.inner.lock().unwrap();

        if q.entry_counter == 0 {
            return None;
        }

        let first = q.first.expect("cursors set while entries exist");
        let size = q.read_size(first);

        let data_start = first + HIGH_PRIO_HEADER_SIZE;
        out[..size].copy_from_slice(&q.buffer[data_start..data_start + size]);

        q.entry_counter -= 1;

        if q.entry_counter == 0 {
            q.first = None;
            q.last = None;
            q.last_in_buffer = None;
        } else if Some(first) == q.last_in_buffer {
            q.first = Some(0);
            q.last_in_buffer = q.last;
        } else {
            q.first = Some(first + HIGH_PRIO_HEADER_SIZE + size);
        }

        Some(size)
    }

    /// Whether an entry of worst-case size would be refused. Used by the
    /// readiness probe handlers see.
    pub fn is_full(&self) -> bool {
        let entry_size = HIGH_PRIO_HEADER_SIZE + ASDU_IN_FRAME_MAX;

        let q = &*self.inner.lock().unwrap();

        if q.entry_counter == 0 {
            return false;
        }

        let last = q.last.expect("cursors set while entries exist");
        let mut next = last + HIGH_PRIO_HEADER_SIZE + q.read_size(last);

        if next + entry_size > q.buffer.len() {
            next = 0;
        }

        let first = q.first.expect("cursors set while entries exist");

        next <= first && next + entry_size > first
    }

    pub fn is_asdu_available(&self) -> bool {
        self.inner.lock().unwrap().entry_counter > 0
    }

    /// Drops everything. Invoked when a connection binds the queue and on
    /// STARTDT, so a newly active master does not receive responses to a
    /// predecessor's commands.
    pub fn reset(&self) {
        let q = &mut *self.inner.lock().unwrap();

        q.first = None;
        q.last = None;
        q.last_in_buffer = None;
        q.entry_counter = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entry_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8, size: usize) -> Vec<u8> {
        let mut bytes = vec![tag; size];
        bytes[0] = tag;
        bytes
    }

    fn drain_tags(queue: &MessageQueue) -> Vec<u8> {
        let mut out = [0u8; 256];
        let mut tags = Vec::new();

        while let Some((_, size)) = queue.next_waiting(&mut out) {
            assert!(size > 0);
            tags.push(out[0]);
        }

        tags
    }

    #[test]
    fn fifo_order() {
        let queue = MessageQueue::new(4);

        for tag in 0..3u8 {
            queue.enqueue(&payload(tag, 20), 1000 + tag as u64);
        }

        assert_eq!(queue.entry_count(), 3);
        assert_eq!(drain_tags(&queue), vec![0, 1, 2]);

        // Everything is sent-but-unconfirmed now.
        let mut out = [0u8; 256];
        assert!(queue.next_waiting(&mut out).is_none());
    }

    #[test]
    fn eviction_under_pressure() {
        // Full-length ASDUs make every entry slot-sized: a 16-slot queue
        // holds exactly 16 of them and the 17th starts evicting.
        let queue = MessageQueue::new(16);

        for tag in 0..20u8 {
            queue.enqueue(&payload(tag, 250), 1000 + tag as u64);
        }

        assert_eq!(queue.entry_count(), 16);
        assert_eq!(drain_tags(&queue), (4..20).collect::<Vec<u8>>());
    }

    #[test]
    fn wrap_preserves_order_with_mixed_sizes() {
        let queue = MessageQueue::new(4);

        for round in 0..5u8 {
            for lane in 0..3u8 {
                let tag = round * 3 + lane;
                queue.enqueue(&payload(tag, 100 + lane as usize * 60), tag as u64);
            }
        }

        let tags = drain_tags(&queue);

        // Whatever survived must be the newest entries, in order.
        assert!(!tags.is_empty());
        let oldest = tags[0];
        assert_eq!(
            tags,
            (oldest..15).collect::<Vec<u8>>(),
            "survivors must be a contiguous newest suffix"
        );
    }

    #[test]
    fn confirmation_frees_entry() {
        let queue = MessageQueue::new(4);

        queue.enqueue(&payload(1, 30), 100);
        queue.enqueue(&payload(2, 30), 101);

        let mut out = [0u8; 256];
        let (handle, _) = queue.next_waiting(&mut out).unwrap();

        queue.mark_confirmed(handle);

        // The confirmed entry is skipped; the second one comes out next.
        let (_, _) = queue.next_waiting(&mut out).unwrap();
        assert_eq!(out[0], 2);
    }

    #[test]
    fn stale_handle_is_ignored() {
        let queue = MessageQueue::new(2);

        queue.enqueue(&payload(1, 250), 100);
        let mut out = [0u8; 256];
        let (handle, _) = queue.next_waiting(&mut out).unwrap();

        // Push the first entry out of the ring.
        for tag in 2..5u8 {
            queue.enqueue(&payload(tag, 250), 200 + tag as u64);
        }

        // The handle's timestamp (100) is now older than everything in
        // the queue; confirming must not touch live entries.
        queue.mark_confirmed(handle);

        assert_eq!(drain_tags(&queue), vec![3, 4]);
    }

    #[test]
    fn revert_restores_waiting_state() {
        let queue = MessageQueue::new(4);

        queue.enqueue(&payload(1, 30), 100);
        queue.enqueue(&payload(2, 30), 101);

        let mut out = [0u8; 256];
        queue.next_waiting(&mut out).unwrap();
        queue.next_waiting(&mut out).unwrap();
        assert!(queue.next_waiting(&mut out).is_none());

        queue.revert_unconfirmed_to_waiting();

        assert_eq!(drain_tags(&queue), vec![1, 2]);
    }

    #[test]
    fn release_all_empties() {
        let queue = MessageQueue::new(4);

        queue.enqueue(&payload(1, 30), 100);
        queue.release_all();

        assert_eq!(queue.entry_count(), 0);
        assert!(!queue.is_asdu_available());

        let mut out = [0u8; 256];
        assert!(queue.next_waiting(&mut out).is_none());
    }

    #[test]
    fn high_prio_fails_when_full() {
        let queue = HighPrioQueue::new(2);

        assert!(queue.enqueue(&payload(1, 250)));
        assert!(queue.enqueue(&payload(2, 250)));
        assert!(!queue.enqueue(&payload(3, 250)));

        let mut out = [0u8; 256];
        assert_eq!(queue.next(&mut out), Some(250));
        assert_eq!(out[0], 1);

        // Popping makes room again.
        assert!(queue.enqueue(&payload(4, 250)));

        assert_eq!(queue.next(&mut out), Some(250));
        assert_eq!(out[0], 2);
        assert_eq!(queue.next(&mut out), Some(250));
        assert_eq!(out[0], 4);
        assert_eq!(queue.next(&mut out), None);
    }

    #[test]
    fn high_prio_reset_discards() {
        let queue = HighPrioQueue::new(2);

        queue.enqueue(&payload(1, 10));
        queue.enqueue(&payload(2, 10));
        queue.reset();

        assert!(!queue.is_asdu_available());
        let mut out = [0u8; 256];
        assert_eq!(queue.next(&mut out), None);
    }

    #[test]
    fn high_prio_wraps() {
        let queue = HighPrioQueue::new(4);
        let mut out = [0u8; 256];

        // Interleave pushes and pops so the ring wraps a few times.
        let mut expected = 0u8;
        let mut tag = 0u8;

        for _ in 0..4 {
            queue.enqueue(&payload(tag, 200));
            tag += 1;
        }

        for _ in 0..12 {
            assert_eq!(queue.next(&mut out), Some(200));
            assert_eq!(out[0], expected);
            expected += 1;

            queue.enqueue(&payload(tag, 200));
            tag += 1;
        }
    }
}
