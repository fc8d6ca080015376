//! # Packet Queues
//!
//! Fixed-capacity FIFO of packets with priority, sequence tagging, and a
//! sent flag. Three queues exist per session side: the pending queue
//! (persists across sessions), the volatile queue (cleared at session
//! boundaries), and the event queue (the application's event stream, with
//! overwrite-oldest while disconnected).
//!
//! All operations take the queue's own lock, so producers on other tasks can
//! add packets while a session drains the queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::errors::QueueError;
use crate::packet::{sequence_mask, Packet, PacketPriority, SEQUENCE_ALL};

#[derive(Debug)]
struct QueueInner {
    entries: VecDeque<Packet>,
    capacity: usize,
    overwrite: bool,
}

/// A fixed-capacity packet FIFO.
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::with_capacity(capacity.min(64)),
                capacity,
                overwrite: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn has_packets(&self) -> bool {
        !self.is_empty()
    }

    /// Allow `add` to evict the oldest unsent packet when full. Enabled on
    /// the event queue only while no session is connected.
    pub fn enable_overwrite(&self, overwrite: bool) {
        self.inner.lock().overwrite = overwrite;
    }

    /// Append a packet. When full: reject, unless overwrite is enabled, in
    /// which case the oldest unsent packet makes room.
    pub fn add(&self, packet: Packet) -> Result<(), QueueError> {
        let mut q = self.inner.lock();
        if q.entries.len() >= q.capacity {
            if !q.overwrite {
                return Err(QueueError::Full);
            }
            match q.entries.iter().position(|p| !p.sent) {
                Some(idx) => {
                    q.entries.remove(idx);
                }
                None => return Err(QueueError::Full),
            }
        }
        q.entries.push_back(packet);
        Ok(())
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.inner.lock().entries.clear();
    }

    /// Clone of the entry at `idx` (head = 0).
    pub fn get(&self, idx: usize) -> Option<Packet> {
        self.inner.lock().entries.get(idx).cloned()
    }

    /// Flag the entry at `idx` as sent. Sent flags are monotone within a
    /// session; nothing ever clears one short of queue removal.
    pub fn mark_sent(&self, idx: usize) {
        if let Some(p) = self.inner.lock().entries.get_mut(idx) {
            p.sent = true;
        }
    }

    pub fn delete_first(&self) -> Option<Packet> {
        self.inner.lock().entries.pop_front()
    }

    /// Highest priority over all stored entries, `None` when empty.
    pub fn highest_priority(&self) -> PacketPriority {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|p| p.priority)
            .max()
            .unwrap_or(PacketPriority::None)
    }

    /// Sequence of the earliest sent entry, or `SEQUENCE_ALL` when no entry
    /// has been sent.
    pub fn first_sent_sequence(&self) -> u32 {
        let q = self.inner.lock();
        match q.entries.front() {
            Some(p) if p.sent => p.sequence,
            _ => SEQUENCE_ALL,
        }
    }

    /// True when some sent entry matches `sequence` under its own mask.
    pub fn has_sent_with_sequence(&self, sequence: u32) -> bool {
        let q = self.inner.lock();
        q.entries
            .iter()
            .take_while(|p| p.sent)
            .any(|p| p.sequence == (sequence & sequence_mask(p.seq_len)))
    }

    /// Remove acknowledged packets from the head of the queue.
    ///
    /// `SEQUENCE_ALL` removes every sent packet. A concrete sequence removes
    /// sent packets up to and including the *first* whose sequence matches
    /// under its mask: short sequence lengths wrap, so matching the first
    /// occurrence is the only safe stop. Unsent packets are never removed.
    ///
    /// Returns true when at least one packet was removed.
    pub fn acknowledge_to_sequence(&self, sequence: u32) -> bool {
        let ack_all = sequence == SEQUENCE_ALL;
        if !ack_all && !self.has_sent_with_sequence(sequence) {
            return false;
        }
        let mut q = self.inner.lock();
        let mut did_ack = false;
        loop {
            let front = match q.entries.front() {
                Some(p) if p.sent => p.clone(),
                _ => break,
            };
            q.entries.pop_front();
            did_ack = true;
            if ack_all {
                continue;
            }
            if front.sequence == SEQUENCE_ALL {
                // sequence unknown; stopping here loses nothing
                break;
            }
            if front.sequence == (sequence & sequence_mask(front.seq_len)) {
                break;
            }
        }
        did_ack
    }

    /// Remove the earliest sent packet, if any.
    pub fn acknowledge_first(&self) -> bool {
        let seq = self.first_sent_sequence();
        if seq != SEQUENCE_ALL {
            self.acknowledge_to_sequence(seq)
        } else {
            // an unsequenced head entry can still be sent and acknowledged
            let mut q = self.inner.lock();
            match q.entries.front() {
                Some(p) if p.sent => {
                    q.entries.pop_front();
                    true
                }
                _ => false,
            }
        }
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{client_packet, PacketType};

    fn event(seq: u32, seq_len: u8) -> Packet {
        Packet {
            packet_type: client_packet::FIXED_FMT_STD,
            sequence: seq & sequence_mask(seq_len),
            seq_len,
            priority: PacketPriority::Normal,
            ..Default::default()
        }
    }

    fn fill(queue: &PacketQueue, n: u32, seq_len: u8) {
        for s in 0..n {
            queue.add(event(s, seq_len)).unwrap();
        }
    }

    #[test]
    fn test_add_rejects_when_full() {
        let q = PacketQueue::new(2);
        fill(&q, 2, 1);
        assert_eq!(q.add(event(2, 1)), Err(QueueError::Full));
    }

    #[test]
    fn test_overwrite_drops_oldest_unsent() {
        let q = PacketQueue::new(3);
        fill(&q, 3, 1);
        q.mark_sent(0);
        q.enable_overwrite(true);
        q.add(event(3, 1)).unwrap();
        assert_eq!(q.len(), 3);
        // the sent head survived; sequence 1 was evicted
        assert_eq!(q.get(0).unwrap().sequence, 0);
        assert_eq!(q.get(1).unwrap().sequence, 2);
    }

    #[test]
    fn test_ack_stops_at_matching_sequence() {
        let q = PacketQueue::new(10);
        fill(&q, 6, 2);
        for i in 0..4 {
            q.mark_sent(i);
        }
        assert!(q.acknowledge_to_sequence(2));
        // head is now sequence 3; unsent 4 and 5 untouched
        assert_eq!(q.len(), 3);
        assert_eq!(q.get(0).unwrap().sequence, 3);
    }

    #[test]
    fn test_ack_never_removes_unsent() {
        let q = PacketQueue::new(10);
        fill(&q, 4, 2);
        q.mark_sent(0);
        q.mark_sent(1);
        // sequence 3 exists but was never sent
        assert!(!q.acknowledge_to_sequence(3));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_ack_all_removes_exactly_sent_prefix() {
        let q = PacketQueue::new(10);
        fill(&q, 5, 2);
        for i in 0..3 {
            q.mark_sent(i);
        }
        assert!(q.acknowledge_to_sequence(SEQUENCE_ALL));
        assert_eq!(q.len(), 2);
        assert!(!q.get(0).unwrap().sent);
    }

    #[test]
    fn test_ack_wrapped_sequence_stops_at_first_match() {
        // one-byte sequences wrap every 256 events: 300 queued events carry
        // two entries whose masked sequence is 0x20
        let q = PacketQueue::new(400);
        fill(&q, 300, 1);
        for i in 0..300 {
            q.mark_sent(i);
        }
        assert!(q.acknowledge_to_sequence(0x20));
        // events 0..=0x20 removed; head is 0x21, not the second wrap
        assert_eq!(q.len(), 300 - 0x21);
        assert_eq!(q.get(0).unwrap().sequence, 0x21);
    }

    #[test]
    fn test_first_sent_sequence() {
        let q = PacketQueue::new(4);
        fill(&q, 2, 2);
        assert_eq!(q.first_sent_sequence(), SEQUENCE_ALL);
        q.mark_sent(0);
        assert_eq!(q.first_sent_sequence(), 0);
    }

    #[test]
    fn test_acknowledge_first() {
        let q = PacketQueue::new(4);
        fill(&q, 3, 2);
        assert!(!q.acknowledge_first());
        q.mark_sent(0);
        assert!(q.acknowledge_first());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_highest_priority() {
        let q = PacketQueue::new(4);
        assert_eq!(q.highest_priority(), PacketPriority::None);
        q.add(event(0, 1)).unwrap();
        let mut high = event(1, 1);
        high.priority = PacketPriority::High;
        q.add(high).unwrap();
        assert_eq!(q.highest_priority(), PacketPriority::High);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        use std::sync::Arc;
        let q = Arc::new(PacketQueue::new(1000));
        let mut handles = Vec::new();
        for t in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for s in 0..100u32 {
                    q.add(event(t * 100 + s, 4)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 800);
    }
}
