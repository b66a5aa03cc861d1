//! Replay transmit queue.
//!
//! Holds cache positions, not packet copies. Entries whose position fell out
//! of the cache window, or whose body was pruned, are skipped when the radio
//! drains the queue.

use std::collections::VecDeque;

use replay_core::Packet;

use crate::cache::{Cursor, ReplayCache};

pub const TX_QUEUE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("replay transmit queue full ({0} entries)")]
pub struct QueueFull(pub usize);

#[derive(Debug)]
pub struct TxQueue {
    entries: VecDeque<Cursor>,
    capacity: usize,
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new(TX_QUEUE_SIZE)
    }
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, cursor: Cursor) -> bool {
        self.entries.contains(&cursor)
    }

    /// Queue `cursor`. Already queued is success.
    pub fn push(&mut self, cursor: Cursor) -> Result<(), QueueFull> {
        if self.contains(cursor) {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(QueueFull(self.capacity));
        }
        self.entries.push_back(cursor);
        Ok(())
    }

    /// The next sendable packet, discarding dead entries in front of it.
    pub fn peek<'c>(&mut self, cache: &'c ReplayCache) -> Option<&'c Packet> {
        while let Some(&cursor) = self.entries.front() {
            match cache.get(cursor).and_then(|slot| slot.body.as_ref()) {
                Some(body) => return Some(body),
                None => {
                    tracing::debug!(cursor, tail = cache.tail(), "dropping dead replay queue entry");
                    self.entries.pop_front();
                }
            }
        }
        None
    }

    pub fn pop(&mut self, cache: &ReplayCache) -> Option<Packet> {
        let packet = self.peek(cache).cloned();
        if packet.is_some() {
            self.entries.pop_front();
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::HeapPool;
    use replay_core::config::CacheConfig;
    use replay_core::{NodeId, Priority};

    fn filled(n: u32) -> (ReplayCache, HeapPool) {
        let mut pool = HeapPool::new(1 << 24);
        let mut cache = ReplayCache::new(&CacheConfig::default());
        for id in 0..n {
            cache.adopt(&Packet::new(NodeId(1), id, Priority::DEFAULT, &b"x"[..]), &mut pool);
        }
        (cache, pool)
    }

    #[test]
    fn push_is_idempotent_and_bounded() {
        let mut q = TxQueue::new(2);
        q.push(1).unwrap();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.push(3), Err(QueueFull(2)));
    }

    #[test]
    fn pop_is_fifo() {
        let (cache, _pool) = filled(4);
        let mut q = TxQueue::default();
        q.push(2).unwrap();
        q.push(0).unwrap();
        assert_eq!(q.pop(&cache).unwrap().id, 2);
        assert_eq!(q.pop(&cache).unwrap().id, 0);
        assert!(q.pop(&cache).is_none());
    }

    #[test]
    fn dead_entries_are_skipped() {
        let (mut cache, mut pool) = filled(6);
        let mut q = TxQueue::default();
        q.push(0).unwrap();
        q.push(1).unwrap();
        q.push(5).unwrap();

        cache.truncate(5, &mut pool); // position 0 falls out of the window
        cache.prune(4, &mut pool); // position 1 loses its body

        assert_eq!(q.peek(&cache).unwrap().id, 5);
        assert_eq!(q.len(), 1);
    }
}
