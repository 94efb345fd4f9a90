//! Message buffer pool.
//!
//! A size-bucketed free list of [`BitBuffer`]s keeps steady-state receive and
//! decode traffic allocation-free. The pool itself is owned by the library
//! thread; application threads return buffers through a mailbox that the
//! loop reclaims at heartbeat.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::buffer::BitBuffer;

const MIN_BUCKET_BYTES: usize = 64;
const BUCKET_COUNT: usize = 11; // 64 B .. 64 KiB

/// Size-bucketed free list. Buckets hold power-of-two capacities from 64
/// bytes up to 64 KiB; larger buffers are not retained.
pub struct MessagePool {
    buckets: Vec<Vec<BitBuffer>>,
    max_per_bucket: usize,
    mailbox_tx: Sender<BitBuffer>,
    mailbox_rx: Receiver<BitBuffer>,
}

/// Cross-thread return path into the pool.
#[derive(Clone)]
pub struct RecycleHandle {
    tx: Sender<BitBuffer>,
}

impl RecycleHandle {
    /// Queue a buffer for reclamation at the next heartbeat.
    pub fn recycle(&self, buffer: BitBuffer) {
        // A dead loop just drops the buffer.
        let _ = self.tx.send(buffer);
    }
}

impl MessagePool {
    pub fn new(max_per_bucket: usize) -> Self {
        let (mailbox_tx, mailbox_rx) = unbounded();
        MessagePool {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            max_per_bucket,
            mailbox_tx,
            mailbox_rx,
        }
    }

    /// Return path handed to application-side owners.
    pub fn handle(&self) -> RecycleHandle {
        RecycleHandle {
            tx: self.mailbox_tx.clone(),
        }
    }

    fn bucket_index(capacity: usize) -> usize {
        let capacity = capacity.max(MIN_BUCKET_BYTES).next_power_of_two();
        let index = capacity.trailing_zeros() as usize - MIN_BUCKET_BYTES.trailing_zeros() as usize;
        index.min(BUCKET_COUNT - 1)
    }

    /// Take a buffer with capacity of at least `min_capacity` bytes.
    pub fn rent(&mut self, min_capacity: usize) -> BitBuffer {
        let start = Self::bucket_index(min_capacity);
        for bucket in &mut self.buckets[start..] {
            if let Some(buf) = bucket.pop() {
                debug_assert!(buf.capacity() >= min_capacity);
                return buf;
            }
        }
        BitBuffer::with_capacity(min_capacity.max(MIN_BUCKET_BYTES).next_power_of_two())
    }

    /// Reset a buffer's cursors and shelve it for reuse. The bytes are not
    /// zeroed; the buffer's write path overwrites stale content.
    pub fn give_back(&mut self, mut buffer: BitBuffer) {
        buffer.reset();
        let capacity = buffer.capacity();
        if capacity == 0 {
            return;
        }
        // Buckets hold buffers at least as large as their label; round down
        // so rent() never under-delivers.
        let labeled = if capacity.is_power_of_two() {
            capacity
        } else {
            (capacity / 2).next_power_of_two()
        };
        let index = Self::bucket_index(labeled);
        let bucket = &mut self.buckets[index];
        if bucket.len() < self.max_per_bucket {
            bucket.push(buffer);
        }
    }

    /// Drain the cross-thread mailbox back into the buckets. Called by the
    /// loop each heartbeat. Returns the number reclaimed.
    pub fn reclaim_mailbox(&mut self) -> usize {
        let mut reclaimed = 0;
        loop {
            match self.mailbox_rx.try_recv() {
                Ok(buffer) => {
                    self.give_back(buffer);
                    reclaimed += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return reclaimed,
            }
        }
    }

    /// Buffers currently shelved.
    pub fn pooled(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_meets_minimum_capacity() {
        let mut pool = MessagePool::new(8);
        for want in [1usize, 64, 65, 1000, 1500, 40_000] {
            let buf = pool.rent(want);
            assert!(buf.capacity() >= want, "wanted {want}, got {}", buf.capacity());
        }
    }

    #[test]
    fn returned_buffer_is_reused() {
        let mut pool = MessagePool::new(8);
        let mut buf = pool.rent(1024);
        buf.write_u64(42);
        pool.give_back(buf);
        assert_eq!(pool.pooled(), 1);

        let reused = pool.rent(512);
        assert_eq!(pool.pooled(), 0);
        assert_eq!(reused.bit_length(), 0, "cursors cleared on return");
        assert!(reused.capacity() >= 1024);
    }

    #[test]
    fn bucket_cap_bounds_retention() {
        let mut pool = MessagePool::new(2);
        for _ in 0..5 {
            pool.give_back(BitBuffer::with_capacity(256));
        }
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn mailbox_reclaims_cross_thread_returns() {
        let mut pool = MessagePool::new(8);
        let handle = pool.handle();
        let worker = std::thread::spawn(move || {
            handle.recycle(BitBuffer::with_capacity(128));
            handle.recycle(BitBuffer::with_capacity(2048));
        });
        worker.join().unwrap();
        assert_eq!(pool.reclaim_mailbox(), 2);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn zero_capacity_buffers_not_shelved() {
        let mut pool = MessagePool::new(8);
        pool.give_back(BitBuffer::new());
        assert_eq!(pool.pooled(), 0);
    }
}
