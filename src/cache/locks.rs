//! Sharded page-key locks.
//!
//! Every access to a cached page's state happens under the partition that
//! covers its key. Multi-key acquisitions must go through the batch
//! primitives: keys are sorted into their natural order and duplicate
//! partitions coalesced, which is the deadlock-avoidance contract of the
//! whole cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::types::PageKey;

pub struct PartitionedPageLocks {
    partitions: Box<[RwLock<()>]>,
    mask: usize,
}

pub enum PageLockGuard<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

pub type PageLockGuards<'a> = SmallVec<[PageLockGuard<'a>; 8]>;

impl PartitionedPageLocks {
    /// Scales the partition count with the machine, as contention does.
    pub fn new() -> Self {
        let parallelism = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        Self::with_partitions((parallelism * 8).next_power_of_two())
    }

    pub fn with_partitions(count: usize) -> Self {
        let count = count.next_power_of_two().max(2);
        let partitions = (0..count)
            .map(|_| RwLock::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            partitions,
            mask: count - 1,
        }
    }

    fn partition_of(&self, key: PageKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize & self.mask
    }

    pub fn acquire_shared(&self, key: PageKey) -> PageLockGuard<'_> {
        PageLockGuard::Shared(self.partitions[self.partition_of(key)].read())
    }

    pub fn acquire_exclusive(&self, key: PageKey) -> PageLockGuard<'_> {
        PageLockGuard::Exclusive(self.partitions[self.partition_of(key)].write())
    }

    /// Shared locks over every partition covering `keys`, acquired in key
    /// order with duplicates coalesced.
    pub fn acquire_shared_batch(&self, keys: &[PageKey]) -> PageLockGuards<'_> {
        self.acquire_batch(keys, |partition| {
            PageLockGuard::Shared(self.partitions[partition].read())
        })
    }

    /// Exclusive counterpart of [`acquire_shared_batch`].
    ///
    /// [`acquire_shared_batch`]: Self::acquire_shared_batch
    pub fn acquire_exclusive_batch(&self, keys: &[PageKey]) -> PageLockGuards<'_> {
        self.acquire_batch(keys, |partition| {
            PageLockGuard::Exclusive(self.partitions[partition].write())
        })
    }

    fn acquire_batch<'a>(
        &'a self,
        keys: &[PageKey],
        lock: impl Fn(usize) -> PageLockGuard<'a>,
    ) -> PageLockGuards<'a> {
        let mut sorted: SmallVec<[PageKey; 16]> = SmallVec::from_slice(keys);
        sorted.sort_unstable();

        let mut taken: SmallVec<[usize; 16]> = SmallVec::new();
        let mut guards = PageLockGuards::new();
        for key in sorted {
            let partition = self.partition_of(key);
            if taken.contains(&partition) {
                continue;
            }
            taken.push(partition);
            guards.push(lock(partition));
        }
        guards
    }
}

impl Default for PartitionedPageLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shared_locks_coexist() {
        let locks = PartitionedPageLocks::with_partitions(8);
        let key = PageKey::new(1, 1);
        let _a = locks.acquire_shared(key);
        let _b = locks.acquire_shared(key);
    }

    #[test]
    fn exclusive_lock_blocks_shared() {
        let locks = Arc::new(PartitionedPageLocks::with_partitions(8));
        let key = PageKey::new(1, 1);
        let guard = locks.acquire_exclusive(key);

        let acquired = Arc::new(AtomicBool::new(false));
        let locks_clone = Arc::clone(&locks);
        let flag = Arc::clone(&acquired);
        let handle = std::thread::spawn(move || {
            let _guard = locks_clone.acquire_shared(key);
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn batch_acquire_coalesces_duplicate_partitions() {
        let locks = PartitionedPageLocks::with_partitions(2);
        // With two partitions, four keys necessarily collide; the batch must
        // still acquire each partition exactly once and not self-deadlock.
        let keys = [
            PageKey::new(1, 3),
            PageKey::new(1, 0),
            PageKey::new(1, 2),
            PageKey::new(1, 1),
        ];
        let guards = locks.acquire_exclusive_batch(&keys);
        assert!(guards.len() <= 2);
    }

    #[test]
    fn concurrent_batches_do_not_deadlock() {
        let locks = Arc::new(PartitionedPageLocks::with_partitions(4));
        let mut handles = Vec::new();
        for thread_id in 0..4u64 {
            let locks = Arc::clone(&locks);
            handles.push(std::thread::spawn(move || {
                for round in 0..200u64 {
                    // Overlapping key sets presented in different orders.
                    let keys = [
                        PageKey::new(1, (thread_id + round) % 8),
                        PageKey::new(1, (thread_id * 3 + round) % 8),
                        PageKey::new(2, round % 4),
                    ];
                    let _guards = locks.acquire_exclusive_batch(&keys);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
