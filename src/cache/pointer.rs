//! Reference-counted pin on one page-sized buffer.
//!
//! A pointer is held by external readers (the read cache) and by the write
//! cache itself. Both counts live in one packed atomic word so transitions of
//! the exclusivity predicate (`writers > 0 && readers == 0`) are observed
//! exactly once, no matter how increments and decrements interleave. The
//! buffer returns to its pool when both counts reach zero.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{BufferPool, PageBuffer};

/// Callback surface by which a pointer informs its cache that the page
/// crossed into or out of the "held only by the write cache" state.
pub trait WritersListener: Send + Sync {
    fn add_only_writers(&self, file_id: u64, page_index: u64);
    fn remove_only_writers(&self, file_id: u64, page_index: u64);
}

const WRITERS_MASK: u64 = 0xFFFF_FFFF;
const READER_UNIT: u64 = 1 << 32;

fn readers_of(state: u64) -> u64 {
    state >> 32
}

fn writers_of(state: u64) -> u64 {
    state & WRITERS_MASK
}

pub struct CachePointer {
    file_id: u64,
    page_index: u64,
    /// Readers in the high half, writers in the low half.
    state: AtomicU64,
    version: AtomicU64,
    in_write_cache: AtomicBool,
    not_flushed: AtomicBool,
    listener: Mutex<Option<Weak<dyn WritersListener>>>,
    buffer: RwLock<Option<PageBuffer>>,
    pool: Arc<BufferPool>,
}

impl CachePointer {
    pub fn new(
        buffer: PageBuffer,
        pool: Arc<BufferPool>,
        file_id: u64,
        page_index: u64,
    ) -> Self {
        Self {
            file_id,
            page_index,
            state: AtomicU64::new(0),
            version: AtomicU64::new(0),
            in_write_cache: AtomicBool::new(false),
            not_flushed: AtomicBool::new(false),
            listener: Mutex::new(None),
            buffer: RwLock::new(Some(buffer)),
            pool,
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    /// Current content version; bumped by every released exclusive guard.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn in_write_cache(&self) -> bool {
        self.in_write_cache.load(Ordering::Acquire)
    }

    pub fn set_in_write_cache(&self, value: bool) {
        self.in_write_cache.store(value, Ordering::Release);
    }

    pub fn not_flushed(&self) -> bool {
        self.not_flushed.load(Ordering::Acquire)
    }

    pub fn set_not_flushed(&self, value: bool) {
        self.not_flushed.store(value, Ordering::Release);
    }

    pub fn set_writers_listener(&self, listener: Weak<dyn WritersListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn detach_writers_listener(&self) {
        self.listener.lock().take();
    }

    fn fire_add_only_writers(&self) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.add_only_writers(self.file_id, self.page_index);
        }
    }

    fn fire_remove_only_writers(&self) {
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.remove_only_writers(self.file_id, self.page_index);
        }
    }

    pub fn readers_count(&self) -> u64 {
        readers_of(self.state.load(Ordering::Acquire))
    }

    pub fn writers_count(&self) -> u64 {
        writers_of(self.state.load(Ordering::Acquire))
    }

    pub fn increment_readers(&self) {
        let old = self.state.fetch_add(READER_UNIT, Ordering::AcqRel);
        if readers_of(old) == 0 && writers_of(old) > 0 {
            self.fire_remove_only_writers();
        }
    }

    pub fn decrement_readers(&self) {
        let old = self.state.fetch_sub(READER_UNIT, Ordering::AcqRel);
        debug_assert!(readers_of(old) > 0, "readers count underflow");
        let readers = readers_of(old) - 1;
        let writers = writers_of(old);
        if readers == 0 && writers > 0 {
            self.fire_add_only_writers();
        }
        if readers == 0 && writers == 0 {
            self.recycle();
        }
    }

    pub fn increment_writers(&self) {
        let old = self.state.fetch_add(1, Ordering::AcqRel);
        if writers_of(old) == 0 && readers_of(old) == 0 {
            self.fire_add_only_writers();
        }
    }

    pub fn decrement_writers(&self) {
        let old = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(writers_of(old) > 0, "writers count underflow");
        let writers = writers_of(old) - 1;
        let readers = readers_of(old);
        if writers == 0 && readers == 0 {
            self.fire_remove_only_writers();
            self.recycle();
        }
    }

    /// Returns the buffer to the pool once nobody refers to the page.
    fn recycle(&self) {
        let buffer = self.buffer.write().take();
        if let Some(buffer) = buffer {
            self.pool.release(buffer);
        }
        self.detach_writers_listener();
    }

    pub fn acquire_shared_buffer(&self) -> SharedBufferGuard<'_> {
        SharedBufferGuard {
            guard: self.buffer.read(),
        }
    }

    /// Non-blocking shared acquisition; the flusher uses it to skip pages
    /// currently under exclusive mutation.
    pub fn try_acquire_shared_buffer(&self) -> Option<SharedBufferGuard<'_>> {
        self.buffer
            .try_read()
            .map(|guard| SharedBufferGuard { guard })
    }

    pub fn acquire_exclusive_buffer(&self) -> ExclusiveBufferGuard<'_> {
        ExclusiveBufferGuard {
            guard: self.buffer.write(),
            version: &self.version,
        }
    }
}

/// Shared view of the page contents.
pub struct SharedBufferGuard<'a> {
    guard: RwLockReadGuard<'a, Option<PageBuffer>>,
}

impl Deref for SharedBufferGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_ref().expect("page buffer already recycled")
    }
}

/// Exclusive view of the page contents. Dropping the guard bumps the page
/// version, which is what makes background flushes idempotent.
pub struct ExclusiveBufferGuard<'a> {
    guard: RwLockWriteGuard<'a, Option<PageBuffer>>,
    version: &'a AtomicU64,
}

impl Deref for ExclusiveBufferGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_ref().expect("page buffer already recycled")
    }
}

impl DerefMut for ExclusiveBufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut().expect("page buffer already recycled")
    }
}

impl Drop for ExclusiveBufferGuard<'_> {
    fn drop(&mut self) {
        self.version.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct RecordingListener {
        events: PlMutex<Vec<(&'static str, u64)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: PlMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<(&'static str, u64)> {
            self.events.lock().clone()
        }
    }

    impl WritersListener for RecordingListener {
        fn add_only_writers(&self, _file_id: u64, page_index: u64) {
            self.events.lock().push(("add", page_index));
        }

        fn remove_only_writers(&self, _file_id: u64, page_index: u64) {
            self.events.lock().push(("remove", page_index));
        }
    }

    fn pointer_with_listener() -> (Arc<CachePointer>, Arc<RecordingListener>, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(256, 8));
        let pointer = Arc::new(CachePointer::new(
            pool.acquire(true),
            Arc::clone(&pool),
            7,
            3,
        ));
        let listener = RecordingListener::new();
        let weak: Weak<dyn WritersListener> =
            Arc::downgrade(&(Arc::clone(&listener) as Arc<dyn WritersListener>));
        pointer.set_writers_listener(weak);
        (pointer, listener, pool)
    }

    #[test]
    fn first_writer_without_readers_is_exclusive() {
        let (pointer, listener, _pool) = pointer_with_listener();
        pointer.increment_writers();
        assert_eq!(listener.events(), vec![("add", 3)]);

        pointer.increment_readers();
        assert_eq!(listener.events(), vec![("add", 3), ("remove", 3)]);

        pointer.decrement_readers();
        assert_eq!(listener.events(), vec![("add", 3), ("remove", 3), ("add", 3)]);
    }

    #[test]
    fn writer_alongside_readers_is_not_exclusive() {
        let (pointer, listener, _pool) = pointer_with_listener();
        pointer.increment_readers();
        pointer.increment_writers();
        assert!(listener.events().is_empty());
        pointer.decrement_writers();
        assert!(listener.events().is_empty());
        pointer.decrement_readers();
    }

    #[test]
    fn buffer_recycles_when_both_counts_reach_zero() {
        let pool = Arc::new(BufferPool::new(128, 8));
        let pointer = CachePointer::new(pool.acquire(true), Arc::clone(&pool), 1, 0);
        assert_eq!(pool.in_flight(), 1);

        pointer.increment_readers();
        pointer.increment_writers();
        pointer.decrement_writers();
        assert_eq!(pool.in_flight(), 1);
        pointer.decrement_readers();
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pointer.readers_count(), 0);
        assert_eq!(pointer.writers_count(), 0);
    }

    #[test]
    fn exclusive_guard_bumps_version() {
        let pool = Arc::new(BufferPool::new(128, 8));
        let pointer = CachePointer::new(pool.acquire(true), Arc::clone(&pool), 1, 0);
        assert_eq!(pointer.version(), 0);
        {
            let mut guard = pointer.acquire_exclusive_buffer();
            guard[0] = 0xEE;
        }
        assert_eq!(pointer.version(), 1);
        let guard = pointer.acquire_shared_buffer();
        assert_eq!(guard[0], 0xEE);
    }

    #[test]
    fn try_acquire_shared_fails_under_exclusive_guard() {
        let pool = Arc::new(BufferPool::new(128, 8));
        let pointer = CachePointer::new(pool.acquire(true), Arc::clone(&pool), 1, 0);
        let guard = pointer.acquire_exclusive_buffer();
        assert!(pointer.try_acquire_shared_buffer().is_none());
        drop(guard);
        assert!(pointer.try_acquire_shared_buffer().is_some());
    }
}
