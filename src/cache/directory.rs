//! Ordered directory of cached pages plus the dirty-page table.
//!
//! The page map is ordered so the flusher can walk physically adjacent pages
//! and iterate per-file sub-ranges. Point operations hold the map lock only
//! briefly; iteration re-seeks by key, so no lock is ever held across I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::pointer::CachePointer;
use crate::types::{Lsn, PageKey};

pub struct PageDirectory {
    pages: RwLock<BTreeMap<PageKey, Arc<CachePointer>>>,
    exclusive_keys: RwLock<BTreeSet<PageKey>>,
    /// Earliest LSN that dirtied each page; drained wholesale by the flusher.
    dirty: Mutex<HashMap<PageKey, Lsn>>,
    write_cache_size: AtomicI64,
    exclusive_size: AtomicI64,
    not_flushed_pages: AtomicI64,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(BTreeMap::new()),
            exclusive_keys: RwLock::new(BTreeSet::new()),
            dirty: Mutex::new(HashMap::new()),
            write_cache_size: AtomicI64::new(0),
            exclusive_size: AtomicI64::new(0),
            not_flushed_pages: AtomicI64::new(0),
        }
    }

    pub fn get(&self, key: &PageKey) -> Option<Arc<CachePointer>> {
        self.pages.read().get(key).cloned()
    }

    pub fn insert(&self, key: PageKey, pointer: Arc<CachePointer>) {
        self.pages.write().insert(key, pointer);
    }

    pub fn remove(&self, key: &PageKey) -> Option<Arc<CachePointer>> {
        self.pages.write().remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    pub fn first_entry(&self) -> Option<(PageKey, Arc<CachePointer>)> {
        self.pages
            .read()
            .iter()
            .next()
            .map(|(key, pointer)| (*key, Arc::clone(pointer)))
    }

    pub fn first_entry_at_or_after(&self, key: PageKey) -> Option<(PageKey, Arc<CachePointer>)> {
        self.pages
            .read()
            .range(key..)
            .next()
            .map(|(key, pointer)| (*key, Arc::clone(pointer)))
    }

    pub fn entry_after(&self, key: PageKey) -> Option<(PageKey, Arc<CachePointer>)> {
        self.pages
            .read()
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(key, pointer)| (*key, Arc::clone(pointer)))
    }

    /// Next page of `file_id` strictly after `cursor` (or the file's first
    /// page when `cursor` is `None`).
    pub fn first_in_file_after(
        &self,
        file_id: u32,
        cursor: Option<PageKey>,
    ) -> Option<(PageKey, Arc<CachePointer>)> {
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(PageKey::new(file_id, 0)),
        };
        let upper = Bound::Included(PageKey::new(file_id, u64::MAX));
        self.pages
            .read()
            .range((lower, upper))
            .next()
            .map(|(key, pointer)| (*key, Arc::clone(pointer)))
    }

    pub fn add_exclusive_key(&self, key: PageKey) {
        self.exclusive_keys.write().insert(key);
    }

    pub fn remove_exclusive_key(&self, key: &PageKey) {
        self.exclusive_keys.write().remove(key);
    }

    /// Next exclusive key strictly after `cursor`, or the smallest one when
    /// `cursor` is `None`. The flusher uses this to walk the set as a ring.
    pub fn next_exclusive_key(&self, cursor: Option<PageKey>) -> Option<PageKey> {
        let keys = self.exclusive_keys.read();
        match cursor {
            Some(key) => keys
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .copied(),
            None => keys.iter().next().copied(),
        }
    }

    pub fn exclusive_key_count(&self) -> usize {
        self.exclusive_keys.read().len()
    }

    /// Records the LSN that first dirtied `key`; later marks are ignored.
    pub fn mark_dirty_if_absent(&self, key: PageKey, lsn: Lsn) {
        self.dirty.lock().entry(key).or_insert(lsn);
    }

    pub fn remove_dirty(&self, key: &PageKey) {
        self.dirty.lock().remove(key);
    }

    /// Hands the whole shared dirty table to the flusher.
    pub fn drain_dirty(&self) -> HashMap<PageKey, Lsn> {
        std::mem::take(&mut *self.dirty.lock())
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn write_cache_size(&self) -> i64 {
        self.write_cache_size.load(Ordering::Acquire)
    }

    pub fn inc_write_cache_size(&self) {
        self.write_cache_size.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_write_cache_size(&self) {
        self.write_cache_size.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn exclusive_size(&self) -> i64 {
        self.exclusive_size.load(Ordering::Acquire)
    }

    pub fn inc_exclusive_size(&self) {
        self.exclusive_size.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_exclusive_size(&self) {
        self.exclusive_size.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn not_flushed_pages(&self) -> i64 {
        self.not_flushed_pages.load(Ordering::Acquire)
    }

    pub fn inc_not_flushed(&self) {
        self.not_flushed_pages.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_not_flushed(&self) {
        self.not_flushed_pages.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn pointer(pool: &Arc<BufferPool>, file_id: u32, page_index: u64) -> Arc<CachePointer> {
        Arc::new(CachePointer::new(
            pool.acquire(true),
            Arc::clone(pool),
            file_id as u64,
            page_index,
        ))
    }

    #[test]
    fn iteration_is_ordered_by_key() {
        let pool = Arc::new(BufferPool::new(64, 8));
        let directory = PageDirectory::new();
        for (file, page) in [(2u32, 0u64), (1, 5), (1, 1), (2, 3)] {
            directory.insert(PageKey::new(file, page), pointer(&pool, file, page));
        }

        let mut seen = Vec::new();
        let mut cursor = directory.first_entry();
        while let Some((key, _)) = cursor {
            seen.push((key.file_id, key.page_index));
            cursor = directory.entry_after(key);
        }
        assert_eq!(seen, vec![(1, 1), (1, 5), (2, 0), (2, 3)]);
    }

    #[test]
    fn per_file_range_stops_at_file_boundary() {
        let pool = Arc::new(BufferPool::new(64, 8));
        let directory = PageDirectory::new();
        for (file, page) in [(1u32, 0u64), (1, 7), (2, 0)] {
            directory.insert(PageKey::new(file, page), pointer(&pool, file, page));
        }

        let mut cursor = None;
        let mut pages = Vec::new();
        while let Some((key, _)) = directory.first_in_file_after(1, cursor) {
            pages.push(key.page_index);
            cursor = Some(key);
        }
        assert_eq!(pages, vec![0, 7]);
    }

    #[test]
    fn dirty_marks_keep_the_first_lsn() {
        let directory = PageDirectory::new();
        let key = PageKey::new(1, 0);
        directory.mark_dirty_if_absent(key, Lsn::new(0, 5));
        directory.mark_dirty_if_absent(key, Lsn::new(0, 9));
        let drained = directory.drain_dirty();
        assert_eq!(drained.get(&key), Some(&Lsn::new(0, 5)));
        assert_eq!(directory.dirty_count(), 0);
    }

    #[test]
    fn exclusive_ring_wraps_via_none() {
        let directory = PageDirectory::new();
        directory.add_exclusive_key(PageKey::new(1, 1));
        directory.add_exclusive_key(PageKey::new(1, 9));

        let first = directory.next_exclusive_key(None).unwrap();
        assert_eq!(first, PageKey::new(1, 1));
        let second = directory.next_exclusive_key(Some(first)).unwrap();
        assert_eq!(second, PageKey::new(1, 9));
        assert!(directory.next_exclusive_key(Some(second)).is_none());
    }
}
