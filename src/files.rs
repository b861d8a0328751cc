//! Bounded container of open page files.
//!
//! Entries are registered per internal file id and opened lazily. A lease
//! pins its entry: pinned entries are never closed or evicted, which is the
//! mutual-exclusion guarantee between holding a handle and closing it.
//! Multiple leases on the same entry may coexist; all I/O is positioned, so
//! concurrent holders never race on a cursor. When the number of open
//! handles exceeds the limit, the least-recently-acquired unpinned entries
//! are closed (their paths stay registered and reopen on next use).

use std::collections::{HashMap, HashSet};
use std::io::IoSlice;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MareaError, Result};
use crate::io::PageFile;

struct FileEntry {
    id: u32,
    pins: AtomicUsize,
    file: Mutex<PageFile>,
}

struct Inner {
    entries: HashMap<u32, Arc<FileEntry>>,
    recency: LruCache<u32, ()>,
    open: HashSet<u32>,
}

pub struct OpenFiles {
    limit: usize,
    inner: Mutex<Inner>,
}

impl OpenFiles {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: LruCache::unbounded(),
                open: HashSet::new(),
            }),
        }
    }

    /// Registers a file under an internal id. Replaces nothing: registering
    /// an already-known id is a storage-usage error.
    pub fn register(&self, id: u32, file: PageFile) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(MareaError::Storage(format!(
                "file id {id} is already registered"
            )));
        }
        if file.is_open() {
            inner.open.insert(id);
        }
        inner.recency.put(id, ());
        inner.entries.insert(
            id,
            Arc::new(FileEntry {
                id,
                pins: AtomicUsize::new(0),
                file: Mutex::new(file),
            }),
        );
        Ok(())
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Pins the entry and makes sure its handle is open.
    pub fn acquire(&self, id: u32) -> Result<FileLease> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get(&id)
                .cloned()
                .ok_or_else(|| MareaError::Storage(format!("file id {id} is not registered")))?;
            entry.pins.fetch_add(1, Ordering::AcqRel);
            inner.recency.put(id, ());
            entry
        };
        // The lease exists before the open attempt so the pin is released on
        // failure.
        let lease = FileLease { entry };
        lease.entry.file.lock().ensure_open()?;

        let mut inner = self.inner.lock();
        inner.open.insert(id);
        self.evict_over_limit(&mut inner);
        Ok(lease)
    }

    fn evict_over_limit(&self, inner: &mut Inner) {
        while inner.open.len() > self.limit {
            let victim = {
                let mut found = None;
                for (&candidate, _) in inner.recency.iter().rev() {
                    if !inner.open.contains(&candidate) {
                        continue;
                    }
                    let entry = match inner.entries.get(&candidate) {
                        Some(entry) => entry,
                        None => continue,
                    };
                    if entry.pins.load(Ordering::Acquire) == 0 {
                        found = Some(Arc::clone(entry));
                        break;
                    }
                }
                found
            };
            let Some(entry) = victim else {
                // Everything open is pinned; stay over the limit until pins
                // drain.
                break;
            };
            if let Some(mut file) = entry.file.try_lock() {
                file.close();
                inner.open.remove(&entry.id);
                debug!(file_id = entry.id, "closed least recently used file");
            } else {
                // Mid-open elsewhere; it will be revisited on a later acquire.
                break;
            };
        }
    }

    /// Closes the handle of an unpinned entry.
    pub fn close(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| MareaError::Storage(format!("file id {id} is not registered")))?;
        if entry.pins.load(Ordering::Acquire) > 0 {
            return Err(MareaError::Storage(format!(
                "file id {id} cannot be closed because it is still in use"
            )));
        }
        entry.file.lock().close();
        inner.open.remove(&id);
        Ok(())
    }

    /// Unregisters an unpinned entry and hands back its file for deletion.
    pub fn remove(&self, id: u32) -> Result<Option<PageFile>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&id).cloned() else {
            return Ok(None);
        };
        if entry.pins.load(Ordering::Acquire) > 0 {
            return Err(MareaError::Storage(format!(
                "file id {id} cannot be removed because it is still in use"
            )));
        }
        inner.entries.remove(&id);
        inner.recency.pop(&id);
        inner.open.remove(&id);
        drop(inner);

        let mut file = entry.file.lock();
        let mut taken = PageFile::closed(file.path());
        std::mem::swap(&mut *file, &mut taken);
        Ok(Some(taken))
    }

    /// Current path of a registered entry, without pinning it.
    pub fn path_of(&self, id: u32) -> Option<PathBuf> {
        let entry = self.inner.lock().entries.get(&id).cloned()?;
        let path = entry.file.lock().path().to_path_buf();
        Some(path)
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }
}

/// A pinned, open file. I/O goes through the entry's own lock, so holders of
/// separate leases on one file serialize per call, not per lease.
pub struct FileLease {
    entry: Arc<FileEntry>,
}

impl FileLease {
    pub fn id(&self) -> u32 {
        self.entry.id
    }

    pub fn name(&self) -> String {
        self.entry.file.lock().name()
    }

    pub fn path(&self) -> PathBuf {
        self.entry.file.lock().path().to_path_buf()
    }

    pub fn size(&self) -> Result<u64> {
        self.entry.file.lock().size()
    }

    pub fn allocate(&self, bytes: u64) -> Result<()> {
        self.entry.file.lock().allocate(bytes)
    }

    pub fn truncate(&self, len: u64) -> Result<()> {
        self.entry.file.lock().truncate(len)
    }

    pub fn sync(&self) -> Result<()> {
        self.entry.file.lock().sync()
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.entry.file.lock().read_exact_at(offset, buf)
    }

    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.entry.file.lock().write_all_at(offset, buf)
    }

    pub fn writev_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        self.entry.file.lock().writev_at(offset, bufs)
    }

    pub fn rename_to(&self, new_path: impl Into<PathBuf>) -> Result<()> {
        self.entry.file.lock().rename_to(new_path)
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_file(dir: &std::path::Path, name: &str) -> PageFile {
        PageFile::create(dir.join(name)).unwrap()
    }

    #[test]
    fn acquire_reads_and_writes() {
        let dir = tempdir().unwrap();
        let files = OpenFiles::new(4);
        files.register(1, make_file(dir.path(), "a.dat")).unwrap();

        let lease = files.acquire(1).unwrap();
        lease.write_all_at(0, b"payload").unwrap();
        let mut buf = vec![0u8; 7];
        lease.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn exceeding_the_limit_closes_lru_entries() {
        let dir = tempdir().unwrap();
        let files = OpenFiles::new(2);
        for id in 1..=4u32 {
            files
                .register(id, make_file(dir.path(), &format!("{id}.dat")))
                .unwrap();
            // Registration leaves the freshly created handle open; close it so
            // the test controls which handles are open.
            files.close(id).unwrap();
        }

        for id in 1..=4u32 {
            drop(files.acquire(id).unwrap());
        }
        assert!(files.open_count() <= 2);

        // Entries stay usable after eviction.
        let lease = files.acquire(1).unwrap();
        lease.write_all_at(0, b"x").unwrap();
    }

    #[test]
    fn pinned_entries_survive_eviction_pressure() {
        let dir = tempdir().unwrap();
        let files = OpenFiles::new(1);
        files.register(1, make_file(dir.path(), "a.dat")).unwrap();
        files.register(2, make_file(dir.path(), "b.dat")).unwrap();
        files.close(1).unwrap();
        files.close(2).unwrap();

        let pinned = files.acquire(1).unwrap();
        let other = files.acquire(2).unwrap();
        // Both pinned: over limit, but nothing can be closed.
        assert_eq!(files.open_count(), 2);
        pinned.write_all_at(0, b"still valid").unwrap();
        drop(other);
        drop(pinned);
    }

    #[test]
    fn close_refuses_pinned_entries() {
        let dir = tempdir().unwrap();
        let files = OpenFiles::new(4);
        files.register(1, make_file(dir.path(), "a.dat")).unwrap();
        let lease = files.acquire(1).unwrap();
        assert!(matches!(files.close(1), Err(MareaError::Storage(_))));
        drop(lease);
        files.close(1).unwrap();
    }

    #[test]
    fn remove_unregisters_and_returns_file() {
        let dir = tempdir().unwrap();
        let files = OpenFiles::new(4);
        files.register(1, make_file(dir.path(), "a.dat")).unwrap();
        let mut file = files.remove(1).unwrap().unwrap();
        file.delete().unwrap();
        assert!(!files.is_registered(1));
        assert!(files.remove(1).unwrap().is_none());
        assert!(!dir.path().join("a.dat").exists());
    }
}
