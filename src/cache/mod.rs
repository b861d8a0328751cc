//! The write cache facade.
//!
//! Producers store page-sized buffers and load pages through [`WriteCache`];
//! a background flusher persists them in WAL order. File names are mapped to
//! ids by the durable registry, and all file handles live in a bounded
//! LRU-closing container.

mod directory;
mod flusher;
mod latch;
mod locks;
mod pointer;

pub use self::directory::PageDirectory;
pub use self::flusher::FlushMetrics;
pub use self::latch::ExclusiveLatch;
pub use self::locks::{PageLockGuard, PageLockGuards, PartitionedPageLocks};
pub use self::pointer::{CachePointer, ExclusiveBufferGuard, SharedBufferGuard, WritersListener};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use self::flusher::FlushExecutor;
use crate::buffer::BufferPool;
use crate::config::WriteCacheConfig;
use crate::error::{MareaError, Result};
use crate::files::OpenFiles;
use crate::io::{self, PageFile};
use crate::layout;
use crate::registry::FileRegistry;
use crate::types::{compose_file_id, internal_file_id, Lsn, PageKey};
use crate::wal::WriteAheadLog;

/// Payload of a low-disk-space notification.
#[derive(Copy, Clone, Debug)]
pub struct LowDiskSpaceInfo {
    pub free_bytes: u64,
    pub limit_bytes: u64,
}

/// Notified, on a dedicated publisher thread, when usable disk space minus
/// booked-but-unflushed pages drops under the configured floor.
pub trait LowDiskSpaceListener: Send + Sync + 'static {
    fn low_disk_space(&self, info: LowDiskSpaceInfo);
}

/// Notified when a background flush pass fails. The flusher keeps running.
pub trait BackgroundErrorListener: Send + Sync + 'static {
    fn on_background_error(&self, error: &MareaError);
}

/// Receives human-readable progress lines from the verification sweep.
pub trait VerificationProgress {
    fn on_message(&self, message: &str);
}

/// One page that failed verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageVerificationError {
    pub file_name: String,
    pub page_index: u64,
    pub magic_incorrect: bool,
    pub checksum_incorrect: bool,
}

const LOW_SPACE_QUEUE_DEPTH: usize = 16;
const VERIFY_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// State shared between the facade, the flush worker and cache pointers.
pub(crate) struct CacheShared {
    pub(crate) config: WriteCacheConfig,
    pub(crate) page_size: usize,
    pub(crate) exclusive_max_pages: u64,
    pub(crate) storage_id: u32,
    pub(crate) dir: PathBuf,
    /// The files lock: read mode for page operations and lookups, write mode
    /// for registry mutations and lifecycle operations.
    pub(crate) registry: RwLock<FileRegistry>,
    pub(crate) files: OpenFiles,
    pub(crate) locks: PartitionedPageLocks,
    pub(crate) directory: PageDirectory,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) wal: Option<Arc<dyn WriteAheadLog>>,
    pub(crate) metrics: Mutex<FlushMetrics>,
    exclusive_latch: Mutex<Option<Arc<ExclusiveLatch>>>,
    cache_overflow_count: AtomicU64,
    new_pages_added: AtomicU64,
    last_space_check: AtomicU64,
    low_space_tx: Mutex<Option<SyncSender<LowDiskSpaceInfo>>>,
    low_space_listeners: Arc<Mutex<Vec<Weak<dyn LowDiskSpaceListener>>>>,
    background_error_listeners: Mutex<Vec<Weak<dyn BackgroundErrorListener>>>,
}

impl CacheShared {
    /// Inserts a pointer into the directory and makes the write cache a
    /// writer of the page.
    fn do_put_in_cache(self: &Arc<Self>, pointer: &Arc<CachePointer>, key: PageKey) {
        self.directory.insert(key, Arc::clone(pointer));
        self.directory.inc_write_cache_size();

        let listener: Weak<dyn WritersListener> =
            Arc::downgrade(&(Arc::clone(self) as Arc<dyn WritersListener>));
        pointer.set_writers_listener(listener);
        pointer.increment_writers();
        pointer.set_in_write_cache(true);
    }

    fn load_file_content(
        self: &Arc<Self>,
        file_id: u32,
        start_page: u64,
        page_count: usize,
    ) -> Result<Option<Vec<Arc<CachePointer>>>> {
        let lease = self.files.acquire(file_id)?;
        let page_size = self.page_size as u64;
        let first_start = start_page * page_size;
        let file_size = lease.size()?;
        if file_size < first_start + page_size {
            return Ok(None);
        }

        let max_pages = ((file_size - first_start) / page_size) as usize;
        let real_count = page_count.min(max_pages);

        let mut buffers = Vec::with_capacity(real_count);
        for n in 0..real_count {
            let mut buffer = self.pool.acquire(false);
            if let Err(err) = lease.read_exact_at(first_start + n as u64 * page_size, &mut buffer)
            {
                self.pool.release(buffer);
                for stale in buffers {
                    self.pool.release(stale);
                }
                return Err(err);
            }
            buffers.push(buffer);
        }

        let external = compose_file_id(self.storage_id, file_id);
        let pointers = buffers
            .into_iter()
            .enumerate()
            .map(|(n, buffer)| {
                Arc::new(CachePointer::new(
                    buffer,
                    Arc::clone(&self.pool),
                    external,
                    start_page + n as u64,
                ))
            })
            .collect();
        Ok(Some(pointers))
    }

    pub(crate) fn release_exclusive_latch_if_low(&self) {
        let exclusive = self.directory.exclusive_size().max(0) as f64;
        let threshold = exclusive / self.exclusive_max_pages as f64;
        if threshold <= self.config.exclusive_latch_release_threshold {
            let latch = self.exclusive_latch.lock().take();
            if let Some(latch) = latch {
                latch.count_down();
                trace!("released exclusive overflow latch");
            }
        }
    }

    fn free_space_check_after_new_pages(&self, pages_added: u64) {
        let total_added = self.new_pages_added.fetch_add(pages_added, Ordering::AcqRel)
            + pages_added;
        let last_check = self.last_space_check.load(Ordering::Acquire);
        if total_added.saturating_sub(last_check) <= self.config.free_space_check_interval_pages
            && last_check != 0
        {
            return;
        }

        let free = io::usable_space(&self.dir);
        let not_flushed =
            self.directory.not_flushed_pages().max(0) as u64 * self.page_size as u64;
        if free.saturating_sub(not_flushed) < self.config.free_space_limit {
            self.publish_low_space(LowDiskSpaceInfo {
                free_bytes: free,
                limit_bytes: self.config.free_space_limit,
            });
        }
        self.last_space_check.store(total_added, Ordering::Release);
    }

    fn publish_low_space(&self, info: LowDiskSpaceInfo) {
        let tx = self.low_space_tx.lock();
        if let Some(tx) = tx.as_ref() {
            if tx.try_send(info).is_err() {
                trace!("low-disk-space event queue is full; dropping event");
            }
        }
    }

    pub(crate) fn report_background_error(&self, err: &MareaError) {
        let listeners: Vec<Arc<dyn BackgroundErrorListener>> = {
            let mut list = self.background_error_listeners.lock();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_background_error(err);
        }
    }

    pub(crate) fn log_free_space_statistics(&self) {
        let usable = io::usable_space(&self.dir);
        let not_flushed =
            self.directory.not_flushed_pages().max(0) as u64 * self.page_size as u64;
        error!(
            usable_bytes = usable,
            not_flushed_bytes = not_flushed,
            "page flush failed; disk space statistics"
        );
    }
}

impl WritersListener for CacheShared {
    fn add_only_writers(&self, file_id: u64, page_index: u64) {
        let key = PageKey::new(internal_file_id(file_id), page_index);
        self.directory.inc_exclusive_size();
        self.directory.add_exclusive_key(key);
    }

    fn remove_only_writers(&self, file_id: u64, page_index: u64) {
        let key = PageKey::new(internal_file_id(file_id), page_index);
        self.directory.dec_exclusive_size();
        self.directory.remove_exclusive_key(&key);
    }
}

pub struct WriteCache {
    shared: Arc<CacheShared>,
    executor: FlushExecutor,
    low_space_publisher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WriteCache {
    /// Opens the cache over `dir`, replaying the name registry and spawning
    /// the background flusher.
    pub fn open(
        dir: impl AsRef<Path>,
        config: WriteCacheConfig,
        wal: Option<Arc<dyn WriteAheadLog>>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();

        let mut registry = FileRegistry::load_or_create(&dir)?;
        let files = OpenFiles::new(config.open_files_limit);
        for (name, id) in registry.live_files() {
            let path = dir.join(&name);
            if path.exists() {
                files.register(id, PageFile::closed(path))?;
            } else {
                warn!(
                    name,
                    file_id = id,
                    "registered file is missing on disk; demoting to tombstone"
                );
                registry.demote(&name);
            }
        }

        let page_size = config.page_size as usize;
        let exclusive_max_pages = config.exclusive_write_cache_max_pages();
        let pool = Arc::new(BufferPool::new(page_size, exclusive_max_pages as usize));

        let (low_space_tx, low_space_rx) = mpsc::sync_channel(LOW_SPACE_QUEUE_DEPTH);
        let low_space_listeners: Arc<Mutex<Vec<Weak<dyn LowDiskSpaceListener>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let shared = Arc::new(CacheShared {
            page_size,
            exclusive_max_pages,
            storage_id: config.storage_id,
            metrics: Mutex::new(FlushMetrics::new(config.chunk_size)),
            config,
            dir,
            registry: RwLock::new(registry),
            files,
            locks: PartitionedPageLocks::new(),
            directory: PageDirectory::new(),
            pool,
            wal,
            exclusive_latch: Mutex::new(None),
            cache_overflow_count: AtomicU64::new(0),
            new_pages_added: AtomicU64::new(0),
            last_space_check: AtomicU64::new(0),
            low_space_tx: Mutex::new(Some(low_space_tx)),
            low_space_listeners: Arc::clone(&low_space_listeners),
            background_error_listeners: Mutex::new(Vec::new()),
        });

        let executor = FlushExecutor::start(Arc::clone(&shared))?;
        let publisher = spawn_low_space_publisher(low_space_rx, low_space_listeners)?;

        info!(
            dir = %shared.dir.display(),
            page_size,
            exclusive_max_pages,
            "write cache opened"
        );
        Ok(Self {
            shared,
            executor,
            low_space_publisher: Mutex::new(Some(publisher)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MareaError::Storage("write cache is closed".into()));
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    pub fn storage_id(&self) -> u32 {
        self.shared.storage_id
    }

    pub fn root_directory(&self) -> &Path {
        &self.shared.dir
    }

    pub fn write_cache_size(&self) -> u64 {
        self.shared.directory.write_cache_size().max(0) as u64
    }

    pub fn exclusive_write_cache_size(&self) -> u64 {
        self.shared.directory.exclusive_size().max(0) as u64
    }

    pub fn count_of_not_flushed_pages(&self) -> u64 {
        self.shared.directory.not_flushed_pages().max(0) as u64
    }

    pub fn cache_overflow_count(&self) -> u64 {
        self.shared.cache_overflow_count.load(Ordering::Acquire)
    }

    pub fn flush_metrics(&self) -> FlushMetrics {
        self.shared.metrics.lock().clone()
    }

    pub fn add_low_disk_space_listener(&self, listener: &Arc<dyn LowDiskSpaceListener>) {
        self.shared
            .low_space_listeners
            .lock()
            .push(Arc::downgrade(listener));
    }

    pub fn remove_low_disk_space_listener(&self, listener: &Arc<dyn LowDiskSpaceListener>) {
        self.shared.low_space_listeners.lock().retain(|weak| {
            weak.upgrade()
                .is_some_and(|current| !Arc::ptr_eq(&current, listener))
        });
    }

    pub fn add_background_error_listener(&self, listener: &Arc<dyn BackgroundErrorListener>) {
        self.shared
            .background_error_listeners
            .lock()
            .push(Arc::downgrade(listener));
    }

    pub fn remove_background_error_listener(&self, listener: &Arc<dyn BackgroundErrorListener>) {
        self.shared.background_error_listeners.lock().retain(|weak| {
            weak.upgrade()
                .is_some_and(|current| !Arc::ptr_eq(&current, listener))
        });
    }

    /// Creates a file and registers it under a fresh (or revived) id.
    pub fn add_file(&self, name: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut registry = self.shared.registry.write();
        if matches!(registry.lookup(name), Some(value) if value > 0) {
            return Err(MareaError::Storage(format!(
                "file with name '{name}' already exists in storage"
            )));
        }
        let id = registry.book_id(name);
        let file = PageFile::create(self.shared.dir.join(name))?;
        self.shared.files.register(id, file)?;
        registry.record(name, id as i64, true)?;
        info!(name, file_id = id, "added file");
        Ok(compose_file_id(self.shared.storage_id, id))
    }

    /// Registers a new file under a caller-chosen id.
    pub fn add_file_with_id(&self, name: &str, file_id: u64) -> Result<u64> {
        self.ensure_open()?;
        let internal = internal_file_id(file_id);
        if internal == 0 {
            return Err(MareaError::InvalidArgument(
                "file id 0 is reserved".into(),
            ));
        }
        let mut registry = self.shared.registry.write();
        if let Some(value) = registry.lookup(name) {
            if value > 0 {
                return if value as u32 == internal {
                    Err(MareaError::Storage(format!(
                        "file with name '{name}' already exists in storage"
                    )))
                } else {
                    Err(MareaError::Storage(format!(
                        "file with name '{name}' already exists with id {value}, proposed {internal}"
                    )))
                };
            }
        }
        if self.shared.files.is_registered(internal) {
            return Err(MareaError::Storage(format!(
                "file id {internal} is already registered under a different name"
            )));
        }
        registry.cover_id(internal);
        let file = PageFile::create(self.shared.dir.join(name))?;
        self.shared.files.register(internal, file)?;
        registry.record(name, internal as i64, true)?;
        Ok(compose_file_id(self.shared.storage_id, internal))
    }

    /// Registers a file that already exists on disk but is missing (or
    /// tombstoned) in the registry.
    pub fn open_file(&self, name: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut registry = self.shared.registry.write();
        if let Some(value) = registry.lookup(name) {
            if value > 0 {
                let id = value as u32;
                if self.shared.files.is_registered(id) {
                    return Ok(compose_file_id(self.shared.storage_id, id));
                }
                return Err(MareaError::Storage(format!(
                    "file with name '{name}' is only partially registered in storage"
                )));
            }
        }
        let path = self.shared.dir.join(name);
        if !path.exists() {
            return Err(MareaError::Storage(format!(
                "file with name '{name}' does not exist in storage"
            )));
        }
        debug!(name, "file exists on disk but is not registered; registering it");
        let id = registry.book_id(name);
        self.shared.files.register(id, PageFile::closed(path))?;
        registry.record(name, id as i64, true)?;
        Ok(compose_file_id(self.shared.storage_id, id))
    }

    /// Reserves the id `add_file` would assign for `name`.
    pub fn book_file_id(&self, name: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut registry = self.shared.registry.write();
        let id = registry.book_id(name);
        Ok(compose_file_id(self.shared.storage_id, id))
    }

    pub fn file_id_by_name(&self, name: &str) -> Option<u64> {
        let registry = self.shared.registry.read();
        match registry.lookup(name) {
            Some(value) if value > 0 => {
                Some(compose_file_id(self.shared.storage_id, value as u32))
            }
            _ => None,
        }
    }

    pub fn file_name_by_id(&self, file_id: u64) -> Option<String> {
        let registry = self.shared.registry.read();
        registry
            .name_of(internal_file_id(file_id))
            .map(str::to_owned)
    }

    /// Live (name, external id) pairs.
    pub fn files(&self) -> Vec<(String, u64)> {
        self.shared
            .registry
            .read()
            .live_files()
            .into_iter()
            .map(|(name, id)| (name, compose_file_id(self.shared.storage_id, id)))
            .collect()
    }

    pub fn exists_by_name(&self, name: &str) -> bool {
        let registry = self.shared.registry.read();
        if matches!(registry.lookup(name), Some(value) if value > 0) {
            return true;
        }
        self.shared.dir.join(name).exists()
    }

    pub fn exists(&self, file_id: u64) -> bool {
        let _registry = self.shared.registry.read();
        match self.shared.files.path_of(internal_file_id(file_id)) {
            Some(path) => path.exists(),
            None => false,
        }
    }

    /// Number of whole pages the file currently covers.
    pub fn filled_up_to(&self, file_id: u64) -> Result<u64> {
        self.ensure_open()?;
        let _registry = self.shared.registry.read();
        let lease = self.shared.files.acquire(internal_file_id(file_id))?;
        Ok(lease.size()? / self.shared.page_size as u64)
    }

    /// Loads `page_count` pages starting at `start_page`, returning cached
    /// copies where they exist. With `add_new_pages`, pages beyond the end of
    /// the file are allocated as zero pages (including any gap below
    /// `start_page`); without it, such a request returns an empty vector.
    /// Every returned pointer carries one reader reference owned by the
    /// caller.
    pub fn load(
        &self,
        file_id: u64,
        start_page: u64,
        page_count: usize,
        add_new_pages: bool,
        cache_hit: &mut bool,
    ) -> Result<Vec<Arc<CachePointer>>> {
        if page_count < 1 {
            return Err(MareaError::InvalidArgument(format!(
                "amount of pages to load should be not less than 1 but provided value is {page_count}"
            )));
        }
        self.ensure_open()?;
        let shared = &self.shared;
        let internal = internal_file_id(file_id);
        let _files_lock = shared.registry.read();

        loop {
            let start_key = PageKey::new(internal, start_page);
            {
                let _partition = shared.locks.acquire_shared(start_key);
                if let Some(pointer) = shared.directory.get(&start_key) {
                    pointer.increment_readers();
                    *cache_hit = true;
                    return Ok(vec![pointer]);
                }
                if page_count == 1 {
                    // Single-page miss: read from the file without giving up
                    // the partition, so a racing store cannot slip in between.
                    if let Some(pointers) = shared.load_file_content(internal, start_page, 1)? {
                        for pointer in &pointers {
                            pointer.increment_readers();
                        }
                        return Ok(pointers);
                    }
                }
            }

            if page_count > 1 {
                let keys: Vec<PageKey> = (0..page_count)
                    .map(|n| PageKey::new(internal, start_page + n as u64))
                    .collect();
                let _partitions = shared.locks.acquire_shared_batch(&keys);
                if let Some(mut pointers) =
                    shared.load_file_content(internal, start_page, page_count)?
                {
                    for (n, slot) in pointers.iter_mut().enumerate() {
                        slot.increment_readers();
                        if n == 0 {
                            continue;
                        }
                        // Pages after the first may have been stored since we
                        // checked; prefer the cached copy over the stale read.
                        if let Some(cached) = shared.directory.get(&keys[n]) {
                            if !Arc::ptr_eq(&cached, slot) {
                                slot.decrement_readers();
                                cached.increment_readers();
                                *slot = cached;
                            }
                        }
                    }
                    return Ok(pointers);
                }
            }

            // The requested page lies beyond the end of the file.
            if !add_new_pages {
                return Ok(Vec::new());
            }

            let allocated = self.allocate_new_pages(internal, start_page)?;
            if let Some(pointer) = allocated {
                pointer.increment_readers();
                *cache_hit = true;
                return Ok(vec![pointer]);
            }
            // A racing allocation covered the page (or the file grew past
            // it); read it on the next pass.
        }
    }

    /// Grows the file up to and including `start_page`, installing zeroed
    /// pointers for every newly covered index. Returns the pointer for
    /// `start_page` if this call performed the allocation.
    fn allocate_new_pages(
        &self,
        internal: u32,
        start_page: u64,
    ) -> Result<Option<Arc<CachePointer>>> {
        let shared = &self.shared;
        let page_size = shared.page_size as u64;
        let lease = shared.files.acquire(internal)?;

        let allocation_stop = start_page;
        let allocation_start = lease.size()? / page_size;
        if allocation_start > allocation_stop {
            return Ok(None);
        }

        // Exclusive partitions over the whole allocation range keep racing
        // stores from installing duplicate pointers for these indices.
        let keys: Vec<PageKey> = (allocation_start..=allocation_stop)
            .map(|index| PageKey::new(internal, index))
            .collect();
        let _partitions = shared.locks.acquire_exclusive_batch(&keys);

        let file_size = lease.size()?;
        let space_to_allocate = ((allocation_stop + 1) * page_size).saturating_sub(file_size);
        if space_to_allocate == 0 {
            return Ok(None);
        }
        lease.allocate(space_to_allocate)?;

        let allocation_start = file_size / page_size;
        let external = compose_file_id(shared.storage_id, internal);
        let mut result = None;
        for index in allocation_start..=allocation_stop {
            let pointer = Arc::new(CachePointer::new(
                shared.pool.acquire(true),
                Arc::clone(&shared.pool),
                external,
                index,
            ));
            pointer.set_not_flushed(true);
            shared.directory.inc_not_flushed();
            shared.do_put_in_cache(&pointer, PageKey::new(internal, index));
            if index == start_page {
                result = Some(pointer);
            }
        }
        shared.free_space_check_after_new_pages(allocation_stop - allocation_start + 1);
        Ok(result)
    }

    /// Hands a page to the write cache. Stores are idempotent: offering the
    /// pointer that is already cached for the key is a no-op. When the
    /// exclusive write cache overflows, the returned latch must be awaited
    /// before issuing further stores.
    pub fn store(
        &self,
        file_id: u64,
        page_index: u64,
        pointer: &Arc<CachePointer>,
    ) -> Result<Option<Arc<ExclusiveLatch>>> {
        self.ensure_open()?;
        let shared = &self.shared;
        let internal = internal_file_id(file_id);
        let _files_lock = shared.registry.read();

        let key = PageKey::new(internal, page_index);
        {
            let _partition = shared.locks.acquire_exclusive(key);
            match shared.directory.get(&key) {
                None => shared.do_put_in_cache(pointer, key),
                Some(existing) => {
                    // Stores are idempotent: the layer above re-offers the
                    // pointer that is already cached for this key.
                    debug_assert!(
                        Arc::ptr_eq(&existing, pointer),
                        "store must re-offer the pointer already cached for {key}"
                    );
                    drop(existing);
                }
            }
        }

        let mut latch_slot = shared.exclusive_latch.lock();
        if let Some(latch) = latch_slot.as_ref() {
            return Ok(Some(Arc::clone(latch)));
        }
        if shared.directory.exclusive_size().max(0) as u64 > shared.exclusive_max_pages {
            shared.cache_overflow_count.fetch_add(1, Ordering::AcqRel);
            let latch = Arc::new(ExclusiveLatch::new());
            *latch_slot = Some(Arc::clone(&latch));
            drop(latch_slot);
            debug!("exclusive write cache overflow; installing latch");
            self.executor.submit_tick();
            return Ok(Some(latch));
        }
        Ok(None)
    }

    /// Records the WAL position that first dirtied this page. A no-op when
    /// there is no WAL or the page is already tracked by the write cache.
    pub fn update_dirty_pages_table(&self, pointer: &CachePointer) -> Result<()> {
        let Some(wal) = &self.shared.wal else {
            return Ok(());
        };
        if pointer.in_write_cache() {
            return Ok(());
        }
        let key = PageKey::new(
            internal_file_id(pointer.file_id()),
            pointer.page_index(),
        );
        let lsn = wal.end().unwrap_or(Lsn::ZERO);
        self.shared.directory.mark_dirty_if_absent(key, lsn);
        Ok(())
    }

    /// Writes back and drops every cached page of one file, then syncs it.
    pub fn flush_file(&self, file_id: u64) -> Result<()> {
        self.ensure_open()?;
        self.executor.flush_file(internal_file_id(file_id))
    }

    /// Flushes every live file.
    pub fn flush_all(&self) -> Result<()> {
        self.ensure_open()?;
        let ids: Vec<u32> = self
            .shared
            .registry
            .read()
            .live_files()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        for id in ids {
            self.executor.flush_file(id)?;
        }
        Ok(())
    }

    /// Flushes until no dirty page predates `segment`, allowing the WAL to
    /// cut older segments.
    pub fn flush_till_segment(&self, segment: u64) -> Result<()> {
        self.ensure_open()?;
        self.executor.flush_till_segment(segment)
    }

    /// Oldest LSN whose page has not reached disk yet.
    pub fn minimal_not_flushed_lsn(&self) -> Result<Option<Lsn>> {
        self.ensure_open()?;
        self.executor.min_dirty_lsn()
    }

    /// Logs a fuzzy checkpoint: marker, fsync of every live file, end marker,
    /// then truncation of WAL segments older than `segment`.
    pub fn make_fuzzy_checkpoint(&self, segment: u64) -> Result<()> {
        self.ensure_open()?;
        let Some(wal) = self.shared.wal.clone() else {
            return Ok(());
        };
        let registry = self.shared.registry.read();
        let Some(start) = wal.begin_of_segment(segment)? else {
            return Ok(());
        };
        wal.log_fuzzy_checkpoint_start(start)?;
        for (_, id) in registry.live_files() {
            self.shared.files.acquire(id)?.sync()?;
        }
        wal.log_fuzzy_checkpoint_end()?;
        wal.flush()?;
        wal.cut_segments_smaller_than(segment)?;
        debug!(segment, "fuzzy checkpoint complete");
        Ok(())
    }

    /// Drops the cached pages of a file and truncates it to zero length.
    pub fn truncate_file(&self, file_id: u64) -> Result<()> {
        self.ensure_open()?;
        let internal = internal_file_id(file_id);
        let _registry = self.shared.registry.write();
        self.remove_cached_pages(internal)?;
        self.shared.files.acquire(internal)?.truncate(0)
    }

    /// Drops the cached pages of a file, deletes it from disk and tombstones
    /// its registry entry so the id survives for a future re-add.
    pub fn delete_file(&self, file_id: u64) -> Result<()> {
        self.ensure_open()?;
        let internal = internal_file_id(file_id);
        let mut registry = self.shared.registry.write();
        self.remove_cached_pages(internal)?;
        if let Some(mut file) = self.shared.files.remove(internal)? {
            let name = file.name();
            file.delete()?;
            registry.record(&name, -(internal as i64), true)?;
            info!(name, file_id = internal, "deleted file");
        }
        Ok(())
    }

    /// Renames a live file. The on-disk name keeps any suffix following the
    /// old prefix.
    pub fn rename_file(&self, file_id: u64, old_name: &str, new_name: &str) -> Result<()> {
        self.ensure_open()?;
        let internal = internal_file_id(file_id);
        let mut registry = self.shared.registry.write();
        match registry.lookup(old_name) {
            Some(value) if value > 0 && value as u32 == internal => {}
            _ => {
                return Err(MareaError::Storage(format!(
                    "file with name '{old_name}' is not registered under id {internal}"
                )));
            }
        }
        if matches!(registry.lookup(new_name), Some(value) if value > 0) {
            return Err(MareaError::Storage(format!(
                "file with name '{new_name}' already exists in storage"
            )));
        }
        {
            let lease = self.shared.files.acquire(internal)?;
            let on_disk = lease.name();
            if let Some(suffix) = on_disk.strip_prefix(old_name) {
                lease.rename_to(self.shared.dir.join(format!("{new_name}{suffix}")))?;
            }
        }
        registry.rename(old_name, new_name)?;
        info!(old_name, new_name, file_id = internal, "renamed file");
        Ok(())
    }

    /// Closes one file, either flushing its pages or dropping them.
    pub fn close_file(&self, file_id: u64, flush: bool) -> Result<()> {
        self.ensure_open()?;
        let internal = internal_file_id(file_id);
        let _registry = self.shared.registry.write();
        if flush {
            self.executor.flush_file(internal)?;
        } else {
            self.remove_cached_pages(internal)?;
        }
        self.shared.files.close(internal)
    }

    fn remove_cached_pages(&self, internal: u32) -> Result<()> {
        if self.executor.is_stopped() {
            return Ok(());
        }
        self.executor.remove_file_pages(internal)
    }

    /// Verifies the stored footer of every page of every live file.
    pub fn verify(
        &self,
        progress: Option<&dyn VerificationProgress>,
    ) -> Result<Vec<PageVerificationError>> {
        self.ensure_open()?;
        let shared = &self.shared;
        let registry = shared.registry.write();
        let mut errors = Vec::new();

        for (name, id) in registry.live_files() {
            if let Some(listener) = progress {
                listener.on_message(&format!("Flushing file {name}..."));
            }
            self.executor.flush_file(id)?;
            if let Some(listener) = progress {
                listener.on_message(&format!("Verifying content of file {name}..."));
            }

            let mut file_is_correct = true;
            let sweep = (|| -> Result<()> {
                let lease = shared.files.acquire(id)?;
                let size = lease.size()?;
                let page_size = shared.page_size as u64;
                let mut page = vec![0u8; shared.page_size];
                let mut last_notification = Instant::now();

                let mut position = 0u64;
                while position + page_size <= size {
                    lease.read_exact_at(position, &mut page)?;
                    let (magic_ok, crc_ok) = layout::verify_page(&page);
                    if !magic_ok || !crc_ok {
                        file_is_correct = false;
                        let page_index = position / page_size;
                        if let Some(listener) = progress {
                            if !magic_ok {
                                listener.on_message(&format!(
                                    "Error: magic number of page {page_index} in file {name} does not match"
                                ));
                            }
                            if !crc_ok {
                                listener.on_message(&format!(
                                    "Error: checksum of page {page_index} in file {name} is incorrect"
                                ));
                            }
                        }
                        errors.push(PageVerificationError {
                            file_name: name.clone(),
                            page_index,
                            magic_incorrect: !magic_ok,
                            checksum_incorrect: !crc_ok,
                        });
                    }
                    if last_notification.elapsed() >= VERIFY_PROGRESS_INTERVAL {
                        if let Some(listener) = progress {
                            listener.on_message(&format!(
                                "{} pages were processed...",
                                position / page_size + 1
                            ));
                        }
                        last_notification = Instant::now();
                    }
                    position += page_size;
                }
                Ok(())
            })();

            if let Err(err) = sweep {
                file_is_correct = false;
                warn!(name, error = %err, "error while verifying file");
                if let Some(listener) = progress {
                    listener.on_message(&format!("Error: error during processing of file {name}: {err}"));
                }
            }
            if let Some(listener) = progress {
                if file_is_correct {
                    listener.on_message(&format!("Verification of file {name} finished successfully"));
                } else {
                    listener.on_message(&format!("Verification of file {name} finished with errors"));
                }
            }
        }
        Ok(errors)
    }

    /// Samples the free-space probe directly.
    pub fn check_low_disk_space(&self) -> bool {
        let free = io::usable_space(&self.shared.dir);
        let not_flushed = self.shared.directory.not_flushed_pages().max(0) as u64
            * self.shared.page_size as u64;
        free.saturating_sub(not_flushed) < self.shared.config.free_space_limit
    }

    /// Flushes everything, stops the flusher (bounded wait), closes every
    /// file and compacts the registry. Returns the external ids that were
    /// closed.
    pub fn close_all(&self) -> Result<Vec<u64>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let ids: Vec<u32> = self
            .shared
            .registry
            .read()
            .live_files()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        for id in &ids {
            self.executor.flush_file(*id)?;
        }
        self.executor.shutdown(self.shared.config.shutdown_timeout)?;

        let mut registry = self.shared.registry.write();
        let mut closed_ids = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut file) = self.shared.files.remove(id)? {
                file.close();
            }
            closed_ids.push(compose_file_id(self.shared.storage_id, id));
        }
        registry.close()?;
        drop(registry);

        self.shutdown_low_space_publisher();
        self.log_flush_metrics();
        info!(files = closed_ids.len(), "write cache closed");
        Ok(closed_ids)
    }

    /// Deletes every live file and the registry, then stops the flusher.
    /// Returns the external ids that were deleted.
    pub fn delete_all(&self) -> Result<Vec<u64>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut deleted = Vec::new();
        {
            let mut registry = self.shared.registry.write();
            for (_, id) in registry.live_files() {
                self.remove_cached_pages(id)?;
                if let Some(mut file) = self.shared.files.remove(id)? {
                    file.delete()?;
                }
                deleted.push(compose_file_id(self.shared.storage_id, id));
            }
            registry.delete_holder()?;
        }
        self.executor.shutdown(self.shared.config.shutdown_timeout)?;
        self.shutdown_low_space_publisher();
        info!(files = deleted.len(), "write cache deleted");
        Ok(deleted)
    }

    fn shutdown_low_space_publisher(&self) {
        self.shared.low_space_tx.lock().take();
        if let Some(handle) = self.low_space_publisher.lock().take() {
            let _ = handle.join();
        }
    }

    fn log_flush_metrics(&self) {
        let metrics = self.shared.metrics.lock().clone();
        let total_chunks: u64 = metrics.chunk_counts.iter().sum();
        if total_chunks == 0 {
            return;
        }
        for (slot, &count) in metrics.chunk_counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            info!(
                chunk_len = slot + 1,
                chunks = count,
                avg_write_ns = metrics.chunk_nanos[slot] / count,
                share_percent = count * 100 / total_chunks,
                "chunk flush distribution"
            );
        }
        info!(
            flushed_pages = metrics.flushed_pages,
            lsn_flush_ns = metrics.lsn_flush_nanos,
            exclusive_flush_ns = metrics.exclusive_flush_nanos,
            "flush time distribution"
        );
    }
}

fn spawn_low_space_publisher(
    receiver: Receiver<LowDiskSpaceInfo>,
    listeners: Arc<Mutex<Vec<Weak<dyn LowDiskSpaceListener>>>>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("marea-low-space".into())
        .spawn(move || {
            while let Ok(info) = receiver.recv() {
                let callbacks: Vec<Arc<dyn LowDiskSpaceListener>> = {
                    let mut list = listeners.lock();
                    list.retain(|weak| weak.strong_count() > 0);
                    list.iter().filter_map(Weak::upgrade).collect()
                };
                for listener in callbacks {
                    listener.low_disk_space(info);
                }
            }
        })
        .map_err(MareaError::Io)
}
