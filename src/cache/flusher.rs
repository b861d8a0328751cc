//! Background flusher.
//!
//! One dedicated worker owns every flush routine, so the flusher-local dirty
//! tables and the last-flushed cursor need no locks. Commands arrive over an
//! mpsc channel; the periodic tick is the channel's receive timeout. Errors
//! raised by a tick are logged and fanned out to background-error listeners,
//! then the next tick proceeds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::IoSlice;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::buffer::PageBuffer;
use crate::cache::pointer::CachePointer;
use crate::cache::CacheShared;
use crate::error::{MareaError, Result};
use crate::layout;
use crate::types::{Lsn, PageKey};

/// Structured flush statistics, in place of ad-hoc diagnostics on close.
#[derive(Clone, Debug)]
pub struct FlushMetrics {
    /// `chunk_counts[n]` is the number of chunks flushed with `n + 1` pages.
    pub chunk_counts: Vec<u64>,
    /// Cumulative write latency per chunk length, in nanoseconds.
    pub chunk_nanos: Vec<u64>,
    /// Total pages written by the background flusher.
    pub flushed_pages: u64,
    /// Time spent flushing in LSN order.
    pub lsn_flush_nanos: u64,
    /// Time spent draining exclusively-held pages.
    pub exclusive_flush_nanos: u64,
}

impl FlushMetrics {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_counts: vec![0; chunk_size],
            chunk_nanos: vec![0; chunk_size],
            flushed_pages: 0,
            lsn_flush_nanos: 0,
            exclusive_flush_nanos: 0,
        }
    }

    fn record_chunk(&mut self, len: usize, nanos: u64) {
        if len == 0 {
            return;
        }
        let slot = (len - 1).min(self.chunk_counts.len() - 1);
        self.chunk_counts[slot] += 1;
        self.chunk_nanos[slot] += nanos;
        self.flushed_pages += len as u64;
    }
}

pub(crate) enum FlushCommand {
    Tick,
    FlushFile {
        file_id: u32,
        reply: Sender<Result<()>>,
    },
    RemoveFilePages {
        file_id: u32,
        reply: Sender<Result<()>>,
    },
    FlushTillSegment {
        segment: u64,
        reply: Sender<Result<()>>,
    },
    MinDirtyLsn {
        reply: Sender<Result<Option<Lsn>>>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

pub(crate) struct FlushExecutor {
    sender: Mutex<Option<Sender<FlushCommand>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushExecutor {
    pub fn start(shared: Arc<CacheShared>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("marea-flush".into())
            .spawn(move || FlushWorker::new(shared, receiver).run())
            .map_err(MareaError::Io)?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn submit(&self, command: FlushCommand) -> Result<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender
                .send(command)
                .map_err(|_| MareaError::Interrupted("background flush worker terminated")),
            None => Err(MareaError::Storage(
                "background flush executor is shut down".into(),
            )),
        }
    }

    /// Best-effort immediate flush pass; used by overflowing stores.
    pub fn submit_tick(&self) {
        let _ = self.submit(FlushCommand::Tick);
    }

    fn request<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> FlushCommand) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.submit(build(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| MareaError::Interrupted("background flush worker terminated"))?
    }

    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        self.request(|reply| FlushCommand::FlushFile { file_id, reply })
    }

    pub fn remove_file_pages(&self, file_id: u32) -> Result<()> {
        self.request(|reply| FlushCommand::RemoveFilePages { file_id, reply })
    }

    pub fn flush_till_segment(&self, segment: u64) -> Result<()> {
        self.request(|reply| FlushCommand::FlushTillSegment { segment, reply })
    }

    pub fn min_dirty_lsn(&self) -> Result<Option<Lsn>> {
        self.request(|reply| FlushCommand::MinDirtyLsn { reply })
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops the worker, waiting at most `timeout` for in-flight work.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let sender = self.sender.lock().take();
        if let Some(sender) = sender {
            let (reply_tx, reply_rx) = mpsc::channel();
            if sender
                .send(FlushCommand::Shutdown { reply: reply_tx })
                .is_ok()
            {
                match reply_rx.recv_timeout(timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(MareaError::ShutdownTimeout(
                            "background data flush task cannot be stopped",
                        ));
                    }
                }
            }
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

struct ChunkEntry {
    key: PageKey,
    version: u64,
    copy: PageBuffer,
    pointer: Arc<CachePointer>,
}

fn is_adjacent(previous: PageKey, next: PageKey) -> bool {
    previous.file_id == next.file_id && next.page_index == previous.page_index + 1
}

struct FlushWorker {
    shared: Arc<CacheShared>,
    receiver: Receiver<FlushCommand>,
    local_dirty_pages: HashMap<PageKey, Lsn>,
    local_dirty_pages_by_lsn: BTreeMap<Lsn, HashSet<PageKey>>,
    last_flushed_key: Option<PageKey>,
    lsn_flush_started: bool,
}

impl FlushWorker {
    fn new(shared: Arc<CacheShared>, receiver: Receiver<FlushCommand>) -> Self {
        Self {
            shared,
            receiver,
            local_dirty_pages: HashMap::new(),
            local_dirty_pages_by_lsn: BTreeMap::new(),
            last_flushed_key: None,
            lsn_flush_started: false,
        }
    }

    fn run(mut self) {
        let tick = self.shared.config.page_flush_interval;
        debug!(tick_ms = tick.as_millis() as u64, "flush worker started");
        loop {
            let command = if tick.is_zero() {
                match self.receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                }
            } else {
                match self.receiver.recv_timeout(tick) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => FlushCommand::Tick,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };
            match command {
                FlushCommand::Tick => {
                    if let Err(err) = self.periodic_flush() {
                        error!(error = %err, "background page flush failed");
                        self.shared.report_background_error(&err);
                    }
                }
                FlushCommand::FlushFile { file_id, reply } => {
                    let _ = reply.send(self.flush_file(file_id));
                }
                FlushCommand::RemoveFilePages { file_id, reply } => {
                    let _ = reply.send(self.remove_file_pages(file_id));
                }
                FlushCommand::FlushTillSegment { segment, reply } => {
                    let _ = reply.send(self.flush_till_segment(segment));
                }
                FlushCommand::MinDirtyLsn { reply } => {
                    let _ = reply.send(Ok(self.find_min_dirty_lsn()));
                }
                FlushCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("flush worker stopped");
    }

    /// One background pass: drain overflowing exclusives, then flush in LSN
    /// order while the WAL is above its size hysteresis.
    fn periodic_flush(&mut self) -> Result<()> {
        if self.shared.directory.is_empty() {
            // Nothing to flush; pressure may still have dropped since a latch
            // was installed (pages can be purged without flushing).
            self.shared.release_exclusive_latch_if_low();
            return Ok(());
        }

        self.flush_exclusive_if_needed()?;

        if let Some(wal) = self.shared.wal.clone() {
            let wal_size = wal.size();
            let trigger = self.shared.config.wal_size_flush_trigger;
            let release = self.shared.config.wal_size_flush_release;
            if wal_size >= trigger {
                self.lsn_flush_started = true;
                self.flush_by_min_lsn()?;
            } else if wal_size <= release {
                self.lsn_flush_started = false;
            } else if self.lsn_flush_started {
                self.flush_by_min_lsn()?;
            }
        }
        Ok(())
    }

    fn flush_exclusive_if_needed(&mut self) -> Result<u64> {
        let exclusive = self.shared.directory.exclusive_size().max(0) as f64;
        let threshold = exclusive / self.shared.exclusive_max_pages as f64;
        if threshold > self.shared.config.exclusive_flush_threshold {
            self.flush_exclusive(threshold)
        } else {
            self.shared.release_exclusive_latch_if_low();
            Ok(0)
        }
    }

    /// Drains exclusively-held pages, targeting the configured threshold.
    /// The exclusive set is walked as a ring so successive passes make
    /// progress across files.
    fn flush_exclusive(&mut self, threshold: f64) -> Result<u64> {
        let started = Instant::now();
        let mut chunk = Vec::with_capacity(self.shared.config.chunk_size);
        let result = self.flush_exclusive_inner(threshold, &mut chunk);
        self.release_chunk(&mut chunk);
        self.shared.metrics.lock().exclusive_flush_nanos += started.elapsed().as_nanos() as u64;
        result
    }

    fn flush_exclusive_inner(
        &mut self,
        threshold: f64,
        chunk: &mut Vec<ChunkEntry>,
    ) -> Result<u64> {
        let config = &self.shared.config;
        let chunk_size = config.chunk_size;
        let over = threshold - config.exclusive_flush_threshold;
        let pages_to_flush =
            ((over * self.shared.exclusive_max_pages as f64).ceil() as u64).max(1);
        trace!(pages_to_flush, "draining exclusive write cache");

        let mut flushed = 0u64;
        let mut cursor: Option<PageKey> = None;
        let mut wrapped = false;

        while flushed < pages_to_flush {
            let key = match self.shared.directory.next_exclusive_key(cursor) {
                Some(key) => {
                    wrapped = false;
                    key
                }
                None => {
                    flushed += self.write_chunk(chunk)?;
                    self.shared.release_exclusive_latch_if_low();
                    if wrapped {
                        break;
                    }
                    wrapped = true;
                    cursor = None;
                    continue;
                }
            };
            cursor = Some(key);

            let Some(pointer) = self.shared.directory.get(&key) else {
                // The pointer left the cache between the set walk and the
                // lookup; drop the stale key.
                self.shared.directory.remove_exclusive_key(&key);
                continue;
            };

            if !chunk.is_empty() && !is_adjacent(chunk[chunk.len() - 1].key, key) {
                flushed += self.write_chunk(chunk)?;
                self.shared.release_exclusive_latch_if_low();
            }
            let entry = self.snapshot_page(key, &pointer)?;
            chunk.push(entry);
            if chunk.len() >= chunk_size {
                flushed += self.write_chunk(chunk)?;
                self.shared.release_exclusive_latch_if_low();
            }
        }

        flushed += self.write_chunk(chunk)?;
        self.shared.release_exclusive_latch_if_low();
        Ok(flushed)
    }

    /// Flushes pages covering the oldest WAL records first so the log can be
    /// truncated as early as possible.
    fn flush_by_min_lsn(&mut self) -> Result<u64> {
        let started = Instant::now();
        let mut chunk = Vec::with_capacity(self.shared.config.chunk_size);
        let result = self.flush_from_min_lsn_inner(&mut chunk);
        self.release_chunk(&mut chunk);
        self.shared.metrics.lock().lsn_flush_nanos += started.elapsed().as_nanos() as u64;
        result
    }

    fn flush_from_min_lsn_inner(&mut self, chunk: &mut Vec<ChunkEntry>) -> Result<u64> {
        self.convert_shared_dirty_pages_to_local();

        let started = Instant::now();
        let budget = self.shared.config.background_flush_interval;
        let chunk_size = self.shared.config.chunk_size;
        let mut flushed = 0u64;

        'cycle: while started.elapsed() < budget {
            debug_assert!(chunk.is_empty());
            // Start from a page holding the oldest dirty LSN; without dirty
            // pages, walk the directory from the beginning.
            let oldest = self
                .local_dirty_pages_by_lsn
                .values()
                .next()
                .and_then(|keys| keys.iter().next().copied());
            let mut entry = match oldest {
                Some(key) => self
                    .shared
                    .directory
                    .first_entry_at_or_after(key)
                    .or_else(|| self.shared.directory.first_entry()),
                None => self.shared.directory.first_entry(),
            };
            if entry.is_none() {
                break;
            }

            while chunk.len() < chunk_size && started.elapsed() < budget {
                let Some((key, pointer)) = entry.take() else {
                    flushed += self.write_chunk(chunk)?;
                    self.shared.release_exclusive_latch_if_low();
                    continue 'cycle;
                };
                if !chunk.is_empty() && !is_adjacent(chunk[chunk.len() - 1].key, key) {
                    flushed += self.write_chunk(chunk)?;
                    self.shared.release_exclusive_latch_if_low();
                }
                let snapshot = self.snapshot_page(key, &pointer)?;
                chunk.push(snapshot);
                entry = self.shared.directory.entry_after(key);
            }

            flushed += self.write_chunk(chunk)?;
            self.shared.release_exclusive_latch_if_low();
        }

        flushed += self.write_chunk(chunk)?;
        self.shared.release_exclusive_latch_if_low();
        Ok(flushed)
    }

    /// Copies a page image under its shared lock and queues it for writing.
    /// The dirty record is dropped and the in-cache flag cleared inside the
    /// lock; the WAL gate runs on the staged copy afterwards.
    fn snapshot_page(&mut self, key: PageKey, pointer: &Arc<CachePointer>) -> Result<ChunkEntry> {
        let mut copy = self.shared.pool.acquire(false);
        let version;
        {
            let guard = pointer.acquire_shared_buffer();
            version = pointer.version();
            copy.copy_from_slice(&guard);
            self.remove_from_dirty_pages(key);
            pointer.set_in_write_cache(false);
        }
        layout::write_footer(&mut copy);

        if let Err(err) = self.gate_on_wal(&copy) {
            self.shared.pool.release(copy);
            return Err(err);
        }
        Ok(ChunkEntry {
            key,
            version,
            copy,
            pointer: Arc::clone(pointer),
        })
    }

    /// WAL-before-data: the page may only reach disk once the log covers its
    /// stored LSN.
    fn gate_on_wal(&self, page: &[u8]) -> Result<()> {
        if let Some(wal) = &self.shared.wal {
            let lsn = layout::page_lsn(page);
            if wal.flushed_lsn().map_or(true, |flushed| flushed < lsn) {
                wal.flush()?;
            }
        }
        Ok(())
    }

    /// Writes a run of adjacent pages as one gathered write, then retires the
    /// queued entries whose pages were not mutated since their snapshot.
    fn write_chunk(&mut self, chunk: &mut Vec<ChunkEntry>) -> Result<u64> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let page_size = self.shared.page_size as u64;
        let first_key = chunk[0].key;
        let started = Instant::now();

        let write_result = {
            let slices: SmallVec<[IoSlice<'_>; 32]> = chunk
                .iter()
                .map(|entry| IoSlice::new(&entry.copy))
                .collect();
            self.shared
                .files
                .acquire(first_key.file_id)
                .and_then(|lease| lease.writev_at(first_key.page_index * page_size, &slices))
        };
        if let Err(err) = write_result {
            self.shared.log_free_space_statistics();
            self.release_chunk(chunk);
            return Err(err);
        }
        self.shared
            .metrics
            .lock()
            .record_chunk(chunk.len(), started.elapsed().as_nanos() as u64);

        let mut finalize: SmallVec<[(PageKey, u64, Arc<CachePointer>); 32]> = SmallVec::new();
        for entry in chunk.drain(..) {
            self.shared.pool.release(entry.copy);
            finalize.push((entry.key, entry.version, entry.pointer));
        }
        let count = finalize.len() as u64;
        self.last_flushed_key = finalize.last().map(|(key, _, _)| *key);
        trace!(
            first = %first_key,
            last = %self.last_flushed_key.unwrap_or(first_key),
            pages = count,
            "flushed chunk"
        );

        for (key, version, pointer) in finalize {
            let _partition = self.shared.locks.acquire_exclusive(key);
            // A failed try means the page is being mutated right now; leave
            // it cached, it will be picked up again.
            let Some(guard) = pointer.try_acquire_shared_buffer() else {
                continue;
            };
            if pointer.version() == version {
                self.shared.directory.remove(&key);
                self.shared.directory.dec_write_cache_size();
                drop(guard);
                pointer.decrement_writers();
                pointer.detach_writers_listener();
            } else {
                drop(guard);
            }
            if pointer.not_flushed() {
                pointer.set_not_flushed(false);
                self.shared.directory.dec_not_flushed();
            }
        }
        Ok(count)
    }

    fn release_chunk(&self, chunk: &mut Vec<ChunkEntry>) {
        for entry in chunk.drain(..) {
            self.shared.pool.release(entry.copy);
        }
    }

    /// Flushes every cached page of one file through the single-page path,
    /// then syncs the file.
    fn flush_file(&mut self, file_id: u32) -> Result<()> {
        let mut cursor: Option<PageKey> = None;
        while let Some((key, pointer)) = self.shared.directory.first_in_file_after(file_id, cursor)
        {
            cursor = Some(key);
            let shared = Arc::clone(&self.shared);
            let _partition = shared.locks.acquire_exclusive(key);
            let Some(guard) = pointer.try_acquire_shared_buffer() else {
                continue;
            };
            self.write_single_page(key, &guard)?;
            self.remove_from_dirty_pages(key);
            pointer.set_in_write_cache(false);
            drop(guard);
            pointer.decrement_writers();
            pointer.detach_writers_listener();
            self.shared.directory.remove(&key);
            self.shared.directory.dec_write_cache_size();
            if pointer.not_flushed() {
                pointer.set_not_flushed(false);
                self.shared.directory.dec_not_flushed();
            }
        }
        self.shared.files.acquire(file_id)?.sync()?;
        Ok(())
    }

    /// Single-page flush: gate on the WAL, stage the footer into a fresh
    /// copy and write it out.
    fn write_single_page(&self, key: PageKey, page: &[u8]) -> Result<()> {
        self.gate_on_wal(page)?;

        let mut copy = self.shared.pool.acquire(false);
        copy.copy_from_slice(page);
        layout::write_footer(&mut copy);

        let result = self.shared.files.acquire(key.file_id).and_then(|lease| {
            lease.write_all_at(key.page_index * self.shared.page_size as u64, &copy)?;
            if self.shared.config.sync_on_page_flush {
                lease.sync()?;
            }
            Ok(())
        });
        self.shared.pool.release(copy);
        result
    }

    /// Drops every cached page of one file without writing it.
    fn remove_file_pages(&mut self, file_id: u32) -> Result<()> {
        let mut cursor: Option<PageKey> = None;
        while let Some((key, pointer)) = self.shared.directory.first_in_file_after(file_id, cursor)
        {
            cursor = Some(key);
            let shared = Arc::clone(&self.shared);
            let _partition = shared.locks.acquire_exclusive(key);
            {
                let _guard = pointer.acquire_exclusive_buffer();
                self.remove_from_dirty_pages(key);
                pointer.set_in_write_cache(false);
            }
            pointer.decrement_writers();
            pointer.detach_writers_listener();
            self.shared.directory.remove(&key);
            self.shared.directory.dec_write_cache_size();
            if pointer.not_flushed() {
                pointer.set_not_flushed(false);
                self.shared.directory.dec_not_flushed();
            }
        }
        self.shared.release_exclusive_latch_if_low();
        Ok(())
    }

    /// Keeps flushing until no dirty page predates `segment`.
    fn flush_till_segment(&mut self, segment: u64) -> Result<()> {
        loop {
            self.convert_shared_dirty_pages_to_local();
            let Some(min) = self.local_dirty_pages_by_lsn.keys().next().copied() else {
                return Ok(());
            };
            if min.segment >= segment {
                return Ok(());
            }
            self.flush_exclusive_if_needed()?;
            self.flush_by_min_lsn()?;
        }
    }

    fn find_min_dirty_lsn(&mut self) -> Option<Lsn> {
        self.convert_shared_dirty_pages_to_local();
        self.local_dirty_pages_by_lsn.keys().next().copied()
    }

    /// Drains the shared dirty table into the flusher-local maps, keeping
    /// the earliest LSN per key.
    fn convert_shared_dirty_pages_to_local(&mut self) {
        for (key, lsn) in self.shared.directory.drain_dirty() {
            if !self.local_dirty_pages.contains_key(&key) {
                self.local_dirty_pages.insert(key, lsn);
                self.local_dirty_pages_by_lsn
                    .entry(lsn)
                    .or_default()
                    .insert(key);
            }
        }
    }

    fn remove_from_dirty_pages(&mut self, key: PageKey) {
        self.shared.directory.remove_dirty(&key);
        if let Some(lsn) = self.local_dirty_pages.remove(&key) {
            if let Some(keys) = self.local_dirty_pages_by_lsn.get_mut(&lsn) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.local_dirty_pages_by_lsn.remove(&lsn);
                }
            }
        }
    }
}
