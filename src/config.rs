use std::time::Duration;

use crate::error::{MareaError, Result};
use crate::layout;

/// Configuration of the write cache.
///
/// These options control page geometry, the exclusive-page budget, flusher
/// pacing and the free-space watchdog.
#[derive(Clone, Debug)]
pub struct WriteCacheConfig {
    /// Size of each page in bytes. Constant for the lifetime of a storage.
    pub page_size: u32,
    /// Budget, in bytes, for pages held exclusively by the write cache.
    pub exclusive_write_cache_max_size: u64,
    /// Floors the normalized exclusive budget at sixteen pages.
    pub enforce_min_cache_size: bool,
    /// Period of the background flush tick. Zero disables the periodic task;
    /// explicitly submitted flushes still run.
    pub page_flush_interval: Duration,
    /// Time budget of one LSN-ordered flush pass.
    pub background_flush_interval: Duration,
    /// Maximum number of physically adjacent pages gathered into one write.
    pub chunk_size: usize,
    /// Exclusive-page fill ratio above which the flusher drains exclusives.
    pub exclusive_flush_threshold: f64,
    /// Fill ratio at or below which an installed overflow latch is released.
    /// Deliberately above the flush threshold: the ratio is sampled after the
    /// flush already reduced pressure.
    pub exclusive_latch_release_threshold: f64,
    /// WAL size above which LSN-ordered flushing starts.
    pub wal_size_flush_trigger: u64,
    /// WAL size below which LSN-ordered flushing stops again.
    pub wal_size_flush_release: u64,
    /// Free-space floor; dropping below it emits low-disk-space events.
    pub free_space_limit: u64,
    /// Number of newly allocated pages between free-space samples.
    pub free_space_check_interval_pages: u64,
    /// Issue an fsync after every single-page flush.
    pub sync_on_page_flush: bool,
    /// Maximum number of simultaneously open file handles.
    pub open_files_limit: usize,
    /// Storage id mixed into the high 32 bits of external file ids.
    pub storage_id: u32,
    /// Upper bound on waiting for the flush worker during close/delete.
    pub shutdown_timeout: Duration,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            exclusive_write_cache_max_size: 256 * 1024 * 1024,
            enforce_min_cache_size: true,
            page_flush_interval: Duration::from_millis(25),
            background_flush_interval: Duration::from_millis(25),
            chunk_size: 32,
            exclusive_flush_threshold: 0.5,
            exclusive_latch_release_threshold: 0.85,
            wal_size_flush_trigger: 2 * 1024 * 1024 * 1024,
            wal_size_flush_release: 1024 * 1024 * 1024,
            free_space_limit: 256 * 1024 * 1024,
            free_space_check_interval_pages: 4096,
            sync_on_page_flush: false,
            open_files_limit: 512,
            storage_id: 1,
            shutdown_timeout: Duration::from_secs(300),
        }
    }
}

const MIN_CACHE_PAGES: u64 = 16;

impl WriteCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if (self.page_size as usize) < layout::MIN_PAGE_SIZE {
            return Err(MareaError::InvalidArgument(format!(
                "page size {} cannot carry the page footer and embedded LSN (minimum {})",
                self.page_size,
                layout::MIN_PAGE_SIZE
            )));
        }
        if self.chunk_size == 0 {
            return Err(MareaError::InvalidArgument(
                "chunk size must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exclusive_flush_threshold)
            || self.exclusive_flush_threshold == 0.0
        {
            return Err(MareaError::InvalidArgument(
                "exclusive flush threshold must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.exclusive_latch_release_threshold)
            || self.exclusive_latch_release_threshold == 0.0
        {
            return Err(MareaError::InvalidArgument(
                "exclusive latch release threshold must be in (0, 1]".into(),
            ));
        }
        if self.exclusive_latch_release_threshold < self.exclusive_flush_threshold {
            return Err(MareaError::InvalidArgument(
                "latch release threshold must not be below the flush threshold".into(),
            ));
        }
        if self.wal_size_flush_release > self.wal_size_flush_trigger {
            return Err(MareaError::InvalidArgument(
                "WAL flush release size must not exceed the trigger size".into(),
            ));
        }
        if self.open_files_limit == 0 {
            return Err(MareaError::InvalidArgument(
                "open files limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The exclusive budget expressed in pages.
    pub fn exclusive_write_cache_max_pages(&self) -> u64 {
        let pages = self.exclusive_write_cache_max_size / self.page_size as u64;
        if self.enforce_min_cache_size {
            pages.max(MIN_CACHE_PAGES)
        } else {
            pages.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WriteCacheConfig::default().validate().unwrap();
    }

    #[test]
    fn tiny_pages_are_rejected() {
        let config = WriteCacheConfig {
            page_size: 12,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MareaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn release_threshold_below_flush_threshold_is_rejected() {
        let config = WriteCacheConfig {
            exclusive_flush_threshold: 0.9,
            exclusive_latch_release_threshold: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn exclusive_budget_is_floored() {
        let config = WriteCacheConfig {
            page_size: 4096,
            exclusive_write_cache_max_size: 4096 * 4,
            ..Default::default()
        };
        assert_eq!(config.exclusive_write_cache_max_pages(), 16);

        let unfloored = WriteCacheConfig {
            enforce_min_cache_size: false,
            ..config
        };
        assert_eq!(unfloored.exclusive_write_cache_max_pages(), 4);
    }
}
