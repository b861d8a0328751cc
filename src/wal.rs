//! Interface to the write-ahead log.
//!
//! The log itself lives in the layer above; the cache only needs enough of
//! its surface to order page writes behind log durability and to drive fuzzy
//! checkpoints.

use crate::error::Result;
use crate::types::Lsn;

pub trait WriteAheadLog: Send + Sync + 'static {
    /// LSN of the most recently appended record, if any record exists.
    fn end(&self) -> Option<Lsn>;

    /// First LSN stored in the given segment, if the segment exists.
    fn begin_of_segment(&self, segment: u64) -> Result<Option<Lsn>>;

    /// Forces every appended record to durable storage.
    fn flush(&self) -> Result<()>;

    /// LSN up to which the log is known durable. A page whose stored LSN is
    /// above this value must not be written to its data file yet.
    fn flushed_lsn(&self) -> Option<Lsn>;

    /// Current size of the log in bytes; drives flush hysteresis.
    fn size(&self) -> u64;

    fn log_fuzzy_checkpoint_start(&self, start: Lsn) -> Result<()>;

    fn log_fuzzy_checkpoint_end(&self) -> Result<()>;

    /// Drops log segments strictly smaller than `segment`.
    fn cut_segments_smaller_than(&self, segment: u64) -> Result<()>;
}
