//! Durable name→file-id registry.
//!
//! The registry is an append-structured log of `(name, id)` records in
//! `name_id_map.cm`. Later records override earlier ones; a negative id is a
//! tombstone that keeps the name's id reserved for revival. The log is
//! compacted on close by rewriting one record per current map entry.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MareaError, Result};

pub const NAME_ID_MAP: &str = "name_id_map.cm";

/// Longest accepted file name, a guard against parsing garbage as a length.
const MAX_NAME_LEN: usize = 64 * 1024;

/// One record of the registry log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NameEntry {
    pub name: String,
    pub file_id: i64,
}

impl NameEntry {
    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut record = Vec::with_capacity(4 + name_bytes.len() + 8);
        record.extend_from_slice(&(name_bytes.len() as i32).to_be_bytes());
        record.extend_from_slice(name_bytes);
        record.extend_from_slice(&self.file_id.to_be_bytes());
        record
    }

    /// Decodes one record from `data` starting at `offset`. Returns `None`
    /// when the remaining bytes do not form a complete record, which ends the
    /// replay the same way a truncated tail would.
    pub fn decode(data: &[u8], offset: usize) -> Result<Option<(NameEntry, usize)>> {
        let remaining = &data[offset.min(data.len())..];
        if remaining.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&remaining[..4]);
        let name_len = i32::from_be_bytes(len_bytes);
        if name_len < 0 || name_len as usize > MAX_NAME_LEN {
            return Err(MareaError::Corruption(format!(
                "name-id map record has invalid name length {name_len}"
            )));
        }
        let name_len = name_len as usize;
        if remaining.len() < 4 + name_len + 8 {
            return Ok(None);
        }
        let name = std::str::from_utf8(&remaining[4..4 + name_len])
            .map_err(|_| {
                MareaError::Corruption("name-id map record holds a malformed name".into())
            })?
            .to_owned();
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&remaining[4 + name_len..4 + name_len + 8]);
        let file_id = i64::from_be_bytes(id_bytes);
        Ok(Some((NameEntry { name, file_id }, offset + 4 + name_len + 8)))
    }
}

pub struct FileRegistry {
    path: PathBuf,
    holder: Option<File>,
    entries: HashMap<String, i64>,
    file_counter: u32,
}

impl FileRegistry {
    /// Opens (or creates) the registry in `dir` and replays its records.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(NAME_ID_MAP);
        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let data = fs::read(&path)?;
        let mut entries = HashMap::new();
        let mut file_counter = 0u32;
        let mut offset = 0usize;
        while let Some((entry, next)) = NameEntry::decode(&data, offset)? {
            let abs = entry.file_id.unsigned_abs();
            if abs > u32::MAX as u64 {
                return Err(MareaError::Corruption(format!(
                    "name-id map id {} is out of range",
                    entry.file_id
                )));
            }
            file_counter = file_counter.max(abs as u32);
            entries.insert(entry.name, entry.file_id);
            offset = next;
        }
        if offset < data.len() {
            warn!(
                trailing_bytes = data.len() - offset,
                "name-id map ends with a truncated record; ignoring the tail"
            );
        }
        debug!(
            entries = entries.len(),
            file_counter, "loaded name-id registry"
        );
        Ok(Self {
            path,
            holder: Some(holder),
            entries,
            file_counter,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.entries.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, &value)| value == id as i64)
            .map(|(name, _)| name.as_str())
    }

    /// Live (name, id) pairs, tombstones excluded.
    pub fn live_files(&self) -> Vec<(String, u32)> {
        self.entries
            .iter()
            .filter(|(_, &value)| value > 0)
            .map(|(name, &value)| (name.clone(), value as u32))
            .collect()
    }

    pub fn file_counter(&self) -> u32 {
        self.file_counter
    }

    /// Assigns an id for `name`: revives a tombstone or claims the next
    /// counter value. Fails when the name is already live.
    pub fn add(&mut self, name: &str) -> Result<u32> {
        let id = match self.entries.get(name) {
            Some(&value) if value > 0 => {
                return Err(MareaError::Storage(format!(
                    "file with name '{name}' already exists"
                )));
            }
            Some(&value) => value.unsigned_abs() as u32,
            None => {
                self.file_counter += 1;
                self.file_counter
            }
        };
        self.record(name, id as i64, true)?;
        Ok(id)
    }

    /// Id `add` would assign, without recording anything. The counter value
    /// is consumed so a later `add` of a different name cannot collide.
    pub fn book_id(&mut self, name: &str) -> u32 {
        match self.entries.get(name) {
            Some(&value) if value < 0 => value.unsigned_abs() as u32,
            _ => {
                self.file_counter += 1;
                self.file_counter
            }
        }
    }

    /// Advances the counter so externally chosen ids cannot be re-assigned.
    pub fn cover_id(&mut self, id: u32) {
        self.file_counter = self.file_counter.max(id);
    }

    /// Writes a record and updates the materialized map.
    pub fn record(&mut self, name: &str, file_id: i64, sync: bool) -> Result<()> {
        self.entries.insert(name.to_owned(), file_id);
        self.append(
            &NameEntry {
                name: name.to_owned(),
                file_id,
            },
            sync,
        )
    }

    /// Moves `old`'s id to `new`: a `(old, -1)` record followed by a synced
    /// `(new, id)` record.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let id = match self.entries.get(old) {
            Some(&value) if value > 0 => value,
            _ => {
                return Err(MareaError::Storage(format!(
                    "file with name '{old}' is not registered"
                )));
            }
        };
        if matches!(self.entries.get(new), Some(&value) if value > 0) {
            return Err(MareaError::Storage(format!(
                "file with name '{new}' already exists"
            )));
        }
        self.entries.remove(old);
        self.append(
            &NameEntry {
                name: old.to_owned(),
                file_id: -1,
            },
            false,
        )?;
        self.record(new, id, true)
    }

    /// Tombstones a live name, keeping its id reserved for revival.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let id = match self.entries.get(name) {
            Some(&value) if value > 0 => value,
            _ => {
                return Err(MareaError::Storage(format!(
                    "file with name '{name}' is not registered"
                )));
            }
        };
        self.record(name, -id, true)
    }

    /// Demotes a live entry in memory only; used when the backing file is
    /// found missing during startup reconciliation.
    pub fn demote(&mut self, name: &str) {
        if let Some(value) = self.entries.get_mut(name) {
            if *value > 0 {
                *value = -*value;
            }
        }
    }

    fn append(&mut self, entry: &NameEntry, sync: bool) -> Result<()> {
        let holder = self
            .holder
            .as_mut()
            .ok_or_else(|| MareaError::Storage("name-id registry is closed".into()))?;
        holder.seek(SeekFrom::End(0))?;
        holder.write_all(&entry.encode())?;
        if sync {
            holder.sync_all()?;
        }
        Ok(())
    }

    /// Compacts the log: truncates the holder and rewrites one record per
    /// current map entry (tombstones included), then syncs and closes it.
    pub fn close(&mut self) -> Result<()> {
        if let Some(holder) = self.holder.as_mut() {
            holder.set_len(0)?;
            holder.seek(SeekFrom::Start(0))?;
            for (name, &file_id) in &self.entries {
                holder.write_all(
                    &NameEntry {
                        name: name.clone(),
                        file_id,
                    }
                    .encode(),
                )?;
            }
            holder.sync_all()?;
        }
        self.holder = None;
        self.entries.clear();
        Ok(())
    }

    /// Closes the holder and removes the registry file from disk.
    pub fn delete_holder(&mut self) -> Result<()> {
        self.holder = None;
        self.entries.clear();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_assigns_increasing_ids() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
        assert_eq!(registry.add("a").unwrap(), 1);
        assert_eq!(registry.add("b").unwrap(), 2);
        assert!(matches!(registry.add("a"), Err(MareaError::Storage(_))));
    }

    #[test]
    fn later_records_override_earlier_ones() {
        let dir = tempdir().unwrap();
        {
            let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
            registry.add("a").unwrap();
            registry.add("b").unwrap();
            registry.delete("a").unwrap();
        }
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        assert_eq!(registry.lookup("a"), Some(-1));
        assert_eq!(registry.lookup("b"), Some(2));
        assert_eq!(registry.file_counter(), 2);
    }

    #[test]
    fn tombstoned_names_revive_with_their_old_id() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
        registry.add("a").unwrap();
        registry.add("b").unwrap();
        registry.delete("a").unwrap();
        assert_eq!(registry.add("a").unwrap(), 1);
    }

    #[test]
    fn rename_moves_the_id() {
        let dir = tempdir().unwrap();
        {
            let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
            let id = registry.add("old").unwrap();
            registry.rename("old", "new").unwrap();
            assert_eq!(registry.lookup("new"), Some(id as i64));
            assert!(registry.lookup("old").is_some_and(|value| value < 0));
        }
        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        assert_eq!(registry.lookup("new"), Some(1));
    }

    #[test]
    fn close_compacts_and_preserves_tombstones() {
        let dir = tempdir().unwrap();
        {
            let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
            registry.add("a").unwrap();
            registry.add("b").unwrap();
            registry.delete("b").unwrap();
            registry.add("b").unwrap();
            registry.delete("b").unwrap();
            registry.close().unwrap();
        }
        // Five appended records compact down to two.
        let size = fs::metadata(dir.path().join(NAME_ID_MAP)).unwrap().len();
        let expected: usize = [("a", 1i64), ("b", -2i64)]
            .iter()
            .map(|(name, _)| 4 + name.len() + 8)
            .sum();
        assert_eq!(size, expected as u64);

        let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
        assert_eq!(registry.lookup("b"), Some(-2));
        assert_eq!(registry.add("b").unwrap(), 2);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
            registry.add("a").unwrap();
        }
        let path = dir.path().join(NAME_ID_MAP);
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&(100i32).to_be_bytes());
        data.extend_from_slice(b"partial");
        fs::write(&path, data).unwrap();

        let registry = FileRegistry::load_or_create(dir.path()).unwrap();
        assert_eq!(registry.lookup("a"), Some(1));
    }

    #[test]
    fn book_id_reserves_without_recording() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::load_or_create(dir.path()).unwrap();
        let booked = registry.book_id("future");
        assert_eq!(booked, 1);
        assert_eq!(registry.lookup("future"), None);
        // The counter moved on, so the next add cannot collide.
        assert_eq!(registry.add("other").unwrap(), 2);
    }
}
