//! Positioned file I/O for page files.
//!
//! All reads and writes are offset-addressed so concurrent holders of the
//! same handle never race on a shared cursor. Handles open lazily: a
//! [`PageFile`] keeps its path and reopens on first use after being closed by
//! the open-file container.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSlice};
use std::path::{Path, PathBuf};

use crate::error::{MareaError, Result};

pub struct PageFile {
    path: PathBuf,
    file: Option<File>,
}

impl PageFile {
    /// Creates the file on disk and syncs it. Fails if it already exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => MareaError::Storage(format!(
                    "file '{}' already exists",
                    path.display()
                )),
                _ => MareaError::Io(err),
            })?;
        file.sync_all()?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Wraps an existing on-disk file without opening it yet.
    pub fn closed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component of the path.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn ensure_open(&mut self) -> Result<&File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|err| match err.kind() {
                    io::ErrorKind::NotFound => MareaError::Storage(format!(
                        "file '{}' does not exist",
                        self.path.display()
                    )),
                    _ => MareaError::Io(err),
                })?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().expect("file opened above"))
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(fs::metadata(&self.path)?.len()),
        }
    }

    /// Extends the file by `bytes`. The extension is not zero-guaranteed on
    /// every filesystem, which is why callers track not-yet-flushed pages for
    /// the free-space accounting.
    pub fn allocate(&mut self, bytes: u64) -> Result<()> {
        let size = self.size()?;
        let file = self.ensure_open()?;
        file.set_len(size + bytes)?;
        Ok(())
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let file = self.ensure_open()?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        let file = self.ensure_open()?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.ensure_open()?;
        read_exact_at(file, offset, buf)?;
        Ok(())
    }

    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.ensure_open()?;
        write_all_at(file, offset, buf)?;
        Ok(())
    }

    /// Gathered positioned write of physically adjacent buffers.
    pub fn writev_at(&mut self, offset: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        let file = self.ensure_open()?;
        writev_at(file, offset, bufs)?;
        Ok(())
    }

    /// Renames the underlying file. The handle is closed first and reopens
    /// lazily under the new path.
    pub fn rename_to(&mut self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        self.file = None;
        fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// Closes and removes the file from disk.
    pub fn delete(&mut self) -> Result<()> {
        self.file = None;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let read = file.seek_read(buf, offset)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        buf = &mut buf[read..];
        offset += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn writev_at(file: &File, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let total: usize = bufs.iter().map(|buf| buf.len()).sum();
    let written = loop {
        let res = unsafe {
            libc::pwritev(
                file.as_raw_fd(),
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
                offset as libc::off_t,
            )
        };
        if res >= 0 {
            break res as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    if written == total {
        return Ok(());
    }
    // Short vectored write; finish the tail with plain positioned writes.
    finish_writev(file, offset, bufs, written)
}

#[cfg(not(unix))]
fn writev_at(file: &File, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<()> {
    finish_writev(file, offset, bufs, 0)
}

fn finish_writev(
    file: &File,
    offset: u64,
    bufs: &[IoSlice<'_>],
    mut skip: usize,
) -> io::Result<()> {
    let mut position = offset + skip as u64;
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        write_all_at(file, position, &buf[skip..])?;
        position += (buf.len() - skip) as u64;
        skip = 0;
    }
    Ok(())
}

/// Usable bytes on the filesystem holding `path`. Returns `u64::MAX` when the
/// mount point cannot be resolved, which disables low-space warnings rather
/// than producing false alarms.
pub fn usable_space(path: &Path) -> u64 {
    let Ok(canonical) = path.canonicalize() else {
        return u64::MAX;
    };
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .unwrap_or(u64::MAX)
}
