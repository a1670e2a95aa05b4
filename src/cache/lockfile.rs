//! File locking via `flock(2)`, adapted from the teacher's companion-lockfile
//! pattern but applied directly to the cache's own data file rather than a
//! separate `.lock` sidecar — callers hold a shared lock while reading the
//! snapshot and an exclusive lock only while appending or rewriting it.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Error, Result};

pub struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::filesystem(path, e))
    }

    /// Acquires a shared (read) lock, blocking until available.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) };
        if rc != 0 {
            return Err(Error::filesystem(path, std::io::Error::last_os_error()));
        }
        Ok(FileLock { file })
    }

    /// Acquires an exclusive (write) lock, blocking until available.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::filesystem(path, std::io::Error::last_os_error()));
        }
        Ok(FileLock { file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
