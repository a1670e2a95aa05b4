//! Command result cache (4.C): same on-disk mechanics as the file fingerprint
//! cache, but records map a command's key to the hash of its outputs after
//! the command last ran successfully.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::cache::lockfile::FileLock;
use crate::cache::record::{self, CommandRecord};
use crate::cache::sharded::ShardedMap;
use crate::error::{Error, Result};

const SNAPSHOT_NAME: &str = "commands.bin";

pub struct CommandCache {
    dir: PathBuf,
    map: ShardedMap<u64, u64>,
    log_path: PathBuf,
    log_buf: Mutex<Vec<u8>>,
}

impl CommandCache {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::filesystem(dir, e))?;

        let map = ShardedMap::new();
        let snapshot_path = dir.join(SNAPSHOT_NAME);
        if let Err(e) = load_snapshot(&snapshot_path, &map) {
            tracing::warn!(path = %snapshot_path.display(), error = %e, "discarding corrupt command cache snapshot");
        }
        apply_logs(dir, &map)?;

        let module_hash = Sha256::digest(format!("{}", std::process::id()).as_bytes());
        let log_name = format!("log_{:016x}.bin", u64::from_be_bytes(module_hash[..8].try_into().unwrap()));

        Ok(CommandCache {
            dir: dir.to_path_buf(),
            map,
            log_path: dir.join(log_name),
            log_buf: Mutex::new(Vec::new()),
        })
    }

    /// Returns the recorded outputs-hash for `command_key`, if any.
    pub fn get(&self, command_key: u64) -> Option<u64> {
        self.map.get(&command_key)
    }

    /// Whether `command_key` has a recorded outputs-hash at all. This is
    /// only one of the three hit-test conditions from 4.C — the caller
    /// (scheduler) additionally checks that every declared output file
    /// exists and every declared input's fingerprint still matches the
    /// filesystem before treating the command as a cache hit.
    pub fn has_record(&self, command_key: u64) -> bool {
        self.get(command_key).is_some()
    }

    pub fn record(&self, command_key: u64, outputs_hash: u64) {
        self.map.insert(command_key, outputs_hash);
        let record = CommandRecord { command_key, outputs_hash };
        let mut buf = self.log_buf.lock().unwrap();
        record::write_frame(&mut buf, &record.encode());
    }

    pub fn flush_log(&self) -> Result<()> {
        let buf = self.log_buf.lock().unwrap();
        if buf.is_empty() {
            return Ok(());
        }
        let mut lock = FileLock::exclusive(&self.log_path)?;
        use std::io::Write;
        lock.file_mut().write_all(&buf).map_err(|e| Error::filesystem(&self.log_path, e))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.flush_log()?;
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::filesystem(&self.dir, e))?;
        let snapshot_path = self.dir.join(SNAPSHOT_NAME);

        let on_disk = ShardedMap::new();
        load_snapshot(&snapshot_path, &on_disk)?;
        for (key, value) in self.map.snapshot() {
            on_disk.insert(key, value);
        }

        let mut buf = Vec::new();
        for (key, outputs_hash) in on_disk.snapshot() {
            record::write_frame(&mut buf, &CommandRecord { command_key: key, outputs_hash }.encode());
        }
        write_atomic(&snapshot_path, &buf)?;
        apply_logs(&self.dir, &ShardedMap::new())?;
        Ok(())
    }
}

fn load_snapshot(path: &Path, map: &ShardedMap<u64, u64>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let _lock = FileLock::shared(path)?;
    let data = std::fs::read(path).map_err(|e| Error::filesystem(path, e))?;
    let (records, malformed) = record::parse_all(&data, CommandRecord::decode);
    record::corrupt_if_malformed(path, malformed)?;
    for r in records {
        map.insert(r.command_key, r.outputs_hash);
    }
    Ok(())
}

fn apply_logs(dir: &Path, map: &ShardedMap<u64, u64>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("log_") || !name.ends_with(".bin") {
            continue;
        }
        let path = entry.path();
        let data = std::fs::read(&path).unwrap_or_default();
        let (records, _malformed) = record::parse_all(&data, CommandRecord::decode);
        for r in records {
            map.insert(r.command_key, r.outputs_hash);
        }
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::filesystem(path, e))?;
    use std::io::Write;
    tmp.write_all(data).map_err(|e| Error::filesystem(path, e))?;
    tmp.persist(path).map_err(|e| Error::filesystem(path, e.error))?;
    Ok(())
}
