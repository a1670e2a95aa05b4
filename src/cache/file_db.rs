//! File fingerprint cache (4.B): per-`(build-dir, config)` cache of file
//! last-write-times and their declared dependency hashes, backed by a
//! compacted snapshot plus append-only per-process delta logs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::cache::lockfile::FileLock;
use crate::cache::record::{self, FileRecord};
use crate::cache::sharded::ShardedMap;
use crate::error::{Error, Result};

const SNAPSHOT_NAME: &str = "files.bin";
const SAVE_RESERVE_BYTES: usize = 10 * 1024 * 1024;

/// Reads the current last-write-time off the filesystem, in nanoseconds
/// since the platform epoch, matching the record format's unit. Returns
/// `None` if the file doesn't exist or its metadata can't be read.
pub fn fs_last_write_nanos(path: &Path) -> Option<i64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let duration = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(duration.as_nanos() as i64)
}

pub fn hash_path(path: &Path) -> u64 {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

pub struct FileCache {
    dir: PathBuf,
    map: ShardedMap<u64, FileRecord>,
    log_path: PathBuf,
    log_buf: Mutex<Vec<u8>>,
}

static LOG_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileCache {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::filesystem(dir, e))?;

        let map = ShardedMap::new();
        let snapshot_path = dir.join(SNAPSHOT_NAME);
        // CorruptDb recovers locally (§7): discard the snapshot and rebuild
        // the cache from scratch rather than failing the whole build.
        if let Err(e) = load_snapshot(&snapshot_path, &map) {
            tracing::warn!(path = %snapshot_path.display(), error = %e, "discarding corrupt file cache snapshot");
        }
        apply_logs(dir, &map)?;

        let seq = LOG_COUNTER.fetch_add(1, Ordering::Relaxed);
        let module_hash = Sha256::digest(format!("{}-{}", std::process::id(), seq).as_bytes());
        let log_name = format!("log_{:016x}.bin", u64::from_be_bytes(module_hash[..8].try_into().unwrap()));

        Ok(FileCache {
            dir: dir.to_path_buf(),
            map,
            log_path: dir.join(log_name),
            log_buf: Mutex::new(Vec::new()),
        })
    }

    /// Looks up the cached fingerprint for `path`.
    pub fn lookup(&self, path: &Path) -> Option<FileRecord> {
        self.map.get(&hash_path(path))
    }

    pub fn lookup_by_hash(&self, path_hash: u64) -> Option<FileRecord> {
        self.map.get(&path_hash)
    }

    /// Resolves a record's declared dependency hashes to the records
    /// currently known for them (4.B step 6: "second pass" resolution).
    pub fn resolve_deps(&self, record: &FileRecord) -> Vec<Option<FileRecord>> {
        record.dep_hashes.iter().map(|h| self.map.get(h)).collect()
    }

    /// Records a fresh fingerprint: updates the in-memory map (keeping the
    /// greater last-write-time on collision) and appends to this process's
    /// log buffer, which is only flushed to disk under an exclusive lock.
    pub fn record_file(&self, path: &Path, last_write_nanos: i64, dep_hashes: Vec<u64>) {
        let record = FileRecord {
            path_hash: hash_path(path),
            path: path.to_string_lossy().into_owned(),
            last_write_nanos,
            dep_hashes,
        };
        self.map.upsert_with(record.path_hash, record.clone(), |existing, new| {
            existing.last_write_nanos >= new.last_write_nanos
        });

        let mut buf = self.log_buf.lock().unwrap();
        record::write_frame(&mut buf, &record.encode());
    }

    /// Flushes the in-process log buffer to `log_<hash>.bin` under an
    /// exclusive lock held only for the duration of the append.
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

    /// Merge-before-save: reads whatever snapshot is currently on disk,
    /// merges it with the in-memory map (greatest last-write-time wins), and
    /// atomically rewrites the snapshot with the union. Resolves the open
    /// question in 4.B/§9: concurrent writers must not clobber each other's
    /// progress by overwriting wholesale.
    pub fn save(&self) -> Result<()> {
        self.flush_log()?;

        std::fs::create_dir_all(&self.dir).map_err(|e| Error::filesystem(&self.dir, e))?;
        let snapshot_path = self.dir.join(SNAPSHOT_NAME);

        let on_disk = ShardedMap::new();
        load_snapshot(&snapshot_path, &on_disk)?;

        for (key, value) in self.map.snapshot() {
            on_disk.upsert_with(key, value, |existing, new| existing.last_write_nanos >= new.last_write_nanos);
        }

        let mut buf = Vec::with_capacity(SAVE_RESERVE_BYTES.min(1 << 20));
        for (_, record) in on_disk.snapshot() {
            record::write_frame(&mut buf, &record.encode());
        }

        write_atomic(&snapshot_path, &buf)?;
        remove_consumed_logs(&self.dir)?;
        Ok(())
    }
}

fn load_snapshot(path: &Path, map: &ShardedMap<u64, FileRecord>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let _lock = FileLock::shared(path)?;
    let data = std::fs::read(path).map_err(|e| Error::filesystem(path, e))?;
    let (records, malformed) = record::parse_all(&data, FileRecord::decode);
    record::corrupt_if_malformed(path, malformed)?;
    for r in records {
        map.upsert_with(r.path_hash, r, |existing, new| existing.last_write_nanos >= new.last_write_nanos);
    }
    Ok(())
}

fn apply_logs(dir: &Path, map: &ShardedMap<u64, FileRecord>) -> Result<()> {
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
        let (records, _malformed) = record::parse_all(&data, FileRecord::decode);
        for r in records {
            map.upsert_with(r.path_hash, r, |existing, new| existing.last_write_nanos >= new.last_write_nanos);
        }
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}

fn remove_consumed_logs(dir: &Path) -> Result<()> {
    apply_logs(dir, &ShardedMap::new())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::filesystem(path, e))?;
    use std::io::Write;
    tmp.write_all(data).map_err(|e| Error::filesystem(path, e))?;
    tmp.persist(path).map_err(|e| Error::filesystem(path, e.error))?;
    Ok(())
}
