//! Shared record framing for the file fingerprint cache (4.B) and the
//! command result cache (4.C). Both caches share one on-disk mechanic: a
//! stream of length-prefixed records that tolerates a torn (partially
//! written) trailing record without treating it as an error.

use crate::error::{Error, Result};

/// A length-prefixed frame reader over an in-memory buffer. Stops cleanly
/// (returns `None`) the instant the remaining bytes can't hold a full frame,
/// which is exactly what a crash mid-append leaves behind.
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FrameReader { data, pos: 0 }
    }

    /// Returns the payload of the next frame, or `None` on clean EOF or a
    /// torn trailing frame.
    pub fn next_frame(&mut self) -> Option<&'a [u8]> {
        if self.data.len() - self.pos < 8 {
            return None;
        }
        let len = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap()) as usize;
        let payload_start = self.pos + 8;
        if self.data.len() - payload_start < len {
            return None;
        }
        let payload = &self.data[payload_start..payload_start + len];
        self.pos = payload_start + len;
        Some(payload)
    }
}

/// Frames `payload` as `len:u64 ∥ payload` and appends it to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
}

/// A small forward cursor over a frame payload, used by the per-record
/// decoders below. Running past the end of the payload is a malformed
/// record, distinct from a torn frame (which `FrameReader` already filters
/// out): it surfaces as a decode failure the caller turns into `CorruptDb`
/// or treats as "stop parsing further" depending on which file it came from.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn nul_terminated_string(&mut self) -> Option<String> {
        let rest = &self.data[self.pos..];
        let nul_pos = rest.iter().position(|&b| b == 0)?;
        let s = std::str::from_utf8(&rest[..nul_pos]).ok()?.to_string();
        self.pos += nul_pos + 1;
        Some(s)
    }
}

/// `path-hash:u64 ∥ path:utf8-nul-terminated ∥ last-write-time:i64-nanos ∥
/// n-deps:u64 ∥ dep-hash:u64 × n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path_hash: u64,
    pub path: String,
    pub last_write_nanos: i64,
    pub dep_hashes: Vec<u64>,
}

impl FileRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.path_hash.to_le_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.last_write_nanos.to_le_bytes());
        buf.extend_from_slice(&(self.dep_hashes.len() as u64).to_le_bytes());
        for h in &self.dep_hashes {
            buf.extend_from_slice(&h.to_le_bytes());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Option<FileRecord> {
        let mut c = Cursor::new(payload);
        let path_hash = c.u64()?;
        let path = c.nul_terminated_string()?;
        let last_write_nanos = c.i64()?;
        let n_deps = c.u64()? as usize;
        let mut dep_hashes = Vec::with_capacity(n_deps.min(1024));
        for _ in 0..n_deps {
            dep_hashes.push(c.u64()?);
        }
        Some(FileRecord { path_hash, path, last_write_nanos, dep_hashes })
    }
}

/// `command-key:u64 ∥ outputs-hash:u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub command_key: u64,
    pub outputs_hash: u64,
}

impl CommandRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.command_key.to_le_bytes());
        buf.extend_from_slice(&self.outputs_hash.to_le_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Option<CommandRecord> {
        let mut c = Cursor::new(payload);
        let command_key = c.u64()?;
        let outputs_hash = c.u64()?;
        Some(CommandRecord { command_key, outputs_hash })
    }
}

/// Parses every complete frame in `data` as a `T`, stopping cleanly at the
/// first torn frame or the first frame that fails to decode as a well-formed
/// record. Malformed-but-complete frames are reported to the caller so the
/// snapshot (`files.bin`) and the log (`log_*.bin`) can apply the spec's
/// differing failure policy (corrupt vs. tolerated truncation).
pub fn parse_all<T>(data: &[u8], decode: impl Fn(&[u8]) -> Option<T>) -> (Vec<T>, bool) {
    let mut reader = FrameReader::new(data);
    let mut records = Vec::new();
    let mut malformed = false;
    while let Some(payload) = reader.next_frame() {
        match decode(payload) {
            Some(record) => records.push(record),
            None => {
                malformed = true;
                break;
            }
        }
    }
    (records, malformed)
}

pub fn corrupt_if_malformed(path: &std::path::Path, malformed: bool) -> Result<()> {
    if malformed {
        Err(Error::corrupt_db(path, "malformed record in snapshot"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_record_roundtrips() {
        let r = FileRecord {
            path_hash: 42,
            path: "src/main.rs".into(),
            last_write_nanos: 123456789,
            dep_hashes: vec![1, 2, 3],
        };
        let encoded = r.encode();
        let decoded = FileRecord::decode(&encoded).unwrap();
        assert_eq!(r, decoded);
    }

    #[test]
    fn command_record_roundtrips() {
        let r = CommandRecord { command_key: 7, outputs_hash: 99 };
        let decoded = CommandRecord::decode(&r.encode()).unwrap();
        assert_eq!(r, decoded);
    }

    #[test]
    fn frame_reader_stops_cleanly_on_torn_tail() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[1, 2, 3]);
        // torn trailing frame: length prefix claims more bytes than present.
        buf.extend_from_slice(&20u64.to_le_bytes());
        buf.extend_from_slice(&[9, 9]);

        let (records, malformed) = parse_all(&buf, |p| Some(p.to_vec()));
        assert_eq!(records, vec![vec![1u8, 2, 3]]);
        assert!(!malformed);
    }

    #[test]
    fn parse_all_stops_at_first_malformed_record() {
        let mut buf = Vec::new();
        let good = CommandRecord { command_key: 1, outputs_hash: 2 };
        write_frame(&mut buf, &good.encode());
        write_frame(&mut buf, &[0xff]); // too short to decode as CommandRecord
        write_frame(&mut buf, &CommandRecord { command_key: 3, outputs_hash: 4 }.encode());

        let (records, malformed) = parse_all(&buf, CommandRecord::decode);
        assert_eq!(records, vec![good]);
        assert!(malformed);
    }
}
