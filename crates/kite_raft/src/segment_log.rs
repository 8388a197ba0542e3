//! Segmented on-disk entry log, one directory per region.
//!
//! Layout: `{raft.log_path}/{region_id}/{first_index:016x}.seg`, rotated at
//! `segmentlog_max_segment_size`. Each segment starts with a fixed header
//! and carries length-prefixed, checksummed records:
//!
//! ```text
//!   header:  magic "KSEG" (4) | format version u32
//!   record:  [crc32 u32] [len u32] [index u64] [data]
//! ```
//!
//! Replay stops at the first record whose checksum or framing fails: a torn
//! tail from a crash is truncated with a warning and the log continues from
//! the last intact entry.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use kite_common::error::RawError;
use parking_lot::Mutex;

const SEGMENT_MAGIC: &[u8; 4] = b"KSEG";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_SIZE: u64 = 8;
const RECORD_HEADER_SIZE: usize = 16;

struct SegmentMeta {
    path: PathBuf,
    first_index: u64,
}

struct Inner {
    segments: Vec<SegmentMeta>,
    active: Option<File>,
    active_size: u64,
    next_index: u64,
}

/// Append-only segmented log for one region.
pub struct SegmentLog {
    dir: PathBuf,
    max_segment_size: u64,
    inner: Mutex<Inner>,
}

impl SegmentLog {
    /// Open (or create) the log directory and replay existing segments.
    pub fn open(dir: &Path, max_segment_size: u64) -> Result<Self, RawError> {
        fs::create_dir_all(dir)?;
        let mut segments = Vec::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "seg").unwrap_or(false))
            .collect();
        paths.sort();

        let mut next_index = 1u64;
        for path in paths {
            let entries = read_segment(&path)?;
            let first_index = entries.first().map(|(i, _)| *i).unwrap_or(next_index);
            if let Some((last, _)) = entries.last() {
                next_index = last + 1;
            }
            segments.push(SegmentMeta { path, first_index });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            max_segment_size,
            inner: Mutex::new(Inner {
                segments,
                active: None,
                active_size: 0,
                next_index,
            }),
        })
    }

    /// Durably append one entry; returns its index.
    pub fn append(&self, data: &[u8]) -> Result<u64, RawError> {
        let mut inner = self.inner.lock();
        let index = inner.next_index;

        if inner.active.is_none() || inner.active_size >= self.max_segment_size {
            self.roll_segment(&mut inner, index)?;
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
        let mut body = Vec::with_capacity(12 + data.len());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(data);
        record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        record.extend_from_slice(&body);

        let file = inner
            .active
            .as_mut()
            .ok_or_else(|| std::io::Error::other("active segment missing after roll"))?;
        file.write_all(&record)?;
        file.sync_data()?;

        inner.active_size += record.len() as u64;
        inner.next_index = index + 1;
        Ok(index)
    }

    fn roll_segment(&self, inner: &mut Inner, first_index: u64) -> Result<(), RawError> {
        let path = self.dir.join(format!("{first_index:016x}.seg"));
        // Truncate: the only way this path can pre-exist is an empty
        // segment left by a crash between roll and first append.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        file.sync_data()?;
        let replaces_last = inner
            .segments
            .last()
            .map(|s| s.path == path)
            .unwrap_or(false);
        if !replaces_last {
            inner.segments.push(SegmentMeta { path, first_index });
        }
        inner.active = Some(file);
        inner.active_size = SEGMENT_HEADER_SIZE;
        Ok(())
    }

    /// Entries with `index >= from`, in order.
    pub fn entries_from(&self, from: u64) -> Result<Vec<(u64, Vec<u8>)>, RawError> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (pos, segment) in inner.segments.iter().enumerate() {
            // Segments are ordered; a segment is entirely below the floor
            // when its successor starts at or below it.
            let next_first = inner.segments.get(pos + 1).map(|s| s.first_index);
            if next_first.map(|f| f <= from).unwrap_or(false) {
                continue;
            }
            for (index, data) in read_segment(&segment.path)? {
                if index >= from {
                    out.push((index, data));
                }
            }
        }
        Ok(out)
    }

    /// Next index `append` will assign.
    pub fn next_index(&self) -> u64 {
        self.inner.lock().next_index
    }

    /// Delete whole segments whose entries are all at or below `index`.
    /// The active (last) segment is never purged.
    pub fn purge_until(&self, index: u64) -> Result<(), RawError> {
        let mut inner = self.inner.lock();
        let firsts: Vec<u64> = inner.segments.iter().map(|s| s.first_index).collect();
        let old = std::mem::take(&mut inner.segments);
        let mut retained = Vec::with_capacity(old.len());
        for (pos, segment) in old.into_iter().enumerate() {
            let covered = firsts
                .get(pos + 1)
                .map(|&f| f <= index + 1)
                .unwrap_or(false);
            if covered {
                if let Err(e) = fs::remove_file(&segment.path) {
                    tracing::warn!(path = %segment.path.display(), error = %e, "purge segment failed");
                    retained.push(segment);
                }
            } else {
                retained.push(segment);
            }
        }
        inner.segments = retained;
        Ok(())
    }
}

fn read_segment(path: &Path) -> Result<Vec<(u64, Vec<u8>)>, RawError> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;

    if raw.len() < SEGMENT_HEADER_SIZE as usize
        || &raw[0..4] != SEGMENT_MAGIC
        || u32::from_le_bytes(raw[4..8].try_into().unwrap_or_default()) != SEGMENT_VERSION
    {
        return Err(RawError::Corruption {
            key_hex: String::new(),
            detail: format!("bad segment header in {}", path.display()),
        });
    }

    let mut out = Vec::new();
    let mut pos = SEGMENT_HEADER_SIZE as usize;
    while pos + RECORD_HEADER_SIZE <= raw.len() {
        let stored_crc = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap_or_default());
        let len =
            u32::from_le_bytes(raw[pos + 4..pos + 8].try_into().unwrap_or_default()) as usize;
        let body_end = pos + 4 + 12 + len;
        if body_end > raw.len() {
            tracing::warn!(path = %path.display(), offset = pos, "truncated record, dropping log tail");
            break;
        }
        let body = &raw[pos + 4..body_end];
        if crc32fast::hash(body) != stored_crc {
            tracing::warn!(path = %path.display(), offset = pos, "checksum mismatch, dropping log tail");
            break;
        }
        let index = u64::from_le_bytes(body[4..12].try_into().unwrap_or_default());
        out.push((index, body[12..].to_vec()));
        pos = body_end;
    }
    Ok(out)
}
