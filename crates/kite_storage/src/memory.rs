//! In-memory reference engine.
//!
//! One `RwLock` guards the whole CF set, which makes batch writes atomic
//! across families for free. Snapshots clone each family into an `Arc`;
//! iterators clone the `Arc` of their family, so a snapshot's data stays
//! readable until the last cursor drops.
//!
//! Checkpoint files use a small record format:
//!
//! ```text
//!   magic "KSST" (4) | format version u32 | entry count u64
//!   entries: [key_len u32][value_len u32][key][value] ...
//!   crc32 over all entry bytes (4)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kite_common::error::RawError;
use kite_common::types::hex;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::{
    EngineIterator, EngineSnapshot, IteratorOptions, RawEngine, SstFileMeta, WriteBatch, WriteOp,
    DEFAULT_CF_NAMES,
};

const CHECKPOINT_MAGIC: &[u8; 4] = b"KSST";
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_MANIFEST: &str = "MANIFEST.json";

type CfMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory column-family engine.
pub struct MemoryEngine {
    cfs: RwLock<HashMap<String, CfMap>>,
    cf_names: Vec<String>,
}

impl MemoryEngine {
    /// Engine with the built-in CF list.
    pub fn new() -> Self {
        Self::with_cf_names(DEFAULT_CF_NAMES.iter().map(|s| s.to_string()).collect())
    }

    pub fn with_cf_names(cf_names: Vec<String>) -> Self {
        let cfs = cf_names
            .iter()
            .map(|name| (name.clone(), CfMap::new()))
            .collect();
        Self {
            cfs: RwLock::new(cfs),
            cf_names,
        }
    }

    fn check_key(key: &[u8]) -> Result<(), RawError> {
        if key.is_empty() {
            return Err(RawError::KeyEmpty);
        }
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn cf_of<'a>(
    cfs: &'a HashMap<String, CfMap>,
    name: &str,
) -> Result<&'a CfMap, RawError> {
    cfs.get(name).ok_or_else(|| RawError::CfNotFound(name.to_string()))
}

fn cf_of_mut<'a>(
    cfs: &'a mut HashMap<String, CfMap>,
    name: &str,
) -> Result<&'a mut CfMap, RawError> {
    cfs.get_mut(name).ok_or_else(|| RawError::CfNotFound(name.to_string()))
}

impl RawEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn cf_names(&self) -> Vec<String> {
        self.cf_names.clone()
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, RawError> {
        Self::check_key(key)?;
        let cfs = self.cfs.read();
        Ok(cf_of(&cfs, cf)?.get(key).cloned())
    }

    fn multi_get(&self, cf: &str, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, RawError> {
        let cfs = self.cfs.read();
        let map = cf_of(&cfs, cf)?;
        keys.iter()
            .map(|key| {
                Self::check_key(key)?;
                Ok(map.get(key).cloned())
            })
            .collect()
    }

    fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<(), RawError> {
        Self::check_key(key)?;
        let mut cfs = self.cfs.write();
        cf_of_mut(&mut cfs, cf)?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: &str, key: &[u8]) -> Result<(), RawError> {
        Self::check_key(key)?;
        let mut cfs = self.cfs.write();
        cf_of_mut(&mut cfs, cf)?.remove(key);
        Ok(())
    }

    fn delete_range(&self, cf: &str, start_key: &[u8], end_key: &[u8]) -> Result<(), RawError> {
        let mut cfs = self.cfs.write();
        let map = cf_of_mut(&mut cfs, cf)?;
        let doomed: Vec<Vec<u8>> = map
            .range::<[u8], _>((Bound::Included(start_key), range_upper(end_key)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), RawError> {
        let mut cfs = self.cfs.write();
        // Validate up front so a bad op leaves nothing applied.
        for op in batch.ops() {
            cf_of(&cfs, op.cf())?;
            if let WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } = op {
                Self::check_key(key)?;
            }
        }
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { cf, key, value } => {
                    cf_of_mut(&mut cfs, &cf)?.insert(key, value);
                }
                WriteOp::Delete { cf, key } => {
                    cf_of_mut(&mut cfs, &cf)?.remove(&key);
                }
                WriteOp::DeleteRange {
                    cf,
                    start_key,
                    end_key,
                } => {
                    let map = cf_of_mut(&mut cfs, &cf)?;
                    let doomed: Vec<Vec<u8>> = map
                        .range::<[u8], _>((
                            Bound::Included(start_key.as_slice()),
                            range_upper(&end_key),
                        ))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn put_if_absent(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<bool, RawError> {
        Self::check_key(key)?;
        let mut cfs = self.cfs.write();
        let map = cf_of_mut(&mut cfs, cf)?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn compare_and_set(
        &self,
        cf: &str,
        key: &[u8],
        expect: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool, RawError> {
        Self::check_key(key)?;
        let mut cfs = self.cfs.write();
        let map = cf_of_mut(&mut cfs, cf)?;
        let current = map.get(key).map(|v| v.as_slice());
        if current != expect {
            return Ok(false);
        }
        match value {
            Some(v) => {
                map.insert(key.to_vec(), v.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }

    fn snapshot(&self) -> Arc<dyn EngineSnapshot> {
        let cfs = self.cfs.read();
        let frozen = cfs
            .iter()
            .map(|(name, map)| (name.clone(), Arc::new(map.clone())))
            .collect();
        Arc::new(MemorySnapshot { cfs: frozen })
    }

    fn approximate_size(
        &self,
        cf: &str,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<u64, RawError> {
        let cfs = self.cfs.read();
        let map = cf_of(&cfs, cf)?;
        let size = map
            .range::<[u8], _>((Bound::Included(start_key), range_upper(end_key)))
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        Ok(size)
    }

    fn checkpoint(&self, dir: &Path) -> Result<(), RawError> {
        fs::create_dir_all(dir)?;
        let snapshot = {
            let cfs = self.cfs.read();
            cfs.clone()
        };
        let mut manifest = CheckpointManifest::default();
        for (cf, map) in &snapshot {
            if map.is_empty() {
                continue;
            }
            let meta = write_cf_file(cf, map, dir)?;
            manifest.files.push(CheckpointFile {
                cf: cf.clone(),
                meta,
            });
        }
        let manifest_path = dir.join(CHECKPOINT_MANIFEST);
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| RawError::Codec(e.to_string()))?;
        fs::write(manifest_path, raw)?;
        tracing::info!(dir = %dir.display(), files = manifest.files.len(), "checkpoint written");
        Ok(())
    }

    fn export_cf(&self, cf: &str, dir: &Path) -> Result<Vec<SstFileMeta>, RawError> {
        fs::create_dir_all(dir)?;
        let map = {
            let cfs = self.cfs.read();
            cf_of(&cfs, cf)?.clone()
        };
        if map.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![write_cf_file(cf, &map, dir)?])
    }

    fn ingest(&self, cf: &str, files: &[PathBuf]) -> Result<(), RawError> {
        let mut incoming = CfMap::new();
        for path in files {
            read_cf_file(path, &mut incoming)?;
        }
        let mut cfs = self.cfs.write();
        let map = cf_of_mut(&mut cfs, cf)?;
        for (key, value) in incoming {
            map.insert(key, value);
        }
        Ok(())
    }
}

/// Frozen view over all CFs.
struct MemorySnapshot {
    cfs: HashMap<String, Arc<CfMap>>,
}

impl EngineSnapshot for MemorySnapshot {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, RawError> {
        let map = self
            .cfs
            .get(cf)
            .ok_or_else(|| RawError::CfNotFound(cf.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn iter(&self, cf: &str, opts: IteratorOptions) -> Result<Box<dyn EngineIterator>, RawError> {
        let map = self
            .cfs
            .get(cf)
            .ok_or_else(|| RawError::CfNotFound(cf.to_string()))?;
        Ok(Box::new(MemoryIterator {
            map: Arc::clone(map),
            opts,
            prefix: None,
            current: None,
        }))
    }
}

fn range_upper(end_key: &[u8]) -> Bound<&[u8]> {
    if end_key.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end_key)
    }
}

/// Cursor over one frozen CF. Holds an `Arc` of the family's map, which is
/// what keeps the snapshot's data alive.
struct MemoryIterator {
    map: Arc<CfMap>,
    opts: IteratorOptions,
    /// Seek prefix remembered when `prefix_mode` is set.
    prefix: Option<Vec<u8>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemoryIterator {
    fn in_bounds(&self, key: &[u8]) -> bool {
        if !self.opts.lower_bound.is_empty() && key < self.opts.lower_bound.as_slice() {
            return false;
        }
        if !self.opts.upper_bound.is_empty() && key >= self.opts.upper_bound.as_slice() {
            return false;
        }
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix) {
                return false;
            }
        }
        true
    }

    fn settle(&mut self, entry: Option<(Vec<u8>, Vec<u8>)>) {
        self.current = match entry {
            Some((k, v)) if self.in_bounds(&k) => Some((k, v)),
            _ => None,
        };
    }

    fn first_at_or_after(&self, target: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let from = if target < self.opts.lower_bound.as_slice() {
            self.opts.lower_bound.as_slice()
        } else {
            target
        };
        self.map
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

impl EngineIterator for MemoryIterator {
    fn seek(&mut self, target: &[u8]) {
        if self.opts.prefix_mode {
            self.prefix = Some(target.to_vec());
        }
        let entry = self.first_at_or_after(target);
        self.settle(entry);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        if self.opts.prefix_mode {
            self.prefix = Some(target.to_vec());
        }
        let upper = self.opts.upper_bound.as_slice();
        let entry = if !upper.is_empty() && target >= upper {
            self.map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(upper)))
                .next_back()
        } else {
            self.map
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(target)))
                .next_back()
        };
        self.settle(entry.map(|(k, v)| (k.clone(), v.clone())));
    }

    fn seek_to_first(&mut self) {
        let entry = self
            .map
            .range::<[u8], _>((
                Bound::Included(self.opts.lower_bound.as_slice()),
                Bound::Unbounded,
            ))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(entry);
    }

    fn seek_to_last(&mut self) {
        let upper = self.opts.upper_bound.as_slice();
        let entry = if upper.is_empty() {
            self.map.iter().next_back()
        } else {
            self.map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(upper)))
                .next_back()
        };
        self.settle(entry.map(|(k, v)| (k.clone(), v.clone())));
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let entry = self
            .map
            .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(entry);
    }

    fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let entry = self
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        self.settle(entry);
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointManifest {
    files: Vec<CheckpointFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    cf: String,
    meta: SstFileMeta,
}

fn write_cf_file(cf: &str, map: &CfMap, dir: &Path) -> Result<SstFileMeta, RawError> {
    let name = format!("{cf}.kst");
    let path = dir.join(&name);
    let mut body = Vec::new();
    for (key, value) in map {
        body.extend_from_slice(&(key.len() as u32).to_le_bytes());
        body.extend_from_slice(&(value.len() as u32).to_le_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(value);
    }
    let crc = crc32fast::hash(&body);

    let mut file = fs::File::create(&path)?;
    file.write_all(CHECKPOINT_MAGIC)?;
    file.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
    file.write_all(&(map.len() as u64).to_le_bytes())?;
    file.write_all(&body)?;
    file.write_all(&crc.to_le_bytes())?;
    file.sync_all()?;

    let smallest = map.keys().next().cloned().unwrap_or_default();
    let largest = map.keys().next_back().cloned().unwrap_or_default();
    Ok(SstFileMeta {
        level: 0,
        name,
        path,
        smallest_key: smallest,
        largest_key: largest,
    })
}

fn read_cf_file(path: &Path, out: &mut CfMap) -> Result<(), RawError> {
    let mut raw = Vec::new();
    fs::File::open(path)?.read_to_end(&mut raw)?;
    let corrupt = |detail: &str| RawError::Corruption {
        key_hex: hex(path.to_string_lossy().as_bytes()),
        detail: detail.to_string(),
    };

    if raw.len() < 20 || &raw[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupt("bad magic or truncated header"));
    }
    let version = u32::from_le_bytes(raw[4..8].try_into().unwrap_or_default());
    if version != CHECKPOINT_VERSION {
        return Err(corrupt("unknown format version"));
    }
    let count = u64::from_le_bytes(raw[8..16].try_into().unwrap_or_default());
    let body = &raw[16..raw.len() - 4];
    let stored_crc = u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap_or_default());
    if crc32fast::hash(body) != stored_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let mut pos = 0usize;
    for _ in 0..count {
        if pos + 8 > body.len() {
            return Err(corrupt("truncated entry header"));
        }
        let klen = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap_or_default()) as usize;
        let vlen =
            u32::from_le_bytes(body[pos + 4..pos + 8].try_into().unwrap_or_default()) as usize;
        pos += 8;
        if pos + klen + vlen > body.len() {
            return Err(corrupt("truncated entry body"));
        }
        let key = body[pos..pos + klen].to_vec();
        let value = body[pos + klen..pos + klen + vlen].to_vec();
        pos += klen + vlen;
        out.insert(key, value);
    }
    Ok(())
}
