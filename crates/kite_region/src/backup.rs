//! Backup and restore hooks.
//!
//! A backup is a set of per-CF SST groups produced from a checkpoint of the
//! region's engine; restore validates every file's key range against the
//! region's range before handing the files to the engine's ingest.

use std::path::Path;

use kite_common::error::{KiteResult, RawError};
use kite_common::types::{hex, RegionId};
use kite_mvcc::codec::{decode_key, decode_plain_key};
use kite_storage::engine::{RawEngine, SstFileMeta, CF_META};
use serde::{Deserialize, Serialize};

use crate::engine::RegionEngine;
use crate::region::RawEngineKind;

/// The per-CF file group a backup stream carries for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SstMetaGroup {
    pub cf: String,
    pub files: Vec<SstFileMeta>,
}

impl RegionEngine {
    /// Checkpoint an engine's full CF set into `dir` (hard-linked on
    /// engines that support it; a readable copy otherwise).
    pub fn checkpoint(&self, kind: RawEngineKind, dir: &Path) -> KiteResult<()> {
        let engine = self
            .engine_by_kind(kind)
            .ok_or_else(|| RawError::IllegalParameters(format!("no engine bound for {kind:?}")))?;
        engine.checkpoint(dir)?;
        Ok(())
    }

    /// Export a region's column families as SST groups under `dir`.
    pub fn backup_region(
        &self,
        region_id: RegionId,
        dir: &Path,
    ) -> KiteResult<Vec<SstMetaGroup>> {
        let handle = self.handle(region_id)?;
        let mut groups = Vec::new();
        for cf in handle.engine.cf_names() {
            // Store-local metadata never travels in a backup stream.
            if cf == CF_META {
                continue;
            }
            let cf_dir = dir.join(region_id.to_string()).join(&cf);
            let files = handle.engine.export_cf(&cf, &cf_dir)?;
            if !files.is_empty() {
                groups.push(SstMetaGroup { cf, files });
            }
        }
        tracing::info!(region = region_id, groups = groups.len(), "region backup produced");
        Ok(groups)
    }

    /// Ingest backup groups into the region after range validation: every
    /// file's smallest and largest plain keys must fall inside the region.
    pub fn restore_region(
        &self,
        region_id: RegionId,
        groups: &[SstMetaGroup],
    ) -> KiteResult<()> {
        let handle = self.handle(region_id)?;
        let range = handle.region.range();

        for group in groups {
            for file in &group.files {
                for boundary in [&file.smallest_key, &file.largest_key] {
                    if boundary.is_empty() {
                        continue;
                    }
                    let plain = plain_boundary(boundary);
                    if !range.contains(&plain) {
                        return Err(RawError::IllegalParameters(format!(
                            "backup file {} key {} outside region {} range {}",
                            file.name,
                            hex(&plain),
                            region_id,
                            range,
                        ))
                        .into());
                    }
                }
            }
        }

        for group in groups {
            let paths: Vec<_> = group.files.iter().map(|f| f.path.clone()).collect();
            handle.engine.ingest(&group.cf, &paths)?;
        }
        tracing::info!(region = region_id, groups = groups.len(), "region restore finished");
        Ok(())
    }
}

/// Plain key of a storage-key boundary, tolerant of unversioned rows.
fn plain_boundary(storage_key: &[u8]) -> Vec<u8> {
    if let Ok((_, plain, _)) = decode_key(storage_key) {
        return plain;
    }
    decode_plain_key(storage_key)
        .map(|(_, plain)| plain)
        .unwrap_or_else(|_| storage_key.to_vec())
}
