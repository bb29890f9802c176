//! Snapshot file backing the config store.
//!
//! The whole store is written as one JSON document with base64 encoded values. Writes go to a
//! sibling temp file which is then renamed over the snapshot, so a crash mid-write leaves the
//! previous snapshot intact.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};

/// One bucket: resource ID to raw resource bytes
pub(crate) type Bucket = BTreeMap<String, Bytes>;

pub(crate) type Buckets = BTreeMap<String, Bucket>;

/// Buckets as held by the live store, each shared copy-on-write
pub(crate) type SharedBuckets = BTreeMap<String, Arc<Bucket>>;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    buckets: BTreeMap<String, BTreeMap<String, String>>,
}

/// Read the snapshot at `path`; a missing file is an empty store
pub(crate) fn load(path: &Path) -> GatewayResult<Buckets> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Buckets::new()),
        Err(e) => {
            return Err(GatewayError::store(format!(
                "Failed to read store file {}: {}",
                path.display(),
                e
            )))
        }
    };

    let snapshot: SnapshotFile = serde_json::from_slice(&content).map_err(|e| {
        GatewayError::store(format!("Corrupt store file {}: {}", path.display(), e))
    })?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(GatewayError::store(format!(
            "Unsupported store file version {} in {}",
            snapshot.version,
            path.display()
        )));
    }

    let mut buckets = Buckets::new();
    for (bucket, entries) in snapshot.buckets {
        let mut decoded = BTreeMap::new();
        for (id, value) in entries {
            let bytes = STANDARD.decode(value.as_bytes()).map_err(|e| {
                GatewayError::store(format!("Corrupt value for {}/{}: {}", bucket, id, e))
            })?;
            decoded.insert(id, Bytes::from(bytes));
        }
        buckets.insert(bucket, decoded);
    }

    Ok(buckets)
}

/// Atomically replace the snapshot at `path` with `buckets`
pub(crate) fn save(path: &Path, buckets: &SharedBuckets) -> GatewayResult<()> {
    let snapshot = SnapshotFile {
        version: SNAPSHOT_VERSION,
        buckets: buckets
            .iter()
            .map(|(bucket, entries)| {
                let encoded = entries
                    .iter()
                    .map(|(id, value)| (id.clone(), STANDARD.encode(value)))
                    .collect();
                (bucket.clone(), encoded)
            })
            .collect(),
    };

    let content = serde_json::to_vec(&snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            GatewayError::store(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let tmp = temp_path(path);
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        GatewayError::store(format!("Failed to write store file {}: {}", path.display(), e))
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
