//! File-backed source dumps and target snapshots. Paths ending in `.gz`
//! are gzip-compressed JSON, everything else plain JSON.

use std::fs;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::MigrateError;
use crate::memory::{MemorySourceStore, TargetTables};

pub fn load_source(path: &Utf8Path) -> Result<MemorySourceStore, MigrateError> {
    let store: MemorySourceStore = read_json(path)?;
    info!(path = %path, tables = store.tables.len(), "source dump loaded");
    Ok(store)
}

/// A missing snapshot file is an empty target.
pub fn load_target(path: &Utf8Path) -> Result<TargetTables, MigrateError> {
    if !path.exists() {
        info!(path = %path, "no target snapshot yet, starting empty");
        return Ok(TargetTables::default());
    }
    let tables: TargetTables = read_json(path)?;
    debug!(path = %path, tables = tables.tables.len(), "target snapshot loaded");
    Ok(tables)
}

/// Writes next to `path` first and renames over it, so a failed write
/// leaves the previous snapshot intact.
pub fn save_target(path: &Utf8Path, tables: &TargetTables) -> Result<(), MigrateError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|err| MigrateError::Filesystem(format!("create {dir}: {err}")))?;

    let bytes = encode(path, tables)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".chado-snapshot")
        .tempfile_in(dir.as_std_path())
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    temp.write_all(&bytes)
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| MigrateError::Filesystem(format!("persist {path}: {}", err.error)))?;
    info!(path = %path, bytes = bytes.len(), "target snapshot saved");
    Ok(())
}

fn is_gzip(path: &Utf8Path) -> bool {
    path.extension() == Some("gz")
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, MigrateError> {
    let raw = fs::read(path).map_err(|err| MigrateError::Filesystem(format!("read {path}: {err}")))?;
    let text = if is_gzip(path) {
        let mut decoder = GzDecoder::new(raw.as_slice());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| MigrateError::SnapshotParse(format!("{path}: {err}")))?;
        text
    } else {
        String::from_utf8(raw).map_err(|err| MigrateError::SnapshotParse(format!("{path}: {err}")))?
    };
    serde_json::from_str(&text).map_err(|err| MigrateError::SnapshotParse(format!("{path}: {err}")))
}

fn encode<T: Serialize>(path: &Utf8Path, value: &T) -> Result<Vec<u8>, MigrateError> {
    let json = serde_json::to_vec_pretty(value).map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    if !is_gzip(path) {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| MigrateError::Filesystem(err.to_string()))
}
