//! Shared-directory reconciliation.
//!
//! Brings the engine's shared directory into conformance with a manifest
//! while transferring as little as possible:
//!
//! 1. Evict: every cached path whose hash differs from the manifest (or that
//!    the manifest no longer lists) loses its file and both cache records.
//!    All evictions are attempted; failures are raised together afterwards.
//! 2. Materialize: each manifest entry is reused if cached and present,
//!    restored from the cache if only the file is missing, or downloaded,
//!    verified, cached and written. Entries fail independently.
//!
//! Download failures are reported, not raised: the session still has to run
//! the engine and sync the user directory before raising them.

use crate::cache::SchemaCache;
use crate::error::{Error, Result};
use crate::fs::EngineFs;
use crate::manifest::Manifest;
use crate::source::SchemaSource;
use crate::utils::sha256_hex;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Outcome of a reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Paths evicted because their hash no longer matched
    pub evicted: Vec<String>,
    /// Paths that were cached and already materialized
    pub reused: Vec<String>,
    /// Paths written from cached content without a download
    pub restored: Vec<String>,
    /// Paths downloaded, cached and written
    pub fetched: Vec<String>,
    /// Per-file failures of the materialize pass
    pub failures: Vec<Error>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Download<'a> {
    raw: &'a str,
    key: String,
    hash: &'a str,
}

/// Run both passes. Only an eviction failure (or being unable to list the
/// cache at all) is returned as `Err`.
pub async fn reconcile(
    cache: &SchemaCache,
    fs: &mut dyn EngineFs,
    source: &dyn SchemaSource,
    manifest: &Manifest,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        evicted: evict_stale(cache, fs, &manifest.expected_hashes())?,
        ..Default::default()
    };

    let mut downloads = Vec::new();
    let mut claimed = BTreeSet::new();
    for entry in manifest.entries() {
        let Some(key) = entry.key else {
            warn!(path = entry.raw, "rejecting schema path");
            report.failures.push(Error::InvalidPath(entry.raw.to_string()));
            continue;
        };
        if !claimed.insert(key.clone()) {
            warn!(path = entry.raw, %key, "schema path collides with an earlier entry");
            report.failures.push(Error::InvalidPath(entry.raw.to_string()));
            continue;
        }
        match restore_from_cache(cache, fs, &key, entry.hash) {
            Ok(Restored::AlreadyPresent) => {
                debug!(path = %key, "schema file up to date");
                report.reused.push(key);
            }
            Ok(Restored::Written) => report.restored.push(key),
            Ok(Restored::Miss) => downloads.push(Download {
                raw: entry.raw,
                key,
                hash: entry.hash,
            }),
            Err(e) => {
                warn!(path = %key, error = %e, "schema file failed");
                report.failures.push(e);
            }
        }
    }

    let results = join_all(downloads.iter().map(|d| source.fetch(d.raw))).await;
    for (download, result) in downloads.into_iter().zip(results) {
        match store_download(cache, fs, source, &download, result) {
            Ok(()) => report.fetched.push(download.key),
            Err(e) => {
                warn!(path = %download.key, error = %e, "schema file failed");
                report.failures.push(e);
            }
        }
    }

    info!(
        evicted = report.evicted.len(),
        reused = report.reused.len(),
        restored = report.restored.len(),
        fetched = report.fetched.len(),
        failed = report.failures.len(),
        "reconciled shared directory"
    );
    Ok(report)
}

/// Diff pass: drop every cached path whose hash is not the expected one.
fn evict_stale(
    cache: &SchemaCache,
    fs: &mut dyn EngineFs,
    expected: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    let mut errors = Vec::new();
    for record in cache.entries()? {
        if expected.get(&record.path) == Some(&record.hash) {
            continue;
        }
        let mut ok = true;
        if fs.shared_exists(&record.path) {
            if let Err(e) = fs.remove_shared(&record.path) {
                errors.push(Error::filesystem(record.path.clone(), e));
                ok = false;
            }
        }
        if let Err(e) = cache.remove(&record.path) {
            errors.push(e.into());
            ok = false;
        }
        if ok {
            info!(path = %record.path, hash = %record.hash, "evicted stale schema file");
            evicted.push(record.path);
        }
    }
    match Error::aggregate("failed to completely remove stale schema files", errors) {
        Some(err) => Err(err),
        None => Ok(evicted),
    }
}

enum Restored {
    AlreadyPresent,
    Written,
    Miss,
}

fn restore_from_cache(
    cache: &SchemaCache,
    fs: &mut dyn EngineFs,
    key: &str,
    hash: &str,
) -> Result<Restored> {
    if cache.hash(key)?.as_deref() != Some(hash) {
        return Ok(Restored::Miss);
    }
    // Mismatched files were evicted above, so a present file is the cached one
    if fs.shared_exists(key) {
        return Ok(Restored::AlreadyPresent);
    }
    let Some(bytes) = cache.content(key)? else {
        return Ok(Restored::Miss);
    };
    let actual = sha256_hex(&bytes);
    if actual != hash {
        warn!(path = key, expected = hash, %actual, "cached content is corrupt, downloading again");
        return Ok(Restored::Miss);
    }
    fs.write_shared(key, &bytes)
        .map_err(|e| Error::filesystem(key, e))?;
    debug!(path = key, "restored schema file from cache");
    Ok(Restored::Written)
}

fn store_download(
    cache: &SchemaCache,
    fs: &mut dyn EngineFs,
    source: &dyn SchemaSource,
    download: &Download<'_>,
    fetched: Result<bytes::Bytes>,
) -> Result<()> {
    let bytes = fetched?;
    let actual = sha256_hex(&bytes);
    if actual != download.hash {
        return Err(Error::Integrity {
            path: source.locate(download.raw),
            expected: download.hash.to_string(),
            actual,
        });
    }
    cache.put(&download.key, download.hash, &bytes)?;
    fs.write_shared(&download.key, &bytes)
        .map_err(|e| Error::filesystem(download.key.clone(), e))?;
    debug!(path = %download.key, size = bytes.len(), "downloaded schema file");
    Ok(())
}
