//! Desired contents of the engine's shared directory.

use crate::error::Result;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping of logical path -> expected lowercase hex SHA-256.
///
/// Keys are kept exactly as the caller wrote them (they may carry a query
/// string that matters for the download); `entries` yields the normalized
/// cache key next to each one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct Manifest {
    files: BTreeMap<String, String>,
}

/// One manifest line after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry<'a> {
    /// Path as written in the manifest, used to build the download location
    pub raw: &'a str,
    /// Normalized key; `None` if the path is empty or escapes the shared directory
    pub key: Option<String>,
    pub hash: &'a str,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file. The hash is stored lowercase.
    pub fn insert<P: Into<String>, H: AsRef<str>>(&mut self, path: P, hash: H) {
        self.files
            .insert(path.into(), hash.as_ref().to_ascii_lowercase());
    }

    pub fn with<P: Into<String>, H: AsRef<str>>(mut self, path: P, hash: H) -> Self {
        self.insert(path, hash);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Load from a JSON object `{"path": "hash", ...}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Entries with their normalized keys.
    pub fn entries(&self) -> impl Iterator<Item = ManifestEntry<'_>> {
        self.files.iter().map(|(raw, hash)| ManifestEntry {
            raw,
            key: utils::file_key(raw).ok(),
            hash,
        })
    }

    /// Expected hash per normalized key. Invalid paths are left out; when two
    /// raw paths normalize to the same key the first in path order is kept,
    /// matching the one the loader materializes.
    pub fn expected_hashes(&self) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        for entry in self.entries() {
            if let Some(key) = entry.key {
                hashes.entry(key).or_insert_with(|| entry.hash.to_string());
            }
        }
        hashes
    }

    /// Normalized keys, failing on the first invalid path.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.files.keys().map(|raw| utils::file_key(raw)).collect()
    }
}

impl From<BTreeMap<String, String>> for Manifest {
    fn from(files: BTreeMap<String, String>) -> Self {
        files.into_iter().collect()
    }
}

impl From<Manifest> for BTreeMap<String, String> {
    fn from(manifest: Manifest) -> Self {
        manifest.files
    }
}

impl<P: Into<String>, H: AsRef<str>> FromIterator<(P, H)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (P, H)>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for (path, hash) in iter {
            manifest.insert(path, hash);
        }
        manifest
    }
}
