//! rimehost-core
//!
//! Host-side bridge to an isolated, single-threaded RIME input-method engine.
//!
//! The engine runs on its own worker thread and is only reachable through
//! message passing. This crate keeps its calls strictly ordered (one in
//! flight, FIFO), keeps its shared schema directory in sync with a
//! caller-supplied manifest through a content-hash-addressed cache, and fans
//! engine notifications out to subscribers.
//!
//! Public API:
//! - `RimeHost` - the facade: `initialize`, `set_schema_files`, key/candidate ops, `subscribe`
//! - `RimeApi` - the synchronous operation set an engine adapter implements
//! - `InputStatus` - decoded composition result (`Candidate`, `InputBuffer`)
//! - `Manifest` - desired shared-directory contents, path -> SHA-256
//! - `SchemaCache` - redb-backed (path, hash, bytes) store
//! - `EngineFs` - engine-private storage (`DiskFs`, `MemFs`)
//! - `SchemaSource` - where schema bytes come from (`HttpSource`)
//! - `EventHub` - subscriber fan-out for `Event`s
//! - `Config` - paths and source configuration
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod error;
pub use error::{CacheError, Error, Result};

pub mod candidate;
pub use candidate::{Candidate, CandidatePage};

pub mod input_buffer;
pub use input_buffer::InputBuffer;

pub mod composition;
pub use composition::{Composing, InputStatus};

pub mod api;
pub use api::{Notifier, RimeApi};

pub mod event;
pub use event::{DeployStatus, Event, EventHub, EventKind, Subscription};

pub mod engine_log;

pub mod manifest;
pub use manifest::Manifest;

pub mod cache;
pub use cache::{CacheRecord, SchemaCache};

pub mod fs;
pub use fs::{DiskFs, EngineFs, MemFs, MemStore, SyncDirection};

pub mod source;
pub use source::{HttpSource, SchemaSource};

pub mod loader;
pub use loader::ReconcileReport;

pub mod action;
pub use action::{Action, Reply};

pub mod session;
pub use session::EngineSession;

pub mod bridge;
pub use bridge::{Bridge, Pending, Phase, SettleHook, Transport};

mod worker;

pub mod host;
pub use host::{EngineState, RimeHost};

/// Host configuration.
///
/// Everything the host needs to place the engine's storage and find schema
/// files. Loadable from TOML:
///
/// ```toml
/// shared_dir = "/var/lib/rime/shared"
/// user_dir = "/var/lib/rime/user"
/// user_store_dir = "/var/lib/rime/store"
/// cache_path = "/var/cache/rime/schema-cache.redb"
/// schema_base_url = "https://example.com/rime-data/"
/// forward_engine_logs = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Engine's shared data directory, rebuilt from the schema cache
    pub shared_dir: PathBuf,

    /// Engine's user data directory (working copy read and written by the engine)
    pub user_dir: PathBuf,

    /// Durable copy of the user directory; synced explicitly in both directions
    pub user_store_dir: PathBuf,

    /// Schema cache database. `None` keeps the cache in memory for this process only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,

    /// Base location schema files are fetched from
    pub schema_base_url: String,

    /// Re-emit the engine's own log lines through `tracing`
    pub forward_engine_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shared_dir: PathBuf::from("rime-data/shared"),
            user_dir: PathBuf::from("rime-data/user"),
            user_store_dir: PathBuf::from("rime-data/store"),
            cache_path: Some(PathBuf::from("rime-data/schema-cache.redb")),
            schema_base_url: String::new(),
            forward_engine_logs: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Path and digest helpers.
pub mod utils {
    use crate::error::{Error, Result};
    use sha2::{Digest, Sha256};

    /// Lowercase hex SHA-256 of `bytes`.
    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Normalize a slash-separated path.
    ///
    /// Resolves `.` and `..`, collapses repeated separators and keeps a
    /// leading `/` for absolute paths. `..` that would climb above the root of
    /// an absolute path is dropped; on a relative path it is kept. Returns `"."`
    /// for an empty relative result.
    pub fn normalize_path(path: &str) -> String {
        let absolute = path.starts_with('/');
        let trailing = path.len() > 1 && path.ends_with('/');
        let mut parts: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => match parts.last() {
                    Some(&last) if last != ".." => {
                        parts.pop();
                    }
                    _ if absolute => {}
                    _ => parts.push(".."),
                },
                other => parts.push(other),
            }
        }
        let mut out = parts.join("/");
        if absolute {
            out.insert(0, '/');
        } else if out.is_empty() {
            out.push('.');
        }
        if trailing && !out.ends_with('/') {
            out.push('/');
        }
        out
    }

    /// Turn a manifest path into the key used for the cache and the shared directory.
    ///
    /// Strips any query or fragment, accepts `\` as a separator, normalizes,
    /// and removes leading and trailing slashes. Paths that normalize to
    /// nothing or climb out of the shared directory are rejected.
    pub fn file_key(raw: &str) -> Result<String> {
        let without_query = match raw.find(['?', '#']) {
            Some(idx) => &raw[..idx],
            None => raw,
        };
        let unified = without_query.replace('\\', "/");
        let normalized = normalize_path(&unified);
        let key = normalized.trim_matches('/');
        if key.is_empty() || key == "." || key == ".." || key.starts_with("../") {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        Ok(key.to_string())
    }

    /// Join and normalize URL-like parts segment by segment.
    ///
    /// Unlike `normalize_path`, empty segments are kept so a scheme's `//`
    /// survives; only `.` is dropped and `..` pops the previous segment.
    pub fn normalize_url(parts: &[&str]) -> String {
        let mut segments: Vec<&str> = Vec::new();
        for part in parts {
            let part = part.strip_prefix("./").unwrap_or(part);
            for segment in part.split(['/', '\\']) {
                match segment {
                    ".." if !segments.is_empty() => {
                        segments.pop();
                    }
                    "." => {}
                    other => segments.push(other),
                }
            }
        }
        if segments.is_empty() {
            ".".to_string()
        } else {
            segments.join("/")
        }
    }

    /// Location a manifest path is fetched from, relative to `base`.
    ///
    /// The query string of `file` (if any) is kept for the request.
    pub fn fetch_url(base: &str, file: &str) -> String {
        let base = normalize_url(&[base]);
        let base = base.trim_end_matches('/');
        let file = normalize_url(&[file]);
        let file = file.trim_start_matches('/');
        normalize_url(&[base, file])
    }
}

#[cfg(test)]
mod tests {
    use super::utils::*;
    use super::*;

    #[test]
    fn normalize_path_resolves_dots() {
        assert_eq!(normalize_path("/usr/share/rime-data/./a/../b.yaml"), "/usr/share/rime-data/b.yaml");
        assert_eq!(normalize_path("a//b/"), "a/b/");
        assert_eq!(normalize_path("../a"), "../a");
        assert_eq!(normalize_path("/../a"), "/a");
        assert_eq!(normalize_path(""), ".");
    }

    #[test]
    fn file_key_strips_query_and_slashes() {
        assert_eq!(file_key("/build/luna.prism.bin?v=2").unwrap(), "build/luna.prism.bin");
        assert_eq!(file_key("dict\\essay.txt#frag").unwrap(), "dict/essay.txt");
        assert_eq!(file_key("./default.yaml").unwrap(), "default.yaml");
    }

    #[test]
    fn file_key_rejects_escapes() {
        assert!(file_key("../secret").is_err());
        assert!(file_key("a/../../b").is_err());
        assert!(file_key("?only-query").is_err());
        assert!(file_key("/").is_err());
    }

    #[test]
    fn fetch_url_joins_base_and_file() {
        assert_eq!(
            fetch_url("https://cdn.example.com/rime/", "/build/a.bin?v=1"),
            "https://cdn.example.com/rime/build/a.bin?v=1"
        );
        assert_eq!(
            fetch_url("https://cdn.example.com/rime", "./x/../default.yaml"),
            "https://cdn.example.com/rime/default.yaml"
        );
        assert_eq!(fetch_url("data", "a.yaml"), "data/a.yaml");
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn config_toml_roundtrip_keeps_paths() {
        let mut cfg = Config::default();
        cfg.schema_base_url = "https://example.com/rime/".into();
        cfg.cache_path = None;
        let text = cfg.to_toml_string().unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.schema_base_url, cfg.schema_base_url);
        assert_eq!(back.shared_dir, cfg.shared_dir);
        assert!(back.cache_path.is_none());
    }
}
