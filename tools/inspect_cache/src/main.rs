//! Inspect a schema cache database
//!
//! Usage:
//!   cargo run -p inspect_cache -- --db rime-data/schema-cache.redb
//!   cargo run -p inspect_cache -- --config rimehost.toml --verify --json
//!   cargo run -p inspect_cache -- --db cache.redb --evict build/luna_pinyin.prism.bin

use anyhow::{bail, Context};
use clap::Parser;
use rimehost_core::utils::{file_key, sha256_hex};
use rimehost_core::{Config, Manifest, SchemaCache};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "inspect_cache")]
#[command(about = "List, verify and evict entries of a schema cache database")]
struct Args {
    /// Path to the cache database
    #[arg(short, long, conflicts_with = "config")]
    db: Option<PathBuf>,

    /// Host configuration file; its `cache_path` is inspected
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Re-hash cached content and compare it with the stored hash
    #[arg(long)]
    verify: bool,

    /// Compare the cache with a manifest file (JSON object of path -> hash)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Remove these paths from the cache
    #[arg(long, num_args = 1..)]
    evict: Vec<String>,

    /// Print entries as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Row {
    path: String,
    hash: String,
    size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_manifest: Option<bool>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let db_path = resolve_db(&args)?;
    let cache = SchemaCache::open(&db_path)
        .with_context(|| format!("failed to open cache {}", db_path.display()))?;
    info!(path = %db_path.display(), "opened schema cache");

    for raw in &args.evict {
        let key = file_key(raw)?;
        if cache.remove(&key)? {
            info!(path = %key, "evicted");
        } else {
            warn!(path = %key, "not cached");
        }
    }

    let manifest = match &args.manifest {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read manifest {}", path.display()))?;
            Some(Manifest::from_json(&text).context("manifest is not a JSON object of path -> hash")?)
        }
        None => None,
    };
    let expected = manifest.as_ref().map(Manifest::expected_hashes);

    let mut rows = Vec::new();
    for record in cache.entries()? {
        let content = cache.content(&record.path)?;
        let verified = if args.verify {
            Some(content.as_deref().map(sha256_hex).as_deref() == Some(record.hash.as_str()))
        } else {
            None
        };
        let in_manifest = expected
            .as_ref()
            .map(|hashes| hashes.get(&record.path) == Some(&record.hash));
        rows.push(Row {
            size: content.as_ref().map(Vec::len),
            path: record.path,
            hash: record.hash,
            verified,
            in_manifest,
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            let size = row
                .size
                .map_or_else(|| "missing".to_string(), |s| s.to_string());
            let mut flags = Vec::new();
            match row.verified {
                Some(true) => flags.push("ok"),
                Some(false) => flags.push("CORRUPT"),
                None => {}
            }
            if row.in_manifest == Some(false) {
                flags.push("stale");
            }
            println!("{:<64} {:>10}  {}  {}", row.path, size, row.hash, flags.join(","));
        }
        println!("{} entries", rows.len());
    }

    if let Some(hashes) = &expected {
        let missing: Vec<_> = hashes
            .keys()
            .filter(|key| !rows.iter().any(|row| &row.path == *key))
            .collect();
        for key in &missing {
            println!("not cached: {}", key);
        }
    }

    if rows.iter().any(|row| row.verified == Some(false)) {
        bail!("cache contains corrupt entries");
    }
    Ok(())
}

fn resolve_db(args: &Args) -> anyhow::Result<PathBuf> {
    if let Some(db) = &args.db {
        return Ok(db.clone());
    }
    let config = match &args.config {
        Some(path) => Config::load_toml(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", path.display(), e))?,
        None => Config::default(),
    };
    config
        .cache_path
        .context("configuration keeps the cache in memory; nothing to inspect")
}
