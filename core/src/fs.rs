//! Engine-private storage.
//!
//! The engine sees two areas:
//! - the shared directory, rebuilt from the schema cache and never synced
//! - the user directory, holding learned state, backed by a durable store
//!
//! The user directory is never synced implicitly: the session calls
//! `sync_user_dir(Read)` before the engine consumes its state and
//! `sync_user_dir(Write)` after a call that may have mutated it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use walkdir::WalkDir;

/// Direction of a user-directory sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Durable store -> working directory
    Read,
    /// Working directory -> durable store
    Write,
}

/// Storage operations the session performs on behalf of the engine.
///
/// Paths are normalized keys relative to the shared directory (see
/// `utils::file_key`).
pub trait EngineFs: Send {
    fn shared_exists(&self, path: &str) -> bool;

    /// Remove a shared file. Removing a missing file is not an error.
    fn remove_shared(&mut self, path: &str) -> io::Result<()>;

    /// Write a shared file, creating parent directories as needed.
    fn write_shared(&mut self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Attach the durable store to the user directory. Called once per session.
    fn mount_user_dir(&mut self) -> io::Result<()>;

    fn sync_user_dir(&mut self, direction: SyncDirection) -> io::Result<()>;
}

/// `EngineFs` over real directories.
///
/// The durable store is a separate directory mirrored to and from the user
/// directory on each sync, including deletions.
#[derive(Debug, Clone)]
pub struct DiskFs {
    shared_dir: PathBuf,
    user_dir: PathBuf,
    store_dir: PathBuf,
}

impl DiskFs {
    pub fn new<S, U, D>(shared_dir: S, user_dir: U, store_dir: D) -> Self
    where
        S: Into<PathBuf>,
        U: Into<PathBuf>,
        D: Into<PathBuf>,
    {
        Self {
            shared_dir: shared_dir.into(),
            user_dir: user_dir.into(),
            store_dir: store_dir.into(),
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(&config.shared_dir, &config.user_dir, &config.user_store_dir)
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }
}

impl EngineFs for DiskFs {
    fn shared_exists(&self, path: &str) -> bool {
        self.shared_dir.join(path).is_file()
    }

    fn remove_shared(&mut self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.shared_dir.join(path)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn write_shared(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.shared_dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, bytes)
    }

    fn mount_user_dir(&mut self) -> io::Result<()> {
        fs::create_dir_all(&self.user_dir)?;
        fs::create_dir_all(&self.store_dir)
    }

    fn sync_user_dir(&mut self, direction: SyncDirection) -> io::Result<()> {
        match direction {
            SyncDirection::Read => mirror_dir(&self.store_dir, &self.user_dir),
            SyncDirection::Write => mirror_dir(&self.user_dir, &self.store_dir),
        }
    }
}

/// Make `dst` an exact copy of `src`.
fn mirror_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let mut keep = BTreeSet::new();
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = relative(entry.path(), src)?;
        let target = dst.join(&rel);
        if entry.file_type().is_dir() {
            if target.is_file() {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
        } else {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::copy(entry.path(), &target)?;
        }
        keep.insert(rel);
    }
    // Children come before their directory, so stale directories are empty when reached
    for entry in WalkDir::new(dst).min_depth(1).contents_first(true) {
        let entry = entry?;
        if keep.contains(&relative(entry.path(), dst)?) {
            continue;
        }
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn relative(path: &Path, root: &Path) -> io::Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Durable backing store for `MemFs` user data.
///
/// Outlives any number of `MemFs` instances, which is how a process restart
/// is modelled in memory.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        lock(&self.files).clone()
    }
}

#[derive(Debug, Default)]
struct MemState {
    shared: BTreeMap<String, Vec<u8>>,
    user: BTreeMap<String, Vec<u8>>,
    mounts: usize,
    shared_writes: usize,
    syncs: Vec<SyncDirection>,
    failing_removals: BTreeSet<String>,
    failing_syncs: Vec<SyncDirection>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory `EngineFs`.
///
/// Clones share state, so a test (or an adapter) can keep a handle while the
/// session owns another.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    state: Arc<Mutex<MemState>>,
    store: MemStore,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A filesystem whose user directory is backed by `store`.
    pub fn with_store(store: MemStore) -> Self {
        Self {
            state: Arc::default(),
            store,
        }
    }

    pub fn store(&self) -> &MemStore {
        &self.store
    }

    /// Paths currently present in the shared directory.
    pub fn shared_files(&self) -> Vec<String> {
        lock(&self.state).shared.keys().cloned().collect()
    }

    pub fn shared_file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).shared.get(path).cloned()
    }

    /// Number of shared-file writes so far.
    pub fn shared_writes(&self) -> usize {
        lock(&self.state).shared_writes
    }

    pub fn user_file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).user.get(path).cloned()
    }

    /// Write to the working user directory, as the engine does.
    pub fn write_user_file(&self, path: &str, bytes: &[u8]) {
        lock(&self.state)
            .user
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn mounts(&self) -> usize {
        lock(&self.state).mounts
    }

    /// Every sync performed, in order.
    pub fn sync_log(&self) -> Vec<SyncDirection> {
        lock(&self.state).syncs.clone()
    }

    /// Make `remove_shared(path)` fail from now on.
    pub fn fail_removal_of(&self, path: &str) {
        lock(&self.state)
            .failing_removals
            .insert(path.to_string());
    }

    /// Make `sync_user_dir(direction)` fail from now on.
    pub fn fail_sync(&self, direction: SyncDirection) {
        lock(&self.state).failing_syncs.push(direction);
    }
}

impl EngineFs for MemFs {
    fn shared_exists(&self, path: &str) -> bool {
        lock(&self.state).shared.contains_key(path)
    }

    fn remove_shared(&mut self, path: &str) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.failing_removals.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot remove {}", path),
            ));
        }
        state.shared.remove(path);
        Ok(())
    }

    fn write_shared(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.shared.insert(path.to_string(), bytes.to_vec());
        state.shared_writes += 1;
        Ok(())
    }

    fn mount_user_dir(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.mounts > 0 {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "user directory already mounted",
            ));
        }
        state.mounts += 1;
        Ok(())
    }

    fn sync_user_dir(&mut self, direction: SyncDirection) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.mounts == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "user directory is not mounted",
            ));
        }
        if state.failing_syncs.contains(&direction) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("cannot sync user directory ({:?})", direction),
            ));
        }
        match direction {
            SyncDirection::Read => state.user = self.store.files(),
            SyncDirection::Write => *lock(&self.store.files) = state.user.clone(),
        }
        state.syncs.push(direction);
        Ok(())
    }
}
