//! Per-engine execution context.
//!
//! `EngineSession` owns everything the engine touches: the adapter, its
//! filesystem, the schema source and the lazily opened cache, plus the two
//! bits of lifecycle state (user directory mounted, engine initialized). It
//! lives on the worker thread and executes exactly one `Action` at a time.

use crate::action::{Action, Reply};
use crate::api::{Notifier, RimeApi};
use crate::cache::SchemaCache;
use crate::composition::InputStatus;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::fs::{EngineFs, SyncDirection};
use crate::loader;
use crate::manifest::Manifest;
use crate::source::SchemaSource;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

type Engine = Box<dyn RimeApi>;

pub struct EngineSession {
    engine: Engine,
    fs: Box<dyn EngineFs>,
    source: Arc<dyn SchemaSource>,
    cache_path: Option<PathBuf>,
    cache: OnceCell<SchemaCache>,
    user_dir_mounted: bool,
    initialized: bool,
    notifier: Option<Notifier>,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("cache_path", &self.cache_path)
            .field("user_dir_mounted", &self.user_dir_mounted)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl EngineSession {
    /// A fresh session. `cache_path` of `None` keeps the schema cache in memory.
    pub fn new(
        engine: Engine,
        fs: Box<dyn EngineFs>,
        source: Arc<dyn SchemaSource>,
        cache_path: Option<PathBuf>,
    ) -> Self {
        Self {
            engine,
            fs,
            source,
            cache_path,
            cache: OnceCell::new(),
            user_dir_mounted: false,
            initialized: false,
            notifier: None,
        }
    }

    /// Hand `notifier` to the adapter and use it for status pushes.
    pub(crate) fn attach(&mut self, notifier: Notifier) {
        self.engine.set_notifier(notifier.clone());
        self.notifier = Some(notifier);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_user_dir_mounted(&self) -> bool {
        self.user_dir_mounted
    }

    /// Execute one action to completion.
    pub async fn perform(&mut self, action: Action) -> Result<Reply> {
        debug!(action = action.name(), "performing");
        match action {
            Action::SetSchemaFiles(manifest) => self.set_schema_files(manifest).await.map(Reply::Bool),
            Action::ProcessKey(input) => self.process_key(&input).map(Reply::Input),
            Action::SelectCandidate(index) => self
                .composition_op("select_candidate", |e| e.select_candidate(index))
                .map(Reply::Input),
            Action::DeleteCandidate(index) => self
                .composition_op("delete_candidate", |e| e.delete_candidate(index))
                .map(Reply::Input),
            Action::FlipPage(backward) => self
                .composition_op("flip_page", |e| e.flip_page(backward))
                .map(Reply::Input),
            Action::ClearInput => self
                .composition_op("clear_input", |e| e.clear_input())
                .map(Reply::Input),
            Action::Deploy => self.deploy().map(Reply::Bool),
        }
    }

    /// Reconcile the shared directory with `manifest`, then start or
    /// redeploy the engine between a read-sync and a write-sync of the user
    /// directory.
    async fn set_schema_files(&mut self, manifest: Manifest) -> Result<bool> {
        let cache = open_cache(&self.cache, self.cache_path.as_ref()).await?;
        let report =
            loader::reconcile(cache, self.fs.as_mut(), self.source.as_ref(), &manifest).await?;
        let mut failures = report.failures;

        let mut sync_error = None;
        let mut outcome = None;
        match self.mount_user_dir().and_then(|()| self.sync(SyncDirection::Read)) {
            Err(e) => sync_error = Some(e),
            Ok(()) => {
                let result = if self.initialized {
                    self.call_engine("deploy", |e| e.deploy())
                } else {
                    self.call_engine("init", |e| e.init())
                };
                // A failed deploy falls back to init on the next load
                self.initialized = matches!(result, Ok(true));
                if let Err(e) = self.sync(SyncDirection::Write) {
                    sync_error = Some(e);
                }
                outcome = Some(result);
            }
        }

        let (started, engine_error) = match outcome {
            Some(Ok(started)) => (started, None),
            Some(Err(e)) => (false, Some(e)),
            None => (false, None),
        };
        if !failures.is_empty() || (sync_error.is_some() && engine_error.is_some()) {
            failures.extend(sync_error);
            failures.extend(engine_error);
            return Err(Error::Aggregate {
                message: "failed to completely set schema files".into(),
                errors: failures,
            });
        }
        if let Some(e) = sync_error.or(engine_error) {
            return Err(e);
        }
        info!(
            files = manifest.len(),
            fetched = report.fetched.len(),
            started,
            "schema files set"
        );
        Ok(started)
    }

    fn process_key(&mut self, input: &str) -> Result<InputStatus> {
        let status = self.composition_op("process_key", |e| e.process_key(input))?;
        if status.committed().is_some() && self.user_dir_mounted {
            // A commit may have updated the user dictionary
            if let Err(e) = self.sync(SyncDirection::Write) {
                warn!(error = %e, "failed to persist user data after commit");
            }
        }
        Ok(status)
    }

    fn deploy(&mut self) -> Result<bool> {
        let deployed = self.call_engine("deploy", |e| e.deploy())?;
        if self.user_dir_mounted {
            self.sync(SyncDirection::Write)?;
        }
        Ok(deployed)
    }

    fn composition_op<F>(&mut self, op: &'static str, f: F) -> Result<InputStatus>
    where
        F: FnOnce(&mut Engine) -> anyhow::Result<String>,
    {
        let json = self.call_engine(op, f)?;
        let status = InputStatus::from_json(&json).map_err(|e| {
            warn!(op, error = %e, "engine returned a malformed result");
            e
        })?;
        if let Some(notifier) = &self.notifier {
            notifier.emit(Event::InputStatusChanged(status.clone()));
        }
        Ok(status)
    }

    /// Run an adapter call, turning both errors and panics into `Error::Engine`.
    fn call_engine<T, F>(&mut self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> anyhow::Result<T>,
    {
        let engine = &mut self.engine;
        match panic::catch_unwind(AssertUnwindSafe(|| f(engine))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "engine call failed");
                Err(Error::Engine(format!("{e:#}")))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(op, %message, "engine call panicked");
                Err(Error::Engine(format!("{op} panicked: {message}")))
            }
        }
    }

    fn mount_user_dir(&mut self) -> Result<()> {
        if self.user_dir_mounted {
            return Ok(());
        }
        self.fs
            .mount_user_dir()
            .map_err(|e| Error::filesystem("user directory", e))?;
        self.user_dir_mounted = true;
        debug!("mounted user directory");
        Ok(())
    }

    fn sync(&mut self, direction: SyncDirection) -> Result<()> {
        self.fs.sync_user_dir(direction).map_err(|e| {
            warn!(?direction, error = %e, "user directory sync failed");
            Error::filesystem("user directory", e)
        })
    }
}

async fn open_cache<'a>(
    cell: &'a OnceCell<SchemaCache>,
    path: Option<&PathBuf>,
) -> Result<&'a SchemaCache> {
    cell.get_or_try_init(|| async {
        let cache = match path {
            Some(path) => SchemaCache::open(path)?,
            None => SchemaCache::in_memory()?,
        };
        Ok::<_, Error>(cache)
    })
    .await
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::utils::sha256_hex;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource(Vec<u8>);

    #[async_trait]
    impl SchemaSource for FixedSource {
        fn locate(&self, file: &str) -> String {
            file.to_string()
        }

        async fn fetch(&self, _file: &str) -> Result<Bytes> {
            Ok(Bytes::from(self.0.clone()))
        }
    }

    #[derive(Default)]
    struct Counting {
        inits: Arc<AtomicUsize>,
        deploys: Arc<AtomicUsize>,
        init_result: bool,
        deploy_declines: bool,
        deploy_fails: bool,
    }

    impl RimeApi for Counting {
        fn init(&mut self) -> anyhow::Result<bool> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(self.init_result)
        }

        fn deploy(&mut self) -> anyhow::Result<bool> {
            self.deploys.fetch_add(1, Ordering::SeqCst);
            if self.deploy_fails {
                anyhow::bail!("deploy failed");
            }
            Ok(!self.deploy_declines)
        }

        fn process_key(&mut self, input: &str) -> anyhow::Result<String> {
            if input == "{Return}" {
                return Ok(InputStatus::idle().with_committed("ni").to_json());
            }
            if input == "boom" {
                panic!("engine crashed");
            }
            Ok("not json".to_string())
        }

        fn select_candidate(&mut self, _index: usize) -> anyhow::Result<String> {
            anyhow::bail!("no candidates")
        }

        fn delete_candidate(&mut self, _index: usize) -> anyhow::Result<String> {
            Ok(InputStatus::idle().to_json())
        }

        fn flip_page(&mut self, _backward: bool) -> anyhow::Result<String> {
            Ok(InputStatus::idle().to_json())
        }

        fn clear_input(&mut self) -> anyhow::Result<String> {
            Ok(InputStatus::idle().to_json())
        }
    }

    fn session(engine: Counting, fs: MemFs) -> EngineSession {
        EngineSession::new(
            Box::new(engine),
            Box::new(fs),
            Arc::new(FixedSource(b"schema".to_vec())),
            None,
        )
    }

    #[tokio::test]
    async fn first_load_inits_then_deploys() {
        let engine = Counting {
            init_result: true,
            ..Default::default()
        };
        let (inits, deploys) = (engine.inits.clone(), engine.deploys.clone());
        let fs = MemFs::new();
        let mut session = session(engine, fs.clone());
        let manifest = Manifest::new().with("default.yaml", sha256_hex(b"schema"));

        assert!(session.perform(Action::SetSchemaFiles(manifest.clone())).await.unwrap().into_bool().unwrap());
        assert!(session.perform(Action::SetSchemaFiles(manifest)).await.unwrap().into_bool().unwrap());
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(deploys.load(Ordering::SeqCst), 1);
        assert_eq!(fs.mounts(), 1);
        assert_eq!(
            fs.sync_log(),
            vec![
                SyncDirection::Read,
                SyncDirection::Write,
                SyncDirection::Read,
                SyncDirection::Write
            ]
        );
    }

    #[tokio::test]
    async fn failed_init_is_retried_as_init() {
        let engine = Counting::default();
        let inits = engine.inits.clone();
        let mut session = session(engine, MemFs::new());
        for _ in 0..2 {
            let started = session
                .perform(Action::SetSchemaFiles(Manifest::new()))
                .await
                .unwrap();
            assert_eq!(started, Reply::Bool(false));
        }
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn file_failures_are_raised_after_the_engine_ran() {
        let engine = Counting {
            init_result: true,
            ..Default::default()
        };
        let inits = engine.inits.clone();
        let fs = MemFs::new();
        let mut session = session(engine, fs.clone());
        let manifest = Manifest::new().with("default.yaml", "0000");

        let err = session
            .perform(Action::SetSchemaFiles(manifest))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to completely set schema files"));
        assert!(matches!(err.failures()[0], Error::Integrity { .. }));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(fs.sync_log().last(), Some(&SyncDirection::Write));
    }

    #[tokio::test]
    async fn declined_deploy_falls_back_to_init() {
        let engine = Counting {
            init_result: true,
            deploy_declines: true,
            ..Default::default()
        };
        let (inits, deploys) = (engine.inits.clone(), engine.deploys.clone());
        let mut session = session(engine, MemFs::new());

        let load = || Action::SetSchemaFiles(Manifest::new());
        assert_eq!(session.perform(load()).await.unwrap(), Reply::Bool(true));
        assert_eq!(session.perform(load()).await.unwrap(), Reply::Bool(false));
        assert!(!session.is_initialized());
        assert_eq!(session.perform(load()).await.unwrap(), Reply::Bool(true));
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(deploys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_read_sync_skips_the_engine() {
        let engine = Counting {
            init_result: true,
            ..Default::default()
        };
        let inits = engine.inits.clone();
        let fs = MemFs::new();
        fs.fail_sync(SyncDirection::Read);
        let mut session = session(engine, fs.clone());

        let err = session
            .perform(Action::SetSchemaFiles(Manifest::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Filesystem { .. }));
        assert_eq!(inits.load(Ordering::SeqCst), 0);
        assert!(fs.sync_log().is_empty());
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn failed_write_sync_joins_file_failures() {
        let engine = Counting {
            init_result: true,
            ..Default::default()
        };
        let inits = engine.inits.clone();
        let fs = MemFs::new();
        fs.fail_sync(SyncDirection::Write);
        let mut session = session(engine, fs.clone());
        let manifest = Manifest::new().with("default.yaml", "0000");

        let err = session
            .perform(Action::SetSchemaFiles(manifest))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to completely set schema files"));
        match err.failures() {
            [Error::Integrity { .. }, Error::Filesystem { .. }] => {}
            other => panic!("unexpected failures {:?}", other),
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_deploy_and_write_sync_are_both_reported() {
        let engine = Counting {
            init_result: true,
            deploy_fails: true,
            ..Default::default()
        };
        let fs = MemFs::new();
        let mut session = session(engine, fs.clone());
        session
            .perform(Action::SetSchemaFiles(Manifest::new()))
            .await
            .unwrap();

        fs.fail_sync(SyncDirection::Write);
        let err = session
            .perform(Action::SetSchemaFiles(Manifest::new()))
            .await
            .unwrap_err();
        match err.failures() {
            [Error::Filesystem { .. }, Error::Engine(message)] => {
                assert!(message.contains("deploy failed"))
            }
            other => panic!("unexpected failures {:?}", other),
        }
        assert!(!session.is_initialized());
    }

    #[tokio::test]
    async fn commit_persists_user_data() {
        let engine = Counting {
            init_result: true,
            ..Default::default()
        };
        let fs = MemFs::new();
        let mut session = session(engine, fs.clone());
        session
            .perform(Action::SetSchemaFiles(Manifest::new()))
            .await
            .unwrap();
        let syncs = fs.sync_log().len();

        let reply = session
            .perform(Action::ProcessKey("{Return}".into()))
            .await
            .unwrap()
            .into_input()
            .unwrap();
        assert_eq!(reply.committed(), Some("ni"));
        assert_eq!(fs.sync_log().len(), syncs + 1);
    }

    #[tokio::test]
    async fn engine_faults_become_errors() {
        let mut session = session(Counting::default(), MemFs::new());
        assert!(matches!(
            session.perform(Action::ProcessKey("ni".into())).await,
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            session.perform(Action::SelectCandidate(0)).await,
            Err(Error::Engine(_))
        ));
        match session.perform(Action::ProcessKey("boom".into())).await {
            Err(Error::Engine(message)) => assert!(message.contains("engine crashed")),
            other => panic!("expected engine error, got {:?}", other),
        }
        // Still usable afterwards
        assert!(session.perform(Action::ClearInput).await.is_ok());
    }
}
