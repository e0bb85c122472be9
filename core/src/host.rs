//! The public face of the engine.
//!
//! `RimeHost` starts the engine worker, owns the bridge to it and the event
//! registry, and exposes every engine operation as a method returning a
//! `Pending` result. Methods may be called from any number of threads; the
//! engine still sees the calls one at a time, in the order they were made.

use crate::action::{Action, Reply};
use crate::api::RimeApi;
use crate::bridge::{Bridge, Pending, Phase, SettleHook};
use crate::composition::InputStatus;
use crate::error::Result;
use crate::event::{Event, EventHub, EventKind, Subscription};
use crate::fs::{DiskFs, EngineFs};
use crate::manifest::Manifest;
use crate::source::{HttpSource, SchemaSource};
use crate::worker::{self, WorkerSpec};
use crate::Config;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Host-side view of the last schema load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    NotInitialized,
    /// A schema load has been issued and not yet settled
    Initializing,
    Ready,
}

/// State plus the number of schema loads issued so far; only the latest
/// load may settle the state.
#[derive(Debug, Default)]
struct LoadTracker {
    state: EngineState,
    issued: u64,
}

pub struct RimeHost {
    bridge: Arc<Bridge>,
    events: EventHub,
    loads: Arc<Mutex<LoadTracker>>,
}

impl std::fmt::Debug for RimeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RimeHost")
            .field("state", &self.state())
            .field("phase", &self.phase())
            .finish()
    }
}

impl RimeHost {
    /// Start the engine worker.
    ///
    /// `factory` runs on the engine thread and builds the adapter there, so
    /// the adapter itself does not need to be `Send`. Fails if the worker
    /// cannot be started or the factory fails.
    pub async fn initialize<F, E, S, R>(config: &Config, fs: S, source: R, factory: F) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<E> + Send + 'static,
        E: RimeApi + 'static,
        S: EngineFs + 'static,
        R: SchemaSource + 'static,
    {
        let handle = worker::spawn(WorkerSpec {
            fs: Box::new(fs),
            source: Arc::new(source),
            cache_path: config.cache_path.clone(),
            forward_logs: config.forward_engine_logs,
            factory: Box::new(move || factory().map(|engine| Box::new(engine) as Box<dyn RimeApi>)),
        })
        .await?;

        let bridge = Arc::new(Bridge::new(handle.requests));
        let events = EventHub::new();
        worker::spawn_pump(handle.responses, Arc::clone(&bridge), events.clone())?;
        info!(cache = ?config.cache_path, "rime host ready");
        Ok(Self {
            bridge,
            events,
            loads: Arc::default(),
        })
    }

    /// Start the engine over real directories, fetching schema files from
    /// `config.schema_base_url`.
    pub async fn from_config<F, E>(config: &Config, factory: F) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<E> + Send + 'static,
        E: RimeApi + 'static,
    {
        let source = HttpSource::new(config.schema_base_url.clone())?;
        Self::initialize(config, DiskFs::from_config(config), source, factory).await
    }

    /// Make the engine's shared directory match `manifest`, then start the
    /// engine (first successful load) or redeploy it.
    ///
    /// Resolves to the engine's result. Per-file failures are reported
    /// together in one `Error::Aggregate` after the engine has run.
    pub fn set_schema_files(&self, manifest: Manifest) -> Pending<bool> {
        let generation = {
            let mut loads = lock(&self.loads);
            loads.issued += 1;
            loads.state = EngineState::Initializing;
            loads.issued
        };
        let loads = Arc::clone(&self.loads);
        let hook: SettleHook = Box::new(move |outcome: &Result<Reply>| {
            let mut loads = lock(&loads);
            if loads.issued != generation {
                // A later load is still pending and owns the state
                return;
            }
            loads.state = match outcome {
                Ok(Reply::Bool(true)) => EngineState::Ready,
                _ => EngineState::NotInitialized,
            };
        });
        self.bridge
            .call_with_hook(Action::SetSchemaFiles(manifest), Some(hook), Reply::into_bool)
    }

    pub fn process_key<K: Into<String>>(&self, input: K) -> Pending<InputStatus> {
        self.bridge
            .call(Action::ProcessKey(input.into()), Reply::into_input)
    }

    pub fn select_candidate(&self, index: usize) -> Pending<InputStatus> {
        self.bridge
            .call(Action::SelectCandidate(index), Reply::into_input)
    }

    pub fn delete_candidate(&self, index: usize) -> Pending<InputStatus> {
        self.bridge
            .call(Action::DeleteCandidate(index), Reply::into_input)
    }

    pub fn flip_page(&self, backward: bool) -> Pending<InputStatus> {
        self.bridge.call(Action::FlipPage(backward), Reply::into_input)
    }

    pub fn clear_input(&self) -> Pending<InputStatus> {
        self.bridge.call(Action::ClearInput, Reply::into_input)
    }

    pub fn deploy(&self) -> Pending<bool> {
        self.bridge.call(Action::Deploy, Reply::into_bool)
    }

    /// Register `callback` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, callback)
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn state(&self) -> EngineState {
        lock(&self.loads).state
    }

    pub fn phase(&self) -> Phase {
        self.bridge.phase()
    }
}

fn lock(loads: &Mutex<LoadTracker>) -> MutexGuard<'_, LoadTracker> {
    loads.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for RimeHost {
    fn drop(&mut self) {
        // Releases the request channel so the engine thread can exit
        self.bridge.close();
    }
}
