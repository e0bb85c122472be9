//! The isolated engine context and the thread that drains its output.
//!
//! The engine thread owns the `EngineSession` and runs it on a
//! single-threaded tokio runtime, taking one `Action` at a time off the
//! request channel. Results and engine notifications share one outbound
//! channel, which the pump thread drains in order: results settle the
//! bridge, notifications are dispatched to subscribers.

use crate::action::{Action, Reply};
use crate::api::{Notifier, RimeApi};
use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::event::{Event, EventHub};
use crate::fs::EngineFs;
use crate::session::{panic_message, EngineSession};
use crate::source::SchemaSource;
use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Everything that travels from the engine thread back to the host.
#[derive(Debug)]
pub(crate) enum Payload {
    Listener(Event),
    Success(Reply),
    Error(Error),
}

/// Builds the engine on the engine thread.
pub(crate) type EngineFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn RimeApi>> + Send>;

pub(crate) struct WorkerSpec {
    pub fs: Box<dyn EngineFs>,
    pub source: Arc<dyn SchemaSource>,
    pub cache_path: Option<PathBuf>,
    pub forward_logs: bool,
    pub factory: EngineFactory,
}

/// Channels to a running engine thread.
pub(crate) struct WorkerHandle {
    pub requests: flume::Sender<Action>,
    pub responses: flume::Receiver<Payload>,
}

/// Start the engine thread and wait until the engine has been constructed.
pub(crate) async fn spawn(spec: WorkerSpec) -> Result<WorkerHandle> {
    let (request_tx, request_rx) = flume::unbounded::<Action>();
    let (response_tx, response_rx) = flume::unbounded::<Payload>();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    thread::Builder::new()
        .name("rimehost-engine".into())
        .spawn(move || run(spec, request_rx, response_tx, ready_tx))
        .map_err(|e| Error::WorkerStart(e.to_string()))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(WorkerHandle {
            requests: request_tx,
            responses: response_rx,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::WorkerStart("engine thread exited during startup".into())),
    }
}

fn run(
    spec: WorkerSpec,
    requests: flume::Receiver<Action>,
    responses: flume::Sender<Payload>,
    ready: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(Error::WorkerStart(e.to_string())));
            return;
        }
    };

    let factory = spec.factory;
    let engine = match panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            let _ = ready.send(Err(Error::WorkerStart(format!("{e:#}"))));
            return;
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let _ = ready.send(Err(Error::WorkerStart(format!(
                "engine constructor panicked: {message}"
            ))));
            return;
        }
    };

    let mut session = EngineSession::new(engine, spec.fs, spec.source, spec.cache_path);
    session.attach(Notifier::new(responses.clone(), spec.forward_logs));
    if ready.send(Ok(())).is_err() {
        return;
    }
    info!("engine worker started");

    runtime.block_on(async move {
        while let Ok(action) = requests.recv_async().await {
            let name = action.name();
            let outcome = AssertUnwindSafe(session.perform(action))
                .catch_unwind()
                .await;
            let payload = match outcome {
                Ok(Ok(reply)) => Payload::Success(reply),
                Ok(Err(e)) => Payload::Error(e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(action = name, %message, "engine worker panicked");
                    Payload::Error(Error::Engine(format!("{name} panicked: {message}")))
                }
            };
            if responses.send(payload).is_err() {
                break;
            }
        }
    });
    info!("engine worker stopped");
}

/// Start the thread that feeds engine output into `bridge` and `events`.
pub(crate) fn spawn_pump(
    responses: flume::Receiver<Payload>,
    bridge: Arc<Bridge>,
    events: EventHub,
) -> Result<()> {
    thread::Builder::new()
        .name("rimehost-pump".into())
        .spawn(move || {
            for payload in responses.iter() {
                match payload {
                    Payload::Success(reply) => bridge.settle(Ok(reply)),
                    Payload::Error(e) => bridge.settle(Err(e)),
                    Payload::Listener(event) => {
                        let delivered = events.dispatch(&event);
                        debug!(kind = ?event.kind(), delivered, "dispatched engine event");
                    }
                }
            }
            bridge.disconnect();
        })
        .map(|_| ())
        .map_err(|e| Error::WorkerStart(e.to_string()))
}
