//! The engine adapter contract.
//!
//! An adapter wraps the compiled engine and exposes its fixed, blocking
//! operation set. It is constructed and driven exclusively on the worker
//! thread, so it does not need to be `Send`.

use crate::engine_log;
use crate::event::{DeployStatus, Event};
use crate::worker::Payload;
use tracing::debug;

/// Synchronous engine operation set.
///
/// Composition-result operations return the engine's JSON result string (see
/// `InputStatus::from_json`). An `Err` models an engine-side throw: it becomes
/// the rejection of that one call and is never retried.
pub trait RimeApi {
    /// First-time start: set up traits, start the engine, open a session.
    fn init(&mut self) -> anyhow::Result<bool>;

    /// Restart with maintenance so changed shared files are recompiled.
    fn deploy(&mut self) -> anyhow::Result<bool>;

    /// Feed a key sequence (e.g. `"nihao"` or `"{BackSpace}"`).
    fn process_key(&mut self, input: &str) -> anyhow::Result<String>;

    /// Select a candidate on the current page (0-based).
    fn select_candidate(&mut self, index: usize) -> anyhow::Result<String>;

    /// Delete a learned candidate on the current page (0-based).
    fn delete_candidate(&mut self, index: usize) -> anyhow::Result<String>;

    /// Flip the candidate page; `backward` flips to the previous page.
    fn flip_page(&mut self, backward: bool) -> anyhow::Result<String>;

    /// Clear the current composition.
    fn clear_input(&mut self) -> anyhow::Result<String>;

    /// Hand the adapter its notification handle. Called once, before any
    /// other operation.
    fn set_notifier(&mut self, _notifier: Notifier) {}
}

impl<T: RimeApi + ?Sized> RimeApi for Box<T> {
    fn init(&mut self) -> anyhow::Result<bool> {
        (**self).init()
    }

    fn deploy(&mut self) -> anyhow::Result<bool> {
        (**self).deploy()
    }

    fn process_key(&mut self, input: &str) -> anyhow::Result<String> {
        (**self).process_key(input)
    }

    fn select_candidate(&mut self, index: usize) -> anyhow::Result<String> {
        (**self).select_candidate(index)
    }

    fn delete_candidate(&mut self, index: usize) -> anyhow::Result<String> {
        (**self).delete_candidate(index)
    }

    fn flip_page(&mut self, backward: bool) -> anyhow::Result<String> {
        (**self).flip_page(backward)
    }

    fn clear_input(&mut self) -> anyhow::Result<String> {
        (**self).clear_input()
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        (**self).set_notifier(notifier)
    }
}

/// Handle an adapter uses to push notifications and log output to the host.
///
/// Notifications travel on the same channel as call results, so they are
/// observed in the order the engine produced them relative to responses.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: flume::Sender<Payload>,
    forward_logs: bool,
}

impl Notifier {
    pub(crate) fn new(tx: flume::Sender<Payload>, forward_logs: bool) -> Self {
        Self { tx, forward_logs }
    }

    /// Forward a raw engine notification (`message_type`, `value`).
    ///
    /// `"deploy"` carries `start`, `success` or `failure`; `"option"` carries
    /// an option name, prefixed with `!` when the option was switched off.
    /// Other types are dropped.
    pub fn notify(&self, message_type: &str, value: &str) {
        match Self::translate(message_type, value) {
            Some(event) => {
                let _ = self.tx.send(Payload::Listener(event));
            }
            None => debug!(message_type, value, "ignoring engine notification"),
        }
    }

    /// Push an already-typed event.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(Payload::Listener(event));
    }

    /// Forward one line of engine output to `tracing`, if enabled.
    pub fn log_line(&self, line: &str, is_stderr: bool) {
        if self.forward_logs {
            engine_log::forward(line, is_stderr);
        }
    }

    fn translate(message_type: &str, value: &str) -> Option<Event> {
        match message_type {
            "deploy" => DeployStatus::parse(value).map(Event::DeployStatusChanged),
            "option" => {
                let (name, enabled) = match value.strip_prefix('!') {
                    Some(name) => (name, false),
                    None => (value, true),
                };
                if name.is_empty() {
                    return None;
                }
                Some(Event::OptionChanged {
                    name: name.to_string(),
                    enabled,
                })
            }
            _ => None,
        }
    }
}
