//! Ordered request/response bridge to the engine worker.
//!
//! Every call becomes a message that is either posted to the worker right
//! away (nothing running) or appended to a FIFO queue. When the worker
//! answers, the running message is settled and the queue head is posted.
//! Responses carry no identifiers: correlation is purely by order, which is
//! why at most one message may ever be running.

use crate::action::{Action, Reply};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Where the bridge posts actions.
pub trait Transport: Send {
    fn post(&self, action: Action) -> Result<()>;
}

impl Transport for flume::Sender<Action> {
    fn post(&self, action: Action) -> Result<()> {
        self.send(action).map_err(|_| Error::Disconnected)
    }
}

/// Runs with the outcome of a message just before its caller sees it.
pub type SettleHook = Box<dyn FnOnce(&Result<Reply>) + Send>;

/// Observable state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    /// One message running, `n` waiting
    RunningWithQueue(usize),
}

struct Settler {
    reply: oneshot::Sender<Result<Reply>>,
    hook: Option<SettleHook>,
}

impl Settler {
    fn settle(self, outcome: Result<Reply>) {
        if let Some(hook) = self.hook {
            hook(&outcome);
        }
        // The caller may have dropped its Pending
        let _ = self.reply.send(outcome);
    }
}

struct Message {
    action: Action,
    settler: Settler,
}

struct BridgeState {
    running: Option<Settler>,
    queue: VecDeque<Message>,
    transport: Option<Box<dyn Transport>>,
}

pub struct Bridge {
    state: Mutex<BridgeState>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("phase", &self.phase()).finish()
    }
}

impl Bridge {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            state: Mutex::new(BridgeState {
                running: None,
                queue: VecDeque::new(),
                transport: Some(Box::new(transport)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue `action`. The message is queued before this returns, so calls
    /// run in the order they were made regardless of when the returned
    /// futures are polled.
    pub fn call<T>(&self, action: Action, extract: fn(Reply) -> Result<T>) -> Pending<T> {
        self.call_with_hook(action, None, extract)
    }

    pub fn call_with_hook<T>(
        &self,
        action: Action,
        hook: Option<SettleHook>,
        extract: fn(Reply) -> Result<T>,
    ) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        let message = Message {
            action,
            settler: Settler { reply: tx, hook },
        };
        let mut state = self.lock();
        if state.transport.is_none() {
            message.settler.settle(Err(Error::Disconnected));
        } else if state.running.is_some() {
            debug!(action = message.action.name(), waiting = state.queue.len() + 1, "queued");
            state.queue.push_back(message);
        } else {
            Self::start(&mut state, message);
        }
        Pending { rx, extract }
    }

    /// Post `message`; if that fails, reject it and move on to the next
    /// queued one until something is running or the queue is empty.
    fn start(state: &mut BridgeState, message: Message) {
        let mut next = Some(message);
        while let Some(message) = next.take() {
            let name = message.action.name();
            let posted = match &state.transport {
                Some(transport) => transport.post(message.action),
                None => Err(Error::Disconnected),
            };
            match posted {
                Ok(()) => {
                    debug!(action = name, "posted");
                    state.running = Some(message.settler);
                }
                Err(e) => {
                    warn!(action = name, error = %e, "could not post to engine worker");
                    message.settler.settle(Err(e));
                    next = state.queue.pop_front();
                }
            }
        }
    }

    /// Deliver the worker's answer to the running message and post the next one.
    pub fn settle(&self, outcome: Result<Reply>) {
        let mut state = self.lock();
        let Some(running) = state.running.take() else {
            warn!("engine response with nothing running, dropped");
            return;
        };
        running.settle(outcome);
        match state.queue.pop_front() {
            Some(next) => Self::start(&mut state, next),
            None => debug!("bridge idle"),
        }
    }

    /// The worker is gone: reject the running and queued messages, and
    /// every later call.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.transport = None;
        let running = state.running.take();
        let queued: Vec<Message> = state.queue.drain(..).collect();
        if running.is_some() || !queued.is_empty() {
            warn!(pending = queued.len() + usize::from(running.is_some()), "engine worker disconnected");
        }
        if let Some(running) = running {
            running.settle(Err(Error::Disconnected));
        }
        for message in queued {
            message.settler.settle(Err(Error::Disconnected));
        }
    }

    /// Stop posting. The running message still completes; queued and later
    /// messages are rejected.
    pub fn close(&self) {
        let mut state = self.lock();
        state.transport = None;
        if state.running.is_none() {
            for message in state.queue.drain(..) {
                message.settler.settle(Err(Error::Disconnected));
            }
        }
    }

    pub fn phase(&self) -> Phase {
        let state = self.lock();
        match (&state.running, state.queue.len()) {
            (None, _) => Phase::Idle,
            (Some(_), 0) => Phase::Running,
            (Some(_), n) => Phase::RunningWithQueue(n),
        }
    }
}

/// Deferred result of a bridge call.
///
/// Dropping it does not cancel the call; the result is discarded.
#[must_use = "the result of an engine call is only observable by awaiting it"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<Reply>>,
    extract: fn(Reply) -> Result<T>,
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let extract = self.extract;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome.and_then(extract)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Disconnected)),
        }
    }
}
