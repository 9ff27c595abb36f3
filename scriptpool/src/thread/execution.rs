//! # Execution Thread
//!
//! One native OS thread running the script loop, plus everything outside
//! callers need to steer it: its [`ThreadState`], a synchronous request
//! channel, the drain [`Signal`] and the active [`ThreadHandler`].
//!
//! ## Key Concepts
//! - Script loop: ask the handler for a script, execute it, report the exit status.
//!   An empty script name ends the loop and the thread reports `Done`.
//! - Drain: closing the current drain signal wakes the thread from any blocking
//!   receive. A fresh signal is installed after every transition.
//! - Handler handoff: `set_handler` (outside) and `transition_to_new_handler`
//!   (inside) meet through `TransitionRequested → TransitionInProgress →
//!   TransitionComplete`, so the loop never sees a half-installed handler.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use super::handler::{Step, ThreadHandler};
use super::scope::ScriptScope;
use super::signal::Signal;
use super::state::{StateId, ThreadState};
use crate::context::RequestContext;
use crate::error::RuntimeError;
use crate::{log_thread, thread_span};
use crate::runtime::RuntimeShared;

/// Exit status reported when the executor panics.
pub const PANIC_EXIT_STATUS: i32 = 255;

pub struct ExecutionThread {
    index: usize,
    state: ThreadState,
    request_tx: Sender<Arc<RequestContext>>,
    request_rx: Receiver<Arc<RequestContext>>,
    drain: Mutex<Arc<Signal>>,
    handler: RwLock<Arc<ThreadHandler>>,
    /// Serializes `set_handler` calls; held for the whole handoff.
    transition: Mutex<()>,
    low_latency: AtomicBool,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<RuntimeShared>,
}

impl ExecutionThread {
    pub(crate) fn new(index: usize, shared: Arc<RuntimeShared>) -> Self {
        let (request_tx, request_rx) = bounded(0);
        Self {
            index,
            state: ThreadState::new(),
            request_tx,
            request_rx,
            drain: Mutex::new(Arc::new(Signal::new())),
            handler: RwLock::new(Arc::new(ThreadHandler::Inactive)),
            transition: Mutex::new(()),
            low_latency: AtomicBool::new(false),
            join_handle: Mutex::new(None),
            shared,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn handler(&self) -> Arc<ThreadHandler> {
        Arc::clone(&self.handler.read())
    }

    pub fn name(&self) -> String {
        self.handler.read().name()
    }

    pub fn is_low_latency(&self) -> bool {
        self.low_latency.load(Ordering::Relaxed)
    }

    pub(crate) fn set_low_latency(&self, low_latency: bool) {
        self.low_latency.store(low_latency, Ordering::Relaxed);
    }

    pub fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.handler.read().request_context()
    }

    pub(crate) fn shared(&self) -> &RuntimeShared {
        &self.shared
    }

    pub(crate) fn request_sender(&self) -> &Sender<Arc<RequestContext>> {
        &self.request_tx
    }

    pub(crate) fn request_receiver(&self) -> &Receiver<Arc<RequestContext>> {
        &self.request_rx
    }

    pub(crate) fn drain_signal(&self) -> Arc<Signal> {
        Arc::clone(&self.drain.lock())
    }

    pub(crate) fn renew_drain(&self) {
        *self.drain.lock() = Arc::new(Signal::new());
    }

    // --- Lifecycle ---

    /// Starts the native thread. Blocks until it reports `Inactive`.
    pub fn boot(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if !self.state.compare_and_swap(StateId::Reserved, StateId::Booting)
            && !self
                .state
                .compare_and_swap(StateId::BootRequested, StateId::Booting)
        {
            return Err(RuntimeError::ThreadNotReserved {
                index: self.index,
                state: self.state.name().to_string(),
            });
        }

        *self.handler.write() = Arc::new(ThreadHandler::Inactive);
        self.renew_drain();

        let thread = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("script-thread-{}", self.index))
            .spawn(move || thread.run())
            .map_err(|source| {
                self.state.set(StateId::Reserved);
                RuntimeError::ThreadSpawn {
                    index: self.index,
                    source,
                }
            })?;
        *self.join_handle.lock() = Some(handle);

        self.state.wait_for(&[StateId::Inactive]);
        log_thread!(self.index, "booted");
        Ok(())
    }

    /// Stops the native thread and waits for it to finish.
    ///
    /// No-op if the thread is already shutting down. While the runtime is still
    /// running, the thread goes back to `Reserved` and can be booted again.
    pub fn shutdown(&self) {
        let yielded = self
            .state
            .compare_and_swap(StateId::Yielding, StateId::ShuttingDown);
        if !yielded && !self.state.request_safe_state_change(StateId::ShuttingDown) {
            return;
        }
        self.drain_signal().close();
        self.state.wait_for(&[StateId::Done]);
        self.join();
        self.renew_drain();
        self.set_low_latency(false);

        if self.shared.main_state.is(StateId::Ready) {
            self.state.set(StateId::Reserved);
        }
        log_thread!(self.index, "shut down");
    }

    pub(crate) fn join(&self) {
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(thread = self.index, "execution thread panicked outside of a script");
            }
        }
    }

    // --- Handler handoff ---

    /// Swaps the handler from outside the thread. Returns `false` if the
    /// thread refused the transition because it is shutting down.
    pub(crate) fn set_handler(&self, handler: ThreadHandler) -> bool {
        let _transition = self.transition.lock();
        if !self
            .state
            .request_safe_state_change(StateId::TransitionRequested)
        {
            return false;
        }
        self.drain_signal().close();
        self.state.wait_for(&[StateId::TransitionInProgress]);

        let name = handler.name();
        *self.handler.write() = Arc::new(handler);
        self.renew_drain();
        self.state.set(StateId::TransitionComplete);
        log_thread!(self.index, "handler installed", handler = %name);
        true
    }

    /// Inside half of the handoff. Returns the newly installed handler.
    fn transition_to_new_handler(&self) -> Arc<ThreadHandler> {
        self.state.set(StateId::TransitionInProgress);
        self.state.wait_for(&[StateId::TransitionComplete]);
        self.handler()
    }

    /// Asks the active handler for the next script, following handler
    /// transitions. An empty string means the thread must stop.
    pub(crate) fn before_script_execution(self: &Arc<Self>) -> String {
        let mut handler = self.handler();
        loop {
            match handler.before_script_execution(self) {
                Step::Execute(script) => return script,
                Step::Stop => return String::new(),
                Step::Transition => handler = self.transition_to_new_handler(),
            }
        }
    }

    fn run(self: Arc<Self>) {
        let _span = thread_span!(self.index).entered();
        log_thread!(self.index, "started");
        loop {
            let script = self.before_script_execution();
            if script.is_empty() {
                break;
            }

            let handler = self.handler();
            let status = {
                let scope = ScriptScope::new(&self, &handler);
                let executor = &self.shared.executor;
                match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&scope, &script))) {
                    Ok(status) => status,
                    Err(payload) => {
                        error!(
                            thread = self.index,
                            script = %script,
                            panic = %panic_message(payload.as_ref()),
                            "script execution panicked"
                        );
                        PANIC_EXIT_STATUS
                    }
                }
            };
            handler.after_script_execution(&self, status);
        }
        debug!(thread = self.index, "script loop finished");
        self.state.set(StateId::Done);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for ExecutionThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionThread")
            .field("index", &self.index)
            .field("state", &self.state.get())
            .field("handler", &self.name())
            .field("low_latency", &self.is_low_latency())
            .field("has_thread", &self.join_handle.lock().is_some())
            .finish()
    }
}
