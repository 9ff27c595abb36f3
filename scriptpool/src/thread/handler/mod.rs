//! Thread roles.
//!
//! The set of roles is closed: a thread is inactive, serves one-shot
//! scripts, runs a worker script in a loop, or pulls background tasks.
//! Each role decides what the thread does before and after every script
//! execution and how it reacts to state changes requested from outside.

mod inactive;
mod regular;
mod task_worker;
mod worker;

use std::sync::Arc;

use serde::Serialize;
use tracing::error;

pub use inactive::InactiveHandler;
pub use regular::RegularHandler;
pub use task_worker::TaskWorkerHandler;
pub use worker::WorkerHandler;

use super::execution::ExecutionThread;
use crate::context::RequestContext;

/// What the script loop does next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Execute(String),
    /// A new handler is being installed.
    Transition,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandlerKind {
    Inactive,
    Regular,
    Worker,
    TaskWorker,
}

pub enum ThreadHandler {
    Inactive,
    Regular(RegularHandler),
    Worker(WorkerHandler),
    TaskWorker(TaskWorkerHandler),
}

impl ThreadHandler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            ThreadHandler::Inactive => HandlerKind::Inactive,
            ThreadHandler::Regular(_) => HandlerKind::Regular,
            ThreadHandler::Worker(_) => HandlerKind::Worker,
            ThreadHandler::TaskWorker(_) => HandlerKind::TaskWorker,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ThreadHandler::Inactive => "Inactive Thread".to_string(),
            ThreadHandler::Regular(_) => "Regular Thread".to_string(),
            ThreadHandler::Worker(handler) => format!(
                "Worker Thread - {}",
                handler.worker().file_name().display()
            ),
            ThreadHandler::TaskWorker(handler) => {
                format!("Task Worker Thread - {}", handler.task_worker().name())
            }
        }
    }

    pub(crate) fn before_script_execution(&self, thread: &Arc<ExecutionThread>) -> Step {
        match self {
            ThreadHandler::Inactive => InactiveHandler.before_script_execution(thread),
            ThreadHandler::Regular(handler) => handler.before_script_execution(thread),
            ThreadHandler::Worker(handler) => handler.before_script_execution(thread),
            ThreadHandler::TaskWorker(handler) => handler.before_script_execution(thread),
        }
    }

    pub(crate) fn after_script_execution(&self, thread: &Arc<ExecutionThread>, exit_status: i32) {
        match self {
            ThreadHandler::Inactive => InactiveHandler.after_script_execution(thread, exit_status),
            ThreadHandler::Regular(handler) => handler.after_script_execution(thread, exit_status),
            ThreadHandler::Worker(handler) => handler.after_script_execution(thread, exit_status),
            ThreadHandler::TaskWorker(handler) => {
                handler.after_script_execution(thread, exit_status)
            }
        }
    }

    pub fn request_context(&self) -> Option<Arc<RequestContext>> {
        match self {
            ThreadHandler::Inactive => None,
            ThreadHandler::Regular(handler) => handler.request_context(),
            ThreadHandler::Worker(handler) => handler.request_context(),
            ThreadHandler::TaskWorker(handler) => handler.request_context(),
        }
    }
}

/// Logs a state the role does not know how to handle and stops the thread.
fn unexpected_state(thread: &ExecutionThread, role: &'static str) -> Step {
    error!(
        thread = thread.index(),
        state = %thread.state().get(),
        role,
        "unexpected thread state"
    );
    Step::Stop
}
