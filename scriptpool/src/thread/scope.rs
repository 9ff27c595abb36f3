use std::sync::Arc;

use serde_json::Value;

use super::execution::ExecutionThread;
use super::handler::{HandlerKind, ThreadHandler};
use crate::context::RequestContext;
use crate::error::{Result, RuntimeError};
use crate::task::PendingTask;

/// The view a running script has of the thread executing it.
///
/// Passed to [`ScriptExecutor::execute`](crate::ScriptExecutor::execute).
/// Worker scripts loop on [`wait_for_worker_request`](Self::wait_for_worker_request),
/// task worker scripts on [`wait_for_task`](Self::wait_for_task).
pub struct ScriptScope<'a> {
    thread: &'a Arc<ExecutionThread>,
    handler: &'a ThreadHandler,
}

impl<'a> ScriptScope<'a> {
    pub(crate) fn new(thread: &'a Arc<ExecutionThread>, handler: &'a Arc<ThreadHandler>) -> Self {
        Self {
            thread,
            handler: handler.as_ref(),
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread.index()
    }

    pub fn handler_name(&self) -> String {
        self.handler.name()
    }

    pub fn handler_kind(&self) -> HandlerKind {
        self.handler.kind()
    }

    /// The request being served, or the bootstrap context of a booting worker.
    pub fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.handler.request_context()
    }

    /// Blocks until the next request for this worker. `Ok(None)` means the
    /// script must leave its request loop and return.
    pub fn wait_for_worker_request(&self) -> Result<Option<Arc<RequestContext>>> {
        match self.handler {
            ThreadHandler::Worker(handler) => Ok(handler.wait_for_worker_request(self.thread)),
            _ => Err(RuntimeError::WrongThreadRole("worker")),
        }
    }

    /// Completes the current worker request, handing `handler_return` back to the caller.
    pub fn finish_worker_request(&self, handler_return: Option<Value>) -> Result<()> {
        match self.handler {
            ThreadHandler::Worker(handler) => {
                handler.finish_worker_request(self.thread, handler_return);
                Ok(())
            }
            _ => Err(RuntimeError::WrongThreadRole("worker")),
        }
    }

    /// Blocks until the next task. `Ok(None)` means the script must return.
    pub fn wait_for_task(&self) -> Result<Option<Arc<PendingTask>>> {
        match self.handler {
            ThreadHandler::TaskWorker(handler) => Ok(handler.wait_for_task(self.thread)),
            _ => Err(RuntimeError::WrongThreadRole("task worker")),
        }
    }

    pub fn finish_task(&self, result: Option<String>) -> Result<()> {
        match self.handler {
            ThreadHandler::TaskWorker(handler) => {
                handler.finish_task(result);
                Ok(())
            }
            _ => Err(RuntimeError::WrongThreadRole("task worker")),
        }
    }
}
