//! The unit of work handed from the dispatcher to an execution thread.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RequestError;
use crate::thread::Signal;
use crate::worker::{clean_path, Worker};

#[derive(Debug)]
struct ResponseParts {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

/// One inbound request (or extension call) and its completion signal.
///
/// The context is closed exactly once, either by the thread that served it
/// or by the dispatcher rejecting it; closing wakes everyone blocked in
/// [`RequestContext::wait`].
pub struct RequestContext {
    id: Uuid,
    request: Option<Request<Bytes>>,
    script_filename: Option<PathBuf>,
    worker_name: Option<String>,
    worker: Option<Arc<Worker>>,
    env: HashMap<String, String>,
    handler_parameters: Option<Value>,
    handler_return: Mutex<Option<Value>>,
    response: Mutex<ResponseParts>,
    done: Signal,
    started_at: Instant,
    high_latency: AtomicBool,
    is_bootstrap: bool,
}

impl RequestContext {
    /// Wraps an HTTP request. The script defaults to the request path under the document root.
    pub fn new(request: Request<Bytes>) -> Self {
        Self::build(Some(request), None)
    }

    /// A request without an HTTP payload addressed to a worker by name.
    pub fn for_worker(name: impl Into<String>) -> Self {
        Self::build(None, Some(name.into()))
    }

    /// Synthetic context a worker thread holds while its script boots.
    pub(crate) fn bootstrap(
        script: PathBuf,
        env: HashMap<String, String>,
        worker: Option<Arc<Worker>>,
    ) -> Self {
        let mut ctx = Self::build(None, None);
        ctx.script_filename = Some(script);
        ctx.env = env;
        ctx.worker = worker;
        ctx.is_bootstrap = true;
        ctx
    }

    fn build(request: Option<Request<Bytes>>, worker_name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            script_filename: None,
            worker_name,
            worker: None,
            env: HashMap::new(),
            handler_parameters: None,
            handler_return: Mutex::new(None),
            response: Mutex::new(ResponseParts::default()),
            done: Signal::new(),
            started_at: Instant::now(),
            high_latency: AtomicBool::new(false),
            is_bootstrap: false,
        }
    }

    pub fn with_script_filename(mut self, script: impl Into<PathBuf>) -> Self {
        self.script_filename = Some(script.into());
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.handler_parameters = Some(parameters);
        self
    }

    // --- Routing ---

    /// Rejects malformed input before it reaches a thread.
    pub(crate) fn validate(&self) -> Result<(), RequestError> {
        if let Some(script) = &self.script_filename {
            if script.to_string_lossy().contains('\0') {
                return Err(RequestError::InvalidPath);
            }
        }
        if let Some(request) = &self.request {
            if request.uri().path().contains('\0') {
                return Err(RequestError::InvalidPath);
            }
            if let Some(value) = request.headers().get(CONTENT_LENGTH) {
                let valid = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .is_some();
                if !valid {
                    return Err(RequestError::InvalidContentLength);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn resolve_script(&mut self, document_root: &Path) {
        if self.script_filename.is_some() {
            return;
        }
        if let Some(request) = &self.request {
            // cleaned against `/` first so `..` cannot leave the document root
            let rooted = clean_path(&Path::new("/").join(request.uri().path()));
            let relative = rooted.strip_prefix("/").unwrap_or(rooted.as_path());
            self.script_filename = Some(document_root.join(relative));
        }
    }

    pub(crate) fn assign_worker(&mut self, worker: Arc<Worker>) {
        self.script_filename = Some(worker.file_name().to_path_buf());
        for (key, value) in worker.env() {
            self.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.worker = Some(worker);
    }

    // --- Accessors ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> Option<&Request<Bytes>> {
        self.request.as_ref()
    }

    /// Path component of the request URI, if this is an HTTP request.
    pub fn path(&self) -> Option<&str> {
        self.request.as_ref().map(|r| r.uri().path())
    }

    /// Script to execute, empty when nothing could be resolved.
    pub fn script_filename(&self) -> String {
        self.script_filename
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn script_path(&self) -> Option<&Path> {
        self.script_filename.as_deref()
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    pub fn worker(&self) -> Option<&Arc<Worker>> {
        self.worker.as_ref()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn parameters(&self) -> Option<&Value> {
        self.handler_parameters.as_ref()
    }

    pub fn set_handler_return(&self, value: Option<Value>) {
        *self.handler_return.lock() = value;
    }

    pub fn handler_return(&self) -> Option<Value> {
        self.handler_return.lock().clone()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.is_bootstrap
    }

    pub fn is_high_latency(&self) -> bool {
        self.high_latency.load(Ordering::Relaxed)
    }

    pub(crate) fn set_high_latency(&self, high_latency: bool) {
        self.high_latency.store(high_latency, Ordering::Relaxed);
    }

    // --- Response ---

    pub fn set_status(&self, status: StatusCode) {
        self.response.lock().status = status;
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.response.lock().headers.insert(name, value);
    }

    pub fn write(&self, chunk: &[u8]) {
        self.response.lock().body.extend_from_slice(chunk);
    }

    pub fn status(&self) -> StatusCode {
        self.response.lock().status
    }

    /// Takes the accumulated response, leaving an empty one behind.
    pub fn take_response(&self) -> Response<Bytes> {
        let parts = std::mem::take(&mut *self.response.lock());
        let mut response = Response::new(parts.body.freeze());
        *response.status_mut() = parts.status;
        *response.headers_mut() = parts.headers;
        response
    }

    // --- Completion ---

    /// Marks the request as finished. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let _response = self.response.lock();
        self.done.close()
    }

    /// Answers with `status` and `message` unless the request already finished.
    pub fn reject(&self, status: StatusCode, message: &str) -> bool {
        let mut response = self.response.lock();
        if self.done.is_closed() {
            return false;
        }
        response.status = status;
        response.headers.clear();
        response.body.clear();
        response.body.extend_from_slice(message.as_bytes());
        self.done.close()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }

    /// Blocks until the request is closed.
    pub fn wait(&self) {
        self.done.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("script_filename", &self.script_filename)
            .field("worker", &self.worker.as_ref().map(|w| w.name().to_string()))
            .field("is_done", &self.is_done())
            .field("high_latency", &self.is_high_latency())
            .finish()
    }
}
