// Shared helpers for the integration tests: a scripted executor and temp script files.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, StatusCode};
use scriptpool::{HandlerKind, ScriptExecutor, ScriptScope};
use serde_json::json;
use tempfile::TempDir;

/// Script files written to a temporary directory that also serves as document root.
///
/// Each script is a list of directives, one per line:
/// - `exit N`: return N right away (for workers: before reaching the request loop)
/// - `sleep MS`: sleep before answering every request or task
pub struct Scripts {
    dir: TempDir,
}

impl Scripts {
    pub fn new() -> Self {
        scriptpool::logging::init_test();
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write script");
        path
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Directives {
    exit: Option<i32>,
    sleep: Option<Duration>,
}

impl Directives {
    fn load(script: &str) -> Option<Self> {
        let content = std::fs::read_to_string(script).ok()?;
        let mut directives = Directives::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
                (Some("exit"), Some(code)) => directives.exit = Some(code as i32),
                (Some("sleep"), Some(ms)) => directives.sleep = Some(Duration::from_millis(ms)),
                _ => {}
            }
        }
        Some(directives)
    }

    fn pause(&self) {
        if let Some(sleep) = self.sleep {
            std::thread::sleep(sleep);
        }
    }
}

#[derive(Default)]
struct Stats {
    executions: AtomicUsize,
    worker_requests: AtomicUsize,
    tasks: AtomicUsize,
    cache_resets: AtomicUsize,
    boots: Mutex<HashMap<String, usize>>,
}

/// Stand-in interpreter. Regular scripts echo their path, worker scripts
/// loop over their requests, task worker scripts answer every task.
#[derive(Clone, Default)]
pub struct MockExecutor {
    stats: Arc<Stats>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self) -> usize {
        self.stats.executions.load(Ordering::SeqCst)
    }

    pub fn worker_requests(&self) -> usize {
        self.stats.worker_requests.load(Ordering::SeqCst)
    }

    pub fn tasks(&self) -> usize {
        self.stats.tasks.load(Ordering::SeqCst)
    }

    pub fn cache_resets(&self) -> usize {
        self.stats.cache_resets.load(Ordering::SeqCst)
    }

    /// How many times `script` was started.
    pub fn boots(&self, script: &Path) -> usize {
        let key = script.to_string_lossy().into_owned();
        self.stats.boots.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    fn run_regular(&self, scope: &ScriptScope<'_>, script: &str) -> i32 {
        let Some(ctx) = scope.request_context() else {
            return 1;
        };
        let Some(directives) = Directives::load(script) else {
            ctx.set_status(StatusCode::NOT_FOUND);
            ctx.write(b"not found");
            return 0;
        };
        if let Some(code) = directives.exit {
            return code;
        }
        directives.pause();
        ctx.write(format!("regular:{}", ctx.path().unwrap_or_default()).as_bytes());
        0
    }

    fn run_worker(&self, scope: &ScriptScope<'_>, script: &str) -> i32 {
        let directives = Directives::load(script).unwrap_or_default();
        if let Some(code) = directives.exit {
            return code;
        }
        loop {
            let ctx = match scope.wait_for_worker_request() {
                Ok(Some(ctx)) => ctx,
                _ => return 0,
            };
            self.stats.worker_requests.fetch_add(1, Ordering::SeqCst);
            directives.pause();

            let handler_return = ctx.parameters().map(|params| json!({ "echo": params }));
            if let Some(path) = ctx.path() {
                ctx.write(format!("worker:{path}").as_bytes());
            }
            let _ = scope.finish_worker_request(handler_return);
        }
    }

    fn run_task_worker(&self, scope: &ScriptScope<'_>, script: &str) -> i32 {
        let directives = Directives::load(script).unwrap_or_default();
        loop {
            let task = match scope.wait_for_task() {
                Ok(Some(task)) => task,
                _ => return 0,
            };
            self.stats.tasks.fetch_add(1, Ordering::SeqCst);
            directives.pause();
            let result = task.payload().map(|payload| format!("done:{payload}"));
            let _ = scope.finish_task(result);
        }
    }
}

impl ScriptExecutor for MockExecutor {
    fn execute(&self, scope: &ScriptScope<'_>, script: &str) -> i32 {
        self.stats.executions.fetch_add(1, Ordering::SeqCst);
        *self
            .stats
            .boots
            .lock()
            .unwrap()
            .entry(script.to_string())
            .or_default() += 1;

        match scope.handler_kind() {
            HandlerKind::Worker => self.run_worker(scope, script),
            HandlerKind::TaskWorker => self.run_task_worker(scope, script),
            _ => self.run_regular(scope, script),
        }
    }

    fn reset_cache(&self, _thread_index: usize) {
        self.stats.cache_resets.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn get(path: &str) -> Request<Bytes> {
    Request::builder()
        .uri(path)
        .body(Bytes::new())
        .expect("request")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
