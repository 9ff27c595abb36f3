use crate::thread::ScriptScope;

/// The script interpreter seen from the runtime.
///
/// `execute` runs one script to completion on the calling execution thread
/// and returns its exit status. Worker and task worker scripts loop inside
/// `execute`, pulling work through the [`ScriptScope`] they are given.
///
/// Implementations are shared by every execution thread.
pub trait ScriptExecutor: Send + Sync + 'static {
    fn execute(&self, scope: &ScriptScope<'_>, script: &str) -> i32;

    /// Drops interpreter caches on a thread whose worker is being restarted.
    fn reset_cache(&self, _thread_index: usize) {}
}

impl<F> ScriptExecutor for F
where
    F: Fn(&ScriptScope<'_>, &str) -> i32 + Send + Sync + 'static,
{
    fn execute(&self, scope: &ScriptScope<'_>, script: &str) -> i32 {
        self(scope, script)
    }
}
