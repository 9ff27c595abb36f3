//! Execution threads and the roles they play.

pub mod execution;
pub mod handler;
pub mod scope;
pub mod signal;
pub mod state;

pub use execution::ExecutionThread;
pub use handler::{HandlerKind, ThreadHandler};
pub use scope::ScriptScope;
pub use signal::Signal;
pub use state::{StateId, ThreadState};
