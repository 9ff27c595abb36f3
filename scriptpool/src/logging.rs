// Logging for scriptpool
//
// Built on the `tracing` ecosystem. The runtime itself only emits events;
// installing a subscriber is up to the embedding application, and the
// helpers below cover the usual setups.
//
// # Usage Examples
//
// ```no_run
// use scriptpool::logging;
//
// // INFO level, human readable console output
// logging::init_default();
//
// // or pick the settings yourself
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// Execution threads are named `script-thread-{index}`, so with
// `show_thread_info` enabled every line carries the thread it came from.
//
// ## Using Log Macros
//
// ```no_run
// use scriptpool::{log_runtime, log_thread};
//
// log_runtime!("startup", "completed", num_threads = 4);
// log_thread!(3, "booted");
// ```

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::{Arc, Once};

use tracing::{Level, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging helpers.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// One JSON object per event instead of human readable lines.
    pub json_format: bool,
    pub show_file_line: bool,
    /// Thread names and ids. Execution threads are `script-thread-{index}`.
    pub show_thread_info: bool,
    pub show_time: bool,
    /// Extra directives, e.g. `"scriptpool::scheduler=trace,scriptpool::thread=debug"`.
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let directives = config.target_filters.iter().flat_map(|f| f.split(','));
    directives
        .filter_map(|directive| directive.trim().parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(config.level.into()),
            EnvFilter::add_directive,
        )
}

fn console_layer<S>(config: &LogConfig) -> fmt::Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info)
}

/// Installs the global subscriber. Only the first call of any `init*`
/// function takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let json = config.json_format;
        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(json.then(|| fmt::layer().json().flatten_event(true)))
            .with((!json && config.show_time).then(|| console_layer(&config)))
            .with((!json && !config.show_time).then(|| console_layer(&config).without_time()));
        set_global_subscriber(subscriber);
    });
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("scriptpool: a global tracing subscriber is already installed: {err}");
    }
}

/// Logs to the console and appends to `log_file`. The file never gets ANSI colors.
///
/// # Errors
/// Returns an error if the log file cannot be opened.
pub fn init_with_file(config: LogConfig, log_file: &str) -> io::Result<()> {
    let file: Arc<File> = Arc::new(OpenOptions::new().create(true).append(true).open(log_file)?);

    INIT.call_once(|| {
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config))
            .with(file_layer);
        set_global_subscriber(subscriber);
    });
    Ok(())
}

/// INFO level, human readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG level with per-thread lifecycle events from the runtime.
pub fn init_development() {
    let config = LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("scriptpool=debug,scriptpool::thread=trace".to_string()),
    };
    init(config);
}

/// JSON output for log aggregators, without file/line information.
pub fn init_production() {
    let config = LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    };
    init(config);
}

/// Warnings and errors only, no timestamps.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    };
    init(config);
}

/// Span covering the work of one execution thread.
#[macro_export]
macro_rules! thread_span {
    ($index:expr) => {
        tracing::debug_span!("script_thread", index = $index)
    };
    ($index:expr, $($fields:tt)*) => {
        tracing::debug_span!("script_thread", index = $index, $($fields)*)
    };
}

/// Per-thread lifecycle events: boot, handler installs, shutdown.
#[macro_export]
macro_rules! log_thread {
    ($index:expr, $event:expr) => {
        tracing::debug!(thread = $index, event = $event)
    };
    ($index:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(thread = $index, event = $event, $($fields)*)
    };
}

/// Worker lifecycle events.
#[macro_export]
macro_rules! log_worker {
    ($worker:expr, $event:expr) => {
        tracing::info!(worker = $worker, event = $event)
    };
    ($worker:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(worker = $worker, event = $event, $($fields)*)
    };
}

/// Runtime wide state changes.
#[macro_export]
macro_rules! log_runtime {
    ($operation:expr, $status:expr) => {
        tracing::info!(operation = $operation, status = $status)
    };
    ($operation:expr, $status:expr, $($fields:tt)*) => {
        tracing::info!(operation = $operation, status = $status, $($fields)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error = %$error)
    };
    ($error:expr, $($fields:tt)*) => {
        tracing::error!(error = %$error, $($fields)*)
    };
}

/// Scheduling decisions: dispatch, queueing, scaling.
#[macro_export]
macro_rules! log_scheduler {
    ($component:expr, $event:expr) => {
        tracing::debug!(scheduler = $component, event = $event)
    };
    ($component:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(scheduler = $component, event = $event, $($fields)*)
    };
}
