// Routing with a relative document root. Kept in its own test binary because
// it changes the working directory of the process.

mod common;

use common::{get, MockExecutor, Scripts};
use scriptpool::{ConfigError, Runtime, RuntimeConfig, RuntimeError, WorkerConfig};

#[test]
fn test_relative_document_root_matches_workers() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    scripts.write("worker.php", "");
    scripts.write("index.php", "");
    std::env::set_current_dir(scripts.root())?;

    // default document root is "." and the worker path is relative too
    let config = RuntimeConfig::default()
        .with_num_threads(2)
        .with_worker(WorkerConfig::new("worker.php", 1).with_name("app"));
    let executor = MockExecutor::new();
    let runtime = Runtime::start(config, executor.clone())?;

    let response = runtime.serve(get("/worker.php"))?;
    assert_eq!(response.body().as_ref(), b"worker:/worker.php");

    let response = runtime.serve(get("/admin/../worker.php"))?;
    assert_eq!(response.body().as_ref(), b"worker:/admin/../worker.php");

    let response = runtime.serve(get("/./index.php"))?;
    assert_eq!(response.body().as_ref(), b"regular:/./index.php");
    assert_eq!(executor.worker_requests(), 2);
    runtime.shutdown();

    let err = Runtime::start(
        RuntimeConfig::default().with_num_threads(1).with_document_root(""),
        MockExecutor::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Config(ConfigError::InvalidDocumentRoot { .. })
    ));
    Ok(())
}
