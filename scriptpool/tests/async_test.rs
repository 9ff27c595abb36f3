// Tests for the async facade used from a tokio runtime

mod common;

use common::{get, MockExecutor, Scripts};
use http::StatusCode;
use scriptpool::{Runtime, RuntimeConfig, TaskWorkerConfig, WorkerConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_from_async_code() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    scripts.write("index.php", "sleep 10");
    let runtime = Runtime::start(
        RuntimeConfig::default()
            .with_num_threads(2)
            .with_document_root(scripts.root()),
        MockExecutor::new(),
    )?;

    let requests = (0..8).map(|_| {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.serve_async(get("/index.php")).await })
    });
    for request in requests.collect::<Vec<_>>() {
        let response = request.await??;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"regular:/index.php");
    }

    runtime.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_and_restarts_from_async_code() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let worker = scripts.write("worker.php", "");
    let tasks = scripts.write("tasks.php", "");
    let executor = MockExecutor::new();
    let runtime = Runtime::start(
        RuntimeConfig::default()
            .with_num_threads(3)
            .with_document_root(scripts.root())
            .with_worker(WorkerConfig::new(&worker, 1).with_name("app"))
            .with_task_worker(TaskWorkerConfig::new("jobs", &tasks, 1)),
        executor.clone(),
    )?;

    let task = runtime.dispatch_task("async", Some("jobs"))?;
    assert_eq!(task.wait_for_completion_async().await, Some("done:async".to_string()));

    runtime.restart_workers_async().await?;
    assert_eq!(runtime.worker("app").map(|w| w.restart_count()), Some(1));

    // served by the restarted script
    let response = runtime.serve_async(get("/worker.php")).await?;
    assert_eq!(response.body().as_ref(), b"worker:/worker.php");
    assert_eq!(executor.boots(&worker), 2);

    runtime.shutdown();
    Ok(())
}
