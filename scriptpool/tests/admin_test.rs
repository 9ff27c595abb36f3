// Integration tests for converting, stopping and booting individual threads

mod common;

use common::{get, MockExecutor, Scripts};
use http::StatusCode;
use scriptpool::{MaxThreads, Runtime, RuntimeConfig, RuntimeError, StateId, WorkerConfig};

fn inactive_runtime(scripts: &Scripts, executor: MockExecutor) -> anyhow::Result<Runtime> {
    let path = scripts.write("worker.php", "");
    scripts.write("index.php", "");
    let config = RuntimeConfig::default()
        .with_num_threads(2)
        .with_max_threads(MaxThreads::Fixed(3))
        .with_document_root(scripts.root())
        .with_worker(WorkerConfig::new(&path, 1).with_name("app"));
    Ok(Runtime::start_inactive(config, executor)?)
}

#[test]
fn test_threads_can_switch_roles() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let runtime = inactive_runtime(&scripts, MockExecutor::new())?;
    assert_eq!(
        runtime.thread_states(),
        vec![StateId::Inactive, StateId::Inactive, StateId::Reserved]
    );

    runtime.convert_thread_to_regular(0)?;
    assert_eq!(runtime.regular_thread_count(), 1);
    let response = runtime.serve(get("/index.php"))?;
    assert_eq!(response.body().as_ref(), b"regular:/index.php");

    runtime.convert_thread_to_worker(1, "app")?;
    let worker = runtime.worker("app").expect("worker app");
    assert_eq!(worker.count_threads(), 1);
    let response = runtime.serve(get("/worker.php"))?;
    assert_eq!(response.body().as_ref(), b"worker:/worker.php");

    // a worker thread can become a regular thread
    runtime.convert_thread_to_regular(1)?;
    assert_eq!(worker.count_threads(), 0);
    assert_eq!(runtime.regular_thread_count(), 2);

    runtime.convert_thread_to_inactive(0)?;
    assert_eq!(runtime.regular_thread_count(), 1);
    assert!(runtime.thread(0).expect("thread 0").state().is(StateId::Inactive));

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_stopped_threads_can_be_booted_again() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let runtime = inactive_runtime(&scripts, MockExecutor::new())?;

    runtime.convert_thread_to_regular(1)?;
    runtime.shutdown_thread(1)?;
    assert!(runtime.thread(1).expect("thread 1").state().is(StateId::Reserved));
    assert_eq!(runtime.regular_thread_count(), 0);
    assert_eq!(runtime.thread_count(), 1);

    // reserved threads refuse new roles
    let err = runtime.convert_thread_to_regular(1).unwrap_err();
    assert!(matches!(err, RuntimeError::TransitionRefused { index: 1, .. }));

    runtime.boot_thread(1)?;
    assert!(runtime.thread(1).expect("thread 1").state().is(StateId::Inactive));
    let err = runtime.boot_thread(1).unwrap_err();
    assert!(matches!(err, RuntimeError::ThreadNotReserved { index: 1, .. }));

    runtime.boot_thread(2)?;
    assert_eq!(runtime.thread_count(), 3);

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_unknown_threads_and_workers() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let runtime = inactive_runtime(&scripts, MockExecutor::new())?;

    assert!(runtime.thread(42).is_none());
    let err = runtime.convert_thread_to_regular(42).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownThread(42)));
    let err = runtime.shutdown_thread(42).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownThread(42)));

    let err = runtime.convert_thread_to_worker(0, "nope").unwrap_err();
    assert_eq!(err.status(), StatusCode::NOT_FOUND);

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_requests_survive_repeated_conversions() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let executor = MockExecutor::new();
    let runtime = inactive_runtime(&scripts, executor.clone())?;
    runtime.convert_thread_to_regular(1)?;

    std::thread::scope(|s| -> anyhow::Result<()> {
        let load = s.spawn(|| {
            (0..50)
                .map(|_| runtime.serve(get("/index.php")))
                .filter(|r| r.is_ok())
                .count()
        });
        for i in 0..20 {
            if i % 2 == 0 {
                runtime.convert_thread_to_regular(0)?;
            } else {
                runtime.convert_thread_to_inactive(0)?;
            }
        }
        assert_eq!(load.join().unwrap(), 50);
        Ok(())
    })?;

    assert!(runtime.thread(0).expect("thread 0").state().is(StateId::Inactive));
    assert_eq!(runtime.regular_thread_count(), 1);

    runtime.shutdown();
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}
