// Integration tests for upscaling and downscaling threads

mod common;

use std::time::Duration;

use common::{eventually, get, MockExecutor, Scripts};
use scriptpool::{MaxThreads, Runtime, RuntimeConfig, RuntimeError, StateId, WorkerConfig};

fn scaling_config(scripts: &Scripts, num_threads: usize, max_threads: usize) -> RuntimeConfig {
    let mut config = RuntimeConfig::default()
        .with_num_threads(num_threads)
        .with_max_threads(MaxThreads::Fixed(max_threads))
        .with_document_root(scripts.root());
    // keep the background downscaler out of the way
    config.downscale_check_interval = Duration::from_secs(60);
    config
}

#[test]
fn test_scaling_regular_threads_up_to_the_limit() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    scripts.write("index.php", "");
    let runtime = Runtime::start(scaling_config(&scripts, 1, 3), MockExecutor::new())?;
    assert_eq!(runtime.regular_thread_count(), 1);

    let first = runtime.scale_regular_thread()?;
    let second = runtime.scale_regular_thread()?;
    assert_ne!(first, second);
    assert_eq!(runtime.regular_thread_count(), 3);
    assert_eq!(runtime.autoscaled_thread_count(), 2);
    assert_eq!(runtime.thread_count(), 3);

    let err = runtime.scale_regular_thread().unwrap_err();
    assert!(matches!(err, RuntimeError::MaxThreadsReached));

    let response = runtime.serve(get("/index.php"))?;
    assert_eq!(response.body().as_ref(), b"regular:/index.php");

    runtime.shutdown();
    let err = runtime.scale_regular_thread().unwrap_err();
    assert!(matches!(err, RuntimeError::NotRunning));
    Ok(())
}

#[test]
fn test_scaling_a_worker_respects_its_own_limit() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let path = scripts.write("worker.php", "");
    let config = scaling_config(&scripts, 2, 4)
        .with_worker(WorkerConfig::new(&path, 1).with_name("app").with_max_threads(2));
    let executor = MockExecutor::new();
    let runtime = Runtime::start(config, executor.clone())?;
    let worker = runtime.worker("app").expect("worker app");

    let index = runtime.scale_worker_thread("app")?;
    assert_eq!(worker.count_threads(), 2);
    assert!(runtime.thread(index).expect("scaled thread").state().is(StateId::Ready));
    assert_eq!(executor.boots(&path), 2);

    let err = runtime.scale_worker_thread("app").unwrap_err();
    assert!(matches!(err, RuntimeError::MaxThreadsReached));
    assert_eq!(runtime.autoscaled_thread_count(), 1);

    let err = runtime.scale_worker_thread("nope").unwrap_err();
    assert!(matches!(err, RuntimeError::Request(_)));

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_idle_threads_are_deactivated_then_stopped() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let mut config = scaling_config(&scripts, 1, 3);
    config.max_idle_time = Duration::from_millis(10);
    let runtime = Runtime::start(config, MockExecutor::new())?;

    let scaled = [runtime.scale_regular_thread()?, runtime.scale_regular_thread()?];
    std::thread::sleep(Duration::from_millis(50));

    // first pass: idle ready threads become inactive
    assert_eq!(runtime.deactivate_threads(), 2);
    for index in scaled {
        let thread = runtime.thread(index).expect("scaled thread");
        assert!(eventually(Duration::from_secs(2), || thread.state().is(StateId::Inactive)));
    }
    assert_eq!(runtime.regular_thread_count(), 1);
    assert_eq!(runtime.autoscaled_thread_count(), 0);

    // second pass: threads that stayed inactive are stopped
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runtime.deactivate_threads(), 2);
    for index in scaled {
        assert!(runtime.thread(index).expect("scaled thread").state().is(StateId::Reserved));
    }
    assert_eq!(runtime.thread_count(), 1);
    assert_eq!(runtime.deactivate_threads(), 0);

    // reserved slots can be scaled again
    runtime.scale_regular_thread()?;
    assert_eq!(runtime.regular_thread_count(), 2);

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_terminations_per_pass_are_capped() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    let mut config = scaling_config(&scripts, 1, 4);
    config.max_idle_time = Duration::from_millis(10);
    config.max_terminations_per_check = 1;
    let runtime = Runtime::start(config, MockExecutor::new())?;

    for _ in 0..3 {
        runtime.scale_regular_thread()?;
    }
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(runtime.deactivate_threads(), 1);
    assert!(eventually(Duration::from_secs(2), || runtime.regular_thread_count() == 3));
    assert!(eventually(Duration::from_secs(2), || runtime.autoscaled_thread_count() == 2));

    runtime.shutdown();
    Ok(())
}

#[test]
fn test_stalled_requests_trigger_upscaling() -> anyhow::Result<()> {
    let scripts = Scripts::new();
    scripts.write("slow.php", "sleep 100");
    let mut config = scaling_config(&scripts, 1, 3);
    config.min_stall_time = Duration::from_millis(5);
    let runtime = Runtime::start(config, MockExecutor::new())?;

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| s.spawn(|| runtime.serve(get("/slow.php"))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert!(result.is_ok(), "request failed: {result:?}");
    }
    assert!(runtime.autoscaled_thread_count() >= 1);
    assert!(runtime.regular_thread_count() <= 3);

    runtime.shutdown();
    Ok(())
}
