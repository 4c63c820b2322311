//! Log bridge lifecycle tests.
//!
//! The bridge counters are process wide, so every test here runs serially.

use dockyard::console::{AppConsole, LogType, MemoryConsole};
use dockyard::container::{ContainerHandle, LogBridge, active_handlers, started_streams};
use dockyard::runtime::{
    ContainerRuntime, CreateContainerSpec, InMemoryRuntime, LogFrame, LogStreamOptions, Ownership,
    RuntimeConfig, RuntimeTarget, SharedRuntime,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

async fn running_container(runtime: &InMemoryRuntime) -> String {
    runtime.add_image("sha256:bbb", &["logs:latest"]);
    let id = runtime
        .create_container(&CreateContainerSpec {
            image: "logs".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    runtime.start_container(&id).await.unwrap();
    id
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn attach(runtime: Ownership, id: &str, console: &MemoryConsole) -> LogBridge {
    LogBridge::attach(
        runtime,
        id,
        LogStreamOptions::default(),
        console.output_stream(LogType::AppOut),
        console.output_stream(LogType::AppErr),
    )
}

#[tokio::test]
#[serial]
async fn test_concurrent_close_is_counted_once() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let id = running_container(&runtime).await;
    let baseline = active_handlers();

    let console = MemoryConsole::new();
    let shared: SharedRuntime = runtime.clone();
    let bridge = attach(Ownership::Owned(shared), &id, &console);
    assert_eq!(active_handlers(), baseline + 1);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            let bridge = bridge.clone();
            scope.spawn(move || bridge.close());
        }
    });

    assert!(bridge.is_closed());
    assert_eq!(active_handlers(), baseline);
    assert_eq!(runtime.shutdown_count(), 1);
}

#[tokio::test]
#[serial]
async fn test_close_stops_a_followed_stream() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let id = running_container(&runtime).await;
    runtime.script_logs(vec![LogFrame::StdOut(b"started\n".to_vec())]);
    let streams = started_streams();

    let console = MemoryConsole::new();
    let shared: SharedRuntime = runtime.clone();
    let bridge = attach(Ownership::Borrowed(shared), &id, &console);
    eventually("first line", || console.contains("started")).await;
    assert_eq!(started_streams(), streams + 1);

    bridge.close();
    eventually("stream end", || started_streams() == streams).await;
    assert_eq!(runtime.shutdown_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_dedicated_connection_per_stream() {
    let shared_runtime = Arc::new(InMemoryRuntime::new());
    let id = running_container(&shared_runtime).await;
    let dedicated = Arc::new(InMemoryRuntime::new());
    let dedicated_runtime: SharedRuntime = dedicated.clone();

    let target = Arc::new(
        RuntimeTarget::builder(shared_runtime.clone())
            .dedicated(Arc::new(move || -> SharedRuntime { dedicated_runtime.clone() }))
            .config(RuntimeConfig {
                dedicated_log_client: true,
                ..Default::default()
            })
            .build(),
    );
    let snapshot = shared_runtime.inspect_container(&id).await.unwrap();
    let container = ContainerHandle::new(target, snapshot);
    let baseline = active_handlers();

    let bridge = container.connect_log(false).await.unwrap();
    assert_eq!(active_handlers(), baseline + 1);

    // The dedicated connection does not know the container, so the stream fails.
    eventually("bridge closed", || bridge.is_closed()).await;
    assert_eq!(dedicated.shutdown_count(), 1);
    assert_eq!(shared_runtime.shutdown_count(), 0);
    assert_eq!(active_handlers(), baseline);

    let requests = dedicated.log_requests();
    assert!(requests.is_empty());
    assert_eq!(dedicated.calls("logs"), vec![format!("logs {}", id)]);
}

#[tokio::test]
#[serial]
async fn test_history_is_opt_in() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let id = running_container(&runtime).await;
    let target = Arc::new(RuntimeTarget::builder(runtime.clone()).build());
    let console = MemoryConsole::new();

    let live = LogBridge::connect(&target, &id, &console, false).await;
    let full = LogBridge::connect(&target, &id, &console, true).await;
    eventually("both attached", || runtime.log_requests().len() == 2).await;

    let requests = runtime.log_requests();
    assert!(requests.iter().all(|(container, options)| container == &id && options.follow));
    assert_eq!(requests.iter().filter(|(_, o)| o.since.is_none()).count(), 1);
    assert_eq!(requests.iter().filter(|(_, o)| o.since.is_some()).count(), 1);

    live.close();
    full.close();
}
