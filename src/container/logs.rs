//! Container log streaming.
//!
//! A [`LogBridge`] owns one attached log stream and the two console sinks it
//! writes to. Attachment is asynchronous: the stream is opened by a spawned
//! task, so a bridge may be closed before its stream exists. Closing is
//! idempotent and also happens when the stream ends or fails.

use crate::console::{AppConsole, LogType};
use crate::runtime::{LogFrame, LogStreamOptions, Ownership, RuntimeTarget};
use futures::StreamExt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Bridges created but not yet closed.
static ACTIVE_HANDLERS: AtomicIsize = AtomicIsize::new(0);

/// Streams opened but not yet finished.
static STARTED_STREAMS: AtomicIsize = AtomicIsize::new(0);

/// Number of log bridges created and not yet closed in this process.
pub fn active_handlers() -> isize {
    ACTIVE_HANDLERS.load(Ordering::SeqCst)
}

/// Number of log streams opened and not yet finished in this process.
pub fn started_streams() -> isize {
    STARTED_STREAMS.load(Ordering::SeqCst)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Sink = Mutex<Option<Box<dyn Write + Send>>>;

enum StreamSlot {
    Pending,
    Started(AbortHandle),
}

struct StreamGuard;

impl StreamGuard {
    fn start() -> Self {
        let started = STARTED_STREAMS.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Log stream started. Now started: {}", started);
        Self
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let started = STARTED_STREAMS.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Log stream finished. Now started: {}", started);
    }
}

struct Inner {
    container_id: String,
    closed: AtomicBool,
    slot: Mutex<StreamSlot>,
    stdout: Sink,
    stderr: Sink,
    runtime: Ownership,
}

impl Inner {
    fn write(&self, sink: &Sink, bytes: &[u8]) {
        if let Some(out) = lock(sink).as_mut()
            && let Err(e) = out.write_all(bytes)
        {
            warn!("Failed to write log output of {}: {}", self.container_id, e);
        }
    }

    async fn pump(&self, options: LogStreamOptions) {
        let mut stream = match self.runtime.runtime().logs(&self.container_id, &options).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to attach to logs of {}: {}", self.container_id, e);
                self.write(&self.stderr, format!("{}\n", e).as_bytes());
                return;
            }
        };

        let _guard = StreamGuard::start();
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(LogFrame::StdOut(bytes)) => self.write(&self.stdout, &bytes),
                Ok(LogFrame::StdErr(bytes)) => self.write(&self.stderr, &bytes),
                Ok(LogFrame::StdIn(_)) => warn!("Unknown log frame type dropped: stdin"),
                Ok(LogFrame::Console(_)) => warn!("Unknown log frame type dropped: console"),
                Err(e) => {
                    warn!("Log stream of {} failed: {}", self.container_id, e);
                    self.write(&self.stderr, format!("{}\n", e).as_bytes());
                    break;
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let StreamSlot::Started(handle) = &*lock(&self.slot) {
            handle.abort();
        }
        for sink in [&self.stdout, &self.stderr] {
            if let Some(mut out) = lock(sink).take() {
                let _ = out.flush();
            }
        }
        self.runtime.release();

        let active = ACTIVE_HANDLERS.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Closed log bridge for {}. Now active: {}", self.container_id, active);
    }
}

/// An attached container log stream.
///
/// Clones share the same stream; closing any clone closes all of them.
#[derive(Clone)]
pub struct LogBridge {
    inner: Arc<Inner>,
}

impl LogBridge {
    /// Attach to the logs of `container_id`, writing stdout frames to
    /// `stdout` and stderr frames to `stderr`.
    ///
    /// Must be called within a tokio runtime. When `runtime` is owned, it is
    /// released on close.
    pub fn attach(
        runtime: Ownership,
        container_id: impl Into<String>,
        options: LogStreamOptions,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        let active = ACTIVE_HANDLERS.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::new(Inner {
            container_id: container_id.into(),
            closed: AtomicBool::new(false),
            slot: Mutex::new(StreamSlot::Pending),
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(Some(stderr)),
            runtime,
        });
        debug!("Created log bridge for {}. Now active: {}", inner.container_id, active);

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            task_inner.pump(options).await;
            task_inner.close();
        });

        {
            let mut slot = lock(&inner.slot);
            if inner.closed.load(Ordering::SeqCst) {
                task.abort();
            } else {
                *slot = StreamSlot::Started(task.abort_handle());
            }
        }

        Self { inner }
    }

    /// Attach a container's logs to a console.
    ///
    /// Without `include_history` only output produced from now on is shown.
    pub async fn connect(
        target: &RuntimeTarget,
        container_id: &str,
        console: &dyn AppConsole,
        include_history: bool,
    ) -> Self {
        let options = LogStreamOptions {
            since: (!include_history).then(|| chrono::Utc::now().timestamp()),
            ..Default::default()
        };
        let runtime = target.log_runtime().await;
        Self::attach(
            runtime,
            container_id,
            options,
            console.output_stream(LogType::AppOut),
            console.output_stream(LogType::AppErr),
        )
    }

    /// Container this bridge is attached to.
    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    /// Whether the bridge has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the stream, both sinks and an owned runtime handle.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::MemoryConsole;
    use crate::runtime::{ContainerRuntime, CreateContainerSpec, InMemoryRuntime, SharedRuntime};
    use std::time::Duration;

    async fn container(runtime: &InMemoryRuntime) -> String {
        runtime.add_image("sha256:aaa", &["demo:latest"]);
        runtime
            .create_container(&CreateContainerSpec {
                image: "demo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn wait_closed(bridge: &LogBridge) {
        for _ in 0..200 {
            if bridge.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log bridge did not close");
    }

    #[tokio::test]
    async fn test_demultiplexes_and_closes_on_completion() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let id = container(&runtime).await;
        runtime.script_container_logs(
            &id,
            vec![
                LogFrame::StdOut(b"hello\n".to_vec()),
                LogFrame::StdIn(b"dropped\n".to_vec()),
                LogFrame::StdErr(b"oops\n".to_vec()),
                LogFrame::StdOut(b"bye\n".to_vec()),
            ],
        );

        let console = MemoryConsole::new();
        let shared: SharedRuntime = runtime.clone();
        let bridge = LogBridge::attach(
            Ownership::Borrowed(shared),
            &id,
            LogStreamOptions {
                follow: false,
                ..Default::default()
            },
            console.output_stream(LogType::AppOut),
            console.output_stream(LogType::AppErr),
        );
        wait_closed(&bridge).await;

        assert_eq!(console.lines_of(LogType::AppOut), vec!["hello", "bye"]);
        assert_eq!(console.lines_of(LogType::AppErr), vec!["oops"]);
        assert_eq!(runtime.shutdown_count(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_owned_runtime_once() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let id = container(&runtime).await;

        let console = MemoryConsole::new();
        let shared: SharedRuntime = runtime.clone();
        let bridge = LogBridge::attach(
            Ownership::Owned(shared),
            &id,
            LogStreamOptions::default(),
            console.output_stream(LogType::AppOut),
            console.output_stream(LogType::AppErr),
        );
        assert!(!bridge.is_closed());

        bridge.close();
        bridge.clone().close();
        assert!(bridge.is_closed());
        assert_eq!(runtime.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_failure_closes_bridge() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let console = MemoryConsole::new();
        let shared: SharedRuntime = runtime.clone();
        let bridge = LogBridge::attach(
            Ownership::Borrowed(shared),
            "missing",
            LogStreamOptions::default(),
            console.output_stream(LogType::AppOut),
            console.output_stream(LogType::AppErr),
        );
        wait_closed(&bridge).await;
        assert!(console.contains("No such container"));
    }
}
