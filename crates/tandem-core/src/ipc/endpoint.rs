//! Worker endpoints: the spawned thread or process behind a pool entry.
//!
//! Whatever the adapter, an [`Endpoint`] looks the same from the caller's
//! side: an unbounded queue of [`Request`]s going in, a queue of
//! [`WorkerEvent`]s coming out, and a [`KillSwitch`] that tears the worker
//! down without its cooperation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::{Adapter, WORKER_PATH_ENV};
use crate::error::{Error, Result};
use crate::handler::CallHandler;

use super::protocol::{Request, Response, read_frame, write_frame};

/// Name of the worker executable.
pub const WORKER_BINARY: &str = if cfg!(windows) {
    "tandem-worker.exe"
} else {
    "tandem-worker"
};

/// Something that happened on a worker endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(Response),
    /// The endpoint is gone; no further events follow.
    Exited(String),
}

enum Kill {
    Thread(Mutex<Option<oneshot::Sender<()>>>),
    Process(Arc<Mutex<Option<Child>>>),
}

/// Forcibly terminates a worker. Dropping the switch terminates it too.
pub struct KillSwitch {
    kill: Kill,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KillSwitch {
    /// Terminate the worker. Idempotent.
    pub fn kill(&self) {
        match &self.kill {
            Kill::Thread(signal) => {
                if let Some(signal) = lock(signal).take() {
                    let _ = signal.send(());
                }
            }
            Kill::Process(child) => {
                if let Some(child) = lock(child).as_mut() {
                    if let Err(e) = child.start_kill() {
                        // Already exited, which is fine
                        tracing::debug!("failed to kill worker process: {}", e);
                    }
                }
            }
        }
    }
}

impl Drop for KillSwitch {
    fn drop(&mut self) {
        self.kill();
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kill {
            Kill::Thread(_) => f.write_str("KillSwitch(thread)"),
            Kill::Process(_) => f.write_str("KillSwitch(process)"),
        }
    }
}

/// A spawned worker, not yet known to be ready.
#[derive(Debug)]
pub struct Endpoint {
    /// Thread sequence number or process id.
    pub id: u64,
    pub adapter: Adapter,
    pub outgoing: mpsc::UnboundedSender<Request>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub kill: KillSwitch,
}

impl Endpoint {
    /// Wait for the worker's ready signal.
    ///
    /// Fails if the worker exits first, says something else first, or stays
    /// silent past `timeout`.
    pub async fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<()> {
        let first = async {
            match self.events.recv().await {
                Some(WorkerEvent::Message(Response::Ready)) => Ok(()),
                Some(WorkerEvent::Message(other)) => Err(Error::WorkerStartup(format!(
                    "unexpected first message from worker: {:?}",
                    other
                ))),
                Some(WorkerEvent::Exited(reason)) => Err(Error::WorkerStartup(reason)),
                None => Err(Error::WorkerStartup("worker endpoint closed".to_string())),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, first).await.map_err(|_| {
                Error::WorkerStartup(format!("no ready signal within {}ms", limit.as_millis()))
            })?,
            None => first.await,
        }
    }
}

/// Run `handler` on a dedicated OS thread with its own runtime.
///
/// Killing stops the thread's runtime, cancelling everything it was running
/// at the next suspension point. A module function that blocks without
/// awaiting keeps its thread busy until it returns; only process workers
/// can be stopped at any point.
pub fn spawn_thread(id: u64, handler: CallHandler) -> Result<Endpoint> {
    let (outgoing, requests) = mpsc::unbounded_channel();
    let (responses, mut replies) = mpsc::unbounded_channel::<Response>();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    std::thread::Builder::new()
        .name(format!("tandem-worker-{}", id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("failed to start runtime for worker thread {}: {}", id, e);
                    return;
                }
            };
            runtime.block_on(async move {
                tokio::select! {
                    _ = handler.serve(requests, responses) => {}
                    _ = kill_rx => {}
                }
            });
            runtime.shutdown_background();
        })
        .map_err(|e| Error::WorkerStartup(format!("failed to spawn worker thread: {}", e)))?;

    // The thread's senders all go away with its runtime; that is the exit signal.
    tokio::spawn(async move {
        while let Some(response) = replies.recv().await {
            if events_tx.send(WorkerEvent::Message(response)).is_err() {
                return;
            }
        }
        let _ = events_tx.send(WorkerEvent::Exited(format!("worker thread {} stopped", id)));
    });

    Ok(Endpoint {
        id,
        adapter: Adapter::Thread,
        outgoing,
        events,
        kill: KillSwitch {
            kill: Kill::Thread(Mutex::new(Some(kill_tx))),
        },
    })
}

/// Spawn a worker process speaking framed JSON over stdin/stdout.
pub fn spawn_process(program: &Path, args: &[String]) -> Result<Endpoint> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            Error::WorkerStartup(format!(
                "Failed to spawn worker process '{}': {}",
                program.display(),
                e
            ))
        })?;

    let id = child
        .id()
        .map(u64::from)
        .ok_or_else(|| Error::WorkerStartup("worker process exited immediately".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

    let (outgoing, mut requests) = mpsc::unbounded_channel::<Request>();
    let (events_tx, events) = mpsc::unbounded_channel();
    let child = Arc::new(Mutex::new(Some(child)));

    tokio::spawn(async move {
        let mut stdin = BufWriter::new(stdin);
        while let Some(request) = requests.recv().await {
            if let Err(e) = write_frame(&mut stdin, &request).await {
                tracing::debug!("worker {} stopped accepting requests: {}", id, e);
                break;
            }
        }
    });

    {
        let child = Arc::clone(&child);
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            let reason = loop {
                match read_frame::<_, Response>(&mut stdout).await {
                    Ok(Some(response)) => {
                        // Keep draining even if nobody listens, so the worker never blocks on stdout.
                        let _ = events_tx.send(WorkerEvent::Message(response));
                    }
                    Ok(None) => break format!("worker process {} closed its output", id),
                    Err(e) => break format!("worker process {} sent a bad frame: {}", id, e),
                }
            };

            let taken = lock(&child).take();
            let reason = match taken {
                Some(mut child) => {
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => format!("worker process {} exited ({})", id, status),
                        Err(_) => reason,
                    }
                }
                None => reason,
            };
            let _ = events_tx.send(WorkerEvent::Exited(reason));
        });
    }

    Ok(Endpoint {
        id,
        adapter: Adapter::Process,
        outgoing,
        events,
        kill: KillSwitch {
            kill: Kill::Process(child),
        },
    })
}

/// Find the tandem-worker binary.
///
/// Looks in the following order:
/// 1. The explicitly configured path
/// 2. `TANDEM_WORKER_PATH` environment variable
/// 3. Same directory as the current executable (and its parent, for test binaries)
/// 4. System PATH
/// 5. `target/{debug,release}` of the workspace, for development
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::WorkerStartup(format!(
            "configured worker binary '{}' does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let candidate = dir.join(WORKER_BINARY);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::WorkerStartup(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY, WORKER_PATH_ENV
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::exception::ErrorRegistry;
    use crate::handler::{Invocation, Module, ModuleRegistry};
    use serde_json::json;

    fn handler() -> CallHandler {
        let modules = ModuleRegistry::new().with(
            "echo",
            Module::new().function("default", |args| {
                Invocation::value(args.into_iter().next().unwrap_or_default())
            }),
        );
        CallHandler::new(Arc::new(modules), Arc::new(ErrorRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn test_thread_endpoint_handshake_and_call() {
        let mut endpoint = spawn_thread(1, handler()).unwrap();
        endpoint.wait_ready(Some(Duration::from_secs(5))).await.unwrap();

        endpoint
            .outgoing
            .send(Request::Call {
                module: "echo".to_string(),
                function: "default".to_string(),
                args: vec![json!("hi")],
                task_id: None,
            })
            .unwrap();
        assert_eq!(
            endpoint.events.recv().await,
            Some(WorkerEvent::Message(Response::Return {
                value: json!("hi"),
                task_id: None
            }))
        );
    }

    #[tokio::test]
    async fn test_killed_thread_reports_exit() {
        let mut endpoint = spawn_thread(2, handler()).unwrap();
        endpoint.wait_ready(None).await.unwrap();

        endpoint.kill.kill();
        endpoint.kill.kill();
        match endpoint.events.recv().await {
            Some(WorkerEvent::Exited(reason)) => assert!(reason.contains("stopped")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_missing_configured_binary() {
        let result = find_worker_binary(Some(Path::new("/definitely/not/here/tandem-worker")));
        assert!(matches!(result, Err(Error::WorkerStartup(_))));
    }

    #[tokio::test]
    async fn test_spawn_process_failure() {
        let result = spawn_process(Path::new("/definitely/not/here/tandem-worker"), &[]);
        assert!(matches!(result, Err(Error::WorkerStartup(_))));
    }
}
