//! Handles for dispatched calls.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::config::Adapter;
use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::ipc::{Response, WorkerEvent};
use crate::pool::{Worker, WorkerPool};
use crate::wire::Payload;

/// Progress of a dispatched call, as seen by its handle.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    /// Single result of a plain call.
    Return(Payload),
    /// One generator value.
    Yield(Payload),
    /// Generator finished with this return value.
    Done(Payload),
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Result,
    Iterate,
}

/// Handle to a call running on a worker.
///
/// The worker answers with either a single value, read with
/// [`result`](Self::result), or a stream, read with
/// [`iterate`](Self::iterate). Only one of the two may be used, once.
///
/// Dropping the handle, or a pending `result()`, before the call settles
/// terminates the worker.
#[derive(Debug)]
pub struct TaskHandle {
    worker_id: u64,
    adapter: Adapter,
    abort: Arc<Notify>,
    events: Option<mpsc::UnboundedReceiver<TaskEvent>>,
    mode: Option<Mode>,
}

impl TaskHandle {
    pub(crate) fn new(
        worker_id: u64,
        adapter: Adapter,
        abort: Arc<Notify>,
        events: mpsc::UnboundedReceiver<TaskEvent>,
    ) -> Self {
        Self {
            worker_id,
            adapter,
            abort,
            events: Some(events),
            mode: None,
        }
    }

    /// Id of the worker running the call.
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn adapter(&self) -> Adapter {
        self.adapter
    }

    /// Terminate the worker running this call.
    ///
    /// The worker is discarded even with `keep_alive`. A pending
    /// [`result`](Self::result) fails with [`Error::Aborted`]; a stream from
    /// [`iterate`](Self::iterate) just ends.
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    fn claim(&mut self, mode: Mode) -> Result<mpsc::UnboundedReceiver<TaskEvent>> {
        match self.mode {
            Some(Mode::Result) if mode == Mode::Result => {
                return Err(Error::Protocol("result() was already taken".to_string()));
            }
            Some(Mode::Iterate) if mode == Mode::Iterate => {
                return Err(Error::Protocol("iterate() was already taken".to_string()));
            }
            Some(Mode::Result) => {
                return Err(Error::Protocol(
                    "cannot iterate a task whose result() was requested".to_string(),
                ));
            }
            Some(Mode::Iterate) => {
                return Err(Error::Protocol(
                    "cannot take result() of a task that is being iterated".to_string(),
                ));
            }
            None => {}
        }
        self.mode = Some(mode);
        self.events
            .take()
            .ok_or_else(|| Error::Protocol("task events already consumed".to_string()))
    }

    /// Wait for the single value returned by the call.
    ///
    /// Fails with a protocol error if the call produces a stream instead; the
    /// task is aborted in that case.
    pub async fn result(&mut self) -> Result<Payload> {
        let mut events = self.claim(Mode::Result)?;
        match events.recv().await {
            Some(TaskEvent::Return(value)) => Ok(value),
            Some(TaskEvent::Yield(_)) | Some(TaskEvent::Done(_)) => {
                self.abort();
                Err(Error::Protocol(
                    "task produced a stream; use iterate() instead of result()".to_string(),
                ))
            }
            Some(TaskEvent::Failed(error)) => Err(error),
            None => Err(Error::WorkerExited("task driver stopped".to_string())),
        }
    }

    /// Stream the values yielded by the call.
    ///
    /// Values that arrived before this call are delivered first.
    pub fn iterate(&mut self) -> Result<TaskStream> {
        let events = self.claim(Mode::Iterate)?;
        Ok(TaskStream {
            events,
            abort: Arc::clone(&self.abort),
            returned: None,
            finished: false,
        })
    }
}

/// Values yielded by a dispatched generator.
///
/// Dropping the stream before it ends aborts the task.
#[derive(Debug)]
pub struct TaskStream {
    events: mpsc::UnboundedReceiver<TaskEvent>,
    abort: Arc<Notify>,
    returned: Option<Payload>,
    finished: bool,
}

impl TaskStream {
    /// The generator's return value, once the stream has ended normally.
    pub fn return_value(&self) -> Option<&Payload> {
        self.returned.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for TaskStream {
    type Item = Result<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let event = match this.events.poll_recv(cx) {
            Poll::Ready(event) => event,
            Poll::Pending => return Poll::Pending,
        };
        let item = match event {
            Some(TaskEvent::Yield(value)) => return Poll::Ready(Some(Ok(value))),
            Some(TaskEvent::Done(value)) => {
                this.returned = Some(value);
                None
            }
            Some(TaskEvent::Return(_)) => Some(Err(Error::Protocol(
                "task returned a single value; use result() instead of iterate()".to_string(),
            ))),
            Some(TaskEvent::Failed(Error::Aborted)) | None => None,
            Some(TaskEvent::Failed(error)) => Some(Err(error)),
        };
        this.finished = true;
        Poll::Ready(item)
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        if !self.finished {
            self.abort.notify_one();
        }
    }
}

/// A call's time limit and the instant it runs out.
pub(crate) type Deadline = Option<(Duration, Instant)>;

/// Drive one call to completion on `worker`, reporting through `events`.
///
/// If the caller stops listening, the call is abandoned and the worker
/// terminated.
pub(crate) async fn drive(
    pool: WorkerPool,
    worker: Arc<Worker>,
    keep_alive: bool,
    deadline: Deadline,
    abort: Arc<Notify>,
    events: mpsc::UnboundedSender<TaskEvent>,
) {
    let expired = async {
        match deadline {
            Some((_, at)) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    loop {
        let event = tokio::select! {
            biased;
            _ = abort.notified() => {
                pool.terminate(&worker);
                tracing::debug!("task on worker {} aborted", worker.id());
                let _ = events.send(TaskEvent::Failed(Error::Aborted));
                return;
            }
            _ = &mut expired => {
                pool.terminate(&worker);
                let limit = deadline.map(|(limit, _)| limit).unwrap_or_default();
                tracing::warn!("task on worker {} timed out after {}ms", worker.id(), limit.as_millis());
                let _ = events.send(TaskEvent::Failed(Error::Timeout(limit)));
                return;
            }
            _ = events.closed() => {
                pool.terminate(&worker);
                tracing::debug!("task on worker {} abandoned by its caller", worker.id());
                return;
            }
            event = worker.recv() => event,
        };

        let response = match event {
            Some(WorkerEvent::Message(response)) => response,
            Some(WorkerEvent::Exited(reason)) => {
                pool.terminate(&worker);
                let _ = events.send(TaskEvent::Failed(Error::WorkerExited(reason)));
                return;
            }
            None => {
                pool.terminate(&worker);
                let _ = events.send(TaskEvent::Failed(Error::WorkerExited(
                    "worker endpoint closed".to_string(),
                )));
                return;
            }
        };

        let (event, last) = match response {
            Response::Return { value, .. } => (decode(&worker, value, TaskEvent::Return), true),
            Response::Yield {
                value, done: false, ..
            } => (decode(&worker, value, TaskEvent::Yield), false),
            Response::Yield {
                value, done: true, ..
            } => (decode(&worker, value, TaskEvent::Done), true),
            Response::Error { error, .. } => (
                TaskEvent::Failed(Error::Remote(inflate(&pool, &error))),
                true,
            ),
            other => {
                tracing::debug!("ignoring unexpected message from worker {}: {:?}", worker.id(), other);
                continue;
            }
        };

        if last {
            // Back in the pool before the caller sees the outcome.
            pool.release(&worker, keep_alive);
            let _ = events.send(event);
            return;
        }
        let _ = events.send(event);
    }
}

fn decode(worker: &Worker, value: Value, wrap: fn(Payload) -> TaskEvent) -> TaskEvent {
    match worker.codec().decode(value) {
        Ok(payload) => wrap(payload),
        Err(e) => TaskEvent::Failed(e),
    }
}

pub(crate) fn inflate(pool: &WorkerPool, error: &Value) -> Exception {
    pool.errors()
        .from_object(error)
        .unwrap_or_else(|| Exception::from_thrown(error))
}
