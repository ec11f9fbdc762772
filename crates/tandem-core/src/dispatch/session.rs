//! Generators driven step by step across the worker boundary.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::handler::Step;
use crate::ipc::{Request, Response, WorkerEvent};
use crate::pool::{Worker, WorkerPool};
use crate::wire::Payload;

use super::task::inflate;

#[derive(Debug)]
enum State {
    /// A generator is registered on the worker.
    Live,
    /// Finished; holds a return value not yet reported.
    Settled(Option<Payload>),
}

/// A generator living on a worker, resumed one step at a time.
///
/// Every resume is a round trip. Once the generator finishes, errors, or the
/// session is dropped, the worker goes back to the pool (or is terminated
/// without `keep_alive`).
#[derive(Debug)]
pub struct GeneratorSession {
    pool: WorkerPool,
    worker: Option<Arc<Worker>>,
    task_id: u64,
    worker_id: u64,
    keep_alive: bool,
    step_timeout: Option<Duration>,
    state: State,
}

impl GeneratorSession {
    /// Send the opening call and settle the session from the worker's answer.
    pub(crate) async fn open(
        pool: WorkerPool,
        worker: Arc<Worker>,
        task_id: u64,
        call: Request,
        keep_alive: bool,
        step_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut session = Self {
            pool,
            worker_id: worker.id(),
            worker: Some(worker),
            task_id,
            keep_alive,
            step_timeout,
            state: State::Live,
        };

        match session.exchange(call).await? {
            Response::Gen { task_id } if task_id == session.task_id => {}
            Response::Return { value, .. } => {
                let value = session.decode(value)?;
                session.finish(false);
                session.state = State::Settled(Some(value));
            }
            Response::Error { error, .. } => {
                let exception = inflate(&session.pool, &error);
                session.finish(false);
                return Err(Error::Remote(exception));
            }
            other => {
                session.finish(true);
                return Err(Error::Protocol(format!(
                    "unexpected answer to a generator call: {:?}",
                    other
                )));
            }
        }
        Ok(session)
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Settled(_))
    }

    /// Resume with `value`.
    pub async fn next(&mut self, value: Payload) -> Result<Step> {
        let args = self.encode_arg(value);
        self.resume(|task_id| Request::Next { task_id, args }).await
    }

    /// Finish the generator early with `value`.
    pub async fn return_value(&mut self, value: Payload) -> Result<Step> {
        if let State::Settled(_) = self.state {
            self.state = State::Settled(None);
            return Ok(Step::Complete(value));
        }
        let args = self.encode_arg(value);
        self.resume(|task_id| Request::Return { task_id, args }).await
    }

    /// Raise `exception` inside the generator.
    pub async fn throw(&mut self, exception: Exception) -> Result<Step> {
        if let State::Settled(_) = self.state {
            return Err(Error::Remote(exception));
        }
        let args = vec![exception.to_object()];
        self.resume(|task_id| Request::Throw { task_id, args }).await
    }

    fn encode_arg(&self, value: Payload) -> Vec<serde_json::Value> {
        match &self.worker {
            Some(worker) => vec![worker.codec().encode(value)],
            None => Vec::new(),
        }
    }

    async fn resume(&mut self, request: impl FnOnce(u64) -> Request) -> Result<Step> {
        if let State::Settled(returned) = &mut self.state {
            return Ok(Step::Complete(returned.take().unwrap_or_default()));
        }

        let response = self.exchange(request(self.task_id)).await?;
        match response {
            Response::Yield {
                value, done: false, ..
            } => Ok(Step::Yielded(self.decode(value)?)),
            Response::Yield {
                value, done: true, ..
            } => {
                let value = self.decode(value);
                self.finish(false);
                self.state = State::Settled(None);
                Ok(Step::Complete(value?))
            }
            Response::Error { error, .. } => {
                let exception = inflate(&self.pool, &error);
                self.finish(false);
                self.state = State::Settled(None);
                Err(Error::Remote(exception))
            }
            other => {
                self.finish(true);
                self.state = State::Settled(None);
                Err(Error::Protocol(format!(
                    "unexpected answer while driving task {}: {:?}",
                    self.task_id, other
                )))
            }
        }
    }

    /// Send `request` and wait for the answer for this task.
    async fn exchange(&mut self, request: Request) -> Result<Response> {
        let Some(worker) = self.worker.clone() else {
            return Err(Error::Protocol(format!("task {} has no worker", self.task_id)));
        };
        if let Err(e) = worker.send(request) {
            self.finish(true);
            self.state = State::Settled(None);
            return Err(e);
        }

        let task_id = self.task_id;
        let answer = async {
            loop {
                match worker.recv().await {
                    Some(WorkerEvent::Message(response)) => {
                        if response.task_id().is_none_or(|id| id == task_id) {
                            return Ok(response);
                        }
                        tracing::debug!("ignoring message for task {:?}", response.task_id());
                    }
                    Some(WorkerEvent::Exited(reason)) => return Err(Error::WorkerExited(reason)),
                    None => {
                        return Err(Error::WorkerExited("worker endpoint closed".to_string()));
                    }
                }
            }
        };

        let outcome = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, answer).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(limit)),
            },
            None => answer.await,
        };
        if outcome.is_err() {
            self.finish(true);
            self.state = State::Settled(None);
        }
        outcome
    }

    fn decode(&self, value: serde_json::Value) -> Result<Payload> {
        match &self.worker {
            Some(worker) => worker.codec().decode(value),
            None => Ok(Payload::Value(value)),
        }
    }

    /// Give the worker back, or terminate it.
    fn finish(&mut self, discard: bool) {
        if let Some(worker) = self.worker.take() {
            if discard {
                self.pool.terminate(&worker);
            } else {
                self.pool.release(&worker, self.keep_alive);
            }
        }
    }
}

impl Drop for GeneratorSession {
    fn drop(&mut self) {
        // The worker still holds live generator state.
        self.finish(true);
    }
}
