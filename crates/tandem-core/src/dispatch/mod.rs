//! Task dispatch: running module functions on pooled workers.
//!
//! [`Dispatcher::run`] is the main entry point. It acquires a worker, sends
//! the call, and returns a [`TaskHandle`] while the call is still running.
//! A background driver owns the worker for the call's lifetime and enforces
//! the timeout and abort requests.

mod session;
mod task;

pub use session::GeneratorSession;
pub use task::{TaskHandle, TaskStream};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::config::{Adapter, RunOptions};
use crate::error::{Error, Result};
use crate::ipc::Request;
use crate::pool::{Worker, WorkerPool};
use crate::wire::Payload;

use task::Deadline;

/// Runs calls on a [`WorkerPool`].
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: WorkerPool,
    next_task_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            next_task_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Call `options.function` from `module` with `args` on a pooled worker.
    ///
    /// Waits for a worker if the pool is saturated. The timeout, if any,
    /// covers that wait as well as the call; running out while waiting fails
    /// with [`Error::Timeout`].
    pub async fn run(&self, module: &str, args: Vec<Payload>, options: RunOptions) -> Result<TaskHandle> {
        let deadline = options.timeout.map(|limit| (limit, Instant::now() + limit));
        let worker = self.acquire(options.adapter, deadline).await?;
        let call = Request::Call {
            module: module.to_string(),
            function: options.function.clone(),
            args: worker.codec().encode_all(args),
            task_id: None,
        };
        if let Err(e) = worker.send(call) {
            self.pool.terminate(&worker);
            return Err(e);
        }
        tracing::debug!(
            "dispatched {}.{} to {} worker {}",
            module,
            options.function,
            worker.adapter(),
            worker.id()
        );

        let abort = Arc::new(Notify::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = TaskHandle::new(worker.id(), worker.adapter(), Arc::clone(&abort), events);

        tokio::spawn(task::drive(
            self.pool.clone(),
            worker,
            options.keep_alive,
            deadline,
            abort,
            events_tx,
        ));
        Ok(handle)
    }

    /// Start a generator on a worker and drive it step by step.
    ///
    /// If the function does not return a generator, the session completes
    /// with its value on the first resume. `options.timeout` bounds the wait
    /// for a worker and then each round trip.
    pub async fn start(
        &self,
        module: &str,
        args: Vec<Payload>,
        options: RunOptions,
    ) -> Result<GeneratorSession> {
        let deadline = options.timeout.map(|limit| (limit, Instant::now() + limit));
        let worker = self.acquire(options.adapter, deadline).await?;
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let call = Request::Call {
            module: module.to_string(),
            function: options.function.clone(),
            args: worker.codec().encode_all(args),
            task_id: Some(task_id),
        };
        GeneratorSession::open(
            self.pool.clone(),
            worker,
            task_id,
            call,
            options.keep_alive,
            options.timeout,
        )
        .await
    }

    async fn acquire(&self, adapter: Adapter, deadline: Deadline) -> Result<Arc<Worker>> {
        let Some((limit, at)) = deadline else {
            return self.pool.acquire(adapter).await;
        };
        match tokio::time::timeout_at(at, self.pool.acquire(adapter)).await {
            Ok(acquired) => acquired,
            Err(_) => {
                tracing::warn!("no {} worker became available within {}ms", adapter, limit.as_millis());
                Err(Error::Timeout(limit))
            }
        }
    }
}
