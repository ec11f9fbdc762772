//! Worker pool management.
//!
//! The pool keeps at most `max_workers` live workers across both adapters.
//! Idle workers are reused for requests of the same adapter; when the pool is
//! saturated, callers queue and are served strictly in arrival order, either
//! by being handed a worker that was just released or a slot freed by a
//! worker that went away.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::config::{Adapter, PoolConfig};
use crate::error::{Error, Result};
use crate::exception::ErrorRegistry;
use crate::handler::{CallHandler, ModuleRegistry};
use crate::ipc::{
    Endpoint, KillSwitch, Request, Response, WorkerEvent, find_worker_binary, spawn_process,
    spawn_thread,
};
use crate::wire::{ChannelRegistry, PayloadCodec, Writer};

/// A live worker endpoint, as seen from the caller's side.
pub struct Worker {
    /// Pool-internal identity, also the peer id for channel traffic.
    key: u64,
    id: u64,
    adapter: Adapter,
    outgoing: mpsc::UnboundedSender<Request>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkerEvent>>,
    kill: KillSwitch,
    codec: PayloadCodec,
}

impl Worker {
    /// Process id, or a sequence number for thread workers.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn adapter(&self) -> Adapter {
        self.adapter
    }

    /// Codec wiring channels to this worker.
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub fn send(&self, request: Request) -> Result<()> {
        self.outgoing
            .send(request)
            .map_err(|_| Error::WorkerExited(format!("worker {} is no longer accepting requests", self.id)))
    }

    /// Next event from the worker, channel traffic excluded.
    pub async fn recv(&self) -> Option<WorkerEvent> {
        self.events.lock().await.recv().await
    }

    fn kill(&self) {
        self.kill.kill();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .finish()
    }
}

/// What a queued caller is woken with.
enum Grant {
    /// A released worker, still marked busy for the new owner.
    Worker(Arc<Worker>),
    /// Room to spawn a new worker, already counted as pending.
    Slot,
}

struct Waiter {
    adapter: Adapter,
    grant: oneshot::Sender<Grant>,
}

struct Entry {
    worker: Arc<Worker>,
    busy: bool,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<Entry>,
    /// Workers being spawned; they count against the maximum.
    pending: usize,
    waiters: VecDeque<Waiter>,
    shut_down: bool,
}

struct PoolInner {
    config: PoolConfig,
    modules: Arc<ModuleRegistry>,
    errors: Arc<ErrorRegistry>,
    channels: ChannelRegistry,
    state: Mutex<PoolState>,
    next_key: AtomicU64,
    next_thread_id: AtomicU64,
    spawned: AtomicUsize,
    worker_program: OnceLock<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    /// Hand a free slot to the oldest waiter, if any.
    fn grant_slot(state: &mut PoolState) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.pending += 1;
            match waiter.grant.send(Grant::Slot) {
                Ok(()) => return,
                Err(_) => state.pending -= 1,
            }
        }
    }

    /// Remove a worker's entry; frees its slot if it was present.
    fn remove(&self, key: u64) -> Option<Arc<Worker>> {
        let mut state = self.state();
        let index = state.entries.iter().position(|e| e.worker.key == key)?;
        let entry = state.entries.swap_remove(index);
        if !state.shut_down {
            Self::grant_slot(&mut state);
        }
        Some(entry.worker)
    }

    fn terminate(&self, worker: &Worker) {
        worker.kill();
        if self.remove(worker.key).is_some() {
            tracing::debug!("terminated {} worker {}", worker.adapter, worker.id);
        }
    }

    /// Mark a worker idle, or pass it straight to a waiter.
    fn make_idle(&self, worker: Arc<Worker>) {
        let mut state = self.state();
        let Some(index) = state.entries.iter().position(|e| e.worker.key == worker.key) else {
            return;
        };

        let mut worker = worker;
        while let Some(position) = state.waiters.iter().position(|w| w.adapter == worker.adapter) {
            let Some(waiter) = state.waiters.remove(position) else {
                break;
            };
            match waiter.grant.send(Grant::Worker(worker)) {
                Ok(()) => {
                    tracing::debug!("handed released worker to a queued caller");
                    return;
                }
                Err(Grant::Worker(returned)) => worker = returned,
                Err(Grant::Slot) => return,
            }
        }

        if !state.waiters.is_empty() {
            // Only callers for the other adapter are left; make room for them.
            let entry = state.entries.swap_remove(index);
            entry.worker.kill();
            tracing::debug!("evicted idle {} worker {} for a queued caller", entry.worker.adapter, entry.worker.id);
            Self::grant_slot(&mut state);
            return;
        }

        state.entries[index].busy = false;
    }

    /// Give back a grant its waiter never picked up.
    fn return_grant(&self, grant: Grant) {
        match grant {
            Grant::Worker(worker) => self.make_idle(worker),
            Grant::Slot => {
                let mut state = self.state();
                state.pending = state.pending.saturating_sub(1);
                Self::grant_slot(&mut state);
            }
        }
    }

    /// A worker's endpoint reported exit.
    fn handle_exit(&self, key: u64, reason: &str) {
        if let Some(worker) = self.remove(key) {
            tracing::warn!("{} worker {} exited unexpectedly: {}", worker.adapter, worker.id, reason);
        }
        self.channels.detach(key);
    }

    fn worker_program(&self) -> Result<PathBuf> {
        if let Some(path) = self.worker_program.get() {
            return Ok(path.clone());
        }
        let path = find_worker_binary(self.config.worker_program.as_deref())?;
        Ok(self.worker_program.get_or_init(|| path).clone())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.entries.drain(..) {
            entry.worker.kill();
        }
    }
}

/// Releases a reserved spawn slot unless the spawn was committed.
struct SlotGuard<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.return_grant(Grant::Slot);
        }
    }
}

/// Waits for a grant; hands it back if dropped before use.
struct Ticket {
    rx: Option<oneshot::Receiver<Grant>>,
    pool: Weak<PoolInner>,
}

impl Ticket {
    async fn wait(&mut self) -> Option<Grant> {
        let rx = self.rx.as_mut()?;
        let grant = rx.await.ok();
        self.rx = None;
        grant
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        match rx.try_recv() {
            Ok(grant) => pool.return_grant(grant),
            // Still queued; give up the place in line.
            Err(_) => pool.state().waiters.retain(|w| !w.grant.is_closed()),
        }
    }
}

enum Acquired {
    Worker(Arc<Worker>),
    Spawn,
    Queued(Ticket),
}

/// Bounded, shared pool of worker endpoints.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool serving `modules` on thread workers.
    ///
    /// Process workers run the `tandem-worker` binary, which carries its own
    /// modules.
    pub fn new(config: PoolConfig, modules: ModuleRegistry) -> Self {
        Self::with_errors(config, modules, ErrorRegistry::with_builtins())
    }

    /// Like [`WorkerPool::new`], with custom error kinds.
    pub fn with_errors(config: PoolConfig, modules: ModuleRegistry, errors: ErrorRegistry) -> Self {
        let errors = Arc::new(errors);
        Self {
            inner: Arc::new(PoolInner {
                config,
                modules: Arc::new(modules),
                channels: ChannelRegistry::new(Arc::clone(&errors)),
                errors,
                state: Mutex::new(PoolState::default()),
                next_key: AtomicU64::new(1),
                next_thread_id: AtomicU64::new(1),
                spawned: AtomicUsize::new(0),
                worker_program: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn errors(&self) -> &ErrorRegistry {
        &self.inner.errors
    }

    /// Channels shared with this pool's workers.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    /// Number of live workers, busy or idle.
    pub fn live_count(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state().entries.iter().filter(|e| !e.busy).count()
    }

    /// Callers currently queued for a worker.
    pub fn waiting_count(&self) -> usize {
        self.inner.state().waiters.len()
    }

    /// Workers spawned over the pool's lifetime.
    pub fn spawned_total(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state().shut_down
    }

    /// Get a worker of the given adapter, waiting if the pool is saturated.
    pub async fn acquire(&self, adapter: Adapter) -> Result<Arc<Worker>> {
        match self.try_acquire(adapter)? {
            Acquired::Worker(worker) => Ok(worker),
            Acquired::Spawn => self.spawn_reserved(adapter).await,
            Acquired::Queued(mut ticket) => {
                tracing::debug!("pool saturated, queueing {} request", adapter);
                match ticket.wait().await {
                    Some(Grant::Worker(worker)) => Ok(worker),
                    Some(Grant::Slot) => self.spawn_reserved(adapter).await,
                    None => Err(Error::PoolShutdown),
                }
            }
        }
    }

    fn try_acquire(&self, adapter: Adapter) -> Result<Acquired> {
        let mut state = self.inner.state();
        if state.shut_down {
            return Err(Error::PoolShutdown);
        }

        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| !e.busy && e.worker.adapter == adapter)
        {
            entry.busy = true;
            tracing::debug!("reusing {} worker {}", adapter, entry.worker.id);
            return Ok(Acquired::Worker(Arc::clone(&entry.worker)));
        }

        if state.entries.len() + state.pending < self.inner.config.max_workers {
            state.pending += 1;
            return Ok(Acquired::Spawn);
        }

        if let Some(index) = state.entries.iter().position(|e| !e.busy) {
            let entry = state.entries.swap_remove(index);
            entry.worker.kill();
            tracing::debug!("evicted idle {} worker {} to make room", entry.worker.adapter, entry.worker.id);
            state.pending += 1;
            return Ok(Acquired::Spawn);
        }

        let (grant, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { adapter, grant });
        Ok(Acquired::Queued(Ticket {
            rx: Some(rx),
            pool: Arc::downgrade(&self.inner),
        }))
    }

    /// Spawn into a slot already counted as pending.
    async fn spawn_reserved(&self, adapter: Adapter) -> Result<Arc<Worker>> {
        let mut slot = SlotGuard {
            inner: &self.inner,
            armed: true,
        };
        let worker = self.spawn(adapter).await?;

        let mut state = self.inner.state();
        state.pending = state.pending.saturating_sub(1);
        slot.armed = false;
        if state.shut_down {
            worker.kill();
            return Err(Error::PoolShutdown);
        }
        state.entries.push(Entry {
            worker: Arc::clone(&worker),
            busy: true,
        });
        Ok(worker)
    }

    async fn spawn(&self, adapter: Adapter) -> Result<Arc<Worker>> {
        let inner = &self.inner;
        let mut endpoint: Endpoint = match adapter {
            Adapter::Thread => {
                let id = inner.next_thread_id.fetch_add(1, Ordering::SeqCst);
                let handler = CallHandler::new(Arc::clone(&inner.modules), Arc::clone(&inner.errors));
                spawn_thread(id, handler)?
            }
            Adapter::Process => {
                let program = inner.worker_program()?;
                spawn_process(&program, &inner.config.worker_args)?
            }
        };

        // The endpoint's kill switch takes the worker down if the handshake fails.
        endpoint.wait_ready(inner.config.startup_timeout).await?;
        inner.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::info!("spawned {} worker {}", adapter, endpoint.id);

        let key = inner.next_key.fetch_add(1, Ordering::SeqCst);
        let writer: Writer = {
            let outgoing = endpoint.outgoing.clone();
            Arc::new(move |channel_id, op| {
                outgoing
                    .send(Request::channel(channel_id, op))
                    .map_err(|_| Error::Ipc("worker endpoint is gone".to_string()))
            })
        };
        let (forward, events) = mpsc::unbounded_channel();
        let codec = PayloadCodec::new(inner.channels.clone(), key, writer);

        let Endpoint {
            id,
            outgoing,
            events: incoming,
            kill,
            ..
        } = endpoint;
        let worker = Arc::new(Worker {
            key,
            id,
            adapter,
            outgoing,
            events: tokio::sync::Mutex::new(events),
            kill,
            codec: codec.clone(),
        });

        tokio::spawn(route(Arc::downgrade(inner), codec, key, incoming, forward));
        Ok(worker)
    }

    /// Return a worker after use.
    ///
    /// Without `keep_alive` the worker is terminated; otherwise it becomes
    /// available to the next caller.
    pub fn release(&self, worker: &Arc<Worker>, keep_alive: bool) {
        if keep_alive {
            self.inner.make_idle(Arc::clone(worker));
        } else {
            self.inner.terminate(worker);
        }
    }

    /// Forcibly stop a worker and drop it from the pool.
    pub fn terminate(&self, worker: &Worker) {
        self.inner.terminate(worker);
    }

    /// Terminate every worker and fail all queued callers.
    pub fn shutdown(&self) {
        let (entries, waiters) = {
            let mut state = self.inner.state();
            state.shut_down = true;
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.waiters),
            )
        };
        // Dropped grant senders wake the waiters with PoolShutdown.
        drop(waiters);
        let count = entries.len();
        for entry in entries {
            entry.worker.kill();
        }
        tracing::info!("worker pool shut down, {} workers terminated", count);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.inner.config.max_workers)
            .field("live", &state.entries.len())
            .field("pending", &state.pending)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Pump one worker's events: channel traffic to the registry, the rest to
/// whoever holds the worker.
async fn route(
    pool: Weak<PoolInner>,
    codec: PayloadCodec,
    key: u64,
    mut incoming: mpsc::UnboundedReceiver<WorkerEvent>,
    forward: mpsc::UnboundedSender<WorkerEvent>,
) {
    let channels = codec.channels().clone();
    let reason = loop {
        match incoming.recv().await {
            Some(WorkerEvent::Message(response)) => match response.into_channel_op() {
                Ok((channel_id, op)) => channels.deliver(key, channel_id, op),
                Err(response) => {
                    if let Response::Return { value, .. } | Response::Yield { value, .. } = &response {
                        codec.adopt_channels(value);
                    }
                    let _ = forward.send(WorkerEvent::Message(response));
                }
            },
            Some(WorkerEvent::Exited(reason)) => break reason,
            None => break "worker endpoint closed".to_string(),
        }
    };

    let _ = forward.send(WorkerEvent::Exited(reason.clone()));
    match pool.upgrade() {
        Some(pool) => pool.handle_exit(key, &reason),
        None => channels.detach(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::handler::{Invocation, Module};
    use serde_json::json;

    fn pool(max: usize) -> WorkerPool {
        let modules = ModuleRegistry::new().with(
            "id",
            Module::new().function("default", |_| Invocation::value(json!(1))),
        );
        WorkerPool::new(PoolConfig::default().with_max_workers(max).unwrap(), modules)
    }

    #[tokio::test]
    async fn test_idle_worker_is_reused() {
        let pool = pool(2);
        let first = pool.acquire(Adapter::Thread).await.unwrap();
        let id = first.id();
        pool.release(&first, true);
        assert_eq!(pool.idle_count(), 1);

        let second = pool.acquire(Adapter::Thread).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.spawned_total(), 1);
    }

    #[tokio::test]
    async fn test_release_without_keep_alive_terminates() {
        let pool = pool(2);
        let worker = pool.acquire(Adapter::Thread).await.unwrap();
        pool.release(&worker, false);
        assert_eq!(pool.live_count(), 0);

        // The worker's endpoint reports its exit afterwards.
        let event = tokio::time::timeout(Duration::from_secs(5), worker.recv()).await.unwrap();
        assert!(matches!(event, Some(WorkerEvent::Exited(_))));
    }

    #[tokio::test]
    async fn test_saturated_pool_queues_fifo() {
        let pool = pool(1);
        let worker = pool.acquire(Adapter::Thread).await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Adapter::Thread).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(pool.waiting_count(), 1);

        pool.release(&worker, true);
        let handed = waiting.await.unwrap().unwrap();
        assert_eq!(handed.id(), worker.id());
        assert_eq!(pool.spawned_total(), 1);
    }

    #[tokio::test]
    async fn test_terminated_worker_frees_slot_for_waiter() {
        let pool = pool(1);
        let worker = pool.acquire(Adapter::Thread).await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Adapter::Thread).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.release(&worker, false);
        let fresh = waiting.await.unwrap().unwrap();
        assert_ne!(fresh.id(), worker.id());
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.spawned_total(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let pool = pool(1);
        let _worker = pool.acquire(Adapter::Thread).await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Adapter::Thread).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown();
        assert!(matches!(waiting.await.unwrap(), Err(Error::PoolShutdown)));
        assert!(matches!(pool.acquire(Adapter::Thread).await, Err(Error::PoolShutdown)));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_grant() {
        let pool = pool(1);
        let worker = pool.acquire(Adapter::Thread).await.unwrap();

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Adapter::Thread).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        abandoned.abort();
        let _ = abandoned.await;

        pool.release(&worker, true);
        assert_eq!(pool.idle_count(), 1);
        let again = pool.acquire(Adapter::Thread).await.unwrap();
        assert_eq!(again.id(), worker.id());
    }
}
