//! Closeable, optionally buffered channel.
//!
//! A [`Channel`] with capacity 0 is a rendezvous point: `send` completes only
//! once a receiver has taken the value. With a positive capacity, values are
//! buffered in FIFO order and producers only wait once the buffer is full.
//!
//! Closing is cooperative: buffered values and waiting producers are still
//! drained by `recv` before end-of-stream (or the close error) is observed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::exception::Exception;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Make sure future channel ids are at least `base`.
///
/// Worker processes call this with a process-specific base so ids they mint
/// do not collide with the ids of their parent.
pub fn reserve_ids_from(base: u64) {
    NEXT_CHANNEL_ID.fetch_max(base, Ordering::SeqCst);
}

fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst)
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Close requested; pending values are still being drained.
    Closing,
    Closed,
}

/// What a blocked receiver is woken with.
type Delivery<T> = std::result::Result<Option<T>, Exception>;

/// A producer suspended until its value is claimed.
struct Producer<T> {
    value: T,
    delivered: oneshot::Sender<()>,
}

struct State<T> {
    status: ChannelState,
    buffer: VecDeque<T>,
    producers: VecDeque<Producer<T>>,
    consumers: VecDeque<oneshot::Sender<Delivery<T>>>,
    error: Option<Exception>,
}

impl<T> State<T> {
    /// Promote `Closing` to `Closed` once nothing is left to drain.
    fn finish_if_drained(&mut self) {
        if self.status == ChannelState::Closing
            && self.buffer.is_empty()
            && self.producers.is_empty()
        {
            self.status = ChannelState::Closed;
        }
    }
}

struct Shared<T> {
    id: u64,
    capacity: usize,
    state: Mutex<State<T>>,
}

/// A closeable single-value-at-a-time pipe.
///
/// Cloning yields another handle to the same channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Create a channel with the given buffer capacity (0 = rendezvous).
    pub fn new(capacity: usize) -> Self {
        Self::with_id(next_channel_id(), capacity)
    }

    /// Create a channel sharing the identity of a channel owned elsewhere.
    pub(crate) fn with_id(id: u64, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                capacity,
                state: Mutex::new(State {
                    status: ChannelState::Open,
                    buffer: VecDeque::with_capacity(capacity.min(64)),
                    producers: VecDeque::new(),
                    consumers: VecDeque::new(),
                    error: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn state(&self) -> ChannelState {
        self.lock().status
    }

    /// Whether `send` would be rejected.
    pub fn is_closed(&self) -> bool {
        self.state() != ChannelState::Open
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // No user code runs under the lock, so a poisoned state is still consistent.
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a value.
    ///
    /// Resolves once the value is either handed to a receiver or stored in the
    /// buffer. A rendezvous send, or a send into a full buffer, waits until a
    /// receiver claims the value. Dropping the returned future does not
    /// withdraw a value that is already queued.
    pub async fn send(&self, value: T) -> Result<()> {
        let delivered = {
            let mut state = self.lock();
            if state.status != ChannelState::Open {
                return Err(Error::ChannelClosed);
            }

            let mut value = value;
            while let Some(consumer) = state.consumers.pop_front() {
                match consumer.send(Ok(Some(value))) {
                    Ok(()) => return Ok(()),
                    // That receiver gave up; try the next one.
                    Err(Ok(Some(returned))) => value = returned,
                    Err(_) => return Ok(()),
                }
            }

            if self.shared.capacity > 0 && state.buffer.len() < self.shared.capacity {
                state.buffer.push_back(value);
                return Ok(());
            }

            let (delivered, claimed) = oneshot::channel();
            state.producers.push_back(Producer { value, delivered });
            claimed
        };

        delivered.await.map_err(|_| Error::ChannelClosed)
    }

    /// Receive the next value.
    ///
    /// Returns `Ok(None)` at end-of-stream. If the channel was closed with an
    /// error, that error is returned exactly once after the remaining values
    /// have been drained.
    pub async fn recv(&self) -> std::result::Result<Option<T>, Exception> {
        let waiting = {
            let mut state = self.lock();

            if let Some(value) = state.buffer.pop_front() {
                // The buffer was full: the oldest waiting producer takes the freed slot.
                if let Some(producer) = state.producers.pop_front() {
                    state.buffer.push_back(producer.value);
                    let _ = producer.delivered.send(());
                }
                state.finish_if_drained();
                return Ok(Some(value));
            }

            if let Some(producer) = state.producers.pop_front() {
                let _ = producer.delivered.send(());
                state.finish_if_drained();
                return Ok(Some(producer.value));
            }

            if let Some(error) = state.error.take() {
                state.status = ChannelState::Closed;
                return Err(error);
            }

            if state.status != ChannelState::Open {
                state.status = ChannelState::Closed;
                return Ok(None);
            }

            let (consumer, waiting) = oneshot::channel();
            state.consumers.push_back(consumer);
            waiting
        };

        waiting.await.unwrap_or(Ok(None))
    }

    /// Close the channel, optionally carrying an error to receivers.
    ///
    /// Idempotent: only the first call on an open channel has an effect.
    /// Receivers already blocked are released immediately, with the error if
    /// one is given; in that case the error counts as consumed.
    pub fn close(&self, error: Option<Exception>) {
        let mut state = self.lock();
        if state.status != ChannelState::Open {
            return;
        }
        state.status = ChannelState::Closing;

        let blocked: Vec<_> = state.consumers.drain(..).collect();
        if blocked.is_empty() {
            state.error = error;
            return;
        }

        for consumer in blocked {
            let delivery = match &error {
                Some(error) => Err(error.clone()),
                None => Ok(None),
            };
            let _ = consumer.send(delivery);
        }
        state.finish_if_drained();
    }

    /// Iterate over received values until end-of-stream.
    ///
    /// A close error is yielded as the final item.
    pub fn stream(&self) -> impl Stream<Item = std::result::Result<T, Exception>> + Send + 'static {
        futures::stream::unfold(Some(self.clone()), |channel| async move {
            let channel = channel?;
            match channel.recv().await {
                Ok(Some(value)) => Some((Ok(value), Some(channel))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T: Send + 'static> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("state", &self.state())
            .finish()
    }
}
