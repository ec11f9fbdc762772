//! Channels shared across worker boundaries.
//!
//! A [`RemoteChannel`] wraps a local [`Channel`] and a list of *writers*, one
//! per peer endpoint that holds a proxy of the same logical channel. While no
//! writer is attached it behaves exactly like the local channel. Once peers
//! are attached, `send` is forwarded round-robin to them and `close` is
//! broadcast to all of them; values sent by peers arrive in the local channel
//! and are read with `recv`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::{FutureExt, Stream};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{Channel, ChannelState};
use crate::error::{Error, Result};
use crate::exception::{ErrorRegistry, Exception, TYPE_TAG};

/// Identifies the peer endpoint a writer talks to.
pub type PeerId = u64;

/// Peer id a worker uses for its parent.
pub const PARENT_PEER: PeerId = 0;

/// `"@@type"` value of a channel descriptor.
pub const CHANNEL_TAG: &str = "Channel";

/// A channel operation travelling over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOp {
    Send(Value),
    /// Close, carrying a serialized error or `null`.
    Close(Value),
}

/// Delivers a channel operation to one peer.
pub type Writer = Arc<dyn Fn(u64, ChannelOp) -> Result<()> + Send + Sync>;

/// Serialized stand-in for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    #[serde(rename = "@@type")]
    pub tag: String,
    pub id: u64,
    pub capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u64, capacity: usize) -> Self {
        Self {
            tag: CHANNEL_TAG.to_string(),
            id,
            capacity,
        }
    }

    /// Parse a descriptor, rejecting negative or missing capacities.
    pub fn from_value(value: Value) -> Result<Self> {
        let descriptor: Self = serde_json::from_value(value)
            .map_err(|e| Error::Serialization(format!("invalid channel descriptor: {}", e)))?;
        if descriptor.tag != CHANNEL_TAG {
            return Err(Error::Serialization(format!(
                "expected a {} descriptor, got {}",
                CHANNEL_TAG, descriptor.tag
            )));
        }
        Ok(descriptor)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ TYPE_TAG: self.tag, "id": self.id, "capacity": self.capacity })
    }
}

type Table = Mutex<FxHashMap<u64, RemoteChannel>>;

#[derive(Default)]
struct Link {
    writers: Vec<(PeerId, Writer)>,
    cursor: usize,
    /// Registry holding this channel, removed from on close.
    table: Option<Weak<Table>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A channel that may be operated on from several threads or processes.
#[derive(Clone)]
pub struct RemoteChannel {
    local: Channel<Value>,
    link: Arc<Mutex<Link>>,
}

impl RemoteChannel {
    /// Create a new channel owned by this endpoint.
    pub fn new(capacity: usize) -> Self {
        Self::from(Channel::new(capacity))
    }

    pub fn id(&self) -> u64 {
        self.local.id()
    }

    pub fn capacity(&self) -> usize {
        self.local.capacity()
    }

    pub fn state(&self) -> ChannelState {
        self.local.state()
    }

    /// The local end that values from peers arrive in.
    pub fn local(&self) -> &Channel<Value> {
        &self.local
    }

    /// Number of peers currently attached.
    pub fn peer_count(&self) -> usize {
        lock(&self.link).writers.len()
    }

    /// Send a value.
    ///
    /// With peers attached, the value is handed to the next peer in turn and
    /// the call resolves as soon as it is posted.
    pub async fn send(&self, value: Value) -> Result<()> {
        if self.local.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let writer = {
            let mut link = lock(&self.link);
            if link.writers.is_empty() {
                None
            } else {
                let index = link.cursor % link.writers.len();
                link.cursor = link.cursor.wrapping_add(1);
                Some(Arc::clone(&link.writers[index].1))
            }
        };
        match writer {
            Some(writer) => writer(self.id(), ChannelOp::Send(value)),
            None => self.local.send(value).await,
        }
    }

    pub async fn recv(&self) -> std::result::Result<Option<Value>, Exception> {
        self.local.recv().await
    }

    pub fn stream(&self) -> impl Stream<Item = std::result::Result<Value, Exception>> + Send + 'static {
        self.local.stream()
    }

    /// Close the channel here and on every attached peer.
    pub fn close(&self, error: Option<Exception>) {
        self.close_except(None, error);
    }

    /// Close, skipping the peer the close came from.
    fn close_except(&self, origin: Option<PeerId>, error: Option<Exception>) {
        if self.local.is_closed() {
            return;
        }
        let (writers, table) = {
            let mut link = lock(&self.link);
            (std::mem::take(&mut link.writers), link.table.take())
        };

        let payload = error.as_ref().map_or(Value::Null, Exception::to_object);
        for (peer, writer) in writers {
            if Some(peer) == origin {
                continue;
            }
            if let Err(e) = writer(self.id(), ChannelOp::Close(payload.clone())) {
                tracing::debug!("failed to forward close of channel {} to peer {}: {}", self.id(), peer, e);
            }
        }
        self.local.close(error);

        if let Some(table) = table.and_then(|t| t.upgrade()) {
            lock(&table).remove(&self.id());
        }
    }

    /// Attach a writer for `peer`, replacing any previous one.
    fn attach(&self, peer: PeerId, writer: Writer) {
        let mut link = lock(&self.link);
        link.writers.retain(|(existing, _)| *existing != peer);
        link.writers.push((peer, writer));
    }

    fn detach(&self, peer: PeerId) {
        lock(&self.link).writers.retain(|(existing, _)| *existing != peer);
    }
}

impl From<Channel<Value>> for RemoteChannel {
    fn from(local: Channel<Value>) -> Self {
        Self {
            local,
            link: Arc::new(Mutex::new(Link::default())),
        }
    }
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("state", &self.state())
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Channels this endpoint has exposed to, or adopted from, its peers.
///
/// An entry lives until its channel closes or its last peer is detached. A
/// channel that stays open while shared with a long-lived peer stays here
/// for as long as that peer does.
#[derive(Clone)]
pub struct ChannelRegistry {
    table: Arc<Table>,
    errors: Arc<ErrorRegistry>,
}

impl ChannelRegistry {
    pub fn new(errors: Arc<ErrorRegistry>) -> Self {
        Self {
            table: Arc::new(Mutex::new(FxHashMap::default())),
            errors,
        }
    }

    /// Error kinds used to inflate close errors.
    pub fn errors(&self) -> &ErrorRegistry {
        &self.errors
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u64) -> Option<RemoteChannel> {
        lock(&self.table).get(&id).cloned()
    }

    fn track(&self, channel: &RemoteChannel) {
        lock(&channel.link).table = Some(Arc::downgrade(&self.table));
        lock(&self.table)
            .entry(channel.id())
            .or_insert_with(|| channel.clone());
    }

    /// Hand a channel to `peer`, returning the descriptor to put on the wire.
    pub fn expose(&self, channel: &RemoteChannel, peer: PeerId, writer: Writer) -> Value {
        if !channel.local.is_closed() {
            self.track(channel);
            channel.attach(peer, writer);
        }
        ChannelDescriptor::new(channel.id(), channel.capacity()).to_value()
    }

    /// Materialize a descriptor received from `peer` as a local proxy.
    ///
    /// A channel id seen before resolves to the same proxy.
    pub fn adopt(&self, descriptor: &ChannelDescriptor, peer: PeerId, writer: Writer) -> RemoteChannel {
        let channel = self.get(descriptor.id).unwrap_or_else(|| {
            RemoteChannel::from(Channel::with_id(descriptor.id, descriptor.capacity))
        });
        self.track(&channel);
        channel.attach(peer, writer);
        channel
    }

    /// Apply an operation that arrived from `peer`.
    pub fn deliver(&self, peer: PeerId, channel_id: u64, op: ChannelOp) {
        let Some(channel) = self.get(channel_id) else {
            tracing::debug!("dropping {:?} for unknown channel {}", op, channel_id);
            return;
        };
        match op {
            ChannelOp::Send(value) => {
                // One poll queues the value in order; the message loop never waits on a receiver.
                if let Some(Err(e)) = channel.local.send(value).now_or_never() {
                    tracing::debug!("value for channel {} dropped: {}", channel.id(), e);
                }
            }
            ChannelOp::Close(error) => {
                let error = self.errors.from_object(&error);
                channel.close_except(Some(peer), error);
            }
        }
    }

    /// Forget every writer that talks to `peer`.
    ///
    /// Channels left without any peer are dropped from the registry; exposing
    /// one again registers it anew.
    pub fn detach(&self, peer: PeerId) {
        let channels: Vec<_> = lock(&self.table).values().cloned().collect();
        let mut orphaned = Vec::new();
        for channel in channels {
            channel.detach(peer);
            if channel.peer_count() == 0 {
                orphaned.push(channel.id());
            }
        }
        if orphaned.is_empty() {
            return;
        }
        let mut table = lock(&self.table);
        for id in orphaned {
            // A peer may have attached in the meantime.
            if table.get(&id).is_some_and(|c| c.peer_count() == 0) {
                table.remove(&id);
            }
        }
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Sent = Arc<Mutex<Vec<(PeerId, u64, ChannelOp)>>>;

    fn recording_writer(peer: PeerId, sent: &Sent) -> Writer {
        let sent = Arc::clone(sent);
        Arc::new(move |id, op| {
            sent.lock().unwrap().push((peer, id, op));
            Ok(())
        })
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(ErrorRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn test_send_without_peers_stays_local() {
        let channel = RemoteChannel::new(1);
        channel.send(json!(1)).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_send_round_robins_across_peers() {
        let registry = registry();
        let sent: Sent = Arc::default();
        let channel = RemoteChannel::new(0);
        registry.expose(&channel, 1, recording_writer(1, &sent));
        registry.expose(&channel, 2, recording_writer(2, &sent));

        for i in 0..4 {
            channel.send(json!(i)).await.unwrap();
        }
        let peers: Vec<_> = sent.lock().unwrap().iter().map(|(p, _, _)| *p).collect();
        assert_eq!(peers, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_close_broadcasts_and_unregisters() {
        let registry = registry();
        let sent: Sent = Arc::default();
        let channel = RemoteChannel::new(0);
        registry.expose(&channel, 1, recording_writer(1, &sent));
        registry.expose(&channel, 2, recording_writer(2, &sent));
        assert_eq!(registry.len(), 1);

        channel.close(None);
        channel.close(None);

        let closes = sent.lock().unwrap().clone();
        assert_eq!(closes.len(), 2);
        assert!(closes.iter().all(|(_, _, op)| *op == ChannelOp::Close(Value::Null)));
        assert!(registry.is_empty());
        assert_eq!(channel.peer_count(), 0);
        assert!(matches!(channel.send(json!(0)).await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_adopt_reuses_known_id() {
        let registry = registry();
        let sent: Sent = Arc::default();
        let descriptor = ChannelDescriptor::new(9_000_001, 2);

        let first = registry.adopt(&descriptor, PARENT_PEER, recording_writer(PARENT_PEER, &sent));
        let second = registry.adopt(&descriptor, PARENT_PEER, recording_writer(PARENT_PEER, &sent));
        assert_eq!(first.id(), 9_000_001);
        assert_eq!(second.capacity(), 2);
        assert_eq!(second.peer_count(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_send_lands_in_local_channel() {
        let registry = registry();
        let sent: Sent = Arc::default();
        let channel = RemoteChannel::new(0);
        registry.expose(&channel, 3, recording_writer(3, &sent));

        registry.deliver(3, channel.id(), ChannelOp::Send(json!("from peer")));
        assert_eq!(channel.recv().await.unwrap(), Some(json!("from peer")));
    }

    #[tokio::test]
    async fn test_incoming_close_rebroadcasts_to_other_peers() {
        let registry = registry();
        let sent: Sent = Arc::default();
        let channel = RemoteChannel::new(0);
        registry.expose(&channel, 1, recording_writer(1, &sent));
        registry.expose(&channel, 2, recording_writer(2, &sent));

        let error = Exception::new("peer failed").to_object();
        registry.deliver(1, channel.id(), ChannelOp::Close(error));

        let forwarded = sent.lock().unwrap().clone();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, 2);
        assert_eq!(channel.recv().await.unwrap_err().message(), "peer failed");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_detach_drops_channels_without_peers() {
        let registry = ChannelRegistry::new(Arc::new(ErrorRegistry::with_builtins()));
        let sent: Sent = Arc::default();
        let shared = RemoteChannel::new(0);
        let solo = RemoteChannel::new(0);
        registry.expose(&shared, 1, recording_writer(1, &sent));
        registry.expose(&shared, 2, recording_writer(2, &sent));
        registry.expose(&solo, 1, recording_writer(1, &sent));
        assert_eq!(registry.len(), 2);

        registry.detach(1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(shared.id()).is_some());
        assert!(registry.get(solo.id()).is_none());

        // Sharing it again brings it back.
        registry.expose(&solo, 3, recording_writer(3, &sent));
        assert!(registry.get(solo.id()).is_some());
    }

    #[test]
    fn test_descriptor_rejects_negative_capacity() {
        let result = ChannelDescriptor::from_value(json!({"@@type": "Channel", "id": 1, "capacity": -1}));
        assert!(result.is_err());
    }

    #[test]
    fn test_descriptor_shape() {
        let value = ChannelDescriptor::new(4, 8).to_value();
        assert_eq!(value, json!({"@@type": "Channel", "id": 4, "capacity": 8}));
    }
}
