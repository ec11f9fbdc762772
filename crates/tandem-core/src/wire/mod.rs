//! Channel wire protocol and payload encoding.
//!
//! Channels handed across a worker boundary travel as descriptors and are
//! operated on through [`RemoteChannel`] proxies; see [`ChannelRegistry`].

mod payload;
mod remote;

pub use payload::{BUFFER_TAG, Payload, PayloadCodec};
pub use remote::{
    CHANNEL_TAG, ChannelDescriptor, ChannelOp, ChannelRegistry, PARENT_PEER, PeerId,
    RemoteChannel, Writer,
};
