//! Values that cross a worker boundary.
//!
//! Arguments and results are JSON on the wire. Live objects (channels, byte
//! buffers, errors) are replaced by objects tagged with `"@@type"` and
//! rehydrated on the other side.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::exception::{Exception, TYPE_TAG};

use super::remote::{CHANNEL_TAG, ChannelDescriptor, ChannelRegistry, PeerId, RemoteChannel, Writer};

/// `"@@type"` value of an encoded byte buffer.
pub const BUFFER_TAG: &str = "Buffer";

/// Anything an invoked function may receive or produce.
#[derive(Debug, Clone)]
pub enum Payload {
    Value(Value),
    /// Raw bytes, carried base64-encoded.
    Bytes(Vec<u8>),
    Channel(RemoteChannel),
    Error(Exception),
    List(Vec<Payload>),
    Map(Vec<(String, Payload)>),
}

impl Payload {
    pub fn null() -> Self {
        Self::Value(Value::Null)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&RemoteChannel> {
        match self {
            Self::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Exception> {
        match self {
            Self::Error(exception) => Some(exception),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Plain JSON view, used for display.
    ///
    /// Channels show as their descriptor without being exposed to anyone.
    pub fn into_json(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Bytes(bytes) => encode_bytes(&bytes),
            Self::Channel(channel) => {
                ChannelDescriptor::new(channel.id(), channel.capacity()).to_value()
            }
            Self::Error(exception) => exception.to_object(),
            Self::List(items) => Value::Array(items.into_iter().map(Self::into_json).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.into_json()))
                    .collect(),
            ),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Exception> for Payload {
    fn from(exception: Exception) -> Self {
        Self::Error(exception)
    }
}

impl From<RemoteChannel> for Payload {
    fn from(channel: RemoteChannel) -> Self {
        Self::Channel(channel)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Self::List(items)
    }
}

fn encode_bytes(bytes: &[u8]) -> Value {
    serde_json::json!({ TYPE_TAG: BUFFER_TAG, "data": STANDARD.encode(bytes) })
}

/// Encodes and decodes payloads for one peer.
#[derive(Clone)]
pub struct PayloadCodec {
    channels: ChannelRegistry,
    peer: PeerId,
    writer: Writer,
}

impl PayloadCodec {
    /// A codec wiring channels to `peer` through `writer`.
    pub fn new(channels: ChannelRegistry, peer: PeerId, writer: Writer) -> Self {
        Self {
            channels,
            peer,
            writer,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Turn a payload into its wire form, exposing any channels to the peer.
    pub fn encode(&self, payload: Payload) -> Value {
        match payload {
            Payload::Value(value) => value,
            Payload::Bytes(bytes) => encode_bytes(&bytes),
            Payload::Channel(channel) => {
                self.channels
                    .expose(&channel, self.peer, std::sync::Arc::clone(&self.writer))
            }
            Payload::Error(exception) => exception.to_object(),
            Payload::List(items) => {
                Value::Array(items.into_iter().map(|item| self.encode(item)).collect())
            }
            Payload::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, self.encode(value)))
                    .collect(),
            ),
        }
    }

    pub fn encode_all(&self, payloads: Vec<Payload>) -> Vec<Value> {
        payloads.into_iter().map(|p| self.encode(p)).collect()
    }

    /// Rehydrate a wire value.
    ///
    /// Subtrees without tagged objects stay a single [`Payload::Value`].
    pub fn decode(&self, value: Value) -> Result<Payload> {
        match value {
            Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<Vec<_>>>()?;
                if items.iter().all(|item| item.as_value().is_some()) {
                    Ok(Payload::Value(Value::Array(
                        items.into_iter().map(Payload::into_json).collect(),
                    )))
                } else {
                    Ok(Payload::List(items))
                }
            }
            Value::Object(object) => {
                if let Some(tag) = object.get(TYPE_TAG).and_then(Value::as_str) {
                    let tag = tag.to_string();
                    return self.decode_tagged(&tag, object);
                }
                let entries = object
                    .into_iter()
                    .map(|(key, value)| Ok((key, self.decode(value)?)))
                    .collect::<Result<Vec<_>>>()?;
                if entries.iter().all(|(_, value)| value.as_value().is_some()) {
                    Ok(Payload::Value(Value::Object(
                        entries
                            .into_iter()
                            .map(|(key, value)| (key, value.into_json()))
                            .collect(),
                    )))
                } else {
                    Ok(Payload::Map(entries))
                }
            }
            plain => Ok(Payload::Value(plain)),
        }
    }

    /// Adopt every channel descriptor inside `value` without decoding it.
    ///
    /// Lets channel traffic that follows a message find its channel before
    /// the message itself is decoded.
    pub fn adopt_channels(&self, value: &Value) {
        match value {
            Value::Array(items) => items.iter().for_each(|item| self.adopt_channels(item)),
            Value::Object(object) => {
                if object.get(TYPE_TAG).and_then(Value::as_str) == Some(CHANNEL_TAG) {
                    if let Ok(descriptor) = ChannelDescriptor::from_value(value.clone()) {
                        self.channels.adopt(
                            &descriptor,
                            self.peer,
                            std::sync::Arc::clone(&self.writer),
                        );
                    }
                    return;
                }
                object.values().for_each(|item| self.adopt_channels(item));
            }
            _ => {}
        }
    }

    pub fn decode_all(&self, values: Vec<Value>) -> Result<Vec<Payload>> {
        values.into_iter().map(|value| self.decode(value)).collect()
    }

    fn decode_tagged(&self, tag: &str, object: Map<String, Value>) -> Result<Payload> {
        match tag {
            CHANNEL_TAG => {
                let descriptor = ChannelDescriptor::from_value(Value::Object(object))?;
                let channel = self.channels.adopt(
                    &descriptor,
                    self.peer,
                    std::sync::Arc::clone(&self.writer),
                );
                Ok(Payload::Channel(channel))
            }
            BUFFER_TAG => {
                let data = object
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Serialization("buffer without data".to_string()))?;
                let bytes = STANDARD
                    .decode(data)
                    .map_err(|e| Error::Serialization(format!("invalid buffer data: {}", e)))?;
                Ok(Payload::Bytes(bytes))
            }
            _ => {
                let value = Value::Object(object);
                match self.channels.errors().from_object(&value) {
                    Some(exception) => Ok(Payload::Error(exception)),
                    // Tagged but not error-shaped: leave it alone.
                    None => Ok(Payload::Value(value)),
                }
            }
        }
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec").field("peer", &self.peer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::exception::ErrorRegistry;
    use crate::wire::ChannelOp;

    fn codec() -> (PayloadCodec, Arc<Mutex<Vec<(u64, ChannelOp)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let writer: Writer = {
            let sent = Arc::clone(&sent);
            Arc::new(move |id, op| {
                sent.lock().unwrap().push((id, op));
                Ok(())
            })
        };
        let registry = ChannelRegistry::new(Arc::new(ErrorRegistry::with_builtins()));
        (PayloadCodec::new(registry, 7, writer), sent)
    }

    #[test]
    fn test_plain_values_pass_through() {
        let (codec, _) = codec();
        let value = json!({"a": [1, 2, {"b": null}], "c": "text"});
        let decoded = codec.decode(value.clone()).unwrap();
        assert_eq!(decoded.as_value(), Some(&value));
    }

    #[test]
    fn test_bytes_use_base64() {
        let (codec, _) = codec();
        let encoded = codec.encode(Payload::Bytes(vec![0, 1, 2, 255]));
        assert_eq!(encoded, json!({"@@type": "Buffer", "data": "AAEC/w=="}));
        let decoded = codec.decode(encoded).unwrap();
        assert_eq!(decoded.as_bytes(), Some(&[0u8, 1, 2, 255][..]));
    }

    #[test]
    fn test_nested_errors_are_rehydrated() {
        let (codec, _) = codec();
        let payload = Payload::Map(vec![
            ("ok".to_string(), Payload::Value(json!(1))),
            (
                "failures".to_string(),
                Payload::List(vec![Exception::type_error("bad").into()]),
            ),
        ]);
        let wire = codec.encode(payload);
        assert_eq!(wire["failures"][0]["@@type"], json!("TypeError"));

        let Payload::Map(entries) = codec.decode(wire).unwrap() else {
            panic!("expected a map payload");
        };
        let failures = entries.iter().find(|(k, _)| k == "failures").map(|(_, v)| v);
        let Some(Payload::List(items)) = failures else {
            panic!("expected a list of failures");
        };
        assert_eq!(items[0].as_error().map(Exception::kind), Some("TypeError"));
    }

    #[tokio::test]
    async fn test_channel_is_exposed_and_adopted() {
        let (codec, sent) = codec();
        let channel = RemoteChannel::new(3);
        let wire = codec.encode(Payload::Channel(channel.clone()));
        assert_eq!(wire["@@type"], json!("Channel"));
        assert_eq!(channel.peer_count(), 1);

        let decoded = codec.decode(wire).unwrap();
        let adopted = decoded.as_channel().unwrap();
        assert_eq!(adopted.id(), channel.id());

        adopted.send(json!("x")).await.unwrap();
        assert_eq!(sent.lock().unwrap()[0], (channel.id(), ChannelOp::Send(json!("x"))));
    }

    #[test]
    fn test_adopt_channels_registers_nested_descriptors() {
        let (codec, _) = codec();
        let value = json!({"result": [{"@@type": "Channel", "id": 8_000_123, "capacity": 0}]});
        codec.adopt_channels(&value);
        assert!(codec.channels.get(8_000_123).is_some());
    }

    #[test]
    fn test_tagged_non_error_stays_value() {
        let (codec, _) = codec();
        let value = json!({"@@type": "Point", "x": 1});
        assert_eq!(codec.decode(value.clone()).unwrap().as_value(), Some(&value));
    }

    #[test]
    fn test_into_json_flattens() {
        let payload = Payload::List(vec![Payload::Value(json!(1)), Payload::Bytes(vec![1])]);
        assert_eq!(payload.into_json(), json!([1, {"@@type": "Buffer", "data": "AQ=="}]));
    }
}
