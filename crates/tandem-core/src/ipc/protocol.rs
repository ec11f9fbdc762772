//! IPC protocol messages for tandem workers.
//!
//! Messages are JSON objects discriminated by `type`. Between processes they
//! travel as length-prefixed frames over stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::wire::ChannelOp;

/// Frames above this size are rejected (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Message sent from the caller to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Invoke an exported function.
    Call {
        module: String,
        #[serde(rename = "fn")]
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        /// Set when the caller wants to drive a generator result itself.
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<u64>,
    },

    /// Resume a registered generator.
    Next {
        #[serde(rename = "taskId")]
        task_id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Finish a registered generator early with a value.
    Return {
        #[serde(rename = "taskId")]
        task_id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Raise an error inside a registered generator.
    Throw {
        #[serde(rename = "taskId")]
        task_id: u64,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Value sent on a shared channel.
    Send {
        #[serde(rename = "channelId")]
        channel_id: u64,
        #[serde(default)]
        value: Value,
    },

    /// Shared channel closed, with an optional serialized error.
    Close {
        #[serde(rename = "channelId")]
        channel_id: u64,
        #[serde(default)]
        value: Value,
    },
}

/// Message sent from a worker to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Worker is up and accepting requests. Always the first message.
    Ready,

    /// Single result of a call.
    Return {
        #[serde(default)]
        value: Value,
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<u64>,
    },

    /// One step of a generator; `done` marks the final return value.
    Yield {
        #[serde(default)]
        value: Value,
        done: bool,
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<u64>,
    },

    /// A generator was registered under `task_id`.
    Gen {
        #[serde(rename = "taskId")]
        task_id: u64,
    },

    /// The call or generator step failed.
    Error {
        error: Value,
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<u64>,
    },

    Send {
        #[serde(rename = "channelId")]
        channel_id: u64,
        #[serde(default)]
        value: Value,
    },

    Close {
        #[serde(rename = "channelId")]
        channel_id: u64,
        #[serde(default)]
        value: Value,
    },
}

impl Request {
    /// Wrap a channel operation.
    pub fn channel(channel_id: u64, op: ChannelOp) -> Self {
        match op {
            ChannelOp::Send(value) => Self::Send { channel_id, value },
            ChannelOp::Close(value) => Self::Close { channel_id, value },
        }
    }

    /// Split off channel operations, handing other requests back.
    pub fn into_channel_op(self) -> std::result::Result<(u64, ChannelOp), Self> {
        match self {
            Self::Send { channel_id, value } => Ok((channel_id, ChannelOp::Send(value))),
            Self::Close { channel_id, value } => Ok((channel_id, ChannelOp::Close(value))),
            other => Err(other),
        }
    }
}

impl Response {
    /// Wrap a channel operation.
    pub fn channel(channel_id: u64, op: ChannelOp) -> Self {
        match op {
            ChannelOp::Send(value) => Self::Send { channel_id, value },
            ChannelOp::Close(value) => Self::Close { channel_id, value },
        }
    }

    /// Split off channel operations, handing other responses back.
    pub fn into_channel_op(self) -> std::result::Result<(u64, ChannelOp), Self> {
        match self {
            Self::Send { channel_id, value } => Ok((channel_id, ChannelOp::Send(value))),
            Self::Close { channel_id, value } => Ok((channel_id, ChannelOp::Close(value))),
            other => Err(other),
        }
    }

    /// Task id the response belongs to, if any.
    pub fn task_id(&self) -> Option<u64> {
        match self {
            Self::Return { task_id, .. } | Self::Yield { task_id, .. } | Self::Error { task_id, .. } => {
                *task_id
            }
            Self::Gen { task_id } => Some(*task_id),
            _ => None,
        }
    }
}

/// Write a message to a writer using length-prefixed JSON encoding.
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame.
pub async fn read_frame<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    // Sanity check: reject absurdly large messages
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    let message = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let request = Request::Call {
            module: "math".to_string(),
            function: "add".to_string(),
            args: vec![json!(1), json!(2)],
            task_id: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "call", "module": "math", "fn": "add", "args": [1, 2]})
        );

        let with_task: Request = serde_json::from_value(
            json!({"type": "call", "module": "m", "fn": "f", "args": [], "taskId": 3}),
        )
        .unwrap();
        assert!(matches!(with_task, Request::Call { task_id: Some(3), .. }));
    }

    #[test]
    fn test_response_wire_shapes() {
        let yielded = Response::Yield {
            value: json!(1),
            done: false,
            task_id: Some(5),
        };
        assert_eq!(
            serde_json::to_value(&yielded).unwrap(),
            json!({"type": "yield", "value": 1, "done": false, "taskId": 5})
        );
        assert_eq!(
            serde_json::to_value(Response::Ready).unwrap(),
            json!({"type": "ready"})
        );
        assert_eq!(
            serde_json::to_value(Response::channel(9, ChannelOp::Close(Value::Null))).unwrap(),
            json!({"type": "close", "channelId": 9, "value": null})
        );
    }

    #[test]
    fn test_drive_requests_parse() {
        let request: Request =
            serde_json::from_value(json!({"type": "throw", "taskId": 2, "args": ["boom"]})).unwrap();
        assert_eq!(
            request,
            Request::Throw {
                task_id: 2,
                args: vec![json!("boom")]
            }
        );
    }

    #[test]
    fn test_channel_ops_split_off() {
        let request = Request::channel(4, ChannelOp::Send(json!("v")));
        assert_eq!(
            request.into_channel_op(),
            Ok((4, ChannelOp::Send(json!("v"))))
        );
        let call = Request::Next {
            task_id: 1,
            args: vec![],
        };
        assert!(call.into_channel_op().is_err());
    }

    #[tokio::test]
    async fn test_frames_roundtrip_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Ready).await.unwrap();
        write_frame(&mut buf, &Response::Gen { task_id: 11 }).await.unwrap();
        assert_eq!(&buf[..4], &(br#"{"type":"ready"}"#.len() as u32).to_le_bytes());

        let mut reader = buf.as_slice();
        let first: Option<Response> = read_frame(&mut reader).await.unwrap();
        let second: Option<Response> = read_frame(&mut reader).await.unwrap();
        let end: Option<Response> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(Response::Ready));
        assert_eq!(second, Some(Response::Gen { task_id: 11 }));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let mut reader = buf.as_slice();
        let result: Result<Option<Response>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{\"ty");
        let mut reader = buf.as_slice();
        let result: Result<Option<Response>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
