//! Message channel between the orchestrator and a kernel.
//!
//! Provides the `MessageChannel` trait, the callback bundle replies are
//! delivered through, and length-prefixed JSON framing functions.
//! `PipeChannel` talks to a kernel process over its stdin/stdout.

pub mod pipe;
pub mod protocol;

pub use pipe::PipeChannel;
pub use protocol::{
    CompletionReply, CompletionStatus, ExecuteOptions, InputRequest, KernelFrame, KernelRequest,
    Reply, ReplyKind,
};

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

pub type CompletionFn = Arc<dyn Fn(CompletionReply) + Send + Sync>;
pub type OutputFn = Arc<dyn Fn(Reply) + Send + Sync>;
pub type InputFn = Arc<dyn Fn(InputRequest) + Send + Sync>;

/// Callbacks a channel invokes as replies for one submission arrive.
///
/// Invoked synchronously from the channel's delivery task, in arrival order.
#[derive(Clone)]
pub struct ReplyCallbacks {
    pub on_completion: CompletionFn,
    pub on_output: OutputFn,
    pub on_input_request: Option<InputFn>,
}

impl fmt::Debug for ReplyCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyCallbacks")
            .field("on_input_request", &self.on_input_request.is_some())
            .finish_non_exhaustive()
    }
}

/// Opaque handle returned by a submit. Only used for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestHandle(String);

impl RequestHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstraction over the asynchronous execution substrate.
///
/// A submit returns as soon as the request is handed off; replies arrive
/// later through the callbacks, terminated by exactly one completion.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Hand `code` to the kernel. Replies are delivered to `callbacks`.
    async fn submit(
        &self,
        code: &str,
        callbacks: ReplyCallbacks,
        options: ExecuteOptions,
    ) -> Result<RequestHandle>;

    /// Gracefully shut down the channel and the kernel behind it.
    async fn shutdown(&self) -> Result<()>;

    /// Check whether the kernel is still reachable.
    fn is_alive(&self) -> bool;
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::protocol::Disposition;
    use super::*;

    #[tokio::test]
    async fn framing_preserves_payload() {
        let payload = br#"{"type":"ready"}"#;
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"junk");

        let mut cursor = std::io::Cursor::new(buf);
        let err = recv_message(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("exceeds max size"));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");

        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_message(&mut cursor).await.is_err());
    }

    #[test]
    fn protocol_serialize_execute_request() {
        let req = KernelRequest::Execute {
            msg_id: "req-1".to_string(),
            code: "1+1".to_string(),
            silent: false,
            store_history: true,
            stop_on_error: true,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"execute\""));
        assert!(json.contains("\"msg_id\":\"req-1\""));
    }

    #[test]
    fn protocol_deserialize_frames() {
        let ready: KernelFrame = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(ready, KernelFrame::Ready));
        let pong: KernelFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(pong, KernelFrame::Pong));
        assert_eq!(
            serde_json::to_string(&KernelRequest::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );

        let json = r#"{"type":"iopub","parent_id":"req-1",
                       "reply":{"msg_type":"stream","name":"stdout","text":"2\n"}}"#;
        let frame: KernelFrame = serde_json::from_str(json).unwrap();
        match frame {
            KernelFrame::Iopub { parent_id, reply } => {
                assert_eq!(parent_id, "req-1");
                assert_eq!(reply.payload(), Some("2\n"));
                assert_eq!(reply.kind(), ReplyKind::TextStream);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let json = r#"{"type":"execute_reply","parent_id":"req-1","reply":{"status":"error","ename":"NameError","evalue":"x"}}"#;
        let frame: KernelFrame = serde_json::from_str(json).unwrap();
        match frame {
            KernelFrame::ExecuteReply { reply, .. } => {
                assert_eq!(reply.status, CompletionStatus::Error);
                assert!(!reply.is_ok());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn aborted_completion_is_not_ok() {
        let reply = CompletionReply::aborted("kernel output closed");
        assert_eq!(reply.status, CompletionStatus::Aborted);
        assert!(!reply.is_ok());
        assert_eq!(reply.evalue.as_deref(), Some("kernel output closed"));
    }

    #[test]
    fn result_payload_is_text_plain() {
        let json = r#"{"msg_type":"execute_result","execution_count":3,
                       "data":{"text/plain":"[{'a': 1}]","text/html":"<b>x</b>"}}"#;
        let reply: Reply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.kind(), ReplyKind::FinalResult);
        assert_eq!(reply.payload(), Some("[{'a': 1}]"));
    }

    #[test]
    fn reply_kind_dispositions() {
        assert_eq!(ReplyKind::TextStream.disposition(), Disposition::Accept);
        assert_eq!(ReplyKind::FinalResult.disposition(), Disposition::Accept);
        assert_eq!(ReplyKind::RawDisplayData.disposition(), Disposition::Ignore);
        assert_eq!(ReplyKind::DisplayDataUpdate.disposition(), Disposition::Ignore);
        assert_eq!(ReplyKind::EchoedInput.disposition(), Disposition::Ignore);
        assert_eq!(ReplyKind::Failure.disposition(), Disposition::Abort);
    }

    #[test]
    fn execute_options_defaults() {
        let options: ExecuteOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ExecuteOptions::default());
        assert!(!options.silent);
        assert!(options.store_history);
        assert!(options.stop_on_error);
    }
}
