//! Kernel message types.
//!
//! Length-prefixed JSON protocol for orchestrator ↔ kernel communication.
//! Messages are framed as: [4-byte BE length][JSON payload]

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// MIME type → rendered value, as carried by result and display messages.
pub type MimeBundle = HashMap<String, serde_json::Value>;

/// Request sent from orchestrator to kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Execute code in the kernel's interpreter.
    Execute {
        msg_id: String,
        code: String,
        silent: bool,
        store_history: bool,
        stop_on_error: bool,
    },
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
}

/// Frame sent from kernel to orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelFrame {
    /// Kernel is ready to accept requests (sent on startup).
    Ready,
    /// Pong response to health check.
    Pong,
    /// Output-side message produced while executing `parent_id`.
    Iopub { parent_id: String, reply: Reply },
    /// The kernel wants a line of input for `parent_id`.
    InputRequest {
        parent_id: String,
        request: InputRequest,
    },
    /// Execution of `parent_id` finished. Always the last frame for a request.
    ExecuteReply {
        parent_id: String,
        reply: CompletionReply,
    },
}

/// Options forwarded with every execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Suppress output-side messages entirely.
    pub silent: bool,
    /// Record the code in the kernel's input history.
    pub store_history: bool,
    /// Abort queued executions after the first error.
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            stop_on_error: true,
        }
    }
}

/// Output-side reply message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Reply {
    /// Text written to stdout/stderr.
    Stream { name: String, text: String },
    /// Value of the last expression.
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        execution_count: Option<u64>,
    },
    DisplayData { data: MimeBundle },
    UpdateDisplayData { data: MimeBundle },
    /// Echo of the code being executed.
    ExecuteInput { code: String },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

/// Closed set of reply kinds, independent of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    TextStream,
    FinalResult,
    RawDisplayData,
    DisplayDataUpdate,
    EchoedInput,
    Failure,
}

/// What a reply kind means for the submission waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Counts as successful output.
    Accept,
    /// Not interesting to the orchestrator.
    Ignore,
    /// Fails the submission.
    Abort,
}

impl ReplyKind {
    pub const fn disposition(self) -> Disposition {
        match self {
            Self::TextStream | Self::FinalResult => Disposition::Accept,
            Self::RawDisplayData | Self::DisplayDataUpdate | Self::EchoedInput => {
                Disposition::Ignore
            }
            Self::Failure => Disposition::Abort,
        }
    }
}

impl Reply {
    pub const fn kind(&self) -> ReplyKind {
        match self {
            Self::Stream { .. } => ReplyKind::TextStream,
            Self::ExecuteResult { .. } => ReplyKind::FinalResult,
            Self::DisplayData { .. } => ReplyKind::RawDisplayData,
            Self::UpdateDisplayData { .. } => ReplyKind::DisplayDataUpdate,
            Self::ExecuteInput { .. } => ReplyKind::EchoedInput,
            Self::Error { .. } => ReplyKind::Failure,
        }
    }

    /// Raw textual payload: stream text, or the `text/plain` rendering.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Stream { text, .. } => Some(text),
            Self::ExecuteResult { data, .. }
            | Self::DisplayData { data }
            | Self::UpdateDisplayData { data } => {
                data.get("text/plain").and_then(serde_json::Value::as_str)
            }
            Self::ExecuteInput { code } => Some(code),
            Self::Error { evalue, .. } => Some(evalue),
        }
    }

    /// Convenience constructor for a stdout stream message.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: "stdout".into(),
            text: text.into(),
        }
    }

    /// Convenience constructor for a result carrying only `text/plain`.
    pub fn result(text: impl Into<String>) -> Self {
        Self::ExecuteResult {
            data: HashMap::from([(
                "text/plain".to_string(),
                serde_json::Value::String(text.into()),
            )]),
            execution_count: None,
        }
    }
}

/// Final status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Ok,
    Error,
    Aborted,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
        })
    }
}

/// Completion message that terminates every execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReply {
    pub status: CompletionStatus,
    #[serde(default)]
    pub execution_count: Option<u64>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl CompletionReply {
    pub const fn ok() -> Self {
        Self {
            status: CompletionStatus::Ok,
            execution_count: None,
            ename: None,
            evalue: None,
        }
    }

    pub fn error(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Error,
            execution_count: None,
            ename: Some(ename.into()),
            evalue: Some(evalue.into()),
        }
    }

    /// Completion synthesized locally when the kernel can no longer answer.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Aborted,
            execution_count: None,
            ename: Some("ChannelClosed".into()),
            evalue: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CompletionStatus::Ok
    }
}

/// Kernel prompt for stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}
