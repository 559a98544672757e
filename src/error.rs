//! Error taxonomy for orchestrated executions.
//!
//! Every variant raised on behalf of a submission keeps the submitted code,
//! so a failure deep in a chain can be traced back to the step that caused it.

use std::time::Duration;

use thiserror::Error;

use crate::parser::ParseError;
use crate::slot::Rejection;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The kernel reported a failure or a non-ok completion status.
    #[error("kernel rejected `{code}`: {reply}")]
    ChannelRejection { code: String, reply: Rejection },

    /// The retry budget ran out. Only local waiting stopped; the kernel may
    /// still be executing the code.
    #[error("no reply for `{code}` after {ticks} polls ({waited:?})")]
    Timeout {
        code: String,
        ticks: u32,
        waited: Duration,
    },

    /// The output reply could not be decoded.
    #[error("failed to decode output of `{code}`: {source}")]
    Parse {
        code: String,
        #[source]
        source: ParseError,
    },

    /// The channel refused the submission itself.
    #[error("channel error while submitting `{code}`: {source:#}")]
    Channel {
        code: String,
        #[source]
        source: anyhow::Error,
    },

    /// The API was used in a way that can never succeed.
    #[error("{0}")]
    CallerMisuse(String),

    /// Chains joined in drained mode did not all finish in time.
    #[error("{pending} chain(s) still running after {waited:?}")]
    DrainTimeout { pending: usize, waited: Duration },

    /// A chain task panicked or was cancelled before finishing.
    #[error("chain task did not finish: {0}")]
    Aborted(String),
}

impl ExecError {
    /// The submitted code this error belongs to, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ChannelRejection { code, .. }
            | Self::Timeout { code, .. }
            | Self::Parse { code, .. }
            | Self::Channel { code, .. } => Some(code),
            Self::CallerMisuse(_) | Self::DrainTimeout { .. } | Self::Aborted(_) => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DrainTimeout { .. })
    }
}
