//! Per-submission reply accumulator.
//!
//! A `ReplySlot` only ever fills: the completion and output fields are set
//! at most once each, and replies stamped with any id other than the slot's
//! own are dropped before they touch it.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::channel::protocol::Disposition;
use crate::channel::{CompletionReply, Reply};
use crate::correlation::CorrelationId;

/// Which fields must be filled before a submission counts as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    /// Wait for an output reply as well as the completion.
    pub output: bool,
    /// Which accepted output reply (0-based) fills the output field.
    pub stream_index: usize,
}

impl Default for Requirement {
    fn default() -> Self {
        Self {
            output: true,
            stream_index: 0,
        }
    }
}

/// Effect of offering a reply to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Stamped with a superseded id; dropped.
    Stale,
    /// Kind not relevant for this submission.
    Ignored,
    /// A field of the slot was filled.
    Filled,
    /// Relevant but the target field was already filled or the index not reached.
    Unchanged,
}

/// Why a submission was rejected by the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// A failure reply arrived on the output side.
    Failure(Reply),
    /// The completion carried a non-ok status.
    Status(CompletionReply),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure(Reply::Error { ename, evalue, .. }) => write!(f, "{ename}: {evalue}"),
            Self::Failure(other) => write!(f, "failure reply {:?}", other.kind()),
            Self::Status(reply) => {
                write!(f, "kernel reported status {}", reply.status)?;
                if let (Some(ename), Some(evalue)) = (&reply.ename, &reply.evalue) {
                    write!(f, " ({ename}: {evalue})")?;
                }
                Ok(())
            }
        }
    }
}

/// Filled slot contents handed to the caller at settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotContents {
    pub completion: CompletionReply,
    pub output: Option<Reply>,
}

/// Result of inspecting a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Waiting,
    Complete(SlotContents),
    Rejected(Rejection),
}

#[derive(Debug, Default)]
pub struct ReplySlot {
    correlation_id: CorrelationId,
    requirement: Requirement,
    completion: Option<CompletionReply>,
    output: Option<Reply>,
    accepted_outputs: usize,
    failure: Option<Reply>,
}

impl ReplySlot {
    pub fn new(correlation_id: CorrelationId, requirement: Requirement) -> Self {
        Self {
            correlation_id,
            requirement,
            ..Self::default()
        }
    }

    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn record_output(&mut self, stamped: CorrelationId, reply: Reply) -> Recorded {
        if stamped != self.correlation_id {
            return Recorded::Stale;
        }

        match reply.kind().disposition() {
            Disposition::Ignore => Recorded::Ignored,
            Disposition::Abort => {
                if self.failure.is_some() {
                    return Recorded::Unchanged;
                }
                self.failure = Some(reply);
                Recorded::Filled
            }
            Disposition::Accept => {
                if !self.requirement.output {
                    return Recorded::Ignored;
                }
                let index = self.accepted_outputs;
                self.accepted_outputs += 1;
                if index == self.requirement.stream_index && self.output.is_none() {
                    self.output = Some(reply);
                    Recorded::Filled
                } else {
                    Recorded::Unchanged
                }
            }
        }
    }

    pub fn record_completion(&mut self, stamped: CorrelationId, reply: CompletionReply) -> Recorded {
        if stamped != self.correlation_id {
            return Recorded::Stale;
        }
        if self.completion.is_some() {
            return Recorded::Unchanged;
        }
        self.completion = Some(reply);
        Recorded::Filled
    }

    /// Failures win over completeness; a non-ok completion rejects at once.
    pub fn progress(&self) -> Progress {
        if let Some(failure) = &self.failure {
            return Progress::Rejected(Rejection::Failure(failure.clone()));
        }
        match &self.completion {
            Some(completion) if !completion.is_ok() => {
                Progress::Rejected(Rejection::Status(completion.clone()))
            }
            Some(completion) if !self.requirement.output || self.output.is_some() => {
                Progress::Complete(SlotContents {
                    completion: completion.clone(),
                    output: self.output.clone(),
                })
            }
            _ => Progress::Waiting,
        }
    }
}

/// A slot shared between channel callbacks and the waiting poller.
#[derive(Debug, Default)]
pub struct SharedSlot {
    slot: Mutex<ReplySlot>,
    changed: Notify,
}

impl SharedSlot {
    fn lock(&self) -> MutexGuard<'_, ReplySlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a fresh slot for a new submission, invalidating the old id.
    pub fn reset(&self, correlation_id: CorrelationId, requirement: Requirement) {
        *self.lock() = ReplySlot::new(correlation_id, requirement);
    }

    pub fn current_id(&self) -> CorrelationId {
        self.lock().correlation_id()
    }

    pub fn record_output(&self, stamped: CorrelationId, reply: Reply) -> Recorded {
        let recorded = self.lock().record_output(stamped, reply);
        if recorded == Recorded::Filled {
            self.changed.notify_one();
        }
        recorded
    }

    pub fn record_completion(&self, stamped: CorrelationId, reply: CompletionReply) -> Recorded {
        let recorded = self.lock().record_completion(stamped, reply);
        if recorded == Recorded::Filled {
            self.changed.notify_one();
        }
        recorded
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress()
    }

    /// Resolves after the next fill (or immediately if one happened unobserved).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
