//! kernel-orchestrator library
//!
//! This crate provides the core functionality for driving a live compute kernel:
//! - Message channel trait and a framed pipe channel to a kernel process
//! - Correlation of asynchronous replies with the submission that caused them
//! - Completion polling, output decoding and sequenced execution chains

pub mod channel;
pub mod config;
pub mod correlation;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod poller;
pub mod sequence;
pub mod slot;

pub use channel::{MessageChannel, PipeChannel};
pub use correlation::{CorrelationId, CorrelationRegistry};
pub use error::ExecError;
pub use orchestrator::{Orchestrator, Settled, Submission};
pub use parser::ParsedResult;
pub use poller::PollConfig;
pub use sequence::{await_all, Chain, ChainHandle, ChainOutcome, JoinMode};
