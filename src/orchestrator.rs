//! Submission surface of the orchestrator.
//!
//! An `Orchestrator` owns one active correlation id and one reply slot.
//! Each `run` stamps a fresh id, hands the code to the channel, waits for
//! the slot to fill and decodes the output.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, instrument, trace, warn};

use crate::channel::{
    CompletionFn, CompletionReply, ExecuteOptions, InputFn, InputRequest, MessageChannel, OutputFn,
    Reply, ReplyCallbacks,
};
use crate::correlation::{CorrelationId, CorrelationRegistry};
use crate::error::ExecError;
use crate::parser::{self, ParsedResult};
use crate::poller::{self, PollConfig};
use crate::sequence::Chain;
use crate::slot::{Recorded, Requirement, SharedSlot};

/// Caller hook observing raw output replies.
pub type OutputHook = Arc<dyn Fn(&Reply) + Send + Sync>;
/// Caller hook observing the raw completion reply.
pub type CompletionHook = Arc<dyn Fn(&CompletionReply) + Send + Sync>;

/// One unit of work: code plus how its replies should be waited for and decoded.
#[derive(Clone)]
pub struct Submission {
    code: String,
    requirement: Requirement,
    expect_json: bool,
    options: ExecuteOptions,
    on_output: Option<OutputHook>,
    on_completion: Option<CompletionHook>,
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("code", &self.code)
            .field("requirement", &self.requirement)
            .field("expect_json", &self.expect_json)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Submission {
    /// Expects one output reply, decoded as JSON.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            requirement: Requirement::default(),
            expect_json: true,
            options: ExecuteOptions::default(),
            on_output: None,
            on_completion: None,
        }
    }

    /// Wait for the completion status only; output is not expected.
    #[must_use]
    pub fn shell(mut self) -> Self {
        self.requirement.output = false;
        self
    }

    /// Take the `index`-th (0-based) accepted output reply instead of the first.
    #[must_use]
    pub fn stream(mut self, index: usize) -> Self {
        self.requirement.output = true;
        self.requirement.stream_index = index;
        self
    }

    /// Return the output as trimmed text instead of decoding JSON.
    #[must_use]
    pub fn expect_plain_text(mut self) -> Self {
        self.expect_json = false;
        self
    }

    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe every output reply for this submission, ignored kinds included.
    #[must_use]
    pub fn on_output(mut self, hook: impl Fn(&Reply) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_completion(mut self, hook: impl Fn(&CompletionReply) + Send + Sync + 'static) -> Self {
        self.on_completion = Some(Arc::new(hook));
        self
    }
}

/// A settled submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub correlation_id: CorrelationId,
    pub code: String,
    pub completion: CompletionReply,
    pub result: ParsedResult,
}

/// Latest settlement made through the handles sharing this record.
#[derive(Debug, Clone, Default)]
pub(crate) struct SettledRecord(Arc<Mutex<Option<Settled>>>);

impl SettledRecord {
    fn store(&self, settled: &Settled) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(settled.clone());
    }

    pub(crate) fn latest(&self) -> Option<Settled> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Inner {
    slot: SharedSlot,
    /// Serializes submissions on this instance: one active id at a time.
    submit_lock: tokio::sync::Mutex<()>,
    last: SettledRecord,
}

/// Submits code to a kernel and correlates the replies.
///
/// Clones share the same active id and slot; use [`Orchestrator::fork`] for
/// an independent instance on the same channel.
#[derive(Clone)]
pub struct Orchestrator {
    channel: Arc<dyn MessageChannel>,
    registry: Arc<CorrelationRegistry>,
    config: PollConfig,
    inner: Arc<Inner>,
    /// Extra record owned by the chain this handle runs in, if any.
    scope: Option<SettledRecord>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("current_id", &self.current_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        registry: Arc<CorrelationRegistry>,
        config: PollConfig,
    ) -> Self {
        Self {
            channel,
            registry,
            config,
            inner: Arc::new(Inner {
                slot: SharedSlot::default(),
                submit_lock: tokio::sync::Mutex::new(()),
                last: SettledRecord::default(),
            }),
            scope: None,
        }
    }

    /// A new instance with its own slot, sharing channel, registry and config.
    pub fn fork(&self) -> Self {
        Self::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.registry),
            self.config.clone(),
        )
    }

    /// Start building a sequenced chain on this instance.
    pub fn chain(&self) -> Chain {
        Chain::new(self.clone())
    }

    pub const fn config(&self) -> &PollConfig {
        &self.config
    }

    /// A handle on this instance whose settlements are also stored in `record`.
    pub(crate) fn scoped(&self, record: SettledRecord) -> Self {
        Self {
            scope: Some(record),
            ..self.clone()
        }
    }

    /// The id replies must carry to be accepted right now.
    pub fn current_id(&self) -> CorrelationId {
        self.inner.slot.current_id()
    }

    /// Most recent settlement on this instance.
    pub fn last_settled(&self) -> Option<Settled> {
        self.inner.last.latest()
    }

    /// Decoded result of the most recent settlement.
    pub fn last_result(&self) -> Result<ParsedResult, ExecError> {
        self.last_settled().map(|s| s.result).ok_or_else(|| {
            ExecError::CallerMisuse("result requested before any submission settled".into())
        })
    }

    /// Submit and wait for settlement.
    ///
    /// A timeout only stops local waiting; the kernel is not told to stop.
    #[instrument(skip_all, fields(code_len = submission.code.len()))]
    pub async fn run(&self, submission: Submission) -> Result<Settled, ExecError> {
        let _guard = self.inner.submit_lock.lock().await;

        let id = self.registry.next_id();
        self.inner.slot.reset(id, submission.requirement);
        let callbacks = self.callbacks(id, &submission);

        let Submission {
            code,
            expect_json,
            options,
            ..
        } = submission;

        let handle = self
            .channel
            .submit(&code, callbacks, options)
            .await
            .map_err(|source| ExecError::Channel {
                code: code.clone(),
                source,
            })?;
        debug!(correlation_id = %id, request = %handle, "Dispatched submission");

        let contents = poller::await_settlement(&self.inner.slot, &self.config, &code).await?;

        let result = match &contents.output {
            Some(reply) => parser::parse(reply.payload().unwrap_or_default(), expect_json)
                .map_err(|source| ExecError::Parse {
                    code: code.clone(),
                    source,
                })?,
            None => ParsedResult::Empty,
        };

        let settled = Settled {
            correlation_id: id,
            code,
            completion: contents.completion,
            result,
        };
        self.inner.last.store(&settled);
        if let Some(scope) = &self.scope {
            scope.store(&settled);
        }
        Ok(settled)
    }

    /// Callbacks stamped with `id`; replies for any other id are dropped.
    fn callbacks(&self, id: CorrelationId, submission: &Submission) -> ReplyCallbacks {
        let inner = Arc::clone(&self.inner);
        let hook = submission.on_output.clone();
        let on_output: OutputFn = Arc::new(move |reply: Reply| {
            if let Some(hook) = &hook {
                if inner.slot.current_id() == id {
                    hook(&reply);
                }
            }
            let kind = reply.kind();
            match inner.slot.record_output(id, reply) {
                Recorded::Stale => debug!(correlation_id = %id, ?kind, "Dropping stale output reply"),
                recorded => trace!(correlation_id = %id, ?kind, ?recorded, "Output reply"),
            }
        });

        let inner = Arc::clone(&self.inner);
        let hook = submission.on_completion.clone();
        let on_completion: CompletionFn = Arc::new(move |reply: CompletionReply| {
            if let Some(hook) = &hook {
                if inner.slot.current_id() == id {
                    hook(&reply);
                }
            }
            let status = reply.status;
            match inner.slot.record_completion(id, reply) {
                Recorded::Stale => debug!(correlation_id = %id, %status, "Dropping stale completion"),
                recorded => trace!(correlation_id = %id, %status, ?recorded, "Completion reply"),
            }
        });

        let on_input_request: InputFn = Arc::new(move |request: InputRequest| {
            warn!(
                correlation_id = %id,
                prompt = %request.prompt,
                "Kernel requested input; orchestrated executions cannot answer it"
            );
        });

        ReplyCallbacks {
            on_completion,
            on_output,
            on_input_request: Some(on_input_request),
        }
    }
}
