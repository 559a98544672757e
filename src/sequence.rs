//! Sequencing of dependent submissions.
//!
//! A `Chain` is an ordered list of steps run on one orchestrator: plain
//! submissions and continuations. Each step starts only after the previous
//! one has fully finished, including every submission a continuation made.
//! The spawned chain's task finishing *is* the drain signal, so there is no
//! separate "done" flag to forget.

use std::future::Future;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::ExecError;
use crate::orchestrator::{Orchestrator, Settled, SettledRecord, Submission};
use crate::parser::ParsedResult;

type Continuation =
    Box<dyn FnOnce(Orchestrator, Option<Settled>) -> BoxFuture<'static, Result<(), ExecError>> + Send>;

enum Step {
    Submit(Submission),
    Then(Continuation),
}

/// Builder for a sequenced pipeline on one orchestrator.
pub struct Chain {
    orchestrator: Orchestrator,
    steps: Vec<Step>,
}

/// What a finished chain observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    /// Most recent settlement made by this chain, continuations included.
    pub last: Option<Settled>,
    /// Number of steps that ran.
    pub steps: usize,
}

impl Chain {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            steps: Vec::new(),
        }
    }

    /// Append a submission.
    #[must_use]
    pub fn submit(mut self, submission: Submission) -> Self {
        self.steps.push(Step::Submit(submission));
        self
    }

    /// Append a continuation.
    ///
    /// It receives the orchestrator (to submit further work) and the most
    /// recent settlement made by this chain, `None` before its first one.
    /// It runs only after every earlier step finished.
    #[must_use]
    pub fn then<F, Fut>(mut self, continuation: F) -> Self
    where
        F: FnOnce(Orchestrator, Option<Settled>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ExecError>> + Send + 'static,
    {
        self.steps.push(Step::Then(Box::new(
            move |orchestrator: Orchestrator, settled: Option<Settled>| {
                continuation(orchestrator, settled).boxed()
            },
        )));
        self
    }

    /// Append one continuation per element, run strictly in iteration order.
    ///
    /// Element `n + 1` starts only after the work for element `n` settled;
    /// the kernel executes one thing at a time and shares state between them.
    #[must_use]
    pub fn for_each<I, T, F, Fut>(mut self, items: I, per_element: F) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        F: Fn(T, Orchestrator) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecError>> + Send + 'static,
    {
        let per_element = std::sync::Arc::new(per_element);
        for item in items {
            let per_element = std::sync::Arc::clone(&per_element);
            self = self.then(move |orchestrator, _| per_element(item, orchestrator));
        }
        self
    }

    /// Spawn the chain. The first failing step stops it and is handed to `on_error`.
    ///
    /// Must be called within a tokio runtime.
    pub fn execute<H>(self, on_error: H) -> ChainHandle
    where
        H: FnOnce(&ExecError) + Send + 'static,
    {
        let (drained_tx, drained_rx) = watch::channel(false);
        let Self {
            orchestrator,
            steps,
        } = self;

        let record = SettledRecord::default();
        let orchestrator = orchestrator.scoped(record.clone());

        let task = tokio::spawn(async move {
            let outcome = run_steps(&orchestrator, &record, steps).await;
            if let Err(e) = &outcome {
                on_error(e);
            }
            drained_tx.send_replace(true);
            outcome
        });

        ChainHandle {
            task,
            drained: drained_rx,
        }
    }

    /// Spawn the chain with the default error handler.
    pub fn done(self) -> ChainHandle {
        self.execute(report_error)
    }
}

/// Runs `steps` on a handle scoped to `record`, so only this chain's
/// settlements are visible to its continuations.
async fn run_steps(
    orchestrator: &Orchestrator,
    record: &SettledRecord,
    steps: Vec<Step>,
) -> Result<ChainOutcome, ExecError> {
    let total = steps.len();
    for (index, step) in steps.into_iter().enumerate() {
        match step {
            Step::Submit(submission) => {
                orchestrator.run(submission).await?;
            }
            Step::Then(continuation) => {
                continuation(orchestrator.clone(), record.latest()).await?;
            }
        }
        trace!(step = index, total, "Chain step finished");
    }
    debug!(steps = total, "Chain drained");
    Ok(ChainOutcome {
        last: record.latest(),
        steps: total,
    })
}

/// Default error handler: report the failing code and the error, never panic.
pub fn report_error(err: &ExecError) {
    error!(code = err.code().unwrap_or("<none>"), error = %err, "Chain step failed");
}

/// Handle to a running chain.
pub struct ChainHandle {
    task: JoinHandle<Result<ChainOutcome, ExecError>>,
    drained: watch::Receiver<bool>,
}

impl ChainHandle {
    /// Whether every step, continuations included, has finished.
    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Wait for the drain signal without consuming the handle.
    ///
    /// Also returns if the chain task died without draining.
    pub async fn drained(&mut self) {
        let _ = self.drained.wait_for(|drained| *drained).await;
    }

    /// Wait for the chain and return what it observed.
    pub async fn wait(self) -> Result<ChainOutcome, ExecError> {
        self.task
            .await
            .map_err(|e| ExecError::Aborted(e.to_string()))?
    }

    /// Wait for the chain and return the last decoded result.
    pub async fn get_result(self) -> Result<ParsedResult, ExecError> {
        self.wait().await?.last.map(|s| s.result).ok_or_else(|| {
            ExecError::CallerMisuse("chain finished without settling any submission".into())
        })
    }

    /// Cancel the chain locally. In-flight kernel work is not interrupted.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// How [`await_all`] joins several chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Return the first failure at once and abort the remaining chains.
    FailFast,
    /// Let every chain drain (bounded by `timeout`), then report in input order.
    Drained { timeout: Duration },
}

/// Join independent chains.
///
/// Outcomes are returned in the order of `handles`.
pub async fn await_all(
    handles: Vec<ChainHandle>,
    mode: JoinMode,
) -> Result<Vec<ChainOutcome>, ExecError> {
    match mode {
        JoinMode::FailFast => {
            let aborts: Vec<_> = handles.iter().map(|h| h.task.abort_handle()).collect();
            let joined = future::try_join_all(handles.into_iter().map(ChainHandle::wait)).await;
            if joined.is_err() {
                for abort in aborts {
                    abort.abort();
                }
            }
            joined
        }
        JoinMode::Drained { timeout } => {
            let mut handles = handles;
            let all_drained = future::join_all(handles.iter_mut().map(ChainHandle::drained));
            if tokio::time::timeout(timeout, all_drained).await.is_err() {
                let pending = handles.iter().filter(|h| !h.is_drained()).count();
                return Err(ExecError::DrainTimeout {
                    pending,
                    waited: timeout,
                });
            }

            let mut outcomes = Vec::with_capacity(handles.len());
            for handle in handles {
                outcomes.push(handle.wait().await?);
            }
            Ok(outcomes)
        }
    }
}
