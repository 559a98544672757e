#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kernel_orchestrator::channel::{
    CompletionReply, ExecuteOptions, MessageChannel, Reply, ReplyCallbacks, RequestHandle,
};
use kernel_orchestrator::{CorrelationRegistry, Orchestrator, PollConfig};

/// One scripted reply delivery.
#[derive(Debug, Clone)]
pub enum Step {
    Output(Reply),
    Completion(CompletionReply),
    Delay(Duration),
}

/// In-memory channel that replays a per-code script of replies.
///
/// Codes without a script get no replies at all; their callbacks stay
/// available through [`ScriptedChannel::callbacks`] for manual delivery.
#[derive(Default)]
pub struct ScriptedChannel {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    submitted: Mutex<Vec<(String, ReplyCallbacks, ExecuteOptions)>>,
    events: Arc<Mutex<Vec<String>>>,
    refuse: Mutex<bool>,
}

impl ScriptedChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, code: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(code.to_string(), steps);
    }

    /// Reply to `code` with one output followed by an ok completion.
    pub fn answer(&self, code: &str, reply: Reply) {
        self.script(
            code,
            vec![Step::Output(reply), Step::Completion(CompletionReply::ok())],
        );
    }

    /// Make every following submit fail at the channel level.
    pub fn refuse_submits(&self) {
        *self.refuse.lock().unwrap() = true;
    }

    pub fn submitted_codes(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(code, _, _)| code.clone())
            .collect()
    }

    pub fn submitted_options(&self, index: usize) -> ExecuteOptions {
        self.submitted.lock().unwrap()[index].2
    }

    pub fn callbacks(&self, index: usize) -> ReplyCallbacks {
        self.submitted.lock().unwrap()[index].1.clone()
    }

    /// Shared event log; the channel appends `submit:<code>` and `replied:<code>`.
    pub fn events(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.events)
    }

    pub fn event_list(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until `count` submissions have been made.
    pub async fn wait_for_submissions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.submitted.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("submissions did not arrive");
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn submit(
        &self,
        code: &str,
        callbacks: ReplyCallbacks,
        options: ExecuteOptions,
    ) -> anyhow::Result<RequestHandle> {
        if *self.refuse.lock().unwrap() {
            anyhow::bail!("kernel is gone");
        }

        let index = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push((code.to_string(), callbacks.clone(), options));
            submitted.len()
        };
        self.events.lock().unwrap().push(format!("submit:{code}"));

        let script = self.scripts.lock().unwrap().get(code).cloned();
        if let Some(steps) = script {
            let events = Arc::clone(&self.events);
            let code = code.to_string();
            tokio::spawn(async move {
                for step in steps {
                    match step {
                        Step::Output(reply) => (callbacks.on_output)(reply),
                        Step::Completion(reply) => (callbacks.on_completion)(reply),
                        Step::Delay(delay) => tokio::time::sleep(delay).await,
                    }
                }
                events.lock().unwrap().push(format!("replied:{code}"));
            });
        }

        Ok(RequestHandle::new(format!("scripted-{index}")))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !*self.refuse.lock().unwrap()
    }
}

/// Polling tuned for tests: 5ms ticks, 200ms budget.
pub fn fast_config() -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(5),
        retry_budget: 40,
        drain_timeout: Duration::from_secs(2),
    }
}

pub fn orchestrator(channel: &Arc<ScriptedChannel>) -> Orchestrator {
    orchestrator_with(channel, fast_config())
}

pub fn orchestrator_with(channel: &Arc<ScriptedChannel>, config: PollConfig) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(channel) as Arc<dyn MessageChannel>,
        Arc::new(CorrelationRegistry::new()),
        config,
    )
}
