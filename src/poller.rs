//! Waiting for a reply slot to fill.
//!
//! Completion and output arrive through independent callbacks in any order.
//! The poller re-checks the shared slot whenever a callback fills a field
//! and otherwise on a fixed cadence, giving up once the retry budget is spent.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::PollSection;
use crate::error::ExecError;
use crate::slot::{Progress, SharedSlot, SlotContents};

/// Parsed polling configuration with `Duration` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Cadence at which the slot is re-checked.
    pub interval: Duration,

    /// Number of ticks to wait before declaring a timeout.
    pub retry_budget: u32,

    /// How long a drained-mode join waits for every chain.
    pub drain_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            retry_budget: 100,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl PollConfig {
    /// Create from the `poll` section of the configuration file.
    pub fn from_section(section: &PollSection) -> Self {
        Self {
            interval: Duration::from_millis(section.interval_ms),
            retry_budget: section.retry_budget,
            drain_timeout: Duration::from_millis(section.drain_timeout_ms),
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `KERNEL_POLL_INTERVAL_MS`, `KERNEL_RETRY_BUDGET` and
    /// `KERNEL_DRAIN_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: std::env::var("KERNEL_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.interval, Duration::from_millis),
            retry_budget: std::env::var("KERNEL_RETRY_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_budget),
            drain_timeout: std::env::var("KERNEL_DRAIN_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or(defaults.drain_timeout, Duration::from_millis),
        }
    }

    /// Longest a single submission is waited for.
    pub fn timeout(&self) -> Duration {
        self.interval * self.retry_budget
    }
}

/// Wait until `slot` is complete or rejected, or the retry budget runs out.
///
/// Rejections return immediately. A timeout only abandons the wait; nothing
/// is sent to the kernel, which may still be executing `code`.
pub async fn await_settlement(
    slot: &SharedSlot,
    config: &PollConfig,
    code: &str,
) -> Result<SlotContents, ExecError> {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // First tick is immediate, skip it
    let mut ticks = 0u32;

    loop {
        match slot.progress() {
            Progress::Complete(contents) => {
                debug!(ticks, elapsed = ?started.elapsed(), "Submission settled");
                return Ok(contents);
            }
            Progress::Rejected(reply) => {
                return Err(ExecError::ChannelRejection {
                    code: code.to_string(),
                    reply,
                });
            }
            Progress::Waiting => {}
        }

        if ticks >= config.retry_budget {
            warn!(
                ticks,
                correlation_id = %slot.current_id(),
                "Gave up waiting; the kernel may still be executing the code"
            );
            return Err(ExecError::Timeout {
                code: code.to_string(),
                ticks,
                waited: started.elapsed(),
            });
        }

        tokio::select! {
            () = slot.changed() => {}
            _ = ticker.tick() => ticks += 1,
        }
    }
}
