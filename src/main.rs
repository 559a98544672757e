//! kernel-orchestrator
//!
//! Runs code snippets one after another in a kernel process and prints each
//! decoded result as a JSON line on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kernel_orchestrator::channel::MessageChannel;
use kernel_orchestrator::config::Config;
use kernel_orchestrator::{CorrelationRegistry, Orchestrator, PipeChannel, Submission};

#[derive(Parser, Debug)]
#[command(name = "kernel-orchestrator")]
#[command(about = "Run code snippets in a kernel process, in order")]
struct Args {
    /// Kernel executable speaking the framed JSON protocol
    #[arg(long)]
    kernel: Option<String>,

    /// Argument for the kernel executable (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    kernel_args: Vec<String>,

    /// JSON configuration file (defaults to KERNEL_ORCHESTRATOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Return output as plain text instead of decoding JSON
    #[arg(long)]
    plain: bool,

    /// Wait for completion status only, ignore output
    #[arg(long, conflicts_with = "plain")]
    shell: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Code snippets, executed in the given order
    #[arg(required = true)]
    code: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for results)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let kernel = config.resolved_kernel(args.kernel.as_deref(), &args.kernel_args)?;
    let poll = config.poll_config();

    info!(exec = %kernel.exec, timeout = ?poll.timeout(), "Starting kernel");

    let channel = Arc::new(
        PipeChannel::spawn(
            &kernel.exec,
            &kernel.args,
            &kernel.env_pairs(),
            kernel.ready_timeout(),
        )
        .await
        .context("Failed to start kernel")?,
    );

    let orchestrator = Orchestrator::new(
        Arc::clone(&channel) as Arc<dyn MessageChannel>,
        Arc::new(CorrelationRegistry::new()),
        poll,
    );

    let (plain, shell, options) = (args.plain, args.shell, config.execute);
    let outcome = orchestrator
        .chain()
        .for_each(args.code, move |code, orchestrator| async move {
            let mut submission = Submission::new(code).options(options);
            if shell {
                submission = submission.shell();
            } else if plain {
                submission = submission.expect_plain_text();
            }

            let settled = orchestrator.run(submission).await?;
            let line = serde_json::json!({
                "correlation_id": settled.correlation_id.get(),
                "code": settled.code,
                "status": settled.completion.status.to_string(),
                "result": settled.result.into_json(),
            });
            println!("{line}");
            Ok(())
        })
        .done()
        .wait()
        .await;

    channel.shutdown().await?;

    let outcome = outcome?;
    info!(steps = outcome.steps, "All snippets executed");
    Ok(())
}
