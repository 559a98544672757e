//! Framed pipe channel to a kernel process.
//!
//! Owns the kernel's stdin (requests) and a reader task on its stdout
//! (replies). Replies are routed by `parent_id` to the callbacks
//! registered at submit time.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::protocol::{CompletionReply, ExecuteOptions, KernelFrame, KernelRequest};
use super::{recv_message, send_message, MessageChannel, ReplyCallbacks, RequestHandle};

type Pending = Arc<Mutex<HashMap<String, ReplyCallbacks>>>;

/// Channel that talks to a kernel via length-prefixed JSON over a pipe pair.
///
/// Writes are serialized by a mutex; reads happen on a dedicated task so
/// replies for several in-flight requests can interleave freely.
pub struct PipeChannel {
    child: Mutex<Option<Child>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    pong: Arc<Notify>,
    next_msg: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeChannel")
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PipeChannel {
    /// Spawn a kernel process and wait for its `Ready` frame.
    ///
    /// `exec_path` is started with `args` and the extra `env` variables;
    /// its stderr is inherited so kernel diagnostics stay visible.
    pub async fn spawn(
        exec_path: &str,
        args: &[String],
        env: &[(String, String)],
        ready_timeout: Duration,
    ) -> Result<Self> {
        debug!(exec = %exec_path, "Spawning kernel process");

        let mut child = tokio::process::Command::new(exec_path)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn kernel: {exec_path}"))?;

        let stdin = child.stdin.take().context("Failed to take kernel stdin")?;
        let stdout = child.stdout.take().context("Failed to take kernel stdout")?;

        Self::start(stdout, stdin, Some(child), ready_timeout).await
    }

    /// Wrap an already-connected reader/writer pair (e.g. a socket or duplex).
    pub async fn from_io<R, W>(reader: R, writer: W, ready_timeout: Duration) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(reader, writer, None, ready_timeout).await
    }

    async fn start<R, W>(
        mut reader: R,
        writer: W,
        child: Option<Child>,
        ready_timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let ready_bytes = tokio::time::timeout(ready_timeout, recv_message(&mut reader))
            .await
            .map_err(|_| anyhow::anyhow!("Kernel did not send Ready within {ready_timeout:?}"))?
            .context("Failed to read kernel Ready message")?;

        let ready: KernelFrame = serde_json::from_slice(&ready_bytes)
            .context("Failed to parse kernel Ready message")?;
        if !matches!(ready, KernelFrame::Ready) {
            anyhow::bail!("Expected Ready message, got: {ready:?}");
        }
        debug!("Kernel is ready");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let pong = Arc::new(Notify::new());
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&alive),
            Arc::clone(&pong),
        ));

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(Box::new(writer)),
            pending,
            alive,
            pong,
            next_msg: AtomicU64::new(1),
            reader,
        })
    }

    /// Number of submissions whose completion has not arrived yet.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Round-trip a `Ping` and wait up to `timeout` for the `Pong`.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        if !self.alive.load(Ordering::Relaxed) {
            anyhow::bail!("Kernel process is not alive");
        }

        let pong = self.pong.notified();
        self.write_request(&KernelRequest::Ping)
            .await
            .context("Failed to send ping to kernel")?;
        tokio::time::timeout(timeout, pong)
            .await
            .map_err(|_| anyhow::anyhow!("Kernel did not answer Ping within {timeout:?}"))
    }

    async fn write_request(&self, req: &KernelRequest) -> Result<()> {
        let bytes = serde_json::to_vec(req).context("Failed to serialize request")?;
        let mut writer = self.writer.lock().await;
        send_message(&mut *writer, &bytes).await
    }
}

#[async_trait]
impl MessageChannel for PipeChannel {
    #[instrument(skip(self, code, callbacks), fields(code_len = code.len()))]
    async fn submit(
        &self,
        code: &str,
        callbacks: ReplyCallbacks,
        options: ExecuteOptions,
    ) -> Result<RequestHandle> {
        let msg_id = format!("req-{}", self.next_msg.fetch_add(1, Ordering::Relaxed));
        {
            // Checked under the lock the reader drains with, so a registration
            // either gets drained or is never made.
            let mut pending = self.pending.lock().await;
            if !self.alive.load(Ordering::Relaxed) {
                anyhow::bail!("Kernel process is not alive");
            }
            pending.insert(msg_id.clone(), callbacks);
        }

        let req = KernelRequest::Execute {
            msg_id: msg_id.clone(),
            code: code.to_string(),
            silent: options.silent,
            store_history: options.store_history,
            stop_on_error: options.stop_on_error,
        };

        if let Err(e) = self.write_request(&req).await {
            self.pending.lock().await.remove(&msg_id);
            return Err(e).context("Failed to send execute request to kernel");
        }

        debug!(request = %msg_id, "Submitted execute request");
        Ok(RequestHandle::new(msg_id))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.alive.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.write_request(&KernelRequest::Shutdown).await {
                warn!(error = %e, "Graceful shutdown failed, killing kernel");
            }
        }

        self.reader.abort();
        abort_pending(&self.pending, "kernel channel shut down").await;

        // Reaped even when the reader already saw the pipe close.
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
            debug!("Kernel process stopped");
        }

        debug!("Kernel channel shut down");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read frames until the kernel's output closes, routing each to its callbacks.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    pending: Pending,
    alive: Arc<AtomicBool>,
    pong: Arc<Notify>,
) {
    loop {
        let bytes = match recv_message(&mut reader).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Kernel output closed");
                break;
            }
        };

        match serde_json::from_slice::<KernelFrame>(&bytes) {
            Ok(frame) => dispatch(frame, &pending, &pong).await,
            Err(e) => warn!(error = %e, len = bytes.len(), "Dropping malformed kernel frame"),
        }
    }

    alive.store(false, Ordering::Relaxed);
    let abandoned = abort_pending(&pending, "kernel output closed").await;
    if abandoned > 0 {
        warn!(abandoned, "Kernel channel closed with executions in flight");
    }
}

/// Complete every registration as aborted so nobody waits on a dead kernel.
async fn abort_pending(pending: &Pending, reason: &str) -> usize {
    let abandoned: Vec<_> = pending.lock().await.drain().collect();
    for (request, callbacks) in &abandoned {
        debug!(request = %request, reason, "Aborting pending execution");
        (callbacks.on_completion)(CompletionReply::aborted(reason));
    }
    abandoned.len()
}

async fn dispatch(frame: KernelFrame, pending: &Pending, pong: &Notify) {
    match frame {
        KernelFrame::Ready => debug!("Ignoring repeated Ready frame"),
        KernelFrame::Pong => pong.notify_waiters(),
        KernelFrame::Iopub { parent_id, reply } => {
            // Clone out of the map so callbacks never run under the lock
            let callbacks = pending.lock().await.get(&parent_id).cloned();
            match callbacks {
                Some(callbacks) => (callbacks.on_output)(reply),
                None => debug!(request = %parent_id, "Dropping reply for unknown request"),
            }
        }
        KernelFrame::InputRequest { parent_id, request } => {
            let handler = pending
                .lock()
                .await
                .get(&parent_id)
                .and_then(|c| c.on_input_request.clone());
            match handler {
                Some(handler) => handler(request),
                None => warn!(request = %parent_id, prompt = %request.prompt, "Unhandled input request"),
            }
        }
        KernelFrame::ExecuteReply { parent_id, reply } => {
            let callbacks = pending.lock().await.remove(&parent_id);
            match callbacks {
                Some(callbacks) => (callbacks.on_completion)(reply),
                None => debug!(request = %parent_id, "Dropping completion for unknown request"),
            }
        }
    }
}
