//! Backpressure bridge between the running turn and a streaming caller.
//!
//! Adapters and middleware write progress events into a large internal
//! channel. A single relay task drains that channel into the caller-facing
//! output channel. Once the caller's token is cancelled, or the caller drops
//! its receiver, the relay switches to dropping mode and discards everything
//! that follows, so producers never wait on a consumer that has gone away.

use crate::agent_loop::{Middleware, ModelOutput};
use crate::context::ExecutionContext;
use crate::interfaces::RuntimeError;
use crate::types::{StreamEvent, StreamEventKind, ToolCall};
use async_trait::async_trait;
use claw_sdk_tools::ToolResult;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the internal progress channel.
///
/// This is a capacity contract: it must absorb a burst of tool output while a
/// slow consumer renders, so tool execution does not stall on the relay.
pub const PROGRESS_BUFFER: usize = 512;

/// Capacity of the caller-facing channel returned by `run_stream`.
pub const OUTPUT_BUFFER: usize = 32;

/// Producer handle for the progress channel. Dropping every clone closes the
/// channel and lets the relay finish.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl ProgressSender {
    pub async fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("progress channel closed, event discarded");
        }
    }
}

/// Counters reported when the relay finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: usize,
    pub dropped: usize,
}

pub struct StreamRelay {
    handle: JoinHandle<RelayStats>,
}

impl StreamRelay {
    /// Spawn the relay task. Returns the relay and the progress producer.
    pub fn start(
        output: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> (Self, ProgressSender) {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let handle = tokio::spawn(relay_loop(rx, output, cancel));
        (Self { handle }, ProgressSender { tx })
    }

    /// Wait for the relay to drain. Every `ProgressSender` clone must have
    /// been dropped, otherwise this waits for the remaining producers.
    pub async fn finish(self) -> RelayStats {
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("stream relay task failed: {}", e);
                RelayStats::default()
            }
        }
    }
}

async fn relay_loop(
    mut progress: mpsc::Receiver<StreamEvent>,
    output: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut dropping = false;

    while let Some(event) = progress.recv().await {
        if dropping {
            stats.dropped += 1;
            continue;
        }
        tokio::select! {
            sent = output.send(event) => {
                if sent.is_ok() {
                    stats.forwarded += 1;
                } else {
                    debug!("stream consumer went away, dropping further events");
                    dropping = true;
                    stats.dropped += 1;
                }
            }
            _ = cancel.cancelled() => {
                debug!("stream cancelled, dropping further events");
                dropping = true;
                stats.dropped += 1;
            }
        }
    }

    if stats.dropped > 0 {
        crate::metrics::record_relay_drops(stats.dropped);
    }
    debug!(
        "stream relay finished: forwarded={}, dropped={}",
        stats.forwarded, stats.dropped
    );
    stats
}

/// Deliver a terminal event unless the caller has cancelled.
pub(crate) async fn send_terminal(
    output: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    event: StreamEvent,
) {
    tokio::select! {
        sent = output.send(event) => {
            if sent.is_err() {
                debug!("stream consumer gone before terminal event");
            }
        }
        _ = cancel.cancelled() => {
            debug!("stream cancelled before terminal event");
        }
    }
}

/// Middleware that mirrors agent-loop progress into the progress channel.
pub struct ProgressMiddleware {
    sender: ProgressSender,
}

impl ProgressMiddleware {
    pub fn new(sender: ProgressSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Middleware for ProgressMiddleware {
    async fn before_agent(&self, _ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        self.sender
            .emit(StreamEvent::new(StreamEventKind::AgentStart))
            .await;
        Ok(())
    }

    async fn before_model(
        &self,
        _ctx: &ExecutionContext,
        iteration: usize,
    ) -> Result<(), RuntimeError> {
        let mut event = StreamEvent::new(StreamEventKind::IterationStart);
        event.iteration = Some(iteration);
        self.sender.emit(event).await;
        Ok(())
    }

    async fn after_model(
        &self,
        _ctx: &ExecutionContext,
        output: &ModelOutput,
    ) -> Result<(), RuntimeError> {
        if !output.content.is_empty() {
            let mut event = StreamEvent::new(StreamEventKind::MessageDelta);
            event.output = json!(output.content);
            self.sender.emit(event).await;
        }
        Ok(())
    }

    async fn before_tool(
        &self,
        _ctx: &ExecutionContext,
        call: &ToolCall,
    ) -> Result<(), RuntimeError> {
        let mut event = StreamEvent::new(StreamEventKind::ToolExecutionStart);
        event.tool_use_id = Some(call.id.clone());
        event.name = Some(call.name.clone());
        event.output = call.arguments.clone();
        self.sender.emit(event).await;
        Ok(())
    }

    async fn after_tool(
        &self,
        _ctx: &ExecutionContext,
        call: &ToolCall,
        result: &Result<ToolResult, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let mut event = StreamEvent::new(StreamEventKind::ToolExecutionResult);
        event.tool_use_id = Some(call.id.clone());
        event.name = Some(call.name.clone());
        match result {
            Ok(res) => {
                event.output = res.output.clone();
                event.is_error = !res.success;
            }
            Err(e) => {
                event.output = json!(e.to_string());
                event.is_error = true;
            }
        }
        self.sender.emit(event).await;
        Ok(())
    }

    async fn after_agent(&self, _ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        self.sender
            .emit(StreamEvent::new(StreamEventKind::AgentStop))
            .await;
        Ok(())
    }
}
