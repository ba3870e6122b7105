//! Execution monitor: submit a job graph and follow it to completion.
//!
//! The monitor is a small state machine driven by a single consumer of
//! the ComfyUI WebSocket:
//!
//! ```text
//! Connecting -> Submitted -> Running -> Completed
//!      \____________\___________\_____> Failed
//! ```
//!
//! Control events (JSON text frames) and result images (binary frames)
//! share one socket. A binary frame carries no node id of its own; it
//! belongs to the node most recently announced by an `executing` event
//! for our prompt. Frames are therefore consumed strictly in receipt
//! order by one task, never split across readers.

use std::time::Duration;

use faceswap_core::error::ErrorKind;
use faceswap_core::results::ResultSet;
use faceswap_core::workflow::JobGraph;
use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClientError, ComfyUIConnection, ComfyUIStream};
use crate::messages::{
    parse_message, BinaryFrame, ComfyUIMessage, ErrorData, ExecutingData, ProgressData,
};
use crate::session::ClientSession;

/// Default time to wait for the next frame before giving up.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle of one monitored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Opening the WebSocket channel.
    Connecting,
    /// Channel open, submitting the job graph.
    Submitted,
    /// Job queued; consuming events until the terminal one arrives.
    Running,
    /// The server reported the prompt finished.
    Completed,
    /// Terminal failure; no results are surfaced.
    Failed,
}

/// Tunables for [`run_execution`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum silence between two frames. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// Everything collected from a completed job.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub prompt_id: String,
    pub results: ResultSet,
    /// Binary frames dropped because they were truncated or arrived
    /// before any node was announced.
    pub discarded_frames: usize,
    /// Set when the server reported an `execution_error` for the prompt.
    pub execution_error: Option<ErrorData>,
}

/// Errors that end monitoring in [`MonitorState::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The WebSocket channel could not be opened.
    #[error("Failed to open event channel: {0}")]
    Connect(#[from] ComfyUIClientError),

    /// The job graph was not accepted.
    #[error("Failed to submit workflow: {0}")]
    Submit(#[from] ComfyUIApiError),

    /// Reading from the channel failed.
    #[error("WebSocket receive error: {0}")]
    Receive(#[source] WsError),

    /// The server closed the channel before the job completed.
    #[error("Event channel closed before the job completed")]
    ChannelClosed,

    /// No frame arrived within the idle timeout.
    #[error("No event received for {}s", .0.as_secs())]
    IdleTimeout(Duration),

    /// The WebSocket handshake did not finish within the idle timeout.
    #[error("WebSocket handshake did not complete within {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    /// Monitoring was cancelled by the caller.
    #[error("Monitoring cancelled")]
    Cancelled,

    /// A frame did not have the expected shape.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::Connect(e) => e.kind(),
            MonitorError::Submit(e) => e.kind(),
            MonitorError::Receive(_)
            | MonitorError::ChannelClosed
            | MonitorError::IdleTimeout(_)
            | MonitorError::ConnectTimeout(_)
            | MonitorError::Cancelled => ErrorKind::TransportFailure,
            MonitorError::Protocol(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Whether the job is still running after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Completed,
}

/// State for one job: current state, attribution cursor and results.
#[derive(Debug)]
pub struct ExecutionMonitor {
    state: MonitorState,
    prompt_id: Option<String>,
    /// Last node announced by a matching `executing` event.
    current_node: Option<String>,
    results: ResultSet,
    discarded_frames: usize,
    execution_error: Option<ErrorData>,
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self {
            state: MonitorState::Connecting,
            prompt_id: None,
            current_node: None,
            results: ResultSet::new(),
            discarded_frames: 0,
            execution_error: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node.as_deref()
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn discarded_frames(&self) -> usize {
        self.discarded_frames
    }

    /// The event channel is open; the graph is about to be submitted.
    pub fn channel_opened(&mut self) {
        self.transition(MonitorState::Submitted);
    }

    /// The server accepted the graph as `prompt_id`.
    pub fn submission_accepted(&mut self, prompt_id: String) {
        self.prompt_id = Some(prompt_id);
        self.transition(MonitorState::Running);
    }

    /// Move to [`MonitorState::Failed`] and hand the error back.
    pub fn fail(&mut self, error: MonitorError) -> MonitorError {
        tracing::warn!(prompt_id = ?self.prompt_id, error = %error, "Monitoring failed");
        self.transition(MonitorState::Failed);
        error
    }

    /// Consume frames from `stream` until the job completes.
    ///
    /// Returns `Err` (and moves to `Failed`) on a receive error, channel
    /// close, idle timeout, cancellation or malformed control message.
    pub async fn consume<S>(
        &mut self,
        stream: &mut S,
        idle_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), MonitorError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.fail(MonitorError::Cancelled)),
                received = next_frame(stream, idle_timeout) => received,
            };

            let message = match received {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => return Err(self.fail(MonitorError::Receive(e))),
                Ok(None) => return Err(self.fail(MonitorError::ChannelClosed)),
                Err(_elapsed) => {
                    let limit = idle_timeout.unwrap_or_default();
                    return Err(self.fail(MonitorError::IdleTimeout(limit)));
                }
            };

            if self.handle_message(message)? == Flow::Completed {
                return Ok(());
            }
        }
    }

    /// Apply one frame to the state machine.
    pub fn handle_message(&mut self, message: Message) -> Result<Flow, MonitorError> {
        match message {
            Message::Text(text) => self.handle_text(&text),
            Message::Binary(bytes) => {
                self.handle_binary(bytes);
                Ok(Flow::Continue)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Flow::Continue),
            Message::Close(frame) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                Err(self.fail(MonitorError::ChannelClosed))
            }
        }
    }

    /// The collected results, available only once the job completed.
    pub fn into_outcome(self) -> Option<ExecutionOutcome> {
        if self.state != MonitorState::Completed {
            return None;
        }
        Some(ExecutionOutcome {
            prompt_id: self.prompt_id?,
            results: self.results,
            discarded_frames: self.discarded_frames,
            execution_error: self.execution_error,
        })
    }

    // ---- individual message handlers ----

    fn transition(&mut self, next: MonitorState) {
        tracing::debug!(from = ?self.state, to = ?next, "Monitor state change");
        self.state = next;
    }

    fn is_ours(&self, prompt_id: Option<&str>) -> bool {
        prompt_id.is_some() && prompt_id == self.prompt_id.as_deref()
    }

    fn handle_text(&mut self, text: &str) -> Result<Flow, MonitorError> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, raw_message = %text, "Failed to parse ComfyUI message");
                return Err(self.fail(MonitorError::Protocol(format!(
                    "unparseable control message: {e}"
                ))));
            }
        };

        match message {
            ComfyUIMessage::Executing(data) => return Ok(self.handle_executing(data)),
            ComfyUIMessage::Progress(data) => self.handle_progress(&data),
            ComfyUIMessage::ExecutionStart(data) => {
                if self.is_ours(Some(data.prompt_id.as_str())) {
                    tracing::info!(prompt_id = %data.prompt_id, "Execution started");
                }
            }
            ComfyUIMessage::ExecutionCached(data) => {
                if self.is_ours(Some(data.prompt_id.as_str())) {
                    tracing::debug!(nodes = ?data.nodes, "Execution used cache");
                }
            }
            ComfyUIMessage::Executed(data) => {
                if self.is_ours(Some(data.prompt_id.as_str())) {
                    tracing::debug!(node = %data.node, "Node executed with output");
                }
            }
            ComfyUIMessage::ExecutionError(data) => {
                if self.is_ours(Some(data.prompt_id.as_str())) {
                    tracing::error!(
                        prompt_id = %data.prompt_id,
                        node_id = %data.node_id,
                        node_type = %data.node_type,
                        error_type = %data.exception_type,
                        error_message = %data.exception_message,
                        "Execution error",
                    );
                    self.execution_error = Some(data);
                }
            }
            ComfyUIMessage::Status(data) => {
                tracing::debug!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
            }
            ComfyUIMessage::Other { kind } => {
                tracing::trace!(kind = %kind, "Ignoring message type");
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_executing(&mut self, data: ExecutingData) -> Flow {
        if !self.is_ours(data.prompt_id.as_deref()) {
            tracing::trace!(prompt_id = ?data.prompt_id, "Ignoring event for another prompt");
            return Flow::Continue;
        }

        match data.node {
            Some(node) => {
                tracing::info!(node = %node, "Executing node");
                self.current_node = Some(node);
                Flow::Continue
            }
            None => {
                // node == None means execution is complete for this prompt.
                tracing::info!(
                    prompt_id = ?self.prompt_id,
                    images = self.results.image_count(),
                    "Execution completed (all nodes done)",
                );
                self.transition(MonitorState::Completed);
                Flow::Completed
            }
        }
    }

    fn handle_progress(&self, data: &ProgressData) {
        if data.prompt_id.is_some() && !self.is_ours(data.prompt_id.as_deref()) {
            return;
        }
        tracing::info!(
            value = data.value,
            max = data.max,
            percent = data.percent(),
            "Generation progress",
        );
    }

    fn handle_binary(&mut self, bytes: Vec<u8>) {
        let Some(frame) = BinaryFrame::parse(bytes) else {
            tracing::warn!("Discarding binary frame shorter than its header");
            self.discarded_frames += 1;
            return;
        };

        match &self.current_node {
            Some(node) => {
                tracing::debug!(
                    node = %node,
                    bytes = frame.payload.len(),
                    image_format = frame.image_format,
                    "Received image data",
                );
                self.results.push(node, frame.payload);
            }
            None => {
                tracing::warn!(
                    bytes = frame.payload.len(),
                    "Discarding binary frame received before any node was announced",
                );
                self.discarded_frames += 1;
            }
        }
    }
}

/// Wait for the next frame, bounded by `idle_timeout` when set.
async fn next_frame<S>(
    stream: &mut S,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, tokio::time::error::Elapsed>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Open the channel, submit `graph`, and monitor it to completion.
///
/// The channel is always closed before returning. If monitoring fails
/// after the graph was accepted, the prompt is also removed from the
/// server queue (best effort) so it does not keep running unobserved.
pub async fn run_execution(
    session: &ClientSession,
    api: &ComfyUIApi,
    graph: &JobGraph,
    config: &MonitorConfig,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome, MonitorError> {
    let mut monitor = ExecutionMonitor::new();

    let connection = match open_channel(session, config.idle_timeout, cancel).await {
        Ok(connection) => connection,
        Err(e) => return Err(monitor.fail(e)),
    };
    let mut ws_stream = connection.ws_stream;
    monitor.channel_opened();

    if cancel.is_cancelled() {
        close_channel(&mut ws_stream).await;
        return Err(monitor.fail(MonitorError::Cancelled));
    }

    let submitted = match api.submit_workflow(graph, session.client_id()).await {
        Ok(submitted) => submitted,
        Err(e) => {
            close_channel(&mut ws_stream).await;
            return Err(monitor.fail(e.into()));
        }
    };

    if submitted
        .node_errors
        .as_object()
        .is_some_and(|errors| !errors.is_empty())
    {
        tracing::warn!(node_errors = %submitted.node_errors, "Workflow queued with node errors");
    }
    tracing::info!(
        prompt_id = %submitted.prompt_id,
        queue_position = submitted.number,
        "Workflow submitted to ComfyUI",
    );
    let prompt_id = submitted.prompt_id;
    monitor.submission_accepted(prompt_id.clone());

    let consumed = monitor
        .consume(&mut ws_stream, config.idle_timeout, cancel)
        .await;
    close_channel(&mut ws_stream).await;

    if let Err(error) = consumed {
        if let Err(e) = api.cancel_execution(&prompt_id).await {
            tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to dequeue prompt");
        }
        return Err(error);
    }

    monitor
        .into_outcome()
        .ok_or_else(|| MonitorError::Protocol("monitoring ended without completion".into()))
}

/// Handshake bounded by `limit` and abandoned as soon as `cancel` fires.
async fn open_channel(
    session: &ClientSession,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, MonitorError> {
    let client = session.ws_client();
    let handshake = client.connect(session.client_id());

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
        connected = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, handshake)
                    .await
                    .map_err(|_elapsed| MonitorError::ConnectTimeout(limit)),
                None => Ok(handshake.await),
            }
        } => connected,
    };
    connected?.map_err(MonitorError::Connect)
}

async fn close_channel(ws_stream: &mut ComfyUIStream) {
    if let Err(e) = ws_stream.close(None).await {
        tracing::debug!(error = %e, "WebSocket close failed");
    }
}
