//! Worker main loop.
//!
//! The worker serves one call at a time, forever:
//!
//! ```text
//! Idle ──bind──▶ Reading ──frame──▶ Dispatching ──reply──▶ WritingResponse
//!   ▲               │                    │                       │
//!   └───dropped─────┘◀──no reply─────────┘◀──────sent/failed─────┘
//! ```
//!
//! Nothing inside the loop is fatal. Bind failures back off and retry,
//! unusable frames are dropped, handler failures become sentinel frames,
//! and a response that cannot be delivered gets one nested attempt to tell
//! the host about it.

use std::fmt;
use std::time::Duration;

use tracing::Instrument;

use crate::bridge::{Endpoint, Frame, OneShotListener, TransportError, send_frame};
use crate::config::{ChannelConfig, DEFAULT_WORKER_NAME, env_flag, env_string};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error_log::RotatingErrorLog;

/// Delay before retrying a failed bind.
pub const BIND_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Reading,
    Dispatching,
    WritingResponse,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Reading => "reading",
            LoopState::Dispatching => "dispatching",
            LoopState::WritingResponse => "writing_response",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub channel: ChannelConfig,
    /// Process name; prefixes worker-generated sentinel messages.
    pub marker: String,
    /// Send `["ready", pid]` once the first listener is bound.
    pub announce_ready: bool,
    pub bind_backoff: Duration,
    pub error_log: RotatingErrorLog,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            marker: DEFAULT_WORKER_NAME.to_string(),
            announce_ready: false,
            bind_backoff: BIND_BACKOFF,
            error_log: RotatingErrorLog::new(RotatingErrorLog::default_path(), DEFAULT_WORKER_NAME),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let marker = env_string("PIPECALL_WORKER_NAME").unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string());
        Self {
            channel: ChannelConfig::from_env(),
            announce_ready: env_flag("PIPECALL_ANNOUNCE_READY"),
            bind_backoff: BIND_BACKOFF,
            error_log: RotatingErrorLog::from_env(marker.clone()),
            marker,
        }
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_announce_ready(mut self, announce: bool) -> Self {
        self.announce_ready = announce;
        self
    }

    pub fn with_error_log(mut self, log: RotatingErrorLog) -> Self {
        self.error_log = log;
        self
    }
}

/// How one pass through the loop ended.
#[derive(Debug)]
pub(crate) enum Served {
    /// Accept failed or the frame was unusable.
    Dropped,
    /// Unknown verb or declined frame; nothing sent.
    Ignored,
    Replied,
    /// The reply could not be delivered.
    Undelivered,
}

struct Worker {
    dispatcher: Dispatcher,
    config: WorkerConfig,
    request: Endpoint,
    response: Endpoint,
}

impl Worker {
    fn new(dispatcher: Dispatcher, config: WorkerConfig) -> Self {
        let request = config.channel.request();
        let response = config.channel.response();
        Self {
            dispatcher,
            config,
            request,
            response,
        }
    }

    async fn bind(&self) -> OneShotListener {
        loop {
            match OneShotListener::bind(&self.request).await {
                Ok(listener) => return listener,
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.request,
                        error = %e,
                        backoff_ms = self.config.bind_backoff.as_millis() as u64,
                        "Failed to bind request endpoint, retrying"
                    );
                    tokio::time::sleep(self.config.bind_backoff).await;
                }
            }
        }
    }

    async fn announce_ready(&self) {
        let frame = Frame::ready(std::process::id());
        match send_frame(&self.response, &frame).await {
            Ok(()) => tracing::info!(endpoint = %self.response, "Announced ready"),
            Err(e) => tracing::warn!(error = %e, "Failed to announce ready"),
        }
    }

    async fn serve_one(&self, listener: OneShotListener) -> Served {
        let span = tracing::Span::current();
        span.record("state", LoopState::Reading.as_str());

        let frame = match listener.accept().await {
            Ok(Ok(frame)) => frame,
            Ok(Err(anomaly)) => {
                tracing::warn!(%anomaly, "Dropping request");
                return Served::Dropped;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                return Served::Dropped;
            }
        };

        span.record("state", LoopState::Dispatching.as_str());
        span.record("verb", frame.verb());
        tracing::info!(elements = frame.len(), "Request received");

        let reply = match self.dispatcher.dispatch(&frame).await {
            Dispatch::Unmatched { .. } | Dispatch::Declined { .. } => return Served::Ignored,
            Dispatch::Replied(Ok(reply)) => reply,
            Dispatch::Replied(Err(sentinel)) => {
                self.config.error_log.append(sentinel.verb());
                sentinel
            }
        };

        span.record("state", LoopState::WritingResponse.as_str());
        match send_frame(&self.response, &reply).await {
            Ok(()) => {
                tracing::info!(elements = reply.len(), "Response sent");
                Served::Replied
            }
            Err(e) => {
                self.report_undelivered(e).await;
                Served::Undelivered
            }
        }
    }

    async fn report_undelivered(&self, error: TransportError) {
        tracing::error!(error = %error, "Failed to deliver response");
        let message = format!(
            "{}: failed to deliver response: {}",
            self.config.marker, error
        );
        self.config.error_log.append(&message);

        if let Err(e) = send_frame(&self.response, &Frame::sentinel(&message)).await {
            tracing::error!(error = %e, "Failed to deliver failure notice");
        }
    }

    async fn run(self) {
        tracing::info!(
            request = %self.request,
            response = %self.response,
            verbs = ?self.dispatcher.verbs().collect::<Vec<_>>(),
            "Worker loop starting"
        );

        let mut first = true;
        loop {
            let span = tracing::info_span!(
                "worker_call",
                state = LoopState::Idle.as_str(),
                verb = tracing::field::Empty
            );
            async {
                let listener = self.bind().await;
                if first && self.config.announce_ready {
                    self.announce_ready().await;
                }
                let served = self.serve_one(listener).await;
                tracing::debug!(?served, "Loop iteration done");
            }
            .instrument(span)
            .await;
            first = false;
        }
    }
}

/// Serve calls until the future is dropped.
pub async fn run_worker(dispatcher: Dispatcher, config: WorkerConfig) {
    Worker::new(dispatcher, config).run().await
}
