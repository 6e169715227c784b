//! Host side of a call.
//!
//! Flow of one call:
//! 1. Make sure the worker is running (launching it if needed)
//! 2. Bind the one-shot response listener
//! 3. Send the request frame to the worker
//! 4. Wait for the reply (optionally bounded by `call_timeout`)
//! 5. Classify the reply and hand it to the verb's continuation
//!
//! A call that times out leaves the worker owing one reply. The response
//! listener of that call stays bound so the late reply lands there, and the
//! next call drains it before binding again. A worker that stays silent for
//! `resync_timeout` is restarted.
//!
//! [`HostClient`] is the async client, [`HostSession`] adds continuations and
//! error reporting, and [`BlockingHost`] runs a session on its own thread for
//! callers that cannot await.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::{
    Frame, FrameError, OneShotListener, ProtocolAnomaly, Received, TransportError,
    send_frame_patient,
};
use crate::config::env_millis;
use crate::error_log::RotatingErrorLog;
use crate::supervisor::{
    ProcessProbe, SupervisorConfig, SupervisorError, SystemProbe, WorkerSupervisor,
};

/// Label for host entries in the error log.
pub const HOST_LOG_LABEL: &str = "pipecall-host";

/// How long a request send keeps retrying while the worker rebinds.
pub const DEFAULT_CONNECT_PATIENCE: Duration = Duration::from_secs(5);

/// How long the next call waits for the late reply of a timed-out call.
pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid request: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reply lost: {0}")]
    Dropped(ProtocolAnomaly),
    #[error("worker unavailable: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("host call thread has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub supervisor: SupervisorConfig,
    /// Upper bound on waiting for a reply. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub connect_patience: Duration,
    /// Wait for a late reply before restarting the worker.
    pub resync_timeout: Duration,
    pub error_log: RotatingErrorLog,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            call_timeout: None,
            connect_patience: DEFAULT_CONNECT_PATIENCE,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            error_log: RotatingErrorLog::new(RotatingErrorLog::default_path(), HOST_LOG_LABEL),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self {
            supervisor: SupervisorConfig::from_env(),
            call_timeout: env_millis("PIPECALL_CALL_TIMEOUT_MS"),
            connect_patience: DEFAULT_CONNECT_PATIENCE,
            resync_timeout: env_millis("PIPECALL_RESYNC_TIMEOUT_MS")
                .unwrap_or(DEFAULT_RESYNC_TIMEOUT),
            error_log: RotatingErrorLog::from_env(HOST_LOG_LABEL),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    pub fn with_error_log(mut self, log: RotatingErrorLog) -> Self {
        self.error_log = log;
        self
    }
}

/// Accept of a timed-out call, still waiting for its reply.
type OwedReply = BoxFuture<'static, Result<Received, TransportError>>;

/// Async client. Calls are serialised: one request is in flight at a time.
pub struct HostClient<P: ProcessProbe = SystemProbe> {
    config: HostConfig,
    supervisor: WorkerSupervisor<P>,
    /// Serialises calls and holds the reply a timed-out call still owes.
    gate: Mutex<Option<OwedReply>>,
}

impl HostClient<SystemProbe> {
    pub fn new(config: HostConfig) -> Self {
        let supervisor = WorkerSupervisor::new(config.supervisor.clone());
        Self::with_supervisor(config, supervisor)
    }
}

impl<P: ProcessProbe> HostClient<P> {
    pub fn with_supervisor(config: HostConfig, supervisor: WorkerSupervisor<P>) -> Self {
        Self {
            config,
            supervisor,
            gate: Mutex::new(None),
        }
    }

    pub fn supervisor(&self) -> &WorkerSupervisor<P> {
        &self.supervisor
    }

    /// Name prefix of worker-generated sentinel messages.
    pub fn marker(&self) -> &str {
        &self.config.supervisor.worker_name
    }

    /// Send `request` and wait for the reply.
    pub async fn call(&self, request: &Frame) -> Result<Frame, HostError> {
        let mut owed = self.gate.lock().await;
        let call_id = Uuid::new_v4();
        let span = tracing::info_span!("host_call", %call_id, verb = %request.verb());

        async {
            if let Some(late) = owed.take() {
                self.resync(late).await;
            }

            if !self.supervisor.is_running() {
                tracing::info!("Worker not running, launching");
                self.supervisor.try_launch().await?;
            }

            let channel = &self.config.supervisor.channel;
            let listener = OneShotListener::bind(&channel.response()).await?;
            send_frame_patient(&channel.request(), request, self.config.connect_patience).await?;
            tracing::debug!(elements = request.len(), "Request sent, waiting for reply");

            let received = match self.config.call_timeout {
                Some(timeout) => {
                    let mut accept = listener.accept().boxed();
                    match tokio::time::timeout(timeout, &mut accept).await {
                        Ok(received) => received?,
                        Err(_) => {
                            tracing::warn!(
                                timeout_ms = timeout.as_millis() as u64,
                                "No reply in time, keeping the listener for the late reply"
                            );
                            *owed = Some(accept);
                            return Err(HostError::Transport(TransportError::Timeout {
                                name: channel.response_endpoint.clone(),
                                after: timeout,
                            }));
                        }
                    }
                }
                None => listener.accept().await?,
            };
            let reply = received.map_err(HostError::Dropped)?;
            tracing::debug!(elements = reply.len(), "Reply received");
            Ok::<_, HostError>(reply)
        }
        .instrument(span)
        .await
    }

    /// Drain the reply a timed-out call still owes, or restart a worker that
    /// never delivers it.
    async fn resync(&self, late: OwedReply) {
        match tokio::time::timeout(self.config.resync_timeout, late).await {
            Ok(Ok(Ok(frame))) => {
                tracing::info!(verb = %frame.verb(), "Discarded late reply of a timed-out call");
            }
            Ok(Ok(Err(anomaly))) => {
                tracing::info!(%anomaly, "Late reply of a timed-out call was unusable");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Listener of a timed-out call failed");
            }
            Err(_) => {
                tracing::warn!(
                    resync_ms = self.config.resync_timeout.as_millis() as u64,
                    "Worker still owes a reply, restarting it"
                );
                self.supervisor.terminate();
            }
        }
    }
}

/// Interprets a successful reply for one verb.
pub type Continuation = fn(&Frame) -> String;

#[derive(Debug, Clone, Default)]
pub struct Continuations {
    table: HashMap<String, Continuation>,
}

impl Continuations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, verb: impl Into<String>, continuation: Continuation) -> Self {
        self.table.insert(verb.into(), continuation);
        self
    }

    pub fn get(&self, verb: &str) -> Option<Continuation> {
        self.table.get(verb).copied()
    }
}

/// What the host application sees after a call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CallOutcome {
    pub error: bool,
    pub response: String,
}

impl CallOutcome {
    pub fn success(response: impl Into<String>) -> Self {
        Self {
            error: false,
            response: response.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            response: message.into(),
        }
    }
}

pub struct HostSession<P: ProcessProbe = SystemProbe> {
    client: HostClient<P>,
    continuations: Continuations,
    error_log: RotatingErrorLog,
}

impl<P: ProcessProbe> HostSession<P> {
    pub fn new(client: HostClient<P>, continuations: Continuations) -> Self {
        let error_log = client.config.error_log.clone();
        Self {
            client,
            continuations,
            error_log,
        }
    }

    pub fn client(&self) -> &HostClient<P> {
        &self.client
    }

    /// Run `request` and interpret the reply.
    ///
    /// Returns `Ok(None)` without contacting the worker when no continuation
    /// is registered for the verb.
    pub async fn invoke(&self, request: &Frame) -> Result<Option<CallOutcome>, HostError> {
        let verb = request.verb();
        let Some(continuation) = self.continuations.get(verb) else {
            tracing::debug!(%verb, "No continuation for verb, nothing to do");
            return Ok(None);
        };

        let reply = match self.client.call(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(%verb, error = %e, "Call failed");
                self.error_log.append(&format!("{verb}: {e}"));
                return Err(e);
            }
        };
        if reply.is_sentinel(self.client.marker()) {
            let message = reply.verb().to_string();
            tracing::warn!(%verb, error = %message, "Worker reported failure");
            self.error_log.append(&message);
            return Ok(Some(CallOutcome::failure(message)));
        }

        Ok(Some(CallOutcome::success(continuation(&reply))))
    }

    pub async fn ensure_worker(&self) -> bool {
        self.client.supervisor.ensure_running().await
    }

    pub fn shutdown(&self) {
        tracing::info!("Terminating worker");
        self.client.supervisor.terminate();
    }
}

type Completion = std_mpsc::Sender<Result<Option<CallOutcome>, HostError>>;

enum Job {
    Invoke { request: Frame, done: Completion },
    EnsureWorker { done: std_mpsc::Sender<bool> },
    Shutdown { done: std_mpsc::Sender<()> },
}

/// Synchronous facade over a [`HostSession`].
///
/// The session lives on a dedicated thread with its own runtime. Each call
/// is handed over a channel and the caller blocks until it completes.
pub struct BlockingHost {
    submit: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl BlockingHost {
    pub fn start<P: ProcessProbe + 'static>(session: HostSession<P>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (submit, mut jobs) = mpsc::unbounded_channel::<Job>();

        let thread = std::thread::Builder::new()
            .name("pipecall-host".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = jobs.recv().await {
                        match job {
                            Job::Invoke { request, done } => {
                                let _ = done.send(session.invoke(&request).await);
                            }
                            Job::EnsureWorker { done } => {
                                let _ = done.send(session.ensure_worker().await);
                            }
                            Job::Shutdown { done } => {
                                session.shutdown();
                                let _ = done.send(());
                            }
                        }
                    }
                    tracing::debug!("Host call thread exiting");
                });
            })?;

        Ok(Self {
            submit: Some(submit),
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<(), HostError> {
        self.submit
            .as_ref()
            .ok_or(HostError::Stopped)?
            .send(job)
            .map_err(|_| HostError::Stopped)
    }

    /// Blocks until the call completes.
    pub fn invoke(&self, request: Frame) -> Result<Option<CallOutcome>, HostError> {
        let (done, wait) = std_mpsc::channel();
        self.submit(Job::Invoke { request, done })?;
        wait.recv().map_err(|_| HostError::Stopped)?
    }

    pub fn ensure_worker(&self) -> bool {
        let (done, wait) = std_mpsc::channel();
        if self.submit(Job::EnsureWorker { done }).is_err() {
            return false;
        }
        wait.recv().unwrap_or(false)
    }

    /// Terminate the worker. Best effort.
    pub fn shutdown(&self) {
        let (done, wait) = std_mpsc::channel();
        if self.submit(Job::Shutdown { done }).is_ok() {
            let _ = wait.recv_timeout(Duration::from_secs(5));
        }
    }
}

impl Drop for BlockingHost {
    fn drop(&mut self) {
        self.submit.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Host call thread panicked");
        }
    }
}
