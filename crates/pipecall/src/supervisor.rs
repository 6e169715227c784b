//! Worker process supervision.
//!
//! The supervisor answers "is the worker up?", starts it when it is not and
//! kills it on shutdown. A worker counts as running when the child we spawned
//! is still alive or when any process carries the worker's name, so a worker
//! left behind by an earlier host session is reused rather than duplicated.
//!
//! Launch waits for the worker to say it is listening: the supervisor binds
//! the response endpoint first, spawns the worker with
//! `PIPECALL_ANNOUNCE_READY=1`, and returns once `["ready", pid]` arrives.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};

use crate::bridge::{OneShotListener, TransportError};
use crate::config::{ChannelConfig, DEFAULT_WORKER_NAME, env_millis, env_string};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Process table access.
pub trait ProcessProbe: Send + Sync {
    /// Pids of every process whose name, or executable stem, is `name`.
    fn find(&self, name: &str) -> Vec<u32>;

    /// Best-effort kill. Returns whether a signal was delivered.
    fn kill(&self, pid: u32) -> bool;

    fn any_running(&self, name: &str) -> bool {
        !self.find(name).is_empty()
    }
}

/// [`ProcessProbe`] over the live OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn find(&self, name: &str) -> Vec<u32> {
        let refresh = ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet);
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);
        system
            .processes()
            .iter()
            .filter(|(_, process)| matches_name(process.name(), process.exe(), name))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn kill(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some_and(|process| process.kill())
    }
}

fn strip_exe(name: &str) -> &str {
    let n = name.len();
    match (name.get(..n.saturating_sub(4)), name.get(n.saturating_sub(4)..)) {
        (Some(stem), Some(ext)) if n > 4 && ext.eq_ignore_ascii_case(".exe") => stem,
        _ => name,
    }
}

/// Process name match with any `.exe` suffix ignored.
pub fn matches_name(process_name: &OsStr, exe: Option<&Path>, wanted: &str) -> bool {
    let wanted = strip_exe(wanted);
    if strip_exe(&process_name.to_string_lossy()) == wanted {
        return true;
    }
    exe.and_then(Path::file_stem)
        .is_some_and(|stem| stem.to_string_lossy() == wanted)
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker executable not found at {}", .0.display())]
    BinaryMissing(PathBuf),
    #[error("failed to spawn worker {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker did not become ready: {0}")]
    Handshake(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Process name used for lookups and kills.
    pub worker_name: String,
    pub worker_path: PathBuf,
    pub channel: ChannelConfig,
    pub ready_timeout: Duration,
    /// Extra environment for the spawned worker.
    pub env: Vec<(String, String)>,
}

/// `<dir of current exe>/<name><EXE_SUFFIX>`.
pub fn default_worker_path(worker_name: &str) -> PathBuf {
    let file = format!("{worker_name}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file)))
        .unwrap_or_else(|| PathBuf::from(file))
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            worker_path: default_worker_path(DEFAULT_WORKER_NAME),
            channel: ChannelConfig::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            env: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let worker_name =
            env_string("PIPECALL_WORKER_NAME").unwrap_or_else(|| DEFAULT_WORKER_NAME.to_string());
        let worker_path = env_string("PIPECALL_WORKER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_worker_path(&worker_name));
        Self {
            worker_name,
            worker_path,
            channel: ChannelConfig::from_env(),
            ready_timeout: env_millis("PIPECALL_READY_TIMEOUT_MS").unwrap_or(DEFAULT_READY_TIMEOUT),
            env: Vec::new(),
        }
    }

    pub fn with_worker(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.worker_name = name.into();
        self.worker_path = path.into();
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub struct WorkerSupervisor<P: ProcessProbe = SystemProbe> {
    config: SupervisorConfig,
    probe: P,
    child: Mutex<Option<Child>>,
}

impl WorkerSupervisor<SystemProbe> {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_probe(config, SystemProbe)
    }
}

impl<P: ProcessProbe> WorkerSupervisor<P> {
    pub fn with_probe(config: SupervisorConfig, probe: P) -> Self {
        Self {
            config,
            probe,
            child: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Worker child handle mutex poisoned");
                poisoned.into_inner()
            }
        }
    }

    /// Pid of the worker this supervisor spawned, if it is still alive.
    pub fn owned_pid(&self) -> Option<u32> {
        let mut child = self.child();
        let alive = match child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::info!(%status, "Owned worker exited");
                false
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to poll owned worker");
                false
            }
            None => false,
        };
        if !alive {
            *child = None;
        }
        child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&self) -> bool {
        self.owned_pid().is_some() || self.probe.any_running(&self.config.worker_name)
    }

    /// Start the worker and wait for it to announce itself.
    ///
    /// Failures are logged; use [`try_launch`](Self::try_launch) for the cause.
    pub async fn launch(&self) -> bool {
        match self.try_launch().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to launch worker");
                false
            }
        }
    }

    pub async fn try_launch(&self) -> Result<(), SupervisorError> {
        let path = &self.config.worker_path;
        if !path.is_file() {
            return Err(SupervisorError::BinaryMissing(path.clone()));
        }

        let channel = &self.config.channel;
        let ready = OneShotListener::bind(&channel.response()).await?;

        tracing::info!(path = %path.display(), "Spawning worker");
        let mut child = Command::new(path)
            .env("PIPECALL_ANNOUNCE_READY", "1")
            .env("PIPECALL_WORKER_NAME", &self.config.worker_name)
            .env("PIPECALL_REQUEST_ENDPOINT", &channel.request_endpoint)
            .env("PIPECALL_RESPONSE_ENDPOINT", &channel.response_endpoint)
            .env("PIPECALL_SOCKET_DIR", &channel.socket_dir)
            .env("PIPECALL_MAX_INSTANCES", channel.max_instances.to_string())
            .env("PIPECALL_MAX_LINE_BYTES", channel.max_line_bytes.to_string())
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                path: path.clone(),
                source,
            })?;
        let pid = child.id();

        let failure = match ready.accept_timeout(self.config.ready_timeout).await {
            Ok(Ok(frame)) if frame.is_ready() => None,
            Ok(Ok(frame)) => Some(format!("unexpected frame {frame}")),
            Ok(Err(anomaly)) => Some(anomaly.to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "Failed to kill unready worker");
            }
            return Err(SupervisorError::Handshake(reason));
        }

        tracing::info!(?pid, "Worker ready");
        *self.child() = Some(child);
        Ok(())
    }

    pub async fn ensure_running(&self) -> bool {
        self.is_running() || self.launch().await
    }

    /// Kill the owned worker and every process with the worker's name.
    /// Never fails.
    pub fn terminate(&self) {
        if let Some(mut child) = self.child().take()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(error = %e, "Owned worker already gone");
        }

        for pid in self.probe.find(&self.config.worker_name) {
            if self.probe.kill(pid) {
                tracing::info!(pid, "Killed worker process");
            } else {
                tracing::debug!(pid, "Could not kill worker process");
            }
        }
    }
}
