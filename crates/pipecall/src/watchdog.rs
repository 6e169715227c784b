//! Session watchdog.
//!
//! The worker has no reason to outlive the application that owns the
//! session. The watchdog polls the process table and resolves once no
//! process with the session name is left.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{env_millis, env_string};
use crate::supervisor::{ProcessProbe, SystemProbe};

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// No session process was found on the last tick.
    SessionGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Process name of the session owner. `None` disables the watchdog.
    pub session_process: Option<String>,
    pub interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            session_process: None,
            interval: DEFAULT_WATCHDOG_INTERVAL,
        }
    }
}

impl WatchdogConfig {
    pub fn from_env() -> Self {
        Self {
            session_process: env_string("PIPECALL_SESSION_PROCESS"),
            interval: env_millis("PIPECALL_WATCHDOG_INTERVAL_MS")
                .unwrap_or(DEFAULT_WATCHDOG_INTERVAL),
        }
    }

    pub fn with_session_process(mut self, name: impl Into<String>) -> Self {
        self.session_process = Some(name.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

pub struct Watchdog<P: ProcessProbe = SystemProbe> {
    config: WatchdogConfig,
    probe: Arc<P>,
}

impl Watchdog<SystemProbe> {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe))
    }
}

impl<P: ProcessProbe + 'static> Watchdog<P> {
    pub fn with_probe(config: WatchdogConfig, probe: Arc<P>) -> Self {
        Self { config, probe }
    }

    /// Resolves when the session process is gone; never resolves when no
    /// session process is configured.
    pub async fn run(self) -> WatchdogExit {
        let Some(name) = self.config.session_process else {
            tracing::info!("No session process configured, watchdog disabled");
            return std::future::pending().await;
        };

        tracing::info!(
            session = %name,
            interval_ms = self.config.interval.as_millis() as u64,
            "Watchdog started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; give the session a full
        // interval before the first check.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let probe = Arc::clone(&self.probe);
            let lookup = name.clone();
            // Scanning the process table blocks.
            let alive = match tokio::task::spawn_blocking(move || probe.any_running(&lookup)).await {
                Ok(alive) => alive,
                Err(e) => {
                    tracing::warn!(error = %e, "Session lookup failed, assuming alive");
                    true
                }
            };
            if !alive {
                tracing::info!(session = %name, "Session process gone");
                return WatchdogExit::SessionGone;
            }
            tracing::trace!(session = %name, "Session process alive");
        }
    }
}
