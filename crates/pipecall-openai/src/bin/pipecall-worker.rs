//! Worker process: serves the speech and image verbs until the session
//! application goes away.

use std::sync::Arc;

use anyhow::Context;

use pipecall::logging::init_tracing;
use pipecall::{VersionInfo, Watchdog, WatchdogConfig, WatchdogExit, WorkerConfig, run_worker};
use pipecall_openai::{ImageDefaults, OpenAiClient, OpenAiConfig, worker_dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = WorkerConfig::from_env();
    let api = OpenAiClient::new(OpenAiConfig::from_env()).context("failed to build API client")?;
    let dispatcher = worker_dispatcher(Arc::new(api), ImageDefaults::from_env());

    let info = VersionInfo::new("worker").with_verbs(dispatcher.verbs());
    tracing::info!(
        version = %serde_json::to_string(&info)?,
        request = %config.channel.request(),
        pid = std::process::id(),
        "Worker starting"
    );

    let watchdog = Watchdog::new(WatchdogConfig::from_env());
    tokio::select! {
        () = run_worker(dispatcher, config) => {
            tracing::warn!("Worker loop returned");
        }
        exit = watchdog.run() => match exit {
            WatchdogExit::SessionGone => {
                tracing::info!("Session ended, worker exiting");
            }
        },
    }
    Ok(())
}
