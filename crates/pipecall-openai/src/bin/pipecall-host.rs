//! Host command line: sends one request to the worker (launching it when
//! needed) and prints the outcome as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use pipecall::logging::init_tracing;
use pipecall::{HostClient, HostConfig, HostSession, VersionInfo};
use pipecall_openai::{ALL_VERBS, Credential, ImageSize, RequestBuilder, host_continuations};

/// Call speech and image operations on a pipecall worker
#[derive(Parser, Debug)]
#[command(name = "pipecall-host", version, about, long_about = None)]
struct Cli {
    /// API key sent with every request
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Organization id appended to the credential
    #[arg(long, env = "OPENAI_ORGANIZATION", global = true)]
    organization: Option<String>,

    /// Give up waiting for a reply after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ImageOptions {
    /// Number of images (1 to 10)
    #[arg(long, default_value_t = 1)]
    count: u8,

    /// 256x256, 512x512 or 1024x1024
    #[arg(long, default_value_t = ImageSize::default())]
    size: ImageSize,

    /// Upload the file bytes under a generic name
    #[arg(long)]
    bytes: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe an audio file
    Transcribe { audio: PathBuf },
    /// Translate speech in an audio file to English text
    Translate { audio: PathBuf },
    /// Generate images from a prompt
    Generate {
        prompt: String,
        #[command(flatten)]
        image: ImageOptions,
    },
    /// Create variations of an image
    Variation {
        path: PathBuf,
        #[command(flatten)]
        image: ImageOptions,
    },
    /// Edit an image following a prompt
    Edit {
        prompt: String,
        path: PathBuf,
        /// Mask marking the area to edit
        #[arg(long)]
        mask: Option<PathBuf>,
        #[command(flatten)]
        image: ImageOptions,
    },
    /// Start the worker unless it is already running
    Ensure,
    /// Kill every running worker
    Terminate,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let info = VersionInfo::new("host").with_verbs(ALL_VERBS);
    tracing::debug!(version = %serde_json::to_string(&info)?, "Host starting");

    let mut config = HostConfig::from_env();
    if let Some(ms) = cli.timeout_ms {
        config = config.with_call_timeout(Some(Duration::from_millis(ms)));
    }
    let session = HostSession::new(HostClient::new(config), host_continuations());

    let requests = cli.api_key.map(|key| {
        RequestBuilder::new(
            Credential::new(key).with_organization(cli.organization.unwrap_or_default()),
        )
    });
    let requests = || {
        requests
            .as_ref()
            .context("no API key given (--api-key or OPENAI_API_KEY)")
    };

    let request = match cli.command {
        Command::Ensure => {
            let running = session.ensure_worker().await;
            println!("{}", serde_json::json!({ "running": running }));
            return Ok(if running {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::Terminate => {
            session.shutdown();
            return Ok(ExitCode::SUCCESS);
        }
        Command::Transcribe { audio } => requests()?.transcribe(&audio).await?,
        Command::Translate { audio } => requests()?.translate(&audio).await?,
        Command::Generate { prompt, image } => {
            requests()?.generate(&prompt, image.count, image.size)?
        }
        Command::Variation { path, image } => {
            requests()?.variation(&path, image.count, image.size, image.bytes)?
        }
        Command::Edit {
            prompt,
            path,
            mask,
            image,
        } => requests()?.edit(
            &prompt,
            &path,
            mask.as_deref(),
            image.count,
            image.size,
            image.bytes,
        )?,
    };

    let verb = request.verb().to_string();
    let outcome = session
        .invoke(&request)
        .await
        .with_context(|| format!("{verb} call failed"))?
        .with_context(|| format!("no continuation for {verb}"))?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
