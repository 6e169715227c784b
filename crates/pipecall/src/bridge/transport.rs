//! Endpoint transport for host-worker calls.
//!
//! Platform-specific implementations:
//! - **Unix**: filesystem sockets at `{socket_dir}/{name}.sock`
//! - **Windows**: named pipes at `\\.\pipe\{name}`
//!
//! Both directions are one-shot: a listener accepts a single peer, reads a
//! single frame and is dropped. A client connects, writes one frame and
//! closes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{DEFAULT_MAX_LINE_BYTES, FrameCodec};
use super::frame::{Frame, ProtocolAnomaly};
use super::lease::{EndpointLease, LeaseError};

/// Outcome of reading one frame: the frame, or the reason nothing usable
/// arrived.
pub type Received = Result<Frame, ProtocolAnomaly>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {name} is already held by another listener")]
    EndpointBusy { name: String },
    #[error("failed to bind endpoint {name}: {source}")]
    Bind {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to endpoint {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error on endpoint {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {after:?} waiting on endpoint {name}")]
    Timeout { name: String, after: Duration },
}

impl TransportError {
    fn bind(name: &str, source: io::Error) -> Self {
        Self::Bind {
            name: name.to_string(),
            source,
        }
    }

    fn connect(name: &str, source: io::Error) -> Self {
        Self::Connect {
            name: name.to_string(),
            source,
        }
    }

    fn io(name: &str, source: io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            source,
        }
    }
}

/// A named endpoint one side listens on and the other side connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    socket_dir: PathBuf,
    max_instances: usize,
    max_line_bytes: usize,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            socket_dir: socket_dir.into(),
            max_instances: 1,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Upper bound on concurrently open pipe instances (Windows only; Unix
    /// listeners are always exclusive).
    pub fn with_max_instances(mut self, n: usize) -> Self {
        self.max_instances = n.max(1);
        self
    }

    pub fn with_max_line_bytes(mut self, n: usize) -> Self {
        self.max_line_bytes = n;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding socket files and lease lock files.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.name))
    }

    pub fn pipe_name(&self) -> String {
        format!(r"\\.\pipe\{}", self.name)
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_line_bytes(self.max_line_bytes)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Server side of one exchange: bound on creation, consumed by accept.
pub struct OneShotListener {
    endpoint: Endpoint,
    inner: platform::Listener,
    _lease: EndpointLease,
}

impl OneShotListener {
    /// Take the endpoint lease and bind the listener.
    ///
    /// Fails with [`TransportError::EndpointBusy`] while another listener,
    /// in this process or another, holds the same name.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let lease = match EndpointLease::acquire(endpoint.name(), endpoint.socket_dir()) {
            Ok(lease) => lease,
            Err(LeaseError::Held(name)) => return Err(TransportError::EndpointBusy { name }),
            Err(LeaseError::LockFile { name, source }) => {
                return Err(TransportError::Bind { name, source });
            }
        };

        let inner = platform::Listener::bind(endpoint)?;
        tracing::trace!(endpoint = %endpoint, "Listener bound");

        Ok(Self {
            endpoint: endpoint.clone(),
            inner,
            _lease: lease,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait (without limit) for one peer and read one frame from it.
    pub async fn accept(self) -> Result<Received, TransportError> {
        let Self {
            endpoint,
            inner,
            _lease,
        } = self;
        tracing::trace!(endpoint = %endpoint, "Waiting for peer");
        let stream = inner
            .accept()
            .await
            .map_err(|e| TransportError::io(endpoint.name(), e))?;
        tracing::trace!(endpoint = %endpoint, "Peer connected");
        Ok(read_frame(stream, endpoint.codec()).await)
    }

    /// Like [`accept`](Self::accept) but gives up after `timeout`.
    pub async fn accept_timeout(self, timeout: Duration) -> Result<Received, TransportError> {
        let name = self.endpoint.name().to_string();
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                name,
                after: timeout,
            }),
        }
    }
}

/// Read exactly one frame from a connected stream.
pub async fn read_frame<S>(stream: S, codec: FrameCodec) -> Received
where
    S: AsyncRead + Unpin,
{
    let mut reader = FramedRead::new(stream, codec);
    match reader.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(ProtocolAnomaly::dropped(e.to_string())),
        None => Err(ProtocolAnomaly::dropped("peer closed without sending a frame")),
    }
}

/// Write exactly one frame to a connected stream and close the write side.
pub async fn write_frame<S>(stream: S, codec: FrameCodec, frame: &Frame) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut writer = FramedWrite::new(stream, codec);
    writer.send(frame).await?;
    let mut stream = writer.into_inner();
    stream.shutdown().await
}

/// Connect to `endpoint` as a client, send `frame`, close.
///
/// Fails with [`TransportError::Connect`] when nobody is listening.
pub async fn send_frame(endpoint: &Endpoint, frame: &Frame) -> Result<(), TransportError> {
    let stream = platform::connect(endpoint)
        .await
        .map_err(|e| TransportError::connect(endpoint.name(), e))?;
    write_frame(stream, endpoint.codec(), frame)
        .await
        .map_err(|e| TransportError::io(endpoint.name(), e))?;
    tracing::trace!(endpoint = %endpoint, verb = %frame.verb(), "Frame sent");
    Ok(())
}

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Like [`send_frame`] but keeps retrying the connect for up to `patience`
/// while nobody is listening yet.
///
/// The peer rebinds its listener after every exchange, so a client that
/// sends right after receiving a reply can arrive a moment too early.
pub async fn send_frame_patient(
    endpoint: &Endpoint,
    frame: &Frame,
    patience: Duration,
) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + patience;
    loop {
        match send_frame(endpoint, frame).await {
            Err(TransportError::Connect { source, .. })
                if is_not_listening(&source) && tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            other => return other,
        }
    }
}

fn is_not_listening(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(unix)]
mod platform {
    use std::io;

    use tokio::net::{UnixListener, UnixStream};

    use super::{Endpoint, TransportError};

    pub struct Listener {
        listener: UnixListener,
        path: std::path::PathBuf,
    }

    impl Listener {
        /// Caller holds the endpoint lease, so any socket file still present
        /// belongs to a listener that is gone.
        pub fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
            let path = endpoint.socket_path();
            if path.exists() {
                tracing::debug!(path = %path.display(), "Removing stale socket file");
                std::fs::remove_file(&path)
                    .map_err(|e| TransportError::bind(endpoint.name(), e))?;
            }
            let listener =
                UnixListener::bind(&path).map_err(|e| TransportError::bind(endpoint.name(), e))?;
            Ok(Self { listener, path })
        }

        pub async fn accept(&self) -> io::Result<UnixStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.path)
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }

    pub async fn connect(endpoint: &Endpoint) -> io::Result<UnixStream> {
        UnixStream::connect(endpoint.socket_path()).await
    }
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::time::Duration;

    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    use super::{Endpoint, TransportError};

    const ERROR_PIPE_BUSY: i32 = 231;

    pub struct Listener {
        server: NamedPipeServer,
    }

    impl Listener {
        pub fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
            let server = ServerOptions::new()
                .first_pipe_instance(endpoint.max_instances() == 1)
                .max_instances(endpoint.max_instances())
                .access_outbound(false)
                .create(endpoint.pipe_name())
                .map_err(|e| TransportError::bind(endpoint.name(), e))?;
            Ok(Self { server })
        }

        pub async fn accept(self) -> io::Result<NamedPipeServer> {
            self.server.connect().await?;
            Ok(self.server)
        }
    }

    pub async fn connect(endpoint: &Endpoint) -> io::Result<NamedPipeClient> {
        let name = endpoint.pipe_name();
        loop {
            match ClientOptions::new().read(false).open(&name) {
                Ok(client) => return Ok(client),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
