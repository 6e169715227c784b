//! Channel configuration and environment helpers.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bridge::Endpoint;
use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;

/// Host → worker endpoint name.
pub const DEFAULT_REQUEST_ENDPOINT: &str = "pipecall_worker";
/// Worker → host endpoint name.
pub const DEFAULT_RESPONSE_ENDPOINT: &str = "pipecall_host";
/// Process name of the worker; also the sentinel marker.
pub const DEFAULT_WORKER_NAME: &str = "pipecall-worker";

/// Read a non-empty environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, ignoring (and logging) unparsable values.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

pub fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

pub fn env_flag(key: &str) -> bool {
    matches!(
        env_string(key).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// The pair of endpoints both sides agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub request_endpoint: String,
    pub response_endpoint: String,
    /// Socket files (Unix) and lease lock files live here.
    pub socket_dir: PathBuf,
    pub max_instances: usize,
    pub max_line_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_endpoint: DEFAULT_REQUEST_ENDPOINT.to_string(),
            response_endpoint: DEFAULT_RESPONSE_ENDPOINT.to_string(),
            socket_dir: std::env::temp_dir().join("pipecall"),
            max_instances: 1,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(name) = env_string("PIPECALL_REQUEST_ENDPOINT") {
            config.request_endpoint = name;
        }
        if let Some(name) = env_string("PIPECALL_RESPONSE_ENDPOINT") {
            config.response_endpoint = name;
        }
        if let Some(dir) = env_string("PIPECALL_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(n) = env_parse("PIPECALL_MAX_INSTANCES") {
            config.max_instances = n;
        }
        if let Some(n) = env_parse("PIPECALL_MAX_LINE_BYTES") {
            config.max_line_bytes = n;
        }
        config
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_endpoints(
        mut self,
        request: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.request_endpoint = request.into();
        self.response_endpoint = response.into();
        self
    }

    pub fn with_max_instances(mut self, n: usize) -> Self {
        self.max_instances = n;
        self
    }

    fn endpoint(&self, name: &str) -> Endpoint {
        Endpoint::new(name, &self.socket_dir)
            .with_max_instances(self.max_instances)
            .with_max_line_bytes(self.max_line_bytes)
    }

    /// Endpoint the worker listens on for requests.
    pub fn request(&self) -> Endpoint {
        self.endpoint(&self.request_endpoint)
    }

    /// Endpoint the host listens on for responses and ready announcements.
    pub fn response(&self) -> Endpoint {
        self.endpoint(&self.response_endpoint)
    }
}
