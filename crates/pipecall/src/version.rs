//! Version information for pipecall.

/// Pipecall version from Cargo.toml
pub const PIPECALL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by a binary at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub pipecall: &'static str,
    /// Which side of the channel this process is.
    pub role: &'static str,
    pub os: &'static str,
    /// Operations this process serves or calls.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verbs: Vec<String>,
}

impl VersionInfo {
    pub fn new(role: &'static str) -> Self {
        Self {
            pipecall: PIPECALL_VERSION,
            role,
            os: std::env::consts::OS,
            verbs: Vec::new(),
        }
    }

    pub fn with_verbs<I, S>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verbs = verbs.into_iter().map(Into::into).collect();
        self
    }
}
