//! HTTP client for the hosted speech and image API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use pipecall::PIPECALL_VERSION;
use pipecall::config::env_string;

use crate::credential::Credential;
use crate::params::ImageSize;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const WHISPER_MODEL: &str = "whisper-1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Read `path`, uploading under its own file name.
    pub async fn read(path: &Path) -> Result<Self, ApiError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Self::read_as(path, name).await
    }

    /// Read `path`, uploading under `file_name`.
    pub async fn read_as(path: &Path, file_name: impl Into<String>) -> Result<Self, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(file_name, bytes))
    }

    fn into_part(self) -> Part {
        Part::bytes(self.bytes).file_name(self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEdit {
    pub prompt: String,
    pub image: Upload,
    pub mask: Option<Upload>,
    pub count: u8,
    pub size: ImageSize,
}

/// The remote operations the worker handlers need.
#[async_trait::async_trait]
pub trait OpenAiApi: Send + Sync + 'static {
    async fn transcribe(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError>;

    /// Speech in any language to English text.
    async fn translate(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError>;

    async fn generate_images(
        &self,
        credential: &Credential,
        prompt: &str,
        count: u8,
        size: ImageSize,
    ) -> Result<Vec<String>, ApiError>;

    async fn image_variations(
        &self,
        credential: &Credential,
        image: Upload,
        count: u8,
        size: ImageSize,
    ) -> Result<Vec<String>, ApiError>;

    async fn edit_images(
        &self,
        credential: &Credential,
        edit: ImageEdit,
    ) -> Result<Vec<String>, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

impl OpenAiConfig {
    /// Reads `OPENAI_BASE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_string("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(serde::Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    n: u8,
    size: &'static str,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("pipecall/{PIPECALL_VERSION}"))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn post(&self, credential: &Credential, endpoint: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .bearer_auth(&credential.api_key);
        if let Some(org) = &credential.organization {
            request = request.header("OpenAI-Organization", org);
        }
        request
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        tracing::debug!(endpoint, status = status.as_u16(), bytes = body.len(), "API response");

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|e| e.error.message)
                .ok()
                .filter(|m| !m.is_empty())
                .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn audio(
        &self,
        credential: &Credential,
        endpoint: &str,
        audio: Upload,
    ) -> Result<String, ApiError> {
        let form = Form::new()
            .part("file", audio.into_part())
            .text("model", WHISPER_MODEL);
        let response: TextResponse = self
            .send(endpoint, self.post(credential, endpoint).multipart(form))
            .await?;
        Ok(response.text)
    }

    async fn images(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<String>, ApiError> {
        let response: ImageResponse = self.send(endpoint, request).await?;
        Ok(response.data.into_iter().filter_map(|d| d.url).collect())
    }
}

#[async_trait::async_trait]
impl OpenAiApi for OpenAiClient {
    async fn transcribe(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError> {
        self.audio(credential, "/audio/transcriptions", audio).await
    }

    async fn translate(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError> {
        self.audio(credential, "/audio/translations", audio).await
    }

    async fn generate_images(
        &self,
        credential: &Credential,
        prompt: &str,
        count: u8,
        size: ImageSize,
    ) -> Result<Vec<String>, ApiError> {
        let endpoint = "/images/generations";
        let body = GenerateBody {
            prompt,
            n: count,
            size: size.as_str(),
        };
        self.images(endpoint, self.post(credential, endpoint).json(&body))
            .await
    }

    async fn image_variations(
        &self,
        credential: &Credential,
        image: Upload,
        count: u8,
        size: ImageSize,
    ) -> Result<Vec<String>, ApiError> {
        let endpoint = "/images/variations";
        let form = Form::new()
            .part("image", image.into_part())
            .text("n", count.to_string())
            .text("size", size.as_str());
        self.images(endpoint, self.post(credential, endpoint).multipart(form))
            .await
    }

    async fn edit_images(
        &self,
        credential: &Credential,
        edit: ImageEdit,
    ) -> Result<Vec<String>, ApiError> {
        let endpoint = "/images/edits";
        let mut form = Form::new()
            .part("image", edit.image.into_part())
            .text("prompt", edit.prompt)
            .text("n", edit.count.to_string())
            .text("size", edit.size.as_str());
        if let Some(mask) = edit.mask {
            form = form.part("mask", mask.into_part());
        }
        self.images(endpoint, self.post(credential, endpoint).multipart(form))
            .await
    }
}
