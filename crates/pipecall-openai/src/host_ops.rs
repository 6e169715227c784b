//! Host-side request builders and reply continuations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pipecall::{Continuations, Frame, FrameError};

use crate::credential::Credential;
use crate::handlers::{
    IMAGE_EDIT, IMAGE_EDIT_BYTES, IMAGE_GENERATE, IMAGE_VARIATION, IMAGE_VARIATION_BYTES,
    TRANSCRIBE, TRANSLATE,
};
use crate::params::ImageSize;

/// How long an audio request waits for its recording to land on disk.
pub const AUDIO_WAIT: Duration = Duration::from_secs(5);
const AUDIO_POLL: Duration = Duration::from_millis(100);

/// Verb, credential and at least one argument.
const MIN_REQUEST_LEN: usize = 3;

/// Separator for URL lists handed to the host application.
pub const URL_SEPARATOR: &str = ";";

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request needs at least {MIN_REQUEST_LEN} elements, got {0}")]
    TooShort(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Dictation audio file not found: {}", .0.display())]
    AudioMissing(PathBuf),
}

/// Builds request frames carrying one credential.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    credential: Credential,
    audio_wait: Duration,
}

impl RequestBuilder {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            audio_wait: AUDIO_WAIT,
        }
    }

    pub fn with_audio_wait(mut self, wait: Duration) -> Self {
        self.audio_wait = wait;
        self
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// `[verb, credential, args..]`. Empty elements are rejected, not skipped.
    pub fn build<I, S>(&self, verb: &str, args: I) -> Result<Frame, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut elements = vec![verb.to_string(), self.credential.to_wire()];
        elements.extend(args.into_iter().map(Into::into));
        if elements.len() < MIN_REQUEST_LEN {
            return Err(RequestError::TooShort(elements.len()));
        }
        Ok(Frame::new(elements)?)
    }

    pub async fn transcribe(&self, audio: &Path) -> Result<Frame, RequestError> {
        self.audio(TRANSCRIBE, audio).await
    }

    pub async fn translate(&self, audio: &Path) -> Result<Frame, RequestError> {
        self.audio(TRANSLATE, audio).await
    }

    async fn audio(&self, verb: &str, audio: &Path) -> Result<Frame, RequestError> {
        wait_for_file(audio, self.audio_wait).await?;
        self.build(verb, [audio.to_string_lossy()])
    }

    pub fn generate(&self, prompt: &str, count: u8, size: ImageSize) -> Result<Frame, RequestError> {
        self.build(
            IMAGE_GENERATE,
            [prompt.to_string(), count.to_string(), size.to_string()],
        )
    }

    /// `bytes` selects the variant that uploads under a generic file name.
    pub fn variation(
        &self,
        image: &Path,
        count: u8,
        size: ImageSize,
        bytes: bool,
    ) -> Result<Frame, RequestError> {
        let verb = if bytes {
            IMAGE_VARIATION_BYTES
        } else {
            IMAGE_VARIATION
        };
        self.build(
            verb,
            [
                image.to_string_lossy().into_owned(),
                count.to_string(),
                size.to_string(),
            ],
        )
    }

    pub fn edit(
        &self,
        prompt: &str,
        image: &Path,
        mask: Option<&Path>,
        count: u8,
        size: ImageSize,
        bytes: bool,
    ) -> Result<Frame, RequestError> {
        let verb = if bytes { IMAGE_EDIT_BYTES } else { IMAGE_EDIT };
        let mut args = vec![
            prompt.to_string(),
            image.to_string_lossy().into_owned(),
            count.to_string(),
            size.to_string(),
        ];
        if let Some(mask) = mask {
            args.push(mask.to_string_lossy().into_owned());
        }
        self.build(verb, args)
    }
}

/// Poll for `path` until it exists or `wait` runs out.
async fn wait_for_file(path: &Path, wait: Duration) -> Result<(), RequestError> {
    let poll = async {
        loop {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return;
            }
            tokio::time::sleep(AUDIO_POLL).await;
        }
    };
    tokio::time::timeout(wait, poll).await.map_err(|_| {
        tracing::warn!(path = %path.display(), "Audio file did not appear in time");
        RequestError::AudioMissing(path.to_path_buf())
    })
}

/// Text replies carry the text in element 0.
pub fn text_reply(reply: &Frame) -> String {
    reply.verb().to_string()
}

pub fn url_reply(reply: &Frame) -> String {
    reply.elements().join(URL_SEPARATOR)
}

/// Continuation table for every verb served by the worker.
pub fn host_continuations() -> Continuations {
    Continuations::new()
        .with(TRANSCRIBE, text_reply)
        .with(TRANSLATE, text_reply)
        .with(IMAGE_GENERATE, url_reply)
        .with(IMAGE_VARIATION, url_reply)
        .with(IMAGE_VARIATION_BYTES, url_reply)
        .with(IMAGE_EDIT, url_reply)
        .with(IMAGE_EDIT_BYTES, url_reply)
}
