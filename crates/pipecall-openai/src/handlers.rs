//! Worker-side handlers for the speech and image verbs.
//!
//! | verb                    | arity | arguments after the credential          |
//! |-------------------------|-------|-----------------------------------------|
//! | `transcribe`            | 3     | audio path                              |
//! | `translate`             | 3     | audio path                              |
//! | `image.generate`        | ≥3    | prompt, count?, size?                   |
//! | `image.variation[.bytes]` | ≥3  | image path, count?, size?               |
//! | `image.edit[.bytes]`    | ≥4    | prompt, image path, count?, size?, mask? |
//!
//! Frames of any other arity are declined and get no reply.

use std::path::Path;
use std::sync::Arc;

use pipecall::bridge::frame::fold_line_breaks;
use pipecall::{Dispatcher, Frame, Handler, HandlerError};

use crate::client::{ApiError, ImageEdit, OpenAiApi, Upload};
use crate::credential::Credential;
use crate::params::ImageDefaults;

pub const TRANSCRIBE: &str = "transcribe";
pub const TRANSLATE: &str = "translate";
pub const IMAGE_GENERATE: &str = "image.generate";
pub const IMAGE_VARIATION: &str = "image.variation";
pub const IMAGE_VARIATION_BYTES: &str = "image.variation.bytes";
pub const IMAGE_EDIT: &str = "image.edit";
pub const IMAGE_EDIT_BYTES: &str = "image.edit.bytes";

pub const ALL_VERBS: [&str; 7] = [
    TRANSCRIBE,
    TRANSLATE,
    IMAGE_GENERATE,
    IMAGE_VARIATION,
    IMAGE_VARIATION_BYTES,
    IMAGE_EDIT,
    IMAGE_EDIT_BYTES,
];

/// Upload names used by the `.bytes` variants.
const GENERIC_IMAGE_NAME: &str = "image.png";
const GENERIC_MASK_NAME: &str = "mask.png";

const SUCCESS_TAG: &str = "success";

fn credential(frame: &Frame) -> Credential {
    Credential::parse(frame.get(1).unwrap_or_default())
}

/// Non-blank argument at `index`.
fn arg(frame: &Frame, index: usize) -> Option<&str> {
    frame.get(index).filter(|s| !s.trim().is_empty())
}

fn reply<I, S>(elements: I) -> Result<Frame, String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Frame::new(elements).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioTask {
    Transcription,
    Translation,
}

impl AudioTask {
    fn label(&self) -> &'static str {
        match self {
            AudioTask::Transcription => "Transcription",
            AudioTask::Translation => "Translation",
        }
    }
}

pub struct AudioHandler<A: OpenAiApi> {
    api: Arc<A>,
    task: AudioTask,
}

impl<A: OpenAiApi> AudioHandler<A> {
    pub fn transcribe(api: Arc<A>) -> Self {
        Self {
            api,
            task: AudioTask::Transcription,
        }
    }

    pub fn translate(api: Arc<A>) -> Self {
        Self {
            api,
            task: AudioTask::Translation,
        }
    }

    async fn run(&self, frame: &Frame) -> Result<Frame, String> {
        let credential = credential(frame);
        let path = arg(frame, 2).ok_or("audio file path is empty")?;
        let audio = Upload::read(Path::new(path))
            .await
            .map_err(|e| e.to_string())?;

        let text = match self.task {
            AudioTask::Transcription => self.api.transcribe(&credential, audio).await,
            AudioTask::Translation => self.api.translate(&credential, audio).await,
        }
        .map_err(|e| e.to_string())?;

        let text = fold_line_breaks(text.trim());
        if text.is_empty() {
            return Err(format!(
                "{} Error - results text is null or empty!",
                self.task.label()
            ));
        }

        match self.task {
            AudioTask::Transcription => reply([text]),
            AudioTask::Translation => reply([text, SUCCESS_TAG.to_string()]),
        }
    }
}

#[async_trait::async_trait]
impl<A: OpenAiApi> Handler for AudioHandler<A> {
    fn accepts(&self, frame: &Frame) -> bool {
        frame.len() == 3
    }

    async fn call(&self, frame: &Frame) -> Result<Frame, HandlerError> {
        self.run(frame).await.map_err(|message| {
            HandlerError::new(format!("Whisper {} Error: {message}", self.task.label()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageTask {
    Generate,
    Variation { bytes: bool },
    Edit { bytes: bool },
}

impl ImageTask {
    fn label(&self) -> &'static str {
        match self {
            ImageTask::Generate => "Image Generation",
            ImageTask::Variation { .. } => "Image Variation",
            ImageTask::Edit { .. } => "Image Editing",
        }
    }

    fn min_arity(&self) -> usize {
        match self {
            ImageTask::Edit { .. } => 4,
            _ => 3,
        }
    }
}

pub struct ImageHandler<A: OpenAiApi> {
    api: Arc<A>,
    task: ImageTask,
    defaults: ImageDefaults,
}

impl<A: OpenAiApi> ImageHandler<A> {
    fn new(api: Arc<A>, task: ImageTask, defaults: ImageDefaults) -> Self {
        Self {
            api,
            task,
            defaults,
        }
    }

    pub fn generate(api: Arc<A>, defaults: ImageDefaults) -> Self {
        Self::new(api, ImageTask::Generate, defaults)
    }

    pub fn variation(api: Arc<A>, defaults: ImageDefaults, bytes: bool) -> Self {
        Self::new(api, ImageTask::Variation { bytes }, defaults)
    }

    pub fn edit(api: Arc<A>, defaults: ImageDefaults, bytes: bool) -> Self {
        Self::new(api, ImageTask::Edit { bytes }, defaults)
    }

    async fn upload(path: &str, bytes: bool, generic_name: &str) -> Result<Upload, ApiError> {
        if bytes {
            Upload::read_as(Path::new(path), generic_name).await
        } else {
            Upload::read(Path::new(path)).await
        }
    }

    async fn run(&self, frame: &Frame) -> Result<Vec<String>, String> {
        let credential = credential(frame);
        let urls = match self.task {
            ImageTask::Generate => {
                let prompt = arg(frame, 2).ok_or("Image User Prompt is null or empty!")?;
                let count = self.defaults.count(frame.get(3));
                let size = self.defaults.size(frame.get(4)).map_err(|e| e.to_string())?;
                self.api
                    .generate_images(&credential, prompt, count, size)
                    .await
            }
            ImageTask::Variation { bytes } => {
                let path = arg(frame, 2).ok_or("File Path to Image is null or empty!")?;
                let count = self.defaults.count(frame.get(3));
                let size = self.defaults.size(frame.get(4)).map_err(|e| e.to_string())?;
                let image = Self::upload(path, bytes, GENERIC_IMAGE_NAME)
                    .await
                    .map_err(|e| e.to_string())?;
                self.api
                    .image_variations(&credential, image, count, size)
                    .await
            }
            ImageTask::Edit { bytes } => {
                let prompt = arg(frame, 2).ok_or("Image User Prompt is null or empty!")?;
                let path = arg(frame, 3).ok_or("File Path to Image is null or empty!")?;
                let count = self.defaults.count(frame.get(4));
                let size = self.defaults.size(frame.get(5)).map_err(|e| e.to_string())?;
                let image = Self::upload(path, bytes, GENERIC_IMAGE_NAME)
                    .await
                    .map_err(|e| e.to_string())?;
                let mask = match arg(frame, 6) {
                    Some(mask) => Some(
                        Self::upload(mask, bytes, GENERIC_MASK_NAME)
                            .await
                            .map_err(|e| e.to_string())?,
                    ),
                    None => None,
                };
                let edit = ImageEdit {
                    prompt: prompt.to_string(),
                    image,
                    mask,
                    count,
                    size,
                };
                self.api.edit_images(&credential, edit).await
            }
        }
        .map_err(|e| e.to_string())?;

        if urls.is_empty() {
            return Err("no images returned".to_string());
        }
        Ok(urls)
    }
}

#[async_trait::async_trait]
impl<A: OpenAiApi> Handler for ImageHandler<A> {
    fn accepts(&self, frame: &Frame) -> bool {
        frame.len() >= self.task.min_arity()
    }

    async fn call(&self, frame: &Frame) -> Result<Frame, HandlerError> {
        let label = self.task.label();
        let failed = |message: String| {
            HandlerError::new(format!("Dall-E Exception: {label} Error: {message}"))
        };
        let urls = self.run(frame).await.map_err(failed)?;
        reply(urls).map_err(failed)
    }
}

/// Dispatch table with every speech and image verb.
pub fn worker_dispatcher<A: OpenAiApi>(api: Arc<A>, defaults: ImageDefaults) -> Dispatcher {
    Dispatcher::new()
        .with_handler(TRANSCRIBE, AudioHandler::transcribe(Arc::clone(&api)))
        .with_handler(TRANSLATE, AudioHandler::translate(Arc::clone(&api)))
        .with_handler(IMAGE_GENERATE, ImageHandler::generate(Arc::clone(&api), defaults))
        .with_handler(
            IMAGE_VARIATION,
            ImageHandler::variation(Arc::clone(&api), defaults, false),
        )
        .with_handler(
            IMAGE_VARIATION_BYTES,
            ImageHandler::variation(Arc::clone(&api), defaults, true),
        )
        .with_handler(IMAGE_EDIT, ImageHandler::edit(Arc::clone(&api), defaults, false))
        .with_handler(IMAGE_EDIT_BYTES, ImageHandler::edit(api, defaults, true))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::params::ImageSize;

    /// What the fake API was asked to do.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        Audio {
            credential: Credential,
            file_name: String,
        },
        Generate {
            prompt: String,
            count: u8,
            size: ImageSize,
        },
        Variation {
            file_name: String,
            count: u8,
            size: ImageSize,
        },
        Edit {
            prompt: String,
            image: String,
            mask: Option<String>,
            count: u8,
            size: ImageSize,
        },
    }

    #[derive(Default)]
    pub struct FakeApi {
        pub calls: Mutex<Vec<Recorded>>,
        /// Text returned by the audio endpoints.
        pub text: Mutex<String>,
        /// When set, every call fails with this message.
        pub fail_with: Mutex<Option<String>>,
    }

    impl FakeApi {
        pub fn with_text(text: &str) -> Self {
            let api = Self::default();
            *api.text.lock().unwrap() = text.to_string();
            api
        }

        pub fn failing(message: &str) -> Self {
            let api = Self::default();
            *api.fail_with.lock().unwrap() = Some(message.to_string());
            api
        }

        pub fn calls(&self) -> Vec<Recorded> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome<T>(&self, call: Recorded, ok: T) -> Result<T, ApiError> {
            self.calls.lock().unwrap().push(call);
            match self.fail_with.lock().unwrap().clone() {
                Some(message) => Err(ApiError::Status {
                    status: 400,
                    message,
                }),
                None => Ok(ok),
            }
        }

        fn urls(count: u8) -> Vec<String> {
            (1..=count).map(|i| format!("https://img.test/{i}.png")).collect()
        }
    }

    #[async_trait::async_trait]
    impl OpenAiApi for FakeApi {
        async fn transcribe(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError> {
            let text = self.text.lock().unwrap().clone();
            self.outcome(
                Recorded::Audio {
                    credential: credential.clone(),
                    file_name: audio.file_name,
                },
                text,
            )
        }

        async fn translate(&self, credential: &Credential, audio: Upload) -> Result<String, ApiError> {
            self.transcribe(credential, audio).await
        }

        async fn generate_images(
            &self,
            _credential: &Credential,
            prompt: &str,
            count: u8,
            size: ImageSize,
        ) -> Result<Vec<String>, ApiError> {
            self.outcome(
                Recorded::Generate {
                    prompt: prompt.to_string(),
                    count,
                    size,
                },
                Self::urls(count),
            )
        }

        async fn image_variations(
            &self,
            _credential: &Credential,
            image: Upload,
            count: u8,
            size: ImageSize,
        ) -> Result<Vec<String>, ApiError> {
            self.outcome(
                Recorded::Variation {
                    file_name: image.file_name,
                    count,
                    size,
                },
                Self::urls(count),
            )
        }

        async fn edit_images(
            &self,
            _credential: &Credential,
            edit: ImageEdit,
        ) -> Result<Vec<String>, ApiError> {
            let count = edit.count;
            self.outcome(
                Recorded::Edit {
                    prompt: edit.prompt,
                    image: edit.image.file_name,
                    mask: edit.mask.map(|m| m.file_name),
                    count,
                    size: edit.size,
                },
                Self::urls(count),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use pipecall::{Dispatch, ERROR_TAG};

    use super::testing::{FakeApi, Recorded};
    use super::*;
    use crate::params::ImageSize;

    struct Files {
        dir: tempfile::TempDir,
    }

    impl Files {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn touch(&self, name: &str) -> String {
            let path = self.dir.path().join(name);
            std::fs::write(&path, b"bytes").unwrap();
            path.to_string_lossy().into_owned()
        }

        fn missing(&self, name: &str) -> String {
            self.dir.path().join(name).to_string_lossy().into_owned()
        }
    }

    async fn dispatch(api: &Arc<FakeApi>, elements: &[&str]) -> Dispatch {
        let frame = Frame::new(elements.iter().copied()).unwrap();
        worker_dispatcher(Arc::clone(api), ImageDefaults::default())
            .dispatch(&frame)
            .await
    }

    fn replied(result: Dispatch) -> Frame {
        match result {
            Dispatch::Replied(Ok(frame)) => frame,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    fn sentinel(result: Dispatch) -> String {
        match result {
            Dispatch::Replied(Err(frame)) => {
                assert_eq!(frame.get(1), Some(ERROR_TAG));
                frame.verb().to_string()
            }
            other => panic!("expected sentinel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcribe_splits_credential_and_replies_text() {
        let files = Files::new();
        let audio = files.touch("a.wav");
        let api = Arc::new(FakeApi::with_text("hello world"));

        let frame = replied(dispatch(&api, &[TRANSCRIBE, "sk-abc:org-1", &audio]).await);
        assert_eq!(frame.elements(), ["hello world"]);
        assert_eq!(
            api.calls(),
            [Recorded::Audio {
                credential: Credential::new("sk-abc").with_organization("org-1"),
                file_name: "a.wav".into(),
            }]
        );
    }

    #[tokio::test]
    async fn translate_replies_with_success_tag() {
        let files = Files::new();
        let audio = files.touch("b.mp3");
        let api = Arc::new(FakeApi::with_text("good\nmorning"));

        let frame = replied(dispatch(&api, &[TRANSLATE, "sk-abc", &audio]).await);
        assert_eq!(frame.elements(), ["good morning", "success"]);
    }

    #[tokio::test]
    async fn audio_arity_must_be_exact() {
        let api = Arc::new(FakeApi::with_text("x"));
        assert_eq!(
            dispatch(&api, &[TRANSCRIBE, "sk-abc"]).await,
            Dispatch::Declined {
                verb: TRANSCRIBE.into()
            }
        );
        assert_eq!(
            dispatch(&api, &[TRANSLATE, "sk", "a.wav", "extra"]).await,
            Dispatch::Declined {
                verb: TRANSLATE.into()
            }
        );
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_transcription_is_an_error() {
        let files = Files::new();
        let audio = files.touch("silence.wav");
        let api = Arc::new(FakeApi::with_text("   "));

        let message = sentinel(dispatch(&api, &[TRANSCRIBE, "sk", &audio]).await);
        insta::assert_snapshot!(
            message,
            @"Whisper Transcription Error: Transcription Error - results text is null or empty!"
        );
    }

    #[tokio::test]
    async fn missing_audio_file_is_an_error() {
        let files = Files::new();
        let audio = files.missing("gone.wav");
        let api = Arc::new(FakeApi::with_text("unused"));

        let message = sentinel(dispatch(&api, &[TRANSCRIBE, "sk", &audio]).await);
        assert!(message.starts_with("Whisper Transcription Error: cannot read "));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn api_failure_is_wrapped_for_audio() {
        let files = Files::new();
        let audio = files.touch("a.wav");
        let api = Arc::new(FakeApi::failing("file not found"));

        let message = sentinel(dispatch(&api, &[TRANSLATE, "sk", &audio]).await);
        assert_eq!(message, "Whisper Translation Error: file not found (HTTP 400)");
    }

    #[tokio::test]
    async fn generate_clamps_count_to_ten() {
        let api = Arc::new(FakeApi::default());
        let frame = replied(dispatch(&api, &[IMAGE_GENERATE, "sk", "a cat", "12", "512x512"]).await);
        assert_eq!(frame.len(), 10);
        assert_eq!(
            api.calls(),
            [Recorded::Generate {
                prompt: "a cat".into(),
                count: 10,
                size: ImageSize::S512,
            }]
        );
    }

    #[tokio::test]
    async fn generate_uses_defaults() {
        let api = Arc::new(FakeApi::default());
        let frame = replied(dispatch(&api, &[IMAGE_GENERATE, "sk", "a dog", "many"]).await);
        assert_eq!(frame.elements(), ["https://img.test/1.png"]);
        assert_eq!(
            api.calls(),
            [Recorded::Generate {
                prompt: "a dog".into(),
                count: 1,
                size: ImageSize::S1024,
            }]
        );
    }

    #[tokio::test]
    async fn generate_rejects_bad_size() {
        let api = Arc::new(FakeApi::default());
        let message = sentinel(dispatch(&api, &[IMAGE_GENERATE, "sk", "a cat", "2", "640x480"]).await);
        insta::assert_snapshot!(
            message,
            @"Dall-E Exception: Image Generation Error: Image size invalid!"
        );
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn generate_rejects_blank_prompt() {
        let api = Arc::new(FakeApi::default());
        let message = sentinel(dispatch(&api, &[IMAGE_GENERATE, "sk", "   "]).await);
        assert_eq!(
            message,
            "Dall-E Exception: Image Generation Error: Image User Prompt is null or empty!"
        );
    }

    #[tokio::test]
    async fn variation_upload_names() {
        let files = Files::new();
        let image = files.touch("portrait.png");
        let api = Arc::new(FakeApi::default());

        replied(dispatch(&api, &[IMAGE_VARIATION, "sk", &image, "2"]).await);
        replied(dispatch(&api, &[IMAGE_VARIATION_BYTES, "sk", &image]).await);
        assert_eq!(
            api.calls(),
            [
                Recorded::Variation {
                    file_name: "portrait.png".into(),
                    count: 2,
                    size: ImageSize::S1024,
                },
                Recorded::Variation {
                    file_name: GENERIC_IMAGE_NAME.into(),
                    count: 1,
                    size: ImageSize::S1024,
                },
            ]
        );
    }

    #[tokio::test]
    async fn edit_needs_four_elements_and_takes_optional_mask() {
        let files = Files::new();
        let image = files.touch("room.png");
        let mask = files.touch("room-mask.png");
        let api = Arc::new(FakeApi::default());

        assert_eq!(
            dispatch(&api, &[IMAGE_EDIT, "sk", "add a lamp"]).await,
            Dispatch::Declined {
                verb: IMAGE_EDIT.into()
            }
        );

        replied(dispatch(&api, &[IMAGE_EDIT, "sk", "add a lamp", &image]).await);
        replied(
            dispatch(
                &api,
                &[IMAGE_EDIT_BYTES, "sk", "add a lamp", &image, "3", "256x256", &mask],
            )
            .await,
        );
        assert_eq!(
            api.calls(),
            [
                Recorded::Edit {
                    prompt: "add a lamp".into(),
                    image: "room.png".into(),
                    mask: None,
                    count: 1,
                    size: ImageSize::S1024,
                },
                Recorded::Edit {
                    prompt: "add a lamp".into(),
                    image: GENERIC_IMAGE_NAME.into(),
                    mask: Some(GENERIC_MASK_NAME.into()),
                    count: 3,
                    size: ImageSize::S256,
                },
            ]
        );
    }

    #[tokio::test]
    async fn image_api_failure_is_wrapped() {
        let files = Files::new();
        let image = files.touch("x.png");
        let api = Arc::new(FakeApi::failing("billing hard limit reached"));
        let message = sentinel(dispatch(&api, &[IMAGE_EDIT, "sk", "p", &image]).await);
        assert_eq!(
            message,
            "Dall-E Exception: Image Editing Error: billing hard limit reached (HTTP 400)"
        );
    }

    #[test]
    fn dispatcher_covers_every_verb() {
        let d = worker_dispatcher(Arc::new(FakeApi::default()), ImageDefaults::default());
        for verb in ALL_VERBS {
            assert!(d.handles(verb), "{verb}");
        }
        assert_eq!(d.verbs().count(), ALL_VERBS.len());
    }
}
