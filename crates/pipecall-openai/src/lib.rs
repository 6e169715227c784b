//! Speech and image operations served over pipecall.
//!
//! The worker binary registers [`worker_dispatcher`] with
//! [`pipecall::run_worker`]; the host binary builds requests with
//! [`RequestBuilder`] and interprets replies with [`host_continuations`].

pub mod client;
pub mod credential;
pub mod handlers;
pub mod host_ops;
pub mod params;

pub use client::{ApiError, ImageEdit, OpenAiApi, OpenAiClient, OpenAiConfig, Upload};
pub use credential::Credential;
pub use handlers::{ALL_VERBS, worker_dispatcher};
pub use host_ops::{RequestBuilder, RequestError, host_continuations};
pub use params::{ImageDefaults, ImageSize, InvalidSize, MAX_IMAGE_COUNT};
