//! Verb dispatch on the worker side.
//!
//! The dispatcher is a fixed table from verb to handler, built once at
//! worker start. It does no schema validation: each handler decides for
//! itself whether a frame has the shape it needs.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::bridge::Frame;

/// Application failure inside a handler.
///
/// The message becomes element 0 of the sentinel frame sent to the host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One remote operation.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Shape check run before [`call`](Self::call). A frame that is not
    /// accepted is dropped without a reply.
    fn accepts(&self, frame: &Frame) -> bool {
        let _ = frame;
        true
    }

    async fn call(&self, frame: &Frame) -> Result<Frame, HandlerError>;
}

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// No handler for this verb. Nothing is sent back.
    Unmatched { verb: String },
    /// The handler rejected the frame's shape. Nothing is sent back.
    Declined { verb: String },
    /// A handler ran. `Err` holds the sentinel frame for a failure.
    Replied(Result<Frame, Frame>),
}

impl Dispatch {
    /// The frame to send back, if any.
    pub fn reply(&self) -> Option<&Frame> {
        match self {
            Dispatch::Replied(Ok(frame)) | Dispatch::Replied(Err(frame)) => Some(frame),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("verbs", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `verb`, replacing any earlier one.
    pub fn with_handler(mut self, verb: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(verb.into(), Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, verb: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(verb.into(), handler);
        self
    }

    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handles(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }

    pub async fn dispatch(&self, frame: &Frame) -> Dispatch {
        let verb = frame.verb();
        let Some(handler) = self.handlers.get(verb) else {
            tracing::debug!(%verb, "No handler for verb, dropping request");
            return Dispatch::Unmatched {
                verb: verb.to_string(),
            };
        };

        if !handler.accepts(frame) {
            tracing::debug!(%verb, elements = frame.len(), "Handler declined frame");
            return Dispatch::Declined {
                verb: verb.to_string(),
            };
        }

        let outcome = AssertUnwindSafe(handler.call(frame)).catch_unwind().await;
        match outcome {
            Ok(Ok(reply)) => {
                tracing::debug!(%verb, elements = reply.len(), "Handler replied");
                Dispatch::Replied(Ok(reply))
            }
            Ok(Err(e)) => {
                tracing::warn!(%verb, error = %e, "Handler failed");
                Dispatch::Replied(Err(Frame::sentinel(e.message())))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%verb, panic = %message, "Handler panicked");
                Dispatch::Replied(Err(Frame::sentinel(format!("{verb} panicked: {message}"))))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ERROR_TAG;

    struct Echo;

    #[async_trait::async_trait]
    impl Handler for Echo {
        async fn call(&self, frame: &Frame) -> Result<Frame, HandlerError> {
            Frame::new(frame.args().to_vec()).map_err(|e| HandlerError::new(e.to_string()))
        }
    }

    struct ExactlyThree;

    #[async_trait::async_trait]
    impl Handler for ExactlyThree {
        fn accepts(&self, frame: &Frame) -> bool {
            frame.len() == 3
        }

        async fn call(&self, _frame: &Frame) -> Result<Frame, HandlerError> {
            Err(HandlerError::new("file not found"))
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Handler for Panics {
        async fn call(&self, _frame: &Frame) -> Result<Frame, HandlerError> {
            panic!("kaboom")
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new()
            .with_handler("echo", Echo)
            .with_handler("three", ExactlyThree)
            .with_handler("panics", Panics)
    }

    #[tokio::test]
    async fn unknown_verb_is_unmatched() {
        let frame = Frame::new(["frobnicate", "x"]).unwrap();
        let result = dispatcher().dispatch(&frame).await;
        assert_eq!(
            result,
            Dispatch::Unmatched {
                verb: "frobnicate".into()
            }
        );
        assert!(result.reply().is_none());
    }

    #[tokio::test]
    async fn handler_output_is_replied() {
        let frame = Frame::new(["echo", "hello", "world"]).unwrap();
        let result = dispatcher().dispatch(&frame).await;
        let reply = result.reply().unwrap();
        assert_eq!(reply.elements(), ["hello", "world"]);
    }

    #[tokio::test]
    async fn arity_mismatch_is_declined() {
        let frame = Frame::new(["three", "a"]).unwrap();
        assert_eq!(
            dispatcher().dispatch(&frame).await,
            Dispatch::Declined {
                verb: "three".into()
            }
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_sentinel() {
        let frame = Frame::new(["three", "a", "b"]).unwrap();
        let result = dispatcher().dispatch(&frame).await;
        let Dispatch::Replied(Err(sentinel)) = result else {
            panic!("expected sentinel, got {result:?}");
        };
        assert_eq!(sentinel.elements(), ["file not found", ERROR_TAG]);
    }

    #[tokio::test]
    async fn panic_becomes_sentinel() {
        let frame = Frame::new(["panics"]).unwrap();
        let result = dispatcher().dispatch(&frame).await;
        let Dispatch::Replied(Err(sentinel)) = result else {
            panic!("expected sentinel, got {result:?}");
        };
        assert_eq!(sentinel.get(0), Some("panics panicked: kaboom"));
        assert_eq!(sentinel.get(1), Some(ERROR_TAG));
    }

    #[test]
    fn lists_registered_verbs() {
        let d = dispatcher();
        assert_eq!(d.verbs().collect::<Vec<_>>(), ["echo", "panics", "three"]);
        assert!(d.handles("echo"));
        assert!(!d.handles("missing"));
    }
}
