//! Frame model shared by host and worker.
//!
//! A frame is an ordered, non-empty list of strings. Element 0 is the verb,
//! the rest are positional arguments whose meaning depends on the verb.
//! On the wire every element is one line, so elements can be neither empty
//! nor contain line breaks.

use std::fmt;

/// Literal second element marking a sentinel (application failure) frame.
pub const ERROR_TAG: &str = "error";

/// Verb of the frame a freshly launched worker sends once it is listening.
pub const READY_VERB: &str = "ready";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame must contain at least one element")]
    Empty,
    #[error("frame element {index} is empty")]
    EmptyElement { index: usize },
    #[error("frame element {index} contains a line break")]
    LineBreak { index: usize },
}

/// Something went wrong with a frame without it being an error.
///
/// Anomalies are reported, never thrown: the call they belong to is either
/// dropped or delivered in altered form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    /// Nothing usable was received (stream ended, I/O failure mid-frame).
    #[error("frame dropped: {reason}")]
    Dropped { reason: String },
    /// An empty element was dropped by the writer; every later element moved
    /// one position to the left.
    #[error("empty element at position {index} dropped, later elements shifted")]
    Shifted { index: usize },
}

impl ProtocolAnomaly {
    pub fn dropped(reason: impl Into<String>) -> Self {
        Self::Dropped {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<String>);

impl Frame {
    /// Build a frame, rejecting empty elements and embedded line breaks.
    pub fn new<I, S>(elements: I) -> Result<Self, FrameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        if elements.is_empty() {
            return Err(FrameError::Empty);
        }
        for (index, element) in elements.iter().enumerate() {
            if element.is_empty() {
                return Err(FrameError::EmptyElement { index });
            }
            if element.contains(['\n', '\r']) {
                return Err(FrameError::LineBreak { index });
            }
        }
        Ok(Self(elements))
    }

    /// Build a frame the way a line writer would send it: empty elements are
    /// silently skipped. The skip is reported as [`ProtocolAnomaly::Shifted`]
    /// with the position of the first element that went missing.
    pub fn lossy<I, S>(elements: I) -> Result<(Self, Option<ProtocolAnomaly>), FrameError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut first_dropped = None;
        let mut kept = Vec::new();
        for (index, element) in elements.into_iter().map(Into::into).enumerate() {
            if element.is_empty() {
                first_dropped.get_or_insert(index);
            } else {
                kept.push(element);
            }
        }
        let frame = Self::new(kept)?;
        Ok((frame, first_dropped.map(|index| ProtocolAnomaly::Shifted { index })))
    }

    /// Two-element failure frame: `[message, "error"]`.
    ///
    /// Line breaks in the message are folded to spaces and an empty message
    /// is replaced so the frame always survives the wire.
    pub fn sentinel(message: impl AsRef<str>) -> Self {
        let message = fold_line_breaks(message.as_ref());
        let message = if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        };
        Self(vec![message, ERROR_TAG.to_string()])
    }

    /// Frame announcing a worker is bound and ready for its first request.
    pub fn ready(pid: u32) -> Self {
        Self(vec![READY_VERB.to_string(), pid.to_string()])
    }

    pub fn verb(&self) -> &str {
        &self.0[0]
    }

    /// Positional arguments after the verb.
    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: frames hold at least one element.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[String] {
        &self.0
    }

    pub fn into_elements(self) -> Vec<String> {
        self.0
    }

    /// Failure classification used by the host: element 0 starts with the
    /// worker's reserved marker, or element 1 is the literal `"error"`.
    pub fn is_sentinel(&self, marker: &str) -> bool {
        (!marker.is_empty() && self.verb().starts_with(marker)) || self.get(1) == Some(ERROR_TAG)
    }

    pub fn is_ready(&self) -> bool {
        self.verb() == READY_VERB
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl TryFrom<Vec<String>> for Frame {
    type Error = FrameError;

    fn try_from(elements: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(elements)
    }
}

/// Replace CR/LF sequences with single spaces.
pub fn fold_line_breaks(text: &str) -> String {
    text.split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
