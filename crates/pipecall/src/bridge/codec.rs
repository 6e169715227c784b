//! Line codec for frames.
//!
//! Uses LinesCodec for line splitting and groups lines into frames.
//! Works over any AsyncRead/AsyncWrite (Unix sockets, named pipes).
//!
//! A frame ends at a blank line or at end of stream. The writer never emits
//! the blank line itself: it closes the connection after the last element.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::frame::Frame;

/// Default upper bound for a single line (one frame element).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct FrameCodec {
    inner: LinesCodec,
    pending: Vec<String>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max),
            pending: Vec::new(),
        }
    }

    fn take_frame(&mut self) -> io::Result<Frame> {
        let lines = std::mem::take(&mut self.pending);
        Frame::new(lines).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn line_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(line_error)? {
            if line.is_empty() {
                // Blank line terminates the frame; nothing collected means
                // nothing was sent.
                return self.take_frame().map(Some);
            }
            self.pending.push(line);
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if let Some(line) = self.inner.decode_eof(src).map_err(line_error)?
            && !line.is_empty()
        {
            self.pending.push(line);
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.take_frame().map(Some)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for element in item.elements() {
            self.inner
                .encode(element.as_str(), dst)
                .map_err(line_error)?;
        }
        tracing::trace!(elements = item.len(), bytes = dst.len(), "Encoded frame");
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Frame>::encode(self, &item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::ProtocolAnomaly;

    fn encode(frame: &Frame) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    fn decode_all(bytes: &[u8]) -> Option<Frame> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(bytes);
        match codec.decode(&mut buf).unwrap() {
            Some(frame) => Some(frame),
            None => codec.decode_eof(&mut buf).unwrap(),
        }
    }

    #[test]
    fn encodes_one_line_per_element() {
        let frame = Frame::new(["transcribe", "sk-abc:org-1", r"C:\a.wav"]).unwrap();
        let bytes = encode(&frame);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        insta::assert_snapshot!(text.trim_end(), @r"
        transcribe
        sk-abc:org-1
        C:\a.wav
        ");
    }

    #[test]
    fn roundtrip_at_end_of_stream() {
        let frame = Frame::new(["image.generate", "sk-abc", "a cat", "12", "512x512"]).unwrap();
        let bytes = encode(&frame);
        assert_eq!(decode_all(&bytes), Some(frame));
    }

    #[test]
    fn roundtrip_preserves_inner_whitespace() {
        let frame = Frame::new(["  padded  ", "tab\tseparated"]).unwrap();
        assert_eq!(decode_all(&encode(&frame)), Some(frame));
    }

    #[test]
    fn lossy_writer_shifts_later_elements() {
        let (frame, anomaly) = Frame::lossy(["a", "", "c"]).unwrap();
        assert_eq!(anomaly, Some(ProtocolAnomaly::Shifted { index: 1 }));

        let decoded = decode_all(&encode(&frame)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.elements(), ["a", "c"]);
    }

    #[test]
    fn blank_line_terminates_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"a\n\nc\n"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.elements(), ["a"]);
    }

    #[test]
    fn accepts_crlf_line_endings() {
        let frame = decode_all(b"transcribe\r\nkey\r\nfile.wav\r\n").unwrap();
        assert_eq!(frame.elements(), ["transcribe", "key", "file.wav"]);
    }

    #[test]
    fn last_line_without_newline_is_kept() {
        let frame = decode_all(b"hello\nworld").unwrap();
        assert_eq!(frame.elements(), ["hello", "world"]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert_eq!(decode_all(b""), None);
    }

    #[test]
    fn leading_blank_line_is_an_empty_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\nignored\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn incomplete_line_waits_for_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"transcr"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ibe\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), "transcribe");
    }

    proptest::proptest! {
        #[test]
        fn any_valid_frame_survives_the_wire(
            elements in proptest::collection::vec("[^\r\n]{1,40}", 1..8),
            split in 0usize..400,
        ) {
            let frame = Frame::new(elements).unwrap();
            let bytes = encode(&frame);
            proptest::prop_assert_eq!(decode_all(&bytes), Some(frame.clone()));

            // Same bytes delivered in two reads.
            let split = split.min(bytes.len());
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::from(&bytes[..split]);
            let early = codec.decode(&mut buf).unwrap();
            proptest::prop_assert!(early.is_none());
            buf.extend_from_slice(&bytes[split..]);
            let decoded = match codec.decode(&mut buf).unwrap() {
                Some(frame) => Some(frame),
                None => codec.decode_eof(&mut buf).unwrap(),
            };
            proptest::prop_assert_eq!(decoded, Some(frame));
        }
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut codec = FrameCodec::with_max_line_bytes(4);
        let mut buf = BytesMut::from(&b"toolong\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
