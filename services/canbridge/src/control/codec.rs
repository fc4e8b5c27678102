//! Control protocol framing
//!
//! Newline-delimited UTF-8. Each reply is a block of lines closed by an empty
//! line, so clients can read multi-line replies without knowing their length.
//! Over-long input lines are reported as an item instead of a decoder error,
//! which keeps the session readable afterwards.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::BridgeError;

/// Longest accepted command line
pub const MAX_LINE_LENGTH: usize = 1024;

/// Line that closes every reply block
pub const END_OF_REPLY: &str = "";

/// One decoded input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Line(String),
    /// Line exceeded [`MAX_LINE_LENGTH`]; its remaining bytes are discarded
    TooLong,
}

/// Line codec for the control socket
#[derive(Debug, Clone)]
pub struct ControlCodec {
    inner: LinesCodec,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlLine;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlLine>, BridgeError> {
        match self.inner.decode(src) {
            Ok(line) => Ok(line.map(ControlLine::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(ControlLine::TooLong)),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ControlLine>, BridgeError> {
        match self.inner.decode_eof(src) {
            Ok(line) => Ok(line.map(ControlLine::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(ControlLine::TooLong)),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
        }
    }
}

impl Encoder<String> for ControlCodec {
    type Error = BridgeError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), BridgeError> {
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e.into(),
            LinesCodecError::MaxLineLengthExceeded => {
                BridgeError::ProtocolError("Reply line too long".to_string())
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut ControlCodec, buf: &mut BytesMut) -> Vec<ControlLine> {
        let mut out = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_long_line_is_reported_then_skipped() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'b'; 2000]);
        buf.extend_from_slice(b"\nlist\n");

        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(
            lines,
            vec![ControlLine::TooLong, ControlLine::Line("list".to_string())]
        );
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from("sta");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"tus\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::Line("status".to_string()))
        );
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("Goodbye".to_string(), &mut buf).unwrap();
        codec.encode(END_OF_REPLY.to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"Goodbye\n\n");
    }
}
