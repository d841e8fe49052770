//! Newline framing for the reporting connection
//!
//! Every event is written as one compact JSON object followed by `\n`.
//! Compact `serde_json` output escapes control characters, so a raw newline
//! can only ever be a frame boundary. The decoder never fails on bad content:
//! a frame that does not decode is handed back as [`Frame::Malformed`] and the
//! stream carries on with the next line.

use bytes::{Buf, BufMut, BytesMut};
use std::{cmp, io};
use tokio_util::codec::{Decoder, Encoder};

use crate::event::{DecodeError, TelemetryEvent};

/// Upper bound for one frame on the wire
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Why a single frame was dropped
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame longer than {limit} bytes")]
    TooLong { limit: usize },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// One item read off the reporting connection
#[derive(Debug)]
pub enum Frame {
    Event(TelemetryEvent),
    Malformed(FrameError),
}

#[derive(Debug, Clone)]
pub struct TelemetryCodec {
    max_frame_len: usize,
    // Bytes already scanned for a newline in the current frame
    next_index: usize,
    discarding: bool,
}

impl TelemetryCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn too_long(&self) -> Frame {
        Frame::Malformed(FrameError::TooLong {
            limit: self.max_frame_len,
        })
    }
}

impl Default for TelemetryCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Blank lines are skipped, anything else becomes a frame
fn parse_line(line: &[u8]) -> Option<Frame> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    let trimmed = match (start, end) {
        (Some(start), Some(end)) => &line[start..=end],
        _ => return None,
    };
    Some(match TelemetryEvent::from_slice(trimmed) {
        Ok(event) => Frame::Event(event),
        Err(e) => Frame::Malformed(e.into()),
    })
}

impl Decoder for TelemetryCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            let read_to = cmp::min(self.max_frame_len.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(self.too_long()));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if let Some(frame) = parse_line(&line[..end]) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if buf.len() > self.max_frame_len => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(Some(self.too_long()));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Last frame without its newline: keep it if it decodes
        let rest = buf.split_to(buf.len());
        Ok(parse_line(&rest))
    }
}

impl<'a> Encoder<&'a TelemetryEvent> for TelemetryCodec {
    type Error = CodecError;

    fn encode(&mut self, event: &'a TelemetryEvent, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(event).map_err(CodecError::Encode)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode one event into its exact wire bytes, newline included
pub fn encode_frame(event: &TelemetryEvent) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    TelemetryCodec::new().encode(event, &mut buf)?;
    Ok(buf.to_vec())
}
