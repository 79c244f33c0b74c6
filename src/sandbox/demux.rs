//! Multiplexed output stream of a sandbox.
//!
//! Each frame is an 8-byte header followed by its payload:
//!
//! ```text
//! [stream_type, 0, 0, 0, len (u32 big endian)] payload[len]
//! ```
//!
//! `stream_type` is 0 for stdin, 1 for stdout and 2 for stderr.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

pub const HEADER_LEN: usize = 8;

/// Largest payload a single frame may announce; anything above is a corrupt header
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Reads the stream kind and payload length out of a frame header
pub fn parse_header(header: &[u8; HEADER_LEN]) -> io::Result<(StreamKind, usize)> {
    let kind = StreamKind::from_byte(header[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown stream type {} in output frame", header[0]),
        )
    })?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("output frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }
    Ok((kind, len))
}

fn peek_header(src: &BytesMut) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&src[..HEADER_LEN]);
    header
}

/// Splits the raw stream into frames, however the bytes were chunked in transit
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let (kind, len) = parse_header(&peek_header(src))?;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // A killed sandbox can cut the last frame short; keep what arrived
        if src.len() > HEADER_LEN {
            let (kind, _) = parse_header(&peek_header(src))?;
            src.advance(HEADER_LEN);
            let payload = src.split().freeze();
            return Ok(Some(Frame { kind, payload }));
        }

        src.clear();
        Ok(None)
    }
}

/// Append-only stdout/stderr buffers, each capped at `limit` bytes
#[derive(Debug)]
pub struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

impl OutputBuffers {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn push(&mut self, frame: &Frame) {
        let (buffer, truncated) = match frame.kind {
            StreamKind::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            StreamKind::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
            StreamKind::Stdin => return,
        };

        let room = self.limit.saturating_sub(buffer.len());
        if frame.payload.len() > room {
            *truncated = true;
        }
        buffer.extend_from_slice(&frame.payload[..frame.payload.len().min(room)]);
    }

    /// Empties both buffers into `(stdout, stderr)`
    pub fn take(&mut self) -> (String, String) {
        let finish = |buffer: &mut Vec<u8>, truncated: bool| {
            let mut text = String::from_utf8_lossy(&std::mem::take(buffer)).into_owned();
            if truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            text
        };

        (
            finish(&mut self.stdout, self.stdout_truncated),
            finish(&mut self.stderr, self.stderr_truncated),
        )
    }
}
