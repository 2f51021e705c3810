//! Frame encoding and decoding for the radar command protocol.
//!
//! The wire format delimits each message with a start and a stop byte and
//! byte-stuffs the payload so neither delimiter can appear inside it:
//! ```text
//! ┌──────────┬────────────────────┬──────────┐
//! │  0x02    │  stuffed payload   │  0x03    │
//! │  1 byte  │      n bytes       │  1 byte  │
//! └──────────┴────────────────────┴──────────┘
//! ```
//!
//! A literal start, stop or escape byte inside the payload is sent as the
//! escape byte followed by the byte's alternate code:
//!
//! | literal | sent as     |
//! |---------|-------------|
//! | `0x02`  | `0x10 0x22` |
//! | `0x03`  | `0x10 0x23` |
//! | `0x10`  | `0x10 0x30` |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Start-of-frame delimiter.
pub const FRAME_START: u8 = 0x02;

/// End-of-frame delimiter.
pub const FRAME_STOP: u8 = 0x03;

/// Escape byte introducing a stuffed sequence.
pub const FRAME_ESC: u8 = 0x10;

/// Alternate code for a literal start byte.
pub const ESC_START: u8 = 0x22;

/// Alternate code for a literal stop byte.
pub const ESC_STOP: u8 = 0x23;

/// Alternate code for a literal escape byte.
pub const ESC_ESC: u8 = 0x30;

/// Minimum frame size (start + stop).
pub const MIN_FRAME_SIZE: usize = 2;

const fn alternate(byte: u8) -> Option<u8> {
    match byte {
        FRAME_START => Some(ESC_START),
        FRAME_STOP => Some(ESC_STOP),
        FRAME_ESC => Some(ESC_ESC),
        _ => None,
    }
}

const fn literal(code: u8) -> Option<u8> {
    match code {
        ESC_START => Some(FRAME_START),
        ESC_STOP => Some(FRAME_STOP),
        ESC_ESC => Some(FRAME_ESC),
        _ => None,
    }
}

/// Encodes a payload into a delimited, byte-stuffed frame.
#[must_use]
pub fn encode(payload: &[u8]) -> Bytes {
    let escapes = payload.iter().filter(|&&b| alternate(b).is_some()).count();
    let mut buf = BytesMut::with_capacity(MIN_FRAME_SIZE + payload.len() + escapes);
    buf.put_u8(FRAME_START);
    for &byte in payload {
        if let Some(code) = alternate(byte) {
            buf.put_u8(FRAME_ESC);
            buf.put_u8(code);
        } else {
            buf.put_u8(byte);
        }
    }
    buf.put_u8(FRAME_STOP);
    buf.freeze()
}

/// Decodes a complete frame, including both delimiters, back to its payload.
///
/// Any escape byte not followed by one of the three alternate codes
/// invalidates the whole frame; no partial payload is returned.
///
/// # Errors
///
/// Returns a `FrameError` if the delimiters are missing or an escape
/// sequence is invalid.
pub fn decode(frame: &[u8]) -> Result<Bytes, FrameError> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[0] != FRAME_START {
        return Err(FrameError::MissingStart);
    }
    if frame[frame.len() - 1] != FRAME_STOP {
        return Err(FrameError::MissingStop);
    }

    let body = &frame[1..frame.len() - 1];
    let mut out = BytesMut::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == FRAME_ESC {
            let &code = bytes.next().ok_or(FrameError::TrailingEscape)?;
            let value = literal(code).ok_or(FrameError::BadEscape { byte: code })?;
            out.put_u8(value);
        } else {
            out.put_u8(byte);
        }
    }
    Ok(out.freeze())
}

/// Frame decoder that reassembles frames from partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract and decode the next complete frame.
    ///
    /// Returns `Ok(Some(payload))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or an error if the extracted frame
    /// is malformed. Either way the consumed bytes leave the buffer and only
    /// the remainder is kept.
    ///
    /// Bytes before the first start delimiter are noise and are discarded.
    /// A start byte seen again before the stop byte means the earlier frame
    /// was truncated; decoding resynchronises on the later start.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` if the extracted frame has a bad escape sequence.
    pub fn decode(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Some(start) = self.buffer.iter().position(|&b| b == FRAME_START) else {
            if !self.buffer.is_empty() {
                tracing::trace!("discarding {} bytes without start byte", self.buffer.len());
                self.buffer.clear();
            }
            return Ok(None);
        };
        if start > 0 {
            tracing::trace!("discarding {start} bytes before start byte");
            self.buffer.advance(start);
        }

        let Some(stop) = self.buffer.iter().position(|&b| b == FRAME_STOP) else {
            return Ok(None);
        };

        // Resync on the last start byte preceding the stop byte.
        let resync = self.buffer[..stop]
            .iter()
            .rposition(|&b| b == FRAME_START)
            .unwrap_or(0);
        if resync > 0 {
            tracing::debug!("dropping {resync} bytes of truncated frame");
            self.buffer.advance(resync);
        }

        let frame = self.buffer.split_to(stop - resync + 1);
        decode(&frame).map(Some)
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
