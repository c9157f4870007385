// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RFC 6587 octet-counting framing: `MSG-LEN SP SYSLOG-MSG`.

use crate::errors::CodecError;
use crate::record::LogRecord;

/// Default upper bound for a single decoded frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

// Enough digits for any length below `usize::MAX` on 64-bit targets.
const MAX_LEN_DIGITS: usize = 20;

/// Renders `record` as a self-delimiting frame.
#[must_use]
pub fn frame(record: &LogRecord) -> Vec<u8> {
    frame_bytes(&record.to_rfc5424())
}

/// Prefixes an already rendered message with its octet count.
#[must_use]
pub fn frame_bytes(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 8);
    out.extend_from_slice(msg.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(msg);
    out
}

/// Incremental decoder for a stream of octet-counted frames.
///
/// Bytes can be fed in arbitrary chunks; complete frames are yielded in
/// order by [`FrameDecoder::next_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let Some(space) = self.buf.iter().take(MAX_LEN_DIGITS + 1).position(|&b| b == b' ')
        else {
            if self.buf.len() > MAX_LEN_DIGITS || self.buf.iter().any(|b| !b.is_ascii_digit()) {
                return Err(self.invalid_length(self.buf.len().min(MAX_LEN_DIGITS + 1)));
            }
            return Ok(None);
        };

        let digits = &self.buf[..space];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(self.invalid_length(space));
        }
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.invalid_length(space))?;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let end = space + 1 + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let frame = self.buf[space + 1..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(frame))
    }

    fn invalid_length(&self, prefix_len: usize) -> CodecError {
        CodecError::FrameLength(String::from_utf8_lossy(&self.buf[..prefix_len]).into_owned())
    }
}
