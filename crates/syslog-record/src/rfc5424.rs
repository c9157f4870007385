// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RFC 5424 rendering and parsing.
//!
//! ```text
//! <PRI>1 TIMESTAMP HOSTNAME APP-NAME PROCID MSGID SD [SP MSG]
//! ```
//!
//! Records produced here never carry structured data, so `SD` is always the
//! NILVALUE on output. The parser skips any structured data it finds.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::CodecError;
use crate::record::{Header, LogRecord};

const NILVALUE: u8 = b'-';
const MAX_PRIORITY: u8 = 191;

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_APP_NAME_LEN: usize = 48;
const MAX_PROC_ID_LEN: usize = 128;
const MAX_MSG_ID_LEN: usize = 32;

/// Renders `record` as a single RFC 5424 message without a trailing newline.
#[must_use]
pub fn render(record: &LogRecord) -> Vec<u8> {
    let header = record.header();
    let mut out = Vec::with_capacity(96 + record.msg().len());

    out.extend_from_slice(format!("<{}>1 ", header.priority.min(MAX_PRIORITY)).as_bytes());
    out.extend_from_slice(
        record
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .as_bytes(),
    );

    for (value, max_len) in [
        (&header.hostname, MAX_HOSTNAME_LEN),
        (&header.app_name, MAX_APP_NAME_LEN),
        (&header.proc_id, MAX_PROC_ID_LEN),
        (&header.msg_id, MAX_MSG_ID_LEN),
    ] {
        out.push(b' ');
        push_header_field(&mut out, value, max_len);
    }

    out.extend_from_slice(b" -");
    if !record.msg().is_empty() {
        out.push(b' ');
        out.extend_from_slice(record.msg());
    }
    out
}

// Header fields are PRINTUSASCII (33..=126) with per-field length limits.
fn push_header_field(out: &mut Vec<u8>, value: &[u8], max_len: usize) {
    if value.is_empty() {
        out.push(NILVALUE);
        return;
    }
    out.extend(value.iter().take(max_len).map(|&b| {
        if (33..=126).contains(&b) {
            b
        } else {
            b'_'
        }
    }));
}

/// Parses one RFC 5424 message.
pub fn parse(buf: &[u8]) -> Result<LogRecord, CodecError> {
    let mut cursor = Cursor { buf, pos: 0 };

    let priority = cursor.priority()?;

    let version = cursor.field("version")?;
    if version != b"1" {
        return Err(CodecError::Version(
            String::from_utf8_lossy(version).into_owned(),
        ));
    }

    let timestamp = cursor.field("timestamp")?;
    let timestamp = std::str::from_utf8(timestamp)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| CodecError::Timestamp(String::from_utf8_lossy(timestamp).into_owned()))?;

    let hostname = nil_or_owned(cursor.field("hostname")?);
    let app_name = nil_or_owned(cursor.field("app_name")?);
    let proc_id = nil_or_owned(cursor.field("proc_id")?);
    let msg_id = nil_or_owned(cursor.field("msg_id")?);

    cursor.skip_structured_data()?;
    let msg = cursor.rest();

    let header = Header {
        priority,
        hostname,
        app_name,
        proc_id,
        msg_id,
    };
    Ok(LogRecord::with_timestamp(Arc::new(header), timestamp, msg))
}

fn nil_or_owned(field: &[u8]) -> Vec<u8> {
    if field == [NILVALUE] {
        Vec::new()
    } else {
        field.to_vec()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn priority(&mut self) -> Result<u8, CodecError> {
        let invalid = || CodecError::Priority(String::from_utf8_lossy(self.buf).into_owned());

        if self.buf.first() != Some(&b'<') {
            return Err(invalid());
        }
        let end = self
            .buf
            .iter()
            .take(5)
            .position(|&b| b == b'>')
            .ok_or_else(invalid)?;
        let digits = &self.buf[1..end];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid());
        }
        let priority = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .filter(|p| *p <= MAX_PRIORITY)
            .ok_or_else(invalid)?;

        self.pos = end + 1;
        Ok(priority)
    }

    /// Returns the next space-delimited field and consumes the delimiter.
    fn field(&mut self, name: &'static str) -> Result<&'a [u8], CodecError> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let len = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
        if len == 0 {
            return Err(CodecError::MissingField(name));
        }
        self.pos += len;
        if self.pos < self.buf.len() {
            self.pos += 1;
        }
        Ok(&rest[..len])
    }

    fn skip_structured_data(&mut self) -> Result<(), CodecError> {
        match self.buf.get(self.pos) {
            Some(&NILVALUE) => self.pos += 1,
            Some(b'[') => {
                while self.buf.get(self.pos) == Some(&b'[') {
                    self.skip_sd_element()?;
                }
            }
            None => return Err(CodecError::MissingField("structured_data")),
            Some(_) => return Err(CodecError::StructuredData),
        }

        match self.buf.get(self.pos) {
            None => Ok(()),
            Some(b' ') => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(CodecError::StructuredData),
        }
    }

    // Param values may contain escaped `]`, `"` and `\`.
    fn skip_sd_element(&mut self) -> Result<(), CodecError> {
        let mut escaped = false;
        let mut quoted = false;
        for (offset, &b) in self.buf[self.pos + 1..].iter().enumerate() {
            match b {
                _ if escaped => escaped = false,
                b'\\' if quoted => escaped = true,
                b'"' => quoted = !quoted,
                b']' if !quoted => {
                    self.pos += offset + 2;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(CodecError::StructuredData)
    }

    fn rest(&self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}
