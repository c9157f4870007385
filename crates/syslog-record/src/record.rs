// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Facility `user` (1), severity `informational` (6).
pub const DEFAULT_PRIORITY: u8 = 14;

/// Routing metadata shared by every record read from one stream.
///
/// Empty fields are rendered as the syslog NILVALUE (`-`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub priority: u8,
    pub hostname: Vec<u8>,
    pub app_name: Vec<u8>,
    pub proc_id: Vec<u8>,
    pub msg_id: Vec<u8>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            hostname: Vec::new(),
            app_name: Vec::new(),
            proc_id: Vec::new(),
            msg_id: Vec::new(),
        }
    }
}

impl Header {
    #[must_use]
    pub fn new(
        hostname: impl Into<Vec<u8>>,
        app_name: impl Into<Vec<u8>>,
        proc_id: impl Into<Vec<u8>>,
        msg_id: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            hostname: hostname.into(),
            app_name: app_name.into(),
            proc_id: proc_id.into(),
            msg_id: msg_id.into(),
        }
    }
}

/// One line of process output, stamped and routed.
///
/// Records never change once built. They are passed around as
/// `Arc<LogRecord>` so the outbound queue, the drainer and the aggregator's
/// buffers can share them without copying the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    header: Arc<Header>,
    timestamp: DateTime<Utc>,
    msg: Vec<u8>,
}

impl LogRecord {
    /// Builds a record stamped with the current time.
    #[must_use]
    pub fn new(header: Arc<Header>, msg: impl Into<Vec<u8>>) -> Self {
        Self::with_timestamp(header, Utc::now(), msg)
    }

    #[must_use]
    pub fn with_timestamp(
        header: Arc<Header>,
        timestamp: DateTime<Utc>,
        msg: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            header,
            timestamp,
            msg: msg.into(),
        }
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn msg(&self) -> &[u8] {
        &self.msg
    }

    /// Name of the application this record belongs to, lossily decoded.
    #[must_use]
    pub fn app_name(&self) -> String {
        String::from_utf8_lossy(&self.header.app_name).into_owned()
    }

    /// Renders the record as an RFC 5424 message.
    #[must_use]
    pub fn to_rfc5424(&self) -> Vec<u8> {
        crate::rfc5424::render(self)
    }

    /// Renders the record as an RFC 6587 octet-counted frame.
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        crate::rfc6587::frame(self)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_rfc5424()))
    }
}
