// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while parsing a syslog message or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid priority: {0}")]
    Priority(String),

    #[error("unsupported syslog version: {0}")]
    Version(String),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("missing header field: {0}")]
    MissingField(&'static str),

    #[error("malformed structured data")]
    StructuredData,

    #[error("invalid frame length prefix: {0}")]
    FrameLength(String),

    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}
