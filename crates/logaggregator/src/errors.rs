// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

use syslog_record::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed log frame: {0}")]
    Codec(#[from] CodecError),
}
