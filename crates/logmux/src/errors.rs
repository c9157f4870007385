// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Failure reported by a discovery backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("service {0} has no leader")]
    NoLeader(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("watch failed: {0}")]
    Watch(String),
}

/// Errors surfaced synchronously by [`LogMux::connect`](crate::LogMux::connect).
///
/// A failed dial is not among them: it is logged and retried when the
/// discovery feed announces a new leader.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to watch service {service}: {source}")]
    Watch {
        service: String,
        source: DiscoveryError,
    },

    #[error("failed to resolve leader of service {service}: {source}")]
    Resolve {
        service: String,
        source: DiscoveryError,
    },

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, io::Error),

    #[error("log mux is already connected")]
    AlreadyConnected,

    #[error("log mux is closed")]
    Closed,
}
