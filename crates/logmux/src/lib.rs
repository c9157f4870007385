// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-side log multiplexer.
//!
//! [`LogMux`](logmux::LogMux) follows any number of byte streams, turns
//! every line into a [`LogRecord`](syslog_record::LogRecord) and forwards
//! the records through a single drainer thread to a log aggregator located
//! via service discovery. The connection to the aggregator is a
//! [`ServiceConn`](service_conn::ServiceConn), which follows leader changes
//! and blocks writers while the service is unavailable.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod discovery;
pub mod errors;
pub mod logmux;
pub mod service_conn;

#[cfg(test)]
pub(crate) mod test_support;

pub use logmux::{FollowConfig, LogMux};
