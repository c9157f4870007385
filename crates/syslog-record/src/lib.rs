// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured log records and their wire encoding.
//!
//! A [`LogRecord`] is an immutable, timestamped line of process output plus
//! the routing [`Header`] of the stream it came from. Records render as RFC
//! 5424 syslog messages and travel over byte streams framed with RFC 6587
//! octet counting (`LEN SP MSG`).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod errors;
pub mod record;
pub mod rfc5424;
pub mod rfc6587;

pub use errors::CodecError;
pub use record::{Header, LogRecord};
