// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiving side of the log pipeline.
//!
//! The [`IntakeServer`](server::IntakeServer) accepts octet-counted RFC 5424
//! frames over TCP and hands each record to the
//! [`Aggregator`](aggregator::Aggregator), which keeps one
//! [`RingBuffer`](ring::RingBuffer) per destination. Buffers retain a
//! bounded window of recent records and support live subscriptions.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod errors;
pub mod ring;
pub mod server;
