// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards this process's standard input to the log aggregator, one record
//! per line, until the input ends.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};

use log_transport::{logger, TransportConfig};
use logmux::discovery::StaticDiscovery;
use logmux::LogMux;

const STDIN_FD: u32 = 0;

pub fn main() -> ExitCode {
    let config = match TransportConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logmux-agent: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger::init(&config.log_level) {
        eprintln!("logmux-agent: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let discovery = Arc::new(
        StaticDiscovery::new()
            .with_service(config.service.as_str(), config.aggregator_addr.as_str())
            .with_announce_interval(config.redial_interval),
    );
    let mux = LogMux::new(config.queue_capacity);
    mux.follow(io::stdin(), STDIN_FD, &config.follow_config());

    let connected = match mux.connect(discovery, &config.service) {
        Ok(()) => true,
        Err(e) => {
            error!("failed to connect to {}: {e}", config.service);
            false
        }
    };

    mux.close();
    info!("standard input closed, log mux stopped");
    if connected {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
