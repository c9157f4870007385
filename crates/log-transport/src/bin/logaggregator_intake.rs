// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the log intake server until interrupted.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use log_transport::{logger, TransportConfig};
use logaggregator::aggregator::Aggregator;
use logaggregator::server::IntakeServer;

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match TransportConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logaggregator-intake: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger::init(&config.log_level) {
        eprintln!("logaggregator-intake: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let aggregator = Arc::new(Aggregator::new(
        config.ring_capacity,
        config.subscription_capacity,
    ));
    let cancel_token = CancellationToken::new();
    let server = match IntakeServer::bind(
        &config.listen_addr,
        Arc::clone(&aggregator),
        cancel_token.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Error starting log intake: {e}");
            return ExitCode::FAILURE;
        }
    };

    let spin = tokio::spawn(server.spin());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutting down log intake");
    cancel_token.cancel();
    if let Err(e) = spin.await {
        error!("log intake task failed: {e}");
    }

    for app_name in aggregator.destinations() {
        if let Some(buffer) = aggregator.buffer(&app_name) {
            debug!(app_name = %app_name, records = buffer.len(), "discarding log buffer");
        }
        aggregator.remove(&app_name);
    }
    ExitCode::SUCCESS
}
