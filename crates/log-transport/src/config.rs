// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use logaggregator::ring::{DEFAULT_BUFFER_CAPACITY, DEFAULT_SUBSCRIPTION_CAPACITY};
use logmux::logmux::DEFAULT_QUEUE_CAPACITY;
use logmux::FollowConfig;

use crate::error::ConfigError;

const DEFAULT_SERVICE: &str = "logaggregator";
const DEFAULT_AGGREGATOR_ADDR: &str = "127.0.0.1:5514";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5514";
const DEFAULT_REDIAL_INTERVAL_MS: u64 = 1_000;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration shared by the forwarding agent and the aggregator intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Records buffered between followers and the drainer
    pub queue_capacity: usize,
    /// Discovery name of the aggregator service
    pub service: String,
    /// Address the agent treats as the aggregator leader
    pub aggregator_addr: String,
    /// How often the agent retries an unreachable aggregator
    pub redial_interval: Duration,
    /// Records retained per destination by the aggregator
    pub ring_capacity: usize,
    /// Records queued per live subscription
    pub subscription_capacity: usize,
    /// Address the intake server binds to
    pub listen_addr: String,
    pub app_name: String,
    pub job_type: String,
    pub job_id: String,
    pub host_ip: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            service: DEFAULT_SERVICE.to_string(),
            aggregator_addr: DEFAULT_AGGREGATOR_ADDR.to_string(),
            redial_interval: Duration::from_millis(DEFAULT_REDIAL_INTERVAL_MS),
            ring_capacity: DEFAULT_BUFFER_CAPACITY,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            app_name: String::new(),
            job_type: String::new(),
            job_id: String::new(),
            host_ip: String::new(),
            log_level: "info".to_string(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl TransportConfig {
    /// Reads the `LOGMUX_*` environment and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            queue_capacity: env_usize("LOGMUX_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY),
            service: env_string("LOGMUX_SERVICE", DEFAULT_SERVICE),
            aggregator_addr: env_string("LOGMUX_AGGREGATOR_ADDR", DEFAULT_AGGREGATOR_ADDR),
            redial_interval: Duration::from_millis(env_u64(
                "LOGMUX_REDIAL_INTERVAL_MS",
                DEFAULT_REDIAL_INTERVAL_MS,
            )),
            ring_capacity: env_usize("LOGMUX_RING_CAPACITY", DEFAULT_BUFFER_CAPACITY),
            subscription_capacity: env_usize(
                "LOGMUX_SUBSCRIPTION_CAPACITY",
                DEFAULT_SUBSCRIPTION_CAPACITY,
            ),
            listen_addr: env_string("LOGMUX_LISTEN_ADDR", DEFAULT_LISTEN_ADDR),
            app_name: env_string("LOGMUX_APP_NAME", ""),
            job_type: env_string("LOGMUX_JOB_TYPE", ""),
            job_id: env_string("LOGMUX_JOB_ID", ""),
            host_ip: env_string("LOGMUX_HOST_IP", ""),
            log_level: env::var("LOGMUX_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGMUX_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGMUX_RING_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.subscription_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "LOGMUX_SUBSCRIPTION_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.redial_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "LOGMUX_REDIAL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.service.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "LOGMUX_SERVICE cannot be empty".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Routing for records read from this process's own descriptors.
    #[must_use]
    pub fn follow_config(&self) -> FollowConfig {
        FollowConfig {
            app_name: self.app_name.clone(),
            ip: self.host_ip.clone(),
            job_type: self.job_type.clone(),
            job_id: self.job_id.clone(),
        }
    }
}
