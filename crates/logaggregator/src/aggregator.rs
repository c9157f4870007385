// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use syslog_record::LogRecord;
use tracing::debug;

use crate::ring::{RingBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_SUBSCRIPTION_CAPACITY};

/// Registry of per-application ring buffers.
///
/// Records are filed under their header's app name. Buffers are created on
/// first use and live until removed.
#[derive(Debug)]
pub struct Aggregator {
    buffer_capacity: usize,
    subscription_capacity: usize,
    buffers: Mutex<HashMap<String, Arc<RingBuffer>>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl Aggregator {
    #[must_use]
    pub fn new(buffer_capacity: usize, subscription_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            subscription_capacity,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RingBuffer>>> {
        #[allow(clippy::expect_used)]
        self.buffers.lock().expect("lock poisoned")
    }

    /// Files `record` under its app name.
    pub fn feed(&self, record: LogRecord) {
        let buffer = self.get_or_create(&record.app_name());
        buffer.add(Arc::new(record));
    }

    #[must_use]
    pub fn buffer(&self, app_name: &str) -> Option<Arc<RingBuffer>> {
        self.lock().get(app_name).cloned()
    }

    pub fn get_or_create(&self, app_name: &str) -> Arc<RingBuffer> {
        let mut buffers = self.lock();
        if let Some(buffer) = buffers.get(app_name) {
            return Arc::clone(buffer);
        }
        debug!(app_name, "creating log buffer");
        let buffer = Arc::new(RingBuffer::new(
            self.buffer_capacity,
            self.subscription_capacity,
        ));
        buffers.insert(app_name.to_string(), Arc::clone(&buffer));
        buffer
    }

    /// Drops the buffer for `app_name` and ends its subscriptions.
    pub fn remove(&self, app_name: &str) -> bool {
        let removed = self.lock().remove(app_name);
        match removed {
            Some(buffer) => {
                buffer.close_subscriptions();
                debug!(app_name, "removed log buffer");
                true
            }
            None => false,
        }
    }

    /// Names of every app with a buffer, sorted.
    #[must_use]
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
