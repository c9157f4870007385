// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory dialer and polling helpers shared by the unit tests.

#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::service_conn::{Connection, Dialer};

#[derive(Default)]
struct Endpoints {
    written: HashMap<String, Vec<u8>>,
    refused: HashSet<String>,
    failing: HashSet<String>,
    closed: HashSet<String>,
    dial_attempts: HashMap<String, usize>,
}

/// Dialer whose connections append to per-address byte buffers.
#[derive(Clone, Default)]
pub(crate) struct MemoryDialer {
    endpoints: Arc<Mutex<Endpoints>>,
}

impl MemoryDialer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse(&self, addr: &str) {
        self.endpoints.lock().unwrap().refused.insert(addr.to_string());
    }

    pub(crate) fn accept(&self, addr: &str) {
        self.endpoints.lock().unwrap().refused.remove(addr);
    }

    pub(crate) fn fail_writes(&self, addr: &str) {
        self.endpoints.lock().unwrap().failing.insert(addr.to_string());
    }

    pub(crate) fn written(&self, addr: &str) -> Vec<u8> {
        self.endpoints
            .lock()
            .unwrap()
            .written
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn is_closed(&self, addr: &str) -> bool {
        self.endpoints.lock().unwrap().closed.contains(addr)
    }

    pub(crate) fn dial_attempts(&self, addr: &str) -> usize {
        self.endpoints
            .lock()
            .unwrap()
            .dial_attempts
            .get(addr)
            .copied()
            .unwrap_or_default()
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        let mut endpoints = self.endpoints.lock().unwrap();
        *endpoints.dial_attempts.entry(addr.to_string()).or_default() += 1;
        if endpoints.refused.contains(addr) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{addr} refused the connection"),
            ));
        }
        endpoints.closed.remove(addr);
        Ok(Box::new(MemoryConnection {
            addr: addr.to_string(),
            endpoints: Arc::clone(&self.endpoints),
        }))
    }
}

struct MemoryConnection {
    addr: String,
    endpoints: Arc<Mutex<Endpoints>>,
}

impl Write for MemoryConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.failing.contains(&self.addr) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        }
        endpoints
            .written
            .entry(self.addr.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn close(&mut self) -> io::Result<()> {
        self.endpoints
            .lock()
            .unwrap()
            .closed
            .insert(self.addr.clone());
        Ok(())
    }
}

/// Dialer that reports each dial on `started` and holds it until
/// `release` is signalled or dropped, then dials through `inner`.
pub(crate) struct GatedDialer {
    inner: MemoryDialer,
    started: Sender<()>,
    release: Receiver<()>,
}

impl GatedDialer {
    /// Returns the dialer with the receiving end of `started` and the
    /// sending end of `release`.
    pub(crate) fn new(inner: MemoryDialer) -> (Self, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        (
            Self {
                inner,
                started: started_tx,
                release: release_rx,
            },
            started_rx,
            release_tx,
        )
    }
}

impl Dialer for GatedDialer {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        self.inner.dial(addr)
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
