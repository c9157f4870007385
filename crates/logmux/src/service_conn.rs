// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A connection to whichever instance currently leads a discovered service.
//!
//! [`ServiceConn`] dials the leader once at construction, then a watch
//! thread follows the discovery feed:
//!
//! ```text
//!             leader(addr) / dial ok
//!   Disconnected ─────────────────────▶ Connected(addr)
//!        ▲                                   │
//!        └──────── leader(addr) / down ──────┘
//!                  (tear down, redial on leader)
//!
//!   up while Disconnected: resolve the leader and dial it
//!
//!   shutdown: any state ──▶ Closed (terminal)
//! ```
//!
//! Writes block while disconnected and resume as soon as a new connection
//! is installed. Only one write is in flight at a time.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, info_span, warn};

use crate::discovery::{Discovery, EventKind, ServiceWatch};
use crate::errors::ConnectError;

/// A byte sink that can be closed explicitly.
pub trait Connection: Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

pub trait Dialer: Send + Sync {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>>;
}

/// Dials plain TCP with Nagle's algorithm disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

enum ConnState {
    Disconnected,
    Connected {
        addr: String,
        conn: Box<dyn Connection>,
    },
    Closed,
}

struct Shared {
    service: String,
    state: Mutex<ConnState>,
    installed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    fn dial(&self, dialer: &dyn Dialer, addr: &str) -> io::Result<()> {
        let conn = dialer.dial(addr)?;
        self.install(addr, conn);
        Ok(())
    }

    fn install(&self, addr: &str, mut conn: Box<dyn Connection>) {
        let mut state = self.lock();
        if matches!(*state, ConnState::Closed) {
            drop(state);
            if let Err(e) = conn.close() {
                debug!(service = %self.service, err = %e, "failed to close late connection");
            }
            return;
        }

        let previous = std::mem::replace(
            &mut *state,
            ConnState::Connected {
                addr: addr.to_string(),
                conn,
            },
        );
        drop(state);
        self.installed.notify_all();
        info!(service = %self.service, addr = %addr, "connected to service leader");

        if let ConnState::Connected { mut conn, .. } = previous {
            close_logged(&self.service, conn.as_mut());
        }
    }

    fn is_disconnected(&self) -> bool {
        matches!(*self.lock(), ConnState::Disconnected)
    }

    /// Drops the live connection, if any. Blocked writers stay blocked.
    fn reset(&self) {
        let mut state = self.lock();
        if !matches!(*state, ConnState::Connected { .. }) {
            return;
        }
        let previous = std::mem::replace(&mut *state, ConnState::Disconnected);
        drop(state);

        if let ConnState::Connected { addr, mut conn } = previous {
            debug!(service = %self.service, addr = %addr, "tearing down connection");
            close_logged(&self.service, conn.as_mut());
        }
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), ConnState::Closed);
        self.installed.notify_all();

        if let ConnState::Connected { mut conn, .. } = previous {
            close_logged(&self.service, conn.as_mut());
        }
    }
}

fn close_logged(service: &str, conn: &mut dyn Connection) {
    if let Err(e) = conn.close() {
        error!(service, err = %e, "failed to close connection");
    }
}

/// Resilient writer for a discovered service.
pub struct ServiceConn {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceConn {
    /// Opens a discovery watch on `service`, resolves its leader and dials
    /// it, then starts the watch thread.
    ///
    /// Failing to open the watch or to resolve the leader is an error. A
    /// failed dial is logged and the connection starts out disconnected.
    pub fn connect(
        discovery: Arc<dyn Discovery>,
        dialer: Arc<dyn Dialer>,
        service: &str,
    ) -> Result<Self, ConnectError> {
        let mut watch = discovery
            .watch(service)
            .map_err(|source| ConnectError::Watch {
                service: service.to_string(),
                source,
            })?;

        let leader = match discovery.leader(service) {
            Ok(leader) => leader,
            Err(source) => {
                if let Err(e) = watch.close() {
                    warn!(service, err = %e, "failed to close discovery watch");
                }
                return Err(ConnectError::Resolve {
                    service: service.to_string(),
                    source,
                });
            }
        };

        let shared = Arc::new(Shared {
            service: service.to_string(),
            state: Mutex::new(ConnState::Disconnected),
            installed: Condvar::new(),
        });

        if let Err(e) = shared.dial(dialer.as_ref(), &leader) {
            error!(service, addr = %leader, err = %e, "failed to dial service leader");
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let watcher = {
            let shared = Arc::clone(&shared);
            let span = info_span!("logmux_service_watch", service);
            thread::Builder::new()
                .name("logmux-service-watch".to_string())
                .spawn(move || {
                    let _entered = span.entered();
                    watch_service(&shared, &*discovery, &*dialer, watch, &shutdown_rx);
                })
                .map_err(|e| ConnectError::Spawn("service watch", e))?
        };

        Ok(Self {
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Writes all of `buf` to the current leader.
    ///
    /// Blocks while no connection is installed. Errors from the underlying
    /// connection are returned as-is; the connection is not torn down.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        #[allow(clippy::expect_used)]
        let mut state = self
            .shared
            .installed
            .wait_while(self.shared.lock(), |state| {
                matches!(state, ConnState::Disconnected)
            })
            .expect("lock poisoned");

        match &mut *state {
            ConnState::Connected { conn, .. } => {
                conn.write_all(buf)?;
                conn.flush()
            }
            ConnState::Closed | ConnState::Disconnected => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.shared.service),
            )),
        }
    }

    /// Address of the leader currently connected to.
    #[must_use]
    pub fn connected_addr(&self) -> Option<String> {
        match &*self.shared.lock() {
            ConnState::Connected { addr, .. } => Some(addr.clone()),
            ConnState::Disconnected | ConnState::Closed => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.shared.lock(), ConnState::Closed)
    }

    /// Stops the watch thread, closes the discovery watch and the live
    /// connection. Safe to call more than once; later calls are no-ops.
    pub fn shutdown(&self) {
        #[allow(clippy::expect_used)]
        let shutdown_tx = self.shutdown_tx.lock().expect("lock poisoned").take();
        // Disconnecting the channel is the signal.
        drop(shutdown_tx);

        #[allow(clippy::expect_used)]
        let watcher = self.watcher.lock().expect("lock poisoned").take();
        if let Some(watcher) = watcher {
            if watcher.join().is_err() {
                error!(service = %self.shared.service, "service watch thread panicked");
                self.shared.close();
            }
        }
    }
}

impl Drop for ServiceConn {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch_service(
    shared: &Shared,
    discovery: &dyn Discovery,
    dialer: &dyn Dialer,
    mut watch: Box<dyn ServiceWatch>,
    shutdown_rx: &Receiver<()>,
) {
    let service = shared.service.as_str();

    loop {
        select! {
            recv(watch.events()) -> event => {
                let Ok(event) = event else {
                    warn!(service, "discovery watch closed, no further leader changes will be seen");
                    let _ = shutdown_rx.recv();
                    break;
                };
                debug!(service, event = %event.kind, addr = ?event.addr, "service event");

                match event.kind {
                    EventKind::Leader => {
                        shared.reset();
                        let addr = match event.addr {
                            Some(addr) => Ok(addr),
                            None => discovery.leader(service).map_err(|e| e.to_string()),
                        };
                        match addr {
                            Ok(addr) => {
                                if let Err(e) = shared.dial(dialer, &addr) {
                                    error!(service, addr = %addr, err = %e, "failed to dial service leader");
                                }
                            }
                            Err(e) => error!(service, err = %e, "failed to resolve service leader"),
                        }
                    }
                    EventKind::Down => shared.reset(),
                    // An instance coming up is a chance to recover from a
                    // failed dial; a live connection is left alone.
                    EventKind::Up if shared.is_disconnected() => {
                        match discovery.leader(service) {
                            Ok(addr) => {
                                if let Err(e) = shared.dial(dialer, &addr) {
                                    debug!(service, addr = %addr, err = %e, "service leader still unreachable");
                                }
                            }
                            Err(e) => debug!(service, err = %e, "failed to resolve service leader"),
                        }
                    }
                    EventKind::Up | EventKind::Current | EventKind::Other => {}
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }

    if let Err(e) = watch.close() {
        error!(service, err = %e, "failed to close discovery watch");
    }
    shared.close();
    debug!(service, "service watch stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::discovery::{ScriptedDiscovery, ServiceEvent};
    use crate::test_support::{eventually, MemoryDialer};
    use std::time::Duration;
    use tracing_test::traced_test;

    const SERVICE: &str = "logaggregator";

    fn connect(discovery: &ScriptedDiscovery, dialer: &MemoryDialer) -> Arc<ServiceConn> {
        Arc::new(
            ServiceConn::connect(
                Arc::new(discovery.clone()),
                Arc::new(dialer.clone()),
                SERVICE,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_connects_to_initial_leader() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();

        let conn = connect(&discovery, &dialer);
        assert_eq!(conn.connected_addr().as_deref(), Some("a:1"));

        conn.write(b"hello").unwrap();
        assert_eq!(dialer.written("a:1"), b"hello");
    }

    #[test]
    fn test_resolve_failure_is_an_error() {
        let discovery = ScriptedDiscovery::new();
        let result = ServiceConn::connect(
            Arc::new(discovery.clone()),
            Arc::new(MemoryDialer::new()),
            SERVICE,
        );
        assert!(matches!(result, Err(ConnectError::Resolve { .. })));
        assert_eq!(discovery.closed_watches(), 1);
    }

    #[test]
    fn test_watch_failure_is_an_error() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        discovery.fail_watch("no backend");
        let result = ServiceConn::connect(
            Arc::new(discovery),
            Arc::new(MemoryDialer::new()),
            SERVICE,
        );
        assert!(matches!(result, Err(ConnectError::Watch { .. })));
    }

    #[test]
    #[traced_test]
    fn test_initial_dial_failure_starts_disconnected() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        dialer.refuse("a:1");

        let conn = connect(&discovery, &dialer);
        assert_eq!(conn.connected_addr(), None);
        assert!(logs_contain("failed to dial service leader"));

        discovery.elect(SERVICE, "b:2");
        assert!(eventually(|| conn.connected_addr().as_deref() == Some("b:2")));
    }

    #[test]
    fn test_leader_change_redials() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        let conn = connect(&discovery, &dialer);

        discovery.elect(SERVICE, "b:2");
        assert!(eventually(|| conn.connected_addr().as_deref() == Some("b:2")));
        assert!(dialer.is_closed("a:1"));

        conn.write(b"to b").unwrap();
        assert_eq!(dialer.written("b:2"), b"to b");
        assert!(dialer.written("a:1").is_empty());
    }

    #[test]
    fn test_down_then_leader_unblocks_writer() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        let conn = connect(&discovery, &dialer);

        discovery.take_down(SERVICE);
        assert!(eventually(|| conn.connected_addr().is_none()));
        assert!(dialer.is_closed("a:1"));

        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.write(b"queued while down"))
        };

        // The writer stays blocked until a leader is installed.
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert!(dialer.written("b:2").is_empty());

        discovery.elect(SERVICE, "b:2");
        writer.join().unwrap().unwrap();

        assert_eq!(conn.connected_addr().as_deref(), Some("b:2"));
        assert_eq!(dialer.written("b:2"), b"queued while down");
    }

    #[test]
    fn test_up_redials_after_failed_dial() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        dialer.refuse("a:1");
        let conn = connect(&discovery, &dialer);
        assert_eq!(conn.connected_addr(), None);

        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.write(b"first record"))
        };

        discovery.emit(SERVICE, ServiceEvent::up("a:1"));
        assert!(eventually(|| dialer.dial_attempts("a:1") == 2));
        assert_eq!(conn.connected_addr(), None);

        dialer.accept("a:1");
        discovery.emit(SERVICE, ServiceEvent::up("a:1"));
        writer.join().unwrap().unwrap();
        assert_eq!(conn.connected_addr().as_deref(), Some("a:1"));
        assert_eq!(dialer.written("a:1"), b"first record");
    }

    #[test]
    fn test_up_leaves_live_connection_alone() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        let conn = connect(&discovery, &dialer);

        discovery.emit(SERVICE, ServiceEvent::up("a:1"));
        // A later leader event is processed after the up event.
        discovery.elect(SERVICE, "b:2");
        assert!(eventually(|| conn.connected_addr().as_deref() == Some("b:2")));
        assert_eq!(dialer.dial_attempts("a:1"), 1);
    }

    #[test]
    fn test_redial_failure_stays_disconnected() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        dialer.refuse("b:2");
        let conn = connect(&discovery, &dialer);

        discovery.elect(SERVICE, "b:2");
        assert!(eventually(|| dialer.dial_attempts("b:2") == 1));
        assert!(eventually(|| conn.connected_addr().is_none()));

        discovery.elect(SERVICE, "c:3");
        assert!(eventually(|| conn.connected_addr().as_deref() == Some("c:3")));
    }

    #[test]
    fn test_write_errors_are_returned() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        dialer.fail_writes("a:1");
        let conn = connect(&discovery, &dialer);

        assert!(conn.write(b"lost").is_err());
        assert_eq!(conn.connected_addr().as_deref(), Some("a:1"));
    }

    #[test]
    fn test_shutdown_is_terminal_and_idempotent() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        let conn = connect(&discovery, &dialer);

        conn.shutdown();
        conn.shutdown();

        assert!(conn.is_closed());
        assert!(dialer.is_closed("a:1"));
        assert_eq!(discovery.closed_watches(), 1);
        assert_eq!(
            conn.write(b"late").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );

        discovery.elect(SERVICE, "b:2");
        assert_eq!(dialer.dial_attempts("b:2"), 0);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let discovery = ScriptedDiscovery::new();
        discovery.set_leader(SERVICE, "a:1");
        let dialer = MemoryDialer::new();
        let conn = connect(&discovery, &dialer);

        let writers: Vec<_> = (0..4u8)
            .map(|i| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    for _ in 0..100 {
                        conn.write(&[b'a' + i; 16]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let written = dialer.written("a:1");
        assert_eq!(written.len(), 4 * 100 * 16);
        for chunk in written.chunks(16) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
