// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-in of many output streams into one bounded queue, drained to a
//! discovered log aggregator.
//!
//! ```text
//!   stream ─▶ follower ─┐
//!   stream ─▶ follower ─┼─▶ bounded queue ─▶ drainer ─▶ ServiceConn ─▶ aggregator
//!   stream ─▶ follower ─┘    (drop newest      │
//!                             when full)       └─▶ local log on write failure
//! ```
//!
//! Records are buffered until [`LogMux::connect`] starts the drainer. When
//! the queue is full, the record being added is dropped; records already
//! queued are never evicted and followers never block on the queue.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use syslog_record::{Header, LogRecord};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::discovery::Discovery;
use crate::errors::ConnectError;
use crate::service_conn::{Dialer, ServiceConn, TcpDialer};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Routing metadata for a followed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowConfig {
    pub app_name: String,
    pub ip: String,
    pub job_type: String,
    pub job_id: String,
}

impl FollowConfig {
    /// Builds the header stamped on every record read from descriptor `fd`.
    ///
    /// An empty app name falls back to the job id.
    #[must_use]
    pub fn header(&self, fd: u32) -> Header {
        let app_name = if self.app_name.is_empty() {
            &self.job_id
        } else {
            &self.app_name
        };
        Header::new(
            self.ip.as_str(),
            app_name.as_str(),
            format!("{}.{}", self.job_type, self.job_id),
            format!("ID{fd}"),
        )
    }
}

/// Counts live followers so `close` can wait for all of them.
///
/// A counted wait group rather than `crossbeam_utils::sync::WaitGroup`,
/// which cannot report how many members are still live and so could not
/// back [`LogMux::active_followers`].
#[derive(Default)]
struct ProducerGroup {
    active: Mutex<usize>,
    finished: Condvar,
}

impl ProducerGroup {
    fn lock(&self) -> MutexGuard<'_, usize> {
        #[allow(clippy::expect_used)]
        self.active.lock().expect("lock poisoned")
    }

    fn enter(self: &Arc<Self>) -> ProducerGuard {
        *self.lock() += 1;
        ProducerGuard(Arc::clone(self))
    }

    fn active(&self) -> usize {
        *self.lock()
    }

    fn wait(&self) {
        #[allow(clippy::expect_used)]
        let _idle = self
            .finished
            .wait_while(self.lock(), |active| *active > 0)
            .expect("lock poisoned");
    }
}

/// Leaves the group when dropped, including when the follower thread
/// could not be spawned.
struct ProducerGuard(Arc<ProducerGroup>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        let mut active = self.0.lock();
        *active -= 1;
        if *active == 0 {
            self.0.finished.notify_all();
        }
    }
}

struct MuxState {
    /// `None` once the queue has been closed for writes.
    tx: Option<Sender<Arc<LogRecord>>>,
    /// Handed to the drainer on connect.
    rx: Option<Receiver<Arc<LogRecord>>>,
    /// Held by the drainer while it runs. Dropped by `close` when no drainer
    /// was ever started so that waiting on `drained_rx` returns at once.
    drained_tx: Option<Sender<()>>,
}

impl MuxState {
    fn check_connectable(&self) -> Result<(), ConnectError> {
        if self.tx.is_none() {
            return Err(ConnectError::Closed);
        }
        if self.rx.is_none() || self.drained_tx.is_none() {
            return Err(ConnectError::AlreadyConnected);
        }
        Ok(())
    }
}

pub struct LogMux {
    capacity: usize,
    state: Mutex<MuxState>,
    producers: Arc<ProducerGroup>,
    drained_rx: Receiver<()>,
}

impl Default for LogMux {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl LogMux {
    /// Returns a multiplexer buffering up to `capacity` records.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let (drained_tx, drained_rx) = bounded(0);
        Self {
            capacity,
            state: Mutex::new(MuxState {
                tx: Some(tx),
                rx: Some(rx),
                drained_tx: Some(drained_tx),
            }),
            producers: Arc::new(ProducerGroup::default()),
            drained_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of followers that have not reached the end of their stream.
    #[must_use]
    pub fn active_followers(&self) -> usize {
        self.producers.active()
    }

    /// Starts a follower thread forwarding every line of `reader`.
    ///
    /// Returns immediately. Read errors end the follower and are only
    /// logged. Following after `close` is ignored.
    pub fn follow<R>(&self, reader: R, fd: u32, config: &FollowConfig)
    where
        R: Read + Send + 'static,
    {
        let Some(tx) = self.lock().tx.clone() else {
            warn!(fd, "log mux is closed, not following stream");
            return;
        };

        let header = Arc::new(config.header(fd));
        let guard = self.producers.enter();
        let span = info_span!("logmux_follow", fd);

        let spawned = thread::Builder::new()
            .name(format!("logmux-follow-{fd}"))
            .spawn(move || {
                let _entered = span.entered();
                let _guard = guard;
                follow(reader, &header, tx);
            });
        if let Err(e) = spawned {
            error!(fd, err = %e, "failed to spawn follower thread");
        }
    }

    /// Connects to the leader of `service` over TCP and starts draining.
    pub fn connect(&self, discovery: Arc<dyn Discovery>, service: &str) -> Result<(), ConnectError> {
        self.connect_with(discovery, Arc::new(TcpDialer), service)
    }

    /// Like [`LogMux::connect`] with a caller-supplied dialer.
    ///
    /// Fails if the service cannot be watched or resolved. If only the
    /// initial dial fails, the connection retries on the next leader event
    /// and this still succeeds.
    ///
    /// The dial runs without holding the mux state, so `follow` and `close`
    /// are not held up by a slow aggregator. When `close` or another
    /// `connect` wins while the dial is in flight, the new connection is
    /// shut down and the matching error is returned.
    pub fn connect_with(
        &self,
        discovery: Arc<dyn Discovery>,
        dialer: Arc<dyn Dialer>,
        service: &str,
    ) -> Result<(), ConnectError> {
        self.lock().check_connectable()?;

        let conn = Arc::new(ServiceConn::connect(discovery, dialer, service)?);

        let taken = {
            let mut state = self.lock();
            state
                .check_connectable()
                .and_then(|()| match (state.rx.take(), state.drained_tx.take()) {
                    (Some(rx), Some(drained_tx)) => Ok((rx, drained_tx)),
                    _ => Err(ConnectError::AlreadyConnected),
                })
        };
        let (rx, drained_tx) = match taken {
            Ok(taken) => taken,
            Err(e) => {
                debug!(service, err = %e, "discarding connection made during close or a rival connect");
                conn.shutdown();
                return Err(e);
            }
        };
        let spawned = {
            let conn = Arc::clone(&conn);
            let span = info_span!("logmux_drain", service);
            thread::Builder::new()
                .name("logmux-drain".to_string())
                .spawn(move || {
                    let _entered = span.entered();
                    drain_to(&rx, &conn);
                    conn.shutdown();
                    drop(drained_tx);
                })
        };
        if let Err(e) = spawned {
            // The closure is gone along with the receiver and the drained
            // sender, so `close` will not wait on a drainer.
            conn.shutdown();
            return Err(ConnectError::Spawn("drain", e));
        }

        info!(service, "log mux connected");
        Ok(())
    }

    /// Waits for every follower to finish, closes the queue, then waits for
    /// the drainer to forward the backlog and exit.
    ///
    /// Returns once the followers are done when `connect` was never called.
    /// Safe to call repeatedly and from several threads.
    pub fn close(&self) {
        self.producers.wait();

        {
            let mut state = self.lock();
            state.tx.take();
            state.drained_tx.take();
        }

        // Disconnects once the drainer, if any, has exited.
        let _ = self.drained_rx.recv();
        debug!("log mux closed");
    }
}

fn follow<R: Read>(reader: R, header: &Arc<Header>, tx: Sender<Arc<LogRecord>>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(err = %e, "failed to read log stream");
                return;
            }
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        let record = Arc::new(LogRecord::new(Arc::clone(header), line.as_slice()));
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("log queue full, dropping record"),
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

fn drain_to(rx: &Receiver<Arc<LogRecord>>, conn: &ServiceConn) {
    for record in rx {
        if let Err(e) = conn.write(&record.to_frame()) {
            error!(err = %e, "failed to write to log aggregator, logging locally");

            log_locally(&record);
            for record in rx {
                log_locally(&record);
            }
            return;
        }
    }
}

fn log_locally(record: &LogRecord) {
    info!(target: "logmux::fallback", msg = %record, "log record");
}
