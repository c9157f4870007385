// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service discovery boundary.
//!
//! The log mux only needs two things from discovery: the address of a
//! service's current leader, and a feed of events telling it when that
//! leader changes or the service goes away. [`StaticDiscovery`] serves fixed
//! addresses; [`ScriptedDiscovery`] lets callers push events by hand so a
//! sequence of leader changes and outages can be replayed deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use derive_more::Display;

use crate::errors::DiscoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EventKind {
    #[display("leader")]
    Leader,
    #[display("up")]
    Up,
    #[display("down")]
    Down,
    #[display("current")]
    Current,
    #[display("other")]
    Other,
}

/// A change in the membership of a watched service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub kind: EventKind,
    /// Address of the instance the event is about, when known.
    pub addr: Option<String>,
}

impl ServiceEvent {
    #[must_use]
    pub fn leader(addr: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Leader,
            addr: Some(addr.into()),
        }
    }

    #[must_use]
    pub fn up(addr: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Up,
            addr: Some(addr.into()),
        }
    }

    #[must_use]
    pub fn down(addr: Option<String>) -> Self {
        Self {
            kind: EventKind::Down,
            addr,
        }
    }
}

pub trait Discovery: Send + Sync {
    /// Resolves the address of the current leader of `service`.
    fn leader(&self, service: &str) -> Result<String, DiscoveryError>;

    /// Opens a feed of membership events for `service`.
    fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatch>, DiscoveryError>;
}

/// An open event feed. Closing it releases the backend's resources; the
/// receiver disconnects once the backend stops sending.
pub trait ServiceWatch: Send {
    fn events(&self) -> &Receiver<ServiceEvent>;

    fn close(&mut self) -> Result<(), DiscoveryError>;
}

/// Discovery backed by a fixed map of service names to addresses.
///
/// Watches are silent unless an announce interval is set, in which case
/// each watch repeats an `Up` event for the service's address at that
/// interval. That gives a connection whose first dial failed a chance to
/// retry.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, String>,
    announce_interval: Option<Duration>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>, addr: impl Into<String>) -> Self {
        self.services.insert(service.into(), addr.into());
        self
    }

    #[must_use]
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = Some(interval);
        self
    }
}

impl Discovery for StaticDiscovery {
    fn leader(&self, service: &str) -> Result<String, DiscoveryError> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))
    }

    fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatch>, DiscoveryError> {
        let addr = self.leader(service)?;
        let (tx, rx) = unbounded();

        let Some(interval) = self.announce_interval else {
            return Ok(Box::new(StaticWatch {
                rx,
                feed: Some(tx),
                stop_tx: None,
                announcer: None,
            }));
        };

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let announcer = thread::Builder::new()
            .name("logmux-static-announce".to_string())
            .spawn(move || announce(&tx, &stop_rx, &addr, interval))
            .map_err(|e| DiscoveryError::Watch(e.to_string()))?;
        Ok(Box::new(StaticWatch {
            rx,
            feed: None,
            stop_tx: Some(stop_tx),
            announcer: Some(announcer),
        }))
    }
}

fn announce(tx: &Sender<ServiceEvent>, stop_rx: &Receiver<()>, addr: &str, interval: Duration) {
    loop {
        select! {
            recv(stop_rx) -> _ => return,
            default(interval) => {
                if tx.send(ServiceEvent::up(addr)).is_err() {
                    return;
                }
            }
        }
    }
}

struct StaticWatch {
    rx: Receiver<ServiceEvent>,
    // Keeps a silent feed open.
    feed: Option<Sender<ServiceEvent>>,
    stop_tx: Option<Sender<()>>,
    announcer: Option<JoinHandle<()>>,
}

impl ServiceWatch for StaticWatch {
    fn events(&self) -> &Receiver<ServiceEvent> {
        &self.rx
    }

    fn close(&mut self) -> Result<(), DiscoveryError> {
        self.feed.take();
        self.stop_tx.take();
        if let Some(announcer) = self.announcer.take() {
            announcer
                .join()
                .map_err(|_| DiscoveryError::Watch("announcer thread panicked".to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    leaders: HashMap<String, String>,
    watchers: HashMap<String, Vec<Sender<ServiceEvent>>>,
    fail_watch: Option<String>,
    closed_watches: usize,
}

/// Discovery whose state and event feed are driven by the caller.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDiscovery {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Sets the leader `leader()` resolves to without emitting an event.
    pub fn set_leader(&self, service: &str, addr: impl Into<String>) {
        self.lock().leaders.insert(service.to_string(), addr.into());
    }

    /// Makes the next `watch()` calls fail with `reason`.
    pub fn fail_watch(&self, reason: impl Into<String>) {
        self.lock().fail_watch = Some(reason.into());
    }

    /// Sets a new leader and announces it to every open watch.
    pub fn elect(&self, service: &str, addr: impl Into<String>) {
        let addr = addr.into();
        self.set_leader(service, addr.clone());
        self.emit(service, ServiceEvent::leader(addr));
    }

    /// Forgets the leader and announces the outage to every open watch.
    pub fn take_down(&self, service: &str) {
        let addr = self.lock().leaders.remove(service);
        self.emit(service, ServiceEvent::down(addr));
    }

    /// Sends `event` to every open watch of `service`, pruning closed ones.
    pub fn emit(&self, service: &str, event: ServiceEvent) {
        let mut state = self.lock();
        if let Some(watchers) = state.watchers.get_mut(service) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of watches that have been closed by their owner.
    #[must_use]
    pub fn closed_watches(&self) -> usize {
        self.lock().closed_watches
    }

    /// Number of watches of `service` still open.
    #[must_use]
    pub fn open_watches(&self, service: &str) -> usize {
        self.lock().watchers.get(service).map_or(0, Vec::len)
    }
}

impl Discovery for ScriptedDiscovery {
    fn leader(&self, service: &str) -> Result<String, DiscoveryError> {
        self.lock()
            .leaders
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoLeader(service.to_string()))
    }

    fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatch>, DiscoveryError> {
        let mut state = self.lock();
        if let Some(reason) = &state.fail_watch {
            return Err(DiscoveryError::Watch(reason.clone()));
        }
        let (tx, rx) = unbounded();
        state
            .watchers
            .entry(service.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(ScriptedWatch {
            rx,
            service: service.to_string(),
            discovery: self.clone(),
            closed: false,
        }))
    }
}

struct ScriptedWatch {
    rx: Receiver<ServiceEvent>,
    service: String,
    discovery: ScriptedDiscovery,
    closed: bool,
}

impl ServiceWatch for ScriptedWatch {
    fn events(&self) -> &Receiver<ServiceEvent> {
        &self.rx
    }

    fn close(&mut self) -> Result<(), DiscoveryError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.discovery.lock();
        state.closed_watches += 1;
        // Dropping the senders disconnects every receiver of this service;
        // watches are single-owner in practice.
        state.watchers.remove(&self.service);
        Ok(())
    }
}
