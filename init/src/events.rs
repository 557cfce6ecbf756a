//! Service events and the broadcast bus that carries them.
//!
//! Every state transition and every notable runner message becomes an
//! [`Event`]. Events are published on a [`Bus`] (a thin wrapper over
//! `tokio::sync::broadcast`): publishing never blocks, receivers that fall
//! behind observe `RecvError::Lagged`, and events sent while nobody listens
//! are dropped.

use crate::service::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A single service event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Service ID
    pub service: String,
    /// State the service was in when the event was emitted
    pub state: ServiceState,
    /// Human-readable message
    pub message: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn now(service: &str, state: ServiceState, message: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast channel for service events.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus; capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// A receiver only gets events sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// Where a runner reports what it is doing.
///
/// Bound to one service ID; runners only supply the message.
#[derive(Clone, Debug)]
pub struct EventSink {
    service: String,
    bus: Bus,
}

impl EventSink {
    pub fn new(service: impl Into<String>, bus: Bus) -> Self {
        Self {
            service: service.into(),
            bus,
        }
    }

    /// A sink whose events nobody receives.
    pub fn discard(service: impl Into<String>) -> Self {
        Self::new(service, Bus::new(1))
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Report a message from a running runner.
    pub fn running(&self, message: impl Into<String>) {
        self.bus
            .publish(Event::now(&self.service, ServiceState::Running, message));
    }
}
