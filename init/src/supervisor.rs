//! Service supervisor.
//!
//! Owns the registry of [`ServiceRunner`]s and the tasks driving them.
//! Registration is idempotent per service ID and stops once shutdown began.
//!
//! Shutdown runs in two waves: every non-foundational service is signalled
//! first, then after a settling interval everything is signalled, so the
//! container runtime outlives the containers it hosts.

use crate::events::{Bus, Event};
use crate::service::{Service, ServiceStatus};
use crate::service_runner::ServiceRunner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use userdata::UserData;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pause between the two shutdown waves
    pub shutdown_settle: Duration,
    /// Services stopped only in the second wave
    pub foundational: Vec<String>,
    /// Event bus capacity
    pub bus_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_settle: Duration::from_secs(10),
            foundational: vec!["containerd".to_string(), "udevd".to_string()],
            bus_capacity: 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn with_shutdown_settle(mut self, settle: Duration) -> Self {
        self.shutdown_settle = settle;
        self
    }

    pub fn is_foundational(&self, id: &str) -> bool {
        self.foundational.iter().any(|f| f == id)
    }
}

#[derive(Default)]
struct Registry {
    runners: HashMap<String, Arc<ServiceRunner>>,
    terminating: bool,
}

/// Starts services and shuts them down in order.
pub struct Supervisor {
    data: Arc<UserData>,
    config: SupervisorConfig,
    registry: Mutex<Registry>,
    tracker: TaskTracker,
    bus: Bus,
}

impl Supervisor {
    pub fn new(data: Arc<UserData>, config: SupervisorConfig) -> Self {
        let bus = Bus::new(config.bus_capacity);
        Self {
            data,
            config,
            registry: Mutex::new(Registry::default()),
            tracker: TaskTracker::new(),
            bus,
        }
    }

    /// Register and launch services whose IDs are not registered yet.
    ///
    /// Does nothing once shutdown has begun.
    pub async fn start(&self, services: Vec<Arc<dyn Service>>) {
        let mut registry = self.registry.lock().await;
        if registry.terminating {
            debug!("Supervisor is terminating, ignoring start request");
            return;
        }

        for service in services {
            let id = service.id(&self.data);
            if registry.runners.contains_key(&id) {
                debug!(service = %id, "Service already registered");
                continue;
            }

            let runner = Arc::new(ServiceRunner::new(
                service,
                Arc::clone(&self.data),
                self.bus.clone(),
            ));
            registry.runners.insert(id.clone(), Arc::clone(&runner));

            info!(service = %id, "Starting service");
            self.tracker.spawn(async move { runner.start().await });
        }
    }

    /// Stop every service and wait until all of them terminated.
    ///
    /// Only the first call runs the shutdown sequence; every call returns
    /// once all service tasks have exited.
    pub async fn shutdown(&self) {
        let runners: Vec<Arc<ServiceRunner>> = {
            let mut registry = self.registry.lock().await;
            if registry.terminating {
                drop(registry);
                self.tracker.wait().await;
                return;
            }
            registry.terminating = true;
            self.tracker.close();
            registry.runners.values().cloned().collect()
        };

        info!(services = runners.len(), "Shutting down services");

        let (foundational, others): (Vec<_>, Vec<_>) = runners
            .iter()
            .partition(|r| self.config.is_foundational(r.id()));

        for runner in &others {
            debug!(service = %runner.id(), "Stopping service");
            runner.shutdown();
        }

        if !foundational.is_empty() {
            debug!(settle = ?self.config.shutdown_settle, "Waiting before stopping foundational services");
            tokio::time::sleep(self.config.shutdown_settle).await;
        }

        for runner in &runners {
            runner.shutdown();
        }

        self.tracker.wait().await;
        info!("All services terminated");
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.registry.lock().await.runners.contains_key(id)
    }

    pub async fn is_terminating(&self) -> bool {
        self.registry.lock().await.terminating
    }

    pub async fn status(&self, id: &str) -> Option<ServiceStatus> {
        let runner = self.registry.lock().await.runners.get(id).cloned()?;
        Some(runner.status().await)
    }

    /// Status of every registered service, sorted by ID.
    pub async fn statuses(&self) -> Vec<ServiceStatus> {
        let runners: Vec<Arc<ServiceRunner>> =
            self.registry.lock().await.runners.values().cloned().collect();

        let mut statuses = Vec::with_capacity(runners.len());
        for runner in runners {
            statuses.push(runner.status().await);
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Stream of service events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}
