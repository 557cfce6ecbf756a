//! Per-service lifecycle.
//!
//! A [`ServiceRunner`] drives one service through
//!
//! ```text
//! Created → PreStartRunning → AwaitingCondition → RunnerStarting
//!         → Running → Stopping → PostStopRunning → Terminated
//! ```
//!
//! Every blocking stage is raced against the runner's shutdown token. A
//! failure before `Running` skips straight to `Terminated`; once a runner
//! exists it is always closed and the post hook always runs.

use crate::error::{Error, Result};
use crate::events::{Bus, Event, EventSink};
use crate::runner::Runner;
use crate::service::{Service, ServiceState, ServiceStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use userdata::UserData;

/// Events kept per service for status queries.
pub const EVENT_HISTORY: usize = 32;

#[derive(Debug, Default)]
struct Record {
    state: ServiceState,
    last_error: Option<String>,
    events: VecDeque<Event>,
}

/// Runs one service from its pre hook to termination.
pub struct ServiceRunner {
    id: String,
    service: Arc<dyn Service>,
    data: Arc<UserData>,
    bus: Bus,
    token: CancellationToken,
    record: RwLock<Record>,
}

impl ServiceRunner {
    pub fn new(service: Arc<dyn Service>, data: Arc<UserData>, bus: Bus) -> Self {
        let id = service.id(&data);
        Self {
            id,
            service,
            data,
            bus,
            token: CancellationToken::new(),
            record: RwLock::new(Record::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request shutdown. Safe to call any number of times, in any state.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn state(&self) -> ServiceState {
        self.record.read().await.state
    }

    pub async fn status(&self) -> ServiceStatus {
        let record = self.record.read().await;
        ServiceStatus {
            id: self.id.clone(),
            state: record.state,
            last_error: record.last_error.clone(),
            events: record.events.iter().cloned().collect(),
        }
    }

    async fn transition(&self, state: ServiceState, message: impl Into<String>) {
        let event = Event::now(&self.id, state, message);
        info!(service = %self.id, state = %state, "{}", event.message);

        {
            let mut record = self.record.write().await;
            record.state = state;
            if record.events.len() == EVENT_HISTORY {
                record.events.pop_front();
            }
            record.events.push_back(event.clone());
        }

        self.bus.publish(event);
    }

    async fn record_error(&self, err: &Error) {
        match err {
            Error::Cancelled => debug!(service = %self.id, "Stage cancelled by shutdown"),
            e => error!(service = %self.id, error = %e, "Service failed"),
        }
        self.record.write().await.last_error = Some(err.to_string());
    }

    /// Attribute a hook failure to this service unless it already is.
    fn hook_error(&self, hook: &'static str, err: Error) -> Error {
        match err {
            Error::Cancelled | Error::Hook { .. } => err,
            e => Error::hook(&self.id, hook, e),
        }
    }

    async fn abort(&self, err: Error) {
        self.record_error(&err).await;
        self.transition(ServiceState::Terminated, format!("Aborted: {}", err)).await;
    }

    /// Drive the service until it reaches [`ServiceState::Terminated`].
    ///
    /// Setup failures are recorded and end the lifecycle; they are never
    /// retried here.
    pub async fn start(&self) {
        self.transition(ServiceState::PreStartRunning, "Running pre stage").await;

        let pre = tokio::select! {
            res = self.service.pre(&self.data) => res.map_err(|e| self.hook_error("pre", e)),
            _ = self.token.cancelled() => Err(Error::Cancelled),
        };
        if let Err(e) = pre {
            return self.abort(e).await;
        }

        match self.service.condition(&self.data) {
            Some(condition) => {
                self.transition(
                    ServiceState::AwaitingCondition,
                    format!("Waiting for {}", condition),
                )
                .await;
                if let Err(e) = condition.wait(&self.token).await {
                    return self.abort(e).await;
                }
            }
            None => {
                self.transition(ServiceState::AwaitingCondition, "No start condition").await;
            }
        }

        self.transition(ServiceState::RunnerStarting, "Starting runner").await;

        let runner = match self.service.runner(&self.data) {
            Ok(runner) => runner,
            Err(e) => {
                return self
                    .abort(Error::RunnerFactory {
                        service: self.id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
            }
        };

        if self.token.is_cancelled() {
            return self.abort(Error::Cancelled).await;
        }

        let opened = tokio::select! {
            res = runner.open() => res,
            _ = self.token.cancelled() => Err(Error::Cancelled),
        };
        if let Err(e) = opened {
            if let Err(close_err) = runner.close().await {
                warn!(service = %self.id, error = %close_err, "Failed to close runner");
            }
            return self.abort(e).await;
        }

        self.transition(ServiceState::Running, "Service started").await;
        if let Err(e) = self.run(runner.as_ref()).await {
            self.record_error(&e).await;
        }

        self.transition(ServiceState::PostStopRunning, "Running post stage").await;
        if let Err(e) = self.service.post(&self.data).await {
            self.record_error(&self.hook_error("post", e)).await;
        }

        self.transition(ServiceState::Terminated, "Service terminated").await;
    }

    /// Run until the runner exits or shutdown fires, then close it.
    async fn run(&self, runner: &dyn Runner) -> Result<()> {
        let sink = EventSink::new(self.id.clone(), self.bus.clone());
        let run = runner.run(&sink);
        tokio::pin!(run);

        let result = tokio::select! {
            res = &mut run => {
                let message = match &res {
                    Ok(()) => "Runner finished".to_string(),
                    Err(e) => format!("Runner failed: {}", e),
                };
                self.transition(ServiceState::Stopping, message).await;
                res
            }
            _ = self.token.cancelled() => {
                self.transition(ServiceState::Stopping, "Shutdown requested").await;
                if let Err(e) = runner.close().await {
                    warn!(service = %self.id, error = %e, "Failed to close runner");
                }
                return run.await;
            }
        };

        if let Err(e) = runner.close().await {
            warn!(service = %self.id, error = %e, "Failed to close runner");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{wait_for_files_to_exist, Condition};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        runners: AtomicUsize,
        opened: AtomicUsize,
        runs: AtomicUsize,
        closed: AtomicUsize,
        posts: AtomicUsize,
    }

    #[derive(Clone, Copy, Default, PartialEq)]
    enum Open {
        #[default]
        Succeed,
        Fail,
        Hang,
    }

    struct TestRunner {
        block: bool,
        open: Open,
        counters: Arc<Counters>,
        stop: CancellationToken,
    }

    #[async_trait]
    impl Runner for TestRunner {
        fn id(&self) -> &str {
            "test"
        }

        async fn open(&self) -> Result<()> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            match self.open {
                Open::Succeed => Ok(()),
                Open::Fail => Err(Error::Backend("image pull failed".to_string())),
                Open::Hang => std::future::pending().await,
            }
        }

        async fn run(&self, _events: &EventSink) -> Result<()> {
            self.counters.runs.fetch_add(1, Ordering::SeqCst);
            if self.block {
                self.stop.cancelled().await;
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            self.stop.cancel();
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestService {
        fail_pre: bool,
        hang_pre: bool,
        fail_post: bool,
        fail_runner: bool,
        gate: Option<PathBuf>,
        open: Open,
        block: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Service for TestService {
        fn id(&self, _data: &UserData) -> String {
            "test".to_string()
        }

        async fn pre(&self, _data: &UserData) -> Result<()> {
            if self.hang_pre {
                std::future::pending::<()>().await;
            }
            if self.fail_pre {
                return Err(Error::Condition("no disk".to_string()));
            }
            Ok(())
        }

        fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
            self.gate.as_ref().map(|p| {
                Box::new(wait_for_files_to_exist([p]).with_interval(Duration::from_millis(10)))
                    as Box<dyn Condition>
            })
        }

        fn runner(&self, _data: &UserData) -> Result<Box<dyn Runner>> {
            self.counters.runners.fetch_add(1, Ordering::SeqCst);
            if self.fail_runner {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "kubeadm-flags.env",
                )));
            }
            Ok(Box::new(TestRunner {
                block: self.block,
                open: self.open,
                counters: Arc::clone(&self.counters),
                stop: CancellationToken::new(),
            }))
        }

        async fn post(&self, _data: &UserData) -> Result<()> {
            self.counters.posts.fetch_add(1, Ordering::SeqCst);
            if self.fail_post {
                return Err(Error::Condition("unmount failed".to_string()));
            }
            Ok(())
        }
    }

    fn service_runner(service: TestService) -> Arc<ServiceRunner> {
        Arc::new(ServiceRunner::new(
            Arc::new(service),
            Arc::new(UserData::default()),
            Bus::new(64),
        ))
    }

    #[tokio::test]
    async fn test_runs_through_every_state() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        sr.start().await;

        let status = sr.status().await;
        let states: Vec<ServiceState> = status.events.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                ServiceState::PreStartRunning,
                ServiceState::AwaitingCondition,
                ServiceState::RunnerStarting,
                ServiceState::Running,
                ServiceState::Stopping,
                ServiceState::PostStopRunning,
                ServiceState::Terminated,
            ]
        );
        assert_eq!(status.last_error, None);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_failure_skips_runner() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            fail_pre: true,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        sr.start().await;

        let status = sr.status().await;
        assert_eq!(status.state, ServiceState::Terminated);
        assert!(status.last_error.unwrap().contains("pre hook failed"));
        assert_eq!(counters.runners.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsatisfied_condition_terminates_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            gate: Some(dir.path().join("never")),
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        let task = tokio::spawn({
            let sr = Arc::clone(&sr);
            async move { sr.start().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sr.state().await, ServiceState::AwaitingCondition);

        sr.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("service runner did not terminate")
            .unwrap();

        assert_eq!(sr.state().await, ServiceState::Terminated);
        assert_eq!(counters.runners.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_running_runner() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            block: true,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        let task = tokio::spawn({
            let sr = Arc::clone(&sr);
            async move { sr.start().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sr.state().await, ServiceState::Running);

        sr.shutdown();
        sr.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("service runner did not terminate")
            .unwrap();

        assert_eq!(sr.state().await, ServiceState::Terminated);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_failure_still_terminates() {
        let sr = service_runner(TestService {
            fail_post: true,
            ..Default::default()
        });

        sr.start().await;

        let status = sr.status().await;
        assert_eq!(status.state, ServiceState::Terminated);
        assert!(status.last_error.unwrap().contains("post hook failed"));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_never_runs() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        sr.shutdown();
        sr.start().await;

        assert_eq!(sr.state().await, ServiceState::Terminated);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    async fn start_in_background(sr: &Arc<ServiceRunner>) -> tokio::task::JoinHandle<()> {
        let task = tokio::spawn({
            let sr = Arc::clone(sr);
            async move { sr.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        task
    }

    async fn shutdown_and_join(sr: &ServiceRunner, task: tokio::task::JoinHandle<()>) {
        sr.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("service runner did not terminate")
            .unwrap();
        assert_eq!(sr.state().await, ServiceState::Terminated);
    }

    #[tokio::test]
    async fn test_hanging_pre_is_interrupted_by_shutdown() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            hang_pre: true,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        let task = start_in_background(&sr).await;
        assert_eq!(sr.state().await, ServiceState::PreStartRunning);

        shutdown_and_join(&sr, task).await;
        assert_eq!(counters.runners.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_hook_error_is_not_wrapped_twice() {
        struct Mkdir;

        #[async_trait]
        impl Service for Mkdir {
            fn id(&self, _data: &UserData) -> String {
                "kubelet".to_string()
            }

            async fn pre(&self, _data: &UserData) -> Result<()> {
                Err(Error::hook("kubelet", "pre", "create /var/lib/kubelet: denied"))
            }

            fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
                None
            }

            fn runner(&self, _data: &UserData) -> Result<Box<dyn Runner>> {
                unreachable!("runner built after a failed pre hook")
            }

            async fn post(&self, _data: &UserData) -> Result<()> {
                Ok(())
            }
        }

        let sr = ServiceRunner::new(
            Arc::new(Mkdir),
            Arc::new(UserData::default()),
            Bus::new(8),
        );
        sr.start().await;

        assert_eq!(
            sr.status().await.last_error.as_deref(),
            Some("pre hook failed for kubelet: create /var/lib/kubelet: denied")
        );
    }

    #[tokio::test]
    async fn test_runner_factory_failure_skips_post() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            fail_runner: true,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        sr.start().await;

        let status = sr.status().await;
        assert_eq!(status.state, ServiceState::Terminated);
        assert!(status
            .last_error
            .unwrap()
            .starts_with("Failed to create runner for test"));
        assert_eq!(counters.runners.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_failure_closes_runner_without_running() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            open: Open::Fail,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        sr.start().await;

        let status = sr.status().await;
        assert_eq!(status.state, ServiceState::Terminated);
        assert!(status.last_error.unwrap().contains("image pull failed"));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hanging_open_is_interrupted_by_shutdown() {
        let counters = Arc::new(Counters::default());
        let sr = service_runner(TestService {
            open: Open::Hang,
            counters: Arc::clone(&counters),
            ..Default::default()
        });

        let task = start_in_background(&sr).await;
        assert_eq!(sr.state().await, ServiceState::RunnerStarting);

        shutdown_and_join(&sr, task).await;
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.runs.load(Ordering::SeqCst), 0);
        assert_eq!(counters.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let sr = ServiceRunner::new(
            Arc::new(TestService::default()),
            Arc::new(UserData::default()),
            bus,
        );

        sr.start().await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.service, "test");
        assert_eq!(first.state, ServiceState::PreStartRunning);
    }
}
