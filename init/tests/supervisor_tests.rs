//! Supervisor behaviour with in-process test services.

use async_trait::async_trait;
use nodeos_init::condition::wait_for_files_to_exist;
use nodeos_init::{
    Condition, Error, EventSink, Restart, RestartPolicy, Result, Runner, Service, ServiceState,
    Supervisor, SupervisorConfig,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use userdata::UserData;

#[derive(Clone, Copy)]
enum Behavior {
    /// Return Ok right away
    Succeed,
    /// Fail right away
    Fail,
    /// Run until closed
    Block,
}

#[derive(Default)]
struct Counters {
    factories: AtomicUsize,
    runs: AtomicUsize,
    closed_at: Mutex<Option<Instant>>,
}

impl Counters {
    fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock().unwrap()
    }
}

struct TestRunner {
    id: String,
    behavior: Behavior,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

#[async_trait]
impl Runner for TestRunner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _events: &EventSink) -> Result<()> {
        if self.stop.is_cancelled() {
            return Ok(());
        }
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(Error::ProcessExited {
                id: self.id.clone(),
                code: Some(1),
                signal: None,
            }),
            Behavior::Block => {
                self.stop.cancelled().await;
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.counters.closed_at.lock().unwrap().get_or_insert_with(Instant::now);
        self.stop.cancel();
        Ok(())
    }
}

struct TestService {
    id: &'static str,
    behavior: Behavior,
    policy: RestartPolicy,
    gate: Option<PathBuf>,
    counters: Arc<Counters>,
}

impl TestService {
    fn new(
        id: &'static str,
        behavior: Behavior,
        policy: RestartPolicy,
    ) -> (Arc<dyn Service>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let service = Arc::new(Self {
            id,
            behavior,
            policy,
            gate: None,
            counters: Arc::clone(&counters),
        });
        (service, counters)
    }

    fn gated(id: &'static str, gate: PathBuf) -> (Arc<dyn Service>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let service = Arc::new(Self {
            id,
            behavior: Behavior::Block,
            policy: RestartPolicy::Forever,
            gate: Some(gate),
            counters: Arc::clone(&counters),
        });
        (service, counters)
    }
}

#[async_trait]
impl Service for TestService {
    fn id(&self, _data: &UserData) -> String {
        self.id.to_string()
    }

    async fn pre(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }

    fn condition(&self, _data: &UserData) -> Option<Box<dyn Condition>> {
        self.gate.as_ref().map(|p| {
            Box::new(wait_for_files_to_exist([p]).with_interval(Duration::from_millis(10)))
                as Box<dyn Condition>
        })
    }

    fn runner(&self, _data: &UserData) -> Result<Box<dyn Runner>> {
        self.counters.factories.fetch_add(1, Ordering::SeqCst);
        let runner = TestRunner {
            id: self.id.to_string(),
            behavior: self.behavior,
            counters: Arc::clone(&self.counters),
            stop: CancellationToken::new(),
        };
        Ok(Box::new(Restart::new(Box::new(runner), self.policy)))
    }

    async fn post(&self, _data: &UserData) -> Result<()> {
        Ok(())
    }
}

fn supervisor(settle: Duration) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        Arc::new(UserData::default()),
        SupervisorConfig::default().with_shutdown_settle(settle),
    ))
}

async fn wait_for_state(sup: &Supervisor, id: &str, state: ServiceState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(status) = sup.status(id).await {
            if status.state == state {
                return;
            }
        }
        assert!(Instant::now() < deadline, "{} never reached {}", id, state);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let sup = supervisor(Duration::from_millis(10));
    let (first, counters) = TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);
    let (duplicate, duplicate_counters) =
        TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);

    sup.start(vec![first.clone(), duplicate]).await;
    sup.start(vec![first]).await;

    wait_for_state(&sup, "kubelet", ServiceState::Running).await;
    assert_eq!(sup.statuses().await.len(), 1);
    assert_eq!(counters.factories.load(Ordering::SeqCst), 1);
    assert_eq!(duplicate_counters.factories.load(Ordering::SeqCst), 0);

    sup.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_shutdown_returns_after_drain() {
    let sup = supervisor(Duration::from_millis(100));
    let (containerd, _) = TestService::new("containerd", Behavior::Block, RestartPolicy::Forever);
    let (kubelet, _) = TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);

    sup.start(vec![containerd, kubelet]).await;
    wait_for_state(&sup, "kubelet", ServiceState::Running).await;

    let start = Instant::now();
    tokio::join!(sup.shutdown(), sup.shutdown());
    assert!(start.elapsed() >= Duration::from_millis(100));

    for status in sup.statuses().await {
        assert_eq!(status.state, ServiceState::Terminated, "{}", status.id);
    }

    // Later calls return once everything is drained.
    tokio::time::timeout(Duration::from_millis(100), sup.shutdown())
        .await
        .expect("repeated shutdown should return immediately");
}

#[tokio::test]
async fn test_unsatisfied_condition_terminates_on_shutdown() {
    let dir = tempfile::TempDir::new().unwrap();
    let sup = supervisor(Duration::from_millis(10));
    let (gated, counters) = TestService::gated("kubelet", dir.path().join("kubeadm-flags.env"));

    sup.start(vec![gated]).await;
    wait_for_state(&sup, "kubelet", ServiceState::AwaitingCondition).await;

    tokio::time::timeout(Duration::from_secs(1), sup.shutdown())
        .await
        .expect("shutdown hung on a pending condition");

    assert_eq!(
        sup.status("kubelet").await.unwrap().state,
        ServiceState::Terminated
    );
    assert_eq!(counters.factories.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_once_service_terminates_on_its_own() {
    let sup = supervisor(Duration::from_millis(10));
    let (once, counters) = TestService::new("kubeadm", Behavior::Succeed, RestartPolicy::Once);

    sup.start(vec![once]).await;
    wait_for_state(&sup, "kubeadm", ServiceState::Terminated).await;

    let status = sup.status("kubeadm").await.unwrap();
    assert!(status.last_error.is_none());
    assert_eq!(counters.runs.load(Ordering::SeqCst), 1);
    assert!(!sup.is_terminating().await);
}

#[tokio::test]
async fn test_workloads_stop_before_foundational_services() {
    let settle = Duration::from_millis(300);
    let sup = supervisor(settle);
    let (containerd, containerd_counters) =
        TestService::new("containerd", Behavior::Block, RestartPolicy::Forever);
    let (kubelet, kubelet_counters) =
        TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);

    sup.start(vec![containerd, kubelet]).await;
    wait_for_state(&sup, "containerd", ServiceState::Running).await;
    wait_for_state(&sup, "kubelet", ServiceState::Running).await;

    sup.shutdown().await;

    let kubelet_closed = kubelet_counters.closed_at().expect("kubelet never closed");
    let containerd_closed = containerd_counters.closed_at().expect("containerd never closed");
    assert!(kubelet_closed < containerd_closed);
    assert!(containerd_closed.duration_since(kubelet_closed) >= settle - Duration::from_millis(50));
}

#[tokio::test]
async fn test_settle_is_skipped_without_foundational_services() {
    let sup = supervisor(Duration::from_secs(30));
    let (kubelet, _) = TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);

    sup.start(vec![kubelet]).await;
    wait_for_state(&sup, "kubelet", ServiceState::Running).await;

    tokio::time::timeout(Duration::from_secs(1), sup.shutdown())
        .await
        .expect("shutdown waited for a settle with nothing to settle");
}

#[tokio::test]
async fn test_forever_keeps_restarting_until_shutdown() {
    let sup = supervisor(Duration::from_millis(10));
    let (flaky, counters) = TestService::new("udevd", Behavior::Fail, RestartPolicy::Forever);

    sup.start(vec![flaky]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sup.status("udevd").await.unwrap().state, ServiceState::Running);
    assert!(counters.runs.load(Ordering::SeqCst) > 5);

    sup.shutdown().await;
    assert_eq!(
        sup.status("udevd").await.unwrap().state,
        ServiceState::Terminated
    );
}

#[tokio::test]
async fn test_start_after_shutdown_is_ignored() {
    let sup = supervisor(Duration::from_millis(10));
    sup.shutdown().await;

    let (late, counters) = TestService::new("kubelet", Behavior::Block, RestartPolicy::Forever);
    sup.start(vec![late]).await;

    assert!(sup.is_terminating().await);
    assert!(!sup.is_registered("kubelet").await);
    assert_eq!(counters.factories.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_events_are_broadcast() {
    let sup = supervisor(Duration::from_millis(10));
    let mut events = sup.subscribe();
    let (once, _) = TestService::new("kubeadm", Behavior::Succeed, RestartPolicy::Once);

    sup.start(vec![once]).await;

    let mut states = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_secs(1), events.recv()).await
    {
        assert_eq!(event.service, "kubeadm");
        states.push(event.state);
        if event.state == ServiceState::Terminated {
            break;
        }
    }

    assert_eq!(states.first(), Some(&ServiceState::PreStartRunning));
    assert_eq!(states.last(), Some(&ServiceState::Terminated));
}
