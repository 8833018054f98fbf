//! Session lifecycle, acquisition and reconfiguration tests against an
//! in-memory transport.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagflux_core::{
    AcquiredValue, AlarmState, BackendConfig, ConnectionConfig, OpcUaAuth, Quality, TagAddress,
    TagConfig, TagValue,
};
use tagflux_link::{
    AcquisitionMode, LinkError, LinkEvent, ReconfigPlan, Sample, SessionManager, SubscribeOutcome,
    SubscriptionItem, Transport,
};
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    reads: AtomicUsize,
}

struct MockState {
    counters: Counters,
    mode: AcquisitionMode,
    /// Node-id keys whose reads fail.
    fail_reads: Mutex<HashSet<String>>,
    /// Tag names the server refuses to register.
    reject_items: Mutex<HashSet<String>>,
    /// Number of upcoming connect attempts that should fail.
    connect_failures: AtomicUsize,
    /// Captured push sink, for injecting change notifications.
    sink: Mutex<Option<mpsc::Sender<AcquiredValue>>>,
    liveness: watch::Sender<bool>,
    backends_applied: Mutex<Vec<BackendConfig>>,
}

impl MockState {
    fn new(mode: AcquisitionMode) -> Arc<Self> {
        let (liveness, _) = watch::channel(false);
        Arc::new(Self {
            counters: Counters::default(),
            mode,
            fail_reads: Mutex::new(HashSet::new()),
            reject_items: Mutex::new(HashSet::new()),
            connect_failures: AtomicUsize::new(0),
            sink: Mutex::new(None),
            liveness,
            backends_applied: Mutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    fn subscribes(&self) -> usize {
        self.counters.subscribes.load(Ordering::SeqCst)
    }

    fn unsubscribes(&self) -> usize {
        self.counters.unsubscribes.load(Ordering::SeqCst)
    }

    fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    fn push_notification(&self, value: AcquiredValue) {
        let sink = self.sink.lock().unwrap();
        sink.as_ref().unwrap().try_send(value).unwrap();
    }
}

struct MockTransport {
    state: Arc<MockState>,
}

fn address_key(address: &TagAddress) -> String {
    match address {
        TagAddress::NodeId(s) => s.clone(),
        TagAddress::Register { address, .. } => address.to_string(),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), LinkError> {
        if self.state.connect_failures.load(Ordering::SeqCst) > 0 {
            self.state.connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(LinkError::Connect("simulated connect failure".to_string()));
        }
        self.state.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.state.liveness.send_replace(true);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.liveness.send_replace(false);
    }

    async fn read(&mut self, address: &TagAddress) -> Result<Sample, LinkError> {
        self.state.counters.reads.fetch_add(1, Ordering::SeqCst);
        let key = address_key(address);
        if self.state.fail_reads.lock().unwrap().contains(&key) {
            return Err(LinkError::Read(format!("{}: simulated device fault", key)));
        }
        Ok(Sample {
            value: TagValue::Float(42.0),
            timestamp_us: 1_000,
        })
    }

    async fn subscribe(
        &mut self,
        items: &[SubscriptionItem],
        _publishing_interval: Duration,
        sink: mpsc::Sender<AcquiredValue>,
    ) -> Result<SubscribeOutcome, LinkError> {
        self.state.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock().unwrap() = Some(sink);
        let rejects = self.state.reject_items.lock().unwrap();
        let mut outcome = SubscribeOutcome::default();
        for item in items {
            if rejects.contains(&item.tag) {
                outcome
                    .rejected
                    .push((item.tag.clone(), "simulated rejection".to_string()));
            } else {
                outcome.accepted.push(item.tag.clone());
            }
        }
        Ok(outcome)
    }

    async fn unsubscribe(&mut self) -> Result<(), LinkError> {
        self.state.counters.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn apply_backend(&mut self, backend: &BackendConfig) {
        self.state.backends_applied.lock().unwrap().push(backend.clone());
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.state.liveness.subscribe()
    }

    fn mode(&self) -> AcquisitionMode {
        self.state.mode
    }
}

fn tag(name: &str) -> TagConfig {
    TagConfig {
        name: name.to_string(),
        address: TagAddress::NodeId(format!("ns=2;s={}", name)),
        sampling_interval_ms: 500,
        active: true,
        alarms_enabled: true,
        limits: Default::default(),
        alarm_message: None,
        outlier: Default::default(),
    }
}

fn config(tags: Vec<TagConfig>) -> ConnectionConfig {
    ConnectionConfig {
        name: "plant-a".to_string(),
        backend: BackendConfig::OpcUa {
            endpoint_url: "opc.tcp://10.0.0.5:4840".to_string(),
            auth: OpcUaAuth::Anonymous,
        },
        enabled: true,
        scan_interval_ms: 1_000,
        tags,
    }
}

fn manager(state: &Arc<MockState>, config: ConnectionConfig) -> SessionManager {
    SessionManager::new(
        config,
        Box::new(MockTransport {
            state: Arc::clone(state),
        }),
    )
    .unwrap()
}

/// Drain events until the next Data event, with a bounded wait.
async fn next_data(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<tagflux_core::ClassifiedValue> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a data event")
            .expect("event channel closed");
        if let LinkEvent::Data { values, .. } = event {
            return values;
        }
    }
}

async fn next_status(rx: &mut broadcast::Receiver<LinkEvent>) -> bool {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("event channel closed");
        if let LinkEvent::StatusChanged { connected, .. } = event {
            return connected;
        }
    }
}

#[tokio::test]
async fn connect_twice_performs_setup_once() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));

    session.connect().await.unwrap();
    session.connect().await.unwrap();

    assert!(session.is_connected());
    assert_eq!(state.connects(), 1);
}

#[tokio::test]
async fn disconnect_is_safe_when_never_connected() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
}

#[tokio::test]
async fn connect_failure_leaves_no_session_behind() {
    let state = MockState::new(AcquisitionMode::Poll);
    state.connect_failures.store(1, Ordering::SeqCst);
    let session = manager(&state, config(vec![tag("flow")]));

    assert!(session.connect().await.is_err());
    assert!(!session.is_connected());

    // The failure is non-fatal; a retry succeeds.
    session.connect().await.unwrap();
    assert!(session.is_connected());
}

#[tokio::test]
async fn status_events_track_connect_and_disconnect() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    assert!(next_status(&mut events).await);

    session.disconnect().await.unwrap();
    assert!(!next_status(&mut events).await);
}

#[tokio::test]
async fn poll_sweep_isolates_per_tag_failures() {
    let state = MockState::new(AcquisitionMode::Poll);
    state
        .fail_reads
        .lock()
        .unwrap()
        .insert("ns=2;s=temp".to_string());
    let session = manager(&state, config(vec![tag("flow"), tag("temp"), tag("level")]));
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    session.poll_sweep().await.unwrap();

    let values = next_data(&mut events).await;
    assert_eq!(values.len(), 3);

    let by_name = |name: &str| values.iter().find(|v| v.acquired.tag == name).unwrap();
    assert_eq!(by_name("flow").state, AlarmState::Normal);
    assert_eq!(by_name("level").state, AlarmState::Normal);
    let failed = by_name("temp");
    assert_eq!(failed.state, AlarmState::Error);
    assert_eq!(failed.acquired.quality, Quality::Bad);
}

#[tokio::test]
async fn poll_sweep_requires_a_connection() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));
    assert!(matches!(
        session.poll_sweep().await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test]
async fn push_subscription_rejections_and_initial_read() {
    let state = MockState::new(AcquisitionMode::Push);
    state.reject_items.lock().unwrap().insert("temp".to_string());
    let session = manager(&state, config(vec![tag("flow"), tag("temp")]));
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    assert_eq!(state.subscribes(), 1);

    // First data batch: the rejected item, marked Error for that tag only.
    let rejected = next_data(&mut events).await;
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].acquired.tag, "temp");
    assert_eq!(rejected[0].state, AlarmState::Error);

    // Second data batch: the immediate one-shot read of accepted items.
    let initial = next_data(&mut events).await;
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].acquired.tag, "flow");
    assert_eq!(initial[0].acquired.value, Some(TagValue::Float(42.0)));
    assert_eq!(state.reads(), 1);

    // Change notifications flow outside the gate, one value at a time.
    state.push_notification(AcquiredValue::good("flow", TagValue::Float(55.0), 2_000));
    let notified = next_data(&mut events).await;
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].acquired.value, Some(TagValue::Float(55.0)));

    let runtime = session.tag_runtime("flow").unwrap();
    assert_eq!(runtime.last_value, Some(TagValue::Float(55.0)));
}

#[tokio::test]
async fn reconfigure_routes_by_what_changed() {
    let state = MockState::new(AcquisitionMode::Push);
    let session = manager(&state, config(vec![tag("flow"), tag("temp")]));

    session.connect().await.unwrap();
    assert_eq!(state.connects(), 1);
    assert_eq!(state.subscribes(), 1);

    // Alarm-limit-only change: no reconnect, no re-subscription.
    let mut limit_change = config(vec![tag("flow"), tag("temp")]);
    limit_change.tags[0].limits.high = Some(80.0);
    let plan = session.reconfigure(&limit_change).await.unwrap();
    assert_eq!(plan, ReconfigPlan::InPlace);
    assert_eq!(state.connects(), 1);
    assert_eq!(state.subscribes(), 1);

    // Sampling-interval change: re-subscription on the same session.
    let mut interval_change = limit_change.clone();
    interval_change.tags[1].sampling_interval_ms = 250;
    let plan = session.reconfigure(&interval_change).await.unwrap();
    assert_eq!(plan, ReconfigPlan::RestartAcquisition);
    assert_eq!(state.connects(), 1);
    assert_eq!(state.unsubscribes(), 1);
    assert_eq!(state.subscribes(), 2);

    // Endpoint change: full reconnect.
    let mut endpoint_change = interval_change.clone();
    endpoint_change.backend = BackendConfig::OpcUa {
        endpoint_url: "opc.tcp://10.0.0.9:4840".to_string(),
        auth: OpcUaAuth::Anonymous,
    };
    let plan = session.reconfigure(&endpoint_change).await.unwrap();
    assert_eq!(plan, ReconfigPlan::Reconnect);
    assert_eq!(state.connects(), 2);
    assert!(state.disconnects() >= 1);
    assert_eq!(state.subscribes(), 3);
    assert!(!state.backends_applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reconfigure_while_disconnected_only_stores() {
    let state = MockState::new(AcquisitionMode::Push);
    let session = manager(&state, config(vec![tag("flow")]));

    let mut new_config = config(vec![tag("flow")]);
    new_config.backend = BackendConfig::OpcUa {
        endpoint_url: "opc.tcp://10.0.0.9:4840".to_string(),
        auth: OpcUaAuth::Anonymous,
    };
    let plan = session.reconfigure(&new_config).await.unwrap();
    assert_eq!(plan, ReconfigPlan::Stored);
    assert_eq!(state.connects(), 0);
    assert_eq!(state.subscribes(), 0);
}

#[tokio::test]
async fn invalid_configuration_is_a_hard_failure() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));

    let mut bad = config(vec![tag("flow"), tag("flow")]);
    bad.name = "plant-a".to_string();
    assert!(matches!(
        session.reconfigure(&bad).await,
        Err(LinkError::InvalidConfig(_))
    ));

    let mut nameless = config(vec![tag("flow")]);
    nameless.name = String::new();
    assert!(matches!(
        session.reconfigure(&nameless).await,
        Err(LinkError::InvalidConfig(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn liveness_loss_drives_backoff_reconnect() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    assert!(next_status(&mut events).await);

    // Keep-alive dies: the session reports disconnected, then the backoff
    // handler brings it back (first attempt after the 2 s initial delay).
    state.liveness.send_replace(false);
    assert!(!next_status(&mut events).await);
    assert!(next_status(&mut events).await);

    assert!(session.is_connected());
    assert_eq!(state.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_inflight_reconnect() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    assert!(next_status(&mut events).await);

    // Fail every upcoming attempt so the handler stays in backoff.
    state.connect_failures.store(1_000, Ordering::SeqCst);
    state.liveness.send_replace(false);
    assert!(!next_status(&mut events).await);

    // Let a few attempts fail, then disconnect to cancel the handler.
    tokio::time::sleep(Duration::from_secs(10)).await;
    session.disconnect().await.unwrap();
    state.connect_failures.store(0, Ordering::SeqCst);

    // With the reconnect cancelled, nothing reconnects on its own.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!session.is_connected());
    assert_eq!(state.connects(), 1);
}

#[tokio::test]
async fn concurrent_operations_do_not_interfere() {
    let state = MockState::new(AcquisitionMode::Poll);
    let session = manager(&state, config(vec![tag("flow")]));
    session.connect().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let _ = session.connect().await;
                let _ = session.poll_sweep().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Idempotent connects never re-dialed; the session is still healthy.
    assert_eq!(state.connects(), 1);
    assert!(session.is_connected());
    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
}
