use anyhow::Result;
use node_provision::{
    credential_client::CredentialTransport,
    discovery::{DiscoveryResult, ServiceDiscovery},
    retry::{Backoff, RetryPolicy},
    session::{
        ProvisioningError, ProvisioningSession, SessionConfig, SessionEvent, SessionState, Step,
        StepOutcome, WifiCredentials,
    },
    wifi::WifiLink,
};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::sync::{Notify, broadcast};

const NODE_AP: &str = "NODE-AP";
const HOME_NET: &str = "HomeNet";
const NODE_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

// ============================================================================
// Instrumentation
// ============================================================================

/// Counts leaf calls in flight across all fakes; the session must never have
/// two pending concurrently.
#[derive(Default)]
struct Instrumentation {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Instrumentation {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    fn current(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn max(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements on drop so a cancelled leaf call is counted as finished.
struct InFlightGuard(Arc<Instrumentation>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Fakes
// ============================================================================

struct FakeWifi {
    instr: Arc<Instrumentation>,
    joined: Mutex<Option<String>>,
    gateway: Mutex<Option<Ipv4Addr>>,
    /// Reported by `current_ssid` instead of the last joined network.
    ssid_override: Mutex<Option<String>>,
    /// Joins of this SSID never complete.
    hang_ssid: Mutex<Option<String>>,
    join_calls: AtomicUsize,
    join_entered: Notify,
}

impl FakeWifi {
    fn new(instr: Arc<Instrumentation>) -> Self {
        Self {
            instr,
            joined: Mutex::new(None),
            gateway: Mutex::new(Some(NODE_GATEWAY)),
            ssid_override: Mutex::new(None),
            hang_ssid: Mutex::new(None),
            join_calls: AtomicUsize::new(0),
            join_entered: Notify::new(),
        }
    }
}

impl WifiLink for FakeWifi {
    async fn enable(&self) -> Result<bool> {
        let _guard = self.instr.enter();
        Ok(true)
    }

    async fn current_ssid(&self) -> Result<Option<String>> {
        let _guard = self.instr.enter();
        if let Some(ssid) = self.ssid_override.lock().unwrap().clone() {
            return Ok(Some(ssid));
        }
        Ok(self.joined.lock().unwrap().clone())
    }

    async fn current_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let _guard = self.instr.enter();
        Ok(*self.gateway.lock().unwrap())
    }

    async fn join(&self, ssid: &str, _password: &str) -> Result<()> {
        let _guard = self.instr.enter();
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        self.join_entered.notify_one();

        let hang = self.hang_ssid.lock().unwrap().clone();
        if hang.as_deref() == Some(ssid) {
            std::future::pending::<()>().await;
        }

        *self.joined.lock().unwrap() = Some(ssid.to_string());
        Ok(())
    }
}

struct FakeTransport {
    instr: Arc<Instrumentation>,
    /// Number of initial attempts to refuse before accepting.
    fail_first: AtomicUsize,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new(instr: Arc<Instrumentation>, fail_first: usize) -> Self {
        Self {
            instr,
            fail_first: AtomicUsize::new(fail_first),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }
}

impl CredentialTransport for FakeTransport {
    async fn push(&self, url: &str, _credentials: &WifiCredentials) -> bool {
        let _guard = self.instr.enter();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

struct FakeDiscovery {
    instr: Arc<Instrumentation>,
    /// `None` plays a browse window that elapses without a match.
    result: Mutex<Option<DiscoveryResult>>,
}

impl FakeDiscovery {
    fn resolving(instr: Arc<Instrumentation>, address: IpAddr) -> Self {
        Self {
            instr,
            result: Mutex::new(Some(DiscoveryResult {
                service_name: "node-2ab4._http._tcp.local.".to_string(),
                address,
                resolved_at: SystemTime::now(),
            })),
        }
    }
}

impl ServiceDiscovery for FakeDiscovery {
    async fn resolve_first(
        &self,
        _service_type: &str,
        _timeout: Duration,
    ) -> Result<Option<DiscoveryResult>> {
        let _guard = self.instr.enter();
        Ok(self.result.lock().unwrap().clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    instr: Arc<Instrumentation>,
    wifi: Arc<FakeWifi>,
    transport: Arc<FakeTransport>,
    session: Arc<ProvisioningSession<FakeWifi, FakeTransport, FakeDiscovery>>,
    events: broadcast::Receiver<SessionEvent>,
}

fn test_config() -> SessionConfig {
    SessionConfig {
        push_retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(10))),
        rejoin_timeout: Duration::from_millis(100),
        discovery_timeout: Duration::from_millis(100),
        service_type: "_http._tcp.local.".to_string(),
    }
}

fn harness(push_failures: usize) -> Harness {
    let instr = Arc::new(Instrumentation::default());
    let wifi = Arc::new(FakeWifi::new(instr.clone()));
    let transport = Arc::new(FakeTransport::new(instr.clone(), push_failures));
    let discovery = Arc::new(FakeDiscovery::resolving(
        instr.clone(),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
    ));

    let session = ProvisioningSession::new(
        wifi.clone(),
        transport.clone(),
        discovery,
        test_config(),
    );
    let events = session.subscribe();

    Harness {
        instr,
        wifi,
        transport,
        session,
        events,
    }
}

fn credentials() -> (WifiCredentials, WifiCredentials) {
    (
        WifiCredentials::open(NODE_AP),
        WifiCredentials::new(HOME_NET, "secret"),
    )
}

async fn collect_until_terminal(
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session events")
            .expect("event stream closed");
        let terminal = event.state.is_terminal();
        collected.push(event);
        if terminal {
            return collected;
        }
    }
}

fn pending_states(events: &[SessionEvent]) -> Vec<&SessionState> {
    events
        .iter()
        .filter(|event| event.outcome == StepOutcome::Pending)
        .map(|event| &event.state)
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_reaches_completed() {
    let mut h = harness(0);
    let (node_ap, target) = credentials();

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    let terminal = &events.last().expect("no events").state;
    assert!(
        matches!(terminal, SessionState::Completed { node_address } if !node_address.to_string().is_empty())
    );
    assert_eq!(
        h.session.discovered_node_address(),
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)))
    );

    // strict step order, one step entered at a time
    assert_eq!(
        pending_states(&events),
        vec![
            &SessionState::JoiningNodeNetwork,
            &SessionState::LookingUpGateway,
            &SessionState::PushingCredentials,
            &SessionState::AwaitingNodeReboot,
            &SessionState::RejoiningUserNetwork,
            &SessionState::DiscoveringNode,
        ]
    );
    assert!(h.instr.max() <= 1, "concurrent leaf calls observed");
}

#[tokio::test]
async fn push_failing_twice_still_completes_with_three_attempts() {
    let mut h = harness(2);
    let (node_ap, target) = credentials();

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    assert!(matches!(
        events.last().expect("no events").state,
        SessionState::Completed { .. }
    ));
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3);
    assert!(h.instr.max() <= 1, "concurrent leaf calls observed");
}

#[tokio::test]
async fn push_exhaustion_fails_and_retry_relooks_up_the_gateway() {
    let mut h = harness(usize::MAX);
    let (node_ap, target) = credentials();

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    let last = events.last().expect("no events");
    assert_eq!(last.state, SessionState::PushFailed);
    assert!(matches!(
        last.outcome,
        StepOutcome::Failed(ProvisioningError::TransportFailure { attempts: 3, .. })
    ));
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3);

    // the node AP may have been re-entered on a different gateway by now
    let moved_gateway = Ipv4Addr::new(172, 16, 0, 1);
    *h.wifi.gateway.lock().unwrap() = Some(moved_gateway);
    h.transport.fail_first.store(0, Ordering::SeqCst);

    h.session.retry_current_step().expect("retry failed");
    let events = collect_until_terminal(&mut h.events).await;

    assert!(matches!(
        events.last().expect("no events").state,
        SessionState::Completed { .. }
    ));
    // the retry re-entered at gateway lookup and pushed to the new address
    assert_eq!(
        pending_states(&events).first().copied(),
        Some(&SessionState::LookingUpGateway)
    );
    assert_eq!(
        h.transport.urls.lock().unwrap().last().map(String::as_str),
        Some("http://172.16.0.1/_ac/connect")
    );
    assert_eq!(h.session.retry_count(Step::LookupGateway), 1);
    assert!(h.instr.max() <= 1, "concurrent leaf calls observed");
}

#[tokio::test]
async fn rejoin_timeout_fails_and_retry_issues_a_single_new_join() {
    let mut h = harness(0);
    let (node_ap, target) = credentials();

    // the user network never comes back within the window
    *h.wifi.hang_ssid.lock().unwrap() = Some(HOME_NET.to_string());

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    let last = events.last().expect("no events");
    assert_eq!(last.state, SessionState::RejoinFailed);
    assert!(matches!(
        last.outcome,
        StepOutcome::Failed(ProvisioningError::RejoinTimeout { .. })
    ));
    // the stale join was cancelled, not left pending
    assert_eq!(h.instr.current(), 0);
    let joins_before_retry = h.wifi.join_calls.load(Ordering::SeqCst);
    assert_eq!(joins_before_retry, 2);

    *h.wifi.hang_ssid.lock().unwrap() = None;
    h.session.retry_current_step().expect("retry failed");
    let events = collect_until_terminal(&mut h.events).await;

    assert!(matches!(
        events.last().expect("no events").state,
        SessionState::Completed { .. }
    ));
    // exactly one new join, no duplicate of the stale one
    assert_eq!(h.wifi.join_calls.load(Ordering::SeqCst), joins_before_retry + 1);
    assert_eq!(h.session.retry_count(Step::RejoinUserNetwork), 1);
    assert!(h.instr.max() <= 1, "concurrent leaf calls observed");
}

#[tokio::test]
async fn abandon_freezes_session_state() {
    let mut h = harness(0);
    let (node_ap, target) = credentials();

    // the join is issued but never completes
    *h.wifi.hang_ssid.lock().unwrap() = Some(NODE_AP.to_string());

    h.session.start(node_ap, target).expect("start failed");

    // consume the step-entry event so anything after abandon stands out
    let entry = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
        .await
        .expect("timed out waiting for session events")
        .expect("event stream closed");
    assert_eq!(entry.state, SessionState::JoiningNodeNetwork);

    let entered = tokio::time::timeout(Duration::from_secs(5), h.wifi.join_entered.notified())
        .await;
    assert!(entered.is_ok(), "join was never issued");

    h.session.abandon();

    // release the join; the late result must not move the session
    *h.wifi.hang_ssid.lock().unwrap() = None;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.session.state(), Some(SessionState::JoiningNodeNetwork));
    assert!(
        matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed)
        ),
        "events observed after abandon"
    );
    // abandoned sessions refuse further work
    assert!(h.session.retry_current_step().is_err());
}

#[tokio::test]
async fn missing_gateway_surfaces_as_node_not_found() {
    let mut h = harness(0);
    let (node_ap, target) = credentials();

    *h.wifi.gateway.lock().unwrap() = None;

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    let last = events.last().expect("no events");
    assert_eq!(last.state, SessionState::JoiningNodeNetworkFailed);
    assert_eq!(
        last.outcome,
        StepOutcome::Failed(ProvisioningError::GatewayUnavailable)
    );
}

#[tokio::test]
async fn reported_association_mismatch_is_a_join_failure() {
    let mut h = harness(0);
    let (node_ap, target) = credentials();

    // the host claims success but stays attached to another network
    *h.wifi.ssid_override.lock().unwrap() = Some("OtherNet".to_string());

    h.session.start(node_ap, target).expect("start failed");
    let events = collect_until_terminal(&mut h.events).await;

    let last = events.last().expect("no events");
    assert_eq!(last.state, SessionState::JoiningNodeNetworkFailed);
    assert!(matches!(
        &last.outcome,
        StepOutcome::Failed(ProvisioningError::AssociationFailure { ssid, .. }) if ssid == NODE_AP
    ));
}

#[tokio::test]
async fn sessions_can_only_be_started_once() {
    let h = harness(0);
    let (node_ap, target) = credentials();

    h.session
        .start(node_ap.clone(), target.clone())
        .expect("start failed");
    assert!(h.session.start(node_ap, target).is_err());
}
