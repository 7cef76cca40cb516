use crate::{
    credential_client::{CredentialTransport, connect_url},
    discovery::ServiceDiscovery,
    retry::RetryPolicy,
    wifi::WifiLink,
};
use anyhow::{Result, bail, ensure};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::broadcast, task::AbortHandle, time::timeout};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A network name and password pair, held in memory for the duration of a
/// session and never persisted.
#[derive(Clone, PartialEq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// Credentials for an open network.
    pub fn open(ssid: impl Into<String>) -> Self {
        Self::new(ssid, "")
    }
}

// keep passwords out of logs
impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Caller-facing failure taxonomy. Every variant renders a human-readable
/// message; `retryable` tells the caller whether `retry_current_step` can
/// safely re-run the failed step.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
pub enum ProvisioningError {
    /// Wi-Fi join did not complete. Not auto-retried; repeated association
    /// attempts against a possibly absent network are a user decision.
    #[error("could not join Wi-Fi network \"{ssid}\": {reason}")]
    AssociationFailure { ssid: String, reason: String },

    /// No lease or default route after a claimed association.
    #[error("no gateway address on the current network, the node could not be found")]
    GatewayUnavailable,

    /// Credential delivery failed after all retry attempts.
    #[error("could not deliver credentials to the node at {url} ({attempts} attempts)")]
    TransportFailure { url: String, attempts: u32 },

    /// The user network did not come back within the rejoin window.
    #[error("could not rejoin \"{ssid}\" within {timeout_secs}s")]
    RejoinTimeout { ssid: String, timeout_secs: u64 },

    /// The node never reappeared on the target network.
    #[error("node did not reappear on the network within {timeout_secs}s")]
    DiscoveryTimeout { timeout_secs: u64 },
}

impl ProvisioningError {
    pub fn retryable(&self) -> bool {
        !matches!(self, ProvisioningError::DiscoveryTimeout { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SessionState {
    JoiningNodeNetwork,
    LookingUpGateway,
    PushingCredentials,
    AwaitingNodeReboot,
    RejoiningUserNetwork,
    DiscoveringNode,
    Completed { node_address: IpAddr },
    JoiningNodeNetworkFailed,
    PushFailed,
    RejoinFailed,
    DiscoveryFailed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed { .. }
                | SessionState::JoiningNodeNetworkFailed
                | SessionState::PushFailed
                | SessionState::RejoinFailed
                | SessionState::DiscoveryFailed
        )
    }
}

/// Outcome of the step a `SessionEvent` reports on. `Pending` on step entry,
/// `Success`/`Failed` on step exit. `AwaitingNodeReboot` only ever reports
/// `Pending`: the node's reboot has no completion signal of its own, the
/// following rejoin carries the wait.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum StepOutcome {
    Pending,
    Success,
    Failed(ProvisioningError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionEvent {
    pub state: SessionState,
    pub outcome: StepOutcome,
}

/// Driver entry points; also the keys of the per-step retry counters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Step {
    JoinNodeNetwork,
    LookupGateway,
    PushCredentials,
    RejoinUserNetwork,
    DiscoverNode,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub push_retry: RetryPolicy,
    pub rejoin_timeout: Duration,
    pub discovery_timeout: Duration,
    pub service_type: String,
}

struct FlowInput {
    node_ap: WifiCredentials,
    target: WifiCredentials,
}

/// The provisioning state machine: join the node's temporary AP, push the
/// target-network credentials to it, rejoin the user's network while the
/// node reboots, and rediscover the node via mDNS.
///
/// The session is the single writer of host Wi-Fi state: only one driver
/// task runs at a time, and no two leaf calls are ever in flight
/// concurrently. The host association is process-wide shared state, so only
/// one session may drive a given `WifiLink`; abandon the old session before
/// starting a new one. Every driver run is tagged with a generation;
/// `abandon` and `retry_current_step` supersede the running driver, so a
/// result arriving for a stale generation never touches session state.
pub struct ProvisioningSession<W, T, D> {
    wifi: Arc<W>,
    transport: Arc<T>,
    discovery: Arc<D>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<Option<SessionState>>,
    flow: Mutex<Option<FlowInput>>,
    gateway: Mutex<Option<Ipv4Addr>>,
    discovered: Mutex<Option<IpAddr>>,
    retry_counts: Mutex<HashMap<Step, u32>>,
    generation: AtomicU64,
    driver: Mutex<Option<AbortHandle>>,
    abandoned: AtomicBool,
}

impl<W, T, D> ProvisioningSession<W, T, D>
where
    W: WifiLink + Send + Sync + 'static,
    T: CredentialTransport + Send + Sync + 'static,
    D: ServiceDiscovery + Send + Sync + 'static,
{
    pub fn new(
        wifi: Arc<W>,
        transport: Arc<T>,
        discovery: Arc<D>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            wifi,
            transport,
            discovery,
            config,
            events,
            state: Mutex::new(None),
            flow: Mutex::new(None),
            gateway: Mutex::new(None),
            discovered: Mutex::new(None),
            retry_counts: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            driver: Mutex::new(None),
            abandoned: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> Option<SessionState> {
        self.state.lock().unwrap().clone()
    }

    /// Address the node was resolved at, once `Completed` is reached.
    pub fn discovered_node_address(&self) -> Option<IpAddr> {
        *self.discovered.lock().unwrap()
    }

    pub fn retry_count(&self, step: Step) -> u32 {
        self.retry_counts
            .lock()
            .unwrap()
            .get(&step)
            .copied()
            .unwrap_or(0)
    }

    /// Begin the provisioning flow. May be called once per session.
    pub fn start(
        self: &Arc<Self>,
        node_ap: WifiCredentials,
        target: WifiCredentials,
    ) -> Result<()> {
        ensure!(
            !self.abandoned.load(Ordering::SeqCst),
            "session has been abandoned"
        );

        {
            let mut flow = self.flow.lock().unwrap();
            ensure!(flow.is_none(), "session already started");
            *flow = Some(FlowInput { node_ap, target });
        }

        info!("provisioning session started");
        self.spawn_driver(Step::JoinNodeNetwork);
        Ok(())
    }

    /// Drop the session: no state transition will be observed after this
    /// call, and no leaf call issued by the session remains pending.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }

        info!("provisioning session abandoned");
    }

    /// Re-run the step the session failed in, where retry is safe. A push
    /// failure re-enters at gateway lookup: the gateway may have changed by
    /// the time the user retries.
    pub fn retry_current_step(self: &Arc<Self>) -> Result<()> {
        ensure!(
            !self.abandoned.load(Ordering::SeqCst),
            "session has been abandoned"
        );

        let state = self.state();
        let entry = match state {
            Some(SessionState::JoiningNodeNetworkFailed) => Step::JoinNodeNetwork,
            Some(SessionState::PushFailed) => Step::LookupGateway,
            Some(SessionState::RejoinFailed) => Step::RejoinUserNetwork,
            Some(SessionState::Completed { .. }) | Some(SessionState::DiscoveryFailed) => {
                warn!("retry requested in terminal state {state:?}, ignoring");
                return Ok(());
            }
            other => bail!("cannot retry from state {other:?}"),
        };

        *self.retry_counts.lock().unwrap().entry(entry).or_insert(0) += 1;
        info!("retrying from {entry:?}");
        self.spawn_driver(entry);
        Ok(())
    }

    fn spawn_driver(self: &Arc<Self>, entry: Step) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::clone(self);

        let handle = tokio::spawn(async move { session.drive(generation, entry).await });

        if let Some(old) = self.driver.lock().unwrap().replace(handle.abort_handle()) {
            old.abort();
        }
    }

    async fn drive(self: Arc<Self>, generation: u64, entry: Step) {
        let (node_ap, target) = {
            let flow = self.flow.lock().unwrap();
            let Some(flow) = flow.as_ref() else {
                return;
            };
            (flow.node_ap.clone(), flow.target.clone())
        };

        let mut step = entry;
        loop {
            let next = match step {
                Step::JoinNodeNetwork => self.join_node_network(generation, &node_ap).await,
                Step::LookupGateway => self.lookup_gateway(generation).await,
                Step::PushCredentials => self.push_credentials(generation, &target).await,
                Step::RejoinUserNetwork => self.rejoin_user_network(generation, &target).await,
                Step::DiscoverNode => self.discover_node(generation).await,
            };

            match next {
                Some(next_step) => step = next_step,
                None => return,
            }
        }
    }

    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Apply a transition unless `generation` has been superseded. Returns
    /// false when the driver is stale; the caller must stop immediately.
    fn transition(&self, generation: u64, state: SessionState, outcome: StepOutcome) -> bool {
        if self.stale(generation) {
            debug!("discarding stale transition to {state:?}");
            return false;
        }

        debug!("-> {state:?} ({outcome:?})");
        *self.state.lock().unwrap() = Some(state.clone());

        // a send error only means nobody is subscribed
        let _ = self.events.send(SessionEvent { state, outcome });
        true
    }

    /// Join `credentials.ssid` and cross-check the resulting association;
    /// some hosts report a successful join while still attached to the
    /// previous network.
    async fn join_and_verify(&self, credentials: &WifiCredentials) -> Result<(), String> {
        match self.wifi.enable().await {
            Ok(true) => {}
            Ok(false) => return Err("Wi-Fi radio unavailable".to_string()),
            Err(e) => return Err(format!("could not enable Wi-Fi radio: {e:#}")),
        }

        if let Err(e) = self.wifi.join(&credentials.ssid, &credentials.password).await {
            return Err(format!("{e:#}"));
        }

        match self.wifi.current_ssid().await {
            Ok(Some(ssid)) if ssid == credentials.ssid => Ok(()),
            Ok(Some(other)) => Err(format!(
                "associated with \"{other}\" instead of \"{}\"",
                credentials.ssid
            )),
            Ok(None) => Err("no association after join".to_string()),
            Err(e) => Err(format!("could not verify association: {e:#}")),
        }
    }

    async fn join_node_network(&self, generation: u64, node_ap: &WifiCredentials) -> Option<Step> {
        if !self.transition(
            generation,
            SessionState::JoiningNodeNetwork,
            StepOutcome::Pending,
        ) {
            return None;
        }

        match self.join_and_verify(node_ap).await {
            Ok(()) => {
                if !self.transition(
                    generation,
                    SessionState::JoiningNodeNetwork,
                    StepOutcome::Success,
                ) {
                    return None;
                }
                Some(Step::LookupGateway)
            }
            Err(reason) => {
                let error = ProvisioningError::AssociationFailure {
                    ssid: node_ap.ssid.clone(),
                    reason,
                };
                warn!("{error}");
                self.transition(
                    generation,
                    SessionState::JoiningNodeNetworkFailed,
                    StepOutcome::Failed(error),
                );
                None
            }
        }
    }

    async fn lookup_gateway(&self, generation: u64) -> Option<Step> {
        if !self.transition(
            generation,
            SessionState::LookingUpGateway,
            StepOutcome::Pending,
        ) {
            return None;
        }

        let lookup = self.wifi.current_gateway().await;
        if self.stale(generation) {
            return None;
        }

        match lookup {
            Ok(Some(gateway)) => {
                info!("node gateway is {gateway}");
                *self.gateway.lock().unwrap() = Some(gateway);
                if !self.transition(
                    generation,
                    SessionState::LookingUpGateway,
                    StepOutcome::Success,
                ) {
                    return None;
                }
                Some(Step::PushCredentials)
            }
            other => {
                if let Err(e) = other {
                    warn!("gateway lookup failed: {e:#}");
                }
                // no lease after a claimed association: the association
                // never really completed
                let error = ProvisioningError::GatewayUnavailable;
                warn!("{error}");
                self.transition(
                    generation,
                    SessionState::JoiningNodeNetworkFailed,
                    StepOutcome::Failed(error),
                );
                None
            }
        }
    }

    async fn push_credentials(&self, generation: u64, target: &WifiCredentials) -> Option<Step> {
        let Some(gateway) = *self.gateway.lock().unwrap() else {
            // entered via retry after the gateway was invalidated
            return Some(Step::LookupGateway);
        };

        if !self.transition(
            generation,
            SessionState::PushingCredentials,
            StepOutcome::Pending,
        ) {
            return None;
        }

        let url = connect_url(gateway);
        let result = self
            .config
            .push_retry
            .run(|attempt| {
                let url = url.clone();
                async move {
                    if self.transport.push(&url, target).await {
                        Ok(())
                    } else {
                        Err(format!("push attempt {} refused by node", attempt + 1))
                    }
                }
            })
            .await;

        if self.stale(generation) {
            return None;
        }

        match result {
            Ok(()) => {
                if !self.transition(
                    generation,
                    SessionState::PushingCredentials,
                    StepOutcome::Success,
                ) {
                    return None;
                }
                // the node now drops its AP and reboots into the target
                // network; the rejoin attempt carries the wait
                if !self.transition(
                    generation,
                    SessionState::AwaitingNodeReboot,
                    StepOutcome::Pending,
                ) {
                    return None;
                }
                Some(Step::RejoinUserNetwork)
            }
            Err(reason) => {
                // force a gateway re-lookup on retry
                *self.gateway.lock().unwrap() = None;
                let error = ProvisioningError::TransportFailure {
                    url,
                    attempts: self.config.push_retry.max_attempts(),
                };
                warn!("{error}: {reason}");
                self.transition(generation, SessionState::PushFailed, StepOutcome::Failed(error));
                None
            }
        }
    }

    async fn rejoin_user_network(&self, generation: u64, target: &WifiCredentials) -> Option<Step> {
        if !self.transition(
            generation,
            SessionState::RejoiningUserNetwork,
            StepOutcome::Pending,
        ) {
            return None;
        }

        // node reboot plus DHCP can take close to two minutes; race the join
        // against a timer instead of waiting unbounded
        let rejoin = timeout(self.config.rejoin_timeout, self.join_and_verify(target)).await;
        if self.stale(generation) {
            return None;
        }

        let error = match rejoin {
            Ok(Ok(())) => {
                if !self.transition(
                    generation,
                    SessionState::RejoiningUserNetwork,
                    StepOutcome::Success,
                ) {
                    return None;
                }
                return Some(Step::DiscoverNode);
            }
            Ok(Err(reason)) => ProvisioningError::AssociationFailure {
                ssid: target.ssid.clone(),
                reason,
            },
            Err(_) => ProvisioningError::RejoinTimeout {
                ssid: target.ssid.clone(),
                timeout_secs: self.config.rejoin_timeout.as_secs(),
            },
        };

        warn!("{error}");
        self.transition(generation, SessionState::RejoinFailed, StepOutcome::Failed(error));
        None
    }

    async fn discover_node(&self, generation: u64) -> Option<Step> {
        if !self.transition(
            generation,
            SessionState::DiscoveringNode,
            StepOutcome::Pending,
        ) {
            return None;
        }

        let resolved = self
            .discovery
            .resolve_first(&self.config.service_type, self.config.discovery_timeout)
            .await;
        if self.stale(generation) {
            return None;
        }

        match resolved {
            Ok(Some(result)) => {
                info!("node resolved at {} ({})", result.address, result.service_name);
                *self.discovered.lock().unwrap() = Some(result.address);
                self.transition(
                    generation,
                    SessionState::Completed {
                        node_address: result.address,
                    },
                    StepOutcome::Success,
                );
                None
            }
            other => {
                if let Err(e) = other {
                    warn!("discovery failed: {e:#}");
                }
                let error = ProvisioningError::DiscoveryTimeout {
                    timeout_secs: self.config.discovery_timeout.as_secs(),
                };
                warn!("{error}");
                self.transition(
                    generation,
                    SessionState::DiscoveryFailed,
                    StepOutcome::Failed(error),
                );
                None
            }
        }
    }
}
