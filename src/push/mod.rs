use crate::config::PushConfig;
use crate::error::PushStartFailure;
use crate::model::PilotState;
use crate::protocol::{is_test_marker, Command, Message, RegistrationParams};
use crate::transport::{unspecified_for, Transport, MAX_DATAGRAM_SIZE};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};

/// Address used only to ask the OS which interface carries the default route.
/// Connecting a UDP socket sends nothing.
const DEFAULT_ROUTE_PROBE: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 9);

/// Pause after a failed receive so a persistent socket error does not spin.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub type PushCallback = Arc<dyn Fn(PushUpdate) + Send + Sync>;
pub type DiscoveryCallback = Arc<dyn Fn(DiscoveryBeat) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub device_id: String,
    pub state: PilotState,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryBeat {
    pub device_id: String,
    pub from: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    Idle,
    Starting,
    Running,
}

struct Route {
    callback: PushCallback,
    address: IpAddr,
    token: u64,
}

struct Shared {
    phase: PushPhase,
    routes: HashMap<String, Route>,
    discovery: Option<DiscoveryCallback>,
    registration: Option<RegistrationParams>,
    renew_tx: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
    local_port: Option<u16>,
    last_failure: Option<PushStartFailure>,
    next_token: u64,
}

impl Shared {
    fn new() -> Self {
        Self {
            phase: PushPhase::Idle,
            routes: HashMap::new(),
            discovery: None,
            registration: None,
            renew_tx: None,
            tasks: Vec::new(),
            local_port: None,
            last_failure: None,
            next_token: 0,
        }
    }

    /// Resets to the pre-start state and hands back the background tasks.
    /// The caller must abort and await them so the listener socket is closed
    /// before the transition lock is released.
    fn shut_down(&mut self) -> Vec<JoinHandle<()>> {
        self.phase = PushPhase::Idle;
        self.routes.clear();
        self.discovery = None;
        self.registration = None;
        self.renew_tx = None;
        self.local_port = None;
        self.tasks.drain(..).collect()
    }
}

async fn join_aborted(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
}

struct Inner {
    config: PushConfig,
    transport: Transport,
    transition: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn registration_targets(&self) -> Vec<(String, SocketAddr)> {
        self.lock()
            .routes
            .iter()
            .map(|(id, route)| (id.clone(), SocketAddr::new(route.address, self.config.device_port)))
            .collect()
    }

    fn registration_target(&self, device_id: &str) -> Option<SocketAddr> {
        self.lock()
            .routes
            .get(device_id)
            .map(|route| SocketAddr::new(route.address, self.config.device_port))
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        if is_test_marker(datagram) {
            return;
        }
        let message = match Message::parse(datagram) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%from, error = %err, "dropping unparsable push datagram");
                return;
            }
        };
        match message {
            Message::FirstBeat { mac } => {
                let callback = self.lock().discovery.clone();
                if let Some(callback) = callback {
                    callback(DiscoveryBeat { device_id: mac, from });
                }
            }
            Message::SyncPilot { mac, state } => {
                let device_id = normalize_id(&mac);
                let callback = {
                    let mut shared = self.lock();
                    match shared.routes.get_mut(&device_id) {
                        Some(route) => {
                            route.address = from.ip();
                            route.callback.clone()
                        }
                        None => return,
                    }
                };
                callback(PushUpdate {
                    device_id,
                    state,
                    from,
                });
            }
            other => {
                tracing::trace!(%from, method = ?other.method(), "ignoring push datagram");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in shared.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Owns the push listener socket and keeps devices forwarding `syncPilot`
/// to it.
///
/// The listener runs from a successful `start` until the last subscription
/// is removed (or `stop` is called). Start and teardown are serialized by
/// the `transition` lock.
#[derive(Clone)]
pub struct PushManager {
    inner: Arc<Inner>,
}

impl PushManager {
    pub fn new(config: PushConfig, transport: Transport) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                transition: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared::new()),
            }),
        }
    }

    /// Binds the push port and starts renewal. Returns `false` when the port
    /// is taken or no local address can reach `target_hint`; the reason is
    /// then available from `last_failure`.
    pub async fn start(&self, target_hint: IpAddr) -> bool {
        let _transition = self.inner.transition.lock().await;
        {
            let mut shared = self.inner.lock();
            if shared.phase == PushPhase::Running {
                return true;
            }
            shared.phase = PushPhase::Starting;
            shared.last_failure = None;
        }

        match self.bring_up(target_hint).await {
            Ok(port) => {
                tracing::info!(port, "push listener running");
                true
            }
            Err(failure) => {
                tracing::warn!(reason = %failure, "push listener unavailable; falling back to polling");
                let mut shared = self.inner.lock();
                shared.phase = PushPhase::Idle;
                shared.last_failure = Some(failure);
                false
            }
        }
    }

    async fn bring_up(&self, target_hint: IpAddr) -> Result<u16, PushStartFailure> {
        let port = self.inner.config.listen_port;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(bind_addr).await.map_err(|err| {
            if err.kind() == io::ErrorKind::AddrInUse {
                PushStartFailure::PortInUse { port }
            } else {
                PushStartFailure::Bind(err.to_string())
            }
        })?;
        let local_port = socket
            .local_addr()
            .map_err(|err| PushStartFailure::Bind(err.to_string()))?
            .port();

        let source = resolve_source_address(target_hint, self.inner.config.device_port)
            .await
            .ok_or(PushStartFailure::NoSourceAddress {
                target: target_hint,
            })?;

        let (renew_tx, renew_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.inner);
        let receiver = tokio::spawn(receive_loop(weak.clone(), socket));
        let renewal = tokio::spawn(renewal_loop(weak, renew_rx));

        let mut shared = self.inner.lock();
        for device_id in shared.routes.keys() {
            let _ = renew_tx.send(device_id.clone());
        }
        shared.registration = Some(RegistrationParams {
            phone_ip: source.to_string(),
            phone_mac: synthetic_mac(),
            register: true,
        });
        shared.tasks = vec![receiver, renewal];
        shared.renew_tx = Some(renew_tx);
        shared.local_port = Some(local_port);
        shared.phase = PushPhase::Running;
        Ok(local_port)
    }

    /// Routes `syncPilot` for `device_id` to `callback`, replacing any earlier
    /// callback for the same id. `address` is where registrations are sent
    /// until the device pushes from somewhere else.
    pub fn subscribe<F>(&self, device_id: &str, address: IpAddr, callback: F) -> Subscription
    where
        F: Fn(PushUpdate) + Send + Sync + 'static,
    {
        let device_id = normalize_id(device_id);
        let mut shared = self.inner.lock();
        shared.next_token += 1;
        let token = shared.next_token;
        shared.routes.insert(
            device_id.clone(),
            Route {
                callback: Arc::new(callback),
                address,
                token,
            },
        );
        if let Some(renew_tx) = &shared.renew_tx {
            let _ = renew_tx.send(device_id.clone());
        }
        Subscription {
            inner: Arc::downgrade(&self.inner),
            device_id,
            token,
        }
    }

    pub fn subscribe_channel(
        &self,
        device_id: &str,
        address: IpAddr,
    ) -> (Subscription, mpsc::UnboundedReceiver<PushUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(device_id, address, move |update| {
            let _ = tx.send(update);
        });
        (subscription, rx)
    }

    pub fn set_discovery_callback<F>(&self, callback: F)
    where
        F: Fn(DiscoveryBeat) + Send + Sync + 'static,
    {
        self.inner.lock().discovery = Some(Arc::new(callback));
    }

    /// Tears the listener down regardless of remaining subscriptions.
    pub async fn stop(&self) {
        let _transition = self.inner.transition.lock().await;
        let tasks = self.inner.lock().shut_down();
        join_aborted(tasks).await;
        tracing::info!("push listener stopped");
    }

    pub fn phase(&self) -> PushPhase {
        self.inner.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == PushPhase::Running
    }

    pub fn last_failure(&self) -> Option<String> {
        self.inner.lock().last_failure.as_ref().map(ToString::to_string)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.inner.lock().local_port
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().routes.len()
    }
}

/// Handle returned by `subscribe`. `unsubscribe` stops delivery and, for
/// the last subscription, waits until the listener is closed. Dropping the
/// handle removes the route too, but teardown then runs on a spawned task.
pub struct Subscription {
    inner: Weak<Inner>,
    device_id: String,
    token: u64,
}

impl Subscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn unsubscribe(mut self) {
        if let Some(inner) = self.release() {
            teardown_if_idle(inner).await;
        }
    }

    /// Removes this subscription's route. Returns the manager when no routes
    /// remain. Later calls do nothing.
    fn release(&mut self) -> Option<Arc<Inner>> {
        let inner = std::mem::take(&mut self.inner).upgrade()?;
        let now_empty = {
            let mut shared = inner.lock();
            let ours = shared
                .routes
                .get(&self.device_id)
                .is_some_and(|route| route.token == self.token);
            if !ours {
                return None;
            }
            shared.routes.remove(&self.device_id);
            shared.routes.is_empty()
        };
        now_empty.then_some(inner)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.release() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown_if_idle(inner));
            }
            Err(_) => tracing::debug!(device = %self.device_id, "no runtime to tear down push listener"),
        }
    }
}

async fn teardown_if_idle(inner: Arc<Inner>) {
    let _transition = inner.transition.lock().await;
    let (tasks, was_running) = {
        let mut shared = inner.lock();
        // A subscribe may have slipped in while waiting for the transition lock.
        if !shared.routes.is_empty() {
            return;
        }
        let was_running = shared.phase == PushPhase::Running;
        (shared.shut_down(), was_running)
    };
    join_aborted(tasks).await;
    if was_running {
        tracing::info!("last push subscription removed; listener stopped");
    }
}

async fn receive_loop(inner: Weak<Inner>, socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "push listener receive failed");
                sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(&buf[..len], from);
    }
}

async fn renewal_loop(inner: Weak<Inner>, mut immediate: mpsc::UnboundedReceiver<String>) {
    let Some(period) = inner.upgrade().map(|inner| inner.config.renewal_interval()) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inflight = JoinSet::new();

    loop {
        let targets = tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { return };
                inner.registration_targets()
            }
            Some(device_id) = immediate.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                inner
                    .registration_target(&device_id)
                    .map(|target| vec![(device_id, target)])
                    .unwrap_or_default()
            }
            Some(_) = inflight.join_next() => continue,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let Some(params) = inner.lock().registration.clone() else {
            continue;
        };
        for (device_id, target) in targets {
            inflight.spawn(register(inner.transport.clone(), params.clone(), device_id, target));
        }
    }
}

async fn register(transport: Transport, params: RegistrationParams, device_id: String, target: SocketAddr) {
    let payload = match Command::registration(&params).to_bytes() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "could not encode registration");
            return;
        }
    };
    match transport.send_commit(&payload, target).await {
        Ok(_) => tracing::debug!(device = %device_id, %target, "push registration renewed"),
        Err(err) => {
            tracing::warn!(device = %device_id, %target, error = %err, "push registration failed")
        }
    }
}

fn normalize_id(device_id: &str) -> String {
    device_id.trim().to_ascii_lowercase()
}

fn synthetic_mac() -> String {
    let bytes: [u8; 6] = rand::random();
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Picks the local address devices should push to: one on the target's /24
/// if the host has it, otherwise the first non-loopback address.
pub async fn resolve_source_address(target: IpAddr, port: u16) -> Option<IpAddr> {
    let mut candidates = Vec::new();
    if let Some(ip) = route_source(SocketAddr::new(target, port)).await {
        candidates.push(ip);
    }
    if let Some(ip) = route_source(DEFAULT_ROUTE_PROBE).await {
        candidates.push(ip);
    }
    choose_source_address(target, &candidates)
}

async fn route_source(probe: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(unspecified_for(&probe)).await.ok()?;
    socket.connect(probe).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn choose_source_address(target: IpAddr, candidates: &[IpAddr]) -> Option<IpAddr> {
    candidates
        .iter()
        .find(|ip| same_slash_24(target, **ip))
        .or_else(|| candidates.iter().find(|ip| !ip.is_loopback() && !ip.is_unspecified()))
        .copied()
}

fn same_slash_24(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}
