//! Connection and registration state machine
//!
//! [`ReconnectableTransport`] owns the engine's user agent and keeps the
//! account registered across network trouble.
//!
//! ```text
//!                connect()                 register ok
//!  Disconnected ─────────▶ Connecting ───────────────────▶ Connected ◀───────────────┐
//!       ▲                      │ register fails                 │   │                 │
//!       │                      ▼                                │   │ network lost    │ probe and
//!       ├──────────────── Disconnected                          │   ▼                 │ re-register ok
//!       │                                                       │  Dying              │
//!       │                                                       │   │ online          │
//!       │  unregister ack                disconnect()           │   ▼                 │
//!       └──────────────── Disconnecting ◀───────────────────────┘  Recovering ────────┘
//! ```
//!
//! Recovering retries with backoff after an unreachable server or a
//! recoverable registration failure. A registrar refusal ends in
//! Disconnected.
//!
//! Every transition replaces the state's `CancellationToken`, so timers and
//! loops started in a state (keepalive, dying countdown, recovery) stop the
//! moment that state is left. Loops re-check the status on each iteration as
//! well.
//!
//! Status changes are published on a broadcast channel while the state lock is
//! held. Observers therefore see transitions in the order they happened, and
//! consecutive duplicates are never published.
//!
//! Recovery comes in two flavours, picked by the `priority` flag the client
//! sets while it has calls:
//!
//! - **burst**: probe the signalling server every `burst_interval` until it
//!   answers or the remaining dying budget is spent. Exhaustion drops priority.
//! - **once**: one probe per cycle, then wait `increase_timeout` before the
//!   next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{RetryState, increase_timeout, with_timeout};
use crate::config::ClientConfig;
use crate::engine::{
    Registerer, RegistererState, SessionHandle, SipEngine, SubscriptionHandle, UserAgent, UserAgentEvent,
    UserAgentOptions,
};
use crate::error::{ClientError, ClientResult};
use crate::network::NetworkMonitor;
use crate::probe::ReachabilityProbe;
use crate::uri;

const EVENT_CAPACITY: usize = 256;

/// Connection status, observed through [`TransportEvent::StatusUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientStatus {
    Connecting,
    Connected,
    /// Network lost while connected; calls may still be saved
    Dying,
    /// Trying to reach the signalling server again
    Recovering,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Dying => "dying",
            ClientStatus::Recovering => "recovering",
            ClientStatus::Disconnecting => "disconnecting",
            ClientStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Everything the transport tells its owner
#[derive(Clone)]
pub enum TransportEvent {
    StatusUpdate(ClientStatus),
    /// Inbound INVITE waiting to be wrapped into a session
    Invite(Arc<dyn SessionHandle>),
    /// Recovered while calls were up; their media should be renegotiated
    ReviveSessions,
    /// Recovered; presence subscriptions must be renewed
    ReviveSubscriptions,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StatusUpdate(status) => f.debug_tuple("StatusUpdate").field(status).finish(),
            TransportEvent::Invite(handle) => f.debug_tuple("Invite").field(&handle.call_id()).finish(),
            TransportEvent::ReviveSessions => f.write_str("ReviveSessions"),
            TransportEvent::ReviveSubscriptions => f.write_str("ReviveSubscriptions"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisconnectOptions {
    /// False when registration never completed; skips the unregister round trip
    pub has_registered: bool,
}

impl Default for DisconnectOptions {
    fn default() -> Self {
        Self { has_registered: true }
    }
}

type SharedConnect = Shared<BoxFuture<'static, ClientResult<bool>>>;
type SharedUnregister = Shared<BoxFuture<'static, ()>>;

struct TransportState {
    status: ClientStatus,
    user_agent: Option<Arc<dyn UserAgent>>,
    /// Bumped per user agent, so events of a replaced agent can be told apart
    generation: u64,
    registerer: Option<Arc<dyn Registerer>>,
    registered: Option<SharedConnect>,
    unregistered: Option<SharedUnregister>,
    retry: RetryState,
    dying_remaining: Duration,
    /// Cancelled whenever the status changes
    cycle: CancellationToken,
}

struct TransportInner {
    engine: Arc<dyn SipEngine>,
    probe: Arc<dyn ReachabilityProbe>,
    network: NetworkMonitor,
    config: RwLock<ClientConfig>,
    state: Mutex<TransportState>,
    priority: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

/// Registration transport with automatic recovery. Cheap to clone.
#[derive(Clone)]
pub struct ReconnectableTransport {
    inner: Arc<TransportInner>,
}

impl ReconnectableTransport {
    /// Build an idle transport. Must be called within a tokio runtime.
    pub fn new(
        config: ClientConfig,
        engine: Arc<dyn SipEngine>,
        probe: Arc<dyn ReachabilityProbe>,
        network: NetworkMonitor,
    ) -> ClientResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let retry = retry_state(&config);
        let dying_remaining = config.dying_budget();

        let inner = Arc::new(TransportInner {
            engine,
            probe,
            network: network.clone(),
            config: RwLock::new(config),
            state: Mutex::new(TransportState {
                status: ClientStatus::Disconnected,
                user_agent: None,
                generation: 0,
                registerer: None,
                registered: None,
                unregistered: None,
                retry,
                dying_remaining,
                cycle: CancellationToken::new(),
            }),
            priority: AtomicBool::new(false),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_network_watch(
            Arc::downgrade(&inner),
            network.subscribe(),
            inner.shutdown.clone(),
        ));

        Ok(Self { inner })
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Set by the owner while it has at least one call
    pub fn set_priority(&self, priority: bool) {
        let previous = self.inner.priority.swap(priority, Ordering::SeqCst);
        if previous != priority {
            debug!(priority, "Transport priority changed");
        }
    }

    pub fn priority(&self) -> bool {
        self.inner.priority.load(Ordering::SeqCst)
    }

    pub fn retry_state(&self) -> RetryState {
        self.inner.state.lock().retry
    }

    /// What is left of the dying budget of the current or last outage
    pub fn dying_remaining(&self) -> Duration {
        self.inner.state.lock().dying_remaining
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.read().clone()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn domain(&self) -> String {
        self.inner.config.read().domain()
    }

    /// Complete a dial string with the account's domain
    pub fn make_uri(&self, number: &str) -> String {
        uri::make_uri(number, &self.domain())
    }

    /// Connect and register
    ///
    /// Concurrent and repeated calls share one attempt. Fails with
    /// `RecoveryInProgress` while the transport is recovering by itself.
    pub async fn connect(&self) -> ClientResult<bool> {
        loop {
            let pending = self.inner.state.lock().unregistered.clone();
            if let Some(pending) = pending {
                warn!("connect() called while unregistering, waiting for it to finish");
                pending.await;
                continue;
            }

            let attempt = {
                let mut state = self.inner.state.lock();
                if state.unregistered.is_some() {
                    continue;
                }
                match state.status {
                    ClientStatus::Recovering | ClientStatus::Dying => return Err(ClientError::RecoveryInProgress),
                    ClientStatus::Connected | ClientStatus::Connecting => match state.registered.clone() {
                        Some(registered) => registered,
                        None => return Err(ClientError::internal("connected without a registration")),
                    },
                    ClientStatus::Disconnecting => {
                        return Err(ClientError::internal("disconnecting without a pending unregister"));
                    }
                    ClientStatus::Disconnected => self.inner.begin_connecting(&mut state),
                }
            };
            return attempt.await;
        }
    }

    /// Unregister and close the signalling socket
    ///
    /// Always passes through `Disconnecting`. Stops recovery in progress.
    pub async fn disconnect(&self, options: DisconnectOptions) -> ClientResult<()> {
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                match state.status {
                    ClientStatus::Disconnected => return Ok(()),
                    ClientStatus::Connecting => Step::WaitConnect(state.registered.clone()),
                    ClientStatus::Disconnecting => Step::WaitUnregister(state.unregistered.clone()),
                    ClientStatus::Connected | ClientStatus::Dying | ClientStatus::Recovering => {
                        Step::WaitUnregister(Some(self.inner.begin_disconnecting(&mut state, options)))
                    }
                }
            };

            match step {
                Step::WaitConnect(Some(attempt)) => {
                    debug!("disconnect() waiting for the pending connect");
                    let _ = attempt.await;
                }
                Step::WaitConnect(None) => return Err(ClientError::internal("connecting without an attempt")),
                Step::WaitUnregister(Some(unregister)) => {
                    unregister.await;
                    return Ok(());
                }
                Step::WaitUnregister(None) => return Ok(()),
            }
        }
    }

    /// Apply new settings, reconnecting if the transport is in use
    pub async fn reconfigure(&self, config: ClientConfig) -> ClientResult<()> {
        config.validate()?;
        let status = {
            let mut state = self.inner.state.lock();
            state.retry = retry_state(&config);
            *self.inner.config.write() = config;
            state.status
        };
        info!(%status, "Transport reconfigured");

        if status != ClientStatus::Disconnected {
            self.disconnect(DisconnectOptions {
                has_registered: status == ClientStatus::Connected,
            })
            .await?;
            self.connect().await?;
        }
        Ok(())
    }

    /// Send an INVITE through the current user agent
    pub async fn invite(&self, target: &str) -> ClientResult<Arc<dyn SessionHandle>> {
        let user_agent = self.connected_user_agent()?;
        let uri = self.make_uri(target);
        info!(target = %uri, "Sending INVITE");
        user_agent.invite(&uri).await
    }

    /// Prepare a dialog-event subscription through the current user agent
    pub fn subscriber(&self, target: &str) -> ClientResult<Arc<dyn SubscriptionHandle>> {
        let user_agent = self.connected_user_agent()?;
        user_agent.create_subscriber(target)
    }

    fn connected_user_agent(&self) -> ClientResult<Arc<dyn UserAgent>> {
        let state = self.inner.state.lock();
        if state.status != ClientStatus::Connected {
            return Err(ClientError::NotConnected);
        }
        state.user_agent.clone().ok_or(ClientError::NotConnected)
    }
}

impl fmt::Debug for ReconnectableTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectableTransport")
            .field("status", &self.status())
            .field("priority", &self.priority())
            .finish()
    }
}

enum Step {
    WaitConnect(Option<SharedConnect>),
    WaitUnregister(Option<SharedUnregister>),
}

fn retry_state(config: &ClientConfig) -> RetryState {
    RetryState::new(
        Duration::from_millis(config.reconnection.retry_interval_ms),
        Duration::from_millis(config.reconnection.retry_limit_ms),
    )
}

impl TransportInner {
    /// Change status, cancel the old state's timers and publish the change
    ///
    /// Returns the token for work started in the new state.
    fn enter(&self, state: &mut TransportState, status: ClientStatus) -> CancellationToken {
        if state.status == status {
            return state.cycle.clone();
        }
        state.cycle.cancel();
        state.cycle = CancellationToken::new();

        let previous = state.status;
        state.status = status;
        info!(from = %previous, to = %status, "Transport status changed");
        let _ = self.events.send(TransportEvent::StatusUpdate(status));
        state.cycle.clone()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self) -> ClientStatus {
        self.state.lock().status
    }

    fn begin_connecting(self: &Arc<Self>, state: &mut TransportState) -> SharedConnect {
        let token = self.enter(state, ClientStatus::Connecting);

        let inner = self.clone();
        let task = tokio::spawn(async move { inner.establish(token).await });
        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::internal(format!("connect task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        state.registered = Some(attempt.clone());
        attempt
    }

    async fn establish(self: Arc<Self>, token: CancellationToken) -> ClientResult<bool> {
        let result = self.open_and_register(&token).await;

        let mut state = self.state.lock();
        match result {
            Ok(()) if state.status == ClientStatus::Connecting => {
                self.enter_connected(&mut state);
                Ok(true)
            }
            Ok(()) => {
                warn!(status = %state.status, "Registration finished after the transport moved on");
                Err(ClientError::NotConnected)
            }
            Err(e) => {
                error!(error = %e, category = e.category(), "Connect failed");
                self.discard_user_agent(&mut state);
                state.registered = None;
                self.enter(&mut state, ClientStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Registered: reset retry state and start the keepalive
    fn enter_connected(self: &Arc<Self>, state: &mut TransportState) {
        state.retry.reset();
        let token = self.enter(state, ClientStatus::Connected);

        let keepalive = self.config.read().keepalive_interval();
        if let Some(period) = keepalive {
            let timeout = self.config.read().ws_timeout();
            tokio::spawn(run_keepalive(Arc::downgrade(self), token, period, timeout));
        }
    }

    /// Replace the user agent with a fresh one and register it
    ///
    /// The new agent is only installed while `token` is live; a state left in
    /// the meantime gets `NotConnected` and the agent is stopped again.
    async fn open_and_register(self: &Arc<Self>, token: &CancellationToken) -> ClientResult<()> {
        let config = self.config.read().clone();
        let (delegate, delegate_rx) = mpsc::unbounded_channel();
        let user_agent = self
            .engine
            .create_user_agent(UserAgentOptions::from(&config), delegate)?;

        {
            let mut state = self.state.lock();
            if token.is_cancelled() {
                drop(state);
                debug!("State changed before the user agent was installed");
                tokio::spawn(async move {
                    let _ = user_agent.stop().await;
                });
                return Err(ClientError::NotConnected);
            }
            self.discard_user_agent(&mut state);
            state.generation += 1;
            state.user_agent = Some(user_agent.clone());
            tokio::spawn(run_delegate(Arc::downgrade(self), state.generation, delegate_rx));
        }

        debug!(servers = ?config.transport.ws_servers, "Starting user agent");
        with_timeout("websocket open", config.ws_timeout(), user_agent.start()).await?;
        self.register(&user_agent, config.register_timeout()).await
    }

    async fn register(&self, user_agent: &Arc<dyn UserAgent>, timeout: Duration) -> ClientResult<()> {
        let registerer = user_agent.create_registerer();
        let previous = self.state.lock().registerer.replace(registerer.clone());
        if let Some(previous) = previous {
            previous.dispose();
        }

        let mut registration = registerer.state();
        with_timeout("register", timeout, async {
            registerer.register().await?;
            let outcome = *registration
                .wait_for(|s| *s != RegistererState::Initial)
                .await
                .map_err(|_| ClientError::registration_failed("registerer dropped"))?;
            match outcome {
                RegistererState::Registered => {
                    info!("Registered");
                    Ok(())
                }
                other => Err(ClientError::registration_failed(format!("registrar answered {:?}", other))),
            }
        })
        .await
    }

    /// Stop and forget the current user agent without unregistering
    fn discard_user_agent(&self, state: &mut TransportState) {
        if let Some(registerer) = state.registerer.take() {
            registerer.dispose();
        }
        if let Some(user_agent) = state.user_agent.take() {
            tokio::spawn(async move {
                if let Err(e) = user_agent.stop().await {
                    debug!(error = %e, "Stopping discarded user agent failed");
                }
            });
        }
    }

    fn begin_disconnecting(self: &Arc<Self>, state: &mut TransportState, options: DisconnectOptions) -> SharedUnregister {
        // a dying or recovering transport has no registration left to remove
        let unregister = options.has_registered && state.status == ClientStatus::Connected;
        self.enter(state, ClientStatus::Disconnecting);
        state.registered = None;

        let user_agent = state.user_agent.clone();
        let inner = self.clone();
        let task = tokio::spawn(async move { inner.teardown(user_agent, unregister).await });
        let unregister = async move {
            if let Err(e) = task.await {
                error!(error = %e, "Teardown task failed");
            }
        }
        .boxed()
        .shared();

        state.unregistered = Some(unregister.clone());
        unregister
    }

    async fn teardown(self: Arc<Self>, user_agent: Option<Arc<dyn UserAgent>>, has_registered: bool) {
        let (register_timeout, ws_timeout) = {
            let config = self.config.read();
            (config.register_timeout(), config.ws_timeout())
        };

        if let Some(user_agent) = user_agent {
            if has_registered {
                let unregisterer = user_agent.create_registerer();
                let previous = self.state.lock().registerer.replace(unregisterer.clone());
                if let Some(previous) = previous {
                    previous.dispose();
                }

                let mut registration = unregisterer.state();
                let result = with_timeout("unregister", register_timeout, async {
                    unregisterer.unregister().await?;
                    registration
                        .wait_for(|s| matches!(s, RegistererState::Unregistered | RegistererState::Terminated))
                        .await
                        .map_err(|_| ClientError::registration_failed("unregisterer dropped"))?;
                    Ok(())
                })
                .await;
                match result {
                    Ok(()) => info!("Unregistered"),
                    Err(e) => warn!(error = %e, "Unregister failed, closing anyway"),
                }
            }

            if let Err(e) = with_timeout("stop", ws_timeout, user_agent.stop()).await {
                warn!(error = %e, "User agent did not stop cleanly");
            }
        }

        let mut state = self.state.lock();
        if let Some(registerer) = state.registerer.take() {
            registerer.dispose();
        }
        state.user_agent = None;
        state.unregistered = None;
        if state.status == ClientStatus::Disconnecting {
            self.enter(&mut state, ClientStatus::Disconnected);
        }
    }

    /// Connected → Dying
    fn on_network_lost(self: &Arc<Self>, trigger: &'static str) {
        {
            let mut state = self.state.lock();
            if state.status != ClientStatus::Connected {
                debug!(trigger, status = %state.status, "Ignoring network loss");
                return;
            }
            warn!(trigger, "Network lost");
            let token = self.enter(&mut state, ClientStatus::Dying);
            state.registered = None;
            state.dying_remaining = self.config.read().dying_budget();

            let tick = self.config.read().dying_tick();
            tokio::spawn(run_dying_countdown(Arc::downgrade(self), token, tick));
        }

        if self.network.is_online() {
            self.start_recovery();
        }
    }

    /// Dying → Recovering
    fn start_recovery(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.status != ClientStatus::Dying {
            return;
        }
        let token = self.enter(&mut state, ClientStatus::Recovering);
        let budget = state.dying_remaining;
        tokio::spawn(run_recovery(Arc::downgrade(self), token, budget));
    }

    async fn probe_servers(&self, timeout: Duration) -> ClientResult<()> {
        let servers = self.config.read().transport.ws_servers.clone();
        let mut last_error = ClientError::network("no websocket servers configured");
        for server in servers {
            match self.probe.probe(&server, timeout).await {
                Ok(()) => {
                    debug!(server = %server, "Signalling server reachable");
                    return Ok(());
                }
                Err(e) => {
                    trace!(server = %server, error = %e, "Probe failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Probe every `burst_interval` until success or `budget` is spent
    async fn burst_probe(&self, token: &CancellationToken, budget: Duration) -> ClientResult<()> {
        let (interval, ws_timeout) = {
            let config = self.config.read();
            (config.burst_interval(), config.ws_timeout())
        };
        let deadline = Instant::now() + budget;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let error = match self.probe_servers(ws_timeout.min(remaining.max(interval))).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if Instant::now() + interval >= deadline {
                return Err(error);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(error),
                _ = tokio::time::sleep(interval) => {}
            }
            if self.status() != ClientStatus::Recovering {
                return Err(error);
            }
        }
    }

    fn emit_revive(&self) {
        if self.priority.load(Ordering::SeqCst) {
            info!("Reviving sessions");
            self.emit(TransportEvent::ReviveSessions);
        }
        self.emit(TransportEvent::ReviveSubscriptions);
    }

    fn next_retry_delay(&self) -> Duration {
        let mut state = self.state.lock();
        increase_timeout(&mut state.retry)
    }

    /// Register a fresh user agent without leaving Recovering
    ///
    /// Ends in Connected on success and in Disconnected when the registrar
    /// refuses. A recoverable failure leaves the transport Recovering.
    async fn reregister(self: &Arc<Self>, token: &CancellationToken) -> ClientResult<()> {
        let result = self.open_and_register(token).await;

        let mut state = self.state.lock();
        if token.is_cancelled() || state.status != ClientStatus::Recovering {
            debug!(status = %state.status, "Recovery abandoned during re-registration");
            return Err(ClientError::NotConnected);
        }
        match result {
            Ok(()) => {
                let registered: SharedConnect = futures::future::ready(Ok(true)).boxed().shared();
                state.registered = Some(registered);
                self.enter_connected(&mut state);
                info!("Recovered");
                Ok(())
            }
            Err(e) => {
                self.discard_user_agent(&mut state);
                if !e.is_recoverable() {
                    error!(error = %e, "Re-registration rejected, giving up");
                    self.enter(&mut state, ClientStatus::Disconnected);
                }
                Err(e)
            }
        }
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.state.get_mut().cycle.cancel();
    }
}

/// Forward agent events for one user agent generation
async fn run_delegate(weak: Weak<TransportInner>, generation: u64, mut events: mpsc::UnboundedReceiver<UserAgentEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            UserAgentEvent::Invite(handle) => {
                debug!(call_id = %handle.call_id(), "Inbound INVITE");
                inner.emit(TransportEvent::Invite(handle));
            }
            UserAgentEvent::TransportClosed { reason } => {
                if inner.state.lock().generation != generation {
                    trace!(generation, "Socket of a replaced user agent closed");
                    continue;
                }
                warn!(reason = ?reason, "Signalling socket closed");
                inner.on_network_lost("socket closed");
            }
        }
    }
    trace!(generation, "Delegate channel closed");
}

async fn run_network_watch(weak: Weak<TransportInner>, mut online: watch::Receiver<bool>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let is_online = *online.borrow_and_update();
        let Some(inner) = weak.upgrade() else { break };
        if is_online {
            inner.start_recovery();
        } else {
            inner.on_network_lost("offline");
        }
    }
}

async fn run_keepalive(weak: Weak<TransportInner>, token: CancellationToken, period: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        let user_agent = {
            let state = inner.state.lock();
            if state.status != ClientStatus::Connected {
                break;
            }
            state.user_agent.clone()
        };
        let Some(user_agent) = user_agent else { break };

        match with_timeout("keepalive", timeout, user_agent.ping()).await {
            Ok(()) => trace!("Keepalive answered"),
            Err(e) => {
                if token.is_cancelled() {
                    break;
                }
                warn!(error = %e, "Keepalive failed");
                inner.on_network_lost("keepalive");
                break;
            }
        }
    }
}

async fn run_dying_countdown(weak: Weak<TransportInner>, token: CancellationToken, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        let mut state = inner.state.lock();
        if state.status != ClientStatus::Dying {
            break;
        }
        state.dying_remaining = state.dying_remaining.saturating_sub(tick);
        if state.dying_remaining.is_zero() {
            if inner.priority.swap(false, Ordering::SeqCst) {
                info!("Dying budget spent, calls considered lost");
            }
            break;
        }
    }
}

/// Drive Recovering back to Connected
///
/// Probes until a server answers, then re-registers. Failures of either step
/// back off and start over while the transport is still Recovering.
async fn run_recovery(weak: Weak<TransportInner>, token: CancellationToken, mut burst_budget: Duration) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        if token.is_cancelled() || inner.status() != ClientStatus::Recovering {
            return;
        }

        let burst = inner.priority.load(Ordering::SeqCst) && !burst_budget.is_zero();
        let probe = if burst {
            debug!(budget_ms = burst_budget.as_millis() as u64, "Burst probing");
            let started = Instant::now();
            let result = inner.burst_probe(&token, burst_budget).await;
            if token.is_cancelled() {
                return;
            }
            if result.is_err() {
                burst_budget = burst_budget.saturating_sub(started.elapsed());
                // burst_probe never starts a cycle with one interval or less left
                if burst_budget <= inner.config.read().burst_interval() {
                    burst_budget = Duration::ZERO;
                    if inner.priority.swap(false, Ordering::SeqCst) {
                        info!("Burst recovery exhausted, dropping priority");
                    }
                }
            }
            result
        } else {
            let timeout = inner.config.read().ws_timeout();
            inner.probe_servers(timeout).await
        };

        let result = match probe {
            Ok(()) => inner.reregister(&token).await,
            Err(e) => Err(e),
        };
        let error = match result {
            Ok(()) => {
                inner.emit_revive();
                return;
            }
            Err(e) => e,
        };
        if token.is_cancelled() {
            return;
        }

        let delay = inner.next_retry_delay();
        debug!(error = %error, delay_ms = delay.as_millis() as u64, "Recovery attempt failed, retrying later");
        drop(inner);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
