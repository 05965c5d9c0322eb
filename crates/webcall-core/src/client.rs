//! Client facade
//!
//! [`Client`] ties one [`ReconnectableTransport`] to the session registry and
//! the presence subscriptions, and republishes everything on a single
//! [`ClientEvent`] stream.
//!
//! Sessions enter the registry when an outbound INVITE is sent or an inbound
//! one is offered, and leave it only when their `terminated()` outcome
//! settles. While the registry is non-empty the transport runs with priority,
//! so a network outage is recovered aggressively to save the calls.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webcall_core::{ClientBuilder, ClientConfig};
//! # async fn example(engine: Arc<dyn webcall_core::engine::SipEngine>) -> webcall_core::ClientResult<()> {
//!
//! let config = ClientConfig::new("sip:100@example.com", "100", "secret")
//!     .with_ws_server("wss://sip.example.com:7443");
//! let client = ClientBuilder::new(config).engine(engine).build().await?;
//!
//! client.connect().await?;
//! let session = client.invite("201").await?;
//! let outcome = session.terminated().await;
//! println!("call ended: {:?}", outcome.cause);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::engine::{SessionHandle, SipEngine};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventEmitter, EventIterator, EventStream};
use crate::media::{MediaContext, MediaProvider, NoopMediaProvider};
use crate::network::NetworkMonitor;
use crate::probe::{ReachabilityProbe, WebSocketProbe};
use crate::session::{RejectOptions, Session, SessionDirection, SessionEvent, SessionSetup, TerminationOutcome};
use crate::subscription::{PresenceStatus, SubscriptionManager};
use crate::transport::{ClientStatus, DisconnectOptions, ReconnectableTransport, TransportEvent};

/// Decides whether an inbound call is turned away with 486 Busy Here
pub type DoNotDisturb = Arc<dyn Fn() -> bool + Send + Sync>;

/// Builder for [`Client`]
///
/// Only the SIP engine is mandatory. Everything else defaults to a real
/// WebSocket probe, a media provider that binds nothing, an online network
/// and do-not-disturb switched off.
pub struct ClientBuilder {
    config: ClientConfig,
    engine: Option<Arc<dyn SipEngine>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    media_provider: Option<Arc<dyn MediaProvider>>,
    network: Option<NetworkMonitor>,
    do_not_disturb: Option<DoNotDisturb>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            engine: None,
            probe: None,
            media_provider: None,
            network: None,
            do_not_disturb: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn SipEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Replace the reachability check used while recovering
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn media_provider(mut self, provider: Arc<dyn MediaProvider>) -> Self {
        self.media_provider = Some(provider);
        self
    }

    /// Share an online/offline signal with the host application
    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = Some(network);
        self
    }

    pub fn do_not_disturb<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.do_not_disturb = Some(Arc::new(predicate));
        self
    }

    /// Validate the configuration and start the client's background tasks
    ///
    /// Must be called within a tokio runtime. Does not connect.
    pub async fn build(self) -> ClientResult<Client> {
        let engine = self
            .engine
            .ok_or_else(|| ClientError::invalid_configuration("engine", "a SIP engine is required"))?;
        let probe = self.probe.unwrap_or_else(|| Arc::new(WebSocketProbe));
        let provider = self
            .media_provider
            .unwrap_or_else(|| Arc::new(NoopMediaProvider::new()));
        let network = self.network.unwrap_or_default();

        let media = MediaContext::new(provider, self.config.media.clone());
        if let Err(e) = media.refresh_devices().await {
            warn!(error = %e, "Initial device enumeration failed");
        }
        media.start_watching();

        let transport = ReconnectableTransport::new(self.config, engine, probe, network)?;
        let events = EventEmitter::new();
        let subscriptions = SubscriptionManager::new(transport.clone(), events.clone());
        let transport_events = transport.subscribe_events();

        let inner = Arc::new(ClientInner {
            transport,
            sessions: DashMap::new(),
            subscriptions,
            events,
            media,
            do_not_disturb: RwLock::new(self.do_not_disturb),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_transport_events(
            Arc::downgrade(&inner),
            transport_events,
            inner.shutdown.clone(),
        ));

        info!(domain = %inner.transport.domain(), "Client ready");
        Ok(Client { inner })
    }
}

struct ClientInner {
    transport: ReconnectableTransport,
    sessions: DashMap<String, Session>,
    subscriptions: Arc<SubscriptionManager>,
    events: EventEmitter,
    media: Arc<MediaContext>,
    do_not_disturb: RwLock<Option<DoNotDisturb>>,
    shutdown: CancellationToken,
}

/// SIP-over-WebSocket calling client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Connect and register; see [`ReconnectableTransport::connect`]
    pub async fn connect(&self) -> ClientResult<bool> {
        self.inner.transport.connect().await
    }

    /// Unregister and close the signalling socket
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.inner.transport.disconnect(DisconnectOptions::default()).await
    }

    /// Apply new account or transport settings, reconnecting if needed
    pub async fn reconfigure(&self, config: ClientConfig) -> ClientResult<()> {
        self.inner.transport.reconfigure(config).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.transport.status()
    }

    /// Call `number` (a dial string or SIP URI)
    ///
    /// The returned session is already in the registry. Requires a
    /// `Connected` transport.
    pub async fn invite(&self, number: &str) -> ClientResult<Session> {
        let handle = self.inner.transport.invite(number).await?;
        let (session, events) = Session::spawn(handle, SessionDirection::Outgoing, self.inner.session_setup())?;
        self.inner.track(session.clone(), events);
        Ok(session)
    }

    /// Watch the dialog state of a contact
    pub async fn subscribe(&self, uri: &str) -> ClientResult<()> {
        self.inner.subscriptions.subscribe(uri).await
    }

    pub async fn resubscribe(&self, uri: &str) -> ClientResult<()> {
        self.inner.subscriptions.resubscribe(uri).await
    }

    pub fn unsubscribe(&self, uri: &str) {
        self.inner.subscriptions.unsubscribe(uri)
    }

    /// Last known presence of a subscribed contact
    pub fn presence(&self, uri: &str) -> Option<PresenceStatus> {
        self.inner.subscriptions.status(uri)
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.inner.subscriptions
    }

    pub fn get_sessions(&self) -> Vec<Session> {
        self.inner.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Transfer the far end of session `a` to the far end of session `b`
    pub async fn attended_transfer(&self, a: &str, b: &str) -> ClientResult<()> {
        let session = self.session_or_err(a)?;
        let target = self.session_or_err(b)?;
        session.attended_transfer(&target).await
    }

    fn session_or_err(&self, id: &str) -> ClientResult<Session> {
        self.get_session(id)
            .ok_or_else(|| ClientError::SessionNotFound { id: id.to_string() })
    }

    /// Switch do-not-disturb on or off, replacing any configured predicate
    pub fn set_do_not_disturb(&self, enabled: bool) {
        info!(enabled, "Do not disturb changed");
        let predicate: Option<DoNotDisturb> = if enabled { Some(Arc::new(|| true)) } else { None };
        *self.inner.do_not_disturb.write() = predicate;
    }

    pub fn do_not_disturb(&self) -> bool {
        self.inner.do_not_disturb()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_stream(&self) -> EventStream {
        self.inner.events.stream()
    }

    pub fn event_iterator(&self) -> EventIterator {
        self.inner.events.iterator()
    }

    pub fn network(&self) -> &NetworkMonitor {
        self.inner.transport.network()
    }

    pub fn media(&self) -> &Arc<MediaContext> {
        &self.inner.media
    }

    pub fn transport(&self) -> &ReconnectableTransport {
        &self.inner.transport
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .field("sessions", &self.inner.sessions.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl ClientInner {
    fn session_setup(&self) -> SessionSetup {
        let config = self.transport.config();
        SessionSetup {
            domain: config.domain(),
            media: self.media.clone(),
            stats_interval: config.stats_interval(),
        }
    }

    fn do_not_disturb(&self) -> bool {
        let predicate = self.do_not_disturb.read().clone();
        predicate.is_some_and(|active| active())
    }

    /// Put a session in the registry and follow it until it terminates
    fn track(self: &Arc<Self>, session: Session, events: broadcast::Receiver<SessionEvent>) {
        self.sessions.insert(session.id().to_string(), session.clone());
        self.transport.set_priority(true);
        debug!(call_id = %session.id(), sessions = self.sessions.len(), "Session added");
        self.events.emit(ClientEvent::SessionAdded {
            session: session.clone(),
        });

        tokio::spawn(run_session_events(Arc::downgrade(self), session, events));
    }

    fn on_invite(self: &Arc<Self>, handle: Arc<dyn SessionHandle>) {
        let call_id = handle.call_id();
        if self.do_not_disturb() {
            info!(call_id = %call_id, "Do not disturb active, rejecting call");
            let busy = RejectOptions::default();
            tokio::spawn(async move {
                if let Err(e) = handle.reject(busy.status_code, &busy.reason).await {
                    warn!(call_id = %call_id, error = %e, "Failed to reject call");
                }
            });
            return;
        }

        match Session::spawn(handle, SessionDirection::Incoming, self.session_setup()) {
            Ok((session, events)) => {
                self.track(session.clone(), events);
                self.events.emit(ClientEvent::Invite { session });
            }
            Err(e) => error!(call_id = %call_id, error = %e, "Failed to set up inbound session"),
        }
    }

    fn forward(&self, event: SessionEvent) {
        match event {
            SessionEvent::StatusUpdate { session_id, status } => {
                self.events.emit(ClientEvent::SessionUpdate { session_id, status });
            }
            SessionEvent::QualityUpdate { session_id, stats } => {
                self.events.emit(ClientEvent::CallQualityUpdate { session_id, stats });
            }
            SessionEvent::Terminated { .. } => {}
        }
    }

    fn remove(&self, session: &Session, outcome: TerminationOutcome) {
        if self.sessions.remove(session.id()).is_none() {
            return;
        }
        let remaining = self.sessions.len();
        self.transport.set_priority(remaining > 0);
        debug!(call_id = %session.id(), sessions = remaining, cause = ?outcome.cause, "Session removed");
        self.events.emit(ClientEvent::SessionRemoved {
            session_id: session.id().to_string(),
            outcome,
        });
    }

    fn revive_sessions(&self) {
        let sessions: Vec<Session> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        if sessions.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let results = join_all(sessions.iter().map(|session| session.revive())).await;
            for (session, result) in sessions.iter().zip(results) {
                match result {
                    Ok(_) => info!(call_id = %session.id(), "Session revived"),
                    Err(e) => warn!(call_id = %session.id(), error = %e, "Failed to revive session"),
                }
            }
        });
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.media.shutdown();
    }
}

async fn run_transport_events(
    weak: Weak<ClientInner>,
    mut events: broadcast::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Transport event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else { break };

        match event {
            TransportEvent::StatusUpdate(status) => inner.events.emit(ClientEvent::StatusUpdate {
                status,
                timestamp: Utc::now(),
            }),
            TransportEvent::Invite(handle) => inner.on_invite(handle),
            TransportEvent::ReviveSessions => inner.revive_sessions(),
            TransportEvent::ReviveSubscriptions => {
                let subscriptions = inner.subscriptions.clone();
                tokio::spawn(async move { subscriptions.resubscribe_all().await });
            }
        }
    }
    debug!("Transport event pump stopped");
}

/// Republish one session's events, then take it out of the registry
async fn run_session_events(weak: Weak<ClientInner>, session: Session, mut events: broadcast::Receiver<SessionEvent>) {
    let outcome = loop {
        match events.recv().await {
            Ok(SessionEvent::Terminated { outcome, .. }) => break outcome,
            Ok(event) => {
                let Some(inner) = weak.upgrade() else { return };
                inner.forward(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(call_id = %session.id(), skipped, "Session event stream lagged");
                // the terminated event may have been among the dropped ones
                if session.is_terminated() {
                    break session.terminated().await;
                }
            }
            Err(RecvError::Closed) => break session.terminated().await,
        }
    };

    let Some(inner) = weak.upgrade() else { return };
    inner.remove(&session, outcome);
}
