//! In-memory SIP engine, probe and helpers shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

use webcall_core::engine::{
    InitialRequest, ReferTarget, Registerer, RegistererState, Reinvite, SessionHandle, SessionHandleEvent, SipEngine,
    SubscriptionEvent, SubscriptionHandle, UserAgent, UserAgentEvent, UserAgentOptions,
};
use webcall_core::events::ClientEvent;
use webcall_core::probe::ReachabilityProbe;
use webcall_core::transport::TransportEvent;
use webcall_core::{ClientConfig, ClientError, ClientResult, ClientStatus};

pub const WAIT: Duration = Duration::from_secs(5);

/// Debug logs of the crate under test, captured per test
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("webcall_core=debug")
        .with_test_writer()
        .try_init();
}

/// Formatted log lines written while a [`LogCapture::install`] guard lives
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route this thread's events into the capture
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter("webcall_core=debug")
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contains(&self, text: &str) -> bool {
        String::from_utf8_lossy(&self.buffer.lock()).contains(text)
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub fn config() -> ClientConfig {
    init_logging();

    ClientConfig::new("sip:100@example.com", "100", "secret").with_ws_server("wss://sip.example.com:7443")
}

/// How registerers answer REGISTER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBehavior {
    Accept,
    Reject,
    /// Never answer; the transport's deadline has to fire
    Ignore,
}

#[derive(Default)]
pub struct Counters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub registers: AtomicUsize,
    pub unregisters: AtomicUsize,
    pub pings: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct EngineControl {
    register: Mutex<RegisterBehavior>,
    ping_ok: AtomicBool,
    /// `start()` waits here when set
    start_gate: Mutex<Option<Arc<Notify>>>,
    /// `unregister()` waits here when set
    unregister_gate: Mutex<Option<Arc<Notify>>>,
}

pub struct MockEngine {
    control: Arc<EngineControl>,
    agents: Mutex<Vec<Arc<MockUserAgent>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            control: Arc::new(EngineControl {
                register: Mutex::new(RegisterBehavior::Accept),
                ping_ok: AtomicBool::new(true),
                start_gate: Mutex::new(None),
                unregister_gate: Mutex::new(None),
            }),
            agents: Mutex::new(Vec::new()),
        })
    }

    pub fn set_register(&self, behavior: RegisterBehavior) {
        *self.control.register.lock() = behavior;
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.control.ping_ok.store(ok, Ordering::SeqCst);
    }

    /// Hold every later `start()` until the returned gate is notified
    pub fn hold_start(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.control.start_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold every later `unregister()` until the returned gate is notified
    pub fn hold_unregister(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.control.unregister_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn agents_created(&self) -> usize {
        self.agents.lock().len()
    }

    /// Most recently created user agent
    pub fn agent(&self) -> Arc<MockUserAgent> {
        self.agents.lock().last().cloned().expect("no user agent created")
    }
}

impl SipEngine for MockEngine {
    fn create_user_agent(
        &self,
        options: UserAgentOptions,
        delegate: mpsc::UnboundedSender<UserAgentEvent>,
    ) -> ClientResult<Arc<dyn UserAgent>> {
        let agent = Arc::new(MockUserAgent {
            options,
            control: self.control.clone(),
            delegate,
            counters: Arc::new(Counters::default()),
            next_call: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        });
        self.agents.lock().push(agent.clone());
        Ok(agent)
    }
}

pub struct MockUserAgent {
    pub options: UserAgentOptions,
    control: Arc<EngineControl>,
    delegate: mpsc::UnboundedSender<UserAgentEvent>,
    pub counters: Arc<Counters>,
    next_call: AtomicUsize,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
    pub subscriptions: Mutex<Vec<Arc<MockSubscription>>>,
}

impl MockUserAgent {
    /// Deliver an inbound INVITE
    pub fn offer_call(&self, call_id: &str, from: &str) -> Arc<MockSession> {
        let session = MockSession::new(call_id, from);
        let _ = self.delegate.send(UserAgentEvent::Invite(session.clone()));
        session
    }

    /// The signalling socket drops underneath the agent
    pub fn close_socket(&self) {
        let _ = self.delegate.send(UserAgentEvent::TransportClosed {
            reason: Some("connection reset".into()),
        });
    }

    pub fn subscription(&self, target: &str) -> Option<Arc<MockSubscription>> {
        self.subscriptions
            .lock()
            .iter()
            .rev()
            .find(|s| s.target == target)
            .cloned()
    }
}

#[async_trait]
impl UserAgent for MockUserAgent {
    async fn start(&self) -> ClientResult<()> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        let gate = self.control.start_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn stop(&self) -> ClientResult<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_registerer(&self) -> Arc<dyn Registerer> {
        let (state, _) = watch::channel(RegistererState::Initial);
        Arc::new(MockRegisterer {
            behavior: *self.control.register.lock(),
            unregister_gate: self.control.unregister_gate.lock().clone(),
            state,
            counters: self.counters.clone(),
        })
    }

    async fn invite(&self, target: &str) -> ClientResult<Arc<dyn SessionHandle>> {
        let n = self.next_call.fetch_add(1, Ordering::SeqCst);
        let session = MockSession::new(&format!("out-{}", n), target);
        self.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn create_subscriber(&self, target: &str) -> ClientResult<Arc<dyn SubscriptionHandle>> {
        let subscription = MockSubscription::new(target);
        self.subscriptions.lock().push(subscription.clone());
        Ok(subscription)
    }

    async fn ping(&self) -> ClientResult<()> {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        if self.control.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::network("OPTIONS timed out"))
        }
    }
}

struct MockRegisterer {
    behavior: RegisterBehavior,
    unregister_gate: Option<Arc<Notify>>,
    state: watch::Sender<RegistererState>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Registerer for MockRegisterer {
    async fn register(&self) -> ClientResult<()> {
        self.counters.registers.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RegisterBehavior::Accept => {
                self.state.send_replace(RegistererState::Registered);
                Ok(())
            }
            RegisterBehavior::Reject => Err(ClientError::registration_failed("403 Forbidden")),
            RegisterBehavior::Ignore => Ok(()),
        }
    }

    async fn unregister(&self) -> ClientResult<()> {
        self.counters.unregisters.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.unregister_gate {
            gate.notified().await;
        }
        self.state.send_replace(RegistererState::Unregistered);
        Ok(())
    }

    fn state(&self) -> watch::Receiver<RegistererState> {
        self.state.subscribe()
    }

    fn dispose(&self) {}
}

pub struct MockSession {
    call_id: String,
    request: InitialRequest,
    events: Mutex<Option<mpsc::UnboundedSender<SessionHandleEvent>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SessionHandleEvent>>>,
    calls: Mutex<Vec<String>>,
}

impl MockSession {
    pub fn new(call_id: &str, from: &str) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            call_id: call_id.to_string(),
            request: InitialRequest {
                from_uri: from.to_string(),
                headers: HashMap::new(),
            },
            events: Mutex::new(Some(events)),
            receiver: Mutex::new(Some(receiver)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn send(&self, event: SessionHandleEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Far end picks up an outbound call
    pub fn answer(&self) {
        self.send(SessionHandleEvent::Accepted);
    }

    /// Far end hangs up an established call
    pub fn hang_up(&self) {
        self.send(SessionHandleEvent::Bye);
        self.send(SessionHandleEvent::Terminated);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(name)).count()
    }
}

#[async_trait]
impl SessionHandle for MockSession {
    fn call_id(&self) -> String {
        self.call_id.clone()
    }

    fn request(&self) -> InitialRequest {
        self.request.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionHandleEvent>> {
        self.receiver.lock().take()
    }

    async fn accept(&self) -> ClientResult<()> {
        self.calls.lock().push("accept".into());
        self.send(SessionHandleEvent::Accepted);
        Ok(())
    }

    async fn reject(&self, status_code: u16, _reason: &str) -> ClientResult<()> {
        self.calls.lock().push(format!("reject {}", status_code));
        self.send(SessionHandleEvent::Terminated);
        Ok(())
    }

    async fn cancel(&self) -> ClientResult<()> {
        self.calls.lock().push("cancel".into());
        self.send(SessionHandleEvent::Rejected {
            status_code: 487,
            reason: "Request Terminated".into(),
        });
        self.send(SessionHandleEvent::Terminated);
        Ok(())
    }

    async fn bye(&self) -> ClientResult<()> {
        self.calls.lock().push("bye".into());
        self.send(SessionHandleEvent::Terminated);
        Ok(())
    }

    async fn reinvite(&self, request: Reinvite) -> ClientResult<()> {
        self.calls.lock().push(format!(
            "reinvite hold={} ice_restart={}",
            request.hold, request.ice_restart
        ));
        self.send(SessionHandleEvent::ReinviteAccepted);
        Ok(())
    }

    async fn dtmf(&self, key: char) -> ClientResult<()> {
        self.calls.lock().push(format!("dtmf {}", key));
        Ok(())
    }

    async fn refer(&self, target: ReferTarget) -> ClientResult<()> {
        self.calls.lock().push(format!("refer {:?}", target));
        Ok(())
    }
}

pub struct MockSubscription {
    pub target: String,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionEvent>>>,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub disposed: AtomicBool,
}

impl MockSubscription {
    fn new(target: &str) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            target: target.to_string(),
            events,
            receiver: Mutex::new(Some(receiver)),
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn notify(&self, state: &str) {
        let body = format!(
            r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="{}">
  <dialog id="d1" direction="recipient"><state>{}</state></dialog>
</dialog-info>"#,
            self.target, state
        );
        let _ = self.events.send(SubscriptionEvent::Notify { body });
    }
}

#[async_trait]
impl SubscriptionHandle for MockSubscription {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        self.receiver.lock().take()
    }

    async fn subscribe(&self) -> ClientResult<()> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) -> ClientResult<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Probe whose answer the test controls
pub struct MockProbe {
    reachable: AtomicBool,
    pub probes: AtomicUsize,
    times: Mutex<Vec<Instant>>,
}

impl MockProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            probes: AtomicUsize::new(0),
            times: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// When each probe was made
    pub fn times(&self) -> Vec<Instant> {
        self.times.lock().clone()
    }

    /// Gaps between consecutive probes
    pub fn gaps(&self) -> Vec<Duration> {
        self.times().windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl ReachabilityProbe for MockProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> ClientResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.times.lock().push(Instant::now());
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::network(format!("{} unreachable", url)))
        }
    }
}

/// Collect transport statuses until `target` shows up
pub async fn statuses_until(
    events: &mut broadcast::Receiver<TransportEvent>,
    target: ClientStatus,
) -> Vec<ClientStatus> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            if let TransportEvent::StatusUpdate(status) = events.recv().await.expect("transport events closed") {
                seen.push(status);
                if status == target {
                    break;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {:?}, saw {:?}", target, seen));
    seen
}

/// Next client event matching `predicate`
pub async fn next_client_event<F>(events: &mut broadcast::Receiver<ClientEvent>, mut predicate: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("client events closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected client event never arrived")
}

/// Poll `condition` until it holds
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Await `future` with the shared deadline
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("operation timed out")
}
