//! Call session state machine
//!
//! A [`Session`] wraps one engine dialog ([`SessionHandle`]) and gives it a
//! race-free, future-based surface whether the call is inbound or outbound.
//!
//! ```text
//!                 ┌──────────┐  accept   ┌────────┐  hold   ┌────────┐
//!  inbound ──────▶│ Awaiting │──────────▶│ Active │◀───────▶│ OnHold │
//!                 │ Decision │           └───┬────┘ unhold  └───┬────┘
//!                 └────┬─────┘               │ bye / failure    │
//!                      │ reject / cancel     ▼                  │
//!                      │                ┌────────────┐◀─────────┘
//!                      └───────────────▶│ Terminated │
//!  outbound ─▶ Ringing ── answer ──▶ Active  └────────────┘
//! ```
//!
//! Engine events are consumed by a single pump task in emission order. The
//! two externally visible outcomes, [`Session::accepted`] and
//! [`Session::terminated`], are write-once cells: whichever event settles them
//! first wins, and every later reader sees the same value. `terminated()` is
//! guaranteed to settle, including when the engine drops the dialog without
//! a terminated event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::{ReferTarget, Reinvite, SessionHandle, SessionHandleEvent};
use crate::error::{ClientError, ClientResult};
use crate::media::{AudioDirection, MediaContext, SessionMedia};
use crate::config::DeviceSettings;
use crate::stats::{QualitySnapshot, SessionStats};
use crate::uri::{RemoteIdentity, is_auto_answer, make_uri, remote_identity};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    Incoming,
    Outgoing,
}

/// Externally reported call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Not answered yet, in either direction
    Ringing,
    Active,
    OnHold,
    Terminated,
}

/// Why a session was never accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectCause {
    /// A final negative response, sent by us or received from the far end
    Rejected { status_code: u16, reason: String },
    Cancelled,
    Failed { reason: String },
    /// The dialog ended before any decision
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptOutcome {
    pub accepted: bool,
    pub reject_cause: Option<RejectCause>,
}

impl AcceptOutcome {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reject_cause: None,
        }
    }

    fn rejected(cause: RejectCause) -> Self {
        Self {
            accepted: false,
            reject_cause: Some(cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerminationCause {
    /// We hung up an established call
    LocalHangup,
    /// The far end sent BYE
    RemoteBye,
    Rejected,
    Cancelled,
    Failed { reason: String },
    /// The dialog ended without a more specific cause
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationOutcome {
    pub cause: TerminationCause,
    pub said_bye: bool,
    /// Set when the call was answered at some point
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// Per-session notifications
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusUpdate { session_id: String, status: SessionStatus },
    QualityUpdate { session_id: String, stats: QualitySnapshot },
    Terminated { session_id: String, outcome: TerminationOutcome },
}

#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Override the default microphone settings for this call
    pub input: Option<DeviceSettings>,
    /// Override the default speaker settings for this call
    pub output: Option<DeviceSettings>,
}

#[derive(Debug, Clone)]
pub struct RejectOptions {
    pub status_code: u16,
    pub reason: String,
}

impl Default for RejectOptions {
    fn default() -> Self {
        Self {
            status_code: 486,
            reason: "Busy Here".to_string(),
        }
    }
}

/// Used when `terminate` has to decline a call that was never answered
#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    pub reject: RejectOptions,
}

/// Things every session of one client shares
#[derive(Clone)]
pub(crate) struct SessionSetup {
    pub domain: String,
    pub media: Arc<MediaContext>,
    pub stats_interval: Duration,
}

/// Write-once cell that can be awaited any number of times
struct OutcomeCell<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> OutcomeCell<T> {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Store `value` unless a value is already present. Returns whether it was stored.
    fn resolve(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // the sender lives in self, so the channel stays open while we wait
            let _ = rx.changed().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ringing,
    AwaitingDecision,
    Active,
    OnHold,
    Rejected,
    Cancelled,
    Terminated,
}

impl Phase {
    fn is_established(self) -> bool {
        matches!(self, Phase::Active | Phase::OnHold)
    }

    fn status(self) -> SessionStatus {
        match self {
            Phase::Ringing | Phase::AwaitingDecision => SessionStatus::Ringing,
            Phase::Active => SessionStatus::Active,
            Phase::OnHold => SessionStatus::OnHold,
            Phase::Rejected | Phase::Cancelled | Phase::Terminated => SessionStatus::Terminated,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Ringing => "ringing",
            Phase::AwaitingDecision => "awaiting a decision",
            Phase::Active => "active",
            Phase::OnHold => "on hold",
            Phase::Rejected => "rejected",
            Phase::Cancelled => "cancelled",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Local answer to an inbound invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Undecided,
    Accepting,
    Rejecting,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    decision: Decision,
    cancel_requested: bool,
    hangup_requested: bool,
    reject_cause: Option<RejectCause>,
    failure: Option<String>,
    answered_at: Option<DateTime<Utc>>,
}

struct PendingReinvite {
    seq: u64,
    operation: &'static str,
    hold: bool,
    tx: oneshot::Sender<ClientResult<bool>>,
}

#[derive(Debug, Clone, Copy)]
enum Hangup {
    Bye,
    /// BYE once the in-flight accept has confirmed the dialog
    ByeAfterAccept,
    Cancel,
    Reject,
}

struct SessionInner {
    id: String,
    direction: SessionDirection,
    handle: Arc<dyn SessionHandle>,
    domain: String,
    remote_identity: RemoteIdentity,
    auto_answer: bool,
    created_at: DateTime<Utc>,
    stats_interval: Duration,

    state: Mutex<SessionState>,
    said_bye: AtomicBool,
    accepted: OutcomeCell<AcceptOutcome>,
    decision: OutcomeCell<ClientResult<()>>,
    terminated: OutcomeCell<TerminationOutcome>,

    reinvite: Mutex<Option<PendingReinvite>>,
    reinvite_seq: AtomicU64,

    media: SessionMedia,
    stats: Mutex<SessionStats>,
    events: broadcast::Sender<SessionEvent>,
    dtmf: mpsc::UnboundedSender<char>,
    tasks: CancellationToken,
}

/// One call. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap an engine dialog and start consuming its events
    ///
    /// The returned receiver is subscribed before the pump starts, so it sees
    /// every event of the session.
    pub(crate) fn spawn(
        handle: Arc<dyn SessionHandle>,
        direction: SessionDirection,
        setup: SessionSetup,
    ) -> ClientResult<(Session, broadcast::Receiver<SessionEvent>)> {
        let id = handle.call_id();
        let engine_events = handle
            .take_events()
            .ok_or_else(|| ClientError::internal(format!("event stream of session {} already taken", id)))?;

        let request = handle.request();
        let (remote_identity, auto_answer) = match direction {
            SessionDirection::Incoming => (
                remote_identity(&request.headers, &request.from_uri),
                is_auto_answer(&request.headers),
            ),
            SessionDirection::Outgoing => (remote_identity(&HashMap::new(), &request.from_uri), false),
        };
        let phase = match direction {
            SessionDirection::Incoming => Phase::AwaitingDecision,
            SessionDirection::Outgoing => Phase::Ringing,
        };

        let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
        let (dtmf, dtmf_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            media: SessionMedia::new(id.clone(), setup.media),
            id,
            direction,
            handle,
            domain: setup.domain,
            remote_identity,
            auto_answer,
            created_at: Utc::now(),
            stats_interval: setup.stats_interval,
            state: Mutex::new(SessionState {
                phase,
                decision: Decision::Undecided,
                cancel_requested: false,
                hangup_requested: false,
                reject_cause: None,
                failure: None,
                answered_at: None,
            }),
            said_bye: AtomicBool::new(false),
            accepted: OutcomeCell::new(),
            decision: OutcomeCell::new(),
            terminated: OutcomeCell::new(),
            reinvite: Mutex::new(None),
            reinvite_seq: AtomicU64::new(0),
            stats: Mutex::new(SessionStats::default()),
            events,
            dtmf,
            tasks: CancellationToken::new(),
        });

        info!(
            call_id = %inner.id,
            ?direction,
            remote = %inner.remote_identity.phone_number,
            "Session created"
        );

        tokio::spawn(run_event_pump(inner.clone(), engine_events));
        tokio::spawn(run_dtmf_sender(
            inner.id.clone(),
            inner.handle.clone(),
            dtmf_rx,
            inner.tasks.clone(),
        ));

        if direction == SessionDirection::Outgoing {
            let attach = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = attach.media.attach().await {
                    warn!(call_id = %attach.id, error = %e, "Failed to bind media");
                }
            });
        }

        Ok((Session { inner }, receiver))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn direction(&self) -> SessionDirection {
        self.inner.direction
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.direction == SessionDirection::Incoming
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().phase.status()
    }

    pub fn remote_identity(&self) -> &RemoteIdentity {
        &self.inner.remote_identity
    }

    /// True once the far end has sent BYE
    pub fn said_bye(&self) -> bool {
        self.inner.said_bye.load(Ordering::SeqCst)
    }

    /// The INVITE asked to be answered immediately
    pub fn auto_answer(&self) -> bool {
        self.inner.auto_answer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().answered_at
    }

    pub fn media(&self) -> &SessionMedia {
        &self.inner.media
    }

    pub fn stats(&self) -> QualitySnapshot {
        self.inner.stats.lock().snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Settles once with the accept/reject outcome
    pub async fn accepted(&self) -> AcceptOutcome {
        self.inner.accepted.wait().await
    }

    /// Settles once when the dialog ends, whatever the cause
    pub async fn terminated(&self) -> TerminationOutcome {
        self.inner.terminated.wait().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.get().is_some()
    }

    /// Answer an inbound call
    ///
    /// Calling it again returns the first call's result without touching the
    /// engine. Fails with `InvalidOperation` after a reject.
    pub async fn accept(&self, options: AcceptOptions) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.direction != SessionDirection::Incoming {
            return Err(ClientError::invalid_operation("only incoming sessions can be accepted"));
        }

        let in_flight = {
            let mut state = inner.state.lock();
            match state.decision {
                Decision::Rejecting => {
                    return Err(ClientError::invalid_operation("session was already rejected"));
                }
                Decision::Accepting => true,
                Decision::Undecided => {
                    if state.phase != Phase::AwaitingDecision {
                        return Err(ClientError::invalid_operation(format!(
                            "cannot accept a session that is {}",
                            state.phase
                        )));
                    }
                    state.decision = Decision::Accepting;
                    false
                }
            }
        };
        if in_flight {
            debug!(call_id = %inner.id, "Accept already issued, returning its outcome");
            return inner.decision.wait().await;
        }

        for (direction, settings) in [(AudioDirection::Input, options.input), (AudioDirection::Output, options.output)] {
            if let Some(settings) = settings {
                if let Err(e) = inner.media.preset(direction, settings) {
                    warn!(call_id = %inner.id, ?direction, error = %e, "Ignoring invalid device settings");
                }
            }
        }
        if let Err(e) = inner.media.attach().await {
            warn!(call_id = %inner.id, error = %e, "Failed to bind media");
        }

        info!(call_id = %inner.id, "Accepting session");
        let result = inner.handle.accept().await;
        match &result {
            Ok(()) => inner.mark_active(),
            Err(e) => {
                warn!(call_id = %inner.id, error = %e, "Accept failed");
                inner.state.lock().failure.get_or_insert_with(|| e.to_string());
                inner.accepted.resolve(AcceptOutcome::rejected(RejectCause::Failed { reason: e.to_string() }));
            }
        }
        inner.decision.resolve(result);
        inner.decision.wait().await
    }

    /// Decline an inbound call
    ///
    /// Fails with `InvalidOperation` after an accept. Repeated calls return
    /// the first call's result.
    pub async fn reject(&self, options: RejectOptions) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.direction != SessionDirection::Incoming {
            return Err(ClientError::invalid_operation("outgoing sessions are cancelled, not rejected"));
        }

        let in_flight = {
            let mut state = inner.state.lock();
            match state.decision {
                Decision::Accepting => {
                    return Err(ClientError::invalid_operation("session was already accepted"));
                }
                Decision::Rejecting => true,
                Decision::Undecided => {
                    if state.phase != Phase::AwaitingDecision {
                        return Err(ClientError::invalid_operation(format!(
                            "cannot reject a session that is {}",
                            state.phase
                        )));
                    }
                    state.decision = Decision::Rejecting;
                    false
                }
            }
        };
        if in_flight {
            return inner.decision.wait().await;
        }

        let result = inner.send_reject(&options).await;
        inner.decision.resolve(result);
        inner.decision.wait().await
    }

    /// Withdraw an outbound call that has not been answered
    pub async fn cancel(&self) -> ClientResult<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if inner.direction != SessionDirection::Outgoing {
                return Err(ClientError::invalid_operation("only outgoing sessions can be cancelled"));
            }
            if state.phase != Phase::Ringing {
                return Err(ClientError::invalid_operation(format!(
                    "cannot cancel a session that is {}",
                    state.phase
                )));
            }
            if state.cancel_requested {
                return Ok(());
            }
            state.cancel_requested = true;
        }

        info!(call_id = %inner.id, "Cancelling session");
        inner.handle.cancel().await
    }

    pub async fn hold(&self) -> ClientResult<bool> {
        self.renegotiate("hold", true, false).await
    }

    pub async fn unhold(&self) -> ClientResult<bool> {
        self.renegotiate("unhold", false, false).await
    }

    /// Renegotiate media with an ICE restart after the transport recovered
    pub async fn revive(&self) -> ClientResult<bool> {
        let hold = self.inner.state.lock().phase == Phase::OnHold;
        self.renegotiate("revive", hold, true).await
    }

    async fn renegotiate(&self, operation: &'static str, hold: bool, ice_restart: bool) -> ClientResult<bool> {
        let inner = &self.inner;
        {
            let state = inner.state.lock();
            if !state.phase.is_established() {
                return Err(ClientError::invalid_operation(format!(
                    "cannot {} a session that is {}",
                    operation, state.phase
                )));
            }
        }

        let seq = inner.reinvite_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        let previous = inner.reinvite.lock().replace(PendingReinvite {
            seq,
            operation,
            hold,
            tx,
        });
        if let Some(previous) = previous {
            debug!(call_id = %inner.id, superseded = previous.operation, by = operation, "Renegotiation superseded");
            let _ = previous.tx.send(Err(ClientError::Superseded {
                operation: previous.operation.to_string(),
            }));
        }

        debug!(call_id = %inner.id, operation, hold, ice_restart, "Sending reinvite");
        if let Err(e) = inner.handle.reinvite(Reinvite { hold, ice_restart }).await {
            let mut pending = inner.reinvite.lock();
            if pending.as_ref().is_some_and(|p| p.seq == seq) {
                pending.take();
            }
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::session_failed(operation, "renegotiation dropped")),
        }
    }

    /// Hang up in whatever way fits the current state
    ///
    /// Established calls get BYE, unanswered outbound calls CANCEL and
    /// undecided inbound calls a reject. Idempotent; always returns the
    /// [`Session::terminated`] outcome.
    pub async fn terminate(&self, options: TerminateOptions) -> TerminationOutcome {
        let inner = &self.inner;
        let action = {
            let mut state = inner.state.lock();
            if state.hangup_requested {
                None
            } else {
                state.hangup_requested = true;
                match (state.phase, state.decision) {
                    (Phase::Active | Phase::OnHold, _) => Some(Hangup::Bye),
                    (Phase::Ringing, _) => {
                        state.cancel_requested = true;
                        Some(Hangup::Cancel)
                    }
                    (Phase::AwaitingDecision, Decision::Accepting) => Some(Hangup::ByeAfterAccept),
                    (Phase::AwaitingDecision, Decision::Undecided) => {
                        state.decision = Decision::Rejecting;
                        Some(Hangup::Reject)
                    }
                    _ => None,
                }
            }
        };

        if let Some(action) = action {
            info!(call_id = %inner.id, ?action, "Terminating session");
            let result = match action {
                Hangup::Bye => inner.handle.bye().await,
                Hangup::ByeAfterAccept => match inner.decision.wait().await {
                    Ok(()) => inner.handle.bye().await,
                    Err(e) => Err(e),
                },
                Hangup::Cancel => inner.handle.cancel().await,
                Hangup::Reject => {
                    let result = inner.send_reject(&options.reject).await;
                    inner.decision.resolve(result.clone());
                    result
                }
            };
            if let Err(e) = result {
                warn!(call_id = %inner.id, ?action, error = %e, "Hangup failed, ending session locally");
                inner.on_terminated(Some(e.to_string()));
            }
        }

        self.terminated().await
    }

    /// Queue a DTMF digit. Delivery is not tracked.
    pub fn dtmf(&self, key: char) -> ClientResult<()> {
        let key = key.to_ascii_uppercase();
        if !matches!(key, '0'..='9' | '*' | '#' | 'A'..='D') {
            return Err(ClientError::invalid_operation(format!("'{}' is not a DTMF key", key)));
        }
        {
            let state = self.inner.state.lock();
            if !state.phase.is_established() {
                return Err(ClientError::invalid_operation(format!(
                    "cannot send DTMF on a session that is {}",
                    state.phase
                )));
            }
        }
        self.inner
            .dtmf
            .send(key)
            .map_err(|_| ClientError::session_failed("dtmf", "session closed"))
    }

    /// REFER the far end to `target` (a number or a SIP URI)
    pub async fn blind_transfer(&self, target: &str) -> ClientResult<()> {
        self.ensure_established("transfer")?;
        let uri = make_uri(target, &self.inner.domain);
        info!(call_id = %self.inner.id, target = %uri, "Blind transfer");
        self.inner.handle.refer(ReferTarget::Uri(uri)).await
    }

    /// REFER the far end to the party on `target`, replacing that dialog
    pub async fn attended_transfer(&self, target: &Session) -> ClientResult<()> {
        if target.id() == self.id() {
            return Err(ClientError::invalid_operation("cannot transfer a session to itself"));
        }
        self.ensure_established("transfer")?;
        target.ensure_established("be the target of a transfer")?;

        info!(call_id = %self.inner.id, target = %target.id(), "Attended transfer");
        self.inner
            .handle
            .refer(ReferTarget::Session(target.inner.handle.clone()))
            .await
    }

    fn ensure_established(&self, operation: &str) -> ClientResult<()> {
        let state = self.inner.state.lock();
        if state.phase.is_established() {
            Ok(())
        } else {
            Err(ClientError::invalid_operation(format!(
                "session {} cannot {} while {}",
                self.inner.id, operation, state.phase
            )))
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("status", &self.status())
            .field("remote", &self.inner.remote_identity.phone_number)
            .finish()
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    async fn send_reject(&self, options: &RejectOptions) -> ClientResult<()> {
        info!(call_id = %self.id, status_code = options.status_code, "Rejecting session");
        let cause = RejectCause::Rejected {
            status_code: options.status_code,
            reason: options.reason.clone(),
        };
        // recorded up front: the engine may report termination before reject() returns
        self.state.lock().reject_cause.get_or_insert_with(|| cause.clone());

        let result = self.handle.reject(options.status_code, &options.reason).await;
        match &result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    if state.phase == Phase::AwaitingDecision {
                        state.phase = Phase::Rejected;
                    }
                }
                self.accepted.resolve(AcceptOutcome::rejected(cause));
            }
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "Reject failed");
                let mut state = self.state.lock();
                if state.reject_cause.as_ref() == Some(&cause) {
                    state.reject_cause = None;
                }
            }
        }
        result
    }

    /// Returns true when the pump should stop
    fn handle_event(self: &Arc<Self>, event: SessionHandleEvent) -> bool {
        trace!(call_id = %self.id, ?event, "Session event");
        match event {
            SessionHandleEvent::Accepted => self.mark_active(),
            SessionHandleEvent::Rejected { status_code, reason } => {
                let cause = {
                    let mut state = self.state.lock();
                    if !matches!(state.phase, Phase::Ringing | Phase::AwaitingDecision) {
                        return false;
                    }
                    let cause = if state.cancel_requested {
                        state.phase = Phase::Cancelled;
                        RejectCause::Cancelled
                    } else {
                        state.phase = Phase::Rejected;
                        RejectCause::Rejected { status_code, reason }
                    };
                    state.reject_cause.get_or_insert_with(|| cause.clone());
                    cause
                };
                info!(call_id = %self.id, ?cause, "Session not accepted");
                self.accepted.resolve(AcceptOutcome::rejected(cause));
            }
            SessionHandleEvent::Failed { reason } => {
                warn!(call_id = %self.id, %reason, "Session failed");
                let unanswered = {
                    let mut state = self.state.lock();
                    state.failure.get_or_insert_with(|| reason.clone());
                    matches!(state.phase, Phase::Ringing | Phase::AwaitingDecision)
                };
                if unanswered {
                    self.accepted.resolve(AcceptOutcome::rejected(RejectCause::Failed { reason }));
                }
            }
            SessionHandleEvent::Bye => {
                if !self.said_bye.swap(true, Ordering::SeqCst) {
                    info!(call_id = %self.id, "Remote party hung up");
                }
            }
            SessionHandleEvent::ReinviteAccepted => self.finish_reinvite(Ok(())),
            SessionHandleEvent::ReinviteFailed { reason } => self.finish_reinvite(Err(reason)),
            SessionHandleEvent::Terminated => {
                self.on_terminated(None);
                return true;
            }
        }
        false
    }

    fn mark_active(self: &Arc<Self>) {
        let hang_up = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Ringing | Phase::AwaitingDecision) {
                return;
            }
            state.phase = Phase::Active;
            state.answered_at = Some(Utc::now());
            self.emit(SessionEvent::StatusUpdate {
                session_id: self.id.clone(),
                status: SessionStatus::Active,
            });
            // the answer crossed our CANCEL or hangup
            state.cancel_requested || state.hangup_requested
        };

        info!(call_id = %self.id, "Session active");
        self.accepted.resolve(AcceptOutcome::accepted());
        self.spawn_quality_sampler();

        if hang_up {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.handle.bye().await {
                    warn!(call_id = %inner.id, error = %e, "BYE after crossed answer failed");
                    inner.on_terminated(Some(e.to_string()));
                }
            });
        }
    }

    fn finish_reinvite(&self, result: Result<(), String>) {
        let Some(pending) = self.reinvite.lock().take() else {
            debug!(call_id = %self.id, "Reinvite outcome with nothing pending");
            return;
        };

        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    if state.phase.is_established() {
                        let next = if pending.hold { Phase::OnHold } else { Phase::Active };
                        if next != state.phase {
                            state.phase = next;
                            self.emit(SessionEvent::StatusUpdate {
                                session_id: self.id.clone(),
                                status: next.status(),
                            });
                        }
                    }
                }
                let _ = pending.tx.send(Ok(true));
            }
            Err(reason) => {
                warn!(call_id = %self.id, operation = pending.operation, %reason, "Reinvite failed");
                let _ = pending.tx.send(Err(ClientError::session_failed(pending.operation, reason)));
            }
        }
    }

    /// Settle every outcome. Runs its body once, later calls return immediately.
    fn on_terminated(self: &Arc<Self>, failure: Option<String>) {
        let (outcome, reject_cause) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Terminated {
                return;
            }
            let previous = state.phase;
            state.phase = Phase::Terminated;

            if let Some(reason) = failure {
                state.failure.get_or_insert(reason);
            }

            let cause = match previous {
                Phase::Rejected => TerminationCause::Rejected,
                Phase::Cancelled => TerminationCause::Cancelled,
                Phase::Active | Phase::OnHold => {
                    if state.hangup_requested {
                        TerminationCause::LocalHangup
                    } else if self.said_bye.load(Ordering::SeqCst) {
                        TerminationCause::RemoteBye
                    } else if let Some(reason) = &state.failure {
                        TerminationCause::Failed { reason: reason.clone() }
                    } else {
                        TerminationCause::Ended
                    }
                }
                Phase::Ringing | Phase::AwaitingDecision => {
                    if let Some(reason) = &state.failure {
                        TerminationCause::Failed { reason: reason.clone() }
                    } else if state.cancel_requested {
                        TerminationCause::Cancelled
                    } else if state.decision == Decision::Rejecting {
                        TerminationCause::Rejected
                    } else if self.direction == SessionDirection::Incoming {
                        // the caller gave up before we decided
                        TerminationCause::Cancelled
                    } else {
                        TerminationCause::Ended
                    }
                }
                Phase::Terminated => TerminationCause::Ended,
            };

            let reject_cause = match &cause {
                TerminationCause::Cancelled => RejectCause::Cancelled,
                TerminationCause::Failed { reason } => RejectCause::Failed { reason: reason.clone() },
                TerminationCause::Rejected => state.reject_cause.clone().unwrap_or(RejectCause::Terminated),
                _ => RejectCause::Terminated,
            };

            let outcome = TerminationOutcome {
                cause,
                said_bye: self.said_bye.load(Ordering::SeqCst),
                answered_at: state.answered_at,
                ended_at: Utc::now(),
            };
            (outcome, reject_cause)
        };

        info!(call_id = %self.id, cause = ?outcome.cause, "Session terminated");

        self.accepted.resolve(AcceptOutcome::rejected(reject_cause));
        self.decision
            .resolve(Err(ClientError::session_failed("accept", "session terminated")));
        if let Some(pending) = self.reinvite.lock().take() {
            let _ = pending
                .tx
                .send(Err(ClientError::session_failed(pending.operation, "session terminated")));
        }
        self.terminated.resolve(outcome.clone());
        self.tasks.cancel();

        self.emit(SessionEvent::StatusUpdate {
            session_id: self.id.clone(),
            status: SessionStatus::Terminated,
        });
        self.emit(SessionEvent::Terminated {
            session_id: self.id.clone(),
            outcome,
        });

        let inner = self.clone();
        tokio::spawn(async move { inner.media.release().await });
    }

    fn spawn_quality_sampler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.tasks.clone();
        let period = self.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.sample_quality().await;
            }
        });
    }

    async fn sample_quality(&self) {
        let Some(measurement) = self.media.context().provider().measurement(&self.id).await else {
            return;
        };
        let (mos, snapshot) = {
            let mut stats = self.stats.lock();
            let mos = stats.record(measurement);
            (mos, stats.snapshot())
        };
        trace!(call_id = %self.id, mos, "Call quality sample");
        self.emit(SessionEvent::QualityUpdate {
            session_id: self.id.clone(),
            stats: snapshot,
        });
    }
}

async fn run_event_pump(inner: Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<SessionHandleEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.tasks.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(event) => {
                if inner.handle_event(event) {
                    break;
                }
            }
            None => {
                debug!(call_id = %inner.id, "Engine event stream ended");
                inner.on_terminated(None);
                break;
            }
        }
    }
}

/// Sends queued digits one at a time so they keep their order
async fn run_dtmf_sender(
    call_id: String,
    handle: Arc<dyn SessionHandle>,
    mut keys: mpsc::UnboundedReceiver<char>,
    token: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = token.cancelled() => break,
            key = keys.recv() => key,
        };
        let Some(key) = key else { break };
        if let Err(e) = handle.dtmf(key).await {
            warn!(call_id = %call_id, %key, error = %e, "DTMF failed");
        }
    }
}
