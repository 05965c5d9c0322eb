//! SIP engine boundary
//!
//! webcall-core does not parse SIP, run transactions or match dialogs. It
//! drives an engine through the narrow traits below and consumes the engine's
//! events from channels. An engine binding implements:
//!
//! - [`SipEngine`] - builds a [`UserAgent`] from [`UserAgentOptions`] and a
//!   delegate channel for agent-level events (inbound INVITEs, socket loss)
//! - [`UserAgent`] - start/stop, registerers, outbound INVITE, SUBSCRIBE, OPTIONS ping
//! - [`Registerer`] - one REGISTER lifecycle with a state stream
//! - [`SessionHandle`] - one INVITE dialog, inviter or invitation
//! - [`SubscriptionHandle`] - one dialog-event subscription
//!
//! Engine events for a single session or subscription must be delivered in
//! the order the engine produced them. The session and subscription state
//! machines rely on this.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::config::ClientConfig;
use crate::error::ClientResult;

/// Everything the engine needs to build a user agent
#[derive(Debug, Clone, PartialEq)]
pub struct UserAgentOptions {
    pub uri: String,
    pub auth_username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub contact_name: Option<String>,
    pub ws_servers: Vec<String>,
    pub ice_servers: Vec<String>,
    pub user_agent_string: String,
    pub register_expires_secs: u32,
    pub connection_timeout: Duration,
}

impl From<&ClientConfig> for UserAgentOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            uri: config.account.uri.clone(),
            auth_username: config.account.user.clone(),
            password: config.account.password.clone(),
            display_name: config.account.display_name.clone(),
            contact_name: config.account.contact_name.clone(),
            ws_servers: config.transport.ws_servers.clone(),
            ice_servers: config.transport.ice_servers.clone(),
            user_agent_string: config.transport.user_agent_string.clone(),
            register_expires_secs: config.transport.register_expires_secs,
            connection_timeout: config.ws_timeout(),
        }
    }
}

/// Agent-level events delivered on the delegate channel
pub enum UserAgentEvent {
    /// An INVITE arrived; the handle is an invitation awaiting a decision
    Invite(Arc<dyn SessionHandle>),
    /// The signalling socket closed underneath the agent
    TransportClosed { reason: Option<String> },
}

impl fmt::Debug for UserAgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAgentEvent::Invite(handle) => f.debug_tuple("Invite").field(&handle.call_id()).finish(),
            UserAgentEvent::TransportClosed { reason } => {
                f.debug_struct("TransportClosed").field("reason", reason).finish()
            }
        }
    }
}

/// Factory for user agents
pub trait SipEngine: Send + Sync {
    fn create_user_agent(
        &self,
        options: UserAgentOptions,
        delegate: mpsc::UnboundedSender<UserAgentEvent>,
    ) -> ClientResult<Arc<dyn UserAgent>>;
}

#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Open the signalling socket
    async fn start(&self) -> ClientResult<()>;

    /// Close the signalling socket and drop engine state
    async fn stop(&self) -> ClientResult<()>;

    /// A fresh registerer for one register or unregister cycle
    fn create_registerer(&self) -> Arc<dyn Registerer>;

    /// Send an INVITE to `target`
    async fn invite(&self, target: &str) -> ClientResult<Arc<dyn SessionHandle>>;

    /// Prepare a dialog-event subscription to `target`
    fn create_subscriber(&self, target: &str) -> ClientResult<Arc<dyn SubscriptionHandle>>;

    /// OPTIONS keepalive towards the registrar
    async fn ping(&self) -> ClientResult<()>;
}

/// Registerer lifecycle as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistererState {
    Initial,
    Registered,
    Unregistered,
    Terminated,
}

#[async_trait]
pub trait Registerer: Send + Sync {
    /// Send REGISTER. A final negative answer is `RegistrationFailed`.
    async fn register(&self) -> ClientResult<()>;

    /// Send REGISTER with `Expires: 0`
    async fn unregister(&self) -> ClientResult<()>;

    /// Fires exactly one terminal value (`Registered` or `Unregistered`) per cycle
    fn state(&self) -> watch::Receiver<RegistererState>;

    /// Detach from the engine's bookkeeping so it will not unregister on stop
    fn dispose(&self);
}

/// What the engine knows about the request that created a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialRequest {
    /// Bare From URI (or the target URI for outbound sessions)
    pub from_uri: String,
    pub headers: HashMap<String, String>,
}

/// Named one-shot events of an INVITE dialog
#[derive(Debug, Clone, PartialEq)]
pub enum SessionHandleEvent {
    Accepted,
    Rejected { status_code: u16, reason: String },
    Failed { reason: String },
    Bye,
    Terminated,
    ReinviteAccepted,
    ReinviteFailed { reason: String },
}

/// Media direction requested by a reinvite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reinvite {
    pub hold: bool,
    pub ice_restart: bool,
}

/// REFER destination
pub enum ReferTarget {
    Uri(String),
    /// Attended transfer: replace the dialog of this session
    Session(Arc<dyn SessionHandle>),
}

impl fmt::Debug for ReferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferTarget::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            ReferTarget::Session(handle) => f.debug_tuple("Session").field(&handle.call_id()).finish(),
        }
    }
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// SIP Call-ID of the dialog
    fn call_id(&self) -> String;

    fn request(&self) -> InitialRequest;

    /// Event stream for this dialog. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionHandleEvent>>;

    async fn accept(&self) -> ClientResult<()>;

    async fn reject(&self, status_code: u16, reason: &str) -> ClientResult<()>;

    async fn cancel(&self) -> ClientResult<()>;

    async fn bye(&self) -> ClientResult<()>;

    /// Send a re-INVITE. The outcome arrives as `ReinviteAccepted` / `ReinviteFailed`.
    async fn reinvite(&self, request: Reinvite) -> ClientResult<()>;

    async fn dtmf(&self, key: char) -> ClientResult<()>;

    async fn refer(&self, target: ReferTarget) -> ClientResult<()>;
}

/// Events of a dialog-event subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// NOTIFY body, `application/dialog-info+xml`
    Notify { body: String },
    Terminated,
}

#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    /// Event stream for this subscription. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>>;

    async fn subscribe(&self) -> ClientResult<()>;

    async fn unsubscribe(&self) -> ClientResult<()>;

    fn dispose(&self);
}
