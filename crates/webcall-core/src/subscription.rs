//! Presence through dialog-event subscriptions
//!
//! Each subscribed contact gets a `dialog` event package subscription. NOTIFY
//! bodies are `application/dialog-info+xml` documents; the `<state>` of the
//! contained dialogs is reduced to a [`PresenceStatus`]:
//!
//! | dialog state                   | presence    |
//! |--------------------------------|-------------|
//! | trying, proceeding, early      | `Ringing`   |
//! | confirmed                      | `Busy`      |
//! | terminated, or no dialog at all| `Available` |
//! | anything else                  | `Unknown`   |
//!
//! When several dialogs are listed, `Busy` wins over `Ringing`, which wins
//! over `Available`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{SubscriptionEvent, SubscriptionHandle};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventEmitter};
use crate::transport::ReconnectableTransport;
use crate::uri::normalize_uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Available,
    Ringing,
    Busy,
    Unknown,
}

impl PresenceStatus {
    fn from_dialog_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "trying" | "proceeding" | "early" => PresenceStatus::Ringing,
            "confirmed" => PresenceStatus::Busy,
            "terminated" => PresenceStatus::Available,
            _ => PresenceStatus::Unknown,
        }
    }

    fn rank(self) -> u8 {
        match self {
            PresenceStatus::Unknown => 0,
            PresenceStatus::Available => 1,
            PresenceStatus::Ringing => 2,
            PresenceStatus::Busy => 3,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceStatus::Available => "available",
            PresenceStatus::Ringing => "ringing",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DialogInfoError {
    #[error("malformed dialog-info XML: {0}")]
    Xml(String),
    #[error("document is not dialog-info")]
    NotDialogInfo,
}

/// Reduce a dialog-info document to a presence status
///
/// ```rust
/// use webcall_core::subscription::{parse_dialog_info, PresenceStatus};
///
/// let xml = r#"<?xml version="1.0"?>
/// <dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="sip:201@example.com">
///   <dialog id="abc" direction="recipient"><state>confirmed</state></dialog>
/// </dialog-info>"#;
/// assert_eq!(parse_dialog_info(xml).unwrap(), PresenceStatus::Busy);
/// ```
pub fn parse_dialog_info(xml: &str) -> Result<PresenceStatus, DialogInfoError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut seen_root = false;
    let mut in_dialog = false;
    let mut in_state = false;
    let mut dialogs = 0usize;
    let mut status: Option<PresenceStatus> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"dialog-info" => seen_root = true,
                b"dialog" if seen_root => {
                    in_dialog = true;
                    dialogs += 1;
                }
                b"state" if in_dialog => in_state = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"dialog-info" => seen_root = true,
                b"dialog" if seen_root => dialogs += 1,
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_state => {
                let text = e.unescape().map_err(|err| DialogInfoError::Xml(err.to_string()))?;
                let dialog_status = PresenceStatus::from_dialog_state(&text);
                status = Some(match status {
                    Some(current) if current.rank() >= dialog_status.rank() => current,
                    _ => dialog_status,
                });
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"state" => in_state = false,
                b"dialog" => in_dialog = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DialogInfoError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(DialogInfoError::NotDialogInfo);
    }
    if dialogs == 0 {
        return Ok(PresenceStatus::Available);
    }
    Ok(status.unwrap_or(PresenceStatus::Unknown))
}

struct ActiveSubscription {
    id: u64,
    handle: Arc<dyn SubscriptionHandle>,
    token: CancellationToken,
}

struct SubscriptionEntry {
    status: PresenceStatus,
    active: Option<ActiveSubscription>,
}

/// Registry of presence subscriptions keyed by normalised contact URI
pub struct SubscriptionManager {
    transport: ReconnectableTransport,
    entries: DashMap<String, SubscriptionEntry>,
    events: EventEmitter,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub(crate) fn new(transport: ReconnectableTransport, events: EventEmitter) -> Arc<Self> {
        Arc::new(Self {
            transport,
            entries: DashMap::new(),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    fn key(&self, uri: &str) -> String {
        normalize_uri(&self.transport.make_uri(uri))
    }

    /// Subscribe to the dialog state of `uri`; already subscribed contacts are left alone
    pub async fn subscribe(self: &Arc<Self>, uri: &str) -> ClientResult<()> {
        let key = self.key(uri);
        let subscribed = self.entries.get(&key).is_some_and(|entry| entry.active.is_some());
        if subscribed {
            debug!(uri = %key, "Already subscribed");
            return Ok(());
        }
        self.start(key).await
    }

    /// Replace the subscription of `uri` with a fresh one
    pub async fn resubscribe(self: &Arc<Self>, uri: &str) -> ClientResult<()> {
        let key = self.key(uri);
        self.start(key).await
    }

    /// Renew every subscription, typically after the transport recovered
    pub async fn resubscribe_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        info!(count = keys.len(), "Renewing presence subscriptions");
        for key in keys {
            if let Err(e) = self.start(key.clone()).await {
                warn!(uri = %key, error = %e, "Failed to renew subscription");
            }
        }
    }

    /// Forget `uri` and end its subscription in the background
    pub fn unsubscribe(&self, uri: &str) {
        let key = self.key(uri);
        let Some((_, entry)) = self.entries.remove(&key) else {
            debug!(uri = %key, "Not subscribed");
            return;
        };
        info!(uri = %key, "Unsubscribing");
        if let Some(active) = entry.active {
            end_subscription(key, active, true);
        }
    }

    pub fn status(&self, uri: &str) -> Option<PresenceStatus> {
        self.entries.get(&self.key(uri)).map(|entry| entry.status)
    }

    pub fn statuses(&self) -> HashMap<String, PresenceStatus> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.status))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    async fn start(self: &Arc<Self>, key: String) -> ClientResult<()> {
        let handle = self.transport.subscriber(&key)?;
        let events = handle
            .take_events()
            .ok_or_else(|| ClientError::internal(format!("event stream of subscription to {} already taken", key)))?;
        let token = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let replaced = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| SubscriptionEntry {
                status: PresenceStatus::Unknown,
                active: None,
            });
            entry.active.replace(ActiveSubscription {
                id,
                handle: handle.clone(),
                token: token.clone(),
            })
        };
        if let Some(previous) = replaced {
            end_subscription(key.clone(), previous, false);
        }

        tokio::spawn(run_subscription(Arc::downgrade(self), key.clone(), id, events, token.clone()));

        info!(uri = %key, "Subscribing to dialog events");
        if let Err(e) = handle.subscribe().await {
            warn!(uri = %key, error = %e, "Subscribe failed");
            token.cancel();
            handle.dispose();
            self.ended(&key, id);
            return Err(ClientError::SubscriptionFailed {
                uri: key,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    fn update(&self, key: &str, status: PresenceStatus) {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.status = status;
        drop(entry);

        debug!(uri = %key, %status, "Presence update");
        self.events.emit(ClientEvent::SubscriptionNotify {
            uri: key.to_string(),
            status,
        });
    }

    /// Forget the active subscription `id` unless it was already replaced
    fn ended(&self, key: &str, id: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            let current = entry.active.as_ref().is_some_and(|a| a.id == id);
            if current {
                entry.active = None;
            }
        }
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.entries.len())
            .finish()
    }
}

fn end_subscription(key: String, active: ActiveSubscription, unsubscribe: bool) {
    active.token.cancel();
    tokio::spawn(async move {
        if unsubscribe {
            if let Err(e) = active.handle.unsubscribe().await {
                debug!(uri = %key, error = %e, "Unsubscribe failed");
            }
        }
        active.handle.dispose();
    });
}

async fn run_subscription(
    manager: Weak<SubscriptionManager>,
    key: String,
    id: u64,
    mut events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(manager) = manager.upgrade() else { return };

        match event {
            Some(SubscriptionEvent::Notify { body }) => match parse_dialog_info(&body) {
                Ok(status) => manager.update(&key, status),
                Err(e) => warn!(uri = %key, error = %e, "Ignoring unparsable NOTIFY body"),
            },
            Some(SubscriptionEvent::Terminated) | None => {
                debug!(uri = %key, "Subscription ended by the engine");
                manager.ended(&key, id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(dialogs: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="3" state="full" entity="sip:201@example.com">{}</dialog-info>"#,
            dialogs
        )
    }

    #[test]
    fn test_state_mapping() {
        for (state, expected) in [
            ("trying", PresenceStatus::Ringing),
            ("proceeding", PresenceStatus::Ringing),
            ("early", PresenceStatus::Ringing),
            ("confirmed", PresenceStatus::Busy),
            ("terminated", PresenceStatus::Available),
            ("sleeping", PresenceStatus::Unknown),
        ] {
            let xml = document(&format!(r#"<dialog id="1"><state>{}</state></dialog>"#, state));
            assert_eq!(parse_dialog_info(&xml).unwrap(), expected, "state {}", state);
        }
    }

    #[test]
    fn test_no_dialog_means_available() {
        assert_eq!(parse_dialog_info(&document("")).unwrap(), PresenceStatus::Available);
        let empty = r#"<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="0" state="full"/>"#;
        assert_eq!(parse_dialog_info(empty).unwrap(), PresenceStatus::Available);
    }

    #[test]
    fn test_busy_wins_over_ringing() {
        let xml = document(
            r#"<dialog id="1"><state>early</state></dialog><dialog id="2"><state>confirmed</state></dialog>"#,
        );
        assert_eq!(parse_dialog_info(&xml).unwrap(), PresenceStatus::Busy);
    }

    #[test]
    fn test_prefixed_namespace() {
        let xml = r#"<d:dialog-info xmlns:d="urn:ietf:params:xml:ns:dialog-info"><d:dialog id="x"><d:state event="rejected">terminated</d:state></d:dialog></d:dialog-info>"#;
        assert_eq!(parse_dialog_info(xml).unwrap(), PresenceStatus::Available);
    }

    #[test]
    fn test_rejects_other_documents() {
        assert_eq!(
            parse_dialog_info("<presence><tuple/></presence>"),
            Err(DialogInfoError::NotDialogInfo)
        );
        assert!(matches!(
            parse_dialog_info("<dialog-info><dialog></state></dialog-info>"),
            Err(DialogInfoError::Xml(_))
        ));
    }
}
