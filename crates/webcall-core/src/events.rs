//! Client events
//!
//! Everything the application observes flows through one broadcast channel of
//! [`ClientEvent`]s: connection status, the session registry, presence and
//! call quality.
//!
//! ```rust,no_run
//! # async fn example(client: webcall_core::Client) {
//! use webcall_core::events::{ClientEvent, EventFilter, EventPriority};
//!
//! let filter = EventFilter {
//!     min_priority: Some(EventPriority::Normal),
//!     ..Default::default()
//! };
//! let mut events = client.event_iterator();
//! while let Some(event) = events.next().await {
//!     if !event.passes_filter(&filter) {
//!         continue;
//!     }
//!     match event {
//!         ClientEvent::StatusUpdate { status, .. } => println!("status: {}", status),
//!         ClientEvent::Invite { session } => println!("call from {}", session.remote_identity().phone_number),
//!         _ => {}
//!     }
//! }
//! # }
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::session::{Session, SessionStatus, TerminationOutcome};
use crate::stats::QualitySnapshot;
use crate::subscription::PresenceStatus;
use crate::transport::ClientStatus;

const EVENT_CAPACITY: usize = 256;

/// Event priority levels for filtering
///
/// ```rust
/// use webcall_core::events::EventPriority;
///
/// assert!(EventPriority::High > EventPriority::Normal);
/// assert!(EventPriority::Normal > EventPriority::Low);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    /// Quality samples
    Low,
    /// Session and presence updates
    Normal,
    /// Inbound calls and connection status
    High,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport status changed
    StatusUpdate {
        status: ClientStatus,
        timestamp: DateTime<Utc>,
    },
    /// A session entered the registry
    SessionAdded { session: Session },
    /// A session left the registry after it terminated
    SessionRemoved {
        session_id: String,
        outcome: TerminationOutcome,
    },
    /// A registered session changed status
    SessionUpdate {
        session_id: String,
        status: SessionStatus,
    },
    /// New presence for a subscribed contact
    SubscriptionNotify { uri: String, status: PresenceStatus },
    /// Inbound call waiting for accept or reject
    Invite { session: Session },
    CallQualityUpdate {
        session_id: String,
        stats: QualitySnapshot,
    },
}

impl ClientEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            ClientEvent::StatusUpdate { .. } | ClientEvent::Invite { .. } => EventPriority::High,
            ClientEvent::SessionAdded { .. }
            | ClientEvent::SessionRemoved { .. }
            | ClientEvent::SessionUpdate { .. }
            | ClientEvent::SubscriptionNotify { .. } => EventPriority::Normal,
            ClientEvent::CallQualityUpdate { .. } => EventPriority::Low,
        }
    }

    /// Session the event is about, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientEvent::SessionAdded { session } | ClientEvent::Invite { session } => Some(session.id()),
            ClientEvent::SessionRemoved { session_id, .. }
            | ClientEvent::SessionUpdate { session_id, .. }
            | ClientEvent::CallQualityUpdate { session_id, .. } => Some(session_id),
            ClientEvent::StatusUpdate { .. } | ClientEvent::SubscriptionNotify { .. } => None,
        }
    }

    pub fn passes_filter(&self, filter: &EventFilter) -> bool {
        if let Some(min_priority) = filter.min_priority {
            if self.priority() < min_priority {
                return false;
            }
        }

        if let Some(session_ids) = &filter.session_ids {
            match self.session_id() {
                Some(id) if session_ids.contains(id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Criteria for [`ClientEvent::passes_filter`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events about these sessions (None = all)
    pub session_ids: Option<HashSet<String>>,
    /// Minimum priority (None = all)
    pub min_priority: Option<EventPriority>,
}

pub type EventStream = BroadcastStream<ClientEvent>;

/// Pull-style reader over the event stream
pub struct EventIterator {
    stream: EventStream,
}

impl EventIterator {
    pub fn new(stream: EventStream) -> Self {
        Self { stream }
    }

    /// Next event; `None` once the client is gone. Skips over lag.
    pub async fn next(&mut self) -> Option<ClientEvent> {
        loop {
            match self.stream.next().await? {
                Ok(event) => return Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event consumer lagged, events dropped");
                }
            }
        }
    }
}

/// Fan-out point for client events
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: ClientEvent) {
        // nobody listening is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn iterator(&self) -> EventIterator {
        EventIterator::new(self.stream())
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
