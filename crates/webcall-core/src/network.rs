//! Online/offline signal
//!
//! The host application feeds connectivity changes (OS notifications, a
//! browser's online/offline events) into a [`NetworkMonitor`]. The transport
//! watches it to detect network loss and to know when to start recovering.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cloneable handle over one shared online flag
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state: Arc::new(state) }
    }

    /// Report connectivity; repeated values are ignored
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
