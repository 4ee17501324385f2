//! Application context shared by the store, supervisor and front ends
//!
//! Owns the resolved configuration and the notification bus. One context
//! is built at startup and cloned into whatever needs it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ManagerConfig;
use crate::profile::ProfileStore;
use crate::supervisor::Supervisor;

/// Capacity of the notification bus
const NOTIFY_CAPACITY: usize = 64;

/// Events published to every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// Liveness check after launch succeeded
    Started { name: String, interface: String },
    /// Liveness check after launch failed; state was cleaned up
    StartFailed { name: String, reason: String },
    Stopped { name: String },
    ProfileSaved { name: String },
    ProfileDeleted { name: String },
}

impl Notification {
    /// Short title suitable for a desktop notification
    pub fn title(&self) -> &'static str {
        match self {
            Self::Started { .. } => "connection successful",
            Self::StartFailed { .. } => "connection failed",
            Self::Stopped { .. } => "connection stopped",
            Self::ProfileSaved { .. } => "info",
            Self::ProfileDeleted { .. } => "info",
        }
    }

    /// Human readable body
    pub fn message(&self) -> String {
        match self {
            Self::Started { name, interface } => {
                format!("Network '{}' started on interface '{}'", name, interface)
            }
            Self::StartFailed { name, reason } => {
                format!("failed starting VPN '{}': {}", name, reason)
            }
            Self::Stopped { name } => format!("Network '{}' stopped", name),
            Self::ProfileSaved { name } => format!("Profile '{}' saved", name),
            Self::ProfileDeleted { name } => format!("Profile '{}' deleted", name),
        }
    }
}

/// Explicit replacement for global state root and notifier
#[derive(Clone)]
pub struct ManagerContext {
    config: Arc<ManagerConfig>,
    notify_tx: broadcast::Sender<Notification>,
}

impl ManagerContext {
    pub fn new(config: ManagerConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            config: Arc::new(config),
            notify_tx,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribe to notifications published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Publish a notification; having no subscribers is not an error
    pub fn notify(&self, notification: Notification) {
        tracing::debug!("{}: {}", notification.title(), notification.message());
        let _ = self.notify_tx.send(notification);
    }

    pub fn store(&self) -> ProfileStore {
        ProfileStore::new(self.clone())
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_json_shape() {
        let n = Notification::Started {
            name: "office".to_string(),
            interface: "edgevpn0".to_string(),
        };
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("\"event\":\"started\""));
        assert!(json.contains("\"interface\":\"edgevpn0\""));
        assert_eq!(n.message(), "Network 'office' started on interface 'edgevpn0'");
    }

    #[tokio::test]
    async fn test_notify_reaches_subscriber() {
        let ctx = ManagerContext::new(ManagerConfig::with_state_dir("/tmp/unused"));
        let mut rx = ctx.subscribe();
        ctx.notify(Notification::Stopped {
            name: "office".to_string(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::Stopped {
                name: "office".to_string()
            }
        );
    }

    #[test]
    fn test_notify_without_subscribers() {
        let ctx = ManagerContext::new(ManagerConfig::with_state_dir("/tmp/unused"));
        ctx.notify(Notification::ProfileDeleted {
            name: "gone".to_string(),
        });
    }
}
