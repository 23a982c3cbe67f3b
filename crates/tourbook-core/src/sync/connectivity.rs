//! Network reachability hint

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline signal with change notification
///
/// This is a hint only: the engine still handles request failures while it
/// reports online.
#[derive(Debug, Clone)]
pub struct Connectivity {
    sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record the platform's reachability; returns whether the value changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_online_reports_transitions_only() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());
        assert!(connectivity.set_online(true));
        assert!(!connectivity.set_online(true));
        assert!(connectivity.is_online());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_changes() {
        let connectivity = Connectivity::new(false);
        let mut receiver = connectivity.subscribe();
        let handle = connectivity.clone();
        handle.set_online(true);

        receiver.changed().await.unwrap();
        assert!(*receiver.borrow_and_update());
    }
}
