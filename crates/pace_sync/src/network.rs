//! Connectivity monitoring

use tokio::sync::watch;

/// Observes platform connectivity transitions
///
/// The platform notifier feeds `set_online`; interested components watch the
/// channel for transitions and read `is_online` for the current state.
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initial_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initial_online);
        Self { tx }
    }

    /// Entry point for the platform's network-state notification
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if *state != online {
                *state = online;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch for transitions; receivers see only actual changes
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        // Treat connectivity as unknown-offline until the platform reports
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observed() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.watch();

        assert!(!monitor.is_online());
        monitor.set_online(true);

        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_redundant_updates_do_not_notify() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.watch();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(false);
        assert!(rx.has_changed().unwrap());
    }
}
