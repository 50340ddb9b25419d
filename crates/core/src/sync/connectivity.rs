//! Online/offline tracking
//!
//! The host pushes network state into a [`ConnectivityMonitor`]; consumers
//! hold a `watch::Receiver` and react to transitions.

use tokio::sync::watch;
use tillsync_domain::NetworkInfo;

/// Edge detected by a connectivity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<NetworkInfo>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkInfo) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Start offline until the host reports otherwise.
    pub fn offline() -> Self {
        Self::new(NetworkInfo::offline())
    }

    pub fn current(&self) -> NetworkInfo {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkInfo> {
        self.tx.subscribe()
    }

    /// Flip only the online flag, keeping the rest of the network context.
    pub fn set_online(&self, online: bool) -> Option<Transition> {
        let mut next = self.current();
        next.online = online;
        self.set_network(next)
    }

    /// Publish a new network state. Subscribers are only woken when
    /// something changed; the online edge, if any, is returned.
    pub fn set_network(&self, info: NetworkInfo) -> Option<Transition> {
        let mut transition = None;
        self.tx.send_if_modified(|current| {
            if *current == info {
                return false;
            }
            transition = match (current.online, info.online) {
                (false, true) => Some(Transition::CameOnline),
                (true, false) => Some(Transition::WentOffline),
                _ => None,
            };
            *current = info;
            true
        });

        if let Some(edge) = transition {
            tracing::info!(?edge, "connectivity changed");
        }
        transition
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::offline()
    }
}
