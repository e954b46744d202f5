//! Connectivity and battery signals.
//!
//! [`Connectivity`] is the single source of truth for "are we online" inside
//! the core. Hosts feed it from whatever the platform reports; the optional
//! [`ConnectivityProbe`] derives it from periodic health checks instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chapel_types::{BatteryInfo, ConnectionType, NetworkSnapshot};

use crate::transport::{HttpRequest, Transport};

/// Shared, observable network state.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<NetworkSnapshot>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let initial = if online {
            NetworkSnapshot::online()
        } else {
            NetworkSnapshot::offline()
        };
        Self::from_snapshot(initial)
    }

    pub fn from_snapshot(snapshot: NetworkSnapshot) -> Self {
        let (tx, _rx) = watch::channel(snapshot);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Update the online flag. Subscribers are only woken on a change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|s| {
            if s.online == online {
                false
            } else {
                s.online = online;
                true
            }
        });
        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        self.tx.send_if_modified(|s| {
            let changed = s.connection_type != connection_type;
            s.connection_type = connection_type;
            changed
        });
    }

    /// Update battery information. `None` means the host cannot report it.
    pub fn set_battery(&self, battery: Option<BatteryInfo>) {
        self.tx.send_if_modified(|s| {
            let changed = s.battery != battery;
            s.battery = battery;
            changed
        });
    }

    /// Watch for changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkSnapshot> {
        self.tx.subscribe()
    }
}

/// Derives online state from periodic requests to a health endpoint.
///
/// Any HTTP answer counts as online; only a transport failure counts as
/// offline.
pub struct ConnectivityProbe {
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    health_path: String,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        health_path: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            connectivity,
            health_path: health_path.into(),
            interval,
        }
    }

    /// Probe once and publish the result.
    pub async fn probe_once(&self) -> bool {
        let online = match self
            .transport
            .send(HttpRequest::get(self.health_path.as_str()))
            .await
        {
            Ok(resp) => {
                debug!("Health probe answered {}", resp.status);
                true
            }
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        };
        self.connectivity.set_online(online);
        online
    }

    /// Probe on an interval until `cancel_token` fires.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Connectivity probe cancelled, shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[tokio::test]
    async fn test_set_online_notifies_on_change_only() {
        let conn = Connectivity::new(false);
        let mut rx = conn.subscribe();
        rx.borrow_and_update();

        conn.set_online(false);
        assert!(!rx.has_changed().unwrap());

        conn.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().online);
        assert!(conn.is_online());
    }

    #[test]
    fn test_battery_and_link() {
        let conn = Connectivity::default();
        conn.set_battery(Some(BatteryInfo::new(15, false)));
        conn.set_connection_type(ConnectionType::Cellular);

        let snap = conn.snapshot();
        assert_eq!(snap.battery.map(|b| b.level), Some(15));
        assert_eq!(snap.connection_type, ConnectionType::Cellular);
    }

    #[tokio::test]
    async fn test_probe_follows_transport() {
        let mock = Arc::new(MockTransport::new());
        let conn = Connectivity::new(true);
        let probe = ConnectivityProbe::new(
            mock.clone(),
            conn.clone(),
            "/api/health",
            Duration::from_secs(30),
        );

        mock.set_offline(true);
        assert!(!probe.probe_once().await);
        assert!(!conn.is_online());

        // A 404 is still an answer.
        mock.set_offline(false);
        assert!(probe.probe_once().await);
        assert!(conn.is_online());
    }
}
