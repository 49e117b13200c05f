//! Gateway-side UDP discovery
//!
//! Collects agent announcements from UDP port 9999 into a time-indexed
//! table keyed by `(host, port)`. Entries not refreshed within
//! `BACKEND_TIMEOUT` are expired and never dialed again until
//! re-announced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::protocol::discovery::{Announcement, DISCOVERY_PORT};

pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(15);

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct Entry {
    service_name: String,
    last_seen: Instant,
}

/// Live table of announced agents.
pub struct DiscoveryTable {
    entries: Mutex<HashMap<AgentAddr, Entry>>,
    timeout: Duration,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self::with_timeout(BACKEND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        DiscoveryTable {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn upsert_at(&self, host: &str, port: u16, service_name: &str, now: Instant) {
        let addr = AgentAddr {
            host: host.to_string(),
            port,
        };
        let mut entries = self.entries.lock();
        match entries.get_mut(&addr) {
            Some(entry) => entry.last_seen = now,
            None => {
                info!(host, port, name = service_name, "new agent discovered");
                entries.insert(
                    addr,
                    Entry {
                        service_name: service_name.to_string(),
                        last_seen: now,
                    },
                );
            }
        }
    }

    pub fn expire_at(&self, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|addr, entry| {
            let alive = now.duration_since(entry.last_seen) <= self.timeout;
            if !alive {
                info!(
                    host = %addr.host,
                    port = addr.port,
                    name = %entry.service_name,
                    "agent announcement expired"
                );
            }
            alive
        });
    }

    pub fn contains_at(&self, host: &str, port: u16, now: Instant) -> bool {
        let addr = AgentAddr {
            host: host.to_string(),
            port,
        };
        self.entries
            .lock()
            .get(&addr)
            .map_or(false, |e| now.duration_since(e.last_seen) <= self.timeout)
    }

    /// Current live agent addresses; the backend manager dials these.
    pub fn snapshot(&self) -> Vec<AgentAddr> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for DiscoveryTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for announcements until the task is aborted. Accepts both
/// deployed magics; the sender IP is used whenever the packet does not
/// advertise a hostname.
pub async fn run_listener(table: Arc<DiscoveryTable>) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    info!(port = DISCOVERY_PORT, "discovery listening for agent announcements");

    let mut buf = [0u8; 512];
    let mut sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "discovery recv error");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                let announcement = match Announcement::decode(&buf[..len]) {
                    Ok(a) => a,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "ignoring non-discovery datagram");
                        continue;
                    }
                };

                let host = if announcement.advertised_host.is_empty() {
                    peer.ip().to_string()
                } else {
                    announcement.advertised_host.clone()
                };

                debug!(
                    host = %host,
                    port = announcement.service_port,
                    name = %announcement.service_name,
                    "announcement received"
                );
                table.upsert_at(
                    &host,
                    announcement.service_port,
                    &announcement.service_name,
                    Instant::now(),
                );
            }
            _ = sweep.tick() => {
                table.expire_at(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let table = DiscoveryTable::new();
        let t0 = Instant::now();

        table.upsert_at("10.0.0.5", 9090, "Universal Agent", t0);

        let t14 = t0 + Duration::from_secs(14);
        table.expire_at(t14);
        assert!(table.contains_at("10.0.0.5", 9090, t14));

        let t15_1 = t0 + Duration::from_millis(15_100);
        table.expire_at(t15_1);
        assert!(!table.contains_at("10.0.0.5", 9090, t15_1));
        assert!(table.is_empty(), "expired entries are never dialed");
    }

    #[test]
    fn test_reannounce_refreshes() {
        let table = DiscoveryTable::new();
        let t0 = Instant::now();

        table.upsert_at("h", 9090, "a", t0);
        table.upsert_at("h", 9090, "a", t0 + Duration::from_secs(10));

        table.expire_at(t0 + Duration::from_secs(20));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_distinct_ports_are_distinct_agents() {
        let table = DiscoveryTable::new();
        let t0 = Instant::now();
        table.upsert_at("h", 9090, "a", t0);
        table.upsert_at("h", 9092, "b", t0);
        assert_eq!(table.len(), 2);
    }
}
