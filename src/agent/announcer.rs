//! UDP presence announcer
//!
//! A dedicated thread broadcasts the discovery packet every interval to
//! the LAN broadcast address and to loopback (broadcast is blocked in
//! some container setups; the loopback copy reaches a co-hosted
//! gateway). The sleep is cancellation-aware so shutdown is prompt.

use std::net::UdpSocket;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancellationSource;
use crate::config::AgentConfig;
use crate::protocol::discovery::{Announcement, DISCOVERY_PORT};

pub struct Announcer {
    cancel: CancellationSource,
    worker: Option<JoinHandle<()>>,
}

impl Announcer {
    /// Spawns the broadcast thread. Socket setup failures are logged and
    /// leave the agent running undiscovered; manual `host:port` gateway
    /// config still works.
    pub fn start(config: &AgentConfig) -> Announcer {
        let cancel = CancellationSource::new();
        let token = cancel.token();

        let announcement = Announcement::new(
            config.port,
            &config.service_name,
            &config.advertised_host,
        );
        let interval = Duration::from_millis(config.broadcast_interval_ms);

        let worker = std::thread::Builder::new()
            .name("announcer".to_string())
            .spawn(move || {
                let socket = match UdpSocket::bind(("0.0.0.0", 0)) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "announcer socket bind failed");
                        return;
                    }
                };
                if let Err(e) = socket.set_broadcast(true) {
                    warn!(error = %e, "announcer cannot enable broadcast");
                    return;
                }

                let packet = announcement.encode();
                info!(
                    port = announcement.service_port,
                    interval_ms = interval.as_millis() as u64,
                    "announcing service"
                );

                loop {
                    if let Err(e) =
                        socket.send_to(&packet, ("255.255.255.255", DISCOVERY_PORT))
                    {
                        debug!(error = %e, "broadcast announcement failed");
                    }
                    if let Err(e) = socket.send_to(&packet, ("127.0.0.1", DISCOVERY_PORT)) {
                        debug!(error = %e, "loopback announcement failed");
                    }

                    if token.wait_timeout(interval) {
                        break;
                    }
                }
                info!("announcer stopped");
            })
            .ok();

        Announcer { cancel, worker }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_stop_is_prompt() {
        let config = AgentConfig {
            broadcast_interval_ms: 60_000,
            ..Default::default()
        };
        let mut announcer = Announcer::start(&config);

        // Give the thread a moment to enter its wait.
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        announcer.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
