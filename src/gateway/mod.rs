//! Single-process fan-out gateway
//!
//! Bridges M WebSocket clients and N agent TCP links: four long-lived
//! roles (client acceptor, agent manager, UDP discovery, health monitor)
//! plus one reader/writer task pair per connection. All routing state
//! lives in [`Shared`]; connection tasks are aborted on shutdown.

pub mod backend;
pub mod breaker;
pub mod client;
pub mod discovery;
pub mod lanes;
pub mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use backend::{BackendSource, BackendTable};
use client::{ClientTable, MAX_CONSECUTIVE_SEND_FAILURES};

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Traffic counters, updated lock-free from every connection task.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub ws_messages_in: AtomicU64,
    pub ws_messages_out: AtomicU64,
    pub ws_bytes_in: AtomicU64,
    pub ws_bytes_out: AtomicU64,
    pub backend_messages_in: AtomicU64,
    pub backend_messages_out: AtomicU64,
    pub backend_bytes_in: AtomicU64,
    pub backend_bytes_out: AtomicU64,
    pub client_connections: AtomicU64,
    pub client_disconnections: AtomicU64,
}

impl GatewayMetrics {
    fn log_stats(&self, active_clients: usize, connected_agents: usize) {
        info!(
            clients = active_clients,
            agents = connected_agents,
            ws_in = self.ws_messages_in.load(Ordering::Relaxed),
            ws_out = self.ws_messages_out.load(Ordering::Relaxed),
            ws_bytes_out = self.ws_bytes_out.load(Ordering::Relaxed),
            agent_in = self.backend_messages_in.load(Ordering::Relaxed),
            agent_out = self.backend_messages_out.load(Ordering::Relaxed),
            "gateway stats"
        );
    }
}

/// State shared by every gateway task.
pub struct Shared {
    pub config: GatewayConfig,
    pub clients: ClientTable,
    pub backends: BackendTable,
    pub metrics: GatewayMetrics,
}

impl Shared {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let clients = ClientTable::new(config.max_clients);
        let backends = BackendTable::new(config.max_backends);
        Arc::new(Shared {
            config,
            clients,
            backends,
            metrics: GatewayMetrics::default(),
        })
    }
}

pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Gateway {
            shared: Shared::new(config),
        }
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Runs until SIGINT/SIGTERM, then tears every task down.
    pub async fn run(&self, source: BackendSource) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.shared.config.ws_port))
            .await
            .with_context(|| {
                format!("failed to bind websocket port {}", self.shared.config.ws_port)
            })?;
        info!(port = self.shared.config.ws_port, "gateway listening for clients");

        let mut tasks = JoinSet::new();

        // Discovery listener feeds the same table the manager dials from.
        let source = match source {
            BackendSource::Discovery(table) => {
                let table_for_listener = Arc::clone(&table);
                tasks.spawn(async move {
                    if let Err(e) = discovery::run_listener(table_for_listener).await {
                        warn!(error = %e, "discovery listener failed");
                    }
                });
                BackendSource::Discovery(table)
            }
            fixed => fixed,
        };

        {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(backend::run_manager(shared, source));
        }

        {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                if let Err(e) = client::serve(shared, stream).await {
                                    warn!(peer = %peer, error = %e, "client connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            });
        }

        {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(monitor(shared));
        }

        wait_for_shutdown().await;
        info!("shutdown signal received, stopping gateway");

        for slot in self.shared.clients.active() {
            slot.close();
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        info!("gateway stopped cleanly");
        Ok(())
    }
}

/// Health sweep plus periodic stats, the gateway's monitoring role.
async fn monitor(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    let idle_timeout = Duration::from_secs(shared.config.idle_timeout_secs);

    loop {
        tick.tick().await;
        let now = Instant::now();

        for slot in shared.clients.active() {
            if slot.idle_for(now) > idle_timeout {
                warn!(client_id = slot.id, "client idle timeout, closing");
                slot.close();
                continue;
            }
            let failures = slot
                .counters
                .consecutive_send_failures
                .load(Ordering::Relaxed);
            if failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                warn!(client_id = slot.id, failures, "client too many send failures, closing");
                slot.close();
            }
        }

        shared.metrics.log_stats(
            shared.clients.active_count(),
            shared.backends.connected().len(),
        );
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
