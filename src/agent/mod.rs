//! The per-host agent process
//!
//! Wires the capture seams (encoder pipelines, keylogger, app manager,
//! input injector) to the broadcast buses and the control/data servers,
//! plus the UDP announcer. Thread ownership: one worker per stream
//! session, one announcer thread, one task per accepted connection.

pub mod announcer;
pub mod apps;
pub mod commands;
pub mod input;
pub mod keylog;
pub mod server;

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::BroadcastBus;
use crate::config::AgentConfig;
use crate::encoder::PipeStreamer;
use crate::session::StreamSession;
use announcer::Announcer;
use apps::SystemAppManager;
use input::NullInjector;
use keylog::UnsupportedKeylogger;
use server::AgentContext;

pub struct Agent {
    ctx: Arc<AgentContext>,
}

impl Agent {
    /// Assembles the default host wiring for `config`.
    pub fn new(config: AgentConfig) -> Self {
        let monitor_bus = Arc::new(BroadcastBus::with_max_queue(config.max_queue_size));
        let webcam_bus = Arc::new(BroadcastBus::with_max_queue(config.max_queue_size));

        let monitor_streamer = match &config.monitor_command {
            Some(cmd) => PipeStreamer::new("monitor", cmd.clone()),
            None => PipeStreamer::monitor_default(),
        };
        let webcam_streamer = match &config.webcam_command {
            Some(cmd) => PipeStreamer::new("webcam", cmd.clone()),
            None => PipeStreamer::webcam_default(),
        };

        let monitor_session = Arc::new(StreamSession::new(
            "monitor",
            Arc::new(monitor_streamer),
            Arc::clone(&monitor_bus),
        ));
        let webcam_session = Arc::new(StreamSession::new(
            "webcam",
            Arc::new(webcam_streamer),
            Arc::clone(&webcam_bus),
        ));

        let ctx = Arc::new(AgentContext {
            config,
            monitor_bus,
            webcam_bus,
            monitor_session,
            webcam_session,
            keylogger: Arc::new(UnsupportedKeylogger),
            apps: Arc::new(SystemAppManager::new()),
            input: Arc::new(NullInjector),
        });

        Agent { ctx }
    }

    pub fn context(&self) -> Arc<AgentContext> {
        Arc::clone(&self.ctx)
    }

    /// Serves until SIGINT/SIGTERM, then stops sessions and the
    /// announcer.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            port = self.ctx.config.port,
            data_port = self.ctx.config.data_port(),
            name = %self.ctx.config.service_name,
            "agent starting"
        );

        let mut announcer = Announcer::start(&self.ctx.config);

        let control = tokio::spawn(server::run_control_listener(Arc::clone(&self.ctx)));
        let data = tokio::spawn(server::run_data_listener(Arc::clone(&self.ctx)));

        wait_for_shutdown().await;
        info!("shutdown signal received, stopping agent");

        control.abort();
        data.abort();
        announcer.stop();

        self.ctx.monitor_session.stop();
        self.ctx.webcam_session.stop();
        self.ctx.keylogger.stop();

        info!("agent stopped cleanly");
        Ok(())
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
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
