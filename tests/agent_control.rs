//! End-to-end agent control channel: framed commands in, framed
//! responses out, tagged video through the broadcast bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use remote_agent::agent::apps::SystemAppManager;
use remote_agent::agent::input::NullInjector;
use remote_agent::agent::keylog::UnsupportedKeylogger;
use remote_agent::agent::server::{self, AgentContext, AGENT_NAME};
use remote_agent::bus::{BroadcastBus, VideoPacket};
use remote_agent::cancel::CancellationToken;
use remote_agent::config::AgentConfig;
use remote_agent::error::Result;
use remote_agent::protocol::frame::{read_frame, write_frame, Frame};
use remote_agent::protocol::nalu::PacketKind;
use remote_agent::session::{StreamSession, VideoStreamer};
use tokio::net::TcpStream;

/// Deterministic encoder stand-in: config, keyframe, then inter-frames
/// until cancelled.
struct ScriptedStreamer;

impl VideoStreamer for ScriptedStreamer {
    fn stream(
        &self,
        on_packet: &mut dyn FnMut(VideoPacket),
        token: CancellationToken,
    ) -> Result<()> {
        on_packet(VideoPacket {
            data: Bytes::from_static(&[0xAA]),
            pts: 0,
            generation: 1,
            kind: PacketKind::CodecConfig,
        });
        on_packet(VideoPacket {
            data: Bytes::from_static(&[0xBB]),
            pts: 1,
            generation: 1,
            kind: PacketKind::KeyFrame,
        });

        let mut pts = 2;
        while !token.is_cancelled() {
            on_packet(VideoPacket {
                data: Bytes::from_static(&[0x00]),
                pts,
                generation: 1,
                kind: PacketKind::InterFrame,
            });
            pts += 1;
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

async fn start_agent(port: u16) -> Arc<AgentContext> {
    let config = AgentConfig {
        port,
        ..Default::default()
    };

    let monitor_bus = Arc::new(BroadcastBus::new());
    let webcam_bus = Arc::new(BroadcastBus::new());
    let ctx = Arc::new(AgentContext {
        config,
        monitor_session: Arc::new(StreamSession::new(
            "monitor",
            Arc::new(ScriptedStreamer),
            Arc::clone(&monitor_bus),
        )),
        webcam_session: Arc::new(StreamSession::new(
            "webcam",
            Arc::new(ScriptedStreamer),
            Arc::clone(&webcam_bus),
        )),
        monitor_bus,
        webcam_bus,
        keylogger: Arc::new(UnsupportedKeylogger),
        apps: Arc::new(SystemAppManager::new()),
        input: Arc::new(NullInjector),
    });

    tokio::spawn(server::run_control_listener(Arc::clone(&ctx)));
    // Let the listener bind before the test dials in.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx
}

async fn send_command(stream: &mut TcpStream, cid: u32, bid: u32, text: &str) {
    write_frame(stream, cid, bid, None, text.as_bytes())
        .await
        .unwrap();
}

async fn recv_frame(stream: &mut TcpStream) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .expect("response within deadline")
        .unwrap()
        .expect("connection stays open")
}

#[tokio::test]
async fn test_ping_and_backend_id_fallback() {
    let _ctx = start_agent(19_090).await;
    let mut stream = TcpStream::connect(("127.0.0.1", 19_090)).await.unwrap();

    // Peer sends backend_id 0: the agent answers as backend 1.
    send_command(&mut stream, 7, 0, "ping").await;
    let reply = recv_frame(&mut stream).await;
    assert_eq!(reply.header.client_id, 7);
    assert_eq!(reply.header.backend_id, 1);
    assert_eq!(
        String::from_utf8_lossy(&reply.payload),
        format!("INFO:NAME={AGENT_NAME}")
    );

    // Once the peer names a backend id, responses echo it.
    send_command(&mut stream, 7, 3, "ping").await;
    let reply = recv_frame(&mut stream).await;
    assert_eq!(reply.header.backend_id, 3);
}

#[tokio::test]
async fn test_get_state_sync_report() {
    let _ctx = start_agent(19_092).await;
    let mut stream = TcpStream::connect(("127.0.0.1", 19_092)).await.unwrap();

    send_command(&mut stream, 1, 1, "get_state").await;

    let mut lines = Vec::new();
    for _ in 0..4 {
        let frame = recv_frame(&mut stream).await;
        lines.push(String::from_utf8_lossy(&frame.payload).into_owned());
    }

    assert_eq!(lines[0], "STATUS:SYNC:monitor=inactive");
    assert_eq!(lines[1], "STATUS:SYNC:webcam=inactive");
    assert_eq!(lines[2], "STATUS:SYNC:keylogger=inactive");
    assert_eq!(lines[3], "STATUS:SYNC:complete");
}

#[tokio::test]
async fn test_monitor_stream_delivers_tagged_video() {
    let ctx = start_agent(19_094).await;
    let mut stream = TcpStream::connect(("127.0.0.1", 19_094)).await.unwrap();

    send_command(&mut stream, 5, 2, "start_monitor_stream").await;

    // Collect frames until the status response and a couple of video
    // payloads have arrived.
    let mut status = None;
    let mut video = Vec::new();
    while status.is_none() || video.len() < 2 {
        let frame = recv_frame(&mut stream).await;
        match frame.payload.first() {
            Some(&1) => video.push(frame),
            _ => status = Some(String::from_utf8_lossy(&frame.payload).into_owned()),
        }
    }

    assert_eq!(status.unwrap(), "STATUS:MONITOR_STREAM:STARTED");
    assert!(ctx.monitor_session.is_active());

    // Smart join: config then keyframe, tag byte 1 first.
    assert_eq!(&video[0].payload[..], &[1, 0xAA]);
    assert_eq!(video[0].header.client_id, 5);
    assert_eq!(video[0].header.backend_id, 2);
    assert_eq!(&video[1].payload[..], &[1, 0xBB]);

    send_command(&mut stream, 5, 2, "stop_monitor_stream").await;
    let mut stopped = false;
    for _ in 0..50 {
        let frame = recv_frame(&mut stream).await;
        if &frame.payload[..] == b"STATUS:MONITOR_STREAM:STOPPED" {
            stopped = true;
            break;
        }
    }
    assert!(stopped);
    assert!(!ctx.monitor_session.is_active());
}

#[tokio::test]
async fn test_keylog_error_surface() {
    let _ctx = start_agent(19_096).await;
    let mut stream = TcpStream::connect(("127.0.0.1", 19_096)).await.unwrap();

    send_command(&mut stream, 2, 1, "start_keylog").await;
    let reply = recv_frame(&mut stream).await;
    let text = String::from_utf8_lossy(&reply.payload).into_owned();
    assert!(text.starts_with("ERROR:Keylog:"), "got: {text}");
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let ctx = start_agent(19_098).await;

    {
        let mut stream = TcpStream::connect(("127.0.0.1", 19_098)).await.unwrap();
        send_command(&mut stream, 9, 1, "start_monitor_stream").await;
        let _ = recv_frame(&mut stream).await;
        assert!(ctx.monitor_bus.subscriber_stats(9).is_some());
    }

    // Dropped connection: the agent prunes subscriber 9.
    for _ in 0..100 {
        if ctx.monitor_bus.subscriber_stats(9).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ctx.monitor_bus.subscriber_stats(9).is_none());

    ctx.monitor_session.stop();
}
