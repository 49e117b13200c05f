//! Encoder pipe -> session -> bus pipeline, end to end with a real
//! child process standing in for the encoder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_agent::bus::{BroadcastBus, SinkStatus, VideoPacket};
use remote_agent::encoder::PipeStreamer;
use remote_agent::protocol::nalu::PacketKind;
use remote_agent::session::{SessionState, StreamSession};

fn annex_b_sps() -> Vec<u8> {
    // 00 00 00 01 | SPS (type 7) | filler
    let mut data = vec![0, 0, 0, 1, 0x67];
    data.extend_from_slice(&[0x42, 0x00, 0x1F, 0xAB, 0xCD]);
    data
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_finite_encoder_flows_to_subscribers_then_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.h264");
    std::fs::write(&path, annex_b_sps()).unwrap();

    let bus = Arc::new(BroadcastBus::new());
    let streamer = PipeStreamer::new("test", format!("cat {}", path.display()));
    let session = StreamSession::new("test", Arc::new(streamer), Arc::clone(&bus));

    let received: Arc<Mutex<Vec<VideoPacket>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_log = Arc::clone(&received);
    bus.subscribe(
        1,
        Box::new(move |pkt| {
            sink_log.lock().unwrap().push(pkt.clone());
            SinkStatus::Sent
        }),
    );

    session.start().unwrap();

    wait_for(|| !received.lock().unwrap().is_empty(), "first packet");
    // Pipe EOF without cancellation is an encoder death: Failed.
    wait_for(|| session.state() == SessionState::Failed, "failed state");

    let packets = received.lock().unwrap();
    assert_eq!(packets[0].kind, PacketKind::CodecConfig);
    assert_eq!(&packets[0].data[..], &annex_b_sps()[..]);
    assert_eq!(packets[0].generation, 1);
}

#[test]
fn test_late_subscriber_gets_cached_config_after_stream_ends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.h264");
    std::fs::write(&path, annex_b_sps()).unwrap();

    let bus = Arc::new(BroadcastBus::new());
    let streamer = PipeStreamer::new("test", format!("cat {}", path.display()));
    let session = StreamSession::new("test", Arc::new(streamer), Arc::clone(&bus));

    session.start().unwrap();
    wait_for(|| session.state() == SessionState::Failed, "stream drained");

    // Smart join replays the cached codec config to a late subscriber.
    let received: Arc<Mutex<Vec<VideoPacket>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_log = Arc::clone(&received);
    bus.subscribe(
        2,
        Box::new(move |pkt| {
            sink_log.lock().unwrap().push(pkt.clone());
            SinkStatus::Sent
        }),
    );

    let packets = received.lock().unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].kind, PacketKind::CodecConfig);
}

#[test]
fn test_cancelled_session_stops_cleanly() {
    let bus = Arc::new(BroadcastBus::new());
    // Endless pipe; only cancellation ends it.
    let streamer = PipeStreamer::new(
        "test",
        "while true; do printf 'xxxxxxxxxxxxxxxx'; sleep 0.02; done".to_string(),
    );
    let session = StreamSession::new("test", Arc::new(streamer), Arc::clone(&bus));

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    std::thread::sleep(Duration::from_millis(150));

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);

    // Restart works after a clean stop.
    session.start().unwrap();
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
}
