//! Supervised lifecycle around a blocking video streamer
//!
//! The streamer (an external encoder pipeline driver) blocks inside
//! `stream` until cancelled or failed; the session owns the worker thread
//! and the state machine `Stopped -> Starting -> Running -> Stopping ->
//! Stopped | Failed`. All transitions are serialized under one mutex.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::bus::{BroadcastBus, VideoPacket};
use crate::cancel::{CancellationSource, CancellationToken};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// The blocking streamer seam.
///
/// Contract:
/// 1. `stream` blocks until the token is cancelled or a critical error
///    occurs.
/// 2. `on_packet` must return quickly; it pushes to the bus and returns.
/// 3. The token is checked on every frame boundary and never cached
///    across suspension points.
pub trait VideoStreamer: Send + Sync {
    fn stream(
        &self,
        on_packet: &mut dyn FnMut(VideoPacket),
        token: CancellationToken,
    ) -> Result<()>;
}

struct SessionInner {
    state: SessionState,
    cancel: CancellationSource,
    worker: Option<JoinHandle<()>>,
}

/// Supervises one streamer feeding one bus.
pub struct StreamSession {
    name: &'static str,
    streamer: Arc<dyn VideoStreamer>,
    bus: Arc<BroadcastBus>,
    inner: Arc<Mutex<SessionInner>>,
}

impl StreamSession {
    pub fn new(
        name: &'static str,
        streamer: Arc<dyn VideoStreamer>,
        bus: Arc<BroadcastBus>,
    ) -> Self {
        StreamSession {
            name,
            streamer,
            bus,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Stopped,
                cancel: CancellationSource::new(),
                worker: None,
            })),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Stopped -> Starting -> Running. A second `start` while Running or
    /// Starting fails with `Busy`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if matches!(
            inner.state,
            SessionState::Running | SessionState::Starting | SessionState::Stopping
        ) {
            return Err(AgentError::Busy("stream already running"));
        }

        inner.state = SessionState::Starting;
        inner.cancel.reset();
        let token = inner.cancel.token();

        let streamer = Arc::clone(&self.streamer);
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.inner);
        let name = self.name;

        let handle = std::thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn(move || {
                info!(session = name, "stream worker started");

                let mut on_packet = |pkt: VideoPacket| bus.push(pkt);
                let result = streamer.stream(&mut on_packet, token);

                let mut inner = shared.lock();
                if inner.state == SessionState::Running {
                    // Worker returned on its own: Failed iff the streamer
                    // errored, else a clean Stopped.
                    match &result {
                        Ok(()) => inner.state = SessionState::Stopped,
                        Err(e) => {
                            error!(session = name, error = %e, "streamer failed");
                            inner.state = SessionState::Failed;
                        }
                    }
                } else if let Err(e) = result {
                    if !matches!(e, AgentError::Cancelled) {
                        error!(session = name, error = %e, "streamer error during stop");
                    }
                }
                info!(session = name, "stream worker exited");
            })
            .map_err(|e| {
                AgentError::Fatal(format!("failed to spawn stream worker: {e}"))
            });

        match handle {
            Ok(h) => {
                inner.worker = Some(h);
                inner.state = SessionState::Running;
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Running -> Stopping -> Stopped. Bounded: cancel, then join; the
    /// join returns once the current encoder read returns. No-op when
    /// already Stopped.
    pub fn stop(&self) {
        let worker = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Stopped | SessionState::Stopping) {
                return;
            }
            inner.state = SessionState::Stopping;
            inner.cancel.cancel();
            inner.worker.take()
        };

        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!(session = self.name, "stream worker panicked");
            }
        }

        self.inner.lock().state = SessionState::Stopped;
        info!(session = self.name, "session stopped");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SinkStatus;
    use crate::protocol::nalu::PacketKind;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Emits one config packet then inter-frames until cancelled,
    /// mirroring a real encoder pipe.
    struct MockStreamer {
        fail: AtomicBool,
    }

    impl MockStreamer {
        fn new() -> Self {
            MockStreamer {
                fail: AtomicBool::new(false),
            }
        }

        fn failing() -> Self {
            MockStreamer {
                fail: AtomicBool::new(true),
            }
        }
    }

    impl VideoStreamer for MockStreamer {
        fn stream(
            &self,
            on_packet: &mut dyn FnMut(VideoPacket),
            token: CancellationToken,
        ) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(AgentError::Encoder("mock failure".into()));
            }

            let mut pts = 0u64;
            on_packet(VideoPacket {
                data: Bytes::from_static(&[0xCC]),
                pts,
                generation: 1,
                kind: PacketKind::CodecConfig,
            });

            while !token.is_cancelled() {
                pts += 1;
                on_packet(VideoPacket {
                    data: Bytes::from_static(&[0x00]),
                    pts,
                    generation: 1,
                    kind: PacketKind::InterFrame,
                });
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_start_stop_cycle() {
        let bus = Arc::new(BroadcastBus::new());
        let session = StreamSession::new("test", Arc::new(MockStreamer::new()), Arc::clone(&bus));

        assert_eq!(session.state(), SessionState::Stopped);
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        bus.subscribe(1, Box::new(|_| SinkStatus::Sent));
        wait_for(|| bus.subscriber_stats(1).is_some());

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_double_start_is_busy() {
        let bus = Arc::new(BroadcastBus::new());
        let session = StreamSession::new("test", Arc::new(MockStreamer::new()), bus);

        session.start().unwrap();
        assert_matches!(session.start(), Err(AgentError::Busy(_)));
        session.stop();
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let bus = Arc::new(BroadcastBus::new());
        let session = StreamSession::new("test", Arc::new(MockStreamer::new()), bus);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_streamer_error_yields_failed() {
        let bus = Arc::new(BroadcastBus::new());
        let session = StreamSession::new("test", Arc::new(MockStreamer::failing()), bus);

        session.start().unwrap();
        wait_for(|| session.state() == SessionState::Failed);
    }

    #[test]
    fn test_restart_after_failure() {
        let bus = Arc::new(BroadcastBus::new());
        let streamer = Arc::new(MockStreamer::failing());
        let session =
            StreamSession::new("test", Arc::clone(&streamer) as Arc<dyn VideoStreamer>, bus);

        session.start().unwrap();
        wait_for(|| session.state() == SessionState::Failed);

        streamer.fail.store(false, Ordering::Relaxed);
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);
        session.stop();
    }
}
