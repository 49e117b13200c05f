//! Three-lane priority egress queues
//!
//! Every outbound socket (client or agent) drains packets in strict
//! priority order: Critical (control, keystrokes, input events, acks),
//! then Real-Time (encoded video), then Bulk (file chunks). FIFO is
//! preserved within a lane; the Critical lane never reorders keystrokes.
//!
//! Overflow policy per lane:
//! - Critical: bounded ring with a large soft cap; beyond it the oldest
//!   entry is dropped and logged.
//! - Real-Time: small bound, drop-oldest. Clients get a cap of 3; the
//!   gateway cannot see packet kinds, so this video coalescing is
//!   time-ordered. Agent links get 50.
//! - Bulk: unbounded soft queue, drained last.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::frame::Frame;
use crate::protocol::tag;

pub const CRITICAL_SOFT_CAP: usize = 2000;
pub const BACKEND_REALTIME_CAP: usize = 50;
pub const CLIENT_VIDEO_COALESCE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Critical,
    RealTime,
    Bulk,
}

impl Lane {
    /// Lane selection by the one-byte stream tag: video tags ride the
    /// Real-Time lane, everything else (including empty payloads) is
    /// Critical. Bulk is chosen explicitly by file-transfer callers.
    pub fn for_payload(payload: &[u8]) -> Lane {
        match payload.first() {
            Some(&tag::MONITOR) | Some(&tag::WEBCAM) => Lane::RealTime,
            _ => Lane::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaneStats {
    pub dropped_critical: u64,
    pub dropped_realtime: u64,
}

struct Queues {
    critical: VecDeque<Frame>,
    realtime: VecDeque<Frame>,
    bulk: VecDeque<Frame>,
    stats: LaneStats,
}

/// Priority queues plus a wakeup for the writer task that drains them.
pub struct Outbound {
    queues: Mutex<Queues>,
    realtime_cap: usize,
    notify: Notify,
}

impl Outbound {
    pub fn for_client() -> Self {
        Self::with_realtime_cap(CLIENT_VIDEO_COALESCE)
    }

    pub fn for_backend() -> Self {
        Self::with_realtime_cap(BACKEND_REALTIME_CAP)
    }

    pub fn with_realtime_cap(realtime_cap: usize) -> Self {
        Outbound {
            queues: Mutex::new(Queues {
                critical: VecDeque::new(),
                realtime: VecDeque::new(),
                bulk: VecDeque::new(),
                stats: LaneStats::default(),
            }),
            realtime_cap,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, lane: Lane, frame: Frame) {
        {
            let mut q = self.queues.lock();
            match lane {
                Lane::Critical => {
                    if q.critical.len() >= CRITICAL_SOFT_CAP {
                        q.critical.pop_front();
                        q.stats.dropped_critical += 1;
                        warn!(cap = CRITICAL_SOFT_CAP, "critical lane over soft cap, dropped oldest");
                    }
                    q.critical.push_back(frame);
                }
                Lane::RealTime => {
                    // Drop the oldest chunks until the new one fits.
                    while q.realtime.len() >= self.realtime_cap {
                        q.realtime.pop_front();
                        q.stats.dropped_realtime += 1;
                    }
                    q.realtime.push_back(frame);
                }
                Lane::Bulk => q.bulk.push_back(frame),
            }
        }
        self.notify.notify_one();
    }

    /// Pushes, choosing the lane from the payload's stream tag.
    pub fn push_auto(&self, frame: Frame) {
        self.push(Lane::for_payload(&frame.payload), frame);
    }

    /// Peels one packet in strict priority order.
    pub fn pop(&self) -> Option<Frame> {
        let mut q = self.queues.lock();
        q.critical
            .pop_front()
            .or_else(|| q.realtime.pop_front())
            .or_else(|| q.bulk.pop_front())
    }

    pub fn len(&self) -> usize {
        let q = self.queues.lock();
        q.critical.len() + q.realtime.len() + q.bulk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LaneStats {
        self.queues.lock().stats
    }

    /// Resolves when a packet has been pushed since the last wait. A
    /// permit is stored if nobody is waiting, so push-before-wait is not
    /// a lost wakeup.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(cid: u32, payload: &[u8]) -> Frame {
        Frame::new(cid, 1, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_strict_priority_order() {
        let out = Outbound::for_backend();
        out.push(Lane::Bulk, frame(1, b"bulk"));
        out.push(Lane::RealTime, frame(2, b"\x01video"));
        out.push(Lane::Critical, frame(3, b"cmd"));

        assert_eq!(out.pop().unwrap().header.client_id, 3);
        assert_eq!(out.pop().unwrap().header.client_id, 2);
        assert_eq!(out.pop().unwrap().header.client_id, 1);
        assert!(out.pop().is_none());
    }

    #[test]
    fn test_fifo_within_lane() {
        let out = Outbound::for_backend();
        for i in 0..5 {
            out.push(Lane::Critical, frame(i, b"key"));
        }
        for i in 0..5 {
            assert_eq!(out.pop().unwrap().header.client_id, i);
        }
    }

    #[test]
    fn test_realtime_drop_oldest_at_cap() {
        let out = Outbound::with_realtime_cap(50);
        for i in 0..60 {
            out.push(Lane::RealTime, frame(i, b"\x01v"));
        }

        let q_len = out.len();
        assert_eq!(q_len, 50);
        assert_eq!(out.stats().dropped_realtime, 10);
        // Oldest 10 were evicted.
        assert_eq!(out.pop().unwrap().header.client_id, 10);
    }

    #[test]
    fn test_client_video_coalescing() {
        let out = Outbound::for_client();
        for i in 0..10 {
            out.push_auto(frame(i, b"\x01chunk"));
        }
        assert_eq!(out.len(), 3);
        assert_eq!(out.pop().unwrap().header.client_id, 7);
        assert_eq!(out.pop().unwrap().header.client_id, 8);
        assert_eq!(out.pop().unwrap().header.client_id, 9);
    }

    #[test]
    fn test_lane_selection_by_tag() {
        assert_eq!(Lane::for_payload(b"\x01data"), Lane::RealTime);
        assert_eq!(Lane::for_payload(b"\x02data"), Lane::RealTime);
        assert_eq!(Lane::for_payload(b"\x00text"), Lane::Critical);
        assert_eq!(Lane::for_payload(b"ping"), Lane::Critical);
        assert_eq!(Lane::for_payload(b""), Lane::Critical);
    }

    #[test]
    fn test_critical_soft_cap_drops_oldest() {
        let out = Outbound::for_client();
        for i in 0..(CRITICAL_SOFT_CAP as u32 + 5) {
            out.push(Lane::Critical, frame(i, b"cmd"));
        }
        assert_eq!(out.stats().dropped_critical, 5);
        assert_eq!(out.pop().unwrap().header.client_id, 5);
    }

    #[tokio::test]
    async fn test_push_before_wait_is_not_lost() {
        let out = Outbound::for_client();
        out.push(Lane::Critical, frame(1, b"cmd"));
        // The permit from the push above resolves immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), out.ready())
            .await
            .expect("ready() should resolve from stored permit");
        assert!(out.pop().is_some());
    }
}
