//! Bounded per-subscriber fan-out of encoded video packets
//!
//! Unlike a plain broadcast channel, the bus knows what a video packet
//! *is*: codec config and keyframes are synchronization points, so when a
//! subscriber queue overflows they evict queued inter-frames instead of
//! being dropped themselves. A decoder must resync at the next IDR after
//! loss; hoarding inter-frames while dropping keys is strictly worse than
//! the converse.
//!
//! The bus also caches the latest config and keyframe per encoder
//! generation so a late subscriber is warmed up immediately ("smart
//! join") instead of waiting for the next keyframe interval.
//!
//! Sinks must be non-blocking: push to a channel and return. Dispatch
//! runs under the bus lock; a sink that reports `Closed`, or a subscriber
//! whose drop count crosses the eviction threshold, is removed after the
//! fan-out loop, never mid-iteration.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::nalu::PacketKind;

/// The fan-out unit. `data` is immutable after publication and shared
/// zero-copy across all subscribers; lifetime is the longest holder.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub data: Bytes,
    /// Monotonic sequence integer per stream.
    pub pts: u64,
    /// Increments on encoder reset/resize; groups cache entries.
    pub generation: u64,
    pub kind: PacketKind,
}

/// Result of offering a packet to a subscriber sink. Sinks never block:
/// `Busy` leaves the packet queued for a later drain, `Closed` schedules
/// the subscriber for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Sent,
    Busy,
    Closed,
}

pub type PacketSink = Box<dyn FnMut(&VideoPacket) -> SinkStatus + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub dropped_frames: u64,
    pub force_clears: u64,
    pub queue_len: usize,
}

pub const DEFAULT_MAX_QUEUE: usize = 60;

/// A subscriber dropping this many inter-frames is considered dead weight
/// and evicted on the next push.
const EVICT_DROP_THRESHOLD: u64 = 1800;

struct Subscriber {
    id: u32,
    sink: PacketSink,
    queue: VecDeque<VideoPacket>,
    dropped_frames: u64,
    force_clears: u64,
    closed: bool,
}

impl Subscriber {
    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            dropped_frames: self.dropped_frames,
            force_clears: self.force_clears,
            queue_len: self.queue.len(),
        }
    }

    /// Feeds queued packets to the sink until it reports Busy or Closed.
    fn drain(&mut self) {
        while let Some(pkt) = self.queue.front() {
            match (self.sink)(pkt) {
                SinkStatus::Sent => {
                    self.queue.pop_front();
                }
                SinkStatus::Busy => break,
                SinkStatus::Closed => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

struct Inner {
    subscribers: Vec<Subscriber>,
    cached_configs: BTreeMap<u64, VideoPacket>,
    cached_idrs: BTreeMap<u64, VideoPacket>,
}

/// Lock-arbitrated fan-out with kind-aware drop and smart join.
pub struct BroadcastBus {
    inner: Mutex<Inner>,
    max_queue: usize,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_max_queue(DEFAULT_MAX_QUEUE)
    }

    pub fn with_max_queue(max_queue: usize) -> Self {
        BroadcastBus {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                cached_configs: BTreeMap::new(),
                cached_idrs: BTreeMap::new(),
            }),
            max_queue,
        }
    }

    /// Publishes a packet to every subscriber. Safe from any thread and
    /// never blocks on a slow subscriber.
    pub fn push(&self, packet: VideoPacket) {
        let mut inner = self.inner.lock();

        match packet.kind {
            PacketKind::CodecConfig => {
                inner.cached_configs.insert(packet.generation, packet.clone());
            }
            PacketKind::KeyFrame => {
                inner.cached_idrs.insert(packet.generation, packet.clone());
            }
            PacketKind::InterFrame => {}
        }

        let max_queue = self.max_queue;
        for sub in inner.subscribers.iter_mut() {
            dispatch(sub, &packet, max_queue);
        }

        // Deferred removal: never mutate the list while fanning out.
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| {
            if s.closed {
                info!(client_id = s.id, "subscriber sink closed, removing");
                return false;
            }
            if s.dropped_frames >= EVICT_DROP_THRESHOLD {
                warn!(
                    client_id = s.id,
                    dropped = s.dropped_frames,
                    "subscriber persistently slow, evicting"
                );
                return false;
            }
            true
        });
        if inner.subscribers.len() != before {
            debug!(remaining = inner.subscribers.len(), "subscriber list pruned");
        }
    }

    /// Registers a subscriber, replacing any existing entry for the same
    /// id, and immediately warms it up: the latest generation's codec
    /// config first, then that generation's keyframe if cached. No
    /// inter-frame backlog is replayed.
    pub fn subscribe(&self, client_id: u32, sink: PacketSink) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != client_id);

        let mut sub = Subscriber {
            id: client_id,
            sink,
            queue: VecDeque::new(),
            dropped_frames: 0,
            force_clears: 0,
            closed: false,
        };

        if let Some((&gen, config)) = inner.cached_configs.iter().next_back() {
            sub.queue.push_back(config.clone());
            if let Some(idr) = inner.cached_idrs.get(&gen) {
                sub.queue.push_back(idr.clone());
            }
            sub.drain();
        }

        info!(client_id, "subscriber joined");
        inner.subscribers.push(sub);
    }

    /// Idempotent removal.
    pub fn unsubscribe(&self, client_id: u32) {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != client_id);
        if inner.subscribers.len() != before {
            info!(client_id, "subscriber left");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn subscriber_stats(&self, client_id: u32) -> Option<SubscriberStats> {
        self.inner
            .lock()
            .subscribers
            .iter()
            .find(|s| s.id == client_id)
            .map(|s| s.stats())
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(sub: &mut Subscriber, packet: &VideoPacket, max_queue: usize) {
    if sub.queue.len() >= max_queue {
        if packet.kind.is_sync_point() {
            // Synchronization point: worth losing every queued
            // inter-frame to deliver it.
            sub.queue.clear();
            sub.force_clears += 1;
        } else {
            sub.dropped_frames += 1;
            return;
        }
    }

    sub.queue.push_back(packet.clone());
    sub.drain();
}
