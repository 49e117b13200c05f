//! WebSocket client slots and connection servicing
//!
//! Clients occupy a fixed slot table; the slot index (+1) is the client's
//! wire id for the lifetime of the connection and is stamped over
//! whatever `client_id` the client sends. Slots are allocated first-free
//! on accept, never derived from the fd/socket, which can alias across
//! close/reopen.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::protocol::frame::{Frame, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::gateway::lanes::{Lane, Outbound};
use crate::gateway::{router, Shared};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const WS_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Handshake,
    Active,
}

#[derive(Debug, Default)]
pub struct ClientCounters {
    pub messages_recv: AtomicU64,
    pub messages_sent: AtomicU64,
    pub consecutive_send_failures: AtomicU32,
}

/// Sliding 1-second ingress window.
#[derive(Debug)]
pub struct RateWindow {
    window_start: Instant,
    bytes: u32,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        RateWindow {
            window_start: now,
            bytes: 0,
        }
    }

    /// Accounts `len` bytes; returns how long reads must be deferred when
    /// the cap is exceeded within the current window. A zero cap disables
    /// policing.
    pub fn note_at(&mut self, len: u32, cap: u32, now: Instant) -> Option<Duration> {
        if cap == 0 {
            return None;
        }

        let elapsed = now.duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            self.window_start = now;
            self.bytes = 0;
        }

        self.bytes = self.bytes.saturating_add(len);
        if self.bytes >= cap {
            Some(Duration::from_secs(1).saturating_sub(now.duration_since(self.window_start)))
        } else {
            None
        }
    }
}

/// One connected (or connecting) client.
pub struct ClientSlot {
    /// Wire id: slot index + 1.
    pub id: u32,
    state: Mutex<ClientState>,
    last_activity: Mutex<Instant>,
    pub outbound: Outbound,
    rate: Mutex<RateWindow>,
    pub counters: ClientCounters,
    closed: watch::Sender<bool>,
}

impl ClientSlot {
    fn new(id: u32) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(ClientSlot {
            id,
            state: Mutex::new(ClientState::Handshake),
            last_activity: Mutex::new(now),
            outbound: Outbound::for_client(),
            rate: Mutex::new(RateWindow::new(now)),
            counters: ClientCounters::default(),
            closed: watch::Sender::new(false),
        })
    }

    pub fn is_active(&self) -> bool {
        *self.state.lock() == ClientState::Active
    }

    pub fn mark_active(&self) {
        *self.state.lock() = ClientState::Active;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_activity.lock())
    }

    /// Queues a framed packet toward this client, lane chosen by stream
    /// tag. Packets to non-active slots are discarded.
    pub fn enqueue(&self, frame: Frame) -> bool {
        if !self.is_active() || self.is_closed() {
            return false;
        }
        self.outbound.push_auto(frame);
        true
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed_wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn note_rate(&self, len: u32, cap: u32) -> Option<Duration> {
        self.rate.lock().note_at(len, cap, Instant::now())
    }
}

/// Fixed-capacity slot table; at most one `client_id -> connection`
/// binding exists at any time.
pub struct ClientTable {
    slots: Mutex<Vec<Option<Arc<ClientSlot>>>>,
}

impl ClientTable {
    pub fn new(capacity: usize) -> Self {
        ClientTable {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Claims the first free slot, or `None` when the table is full.
    pub fn allocate(&self) -> Option<Arc<ClientSlot>> {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(|s| s.is_none())?;
        let slot = ClientSlot::new(idx as u32 + 1);
        slots[idx] = Some(Arc::clone(&slot));
        Some(slot)
    }

    pub fn release(&self, id: u32) {
        let mut slots = self.slots.lock();
        let idx = (id as usize).wrapping_sub(1);
        if let Some(entry) = slots.get_mut(idx) {
            if entry.as_ref().map_or(false, |s| s.id == id) {
                *entry = None;
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<ClientSlot>> {
        let slots = self.slots.lock();
        let idx = (id as usize).wrapping_sub(1);
        slots.get(idx).and_then(|s| s.clone())
    }

    pub fn active(&self) -> Vec<Arc<ClientSlot>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().flatten().filter(|s| s.is_active()).count()
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Drives one accepted TCP connection through handshake, slot allocation
/// and the read/write loops, releasing the slot on exit.
pub async fn serve(shared: Arc<Shared>, stream: TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_PAYLOAD_LEN as usize + HEADER_LEN),
        max_frame_size: Some(MAX_PAYLOAD_LEN as usize + HEADER_LEN),
        ..Default::default()
    };

    let ws = match timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "websocket handshake failed");
            return Ok(());
        }
        Err(_) => {
            warn!(peer = %peer, "websocket handshake timed out");
            return Ok(());
        }
    };

    let slot = match shared.clients.allocate() {
        Some(slot) => slot,
        None => {
            warn!(peer = %peer, "client table full, rejecting");
            return Ok(());
        }
    };

    info!(peer = %peer, client_id = slot.id, "client connected");
    shared.metrics.client_connections.fetch_add(1, Ordering::Relaxed);

    let (ws_tx, ws_rx) = ws.split();
    slot.mark_active();

    // Welcome packet tells the client its slot id.
    slot.outbound
        .push(Lane::Critical, Frame::new(slot.id, 0, Bytes::new()));

    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(Arc::clone(&slot), Arc::clone(&shared), ws_tx, ctrl_rx));

    read_loop(&shared, &slot, ws_rx, ctrl_tx).await;

    slot.close();
    let _ = writer.await;

    shared.clients.release(slot.id);
    shared
        .metrics
        .client_disconnections
        .fetch_add(1, Ordering::Relaxed);
    info!(client_id = slot.id, "client disconnected");
    Ok(())
}

async fn read_loop(
    shared: &Arc<Shared>,
    slot: &Arc<ClientSlot>,
    mut ws_rx: WsSource,
    ctrl_tx: mpsc::UnboundedSender<Message>,
) {
    let cap = shared.config.max_bytes_per_sec;

    loop {
        let msg = tokio::select! {
            biased;
            _ = slot.closed_wait() => break,
            msg = ws_rx.next() => msg,
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(client_id = slot.id, error = %e, "websocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Binary(data) => {
                slot.touch();
                slot.counters.messages_recv.fetch_add(1, Ordering::Relaxed);
                shared.metrics.ws_messages_in.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .ws_bytes_in
                    .fetch_add(data.len() as u64, Ordering::Relaxed);

                // Rate policing: over-cap clients are deferred, not
                // disconnected.
                if let Some(defer) = slot.note_rate(data.len() as u32, cap) {
                    debug!(client_id = slot.id, "rate limit reached, deferring reads");
                    tokio::time::sleep(defer).await;
                }

                let mut frame = match Frame::from_bytes(Bytes::from(data)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Malformed framing is unrecoverable: close.
                        warn!(client_id = slot.id, error = %e, "protocol error from client");
                        break;
                    }
                };

                // The gateway owns the id space; never trust the client.
                frame.header.client_id = slot.id;
                router::deliver_to_backends(shared, frame);
            }
            Message::Ping(payload) => {
                slot.touch();
                if ctrl_tx.send(Message::Pong(payload)).is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                debug!(client_id = slot.id, "client sent close");
                break;
            }
            Message::Pong(_) => slot.touch(),
            other => {
                debug!(client_id = slot.id, ?other, "ignoring non-binary message");
            }
        }
    }
}

async fn write_loop(
    slot: Arc<ClientSlot>,
    shared: Arc<Shared>,
    mut ws_tx: WsSink,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        while let Some(frame) = slot.outbound.pop() {
            let body = frame.to_bytes();
            match timeout(WS_SEND_TIMEOUT, ws_tx.send(Message::Binary(body.to_vec()))).await {
                Ok(Ok(())) => {
                    slot.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                    slot.counters
                        .consecutive_send_failures
                        .store(0, Ordering::Relaxed);
                    shared.metrics.ws_messages_out.fetch_add(1, Ordering::Relaxed);
                    shared
                        .metrics
                        .ws_bytes_out
                        .fetch_add(body.len() as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    let failures = slot
                        .counters
                        .consecutive_send_failures
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    warn!(client_id = slot.id, error = %e, failures, "client send failed");
                    if failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                        slot.close();
                        return;
                    }
                }
                Err(_) => {
                    // Send stuck beyond the allowance: abort and close.
                    warn!(client_id = slot.id, "websocket send stuck, aborting connection");
                    slot.close();
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = slot.closed_wait() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            slot.close();
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = slot.outbound.ready() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ids_are_index_plus_one() {
        let table = ClientTable::new(4);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        table.release(a.id);
        let c = table.allocate().unwrap();
        assert_eq!(c.id, 1, "first free slot is reused");
    }

    #[test]
    fn test_table_capacity() {
        let table = ClientTable::new(2);
        let _a = table.allocate().unwrap();
        let _b = table.allocate().unwrap();
        assert!(table.allocate().is_none());
    }

    #[test]
    fn test_single_binding_per_slot() {
        let table = ClientTable::new(2);
        let a = table.allocate().unwrap();
        assert!(table.get(a.id).is_some());
        table.release(a.id);
        assert!(table.get(a.id).is_none());
        // Double release is harmless.
        table.release(a.id);
    }

    #[test]
    fn test_enqueue_requires_active() {
        let table = ClientTable::new(1);
        let slot = table.allocate().unwrap();
        let frame = Frame::new(slot.id, 1, Bytes::from_static(b"x"));

        assert!(!slot.enqueue(frame.clone()), "handshake state rejects");
        slot.mark_active();
        assert!(slot.enqueue(frame.clone()));
        slot.close();
        assert!(!slot.enqueue(frame));
    }

    #[test]
    fn test_rate_window() {
        let t0 = Instant::now();
        let mut window = RateWindow::new(t0);

        // Unlimited when cap is zero.
        assert!(window.note_at(10_000, 0, t0).is_none());

        let mut window = RateWindow::new(t0);
        assert!(window.note_at(400, 1000, t0).is_none());
        assert!(window.note_at(400, 1000, t0).is_none());
        let defer = window.note_at(400, 1000, t0 + Duration::from_millis(100));
        assert!(defer.is_some(), "cap reached within the window");
        assert!(defer.unwrap() <= Duration::from_secs(1));

        // A new window resets the counter.
        assert!(window
            .note_at(400, 1000, t0 + Duration::from_millis(1200))
            .is_none());
    }

    #[test]
    fn test_idle_tracking() {
        let table = ClientTable::new(1);
        let slot = table.allocate().unwrap();
        slot.touch();
        let idle = slot.idle_for(Instant::now() + Duration::from_secs(61));
        assert!(idle >= Duration::from_secs(61));
    }
}
