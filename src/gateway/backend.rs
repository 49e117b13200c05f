//! Agent connections: slots, reconnect supervision and channel plumbing
//!
//! Each agent occupies a fixed slot; the slot index (+1) is its wire
//! `backend_id`. The gateway dials the agent's control port and its data
//! port (control + 1). Control carries framed packets both ways; the
//! data channel is a raw byte stream the gateway wraps into broadcast
//! frames. Disconnected agents are re-dialed on an interval; the circuit
//! breaker gates every send so a failing agent cannot stall clients.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::gateway::breaker::CircuitBreaker;
use crate::gateway::discovery::AgentAddr;
use crate::gateway::lanes::Outbound;
use crate::gateway::{router, Shared};
use crate::protocol::frame::{read_frame, Frame};

const DATA_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct BackendCounters {
    pub messages_sent: AtomicU64,
    pub messages_failed: AtomicU64,
    pub messages_recv: AtomicU64,
    pub reconnects: AtomicU64,
}

/// One agent slot, alive across reconnects.
pub struct BackendSlot {
    /// Wire id: slot index + 1.
    pub id: u32,
    pub addr: AgentAddr,
    connected: AtomicBool,
    pub breaker: Mutex<CircuitBreaker>,
    pub outbound: Outbound,
    pub counters: BackendCounters,
}

impl BackendSlot {
    fn new(id: u32, addr: AgentAddr) -> Arc<Self> {
        Arc::new(BackendSlot {
            id,
            addr,
            connected: AtomicBool::new(false),
            breaker: Mutex::new(CircuitBreaker::new()),
            outbound: Outbound::for_backend(),
            counters: BackendCounters::default(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Queues a packet toward the agent unless the circuit is open or
    /// the link is down. Refused packets never touch the socket.
    pub fn try_send(&self, frame: Frame) -> bool {
        if !self.breaker.lock().can_send() {
            debug!(backend_id = self.id, "circuit open, send refused");
            return false;
        }
        if !self.is_connected() {
            return false;
        }
        self.outbound.push_auto(frame);
        true
    }
}

/// Fixed-capacity agent slot table.
pub struct BackendTable {
    slots: Mutex<Vec<Option<Arc<BackendSlot>>>>,
}

impl BackendTable {
    pub fn new(capacity: usize) -> Self {
        BackendTable {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Returns the slot for `addr`, allocating the first free slot when
    /// the address is new. `None` when the table is full.
    pub fn ensure(&self, addr: &AgentAddr) -> Option<(Arc<BackendSlot>, bool)> {
        let mut slots = self.slots.lock();

        if let Some(existing) = slots
            .iter()
            .flatten()
            .find(|s| s.addr == *addr)
        {
            return Some((Arc::clone(existing), false));
        }

        let idx = slots.iter().position(|s| s.is_none())?;
        let slot = BackendSlot::new(idx as u32 + 1, addr.clone());
        slots[idx] = Some(Arc::clone(&slot));
        Some((slot, true))
    }

    pub fn get(&self, id: u32) -> Option<Arc<BackendSlot>> {
        let slots = self.slots.lock();
        let idx = (id as usize).wrapping_sub(1);
        slots.get(idx).and_then(|s| s.clone())
    }

    pub fn remove(&self, id: u32) {
        let mut slots = self.slots.lock();
        let idx = (id as usize).wrapping_sub(1);
        if let Some(entry) = slots.get_mut(idx) {
            *entry = None;
        }
    }

    pub fn all(&self) -> Vec<Arc<BackendSlot>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    pub fn connected(&self) -> Vec<Arc<BackendSlot>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| s.is_connected())
            .cloned()
            .collect()
    }
}

/// Where the set of agents to dial comes from.
pub enum BackendSource {
    /// Fixed `host:port` list from the CLI.
    Static(Vec<AgentAddr>),
    /// Live UDP discovery table; expired agents stop being dialed.
    Discovery(Arc<crate::gateway::discovery::DiscoveryTable>),
}

/// Keeps the slot table in sync with the target set and supervises one
/// dial loop per slot.
pub(crate) async fn run_manager(shared: Arc<Shared>, source: BackendSource) {
    let mut supervisors: Vec<(u32, tokio::task::JoinHandle<()>)> = Vec::new();
    let mut sync = tokio::time::interval(Duration::from_secs(2));

    loop {
        sync.tick().await;

        let desired: Vec<AgentAddr> = match &source {
            BackendSource::Static(list) => list.clone(),
            BackendSource::Discovery(table) => table.snapshot(),
        };

        for addr in &desired {
            match shared.backends.ensure(addr) {
                Some((slot, true)) => {
                    info!(backend_id = slot.id, host = %addr.host, port = addr.port, "agent slot allocated");
                    let handle = tokio::spawn(supervise(Arc::clone(&shared), Arc::clone(&slot)));
                    supervisors.push((slot.id, handle));
                }
                Some((_, false)) => {}
                None => warn!(host = %addr.host, port = addr.port, "agent table full, ignoring"),
            }
        }

        // Discovery mode retires slots whose announcements expired and
        // whose link is already down; no further sends are attempted.
        if matches!(&source, BackendSource::Discovery(_)) {
            for slot in shared.backends.all() {
                if !desired.contains(&slot.addr) && !slot.is_connected() {
                    info!(backend_id = slot.id, host = %slot.addr.host, "retiring expired agent slot");
                    if let Some(pos) = supervisors.iter().position(|(id, _)| *id == slot.id) {
                        let (_, handle) = supervisors.swap_remove(pos);
                        handle.abort();
                    }
                    shared.backends.remove(slot.id);
                }
            }
        }

        supervisors.retain(|(_, handle)| !handle.is_finished());
    }
}

/// Dial loop for one agent: connect, service the link, reconnect on an
/// interval after it drops.
async fn supervise(shared: Arc<Shared>, slot: Arc<BackendSlot>) {
    let reconnect = Duration::from_secs(shared.config.reconnect_secs);

    loop {
        match TcpStream::connect((slot.addr.host.as_str(), slot.addr.port)).await {
            Ok(control) => {
                if let Err(e) = control.set_nodelay(true) {
                    debug!(backend_id = slot.id, error = %e, "set_nodelay failed");
                }

                // Data channel is best-effort; an agent without one still
                // serves commands.
                let data = TcpStream::connect((slot.addr.host.as_str(), slot.addr.port + 1))
                    .await
                    .ok();

                info!(
                    backend_id = slot.id,
                    host = %slot.addr.host,
                    port = slot.addr.port,
                    data_channel = data.is_some(),
                    "agent connected"
                );

                slot.set_connected(true);
                run_link(&shared, &slot, control, data).await;
                slot.set_connected(false);
                slot.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                warn!(backend_id = slot.id, "agent link lost");
            }
            Err(e) => {
                debug!(backend_id = slot.id, host = %slot.addr.host, error = %e, "agent dial failed");
            }
        }

        tokio::time::sleep(reconnect).await;
    }
}

/// Services one established control (+ optional data) link until either
/// side fails.
async fn run_link(
    shared: &Arc<Shared>,
    slot: &Arc<BackendSlot>,
    control: TcpStream,
    data: Option<TcpStream>,
) {
    let (mut control_rx, mut control_tx) = control.into_split();

    // Writer drains the priority lanes into the control socket.
    let writer = {
        let slot = Arc::clone(slot);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            loop {
                while let Some(frame) = slot.outbound.pop() {
                    let buf = frame.to_bytes();
                    match control_tx.write_all(&buf).await {
                        Ok(()) => {
                            slot.breaker.lock().record_success();
                            slot.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                            shared
                                .metrics
                                .backend_messages_out
                                .fetch_add(1, Ordering::Relaxed);
                            shared
                                .metrics
                                .backend_bytes_out
                                .fetch_add(buf.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            slot.breaker.lock().record_failure();
                            slot.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(backend_id = slot.id, error = %e, "agent send failed");
                            return;
                        }
                    }
                }
                slot.outbound.ready().await;
            }
        })
    };

    // Data channel: raw encoded bytes, wrapped as broadcast frames.
    let data_reader = data.map(|stream| {
        let slot = Arc::clone(slot);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let (mut rx, _tx) = stream.into_split();
            let mut buf = vec![0u8; DATA_CHUNK];
            loop {
                match rx.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        shared
                            .metrics
                            .backend_bytes_in
                            .fetch_add(n as u64, Ordering::Relaxed);
                        let frame =
                            Frame::new(0, slot.id, Bytes::copy_from_slice(&buf[..n]));
                        router::deliver_to_clients(&shared, frame);
                    }
                    Err(e) => {
                        debug!(backend_id = slot.id, error = %e, "data channel read error");
                        break;
                    }
                }
            }
        })
    });

    // Control reader runs in this task; its exit tears the link down.
    loop {
        match read_frame(&mut control_rx).await {
            Ok(Some(mut frame)) => {
                slot.counters.messages_recv.fetch_add(1, Ordering::Relaxed);
                shared
                    .metrics
                    .backend_messages_in
                    .fetch_add(1, Ordering::Relaxed);

                // Agents that never learned their slot id send 0.
                if frame.header.backend_id == 0 {
                    frame.header.backend_id = slot.id;
                }
                router::deliver_to_clients(shared, frame);
            }
            Ok(None) => {
                debug!(backend_id = slot.id, "agent closed control channel");
                break;
            }
            Err(e) => {
                warn!(backend_id = slot.id, error = %e, "agent control channel error");
                break;
            }
        }
    }

    writer.abort();
    if let Some(handle) = data_reader {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16) -> AgentAddr {
        AgentAddr {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_ensure_allocates_once_per_addr() {
        let table = BackendTable::new(4);
        let (a, created) = table.ensure(&addr("h1", 9090)).unwrap();
        assert!(created);
        assert_eq!(a.id, 1);

        let (b, created) = table.ensure(&addr("h1", 9090)).unwrap();
        assert!(!created);
        assert_eq!(b.id, 1);

        let (c, created) = table.ensure(&addr("h2", 9090)).unwrap();
        assert!(created);
        assert_eq!(c.id, 2);
    }

    #[test]
    fn test_table_full() {
        let table = BackendTable::new(1);
        table.ensure(&addr("h1", 1)).unwrap();
        assert!(table.ensure(&addr("h2", 1)).is_none());
    }

    #[test]
    fn test_try_send_requires_connection() {
        let table = BackendTable::new(1);
        let (slot, _) = table.ensure(&addr("h", 9090)).unwrap();
        let frame = Frame::new(1, slot.id, Bytes::from_static(b"ping"));

        assert!(!slot.try_send(frame.clone()), "disconnected slot refuses");
        slot.set_connected(true);
        assert!(slot.try_send(frame));
        assert_eq!(slot.outbound.len(), 1);
    }

    #[test]
    fn test_try_send_refused_when_circuit_open() {
        let table = BackendTable::new(1);
        let (slot, _) = table.ensure(&addr("h", 9090)).unwrap();
        slot.set_connected(true);

        {
            let mut breaker = slot.breaker.lock();
            for _ in 0..crate::gateway::breaker::FAILURE_THRESHOLD {
                breaker.record_failure();
            }
        }

        let frame = Frame::new(1, slot.id, Bytes::from_static(b"ping"));
        assert!(!slot.try_send(frame));
        assert_eq!(slot.outbound.len(), 0, "refused sends never enqueue");
    }
}
