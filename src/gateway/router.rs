//! Routing rules between client slots and agent slots
//!
//! `client_id = 0` fans out to every Active client with the id rewritten
//! per target; `backend_id = 0` mirrors that toward agents. Unicast goes
//! to slot `id - 1` when bound. Copies are cheap: the payload is a shared
//! `Bytes`, only the 12-byte header differs per target.

use tracing::debug;

use crate::gateway::Shared;
use crate::protocol::frame::{Frame, BROADCAST_BACKEND, BROADCAST_CLIENT};

/// Delivers an agent-originated frame to its client(s). Returns how many
/// clients accepted it.
pub fn deliver_to_clients(shared: &Shared, frame: Frame) -> usize {
    if frame.header.client_id == BROADCAST_CLIENT {
        let mut delivered = 0;
        for slot in shared.clients.active() {
            let mut copy = frame.clone();
            copy.header.client_id = slot.id;
            if slot.enqueue(copy) {
                delivered += 1;
            }
        }
        delivered
    } else {
        match shared.clients.get(frame.header.client_id) {
            Some(slot) if slot.is_active() => {
                if slot.enqueue(frame) {
                    1
                } else {
                    0
                }
            }
            _ => {
                debug!(
                    client_id = frame.header.client_id,
                    "dropping frame for unbound client slot"
                );
                0
            }
        }
    }
}

/// Delivers a client-originated frame to its agent(s). Returns how many
/// agents accepted it; circuit-open and disconnected agents refuse.
pub fn deliver_to_backends(shared: &Shared, frame: Frame) -> usize {
    if frame.header.backend_id == BROADCAST_BACKEND {
        let mut delivered = 0;
        for slot in shared.backends.connected() {
            let mut copy = frame.clone();
            copy.header.backend_id = slot.id;
            if slot.try_send(copy) {
                delivered += 1;
            }
        }
        delivered
    } else {
        match shared.backends.get(frame.header.backend_id) {
            Some(slot) => {
                if slot.try_send(frame) {
                    1
                } else {
                    0
                }
            }
            None => {
                debug!(
                    backend_id = frame.header.backend_id,
                    "dropping frame for unknown agent slot"
                );
                0
            }
        }
    }
}
