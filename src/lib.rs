//! Remote monitoring agent and WebSocket fan-out gateway
//!
//! Two cooperating processes share this library:
//!
//! - The **agent** captures encoded video from external encoder pipelines,
//!   fans it out through a [`bus::BroadcastBus`], and exposes a
//!   length-framed TCP control channel for commands (stream control,
//!   keylogging, process inventory, input injection).
//! - The **gateway** aggregates N agents and M WebSocket clients in a
//!   single process, routing framed packets by `(client_id, backend_id)`
//!   with three priority lanes, per-agent circuit breakers and per-client
//!   rate/idle policing.
//!
//! Both hops carry the same 12-byte routing header
//! (`payload_len`, `client_id`, `backend_id` in network byte order); see
//! [`protocol::frame`].

pub mod bus;
pub mod cancel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod protocol;
pub mod session;

pub mod agent;
pub mod gateway;

// Re-exports for convenience
pub use bus::{BroadcastBus, SinkStatus, SubscriberStats, VideoPacket};
pub use cancel::{CancellationSource, CancellationToken};
pub use error::AgentError;
pub use protocol::frame::FrameHeader;
pub use protocol::nalu::PacketKind;
pub use session::{SessionState, StreamSession, VideoStreamer};
