//! Wire formats shared by agent, gateway and clients

pub mod discovery;
pub mod frame;
pub mod nalu;

/// One-byte stream tag prefixed to video callback payloads. The gateway is
/// agnostic to the tag; it is end-to-end between agent and client.
pub mod tag {
    pub const TEXT: u8 = 0;
    pub const MONITOR: u8 = 1;
    pub const WEBCAM: u8 = 2;
}
