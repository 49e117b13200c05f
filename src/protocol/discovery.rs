//! UDP service discovery wire format
//!
//! Agents announce themselves on UDP port 9999 with a fixed-size packed
//! packet, all integers network byte order:
//!
//! ```text
//! 0   : u32 magic
//! 4   : u32 version
//! 8   : u32 service_port
//! 12  : [u8; 64] service_name        (nul-padded UTF-8)
//! 76  : u32 capabilities
//! 80  : [u8; 64] advertised_hostname (nul-padded; empty => sender IP)
//! ```
//!
//! Two magics exist in deployed agents; the gateway accepts both. New
//! announcements always carry `MAGIC` ("GATE").

use thiserror::Error;

pub const DISCOVERY_PORT: u16 = 9999;

/// "GATE", emitted by current agents.
pub const MAGIC: u32 = 0x4741_5445;
/// Emitted by older captured agents; still accepted.
pub const LEGACY_MAGIC: u32 = 0xCAFE_1234;

pub const VERSION: u32 = 1;

/// Packed size: 3 u32 fields, two 64-byte name fields, one u32 between.
pub const ANNOUNCEMENT_LEN: usize = 144;

const NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("packet too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("service port {0} out of range")]
    BadPort(u32),
}

/// A decoded agent announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub version: u32,
    pub service_port: u16,
    pub service_name: String,
    pub capabilities: u32,
    /// Empty string means "use the UDP sender address".
    pub advertised_host: String,
}

fn write_padded(buf: &mut [u8], text: &str) {
    // Truncate to NAME_LEN - 1 so the field is always nul-terminated.
    let bytes = text.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn read_padded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Announcement {
    pub fn new(service_port: u16, service_name: &str, advertised_host: &str) -> Self {
        Announcement {
            version: VERSION,
            service_port,
            service_name: service_name.to_string(),
            capabilities: 0,
            advertised_host: advertised_host.to_string(),
        }
    }

    pub fn encode(&self) -> [u8; ANNOUNCEMENT_LEN] {
        let mut buf = [0u8; ANNOUNCEMENT_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.service_port as u32).to_be_bytes());
        write_padded(&mut buf[12..12 + NAME_LEN], &self.service_name);
        buf[76..80].copy_from_slice(&self.capabilities.to_be_bytes());
        write_padded(&mut buf[80..80 + NAME_LEN], &self.advertised_host);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, DiscoveryError> {
        if data.len() < ANNOUNCEMENT_LEN {
            return Err(DiscoveryError::Truncated(data.len()));
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC && magic != LEGACY_MAGIC {
            return Err(DiscoveryError::BadMagic(magic));
        }

        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let raw_port = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        if raw_port == 0 || raw_port > u16::MAX as u32 {
            return Err(DiscoveryError::BadPort(raw_port));
        }

        let service_name = read_padded(&data[12..12 + NAME_LEN]);
        let capabilities = u32::from_be_bytes([data[76], data[77], data[78], data[79]]);
        let advertised_host = read_padded(&data[80..80 + NAME_LEN]);

        Ok(Announcement {
            version,
            service_port: raw_port as u16,
            service_name,
            capabilities,
            advertised_host,
        })
    }
}
