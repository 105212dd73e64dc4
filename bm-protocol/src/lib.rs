//! Serial framed metadata protocol
//!
//! Line-oriented request/response protocol spoken with the metadata service at
//! the far end of a serial port. Every frame carries a length, a CRC-32 and a
//! request id; responses are trusted only after all three have been checked.

mod client;
mod crc;
mod frame;

pub use bm_error::ProtocolError;
pub use client::SerialClient;
pub use crc::{crc32, format_crc};
pub use frame::{Frame, CMD_GET, CMD_NOTFOUND, CMD_SUCCESS, PROTOCOL_VERSION};

/// Maximum accepted frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum key length accepted for a request
const MAX_KEY_LENGTH: usize = 256;

/// Generate a random request id for correlation
pub fn generate_request_id() -> u32 {
    rand::random::<u32>()
}

/// Validate a metadata key before it is put on the wire
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Key cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(format!("Key too long (max {} characters)", MAX_KEY_LENGTH));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err("Key contains control characters".to_string());
    }
    Ok(())
}
