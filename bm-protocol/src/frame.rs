//! Frame encoding and validation.
//!
//! One frame is one newline-terminated line:
//!
//! ```text
//! V2 <length> <crc32> <request_id> <command>[ <payload>]\n
//! ```
//!
//! `length` and `crc32` both cover the body, i.e. everything from the request id
//! to the end of the line (exclusive of the newline).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::crc::{crc32, format_crc};
use crate::ProtocolError;

/// Protocol version token leading every frame
pub const PROTOCOL_VERSION: &str = "V2";

/// Response command for a present key
pub const CMD_SUCCESS: &str = "SUCCESS";

/// Response command for an absent key
pub const CMD_NOTFOUND: &str = "NOTFOUND";

/// Request command
pub const CMD_GET: &str = "GET";

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u32,
    pub command: String,
    /// Base64 text exactly as carried on the wire
    pub payload: Option<String>,
}

impl Frame {
    /// Build a `GET` request for `key`
    pub fn get(request_id: u32, key: &str) -> Self {
        Self {
            request_id,
            command: CMD_GET.to_string(),
            payload: Some(STANDARD.encode(key.as_bytes())),
        }
    }

    /// The checksummed part of the frame
    pub fn body(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{:08x} {} {}", self.request_id, self.command, payload),
            None => format!("{:08x} {}", self.request_id, self.command),
        }
    }

    /// Serialize to wire bytes, including the trailing newline
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        format!(
            "{} {} {} {}\n",
            PROTOCOL_VERSION,
            body.len(),
            format_crc(crc32(body.as_bytes())),
            body
        )
        .into_bytes()
    }

    /// Parse and validate one received line against the outstanding request id.
    ///
    /// Checks run in a fixed order: structure, length, checksum, request id.
    pub fn decode(line: &[u8], expected_request_id: u32) -> Result<Self, ProtocolError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = std::str::from_utf8(line)
            .map_err(|_| ProtocolError::Structure("frame is not valid ASCII".to_string()))?;

        let mut head = line.splitn(4, ' ');
        let version = head.next().unwrap_or_default();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Structure(format!(
                "unsupported protocol version {:?}",
                version
            )));
        }
        let declared_length: usize = head
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::Structure("missing or invalid length".to_string()))?;
        let declared_crc = head
            .next()
            .and_then(parse_hex8)
            .ok_or_else(|| ProtocolError::Structure("missing or invalid checksum".to_string()))?;
        let body = head
            .next()
            .ok_or_else(|| ProtocolError::Structure("missing frame body".to_string()))?;

        let mut fields = body.splitn(3, ' ');
        let request_id = fields
            .next()
            .and_then(parse_hex8)
            .ok_or_else(|| ProtocolError::Structure("missing or invalid request id".to_string()))?;
        let command = match fields.next() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => return Err(ProtocolError::Structure("missing command".to_string())),
        };
        let payload = fields.next().map(str::to_string);

        if declared_length != body.len() {
            return Err(ProtocolError::Length {
                declared: declared_length,
                measured: body.len(),
            });
        }

        let computed_crc = crc32(body.as_bytes());
        if computed_crc != declared_crc {
            return Err(ProtocolError::Checksum {
                declared: format_crc(declared_crc),
                computed: format_crc(computed_crc),
            });
        }

        if request_id != expected_request_id {
            return Err(ProtocolError::RequestIdMismatch {
                expected: format!("{:08x}", expected_request_id),
                actual: format!("{:08x}", request_id),
            });
        }

        Ok(Self {
            request_id,
            command,
            payload,
        })
    }

    /// Interpret a response frame: `Some(value)` for SUCCESS, `None` for NOTFOUND
    pub fn into_value(self) -> Result<Option<String>, ProtocolError> {
        match self.command.as_str() {
            CMD_SUCCESS => {
                let Some(payload) = self.payload else {
                    return Ok(Some(String::new()));
                };
                let bytes = STANDARD
                    .decode(payload.as_bytes())
                    .map_err(|e| ProtocolError::Payload(format!("invalid base64: {}", e)))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| ProtocolError::Payload(format!("value is not UTF-8: {}", e)))
            }
            CMD_NOTFOUND => Ok(None),
            other => Err(ProtocolError::UnexpectedCommand(other.to_string())),
        }
    }
}

/// Parse exactly eight hex digits
fn parse_hex8(s: &str) -> Option<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}
