//! Blocking request/response client over any byte stream.
//!
//! The client issues one `GET` per call and blocks until a single validated
//! frame arrives. It never retries and has no timeout of its own; callers that
//! need either wrap the stream or the call.

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::frame::Frame;
use crate::{generate_request_id, validate_key, ProtocolError, MAX_FRAME_SIZE};

/// Largest single read issued against the stream
const READ_CHUNK: usize = 4096;

/// Reassembly progress for one incoming frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Reading `V2 <length> <crc> ` one byte at a time
    Header { spaces: u8 },
    /// Declared body plus newline still expected
    Body { remaining: usize },
    /// Declared length ran out before the newline; consume to end of line
    Drain,
    Complete,
}

/// Accumulates bytes from partial reads until one full line is present.
///
/// The declared length bounds how much is requested from the stream, so a
/// well-formed frame is read without touching bytes that follow it. The line
/// always ends at the newline regardless of the declared length, which keeps a
/// misdeclared frame from leaking into the next request.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    buf: Vec<u8>,
    state: ReadState,
}

impl FrameAssembler {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
            state: ReadState::Header { spaces: 0 },
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == ReadState::Complete
    }

    /// Number of bytes to request from the stream next
    pub(crate) fn next_read_len(&self) -> usize {
        match self.state {
            ReadState::Header { .. } | ReadState::Drain => 1,
            ReadState::Body { remaining } => remaining.clamp(1, READ_CHUNK),
            ReadState::Complete => 0,
        }
    }

    /// Feed received bytes; returns how many were consumed.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        for (consumed, &byte) in bytes.iter().enumerate() {
            if self.state == ReadState::Complete {
                return Ok(consumed);
            }
            if self.buf.len() >= MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: self.buf.len() + 1,
                    max_size: MAX_FRAME_SIZE,
                });
            }
            self.buf.push(byte);

            if byte == b'\n' {
                self.state = ReadState::Complete;
                continue;
            }

            self.state = match self.state {
                ReadState::Header { spaces } if byte == b' ' => {
                    if spaces + 1 == 3 {
                        match self.declared_length() {
                            // body bytes plus the terminating newline
                            Some(len) if len < MAX_FRAME_SIZE => ReadState::Body { remaining: len + 1 },
                            _ => ReadState::Drain,
                        }
                    } else {
                        ReadState::Header { spaces: spaces + 1 }
                    }
                }
                ReadState::Body { remaining } if remaining <= 1 => ReadState::Drain,
                ReadState::Body { remaining } => ReadState::Body {
                    remaining: remaining - 1,
                },
                other => other,
            };
        }
        Ok(bytes.len())
    }

    fn declared_length(&self) -> Option<usize> {
        let header = std::str::from_utf8(&self.buf).ok()?;
        header.split(' ').nth(1)?.parse().ok()
    }

    pub(crate) fn into_line(self) -> Vec<u8> {
        self.buf
    }
}

fn parse_json<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw)
        .map_err(|e| ProtocolError::Payload(format!("{} is not valid JSON: {}", key, e)))
}

/// Serial metadata client
pub struct SerialClient<S> {
    stream: S,
}

impl<S: Read + Write> SerialClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Fetch `key`; `Ok(None)` when the service reports it absent
    pub fn get(&mut self, key: &str) -> Result<Option<String>, ProtocolError> {
        self.request(key, generate_request_id())
    }

    /// Fetch `key` and decode its value as JSON
    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, ProtocolError> {
        self.get(key)?.map(|raw| parse_json(key, &raw)).transpose()
    }

    /// Perform one request/response exchange with an explicit request id
    pub fn request(&mut self, key: &str, request_id: u32) -> Result<Option<String>, ProtocolError> {
        validate_key(key).map_err(ProtocolError::Payload)?;

        let line = Frame::get(request_id, key).encode();
        trace!(key, request_id = %format!("{:08x}", request_id), "Sending metadata request");
        self.stream.write_all(&line)?;
        self.stream.flush()?;

        let response = self.read_frame()?;
        let frame = Frame::decode(&response, request_id)?;
        let value = frame.into_value()?;
        debug!(key, found = value.is_some(), "Metadata request complete");
        Ok(value)
    }

    /// Block until one newline-terminated frame has been received
    fn read_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut assembler = FrameAssembler::new();
        let mut chunk = [0u8; READ_CHUNK];

        while !assembler.is_complete() {
            let want = assembler.next_read_len();
            let n = match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let used = assembler.push(&chunk[..n])?;
            if used < n {
                trace!(discarded = n - used, "Dropping bytes received after frame terminator");
            }
        }

        Ok(assembler.into_line())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
