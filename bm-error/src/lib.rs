//! Unified error handling for bootmeta
//!
//! This crate provides the error taxonomy shared by every bootmeta component:
//! one top-level error type plus the per-stage errors that decide whether the
//! boot attempt moves on to the next candidate platform or stops.

use std::io;
use std::path::PathBuf;

/// Result type alias using BootmetaError
pub type Result<T> = std::result::Result<T, BootmetaError>;

// ============================================================================
// Stage Errors
// ============================================================================

/// Failure of a metadata transport. Every variant is recoverable: the caller
/// tries the next candidate platform.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Metadata source unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },

    #[error("Metadata source not present: {0}")]
    NotPresent(String),

    /// Media disappeared after a previous successful read
    #[error("Metadata media ejected: {0}")]
    Ejected(String),
}

impl TransportError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn not_present(msg: impl Into<String>) -> Self {
        Self::NotPresent(msg.into())
    }
}

/// Failure of a metadata parser.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The structural marker of the platform is absent; try the next candidate
    #[error("Not this platform: {0}")]
    NotThisPlatform(String),

    /// The marker matched but the content is invalid; the platform stays claimed
    #[error("Malformed metadata: {0}")]
    Malformed(String),
}

impl ParseError {
    pub fn not_this_platform(msg: impl Into<String>) -> Self {
        Self::NotThisPlatform(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether this error must stop candidate evaluation
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Failure of a single serial protocol request.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("Serial transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial transport closed before a complete frame arrived")]
    ConnectionClosed,

    #[error("Malformed frame: {0}")]
    Structure(String),

    #[error("Frame too large: {size} bytes (max {max_size} bytes)")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Incorrect frame length: declared {declared}, measured {measured}")]
    Length { declared: usize, measured: usize },

    #[error("Invalid checksum: declared {declared}, computed {computed}")]
    Checksum { declared: String, computed: String },

    #[error("Request ID mismatch: expected {expected}, got {actual}")]
    RequestIdMismatch { expected: String, actual: String },

    #[error("Unexpected response command: {0}")]
    UnexpectedCommand(String),

    #[error("Invalid response payload: {0}")]
    Payload(String),
}

/// Outcome of platform selection that leaves no platform to run.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Platform selection ambiguous: {}", .0.join(", "))]
    Ambiguous(Vec<String>),

    #[error("No platform identified")]
    NotFound,
}

// ============================================================================
// Unified Error
// ============================================================================

/// Unified error type for all bootmeta operations
#[derive(thiserror::Error, Debug)]
pub enum BootmetaError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Boot Pipeline Errors
    // ============================================================================
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{platform}: {source}")]
    Parse { platform: String, source: ParseError },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No candidate platform produced metadata (tried: {})", .tried.join(", "))]
    Exhausted { tried: Vec<String> },

    // ============================================================================
    // Capability Errors
    // ============================================================================
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl BootmetaError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error attributed to a platform
    pub fn parse(platform: impl Into<String>, source: ParseError) -> Self {
        Self::Parse {
            platform: platform.into(),
            source,
        }
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

// Allow converting from String to BootmetaError
impl From<String> for BootmetaError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to BootmetaError
impl From<&str> for BootmetaError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
