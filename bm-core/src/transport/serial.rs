//! SmartOS metadata over a serial port
//!
//! Opens the metadata port, puts it in raw mode and asks for a fixed list of
//! keys with [`SerialClient`]. The protocol client itself has no timeout; the
//! port wrapper here bounds every read instead.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use bm_error::{ProtocolError, TransportError};
use bm_protocol::SerialClient;
use tracing::{debug, info, trace, warn};

use crate::constants::metadata;
use crate::context::DetectionContext;
use crate::record::{BlobPayload, RawMetadataBlob};
use crate::transport::Transport;

/// Keys requested from the SmartOS metadata service
pub const SMARTOS_KEYS: &[&str] = &[
    "hostname",
    "root_authorized_keys",
    "sdc:uuid",
    "sdc:datacenter_name",
    "user-data",
    "cloud-init:user-data",
    "user-script",
    "sdc:operator-script",
    "sdc:vendor-data",
    "sdc:nics",
    "sdc:resolvers",
    "sdc:dns_domain",
    "iptables_disable",
    "motd_sys_info",
];

// ============================================================================
// Port
// ============================================================================

/// Serial port whose reads fail with `TimedOut` after a quiet period
pub struct TimedPort {
    file: File,
    timeout: Duration,
}

impl TimedPort {
    pub fn new(file: File, timeout: Duration) -> Self {
        set_raw_mode(&file);
        Self { file, timeout }
    }
}

/// Raw mode so the kernel neither echoes nor translates line endings.
/// Plain files and sockets are left alone.
fn set_raw_mode(file: &File) {
    let fd = file.as_raw_fd();
    // SAFETY: tcgetattr/tcsetattr only touch the termios struct we own
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            trace!("Metadata port is not a tty, leaving settings unchanged");
            return;
        }
        libc::cfmakeraw(&mut tio);
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            debug!(error = %io::Error::last_os_error(), "Failed to set raw mode on metadata port");
        }
    }
}

impl Read for TimedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = self.timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a single valid pollfd for the duration of the call
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        match ready {
            0 => Err(io::Error::new(io::ErrorKind::TimedOut, "no data from metadata port")),
            n if n < 0 => Err(io::Error::last_os_error()),
            _ => self.file.read(buf),
        }
    }
}

impl Write for TimedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct SerialTransport {
    device: PathBuf,
    keys: Vec<String>,
    read_timeout: Duration,
}

impl SerialTransport {
    pub fn new(device: impl Into<PathBuf>, read_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            keys: SMARTOS_KEYS.iter().map(|k| k.to_string()).collect(),
            read_timeout,
        }
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Also ask which values are base64 encoded: `base64_keys`, `base64_all`
    /// and a `b64-<key>` marker for each decodable key not in `no_decode`.
    pub fn with_base64_markers(mut self, no_decode: &[String]) -> Self {
        self.keys.push("base64_keys".to_string());
        self.keys.push("base64_all".to_string());
        self.keys.extend(
            metadata::SMARTOS_BASE64_DECODABLE
                .iter()
                .filter(|key| !no_decode.iter().any(|n| n == *key))
                .map(|key| format!("b64-{}", key)),
        );
        self
    }

    pub fn open(&self) -> Result<TimedPort, TransportError> {
        if !self.device.exists() {
            return Err(TransportError::not_present(self.device.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|e| TransportError::unreachable(format!("open {}: {}", self.device.display(), e)))?;
        Ok(TimedPort::new(file, self.read_timeout))
    }

    /// Request every key once. Per-key failures become warnings; the stream
    /// is abandoned on the first I/O failure.
    pub fn query_keys<S: Read + Write>(
        &self,
        client: &mut SerialClient<S>,
    ) -> Result<RawMetadataBlob, TransportError> {
        let mut values = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut answered = 0usize;
        let mut first_error: Option<ProtocolError> = None;

        for (index, key) in self.keys.iter().enumerate() {
            match client.get(key) {
                Ok(Some(value)) => {
                    answered += 1;
                    values.insert(key.clone(), value);
                }
                Ok(None) => {
                    answered += 1;
                    trace!(key = %key, "Key not set");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Metadata request failed");
                    warnings.push(format!("{}: {}", key, e));
                    let stream_dead = matches!(e, ProtocolError::Io(_) | ProtocolError::ConnectionClosed);
                    first_error.get_or_insert(e);
                    if stream_dead {
                        let skipped = &self.keys[index + 1..];
                        if !skipped.is_empty() {
                            warnings.push(format!("not requested: {}", skipped.join(", ")));
                        }
                        break;
                    }
                }
            }
        }

        if answered == 0 {
            return Err(match first_error {
                Some(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout {
                    what: format!("metadata service on {}", self.device.display()),
                    waited_secs: self.read_timeout.as_secs(),
                },
                Some(e) => TransportError::unreachable(format!("{}: {}", self.device.display(), e)),
                None => TransportError::not_present("no metadata keys requested"),
            });
        }

        info!(device = ?self.device, keys = values.len(), "Retrieved serial metadata");
        let mut blob = RawMetadataBlob::new(self.device.display().to_string(), BlobPayload::Keys(values));
        blob.warnings = warnings;
        Ok(blob)
    }
}

impl Transport for SerialTransport {
    fn fetch(&self, _ctx: &DetectionContext<'_>) -> Result<RawMetadataBlob, TransportError> {
        let port = self.open()?;
        let mut client = SerialClient::new(port);
        self.query_keys(&mut client)
    }
}
