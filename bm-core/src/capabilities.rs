//! Host capabilities
//!
//! Everything bootmeta needs from the machine it runs on sits behind a trait
//! here: firmware strings, block devices and mounts, external commands,
//! network interfaces and the clock. Linux implementations read sysfs and
//! shell out to `blkid`/`mount`; tests substitute their own.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use bm_error::{BootmetaError, Result, TransportError};
use tracing::{debug, trace, warn};

use crate::constants::paths;

// ============================================================================
// Firmware
// ============================================================================

/// Firmware/DMI attributes consulted during detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FirmwareField {
    ChassisAssetTag,
    ProductName,
    ProductSerial,
    ProductUuid,
    SysVendor,
    HypervisorUuid,
}

impl FirmwareField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChassisAssetTag => "chassis_asset_tag",
            Self::ProductName => "product_name",
            Self::ProductSerial => "product_serial",
            Self::ProductUuid => "product_uuid",
            Self::SysVendor => "sys_vendor",
            Self::HypervisorUuid => "hypervisor_uuid",
        }
    }

    /// Location relative to the filesystem root
    fn relative_path(&self) -> PathBuf {
        match self {
            Self::HypervisorUuid => PathBuf::from(paths::HYPERVISOR_UUID),
            other => Path::new(paths::DMI_DIR).join(other.as_str()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait FirmwareInfo {
    /// Read a firmware string; `None` when absent, unreadable or empty
    fn read(&self, field: FirmwareField) -> Option<String>;
}

/// Reads DMI attributes from sysfs
pub struct SysfsFirmware {
    root: PathBuf,
}

impl SysfsFirmware {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FirmwareInfo for SysfsFirmware {
    fn read(&self, field: FirmwareField) -> Option<String> {
        let path = self.root.join(field.relative_path());
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let value = raw.trim().to_string();
                trace!(field = field.as_str(), value = %value, "Read firmware field");
                (!value.is_empty()).then_some(value)
            }
            Err(e) => {
                trace!(path = ?path, error = %e, "Firmware field unavailable");
                None
            }
        }
    }
}

// ============================================================================
// External Commands
// ============================================================================

#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner {
    /// Run `program` with `args` and return its stdout on success
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands with `std::process::Command`
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| BootmetaError::command(program, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BootmetaError::command(
                format!("{} {}", program, args.join(" ")),
                format!("{} ({})", stderr, output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ============================================================================
// Block Devices
// ============================================================================

/// How candidate devices are selected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceQuery {
    FsType(String),
    Label(String),
}

/// An established mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub device: String,
    pub mountpoint: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
pub trait BlockDevices {
    /// Devices matching `query`, in the order the system reports them
    fn list_candidates(&self, query: &DeviceQuery) -> Vec<String>;

    /// Mount `device` read-only. A device that vanished reports `Ejected`.
    fn mount(&self, device: &str, fstype: Option<String>) -> std::result::Result<MountHandle, TransportError>;

    fn unmount(&self, handle: &MountHandle);
}

/// Releases a mount when dropped
struct MountGuard<'a> {
    devices: &'a dyn BlockDevices,
    handle: MountHandle,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        trace!(device = %self.handle.device, "Releasing mount");
        self.devices.unmount(&self.handle);
    }
}

/// Mount `device`, run `f` against its root and unmount on every exit path.
pub fn with_mounted<T, F>(
    devices: &dyn BlockDevices,
    device: &str,
    fstype: Option<&str>,
    f: F,
) -> std::result::Result<T, TransportError>
where
    F: FnOnce(&Path) -> T,
{
    let handle = devices.mount(device, fstype.map(str::to_string))?;
    let guard = MountGuard { devices, handle };
    Ok(f(&guard.handle.mountpoint))
}

/// Block devices via `blkid` and `mount`
pub struct LinuxDevices<R: CommandRunner> {
    runner: R,
    mount_root: PathBuf,
}

impl<R: CommandRunner> LinuxDevices<R> {
    pub fn new(runner: R, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_root: mount_root.into(),
        }
    }
}

/// `/dev/sr0` -> `dev-sr0`
fn mount_dir_name(device: &str) -> String {
    device
        .trim_start_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

impl<R: CommandRunner> BlockDevices for LinuxDevices<R> {
    fn list_candidates(&self, query: &DeviceQuery) -> Vec<String> {
        let token = match query {
            DeviceQuery::FsType(t) => format!("TYPE={}", t),
            DeviceQuery::Label(l) => format!("LABEL={}", l),
        };
        let args = vec!["-t".to_string(), token, "-o".to_string(), "device".to_string()];
        match self.runner.run("blkid", &args) {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                // blkid exits non-zero when nothing matches
                debug!(query = ?query, error = %e, "No devices reported");
                Vec::new()
            }
        }
    }

    fn mount(&self, device: &str, fstype: Option<String>) -> std::result::Result<MountHandle, TransportError> {
        if !Path::new(device).exists() {
            return Err(TransportError::Ejected(format!("{} is no longer present", device)));
        }

        let mountpoint = self.mount_root.join(mount_dir_name(device));
        fs::create_dir_all(&mountpoint).map_err(|e| {
            TransportError::unreachable(format!("cannot create {}: {}", mountpoint.display(), e))
        })?;

        let mut args = vec!["-o".to_string(), "ro".to_string()];
        if let Some(fstype) = fstype {
            args.push("-t".to_string());
            args.push(fstype);
        }
        args.push(device.to_string());
        args.push(mountpoint.display().to_string());

        if let Err(e) = self.runner.run("mount", &args) {
            let _ = fs::remove_dir(&mountpoint);
            let reason = e.to_string();
            if reason.to_ascii_lowercase().contains("no medium") {
                return Err(TransportError::Ejected(format!("{}: {}", device, reason)));
            }
            return Err(TransportError::unreachable(format!("mount {}: {}", device, reason)));
        }

        debug!(device, mountpoint = ?mountpoint, "Mounted candidate volume");
        Ok(MountHandle {
            device: device.to_string(),
            mountpoint,
        })
    }

    fn unmount(&self, handle: &MountHandle) {
        let args = vec![handle.mountpoint.display().to_string()];
        if let Err(e) = self.runner.run("umount", &args) {
            warn!(device = %handle.device, error = %e, "Failed to unmount volume");
            return;
        }
        let _ = fs::remove_dir(&handle.mountpoint);
    }
}

// ============================================================================
// Network Interfaces
// ============================================================================

/// A network interface present on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub mac: String,
    pub driver: Option<String>,
    /// PCI device id, e.g. `0x1004`
    pub device_id: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait InterfaceEnumerator {
    /// Interface name currently holding `mac`
    fn resolve(&self, mac: &str) -> Option<String>;

    /// Kernel driver bound to interface `name`
    fn driver_of(&self, name: &str) -> Option<String>;

    /// Interfaces with a hardware address, sorted by name, loopback excluded
    fn list(&self) -> Vec<HostInterface>;
}

/// Interfaces from `/sys/class/net`
pub struct SysfsInterfaces {
    root: PathBuf,
}

impl SysfsInterfaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn net_dir(&self) -> PathBuf {
        self.root.join(paths::NET_CLASS_DIR)
    }
}

impl SysfsInterfaces {
    fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.net_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != "lo")
            .collect();
        names.sort();
        names
    }

    fn attribute(&self, name: &str, attr: &str) -> Option<String> {
        let value = fs::read_to_string(self.net_dir().join(name).join(attr)).ok()?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

impl InterfaceEnumerator for SysfsInterfaces {
    fn resolve(&self, mac: &str) -> Option<String> {
        self.names().into_iter().find(|name| {
            self.attribute(name, "address")
                .is_some_and(|addr| addr.eq_ignore_ascii_case(mac))
        })
    }

    fn driver_of(&self, name: &str) -> Option<String> {
        let link = fs::read_link(self.net_dir().join(name).join("device/driver")).ok()?;
        link.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    fn list(&self) -> Vec<HostInterface> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                let mac = self
                    .attribute(&name, "address")
                    .filter(|mac| mac != "00:00:00:00:00:00")?;
                Some(HostInterface {
                    driver: self.driver_of(&name),
                    device_id: self.attribute(&name, "device/device"),
                    mac,
                    name,
                })
            })
            .collect()
    }
}

// ============================================================================
// Clock
// ============================================================================

pub trait Clock {
    /// Monotonic time since the clock was created
    fn elapsed(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Poll `attempt` until it yields a value or `max_wait` has passed.
///
/// At least one attempt is always made. Returns `None` on timeout.
pub fn wait_until<T>(
    clock: &dyn Clock,
    max_wait: Duration,
    interval: Duration,
    mut attempt: impl FnMut() -> Option<T>,
) -> Option<T> {
    let start = clock.elapsed();
    loop {
        if let Some(value) = attempt() {
            return Some(value);
        }
        let waited = clock.elapsed().saturating_sub(start);
        if waited >= max_wait {
            return None;
        }
        clock.sleep(interval.min(max_wait - waited));
    }
}
