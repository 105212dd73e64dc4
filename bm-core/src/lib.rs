//! bootmeta Core Library
//!
//! Early-boot platform detection and instance metadata acquisition.
//!
//! # Features
//!
//! - **Platform Selection**: Firmware, file and volume evidence scored per platform under an operator policy
//! - **Transports**: Polled metadata trees, the serial framed protocol and mounted provisioning volumes
//! - **Parsers**: Azure, OVF, SmartOS and EC2-style (EC2, Alibaba Cloud) metadata
//! - **Network Config**: Canonical version-1 network configuration from platform NIC descriptions
//! - **Config Layers**: builtin < platform < operator merge
//!
//! # Module Structure
//!
//! - `transport/` - Reaching platform metadata
//! - `parsers/` - Decoding it
//! - `orchestrator` - The boot pipeline tying selection, transports and parsers together
//!
//! # Example
//!
//! ```no_run
//! use bm_core::{
//!     load_settings, settings_path, DetectionContext, LinuxDevices, Orchestrator, SysfsFirmware,
//!     SysfsInterfaces, SystemClock, SystemCommandRunner,
//! };
//!
//! let settings = load_settings(&settings_path()).unwrap();
//! let firmware = SysfsFirmware::new("/");
//! let devices = LinuxDevices::new(SystemCommandRunner, "/run/bootmeta/mnt");
//! let interfaces = SysfsInterfaces::new("/");
//! let clock = SystemClock::new();
//! let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);
//!
//! let metadata = Orchestrator::new(&settings).run(&ctx).unwrap();
//! println!("{:?}", metadata.instance_id());
//! ```

// Grouped modules
pub mod parsers;
pub mod transport;

// Standalone modules
pub mod cache;
pub mod capabilities;
pub mod constants;
pub mod context;
pub mod merge;
pub mod netconfig;
pub mod orchestrator;
pub mod platforms;
pub mod record;
pub mod redact;
pub mod selector;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export capabilities
pub use capabilities::{
    with_mounted, BlockDevices, Clock, CommandRunner, DeviceQuery, FirmwareField, FirmwareInfo,
    HostInterface, InterfaceEnumerator, LinuxDevices, SysfsFirmware, SysfsInterfaces, SystemClock,
    SystemCommandRunner,
};
pub use context::DetectionContext;

// Re-export pipeline types
pub use netconfig::{fallback, synthesize, DnsInfo, NetworkConfig, NicDescriptor, Synthesis, SynthesisInput};
pub use orchestrator::{claim_first, Attempt, BootMetadata, Candidate, Orchestrator};
pub use platforms::{builtin_selector, PlatformKind};
pub use record::{BlobPayload, MetadataRecord, MetadataValue, ParsedMetadata, RawMetadataBlob};
pub use selector::{PlatformSelector, PlatformSignature, Policy, SelectionResult, SelectionState};

// Re-export settings functions
pub use settings::{load_settings, settings_path, validate_settings, Settings};

// Re-export error types
pub use bm_error::{BootmetaError, ParseError, Result, SelectionError, TransportError};
