//! Built-in platforms
//!
//! Binds each supported platform to its signature, transport, parser and
//! cache directory.

use std::fmt;
use std::path::PathBuf;

use bm_error::{BootmetaError, ParseError, Result, TransportError};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::capabilities::FirmwareField;
use crate::constants::{metadata, paths, signatures, volumes};
use crate::context::DetectionContext;
use crate::parsers::{AzureParser, Ec2Parser, OvfParser, Parser, SmartOsParser};
use crate::record::{BlobPayload, MetadataRecord, ParsedMetadata, RawMetadataBlob};
use crate::selector::{MatchOutcome, PlatformSelector, PlatformSignature, Predicate, FALLBACK_PLATFORM};
use crate::settings::{Settings, TreeSettings};
use crate::transport::{Ec2Transport, SerialTransport, Transport, VolumeReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlatformKind {
    SmartOs,
    Azure,
    AliYun,
    Ec2,
    Ovf,
    /// No-op fallback: empty metadata, builtin config only
    None,
}

impl PlatformKind {
    /// Detectable platforms in registration order
    pub const ALL: [PlatformKind; 5] = [Self::SmartOs, Self::Azure, Self::AliYun, Self::Ec2, Self::Ovf];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SmartOs => "SmartOS",
            Self::Azure => "Azure",
            Self::AliYun => "AliYun",
            Self::Ec2 => "Ec2",
            Self::Ovf => "OVF",
            Self::None => FALLBACK_PLATFORM,
        }
    }

    /// Case-insensitive lookup by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .chain(std::iter::once(&Self::None))
            .find(|kind| kind.name().eq_ignore_ascii_case(name.trim()))
            .copied()
    }

    /// Evidence identifying this platform; `None` for the fallback
    pub fn signature(&self, settings: &Settings) -> Option<PlatformSignature> {
        let signature = PlatformSignature::new(self.name());
        let signature = match self {
            Self::SmartOs => signature.check(
                Predicate::firmware_prefix(FirmwareField::ProductName, signatures::SMARTOS_PRODUCT_PREFIX, true),
                MatchOutcome::Match,
            ),
            Self::Azure => signature
                .check(
                    Predicate::firmware_equals(FirmwareField::ChassisAssetTag, signatures::AZURE_CHASSIS_ASSET_TAG),
                    MatchOutcome::Match,
                )
                .check(
                    Predicate::FileExists(self.seed_dir(settings).join(volumes::AZURE_ENV_NAMES[0])),
                    MatchOutcome::Match,
                ),
            Self::AliYun => lenient(
                signature.check(
                    Predicate::firmware_equals(FirmwareField::ProductName, signatures::ALIYUN_PRODUCT_NAME),
                    MatchOutcome::Match,
                ),
                &settings.aliyun,
            ),
            Self::Ec2 => lenient(
                signature
                    .check(
                        Predicate::Any(vec![
                            Predicate::firmware_prefix(FirmwareField::HypervisorUuid, signatures::EC2_UUID_PREFIX, true),
                            Predicate::All(vec![
                                Predicate::firmware_prefix(FirmwareField::ProductUuid, signatures::EC2_UUID_PREFIX, true),
                                Predicate::FirmwareFieldsEqual(FirmwareField::ProductUuid, FirmwareField::ProductSerial),
                            ]),
                        ]),
                        MatchOutcome::Match,
                    )
                    .check(
                        Predicate::firmware_suffix(FirmwareField::ProductSerial, signatures::BRIGHTBOX_SERIAL_SUFFIX, true),
                        MatchOutcome::Match,
                    ),
                &settings.ec2,
            ),
            Self::Ovf => signature
                .check(
                    Predicate::FileExists(self.seed_dir(settings).join(volumes::OVF_ENV_NAMES[0])),
                    MatchOutcome::Match,
                )
                .check(
                    Predicate::VolumeMarker {
                        fstype: "iso9660".to_string(),
                        marker: volumes::OVF_ENV_NAMES[0].to_string(),
                    },
                    MatchOutcome::Maybe,
                ),
            Self::None => return None,
        };
        Some(signature)
    }

    /// Per-platform seed directory
    pub fn seed_dir(&self, settings: &Settings) -> PathBuf {
        settings.seed_dir.join(self.name().to_ascii_lowercase())
    }

    /// Where documents from this platform are cached between boots
    pub fn cache_dir(&self, settings: &Settings) -> PathBuf {
        match self {
            Self::Azure => settings
                .azure
                .data_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(paths::AZURE_DATA_DIR)),
            Self::Ovf => settings
                .ovf
                .data_dir
                .clone()
                .unwrap_or_else(|| settings.cache_dir.join("ovf")),
            other => settings.cache_dir.join(other.name().to_ascii_lowercase()),
        }
    }

    pub fn transport(&self, settings: &Settings) -> Result<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match self {
            Self::SmartOs => Box::new(
                SerialTransport::new(settings.smartos.device.clone(), settings.smartos.read_timeout())
                    .with_base64_markers(&settings.smartos.no_base64_decode),
            ),
            Self::Azure => {
                let fstypes = or_default(&settings.azure.fstypes, &["udf", "iso9660"]);
                let mut reader = VolumeReader::new(&fstypes, self.cache_dir(settings), volumes::AZURE_ENV_NAMES)
                    .with_seed_dir(self.seed_dir(settings));
                if let Some(pattern) = &settings.azure.device_pattern {
                    reader = reader.with_device_filter(compile(pattern)?);
                }
                Box::new(reader)
            }
            Self::AliYun => Box::new(Ec2Transport::from_settings(
                self.seed_dir(settings),
                &settings.aliyun,
                metadata::ALIYUN_METADATA_URLS,
                metadata::ALIYUN_API_VERSION,
            )),
            Self::Ec2 => Box::new(Ec2Transport::from_settings(
                self.seed_dir(settings),
                &settings.ec2,
                metadata::EC2_METADATA_URLS,
                metadata::EC2_API_VERSION,
            )),
            Self::Ovf => {
                let fstypes = or_default(&settings.ovf.fstypes, &["iso9660"]);
                let pattern = settings
                    .ovf
                    .device_pattern
                    .as_deref()
                    .unwrap_or(volumes::CDROM_DEVICE_PATTERN);
                Box::new(
                    VolumeReader::new(&fstypes, self.cache_dir(settings), volumes::OVF_ENV_NAMES)
                        .with_seed_dir(self.seed_dir(settings))
                        .with_device_filter(compile(pattern)?),
                )
            }
            Self::None => Box::new(NoneTransport),
        };
        Ok(transport)
    }

    pub fn parser(&self, settings: &Settings) -> Box<dyn Parser> {
        match self {
            Self::SmartOs => Box::new(SmartOsParser::new(&settings.smartos, self.cache_dir(settings))),
            Self::Azure => Box::new(AzureParser),
            Self::AliYun | Self::Ec2 => Box::new(Ec2Parser),
            Self::Ovf => Box::new(OvfParser),
            Self::None => Box::new(NoneParser),
        }
    }

    /// Firmware field holding the instance id, preferred over the document's
    pub fn instance_id_field(&self) -> Option<FirmwareField> {
        match self {
            Self::Azure => Some(FirmwareField::ProductUuid),
            _ => None,
        }
    }

    /// Whether a claim without NIC metadata gets DHCP fallback networking
    pub fn network_fallback(&self) -> bool {
        matches!(self, Self::Azure)
    }

    /// Config layered between the builtin defaults and the parsed overrides
    pub fn default_config(&self) -> Value {
        match self {
            Self::SmartOs => json!({
                "disk_setup": {
                    "ephemeral0": {"table_type": "mbr", "layout": false, "overwrite": false},
                },
                "fs_setup": [{"label": "ephemeral0", "filesystem": "ext3", "device": "ephemeral0"}],
                "datasource": {self.name(): {"disk_aliases": {"ephemeral0": "/dev/vdb"}}},
            }),
            Self::Azure => json!({
                "disk_setup": {
                    "ephemeral0": {"table_type": "gpt", "layout": [100], "overwrite": true},
                },
                "fs_setup": [{"filesystem": "ext4", "device": "ephemeral0.1"}],
                "datasource": {self.name(): {"disk_aliases": {"ephemeral0": paths::AZURE_RESOURCE_DISK}}},
            }),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// With `strict_id` off the platform is always worth a try
fn lenient(signature: PlatformSignature, settings: &TreeSettings) -> PlatformSignature {
    if settings.strict_id {
        signature
    } else {
        signature.check(Predicate::Always, MatchOutcome::Maybe)
    }
}

fn or_default(configured: &[String], fallback: &[&str]) -> Vec<String> {
    if configured.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        configured.to_vec()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| BootmetaError::config(format!("Invalid device pattern '{}': {}", pattern, e)))
}

/// Selector with every detectable platform, limited to the operator's list when one is set
pub fn builtin_selector(settings: &Settings) -> PlatformSelector {
    let mut selector = PlatformSelector::new();
    for kind in PlatformKind::ALL {
        if let Some(signature) = kind.signature(settings) {
            selector.register(signature);
        }
    }
    if !settings.datasource_list.is_empty() {
        selector.retain_named(&settings.datasource_list);
    }
    selector
}

// ============================================================================
// Fallback platform
// ============================================================================

struct NoneTransport;

impl Transport for NoneTransport {
    fn fetch(&self, _ctx: &DetectionContext<'_>) -> std::result::Result<RawMetadataBlob, TransportError> {
        Ok(RawMetadataBlob::new(FALLBACK_PLATFORM, BlobPayload::Empty))
    }
}

struct NoneParser;

impl Parser for NoneParser {
    fn decode(&self, _blob: &RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError> {
        let mut record = MetadataRecord::builder();
        record.insert("instance-id", metadata::NONE_INSTANCE_ID);
        Ok(ParsedMetadata {
            record: record.build(),
            overrides: serde_json::json!({}),
            ..ParsedMetadata::default()
        })
    }
}
