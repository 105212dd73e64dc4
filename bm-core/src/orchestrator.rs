//! Boot pipeline
//!
//! Selects the platform (or takes the operator's pinned one), lets each
//! candidate fetch and decode in turn until one claims the instance, caches
//! its documents and merges the config layers.

use std::cell::OnceCell;
use std::path::PathBuf;

use bm_error::{BootmetaError, Result, SelectionError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::write_aux_files;
use crate::capabilities::InterfaceEnumerator;
use crate::context::DetectionContext;
use crate::merge::{builtin_config, merge_layers};
use crate::netconfig::{fallback, synthesize, DnsInfo, NicDescriptor, Synthesis, SynthesisInput};
use crate::parsers::Parser;
use crate::platforms::{builtin_selector, PlatformKind};
use crate::record::{MetadataRecord, ParsedMetadata, RawMetadataBlob};
use crate::selector::SelectionResult;
use crate::settings::Settings;
use crate::transport::Transport;

// ============================================================================
// Candidate Claiming
// ============================================================================

/// A platform ready to be tried
pub struct Candidate<'a> {
    pub name: String,
    pub transport: Box<dyn Transport + 'a>,
    pub parser: &'a dyn Parser,
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub platform: String,
    pub outcome: String,
}

/// The first candidate that produced metadata
#[derive(Debug)]
pub struct Claim {
    pub platform: String,
    pub blob: RawMetadataBlob,
    pub parsed: ParsedMetadata,
    pub attempts: Vec<Attempt>,
}

/// Try candidates in order until one decodes its own metadata.
///
/// Transport failures and `NotThisPlatform` move on to the next candidate.
/// Malformed metadata stops the pipeline.
pub fn claim_first(ctx: &DetectionContext<'_>, candidates: &[Candidate<'_>]) -> Result<Claim> {
    let mut attempts = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let blob = match candidate.transport.fetch(ctx) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(platform = %candidate.name, error = %e, "Metadata fetch failed");
                attempts.push(Attempt {
                    platform: candidate.name.clone(),
                    outcome: format!("fetch failed: {}", e),
                });
                continue;
            }
        };

        match candidate.parser.decode(&blob) {
            Ok(parsed) => {
                info!(platform = %candidate.name, source = %blob.source, cached = blob.from_cache, "Platform claimed");
                attempts.push(Attempt {
                    platform: candidate.name.clone(),
                    outcome: "claimed".to_string(),
                });
                return Ok(Claim {
                    platform: candidate.name.clone(),
                    blob,
                    parsed,
                    attempts,
                });
            }
            Err(e) if e.is_fatal() => {
                warn!(platform = %candidate.name, error = %e, "Platform metadata is malformed");
                return Err(BootmetaError::parse(candidate.name.clone(), e));
            }
            Err(e) => {
                debug!(platform = %candidate.name, reason = %e, "Not this platform");
                attempts.push(Attempt {
                    platform: candidate.name.clone(),
                    outcome: format!("not this platform: {}", e),
                });
            }
        }
    }

    Err(BootmetaError::Exhausted {
        tried: candidates.iter().map(|c| c.name.clone()).collect(),
    })
}

// ============================================================================
// Boot Metadata
// ============================================================================

/// Everything bootmeta learned about the instance
#[derive(Debug)]
pub struct BootMetadata {
    pub platform: String,
    /// `None` when the operator pinned the platform
    pub selection: Option<SelectionResult>,
    pub source: String,
    pub from_cache: bool,
    pub record: MetadataRecord,
    pub user_data: Option<Vec<u8>>,
    /// builtin < platform < operator
    pub config: Value,
    pub nics: Vec<NicDescriptor>,
    pub dns: Option<DnsInfo>,
    pub cached_files: Vec<PathBuf>,
    pub attempts: Vec<Attempt>,
    pub warnings: Vec<String>,
    link_only_drivers: Vec<String>,
    /// Generate DHCP config from the host's interfaces when `nics` is empty
    network_fallback: bool,
    network: OnceCell<Synthesis>,
}

impl BootMetadata {
    pub fn instance_id(&self) -> Option<&str> {
        self.record.instance_id()
    }

    /// Device path for a name like `ephemeral0`, via the platform's
    /// `disk_aliases`; other names are returned unchanged
    pub fn device_name_to_device(&self, name: &str) -> String {
        self.config
            .get("datasource")
            .and_then(|ds| ds.get(&self.platform))
            .and_then(|ds| ds.get("disk_aliases"))
            .and_then(|aliases| aliases.get(name))
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string()
    }

    /// Canonical network config, computed on first use
    pub fn network_config(&self, interfaces: &dyn InterfaceEnumerator) -> &Synthesis {
        self.network.get_or_init(|| {
            if self.nics.is_empty() && self.network_fallback {
                debug!(platform = %self.platform, "No NIC metadata, generating fallback network config");
                return fallback(&interfaces.list(), &self.link_only_drivers);
            }
            let resolver = |mac: &str| {
                self.nics
                    .iter()
                    .find(|nic| nic.mac.eq_ignore_ascii_case(mac))
                    .and_then(|nic| nic.interface.clone())
                    .or_else(|| interfaces.resolve(mac))
            };
            let drivers = |name: &str| interfaces.driver_of(name);
            synthesize(&SynthesisInput {
                nics: &self.nics,
                resolver: &resolver,
                driver_lookup: Some(&drivers),
                link_only_drivers: &self.link_only_drivers,
                dns: self.dns.as_ref(),
            })
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator<'a> {
    settings: &'a Settings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Run the platform selector under the configured policy
    pub fn detect(&self, ctx: &DetectionContext<'_>) -> Result<SelectionResult> {
        let policy = self.settings.parsed_policy()?;
        debug!(policy = %policy, "Evaluating platform signatures");
        Ok(builtin_selector(self.settings).evaluate(ctx, &policy))
    }

    /// Platforms to try, in order, plus the selection that produced them
    fn candidate_kinds(&self, ctx: &DetectionContext<'_>) -> Result<(Vec<PlatformKind>, Option<SelectionResult>)> {
        let (mut kinds, selection) = match self.settings.pinned_platform() {
            Some(pinned) => {
                info!(platform = %pinned, "Platform pinned by operator, skipping detection");
                (vec![pinned], None)
            }
            None => {
                let selection = self.detect(ctx)?;
                let names = match selection.clone().into_outcome() {
                    Err(SelectionError::NotFound) if self.settings.allows_fallback() => Vec::new(),
                    outcome => outcome?,
                };
                let kinds = names
                    .iter()
                    .filter_map(|name| {
                        let kind = PlatformKind::from_name(name);
                        if kind.is_none() {
                            warn!(platform = %name, "Selected platform has no implementation");
                        }
                        kind
                    })
                    .collect();
                (kinds, Some(selection))
            }
        };

        if self.settings.allows_fallback() && !kinds.contains(&PlatformKind::None) {
            kinds.push(PlatformKind::None);
        }
        Ok((kinds, selection))
    }

    pub fn run(&self, ctx: &DetectionContext<'_>) -> Result<BootMetadata> {
        let (kinds, selection) = self.candidate_kinds(ctx)?;

        let parsers: Vec<Box<dyn Parser>> = kinds.iter().map(|kind| kind.parser(self.settings)).collect();
        let candidates = kinds
            .iter()
            .zip(&parsers)
            .map(|(kind, parser)| {
                Ok(Candidate {
                    name: kind.name().to_string(),
                    transport: kind.transport(self.settings)?,
                    parser: parser.as_ref(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let claim = claim_first(ctx, &candidates)?;
        let kind = PlatformKind::from_name(&claim.platform).unwrap_or(PlatformKind::None);
        self.finish(ctx, kind, claim, selection)
    }

    fn finish(
        &self,
        ctx: &DetectionContext<'_>,
        kind: PlatformKind,
        claim: Claim,
        selection: Option<SelectionResult>,
    ) -> Result<BootMetadata> {
        let Claim {
            platform,
            blob,
            parsed,
            attempts,
        } = claim;

        let mut warnings = blob.warnings;
        warnings.extend(parsed.warnings);

        let firmware_id = kind.instance_id_field().and_then(|field| ctx.firmware_field(field));
        let record = if let Some(id) = firmware_id {
            debug!(platform = %platform, instance_id = %id, "Instance id taken from firmware");
            let mut builder = parsed.record.to_builder();
            builder.insert("instance-id", id);
            builder.build()
        } else if parsed.record.instance_id().is_some() {
            parsed.record
        } else {
            let fallback_id = format!("iid-{}", platform.to_ascii_lowercase());
            warn!(platform = %platform, instance_id = %fallback_id, "Platform gave no instance id");
            warnings.push(format!("no instance-id provided; using {}", fallback_id));
            let mut builder = parsed.record.to_builder();
            builder.insert("instance-id", fallback_id);
            builder.build()
        };

        let cache_dir = kind.cache_dir(self.settings);
        let cached_files = if blob.from_cache || parsed.aux_files.is_empty() {
            Vec::new()
        } else {
            match write_aux_files(&cache_dir, &parsed.aux_files) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(dir = ?cache_dir, error = %e, "Could not cache platform documents");
                    warnings.push(format!("cache: {}", e));
                    Vec::new()
                }
            }
        };

        let config = merge_layers(&[
            &builtin_config(),
            &kind.default_config(),
            &parsed.overrides,
            &self.settings.config,
        ]);

        Ok(BootMetadata {
            platform,
            selection,
            source: blob.source,
            from_cache: blob.from_cache,
            record,
            user_data: parsed.user_data,
            config,
            nics: parsed.nics,
            dns: parsed.dns,
            cached_files,
            attempts,
            warnings,
            link_only_drivers: self.settings.network.link_only_drivers.clone(),
            network_fallback: kind.network_fallback(),
            network: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{FirmwareField, SystemClock};
    use crate::record::BlobPayload;
    use crate::test_utils::{FakeDevices, FakeFirmware, FakeInterfaces};
    use bm_error::{ParseError, TransportError};
    use std::cell::Cell;
    use std::fs;
    use tempfile::TempDir;

    struct FnTransport<F: Fn() -> std::result::Result<RawMetadataBlob, TransportError>> {
        fetch: F,
        calls: Cell<usize>,
    }

    impl<F: Fn() -> std::result::Result<RawMetadataBlob, TransportError>> Transport for FnTransport<F> {
        fn fetch(&self, _ctx: &DetectionContext<'_>) -> std::result::Result<RawMetadataBlob, TransportError> {
            self.calls.set(self.calls.get() + 1);
            (self.fetch)()
        }
    }

    struct FnParser<F: Fn(&RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError>>(F);

    impl<F: Fn(&RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError>> Parser for FnParser<F> {
        fn decode(&self, blob: &RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError> {
            (self.0)(blob)
        }
    }

    fn create_test_candidate<'a>(name: &str, parser: &'a dyn Parser) -> Candidate<'a> {
        let name_owned = name.to_string();
        Candidate {
            name: name.to_string(),
            transport: Box::new(FnTransport {
                fetch: move || Ok(RawMetadataBlob::new(name_owned.clone(), BlobPayload::Empty)),
                calls: Cell::new(0),
            }),
            parser,
        }
    }

    fn with_context<T>(f: impl FnOnce(&DetectionContext<'_>) -> T) -> T {
        let firmware = FakeFirmware::default();
        let devices = FakeDevices::default();
        let interfaces = FakeInterfaces::default();
        let clock = SystemClock::new();
        let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);
        f(&ctx)
    }

    fn rejects(reason: &'static str) -> impl Fn(&RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError> {
        move |_: &RawMetadataBlob| Err(ParseError::not_this_platform(reason))
    }

    fn claims(id: &'static str) -> impl Fn(&RawMetadataBlob) -> std::result::Result<ParsedMetadata, ParseError> {
        move |_: &RawMetadataBlob| {
            let mut record = MetadataRecord::builder();
            record.insert("instance-id", id);
            Ok(ParsedMetadata {
                record: record.build(),
                ..ParsedMetadata::default()
            })
        }
    }

    #[test]
    fn test_not_this_platform_moves_to_next_candidate() {
        let rejects = FnParser(rejects("no marker"));
        let second = FnParser(claims("i-second"));
        let third = FnParser(claims("i-third"));
        let candidates = vec![
            create_test_candidate("A", &rejects),
            create_test_candidate("B", &second),
            create_test_candidate("C", &third),
        ];

        let claim = with_context(|ctx| claim_first(ctx, &candidates)).unwrap();
        assert_eq!(claim.platform, "B");
        assert_eq!(claim.parsed.record.instance_id(), Some("i-second"));
        assert_eq!(claim.attempts.len(), 2);
        assert!(claim.attempts[0].outcome.starts_with("not this platform"));
    }

    #[test]
    fn test_malformed_halts() {
        let malformed = FnParser(|_: &RawMetadataBlob| -> std::result::Result<ParsedMetadata, ParseError> {
            Err(ParseError::malformed("two sections"))
        });
        let second = FnParser(claims("i-second"));
        let candidates = vec![
            create_test_candidate("A", &malformed),
            create_test_candidate("B", &second),
        ];

        let err = with_context(|ctx| claim_first(ctx, &candidates)).unwrap_err();
        assert!(matches!(err, BootmetaError::Parse { ref platform, .. } if platform == "A"));
    }

    #[test]
    fn test_transport_failure_moves_on_and_exhausts() {
        let parser = FnParser(claims("unused"));
        let failing = Candidate {
            name: "A".to_string(),
            transport: Box::new(FnTransport {
                fetch: || Err(TransportError::unreachable("connection refused")),
                calls: Cell::new(0),
            }),
            parser: &parser,
        };
        let rejects = FnParser(rejects("no marker"));
        let candidates = vec![failing, create_test_candidate("B", &rejects)];

        let err = with_context(|ctx| claim_first(ctx, &candidates)).unwrap_err();
        match err {
            BootmetaError::Exhausted { tried } => assert_eq!(tried, vec!["A", "B"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    fn create_test_settings(temp: &TempDir) -> Settings {
        Settings {
            seed_dir: temp.path().join("seed"),
            cache_dir: temp.path().join("cache"),
            ..Settings::default()
        }
    }

    const OVF_ENV: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
  xmlns:oe="http://schemas.dmtf.org/ovf/environment/1">
  <PropertySection>
    <Property oe:key="instance-id" oe:value="inst-42"/>
    <Property oe:key="password" oe:value="s3cret"/>
  </PropertySection>
</Environment>
"#;

    #[test]
    fn test_run_detects_seeded_ovf() {
        let temp = TempDir::new().unwrap();
        let mut settings = create_test_settings(&temp);
        settings.config = serde_json::json!({"ssh_pwauth": true});
        fs::create_dir_all(temp.path().join("seed/ovf")).unwrap();
        fs::write(temp.path().join("seed/ovf/ovf-env.xml"), OVF_ENV).unwrap();

        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        assert_eq!(result.platform, "OVF");
        assert_eq!(result.instance_id(), Some("inst-42"));
        assert_eq!(result.selection.as_ref().unwrap().platform.as_deref(), Some("OVF"));
        assert_eq!(result.config["password"], "s3cret");
        assert_eq!(result.config["ssh_pwauth"], true);
        assert_eq!(result.config["disable_root"], true);

        let cached = fs::read_to_string(temp.path().join("cache/ovf/ovf-env.xml")).unwrap();
        assert!(!cached.contains("s3cret"));
    }

    #[test]
    fn test_run_without_platform_is_not_found() {
        let temp = TempDir::new().unwrap();
        let settings = create_test_settings(&temp);
        let err = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap_err();
        assert!(matches!(err, BootmetaError::Selection(SelectionError::NotFound)));
    }

    #[test]
    fn test_pinned_platform_falls_back_to_none() {
        let temp = TempDir::new().unwrap();
        let mut settings = create_test_settings(&temp);
        settings.datasource_list = vec!["Azure".into(), "None".into()];
        settings.azure.data_dir = Some(temp.path().join("waagent"));

        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        assert_eq!(result.platform, "None");
        assert!(result.selection.is_none());
        assert_eq!(result.instance_id(), Some("iid-datasource-none"));
        assert_eq!(result.attempts[0].platform, "Azure");
    }

    #[test]
    fn test_pinned_seeded_ec2_with_network() {
        let temp = TempDir::new().unwrap();
        let mut settings = create_test_settings(&temp);
        settings.datasource_list = vec!["Ec2".into()];
        fs::create_dir_all(temp.path().join("seed/ec2")).unwrap();
        fs::write(
            temp.path().join("seed/ec2/meta-data"),
            "instance-id: i-seeded\nnetwork:\n  interfaces:\n    macs:\n      \"0a:00:00:00:00:01\":\n        device-number: \"0\"\n        local-ipv4s: 10.0.0.5\n",
        )
        .unwrap();

        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        assert_eq!(result.instance_id(), Some("i-seeded"));

        let interfaces = FakeInterfaces::default().with("0a:00:00:00:00:01", "eth0", "virtio_net");
        let network = result.network_config(&interfaces);
        let names: Vec<&str> = network.config.devices().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["eth0"]);
        // cached after the first call
        let again = result.network_config(&FakeInterfaces::default());
        assert_eq!(again.config.devices().count(), 1);
    }

    #[test]
    fn test_missing_instance_id_is_filled() {
        let temp = TempDir::new().unwrap();
        let settings = create_test_settings(&temp);
        let parsed = ParsedMetadata {
            overrides: serde_json::json!({}),
            ..ParsedMetadata::default()
        };
        let claim = Claim {
            platform: "SmartOS".to_string(),
            blob: RawMetadataBlob::new("/dev/ttyS1", BlobPayload::Empty),
            parsed,
            attempts: Vec::new(),
        };

        let result = with_context(|ctx| Orchestrator::new(&settings).finish(ctx, PlatformKind::SmartOs, claim, None))
            .unwrap();
        assert_eq!(result.instance_id(), Some("iid-smartos"));
        assert_eq!(result.warnings.len(), 1);
    }

    const AZURE_ENV: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
 xmlns:wa="http://schemas.microsoft.com/windowsazure">
 <wa:ProvisioningSection>
 <LinuxProvisioningConfigurationSet xmlns="http://schemas.microsoft.com/windowsazure">
  <ConfigurationSetType>LinuxProvisioningConfiguration</ConfigurationSetType>
  <HostName>azure-vm</HostName>
  <UserName>azureuser</UserName>
 </LinuxProvisioningConfigurationSet>
 </wa:ProvisioningSection>
</Environment>
"#;

    fn create_azure_settings(temp: &TempDir) -> Settings {
        let mut settings = create_test_settings(temp);
        settings.azure.data_dir = Some(temp.path().join("waagent"));
        fs::create_dir_all(temp.path().join("seed/azure")).unwrap();
        fs::write(temp.path().join("seed/azure/ovf-env.xml"), AZURE_ENV).unwrap();
        settings
    }

    #[test]
    fn test_azure_instance_id_from_firmware_uuid() {
        let temp = TempDir::new().unwrap();
        let settings = create_azure_settings(&temp);

        let firmware = FakeFirmware::default().with(FirmwareField::ProductUuid, "D0DF4C54-4ECB-4A4B-9954-5BDF3ED5C3B8");
        let devices = FakeDevices::default();
        let interfaces = FakeInterfaces::default();
        let clock = SystemClock::new();
        let ctx = DetectionContext::new(&firmware, &devices, &interfaces, &clock);
        let result = Orchestrator::new(&settings).run(&ctx).unwrap();
        assert_eq!(result.instance_id(), Some("D0DF4C54-4ECB-4A4B-9954-5BDF3ED5C3B8"));

        // without the DMI uuid the document default stands
        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        assert_eq!(result.instance_id(), Some(crate::constants::metadata::AZURE_DEFAULT_INSTANCE_ID));
    }

    #[test]
    fn test_azure_fallback_network_and_disk_aliases() {
        let temp = TempDir::new().unwrap();
        let settings = create_azure_settings(&temp);
        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();

        let interfaces = FakeInterfaces::default()
            .with_device("00:0d:3a:04:75:98", "eth0", "hv_netvsc", Some("0x3"))
            .with_device("00:0d:3a:04:75:98", "eth1", "mlx4_core", Some("0x1004"));
        let network = serde_json::to_value(&result.network_config(&interfaces).config).unwrap();
        assert_eq!(
            network,
            serde_json::json!({
                "version": 1,
                "config": [
                    {"type": "physical", "name": "eth0", "mac_address": "00:0d:3a:04:75:98",
                     "subnets": [{"type": "dhcp4"}],
                     "params": {"driver": "hv_netvsc", "device_id": "0x3"}},
                    {"type": "physical", "name": "vf1", "mac_address": "00:0d:3a:04:75:98",
                     "subnets": [],
                     "params": {"driver": "mlx4_core", "device_id": "0x1004"}}
                ]
            })
        );

        assert_eq!(result.config["fs_setup"][0]["filesystem"], "ext4");
        assert_eq!(result.device_name_to_device("ephemeral0"), "/dev/disk/cloud/azure_resource");
        assert_eq!(result.device_name_to_device("/dev/sdc"), "/dev/sdc");
    }

    #[test]
    fn test_operator_disk_alias_overrides_platform_default() {
        let temp = TempDir::new().unwrap();
        let mut settings = create_azure_settings(&temp);
        settings.config = serde_json::json!({"datasource": {"Azure": {"disk_aliases": {"FOO": "/dev/bar"}}}});
        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        assert_eq!(result.device_name_to_device("FOO"), "/dev/bar");
        assert_eq!(result.device_name_to_device("ephemeral0"), "/dev/disk/cloud/azure_resource");
    }

    #[test]
    fn test_platform_without_fallback_gets_empty_network() {
        let temp = TempDir::new().unwrap();
        let mut settings = create_test_settings(&temp);
        settings.datasource_list = vec!["None".into()];
        let result = with_context(|ctx| Orchestrator::new(&settings).run(ctx)).unwrap();
        let interfaces = FakeInterfaces::default().with("aa", "eth0", "virtio_net");
        assert_eq!(result.network_config(&interfaces).config.devices().count(), 0);
    }
}
