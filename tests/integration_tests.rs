/*
 * Integration tests for bootmeta
 *
 * These tests run the whole pipeline against seeded directories and fake
 * host capabilities, and check the pieces the binary wires together.
 */

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use bm_core::constants::signatures;
use bm_core::{
    BootmetaError, DetectionContext, BlockDevices, DeviceQuery, FirmwareField, FirmwareInfo,
    HostInterface, InterfaceEnumerator, NicDescriptor, Orchestrator, SelectionError, Settings, SystemClock,
    TransportError,
};
use bm_core::capabilities::MountHandle;
use bootmeta::cli::convert_nics;
use bootmeta::config::{load_effective_settings, resolve_settings_path};
use bootmeta::logger::boot_summary;
use serial_test::serial;
use tempfile::TempDir;

// Test utilities

#[derive(Default)]
struct TestFirmware(HashMap<FirmwareField, String>);

impl TestFirmware {
    fn with(mut self, field: FirmwareField, value: &str) -> Self {
        self.0.insert(field, value.to_string());
        self
    }
}

impl FirmwareInfo for TestFirmware {
    fn read(&self, field: FirmwareField) -> Option<String> {
        self.0.get(&field).cloned()
    }
}

/// A host with no block devices at all
struct NoDevices;

impl BlockDevices for NoDevices {
    fn list_candidates(&self, _query: &DeviceQuery) -> Vec<String> {
        Vec::new()
    }

    fn mount(&self, device: &str, _fstype: Option<String>) -> Result<MountHandle, TransportError> {
        Err(TransportError::Ejected(device.to_string()))
    }

    fn unmount(&self, _handle: &MountHandle) {}
}

#[derive(Default)]
struct TestInterfaces(HashMap<String, String>);

impl InterfaceEnumerator for TestInterfaces {
    fn resolve(&self, mac: &str) -> Option<String> {
        self.0.get(&mac.to_ascii_lowercase()).cloned()
    }

    fn driver_of(&self, _name: &str) -> Option<String> {
        None
    }

    fn list(&self) -> Vec<HostInterface> {
        let mut listed: Vec<HostInterface> = self
            .0
            .iter()
            .map(|(mac, name)| HostInterface {
                name: name.clone(),
                mac: mac.clone(),
                driver: None,
                device_id: None,
            })
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }
}

fn run_pipeline(settings: &Settings, firmware: &TestFirmware) -> bm_core::Result<bm_core::BootMetadata> {
    let interfaces = TestInterfaces::default();
    let clock = SystemClock::new();
    let ctx = DetectionContext::new(firmware, &NoDevices, &interfaces, &clock);
    Orchestrator::new(settings).run(&ctx)
}

fn create_test_settings(temp: &TempDir) -> Settings {
    let mut settings = Settings {
        seed_dir: temp.path().join("seed"),
        cache_dir: temp.path().join("cache"),
        ..Settings::default()
    };
    settings.azure.data_dir = Some(temp.path().join("waagent"));
    settings
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

const AZURE_ENV: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
 xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
 xmlns:wa="http://schemas.microsoft.com/windowsazure">
 <wa:ProvisioningSection><wa:Version>1.0</wa:Version>
 <LinuxProvisioningConfigurationSet xmlns="http://schemas.microsoft.com/windowsazure">
  <ConfigurationSetType>LinuxProvisioningConfiguration</ConfigurationSetType>
  <HostName>azure-vm</HostName>
  <UserName>azureuser</UserName>
  <UserPassword>p4ssw0rd</UserPassword>
  <CustomData>I2Nsb3VkLWNvbmZpZwo=</CustomData>
 </LinuxProvisioningConfigurationSet>
 </wa:ProvisioningSection>
</Environment>
"#;

// ============================================================================
// Settings
// ============================================================================

#[test]
#[serial]
fn test_settings_path_from_environment() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("custom.json");
    fs::write(&path, r#"{"policy": "search,found=first,maybe=none,notfound=enabled"}"#).unwrap();

    std::env::set_var("BOOTMETA_CONFIG", &path);
    assert_eq!(resolve_settings_path(None), path);
    let settings = load_effective_settings(None).unwrap();
    std::env::remove_var("BOOTMETA_CONFIG");

    assert_eq!(settings.policy, "search,found=first,maybe=none,notfound=enabled");
}

#[test]
#[serial]
fn test_explicit_path_beats_environment() {
    let temp = TempDir::new().unwrap();
    std::env::set_var("BOOTMETA_CONFIG", temp.path().join("env.json"));
    let explicit = temp.path().join("explicit.json");
    assert_eq!(resolve_settings_path(Some(&explicit)), explicit);
    std::env::remove_var("BOOTMETA_CONFIG");
}

// ============================================================================
// Pipeline
// ============================================================================

#[test]
fn test_azure_seed_then_cached_copy() {
    let temp = TempDir::new().unwrap();
    let settings = create_test_settings(&temp);
    let seed_file = temp.path().join("seed/azure/ovf-env.xml");
    write_file(&seed_file, AZURE_ENV);

    let first = run_pipeline(&settings, &TestFirmware::default()).unwrap();
    assert_eq!(first.platform, "Azure");
    assert_eq!(first.record.local_hostname(), Some("azure-vm"));
    assert_eq!(first.user_data.as_deref(), Some(&b"#cloud-config\n"[..]));
    assert_eq!(first.config["system_info"]["default_user"]["name"], "azureuser");
    let hashed = first.config["system_info"]["default_user"]["passwd"].as_str().unwrap();
    assert!(hashed.starts_with("$6$"));
    assert!(!first.config.to_string().contains("p4ssw0rd"));

    let cached = fs::read_to_string(temp.path().join("waagent/ovf-env.xml")).unwrap();
    assert!(!cached.contains("p4ssw0rd"));

    // next boot: no seed, no media, firmware still says Azure
    fs::remove_file(&seed_file).unwrap();
    let firmware = TestFirmware::default().with(FirmwareField::ChassisAssetTag, signatures::AZURE_CHASSIS_ASSET_TAG);
    let second = run_pipeline(&settings, &firmware).unwrap();
    assert_eq!(second.platform, "Azure");
    assert!(second.from_cache);
    assert_eq!(second.record.local_hostname(), Some("azure-vm"));
    assert!(second.config["system_info"]["default_user"]
        .get("passwd")
        .is_none());
}

#[test]
fn test_ambiguous_selection_is_an_error() {
    let temp = TempDir::new().unwrap();
    let settings = create_test_settings(&temp);
    write_file(&temp.path().join("seed/azure/ovf-env.xml"), AZURE_ENV);
    let firmware = TestFirmware::default().with(FirmwareField::ProductName, "SmartDC HVM");

    match run_pipeline(&settings, &firmware) {
        Err(BootmetaError::Selection(SelectionError::Ambiguous(names))) => {
            assert_eq!(names, vec!["SmartOS", "Azure"]);
        }
        other => panic!("expected ambiguity, got {:?}", other.map(|m| m.platform)),
    }
}

#[test]
fn test_notfound_enabled_uses_fallback() {
    let temp = TempDir::new().unwrap();
    let mut settings = create_test_settings(&temp);
    settings.policy = "search,found=all,maybe=all,notfound=enabled".to_string();
    settings.config = serde_json::json!({"manage_etc_hosts": true});

    let metadata = run_pipeline(&settings, &TestFirmware::default()).unwrap();
    assert_eq!(metadata.platform, "None");
    assert!(metadata.selection.as_ref().unwrap().fallback);
    assert_eq!(metadata.config["manage_etc_hosts"], true);
    assert_eq!(metadata.config["disable_root"], true);
}

#[test]
fn test_boot_summary_hides_secrets() {
    let temp = TempDir::new().unwrap();
    let settings = create_test_settings(&temp);
    write_file(&temp.path().join("seed/azure/ovf-env.xml"), AZURE_ENV);

    let metadata = run_pipeline(&settings, &TestFirmware::default()).unwrap();
    let summary = boot_summary(&metadata).to_string();
    assert!(!summary.contains("p4ssw0rd"));
    assert!(!summary.contains("#cloud-config"));
    assert!(summary.contains("user_data_sha256"));
}

// ============================================================================
// Network conversion
// ============================================================================

#[test]
fn test_gateway_only_on_primary_nic() {
    let nics: Vec<NicDescriptor> = serde_json::from_str(
        r#"[
            {"mac": "90:b8:d0:f5:e4:f5", "interface": "net0", "primary": true, "mtu": 1500,
             "ips": ["8.12.42.102/24"], "gateways": ["8.12.42.1"]},
            {"mac": "90:b8:d0:a5:ff:cd", "interface": "net1", "mtu": 8500,
             "ips": ["192.168.128.93/22"], "gateways": ["192.168.128.1"]}
        ]"#,
    )
    .unwrap();

    let synthesis = convert_nics(&nics, &BTreeMap::new(), &[], &TestInterfaces::default());
    let config = serde_json::to_value(&synthesis.config).unwrap();
    assert_eq!(config["version"], 1);
    assert_eq!(config["config"][0]["name"], "net0");
    assert_eq!(config["config"][0]["subnets"][0]["gateway"], "8.12.42.1");
    assert_eq!(config["config"][1]["name"], "net1");
    assert!(config["config"][1]["subnets"][0].get("gateway").is_none());
}
