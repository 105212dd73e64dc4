//! Operator Settings
//!
//! Persistent settings stored as JSON in /etc/bootmeta/bootmeta.json, or the
//! file named by `BOOTMETA_CONFIG`. Every field has a default, so a missing
//! file or a partial one is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bm_error::{BootmetaError, Result};

use crate::constants::{metadata, paths, timing};
use crate::platforms::PlatformKind;
use crate::selector::Policy;

/// Operator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Platforms to consider, in order. One entry (besides "None") skips detection.
    #[serde(default)]
    pub datasource_list: Vec<String>,

    /// Selection policy, e.g. "search,found=all,maybe=all,notfound=disabled"
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Local seed directory
    #[serde(default = "default_seed_dir")]
    pub seed_dir: PathBuf,

    /// Where platform documents are cached between boots
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Log filter: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub ec2: TreeSettings,

    #[serde(default)]
    pub aliyun: TreeSettings,

    #[serde(default)]
    pub azure: VolumeSettings,

    #[serde(default)]
    pub ovf: VolumeSettings,

    #[serde(default)]
    pub smartos: SerialSettings,

    /// Operator config layer, merged over everything the platform provides
    #[serde(default)]
    pub config: Value,
}

/// Network synthesis settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Drivers whose interfaces are named but never given addresses
    #[serde(default = "default_link_only_drivers")]
    pub link_only_drivers: Vec<String>,
}

/// Settings for a polled metadata service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSettings {
    /// Base urls; empty means the platform default
    #[serde(default)]
    pub metadata_urls: Vec<String>,

    /// API version path component; `None` means the platform default
    #[serde(default)]
    pub api_version: Option<String>,

    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Only consider the platform when firmware identifies it
    #[serde(default = "default_true")]
    pub strict_id: bool,
}

/// Settings for a platform read from a mounted volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VolumeSettings {
    /// Cache directory override
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Filesystem types to try; empty means the platform default
    #[serde(default)]
    pub fstypes: Vec<String>,

    /// Regex over device names; `None` means the platform default
    #[serde(default)]
    pub device_pattern: Option<String>,
}

/// Settings for the serial metadata port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_serial_device")]
    pub device: PathBuf,

    #[serde(default = "default_serial_timeout")]
    pub read_timeout_secs: u64,

    /// Keys never base64 decoded, whatever the platform marks
    #[serde(default = "default_no_base64_decode")]
    pub no_base64_decode: Vec<String>,

    /// Keys decoded when the platform does not send its own `base64_keys`
    #[serde(default)]
    pub base64_keys: Vec<String>,

    /// Decode every decodable key when the platform does not send `base64_all`
    #[serde(default)]
    pub base64_all: bool,
}

// Default value functions
fn default_policy() -> String { Policy::default().to_string() }
fn default_seed_dir() -> PathBuf { PathBuf::from(paths::SEED_DIR) }
fn default_cache_dir() -> PathBuf { PathBuf::from(paths::CACHE_DIR) }
fn default_log_level() -> String { "info".to_string() }
fn default_link_only_drivers() -> Vec<String> { vec!["mlx4_core".to_string()] }
fn default_max_wait() -> u64 { timing::METADATA_MAX_WAIT.as_secs() }
fn default_timeout() -> u64 { timing::METADATA_TIMEOUT.as_secs() }
fn default_retry_interval() -> u64 { timing::METADATA_RETRY_INTERVAL.as_secs() }
fn default_true() -> bool { true }
fn default_serial_device() -> PathBuf { PathBuf::from(paths::SMARTOS_SERIAL_DEVICE) }
fn default_serial_timeout() -> u64 { timing::SERIAL_READ_TIMEOUT.as_secs() }
fn default_no_base64_decode() -> Vec<String> {
    metadata::SMARTOS_NO_BASE64_DECODE.iter().map(|k| k.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            datasource_list: Vec::new(),
            policy: default_policy(),
            seed_dir: default_seed_dir(),
            cache_dir: default_cache_dir(),
            log_level: default_log_level(),
            network: NetworkSettings::default(),
            ec2: TreeSettings::default(),
            aliyun: TreeSettings::default(),
            azure: VolumeSettings::default(),
            ovf: VolumeSettings::default(),
            smartos: SerialSettings::default(),
            config: Value::Null,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            link_only_drivers: default_link_only_drivers(),
        }
    }
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            metadata_urls: Vec::new(),
            api_version: None,
            max_wait_secs: default_max_wait(),
            timeout_secs: default_timeout(),
            retry_interval_secs: default_retry_interval(),
            strict_id: default_true(),
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            read_timeout_secs: default_serial_timeout(),
            no_base64_decode: default_no_base64_decode(),
            base64_keys: Vec::new(),
            base64_all: false,
        }
    }
}

fn bounded(secs: u64) -> Duration {
    Duration::from_secs(secs).min(timing::MAX_CONFIGURED_WAIT)
}

impl TreeSettings {
    pub fn max_wait(&self) -> Duration {
        bounded(self.max_wait_secs)
    }

    pub fn timeout(&self) -> Duration {
        bounded(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        bounded(self.retry_interval_secs)
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        bounded(self.read_timeout_secs)
    }
}

impl Settings {
    pub fn parsed_policy(&self) -> Result<Policy> {
        self.policy.parse()
    }

    /// The single platform the operator pinned, if any
    pub fn pinned_platform(&self) -> Option<PlatformKind> {
        let mut named = self
            .datasource_list
            .iter()
            .filter(|n| n.as_str() != PlatformKind::None.name());
        match (named.next(), named.next()) {
            (Some(only), None) => PlatformKind::from_name(only),
            _ => None,
        }
    }

    /// Whether the operator allows the no-op fallback after a pinned platform
    pub fn allows_fallback(&self) -> bool {
        self.datasource_list.iter().any(|n| n == PlatformKind::None.name())
    }
}

// ============================================================================
// Load
// ============================================================================

/// Settings file location, honouring `BOOTMETA_CONFIG`
pub fn settings_path() -> PathBuf {
    std::env::var_os(paths::SETTINGS_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(paths::SETTINGS_FILE))
}

/// Load settings from `path`, returning defaults when the file is absent
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|source| BootmetaError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let settings: Settings = serde_json::from_str(&content).map_err(|e| {
        BootmetaError::config(format!("Failed to parse settings JSON: {}", e))
    })?;

    Ok(settings)
}

// ============================================================================
// Validation
// ============================================================================

fn validate_tree(name: &str, tree: &TreeSettings) -> std::result::Result<(), String> {
    for url in &tree.metadata_urls {
        if !["http://", "https://", "file://"].iter().any(|scheme| url.starts_with(scheme)) {
            return Err(format!("{}.metadata_urls: '{}' is not an http(s) or file url", name, url));
        }
    }
    if tree.timeout_secs == 0 {
        return Err(format!("{}.timeout_secs must be positive", name));
    }
    if tree.retry_interval_secs == 0 {
        return Err(format!("{}.retry_interval_secs must be positive", name));
    }
    if Duration::from_secs(tree.max_wait_secs) > timing::MAX_CONFIGURED_WAIT {
        return Err(format!(
            "{}.max_wait_secs exceeds {}s",
            name,
            timing::MAX_CONFIGURED_WAIT.as_secs()
        ));
    }
    Ok(())
}

fn validate_volume(name: &str, volume: &VolumeSettings) -> std::result::Result<(), String> {
    if volume.fstypes.iter().any(|t| t.trim().is_empty()) {
        return Err(format!("{}.fstypes contains an empty entry", name));
    }
    if let Some(pattern) = &volume.device_pattern {
        regex::Regex::new(pattern)
            .map_err(|e| format!("{}.device_pattern is not a valid regex: {}", name, e))?;
    }
    Ok(())
}

/// Validate settings before use
pub fn validate_settings(settings: &Settings) -> std::result::Result<(), String> {
    settings.parsed_policy().map_err(|e| e.to_string())?;

    for name in &settings.datasource_list {
        if PlatformKind::from_name(name).is_none() {
            return Err(format!("datasource_list: unknown platform '{}'", name));
        }
    }

    validate_tree("ec2", &settings.ec2)?;
    validate_tree("aliyun", &settings.aliyun)?;
    validate_volume("azure", &settings.azure)?;
    validate_volume("ovf", &settings.ovf)?;

    if settings.smartos.read_timeout_secs == 0 {
        return Err("smartos.read_timeout_secs must be positive".to_string());
    }

    if !matches!(settings.config, Value::Null | Value::Object(_)) {
        return Err("config must be a JSON object".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.policy, "search,found=all,maybe=all,notfound=disabled");
        assert_eq!(settings.network.link_only_drivers, vec!["mlx4_core"]);
    }

    #[test]
    fn test_partial_file_keeps_field_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bootmeta.json");
        fs::write(&path, r#"{"ec2": {"max_wait_secs": 10}, "datasource_list": ["Azure"]}"#).unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.ec2.max_wait(), Duration::from_secs(10));
        assert_eq!(settings.ec2.timeout(), timing::METADATA_TIMEOUT);
        assert!(settings.ec2.strict_id);
        assert_eq!(settings.pinned_platform(), Some(PlatformKind::Azure));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bootmeta.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings(&path), Err(BootmetaError::Config(_))));
    }

    #[test]
    fn test_unreadable_settings_name_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bootmeta.json");
        fs::create_dir(&path).unwrap();
        match load_settings(&path) {
            Err(BootmetaError::FileRead { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("expected FileRead, got {:?}", other),
        }
    }

    #[test]
    fn test_smartos_base64_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"smartos": {"base64_keys": ["hostname"]}}"#).unwrap();
        assert_eq!(settings.smartos.base64_keys, vec!["hostname"]);
        assert!(!settings.smartos.base64_all);
        assert!(settings.smartos.no_base64_decode.iter().any(|k| k == "sdc:uuid"));
        assert_eq!(settings.smartos.device, PathBuf::from(paths::SMARTOS_SERIAL_DEVICE));
    }

    #[test]
    fn test_pinned_platform_rules() {
        let mut settings = Settings::default();
        assert_eq!(settings.pinned_platform(), None);

        settings.datasource_list = vec!["SmartOS".into(), "None".into()];
        assert_eq!(settings.pinned_platform(), Some(PlatformKind::SmartOs));
        assert!(settings.allows_fallback());

        settings.datasource_list = vec!["Ec2".into(), "Azure".into()];
        assert_eq!(settings.pinned_platform(), None);
        assert!(!settings.allows_fallback());
    }

    #[test]
    fn test_waits_are_bounded() {
        let tree = TreeSettings {
            max_wait_secs: 999_999,
            ..TreeSettings::default()
        };
        assert_eq!(tree.max_wait(), timing::MAX_CONFIGURED_WAIT);
    }

    #[test]
    fn test_validate_settings() {
        assert!(validate_settings(&Settings::default()).is_ok());

        let mut settings = Settings::default();
        settings.policy = "found=sometimes".into();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.datasource_list = vec!["OpenStack".into()];
        assert!(validate_settings(&settings).unwrap_err().contains("OpenStack"));

        let mut settings = Settings::default();
        settings.ec2.metadata_urls = vec!["169.254.169.254".into()];
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.ovf.device_pattern = Some("(".into());
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.config = json!(["not", "an", "object"]);
        assert!(validate_settings(&settings).is_err());
    }
}
