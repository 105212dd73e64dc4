//! SmartOS (Joyent) key/value metadata parser

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bm_error::ParseError;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::constants::{metadata, paths};
use crate::netconfig::{DnsInfo, NicDescriptor};
use crate::parsers::{decode_base64, is_true, split_public_keys, Parser};
use crate::record::{AuxFile, BlobPayload, MetadataRecord, MetadataValue, ParsedMetadata, RawMetadataBlob};
use crate::settings::SerialSettings;

/// Metadata keys copied into the record as plain strings
const RECORD_KEYS: &[(&str, &str)] = &[
    ("sdc:uuid", "instance-id"),
    ("hostname", "local-hostname"),
    ("sdc:datacenter_name", "availability-zone"),
    ("user-data", "legacy-user-data"),
    ("iptables_disable", "iptables_disable"),
    ("motd_sys_info", "motd_sys_info"),
];

/// Scripts written out for the guest tools, keyed by metadata key
const SCRIPT_KEYS: &[(&str, &str)] = &[("user-script", "user-script"), ("sdc:operator-script", "operator-script")];

/// Interpreter added to scripts that do not name one
const DEFAULT_SHEBANG: &str = "#!/bin/bash";

pub struct SmartOsParser {
    no_base64_decode: Vec<String>,
    base64_keys: Vec<String>,
    base64_all: bool,
    /// Where the cached scripts land; named by the default vendor data
    script_dir: PathBuf,
}

impl SmartOsParser {
    pub fn new(settings: &SerialSettings, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            no_base64_decode: settings.no_base64_decode.clone(),
            base64_keys: settings.base64_keys.clone(),
            base64_all: settings.base64_all,
            script_dir: script_dir.into(),
        }
    }
}

impl Default for SmartOsParser {
    fn default() -> Self {
        Self::new(&SerialSettings::default(), Path::new(paths::CACHE_DIR).join("smartos"))
    }
}

fn executable_script(body: &str) -> Vec<u8> {
    if body.starts_with("#!") {
        body.as_bytes().to_vec()
    } else {
        format!("{}\n{}", DEFAULT_SHEBANG, body).into_bytes()
    }
}

/// Boot hook installing a per-boot script that runs the cached operator and
/// user scripts
fn default_vendor_data(script_dir: &Path) -> String {
    format!(
        r#"#cloud-boothook
#!/bin/sh
fname="{per_boot}/01_smartos_vendor_data.sh"
mkdir -p "{per_boot}"
cat > "$fname" <<"END_SCRIPT"
#!/bin/sh
for script in "{operator}" "{user}"; do
    [ -x "$script" ] || continue
    echo "executing '$script'" 1>&2
    "$script"
done
END_SCRIPT
chmod +x "$fname"
"#,
        per_boot = paths::PER_BOOT_SCRIPTS_DIR,
        operator = script_dir.join("operator-script").display(),
        user = script_dir.join("user-script").display(),
    )
}

fn parse_nics(raw: &str) -> Result<(Value, Vec<NicDescriptor>), ParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::malformed(format!("sdc:nics is not valid JSON: {}", e)))?;
    let nics = serde_json::from_value(value.clone())
        .map_err(|e| ParseError::malformed(format!("sdc:nics is not a NIC list: {}", e)))?;
    Ok((value, nics))
}

/// `sdc:resolvers` is a JSON list; tolerate a plain space/comma separated one
fn parse_resolvers(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_else(|_| {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl SmartOsParser {
    fn keys<'a>(&self, blob: &'a RawMetadataBlob) -> Result<&'a BTreeMap<String, String>, ParseError> {
        match &blob.payload {
            BlobPayload::Keys(keys) if !keys.is_empty() => Ok(keys),
            BlobPayload::Keys(_) => Err(ParseError::not_this_platform("metadata service returned no keys")),
            _ => Err(ParseError::not_this_platform("expected key/value metadata")),
        }
    }

    /// The operator's exclusions win, then the platform's `base64_all` and
    /// `base64_keys` (falling back to settings), then a `b64-<key>` marker
    fn wants_base64(&self, key: &str, keys: &BTreeMap<String, String>) -> bool {
        if !metadata::SMARTOS_BASE64_DECODABLE.contains(&key) || self.no_base64_decode.iter().any(|k| k == key) {
            return false;
        }
        let all = keys.get("base64_all").map(|v| is_true(v)).unwrap_or(self.base64_all);
        let listed = match keys.get("base64_keys") {
            Some(raw) => raw.split(',').any(|k| k.trim() == key),
            None => self.base64_keys.iter().any(|k| k == key),
        };
        all || listed || keys.get(&format!("b64-{}", key)).is_some_and(|v| is_true(v))
    }

    /// Values with base64 removed where asked; undecodable values are kept
    fn decoded(&self, keys: &BTreeMap<String, String>, warnings: &mut Vec<String>) -> BTreeMap<String, String> {
        keys.iter()
            .map(|(key, value)| {
                if !self.wants_base64(key, keys) {
                    return (key.clone(), value.clone());
                }
                match decode_base64(value).and_then(|bytes| String::from_utf8(bytes).ok()) {
                    Some(text) => (key.clone(), text),
                    None => {
                        warn!(key = %key, "Value marked base64 does not decode, keeping it as sent");
                        warnings.push(format!("{}: not valid base64; kept as sent", key));
                        (key.clone(), value.clone())
                    }
                }
            })
            .collect()
    }
}

impl Parser for SmartOsParser {
    fn decode(&self, blob: &RawMetadataBlob) -> Result<ParsedMetadata, ParseError> {
        let mut warnings = Vec::new();
        let keys = self.decoded(self.keys(blob)?, &mut warnings);

        let mut record = MetadataRecord::builder();
        for (source, target) in RECORD_KEYS {
            if let Some(value) = keys.get(*source) {
                record.insert(*target, value.trim());
            }
        }
        if let Some(authorized) = keys.get("root_authorized_keys") {
            record.insert("public-keys", split_public_keys(authorized));
        }

        let mut aux_files = Vec::new();
        for (source, name) in SCRIPT_KEYS {
            if let Some(body) = keys.get(*source) {
                record.insert(*name, body.as_str());
                aux_files.push(AuxFile {
                    name: name.to_string(),
                    contents: executable_script(body),
                    executable: true,
                });
            }
        }

        let vendor = keys
            .get("sdc:vendor-data")
            .cloned()
            .unwrap_or_else(|| default_vendor_data(&self.script_dir));
        record.insert("vendor-data", vendor.as_str());
        let mut overrides = Map::new();
        overrides.insert("vendor_data".to_string(), json!({ "enabled": true, "data": vendor }));

        let nics = match keys.get("sdc:nics") {
            Some(raw) => {
                let (network_data, nics) = parse_nics(raw)?;
                record.insert("network-data", MetadataValue::from_json(network_data));
                nics
            }
            None => Vec::new(),
        };
        debug!(count = nics.len(), "Parsed SmartOS NICs");

        let addresses = keys.get("sdc:resolvers").map(|r| parse_resolvers(r)).unwrap_or_default();
        let search: Vec<String> = keys
            .get("sdc:dns_domain")
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(|d| vec![d.to_string()])
            .unwrap_or_default();
        let dns = (!addresses.is_empty() || !search.is_empty()).then_some(DnsInfo { addresses, search });

        Ok(ParsedMetadata {
            record: record.build(),
            user_data: keys.get("cloud-init:user-data").map(|u| u.as_bytes().to_vec()),
            overrides: Value::Object(overrides),
            aux_files,
            nics,
            dns,
            warnings,
        })
    }
}
