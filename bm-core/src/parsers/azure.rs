//! Azure `ovf-env.xml` parser

use std::collections::BTreeMap;

use bm_error::ParseError;
use roxmltree::Node;
use serde_json::{json, Map, Value};
use sha_crypt::{sha512_simple, Sha512Params};
use tracing::{debug, warn};

use crate::constants::metadata::AZURE_DEFAULT_INSTANCE_ID;
use crate::parsers::{decode_base64, is_false, Parser};
use crate::record::{AuxFile, BlobPayload, MetadataRecord, MetadataValue, ParsedMetadata, RawMetadataBlob};
use crate::redact::{redact_xml, REDACTED};

/// Name under which the document is cached
pub const OVF_ENV_FILE: &str = "ovf-env.xml";

pub struct AzureParser;

/// Document text with any byte-order mark removed
pub(crate) fn document_text(blob: &RawMetadataBlob) -> Result<&str, ParseError> {
    let BlobPayload::Document { bytes, .. } = &blob.payload else {
        return Err(ParseError::not_this_platform("expected a provisioning document"));
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::malformed(format!("document is not UTF-8: {}", e)))?;
    Ok(text.trim_start_matches('\u{feff}'))
}

/// Element children with local name `name`
pub(crate) fn children_named<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Vec<Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().name() == name)
        .collect()
}

/// Text of an element whose only child is a text node
pub(crate) fn simple_text<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    let mut children = node.children();
    match (children.next(), children.next()) {
        (Some(only), None) if only.is_text() => only.text(),
        _ => None,
    }
}

/// Exactly one child named `name`: absent is "not this platform", several is malformed
fn single_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, ParseError> {
    let mut found = children_named(node, name);
    match found.len() {
        0 => Err(ParseError::not_this_platform(format!("No {}", name))),
        1 => Ok(found.remove(0)),
        n => Err(ParseError::malformed(format!("found '{}' {} items", n, name))),
    }
}

fn load_pubkeys(ssh: Node<'_, '_>) -> Result<Vec<Value>, ParseError> {
    let containers = children_named(ssh, "PublicKeys");
    let container = match containers.len() {
        0 => return Ok(Vec::new()),
        1 => containers[0],
        n => return Err(ParseError::malformed(format!("Multiple 'PublicKeys'({}) in SSH node", n))),
    };

    let keys = children_named(container, "PublicKey")
        .into_iter()
        .filter(|pk| pk.has_children())
        .map(|pk| {
            let mut entry = Map::new();
            for field in ["fingerprint", "path", "value"] {
                entry.insert(field.to_string(), Value::String(String::new()));
            }
            for child in pk.children().filter(|c| c.is_element()) {
                let name = child.tag_name().name().to_ascii_lowercase();
                if let (Some(slot), Some(text)) = (entry.get_mut(&name), simple_text(child)) {
                    *slot = Value::String(text.trim().to_string());
                }
            }
            Value::Object(entry)
        })
        .collect();
    Ok(keys)
}

fn payload_bytes(node: Node<'_, '_>, value: &str, what: &str) -> Result<Vec<u8>, ParseError> {
    match node.attribute("encoding") {
        None | Some("base64") => {
            decode_base64(value).ok_or_else(|| ParseError::malformed(format!("{} is not valid base64", what)))
        }
        Some(_) => Ok(value.as_bytes().to_vec()),
    }
}

/// SHA-512 crypt (`$6$`) with a random salt
pub fn hash_password(password: &str) -> Result<String, String> {
    sha512_simple(password, &Sha512Params::default()).map_err(|e| format!("{:?}", e))
}

impl Parser for AzureParser {
    fn decode(&self, blob: &RawMetadataBlob) -> Result<ParsedMetadata, ParseError> {
        let text = document_text(blob)?;
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| ParseError::malformed(format!("Invalid ovf-env.xml: {}", e)))?;

        let section = single_child(doc.root_element(), "ProvisioningSection")?;
        let config_set = single_child(section, "LinuxProvisioningConfigurationSet")?;
        if !config_set.children().any(|c| c.is_element()) {
            return Err(ParseError::malformed("no child nodes of configuration set"));
        }

        let mut record = MetadataRecord::builder();
        let mut azure_data = BTreeMap::new();
        let mut overrides = Map::new();
        let mut user_data = None;
        let mut username = None;
        let mut password = None;
        let mut warnings = Vec::new();

        for child in config_set.children().filter(|c| c.is_element()) {
            let name = child.tag_name().name().to_ascii_lowercase();
            let simple = simple_text(child);
            let value = simple.unwrap_or("");

            match name.as_str() {
                "userdata" | "customdata" => user_data = Some(payload_bytes(child, value, "UserData")?),
                "username" => username = Some(value.to_string()),
                "userpassword" => password = Some(value.to_string()),
                "hostname" => {
                    record.insert("local-hostname", value);
                }
                "dscfg" => {
                    let raw = payload_bytes(child, value, "dscfg")?;
                    let cfg = match serde_yaml::from_slice::<Value>(&raw) {
                        Ok(Value::Null) => json!({}),
                        Ok(cfg) => cfg,
                        Err(e) => {
                            warn!(error = %e, "Ignoring unreadable dscfg");
                            warnings.push(format!("dscfg: {}", e));
                            json!({})
                        }
                    };
                    overrides.insert("datasource".to_string(), json!({ "Azure": cfg }));
                }
                "ssh" => {
                    overrides.insert("_pubkeys".to_string(), Value::Array(load_pubkeys(child)?));
                }
                "disablesshpasswordauthentication" => {
                    overrides.insert("ssh_pwauth".to_string(), Value::Bool(is_false(value)));
                }
                "seedfrom" if simple.is_some() => {
                    record.insert("seedfrom", value);
                }
                _ if simple.is_some() => {
                    azure_data.insert(name, MetadataValue::from(value));
                }
                _ => debug!(element = %name, "Ignoring structured element"),
            }
        }

        let public_keys: Vec<String> = overrides
            .get("_pubkeys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.get("value").and_then(Value::as_str))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !public_keys.is_empty() {
            record.insert("public-keys", public_keys);
        }
        record.insert("azure_data", MetadataValue::Map(azure_data));
        record.insert_default("instance-id", AZURE_DEFAULT_INSTANCE_ID);

        let mut default_user = Map::new();
        if let Some(name) = username.filter(|n| !n.is_empty()) {
            default_user.insert("name".to_string(), Value::String(name));
        }
        match password.as_deref() {
            Some(pw) if !pw.is_empty() && pw != REDACTED => match hash_password(pw) {
                Ok(hashed) => {
                    default_user.insert("passwd".to_string(), Value::String(hashed));
                    default_user.insert("lock_passwd".to_string(), Value::Bool(false));
                }
                Err(e) => {
                    warn!(error = %e, "Could not hash provisioning password; account stays locked");
                    warnings.push(format!("password: {}", e));
                }
            },
            Some(REDACTED) => debug!("Password was redacted in cached copy"),
            _ => {}
        }
        if !default_user.is_empty() {
            overrides.insert("system_info".to_string(), json!({ "default_user": default_user }));
        }
        if password.as_deref().is_some_and(|pw| !pw.is_empty()) && !overrides.contains_key("ssh_pwauth") {
            overrides.insert("ssh_pwauth".to_string(), Value::Bool(true));
        }

        let redacted = redact_xml(text).map_err(|e| ParseError::malformed(format!("Invalid ovf-env.xml: {}", e)))?;

        Ok(ParsedMetadata {
            record: record.build(),
            user_data,
            overrides: Value::Object(overrides),
            aux_files: vec![AuxFile {
                name: OVF_ENV_FILE.to_string(),
                contents: redacted.into_bytes(),
                executable: false,
            }],
            warnings,
            ..ParsedMetadata::default()
        })
    }
}
