//! OVF environment parser (VMware and other OVF transports)

use bm_error::ParseError;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::constants::metadata::OVF_DEFAULT_INSTANCE_ID;
use crate::parsers::azure::{children_named, document_text, OVF_ENV_FILE};
use crate::parsers::{decode_base64, split_public_keys, Parser};
use crate::record::{AuxFile, MetadataRecord, ParsedMetadata, RawMetadataBlob};
use crate::redact::{redact_xml, REDACTED};

/// Namespace of `oe:key` / `oe:value`
const OVF_ENV_NS: &str = "http://schemas.dmtf.org/ovf/environment/1";

pub struct OvfParser;

/// `(key, value)` pairs from the first PropertySection
fn properties(doc: &roxmltree::Document<'_>) -> Result<Vec<(String, String)>, ParseError> {
    let root = doc.root_element();
    if root.tag_name().name() != "Environment" {
        return Err(ParseError::not_this_platform("No Environment Node"));
    }
    let sections = children_named(root, "PropertySection");
    let Some(section) = sections.first() else {
        return Err(ParseError::not_this_platform("No 'PropertySection's"));
    };

    let mut props = Vec::new();
    for elem in children_named(*section, "Property") {
        let attr = |name: &str| {
            elem.attribute((OVF_ENV_NS, name))
                .or_else(|| elem.attributes().find(|a| a.name() == name).map(|a| a.value()))
        };
        match (attr("key"), attr("value")) {
            (Some(key), Some(value)) => props.push((key.to_string(), value.to_string())),
            _ => return Err(ParseError::malformed("Property without key or value")),
        }
    }
    Ok(props)
}

impl Parser for OvfParser {
    fn decode(&self, blob: &RawMetadataBlob) -> Result<ParsedMetadata, ParseError> {
        let text = document_text(blob)?;
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| ParseError::malformed(format!("Invalid ovf environment: {}", e)))?;

        let mut record = MetadataRecord::builder();
        let mut overrides = Map::new();
        let mut user_data = None;

        for (key, value) in properties(&doc)? {
            let key = if key == "hostname" { "local-hostname".to_string() } else { key };
            match key.as_str() {
                "public-keys" => {
                    record.insert(key, split_public_keys(&value));
                }
                "seedfrom" | "local-hostname" | "instance-id" => {
                    record.insert(key, value);
                }
                "password" if value == REDACTED => debug!("Password was redacted in cached copy"),
                "password" => {
                    overrides.insert(key, Value::String(value));
                }
                "user-data" => {
                    user_data = Some(decode_base64(&value).unwrap_or_else(|| value.into_bytes()));
                }
                other => debug!(property = %other, "Ignoring OVF property"),
            }
        }
        record.insert_default("instance-id", OVF_DEFAULT_INSTANCE_ID);

        let mut warnings = Vec::new();
        let aux_files = match redact_xml(text) {
            Ok(redacted) => vec![AuxFile {
                name: OVF_ENV_FILE.to_string(),
                contents: redacted.into_bytes(),
                executable: false,
            }],
            Err(e) => {
                warn!(error = %e, "Not caching OVF environment");
                warnings.push(format!("not cached: {}", e));
                Vec::new()
            }
        };

        Ok(ParsedMetadata {
            record: record.build(),
            user_data,
            overrides: Value::Object(overrides),
            aux_files,
            warnings,
            ..ParsedMetadata::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BlobPayload;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn create_test_env(props: &[(&str, &str)]) -> RawMetadataBlob {
        let properties: String = props
            .iter()
            .map(|(k, v)| format!("        <Property oe:key=\"{}\" oe:value=\"{}\"/>\n", k, v))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
  xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
  oe:id="WebTier">
  <PlatformSection>
    <Kind>ESX Server</Kind>
  </PlatformSection>
  <PropertySection>
{}  </PropertySection>
</Environment>
"#,
            properties
        );
        RawMetadataBlob::new(
            "/dev/sr0",
            BlobPayload::Document {
                name: "ovf-env.xml".to_string(),
                bytes: xml.into_bytes(),
            },
        )
    }

    #[test]
    fn test_with_b64_userdata() {
        let user_data = "#!/bin/sh\necho hello world\n";
        let encoded = STANDARD.encode(user_data);
        let blob = create_test_env(&[
            ("user-data", encoded.as_str()),
            ("password", "passw0rd"),
            ("instance-id", "inst-001"),
        ]);
        let parsed = OvfParser.decode(&blob).unwrap();

        assert_eq!(parsed.record.instance_id(), Some("inst-001"));
        assert_eq!(parsed.record.len(), 1);
        assert_eq!(parsed.user_data.as_deref(), Some(user_data.as_bytes()));
        assert_eq!(parsed.overrides, serde_json::json!({"password": "passw0rd"}));

        let aux = String::from_utf8(parsed.aux_files[0].contents.clone()).unwrap();
        assert!(!aux.contains("passw0rd"));
    }

    #[test]
    fn test_with_non_b64_userdata() {
        let blob = create_test_env(&[("user-data", "my-user-data"), ("instance-id", "inst-001")]);
        let parsed = OvfParser.decode(&blob).unwrap();
        assert_eq!(parsed.user_data.as_deref(), Some(&b"my-user-data"[..]));
        assert_eq!(parsed.overrides, serde_json::json!({}));
    }

    #[test]
    fn test_hostname_alias_and_default_instance_id() {
        let blob = create_test_env(&[("hostname", "vm1"), ("public-keys", "ssh-rsa AAA k")]);
        let parsed = OvfParser.decode(&blob).unwrap();
        assert_eq!(parsed.record.local_hostname(), Some("vm1"));
        assert_eq!(parsed.record.instance_id(), Some(OVF_DEFAULT_INSTANCE_ID));
        assert_eq!(parsed.record.get("public-keys").unwrap().string_items(), vec!["ssh-rsa AAA k"]);
        assert!(parsed.user_data.is_none());
    }

    #[test]
    fn test_redacted_password_is_ignored() {
        let blob = create_test_env(&[("password", "REDACTED")]);
        assert_eq!(OvfParser.decode(&blob).unwrap().overrides, serde_json::json!({}));
    }

    #[test]
    fn test_missing_property_section_is_not_this_platform() {
        let blob = RawMetadataBlob::new(
            "/dev/sr0",
            BlobPayload::Document {
                name: "ovf-env.xml".into(),
                bytes: b"<Environment><PlatformSection/></Environment>".to_vec(),
            },
        );
        assert!(matches!(OvfParser.decode(&blob), Err(ParseError::NotThisPlatform(_))));
    }

    #[test]
    fn test_wrong_root_is_not_this_platform() {
        let blob = RawMetadataBlob::new(
            "/dev/sr0",
            BlobPayload::Document {
                name: "ovf-env.xml".into(),
                bytes: b"<Other/>".to_vec(),
            },
        );
        assert!(matches!(OvfParser.decode(&blob), Err(ParseError::NotThisPlatform(_))));
    }
}
