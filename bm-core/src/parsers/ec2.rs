//! EC2-style metadata tree parser (Amazon EC2 and Alibaba Cloud)

use std::collections::BTreeMap;

use bm_error::ParseError;
use serde_json::Value;
use tracing::debug;

use crate::netconfig::NicDescriptor;
use crate::parsers::{split_public_keys, Parser};
use crate::record::{BlobPayload, MetadataRecord, MetadataValue, ParsedMetadata, RawMetadataBlob};

const MACS_PATH: &str = "network/interfaces/macs";

pub struct Ec2Parser;

/// Flatten the `public-keys` subtree into one key per entry.
///
/// The service lists keys as `0=name` with the body under `0/openssh-key`,
/// seeds usually carry a plain list or string.
fn normalize_public_keys(value: &MetadataValue) -> Vec<String> {
    match value {
        MetadataValue::String(s) => split_public_keys(s),
        MetadataValue::List(items) => items.iter().flat_map(normalize_public_keys).collect(),
        MetadataValue::Map(entries) => entries
            .values()
            .flat_map(|v| match v.as_map().and_then(|m| m.get("openssh-key")) {
                Some(key) => normalize_public_keys(key),
                None => normalize_public_keys(v),
            })
            .collect(),
    }
}

fn has_entries(nic: &BTreeMap<String, MetadataValue>, key: &str) -> bool {
    nic.get(key)
        .map(|v| v.string_items().iter().any(|s| !s.trim().is_empty()))
        .unwrap_or(false)
}

/// NIC descriptors from `network/interfaces/macs`, ordered by device number
fn nics_from_macs(meta: &MetadataValue) -> Vec<NicDescriptor> {
    let Some(macs) = meta.lookup(MACS_PATH).and_then(MetadataValue::as_map) else {
        return Vec::new();
    };

    let mut found: Vec<(u32, NicDescriptor)> = macs
        .iter()
        .filter_map(|(mac, entry)| {
            let nic = entry.as_map()?;
            let device_number = nic
                .get("device-number")
                .and_then(MetadataValue::as_str)
                .and_then(|d| d.trim().parse::<u32>().ok())
                .unwrap_or(u32::MAX);

            let mut ips = Vec::new();
            if has_entries(nic, "local-ipv4s") || has_entries(nic, "public-ipv4s") {
                ips.push("dhcp4".to_string());
            }
            if has_entries(nic, "ipv6s") {
                ips.push("dhcp6".to_string());
            }
            let mac = nic
                .get("mac")
                .and_then(MetadataValue::as_str)
                .unwrap_or(mac.as_str())
                .to_ascii_lowercase();

            Some((
                device_number,
                NicDescriptor {
                    mac,
                    ips,
                    ..Default::default()
                },
            ))
        })
        .collect();

    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.mac.cmp(&b.1.mac)));
    found.into_iter().map(|(_, nic)| nic).collect()
}

fn user_data_bytes(value: &MetadataValue) -> Option<Vec<u8>> {
    match value {
        MetadataValue::String(s) => Some(s.as_bytes().to_vec()),
        MetadataValue::List(_) => Some(value.string_items().join("\n").into_bytes()),
        MetadataValue::Map(_) => None,
    }
}

impl Parser for Ec2Parser {
    fn decode(&self, blob: &RawMetadataBlob) -> Result<ParsedMetadata, ParseError> {
        let BlobPayload::Tree(tree) = &blob.payload else {
            return Err(ParseError::not_this_platform("expected a metadata tree"));
        };
        let meta = tree
            .lookup("meta-data")
            .and_then(MetadataValue::as_map)
            .ok_or_else(|| ParseError::not_this_platform("no meta-data in tree"))?;

        match meta.get("instance-id").and_then(MetadataValue::as_str) {
            Some(id) if !id.trim().is_empty() => {}
            _ => return Err(ParseError::not_this_platform("meta-data has no instance-id")),
        }

        let mut record = MetadataRecord::builder();
        record.extend(meta.clone());
        if let Some(keys) = meta.get("public-keys") {
            record.insert("public-keys", normalize_public_keys(keys));
        }

        let meta_value = MetadataValue::Map(meta.clone());
        let nics = nics_from_macs(&meta_value);
        debug!(count = nics.len(), source = %blob.source, "Parsed metadata tree");

        Ok(ParsedMetadata {
            record: record.build(),
            user_data: tree.lookup("user-data").and_then(user_data_bytes),
            overrides: Value::Object(Default::default()),
            nics,
            ..ParsedMetadata::default()
        })
    }
}
