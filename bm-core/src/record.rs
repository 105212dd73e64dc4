//! Metadata records and raw transport payloads

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::netconfig::{DnsInfo, NicDescriptor};

// ============================================================================
// Metadata Values
// ============================================================================

/// A metadata value: string, ordered list or nested map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, MetadataValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Follow a `/`-separated path through nested maps
    pub fn lookup(&self, path: &str) -> Option<&MetadataValue> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.as_map()?.get(part))
    }

    /// Values as a list of strings, treating a lone string as a one-element list
    pub fn string_items(&self) -> Vec<String> {
        match self {
            Self::String(s) => vec![s.clone()],
            Self::List(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Self::Map(_) => Vec::new(),
        }
    }

    /// Convert arbitrary JSON; scalars become strings and `null` becomes `""`
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Null => Self::String(String::new()),
            serde_json::Value::Bool(b) => Self::String(b.to_string()),
            serde_json::Value::Number(n) => Self::String(n.to_string()),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items.into_iter().map(Self::String).collect())
    }
}

// ============================================================================
// Metadata Record
// ============================================================================

/// Decoded instance metadata. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    entries: BTreeMap<String, MetadataValue>,
}

impl MetadataRecord {
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.get_str("instance-id")
    }

    pub fn local_hostname(&self) -> Option<&str> {
        self.get_str("local-hostname")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy into a builder, for deriving an adjusted record
    pub fn to_builder(&self) -> RecordBuilder {
        RecordBuilder {
            entries: self.entries.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordBuilder {
    entries: BTreeMap<String, MetadataValue>,
}

impl RecordBuilder {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Insert only if `key` is not yet present
    pub fn insert_default(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> &mut Self {
        self.entries.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn extend(&mut self, map: BTreeMap<String, MetadataValue>) -> &mut Self {
        self.entries.extend(map);
        self
    }

    pub fn build(self) -> MetadataRecord {
        MetadataRecord {
            entries: self.entries,
        }
    }
}

// ============================================================================
// Transport Payloads
// ============================================================================

/// Raw payload shapes produced by the transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPayload {
    /// Crawled key/value tree
    Tree(MetadataValue),
    /// Flat key/value answers from the serial protocol
    Keys(BTreeMap<String, String>),
    /// One document read from a volume
    Document { name: String, bytes: Vec<u8> },
    /// Nothing fetched; fallback platform
    Empty,
}

/// What a transport hands to a parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMetadataBlob {
    /// Where the payload came from (url, device, directory)
    pub source: String,
    pub payload: BlobPayload,
    /// Payload was read from a cached copy rather than live media
    pub from_cache: bool,
    /// Partial-retrieval problems that did not prevent the fetch
    pub warnings: Vec<String>,
}

impl RawMetadataBlob {
    pub fn new(source: impl Into<String>, payload: BlobPayload) -> Self {
        Self {
            source: source.into(),
            payload,
            from_cache: false,
            warnings: Vec::new(),
        }
    }
}

// ============================================================================
// Parser Output
// ============================================================================

/// A file produced alongside the record, already safe to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFile {
    pub name: String,
    pub contents: Vec<u8>,
    /// Scripts the guest runs are written owner-executable
    pub executable: bool,
}

/// Everything a parser extracts from one blob
#[derive(Debug, Clone, Default)]
pub struct ParsedMetadata {
    pub record: MetadataRecord,
    pub user_data: Option<Vec<u8>>,
    /// Platform-detected config layer
    pub overrides: serde_json::Value,
    pub aux_files: Vec<AuxFile>,
    pub nics: Vec<NicDescriptor>,
    pub dns: Option<DnsInfo>,
    pub warnings: Vec<String>,
}
