//! Credential redaction
//!
//! Anything that looks like a password or secret is replaced with
//! [`REDACTED`] before a document is written to a log or cache.

use std::collections::BTreeMap;

use crate::record::{MetadataRecord, MetadataValue};

/// Replacement written in place of a credential
pub const REDACTED: &str = "REDACTED";

/// Lowercase fragments marking a field name as a credential
const SENSITIVE_MARKERS: &[&str] = &["password", "passwd", "secret", "token", "credential", "privatekey"];

/// Whether a field name looks like it holds a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let folded: String = key
        .chars()
        .filter(|c| !matches!(c, '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_MARKERS.iter().any(|m| folded.contains(m))
}

/// Redact credential-like fields of a JSON value in place
pub fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if is_sensitive_key(key) && !child.is_null() {
                    *child = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_json(child);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}

fn redact_value(value: &MetadataValue) -> MetadataValue {
    match value {
        MetadataValue::Map(map) => MetadataValue::Map(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        MetadataValue::from(REDACTED)
                    } else {
                        redact_value(v)
                    };
                    (k.clone(), v)
                })
                .collect::<BTreeMap<_, _>>(),
        ),
        MetadataValue::List(items) => MetadataValue::List(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

/// Copy of `record` safe to persist
pub fn redact_record(record: &MetadataRecord) -> MetadataRecord {
    let mut builder = MetadataRecord::builder();
    for (key, value) in record.iter() {
        if is_sensitive_key(key) {
            builder.insert(key.clone(), REDACTED);
        } else {
            builder.insert(key.clone(), redact_value(value));
        }
    }
    builder.build()
}

/// Replace the text of credential-like XML elements, keeping every other byte.
pub fn redact_xml(text: &str) -> Result<String, roxmltree::Error> {
    let doc = roxmltree::Document::parse(text)?;
    let mut ranges: Vec<std::ops::Range<usize>> = doc
        .descendants()
        .filter(|n| n.is_element() && is_sensitive_key(n.tag_name().name()))
        .flat_map(|n| n.children().filter(|c| c.is_text()).map(|c| c.range()))
        .collect();
    ranges.sort_by_key(|r| r.start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for range in ranges {
        if range.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..range.start]);
        out.push_str(REDACTED);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
