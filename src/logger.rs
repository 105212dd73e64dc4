/*
 * This file is part of bootmeta.
 *
 * Copyright (C) 2025 bootmeta contributors
 *
 * bootmeta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * bootmeta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with bootmeta. If not, see <https://www.gnu.org/licenses/>.
 */

//! JSON-lines event log
//!
//! One line per event: `{"ts_ms": .., "event": .., "data": ..}`. Data is
//! redacted before it is written; user data is only ever logged as a digest.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bm_core::redact::{redact_json, redact_record};
use bm_core::BootMetadata;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const DEFAULT_LOG_PATH: &str = "/var/log/bootmeta/events.json";
const FALLBACK_LOG_PATH: &str = "/tmp/bootmeta_events.json";

lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Log to the default location, falling back to /tmp when /var/log is unavailable
pub fn init_logging() {
    let file = open_append(Path::new(DEFAULT_LOG_PATH)).or_else(|_| open_append(Path::new(FALLBACK_LOG_PATH)));
    if let (Ok(f), Ok(mut guard)) = (file, LOG_FILE.lock()) {
        *guard = Some(f);
    }
}

/// Log to `path` instead of the default location
pub fn init_logging_at(path: &Path) -> std::io::Result<()> {
    let f = open_append(path)?;
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(f);
    }
    Ok(())
}

/// Stop logging; later events are dropped
pub fn close_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = None;
    }
}

/// Append one event. Does nothing until logging is initialized.
pub fn log_event(event: &str, mut data: Value) {
    redact_json(&mut data);
    let line = json!({
        "ts_ms": now_millis(),
        "event": event,
        "data": data,
    })
    .to_string();

    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(f) = guard.as_mut() {
            let _ = writeln!(f, "{}", line);
        }
    }
}

/// Hex sha256 of user data
pub fn user_data_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Redacted summary of a boot: who claimed it, from where, and what went wrong on the way
pub fn boot_summary(metadata: &BootMetadata) -> Value {
    let mut config = metadata.config.clone();
    redact_json(&mut config);
    json!({
        "platform": metadata.platform,
        "source": metadata.source,
        "from_cache": metadata.from_cache,
        "selection": metadata.selection,
        "attempts": metadata.attempts,
        "record": redact_record(&metadata.record),
        "config": config,
        "user_data_sha256": metadata.user_data.as_deref().map(user_data_digest),
        "user_data_bytes": metadata.user_data.as_ref().map(Vec::len),
        "cached_files": metadata.cached_files,
        "warnings": metadata.warnings,
    })
}
