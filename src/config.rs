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

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bm_core::{load_settings, settings_path, validate_settings, NicDescriptor, Settings};

/// Settings file to use: the explicit one, else `BOOTMETA_CONFIG`, else the system default
pub fn resolve_settings_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map(Path::to_path_buf).unwrap_or_else(settings_path)
}

/// Load and validate settings. A missing file yields defaults.
pub fn load_effective_settings(explicit: Option<&Path>) -> Result<Settings> {
    let path = resolve_settings_path(explicit);
    let settings = load_settings(&path).with_context(|| format!("loading {}", path.display()))?;
    validate_settings(&settings).map_err(|reason| anyhow!("invalid settings in {}: {}", path.display(), reason))?;
    Ok(settings)
}

/// NIC descriptors in the SmartOS `sdc:nics` JSON shape
pub fn load_nic_list(path: &Path) -> Result<Vec<NicDescriptor>> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing NIC list {}", path.display()))
}

/// `{"<mac>": "<interface>"}` with MACs normalized to lowercase
pub fn load_mac_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: BTreeMap<String, String> =
        serde_json::from_str(&content).with_context(|| format!("parsing MAC map {}", path.display()))?;
    Ok(raw
        .into_iter()
        .map(|(mac, name)| (mac.to_ascii_lowercase(), name))
        .collect())
}
