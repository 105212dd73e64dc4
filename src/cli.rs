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

//! Command Line Interface

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use bm_core::constants::paths;
use bm_core::redact::{redact_json, redact_record};
use bm_core::transport::SerialTransport;
use bm_core::{
    synthesize, BlobPayload, DetectionContext, InterfaceEnumerator, LinuxDevices, NicDescriptor,
    Orchestrator, Settings, Synthesis, SynthesisInput, SysfsFirmware, SysfsInterfaces, SystemClock,
    SystemCommandRunner,
};
use bm_protocol::{validate_key, SerialClient};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{load_mac_map, load_nic_list};
use crate::logger::{boot_summary, log_event, user_data_digest};

#[derive(Parser)]
#[command(name = "bootmeta")]
#[command(version)]
#[command(about = "Early boot platform detection and instance metadata")]
#[command(long_about = "bootmeta - early boot platform detection and instance metadata

Identifies the cloud platform hosting this instance, retrieves its metadata
and derives the instance's network configuration.

EXAMPLES:
    bootmeta detect                         Show which platform was identified
    bootmeta fetch                          Run the whole pipeline, print the result
    bootmeta net-convert --input nics.json  Convert a NIC list to network config
    bootmeta query --device /dev/ttyS1 sdc:uuid hostname
    bootmeta show-config                    Show effective settings

ENVIRONMENT VARIABLES:
    RUST_LOG=debug         Enable debug logging
    BOOTMETA_CONFIG=PATH   Settings file (default /etc/bootmeta/bootmeta.json)")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Append events to the JSON event log
    #[arg(long, global = true)]
    pub logging: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate platform signatures and print the selection
    Detect,

    /// Select, fetch and decode metadata, then print record, config and network config
    Fetch {
        /// Include user data (base64) in the output
        #[arg(long)]
        user_data: bool,
    },

    /// Convert a SmartOS-style NIC list to canonical network config
    NetConvert {
        /// JSON list of NIC descriptors
        #[arg(long)]
        input: PathBuf,

        /// JSON object mapping MAC addresses to interface names
        #[arg(long)]
        mac_map: Option<PathBuf>,
    },

    /// Query keys over the serial metadata protocol
    Query {
        /// Serial device
        #[arg(long, default_value = paths::SMARTOS_SERIAL_DEVICE)]
        device: PathBuf,

        /// Keys to request
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Print effective settings as JSON
    ShowConfig,
}

// ============================================================================
// Host Capabilities
// ============================================================================

/// The real machine, as seen from early boot
pub struct Host {
    firmware: SysfsFirmware,
    devices: LinuxDevices<SystemCommandRunner>,
    interfaces: SysfsInterfaces,
    clock: SystemClock,
}

impl Host {
    pub fn new() -> Self {
        Self {
            firmware: SysfsFirmware::new("/"),
            devices: LinuxDevices::new(SystemCommandRunner, paths::MOUNT_ROOT),
            interfaces: SysfsInterfaces::new("/"),
            clock: SystemClock::new(),
        }
    }

    pub fn context(&self) -> DetectionContext<'_> {
        DetectionContext::new(&self.firmware, &self.devices, &self.interfaces, &self.clock)
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CLI Execution
// ============================================================================

pub fn run_cli(cli: &Cli, settings: &Settings) -> Result<()> {
    match &cli.command {
        Commands::Detect => cmd_detect(settings),
        Commands::Fetch { user_data } => cmd_fetch(settings, *user_data),
        Commands::NetConvert { input, mac_map } => cmd_net_convert(settings, input, mac_map.as_deref()),
        Commands::Query { device, keys } => cmd_query(settings, device, keys),
        Commands::ShowConfig => cmd_show_config(settings),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_detect(settings: &Settings) -> Result<()> {
    let host = Host::new();
    let ctx = host.context();
    let selection = Orchestrator::new(settings).detect(&ctx)?;
    log_event("detect", serde_json::to_value(&selection)?);
    print_json(&serde_json::to_value(&selection)?)
}

fn cmd_fetch(settings: &Settings, include_user_data: bool) -> Result<()> {
    let host = Host::new();
    let ctx = host.context();
    let metadata = Orchestrator::new(settings).run(&ctx)?;
    log_event("claim", boot_summary(&metadata));

    let network = metadata.network_config(&host.interfaces);
    info!(
        platform = %metadata.platform,
        devices = network.config.devices().count(),
        "Metadata retrieved"
    );

    let mut config = metadata.config.clone();
    redact_json(&mut config);
    let mut output = json!({
        "platform": metadata.platform,
        "source": metadata.source,
        "from_cache": metadata.from_cache,
        "record": redact_record(&metadata.record),
        "config": config,
        "network": network.config,
        "network_diagnostics": network.diagnostics,
        "user_data_sha256": metadata.user_data.as_deref().map(user_data_digest),
        "warnings": metadata.warnings,
    });
    if include_user_data {
        use base64::Engine;
        output["user_data"] = json!(metadata
            .user_data
            .as_deref()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)));
    }
    print_json(&output)
}

/// Convert NICs, naming interfaces from the MAC map first, then the NIC's own
/// declaration, then the host
pub fn convert_nics(
    nics: &[NicDescriptor],
    mac_map: &BTreeMap<String, String>,
    link_only_drivers: &[String],
    host: &dyn InterfaceEnumerator,
) -> Synthesis {
    let resolver = |mac: &str| {
        mac_map
            .get(&mac.to_ascii_lowercase())
            .cloned()
            .or_else(|| {
                nics.iter()
                    .find(|nic| nic.mac.eq_ignore_ascii_case(mac))
                    .and_then(|nic| nic.interface.clone())
            })
            .or_else(|| host.resolve(mac))
    };
    let drivers = |name: &str| host.driver_of(name);
    synthesize(&SynthesisInput {
        nics,
        resolver: &resolver,
        driver_lookup: Some(&drivers),
        link_only_drivers,
        dns: None,
    })
}

fn cmd_net_convert(settings: &Settings, input: &Path, mac_map: Option<&Path>) -> Result<()> {
    let nics = load_nic_list(input)?;
    let mac_map = match mac_map {
        Some(path) => load_mac_map(path)?,
        None => BTreeMap::new(),
    };
    let host = SysfsInterfaces::new("/");
    let synthesis = convert_nics(&nics, &mac_map, &settings.network.link_only_drivers, &host);
    for diagnostic in &synthesis.diagnostics {
        eprintln!("note: {}", diagnostic);
    }
    print_json(&serde_json::to_value(&synthesis.config)?)
}

fn cmd_query(settings: &Settings, device: &Path, keys: &[String]) -> Result<()> {
    for key in keys {
        validate_key(key).map_err(|reason| anyhow!("invalid key '{}': {}", key, reason))?;
    }
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let transport = SerialTransport::new(device, settings.smartos.read_timeout()).with_keys(&key_refs);

    let port = transport.open().with_context(|| format!("opening {}", device.display()))?;
    let mut client = SerialClient::new(port);
    let blob = transport.query_keys(&mut client)?;
    for warning in &blob.warnings {
        eprintln!("warning: {}", warning);
    }

    let BlobPayload::Keys(values) = blob.payload else {
        bail!("unexpected payload from {}", device.display());
    };
    let answers: BTreeMap<&str, Option<&String>> = keys.iter().map(|k| (k.as_str(), values.get(k))).collect();
    print_json(&serde_json::to_value(answers)?)
}

fn cmd_show_config(settings: &Settings) -> Result<()> {
    let mut value = serde_json::to_value(settings)?;
    redact_json(&mut value);
    print_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_core::HostInterface;

    struct NoInterfaces;

    impl InterfaceEnumerator for NoInterfaces {
        fn resolve(&self, _mac: &str) -> Option<String> {
            None
        }

        fn driver_of(&self, _name: &str) -> Option<String> {
            None
        }

        fn list(&self) -> Vec<HostInterface> {
            Vec::new()
        }
    }

    fn create_test_nic(mac: &str, interface: Option<&str>, ips: &[&str]) -> NicDescriptor {
        NicDescriptor {
            mac: mac.to_string(),
            interface: interface.map(str::to_string),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from(["bootmeta", "fetch", "--config", "/tmp/x.json", "--user-data"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.json")));
        assert!(matches!(cli.command, Commands::Fetch { user_data: true }));
    }

    #[test]
    fn test_query_requires_keys() {
        assert!(Cli::try_parse_from(["bootmeta", "query"]).is_err());
        let cli = Cli::try_parse_from(["bootmeta", "query", "sdc:uuid"]).unwrap();
        match cli.command {
            Commands::Query { device, keys } => {
                assert_eq!(device, PathBuf::from(paths::SMARTOS_SERIAL_DEVICE));
                assert_eq!(keys, vec!["sdc:uuid"]);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_mac_map_wins_over_declared_interface() {
        let nics = vec![
            create_test_nic("90:b8:d0:f5:e4:f5", Some("net0"), &["10.0.0.5/24"]),
            create_test_nic("90:b8:d0:a5:ff:cd", Some("net1"), &["dhcp"]),
        ];
        let mac_map = BTreeMap::from([("90:b8:d0:f5:e4:f5".to_string(), "eth0".to_string())]);
        let synthesis = convert_nics(&nics, &mac_map, &[], &NoInterfaces);
        let names: Vec<&str> = synthesis.config.devices().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "net1"]);
    }
}
