//! Network Config Synthesizer
//!
//! Turns platform NIC descriptors into the canonical version-1 network
//! configuration. The conversion is a pure function of its input: the same
//! descriptors and resolver answers always serialize to the same bytes.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capabilities::HostInterface;

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of an address, with or without a `/prefix`
    pub fn of(address: &str) -> Self {
        let host = address.split('/').next().unwrap_or(address);
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Self::Ipv4,
            Ok(IpAddr::V6(_)) => Self::Ipv6,
            Err(_) if host.contains(':') => Self::Ipv6,
            Err(_) => Self::Ipv4,
        }
    }

    pub fn max_prefix(&self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }
}

/// One parsed ip entry of a NIC
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpEntry {
    Dhcp4,
    Dhcp6,
    Static {
        address: String,
        prefix: Option<u8>,
        family: AddressFamily,
    },
}

impl IpEntry {
    /// `dhcp`/`dhcp4`, `dhcp6`, otherwise a static address. A prefix that is
    /// not valid for the address family stays part of the address literal.
    pub fn parse(literal: &str) -> Self {
        let literal = literal.trim();
        match literal {
            "dhcp" | "dhcp4" => Self::Dhcp4,
            "dhcp6" => Self::Dhcp6,
            _ => {
                let family = AddressFamily::of(literal);
                let split = literal.split_once('/').and_then(|(addr, prefix)| {
                    let prefix = prefix.parse::<u8>().ok()?;
                    (prefix <= family.max_prefix()).then_some((addr, Some(prefix)))
                });
                let (address, prefix) = split.unwrap_or((literal, None));
                Self::Static {
                    address: address.to_string(),
                    prefix,
                    family,
                }
            }
        }
    }

    fn cidr(&self) -> Option<String> {
        match self {
            Self::Static {
                address,
                prefix: Some(prefix),
                ..
            } => Some(format!("{}/{}", address, prefix)),
            Self::Static { address, .. } => Some(address.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEntry {
    pub address: String,
    pub family: AddressFamily,
}

impl GatewayEntry {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.trim().to_string(),
            family: AddressFamily::of(address),
        }
    }
}

/// A NIC as described by platform metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDescriptor {
    pub mac: String,
    /// Interface id declared by the platform, if any
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub gateways: Vec<String>,
    #[serde(default)]
    pub primary: Option<bool>,
    /// Emit without IP configuration
    #[serde(default)]
    pub link_only: bool,
}

impl NicDescriptor {
    pub fn ip_entries(&self) -> Vec<IpEntry> {
        self.ips.iter().map(|ip| IpEntry::parse(ip)).collect()
    }

    pub fn gateway_entries(&self) -> Vec<GatewayEntry> {
        self.gateways.iter().map(|gw| GatewayEntry::new(gw)).collect()
    }
}

/// DNS servers and search domains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsInfo {
    pub addresses: Vec<String>,
    pub search: Vec<String>,
}

impl DnsInfo {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.search.is_empty()
    }
}

// ============================================================================
// Canonical Output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Subnet {
    Static {
        address: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gateway: Option<String>,
    },
    Dhcp4,
    Dhcp6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDevice {
    pub name: String,
    pub mac_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    pub subnets: Vec<Subnet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nameserver {
    pub address: Vec<String>,
    pub search: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkEntry {
    Physical(PhysicalDevice),
    Nameserver(Nameserver),
}

/// Canonical version-1 network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub version: u8,
    pub config: Vec<NetworkEntry>,
}

impl NetworkConfig {
    pub fn devices(&self) -> impl Iterator<Item = &PhysicalDevice> {
        self.config.iter().filter_map(|entry| match entry {
            NetworkEntry::Physical(dev) => Some(dev),
            NetworkEntry::Nameserver(_) => None,
        })
    }
}

// ============================================================================
// Synthesis
// ============================================================================

pub type Resolver<'a> = &'a dyn Fn(&str) -> Option<String>;

pub struct SynthesisInput<'a> {
    pub nics: &'a [NicDescriptor],
    /// MAC -> interface name
    pub resolver: Resolver<'a>,
    /// interface name -> driver
    pub driver_lookup: Option<Resolver<'a>>,
    /// Devices bound to these drivers are emitted link-only
    pub link_only_drivers: &'a [String],
    pub dns: Option<&'a DnsInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub config: NetworkConfig,
    pub diagnostics: Vec<String>,
}

/// Build the canonical network configuration from NIC descriptors
pub fn synthesize(input: &SynthesisInput<'_>) -> Synthesis {
    let mut config = Vec::with_capacity(input.nics.len() + 1);
    let mut diagnostics = Vec::new();

    // when the platform marks a primary NIC, only primaries carry gateways
    let any_primary = input.nics.iter().any(|n| n.primary == Some(true));

    for nic in input.nics {
        let Some(name) = (input.resolver)(&nic.mac) else {
            diagnostics.push(format!("{}: no interface found for this MAC; dropped", nic.mac));
            continue;
        };

        let driver = input.driver_lookup.and_then(|lookup| lookup(&name));
        let excluded_driver = driver
            .as_ref()
            .is_some_and(|d| input.link_only_drivers.iter().any(|x| x == d));

        if nic.link_only || excluded_driver {
            diagnostics.push(format!("{} ({}): emitted link-only", name, nic.mac));
            config.push(NetworkEntry::Physical(PhysicalDevice {
                name,
                mac_address: nic.mac.clone(),
                mtu: nic.mtu,
                subnets: Vec::new(),
                params: driver.map(|d| BTreeMap::from([("driver".to_string(), d)])),
            }));
            continue;
        }

        let gateways_allowed = !any_primary || nic.primary == Some(true);
        let gateways = nic.gateway_entries();
        if !gateways_allowed && !gateways.is_empty() {
            diagnostics.push(format!("{}: gateways ignored on non-primary NIC", name));
        }

        let mut seen: HashSet<IpEntry> = HashSet::new();
        let mut gateway_assigned: HashSet<AddressFamily> = HashSet::new();
        let mut subnets = Vec::new();

        for entry in nic.ip_entries() {
            if !seen.insert(entry.clone()) {
                diagnostics.push(format!("{}: duplicate ip entry {:?} collapsed", name, entry));
                continue;
            }
            let subnet = match &entry {
                IpEntry::Dhcp4 => Subnet::Dhcp4,
                IpEntry::Dhcp6 => Subnet::Dhcp6,
                IpEntry::Static { family, .. } => {
                    let gateway = if gateways_allowed && gateway_assigned.insert(*family) {
                        gateways
                            .iter()
                            .find(|gw| gw.family == *family)
                            .map(|gw| gw.address.clone())
                    } else {
                        None
                    };
                    Subnet::Static {
                        address: entry.cidr().unwrap_or_default(),
                        gateway,
                    }
                }
            };
            subnets.push(subnet);
        }

        if subnets.is_empty() {
            diagnostics.push(format!("{}: no usable ip entries; dropped", name));
            continue;
        }

        config.push(NetworkEntry::Physical(PhysicalDevice {
            name,
            mac_address: nic.mac.clone(),
            mtu: nic.mtu,
            subnets,
            params: None,
        }));
    }

    if let Some(dns) = input.dns.filter(|d| !d.is_empty()) {
        config.push(NetworkEntry::Nameserver(Nameserver {
            address: dns.addresses.clone(),
            search: dns.search.clone(),
        }));
    }

    debug!(entries = config.len(), diagnostics = diagnostics.len(), "Synthesized network config");
    Synthesis {
        config: NetworkConfig { version: 1, config },
        diagnostics,
    }
}

/// Network config for a host whose platform describes no NICs.
///
/// The first interface not bound to a link-only driver gets DHCP, `eth0`
/// first and otherwise in name order. Every link-only device follows as
/// `vf<N>` with no IP configuration.
pub fn fallback(host: &[HostInterface], link_only_drivers: &[String]) -> Synthesis {
    let is_link_only = |iface: &HostInterface| {
        iface
            .driver
            .as_ref()
            .is_some_and(|d| link_only_drivers.iter().any(|x| x == d))
    };

    let mut config = Vec::new();
    let mut diagnostics = Vec::new();

    let primary = host
        .iter()
        .filter(|iface| !is_link_only(iface))
        .min_by_key(|iface| (iface.name != "eth0", iface.name.as_str()));
    match primary {
        Some(iface) => config.push(NetworkEntry::Physical(PhysicalDevice {
            name: iface.name.clone(),
            mac_address: iface.mac.clone(),
            mtu: None,
            subnets: vec![Subnet::Dhcp4],
            params: device_params(iface),
        })),
        None => diagnostics.push("no interface eligible for fallback DHCP".to_string()),
    }

    for (index, iface) in host.iter().filter(|iface| is_link_only(iface)).enumerate() {
        let name = format!("vf{}", index + 1);
        diagnostics.push(format!("{} ({}): emitted link-only as {}", iface.name, iface.mac, name));
        config.push(NetworkEntry::Physical(PhysicalDevice {
            name,
            mac_address: iface.mac.clone(),
            mtu: None,
            subnets: Vec::new(),
            params: device_params(iface),
        }));
    }

    debug!(entries = config.len(), "Generated fallback network config");
    Synthesis {
        config: NetworkConfig { version: 1, config },
        diagnostics,
    }
}

fn device_params(iface: &HostInterface) -> Option<BTreeMap<String, String>> {
    let params: BTreeMap<String, String> = [("driver", &iface.driver), ("device_id", &iface.device_id)]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|v| (key.to_string(), v)))
        .collect();
    (!params.is_empty()).then_some(params)
}
