//! Test utilities shared by unit tests

use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bm_error::TransportError;

use crate::capabilities::{
    Clock, BlockDevices, DeviceQuery, FirmwareField, FirmwareInfo, HostInterface, InterfaceEnumerator,
    MountHandle,
};

/// Clock that only advances when slept on
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
        }
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

/// Firmware backed by a fixed table
#[derive(Default)]
pub struct FakeFirmware {
    fields: HashMap<FirmwareField, String>,
}

impl FakeFirmware {
    pub fn with(mut self, field: FirmwareField, value: &str) -> Self {
        self.fields.insert(field, value.to_string());
        self
    }
}

impl FirmwareInfo for FakeFirmware {
    fn read(&self, field: FirmwareField) -> Option<String> {
        self.fields.get(&field).cloned()
    }
}

/// Devices whose "mounts" are plain directories
#[derive(Default)]
pub struct FakeDevices {
    /// device path -> (fstype, directory standing in for its content)
    devices: Vec<(String, String, Option<PathBuf>)>,
    pub mounts: Cell<usize>,
    pub unmounts: Cell<usize>,
}

impl FakeDevices {
    /// `content` of `None` simulates media removed after listing
    pub fn with(mut self, device: &str, fstype: &str, content: Option<PathBuf>) -> Self {
        self.devices.push((device.to_string(), fstype.to_string(), content));
        self
    }
}

impl BlockDevices for FakeDevices {
    fn list_candidates(&self, query: &DeviceQuery) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, fstype, _)| matches!(query, DeviceQuery::FsType(t) if t == fstype))
            .map(|(dev, _, _)| dev.clone())
            .collect()
    }

    fn mount(&self, device: &str, _fstype: Option<String>) -> Result<MountHandle, TransportError> {
        let (_, _, content) = self
            .devices
            .iter()
            .find(|(dev, _, _)| dev == device)
            .ok_or_else(|| TransportError::not_present(device))?;
        let root = content
            .clone()
            .ok_or_else(|| TransportError::Ejected(device.to_string()))?;
        self.mounts.set(self.mounts.get() + 1);
        Ok(MountHandle {
            device: device.to_string(),
            mountpoint: root,
        })
    }

    fn unmount(&self, _handle: &MountHandle) {
        self.unmounts.set(self.unmounts.get() + 1);
    }
}

/// Interfaces from a fixed MAC table
#[derive(Default)]
pub struct FakeInterfaces {
    by_mac: HashMap<String, String>,
    drivers: HashMap<String, String>,
    listed: Vec<HostInterface>,
}

impl FakeInterfaces {
    pub fn with(self, mac: &str, name: &str, driver: &str) -> Self {
        self.with_device(mac, name, driver, None)
    }

    pub fn with_device(mut self, mac: &str, name: &str, driver: &str, device_id: Option<&str>) -> Self {
        self.by_mac.entry(mac.to_ascii_lowercase()).or_insert_with(|| name.to_string());
        self.drivers.insert(name.to_string(), driver.to_string());
        self.listed.push(HostInterface {
            name: name.to_string(),
            mac: mac.to_ascii_lowercase(),
            driver: Some(driver.to_string()),
            device_id: device_id.map(str::to_string),
        });
        self.listed.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }
}

impl InterfaceEnumerator for FakeInterfaces {
    fn resolve(&self, mac: &str) -> Option<String> {
        self.by_mac.get(&mac.to_ascii_lowercase()).cloned()
    }

    fn driver_of(&self, name: &str) -> Option<String> {
        self.drivers.get(name).cloned()
    }

    fn list(&self) -> Vec<HostInterface> {
        self.listed.clone()
    }
}
