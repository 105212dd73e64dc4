//! Request-scoped detection context
//!
//! Bundles the host capabilities for one boot attempt and memoizes the
//! expensive checks (firmware reads, device listings, volume mounts) so that
//! several signatures asking the same question only touch the host once.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, trace};

use crate::capabilities::{
    with_mounted, Clock, BlockDevices, DeviceQuery, FirmwareField, FirmwareInfo, InterfaceEnumerator,
};

pub struct DetectionContext<'a> {
    pub firmware: &'a dyn FirmwareInfo,
    pub devices: &'a dyn BlockDevices,
    pub interfaces: &'a dyn InterfaceEnumerator,
    pub clock: &'a dyn Clock,
    firmware_cache: RefCell<HashMap<FirmwareField, Option<String>>>,
    listing_cache: RefCell<HashMap<DeviceQuery, Vec<String>>>,
    marker_cache: RefCell<HashMap<(String, String), bool>>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(
        firmware: &'a dyn FirmwareInfo,
        devices: &'a dyn BlockDevices,
        interfaces: &'a dyn InterfaceEnumerator,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            firmware,
            devices,
            interfaces,
            clock,
            firmware_cache: RefCell::new(HashMap::new()),
            listing_cache: RefCell::new(HashMap::new()),
            marker_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Memoized firmware read
    pub fn firmware_field(&self, field: FirmwareField) -> Option<String> {
        if let Some(value) = self.firmware_cache.borrow().get(&field) {
            return value.clone();
        }
        let value = self.firmware.read(field);
        self.firmware_cache.borrow_mut().insert(field, value.clone());
        value
    }

    /// Memoized device listing
    pub fn candidates(&self, query: &DeviceQuery) -> Vec<String> {
        if let Some(devices) = self.listing_cache.borrow().get(query) {
            return devices.clone();
        }
        let devices = self.devices.list_candidates(query);
        trace!(query = ?query, count = devices.len(), "Listed candidate devices");
        self.listing_cache.borrow_mut().insert(query.clone(), devices.clone());
        devices
    }

    /// Whether any volume of `fstype` carries a file named `marker` at its root.
    pub fn volume_has_marker(&self, fstype: &str, marker: &str) -> bool {
        let key = (fstype.to_string(), marker.to_string());
        if let Some(found) = self.marker_cache.borrow().get(&key) {
            return *found;
        }

        let found = self
            .candidates(&DeviceQuery::FsType(fstype.to_string()))
            .iter()
            .any(|device| {
                match with_mounted(self.devices, device, Some(fstype), |root| root.join(marker).is_file()) {
                    Ok(present) => present,
                    Err(e) => {
                        debug!(device = %device, error = %e, "Skipping volume during marker scan");
                        false
                    }
                }
            });

        self.marker_cache.borrow_mut().insert(key, found);
        found
    }
}
