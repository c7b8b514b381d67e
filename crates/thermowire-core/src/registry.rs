//! Device registry keyed by logical name with an address index
//!
//! The registry exclusively owns every [`DeviceRecord`]. Callers get borrowed
//! views or cloned snapshots; the name map and the address index are only
//! changed together, so a rename never leaves both or neither key visible.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::address::Address;
use crate::device::{default_name, DeviceRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Name {0} is already used by another device")]
    NameInUse(String),
    #[error("Address {0} is already registered")]
    AddressInUse(Address),
    #[error("No device named {0}")]
    UnknownDevice(String),
}

/// All known devices
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    by_address: HashMap<Address, String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    /// Records in name order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Owned copy of every record, in name order
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices.values().cloned().collect()
    }

    pub fn lookup_by_address(&self, address: &Address) -> Option<&DeviceRecord> {
        self.by_address
            .get(address)
            .and_then(|name| self.devices.get(name))
    }

    /// Find a record by family + serial, ignoring the CRC byte.
    ///
    /// Used to attribute a corrupted enumeration read to a known device.
    pub fn lookup_by_rom(&self, rom: &[u8; 7]) -> Option<&DeviceRecord> {
        self.by_address
            .iter()
            .find(|(address, _)| &address.rom() == rom)
            .and_then(|(_, name)| self.devices.get(name))
    }

    /// Add a new record under its own name
    pub fn insert(&mut self, record: DeviceRecord) -> Result<&DeviceRecord, RegistryError> {
        if self.devices.contains_key(&record.name) {
            return Err(RegistryError::NameInUse(record.name));
        }
        if self.by_address.contains_key(&record.address) {
            return Err(RegistryError::AddressInUse(record.address));
        }

        let name = record.name.clone();
        self.by_address.insert(record.address, name.clone());
        debug!(device = %name, address = %record.address, "Registered device");
        Ok(self.devices.entry(name).or_insert(record))
    }

    /// Return the record for `address`, creating one with a generated name if
    /// none exists. The flag is true when the record was created.
    pub fn upsert_by_address(&mut self, address: Address) -> (&mut DeviceRecord, bool) {
        let name = match self.by_address.get(&address) {
            Some(name) => name.clone(),
            None => {
                let name = self.unique_name(default_name(&address));
                self.by_address.insert(address, name.clone());
                name
            }
        };

        match self.devices.entry(name) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let record = DeviceRecord::new(entry.key().clone(), address);
                debug!(device = %record.name, address = %address, "Created device record");
                (entry.insert(record), true)
            }
        }
    }

    /// Apply `f` to the named record.
    ///
    /// Name and address are owned by the registry; changes to them inside `f`
    /// are reverted. Use [`DeviceRegistry::rename`] instead.
    pub fn update<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut DeviceRecord) -> R,
    ) -> Result<R, RegistryError> {
        let record = self
            .devices
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))?;
        let address = record.address;
        let result = f(record);
        if record.name != name || record.address != address {
            warn!(device = %name, "Ignoring identity change made outside rename");
            record.name = name.to_string();
            record.address = address;
        }
        Ok(result)
    }

    /// Move a record to a new key. Renaming to the current name is a no-op.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<&DeviceRecord, RegistryError> {
        if old_name != new_name && self.devices.contains_key(new_name) {
            return Err(RegistryError::NameInUse(new_name.to_string()));
        }
        let mut record = self
            .devices
            .remove(old_name)
            .ok_or_else(|| RegistryError::UnknownDevice(old_name.to_string()))?;

        record.name = new_name.to_string();
        self.by_address.insert(record.address, new_name.to_string());
        debug!(old = %old_name, new = %new_name, "Renamed device");
        Ok(self.devices.entry(new_name.to_string()).or_insert(record))
    }

    /// Flip every live record to not-live ahead of a reconciliation pass.
    ///
    /// Returns the names that were already not live beforehand.
    pub fn mark_all_active_as_unconfirmed(&mut self) -> HashSet<String> {
        let mut inactive = HashSet::new();
        for record in self.devices.values_mut() {
            if record.live {
                record.live = false;
            } else {
                inactive.insert(record.name.clone());
            }
        }
        inactive
    }

    /// Set the liveness flag, returning its previous value
    pub fn set_liveness(&mut self, name: &str, live: bool) -> Result<bool, RegistryError> {
        self.update(name, |record| std::mem::replace(&mut record.live, live))
    }

    /// Pick `base`, or `base_2`, `base_3`... whichever is free
    fn unique_name(&self, base: String) -> String {
        if !self.devices.contains_key(&base) {
            return base;
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{}_{}", base, suffix);
            if !self.devices.contains_key(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}
