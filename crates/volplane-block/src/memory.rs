//! In-process block cluster
//!
//! `MemoryBackend` keeps devices, snapshots and clones in memory with the
//! same dependency rules a real cluster enforces: a device with snapshots
//! or clones cannot be removed, a protected snapshot cannot be removed and
//! a snapshot with clones cannot be unprotected. Device contents are held
//! in full, so it is meant for development and tests, not for large images.
//!
//! Every mutating call is appended to a call log (writes as
//! `write_at device@offset`), credential fetches included. Failures can be
//! injected per operation.

use crate::backend::{BlockBackend, ChildInfo, Credentials, DeviceInfo, SnapshotInfo};
use crate::error::{BackendError, BackendResult};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Device {
    size: u64,
    parent: Option<(String, String)>,
    snapshots: BTreeMap<String, SnapshotEntry>,
    metadata: BTreeMap<String, String>,
    /// Length of the passphrase the header was written with
    encryption_header: Option<usize>,
    /// Written prefix of the device; everything past it reads as zero
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    size: u64,
    protected: bool,
    data: Vec<u8>,
}

/// Manages devices, snapshots and clones in memory
pub struct MemoryBackend {
    devices: RwLock<HashMap<String, Device>>,
    credentials: RwLock<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `times` calls of `operation` fail with `Unavailable`
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.failures.lock().insert(operation, times);
    }

    /// Mutating calls performed so far, as `"<operation> <target>"`
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Names of all devices
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a device exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    /// Full contents of a device, zero-filled to its size
    #[must_use]
    pub fn read_device(&self, name: &str) -> Option<Vec<u8>> {
        let devices = self.devices.read();
        let device = devices.get(name)?;
        let mut data = device.data.clone();
        data.resize(usize::try_from(device.size).ok()?, 0);
        Some(data)
    }

    /// Whether an encryption header was written to a device
    #[must_use]
    pub fn is_encrypted(&self, name: &str) -> bool {
        self.devices
            .read()
            .get(name)
            .is_some_and(|d| d.encryption_header.is_some())
    }

    fn check(&self, operation: &'static str) -> BackendResult<()> {
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Unavailable(format!(
                    "injected failure for {operation}"
                )));
            }
        }
        Ok(())
    }

    fn record(&self, operation: &str, target: &str) {
        debug!(operation, target, "memory backend call");
        self.calls.lock().push(format!("{operation} {target}"));
    }

    fn children_of<'a>(
        devices: &'a HashMap<String, Device>,
        parent: &'a str,
    ) -> impl Iterator<Item = ChildInfo> + 'a {
        devices.iter().filter_map(move |(name, device)| match &device.parent {
            Some((p, snapshot)) if p == parent => Some(ChildInfo {
                device: name.clone(),
                snapshot: snapshot.clone(),
            }),
            _ => None,
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_name(device: &str, snapshot: &str) -> String {
    format!("{device}@{snapshot}")
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn create_device(&self, name: &str, size: u64) -> BackendResult<()> {
        self.check("create_device")?;
        if size == 0 {
            return Err(BackendError::InvalidSize("Size must be positive".to_string()));
        }
        let mut devices = self.devices.write();
        if devices.contains_key(name) {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }
        devices.insert(
            name.to_string(),
            Device {
                size,
                ..Device::default()
            },
        );
        drop(devices);
        self.record("create_device", name);
        Ok(())
    }

    async fn open_device(&self, name: &str) -> BackendResult<DeviceInfo> {
        self.check("open_device")?;
        self.devices
            .read()
            .get(name)
            .map(|d| DeviceInfo {
                name: name.to_string(),
                size: d.size,
                parent: d.parent.clone(),
            })
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn resize_device(&self, name: &str, size: u64) -> BackendResult<()> {
        self.check("resize_device")?;
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        if size < device.size {
            return Err(BackendError::CannotShrink(device.size, size));
        }
        device.size = size;
        drop(devices);
        self.record("resize_device", name);
        Ok(())
    }

    async fn remove_device(&self, name: &str) -> BackendResult<()> {
        self.check("remove_device")?;
        let mut devices = self.devices.write();
        let device = devices
            .get(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        if Self::children_of(&devices, name).next().is_some() {
            return Err(BackendError::HasChildren(name.to_string()));
        }
        if !device.snapshots.is_empty() {
            return Err(BackendError::HasSnapshots(name.to_string()));
        }
        devices.remove(name);
        drop(devices);
        self.record("remove_device", name);
        Ok(())
    }

    async fn clone_device(&self, parent: &str, snapshot: &str, child: &str) -> BackendResult<()> {
        self.check("clone_device")?;
        let mut devices = self.devices.write();
        let source = devices
            .get(parent)
            .ok_or_else(|| BackendError::NotFound(parent.to_string()))?
            .snapshots
            .get(snapshot)
            .ok_or_else(|| BackendError::NotFound(snapshot_name(parent, snapshot)))?
            .clone();
        if devices.contains_key(child) {
            return Err(BackendError::AlreadyExists(child.to_string()));
        }
        devices.insert(
            child.to_string(),
            Device {
                size: source.size,
                parent: Some((parent.to_string(), snapshot.to_string())),
                data: source.data,
                ..Device::default()
            },
        );
        drop(devices);
        self.record("clone_device", child);
        Ok(())
    }

    async fn create_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()> {
        self.check("create_snapshot")?;
        let mut devices = self.devices.write();
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        if dev.snapshots.contains_key(snapshot) {
            return Err(BackendError::AlreadyExists(snapshot_name(device, snapshot)));
        }
        let entry = SnapshotEntry {
            size: dev.size,
            protected: false,
            data: dev.data.clone(),
        };
        dev.snapshots.insert(snapshot.to_string(), entry);
        drop(devices);
        self.record("create_snapshot", &snapshot_name(device, snapshot));
        Ok(())
    }

    async fn protect_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()> {
        self.check("protect_snapshot")?;
        let mut devices = self.devices.write();
        let entry = devices
            .get_mut(device)
            .and_then(|d| d.snapshots.get_mut(snapshot))
            .ok_or_else(|| BackendError::NotFound(snapshot_name(device, snapshot)))?;
        entry.protected = true;
        drop(devices);
        self.record("protect_snapshot", &snapshot_name(device, snapshot));
        Ok(())
    }

    async fn unprotect_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()> {
        self.check("unprotect_snapshot")?;
        let mut devices = self.devices.write();
        if Self::children_of(&devices, device).any(|c| c.snapshot == snapshot) {
            return Err(BackendError::HasChildren(snapshot_name(device, snapshot)));
        }
        let entry = devices
            .get_mut(device)
            .and_then(|d| d.snapshots.get_mut(snapshot))
            .ok_or_else(|| BackendError::NotFound(snapshot_name(device, snapshot)))?;
        entry.protected = false;
        drop(devices);
        self.record("unprotect_snapshot", &snapshot_name(device, snapshot));
        Ok(())
    }

    async fn remove_snapshot(&self, device: &str, snapshot: &str) -> BackendResult<()> {
        self.check("remove_snapshot")?;
        let mut devices = self.devices.write();
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        match dev.snapshots.get(snapshot) {
            None => return Err(BackendError::NotFound(snapshot_name(device, snapshot))),
            Some(entry) if entry.protected => {
                return Err(BackendError::SnapshotProtected(snapshot_name(
                    device, snapshot,
                )));
            }
            Some(_) => {
                dev.snapshots.remove(snapshot);
            }
        }
        drop(devices);
        self.record("remove_snapshot", &snapshot_name(device, snapshot));
        Ok(())
    }

    async fn list_snapshots(&self, device: &str) -> BackendResult<Vec<SnapshotInfo>> {
        self.check("list_snapshots")?;
        let devices = self.devices.read();
        let dev = devices
            .get(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        Ok(dev
            .snapshots
            .iter()
            .map(|(name, entry)| SnapshotInfo {
                name: name.clone(),
                size: entry.size,
                protected: entry.protected,
            })
            .collect())
    }

    async fn list_children(&self, device: &str) -> BackendResult<Vec<ChildInfo>> {
        self.check("list_children")?;
        let devices = self.devices.read();
        if !devices.contains_key(device) {
            return Err(BackendError::NotFound(device.to_string()));
        }
        let mut children: Vec<_> = Self::children_of(&devices, device).collect();
        children.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(children)
    }

    async fn set_metadata(&self, device: &str, key: &str, value: &str) -> BackendResult<()> {
        self.check("set_metadata")?;
        let mut devices = self.devices.write();
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        dev.metadata.insert(key.to_string(), value.to_string());
        drop(devices);
        self.record("set_metadata", &format!("{device} {key}={value}"));
        Ok(())
    }

    async fn get_metadata(&self, device: &str) -> BackendResult<BTreeMap<String, String>> {
        self.check("get_metadata")?;
        self.devices
            .read()
            .get(device)
            .map(|d| d.metadata.clone())
            .ok_or_else(|| BackendError::NotFound(device.to_string()))
    }

    async fn format_encrypted(&self, device: &str, passphrase: &[u8]) -> BackendResult<()> {
        self.check("format_encrypted")?;
        let mut devices = self.devices.write();
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        dev.encryption_header = Some(passphrase.len());
        drop(devices);
        self.record("format_encrypted", device);
        Ok(())
    }

    async fn fetch_credentials(&self, client: &str) -> BackendResult<Credentials> {
        self.check("fetch_credentials")?;
        let key = self
            .credentials
            .write()
            .entry(client.to_string())
            .or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone();
        self.record("fetch_credentials", client);
        Ok(Credentials {
            user: client.to_string(),
            key,
        })
    }

    async fn write_at(&self, device: &str, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.check("write_at")?;
        let mut devices = self.devices.write();
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.to_string()))?;
        let length = data.len() as u64;
        let size = dev.size;
        let out_of_bounds = || BackendError::OutOfBounds {
            offset,
            length,
            size,
        };
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= size)
            .ok_or_else(out_of_bounds)?;
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = usize::try_from(end).map_err(|_| out_of_bounds())?;
        if dev.data.len() < end {
            dev.data.resize(end, 0);
        }
        dev.data[start..end].copy_from_slice(data);
        drop(devices);
        self.record("write_at", &format!("{device}@{offset}"));
        Ok(())
    }
}
