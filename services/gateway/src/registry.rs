//! Device registry (lookup / auto-create by IMEI).
//!
//! The registry is a read-through cache over storage.  Each device lives
//! behind its own `Mutex` so state updates for one IMEI are serialized no
//! matter how many connections or datagrams reference it; the outer map is
//! read-heavy and uses `RwLock`.

use crate::storage::{SharedStorage, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use fleet_core::{ConnStatus, Device, InvalidImei, ProtocolKind, validate_imei};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub type DeviceHandle = Arc<Mutex<Device>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidImei(#[from] InvalidImei),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Registry {
    storage: SharedStorage,
    alarm_mask_default: u16,
    devices: RwLock<HashMap<u64, DeviceHandle>>,
}

impl Registry {
    pub fn new(storage: SharedStorage, alarm_mask_default: u16) -> Registry {
        Registry {
            storage,
            alarm_mask_default,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Resolve a device by IMEI, creating it on first login.  Rejects IMEIs
    /// outside the 15-digit range before touching storage.
    pub async fn find_or_create(
        &self,
        imei: u64,
        protocol: ProtocolKind,
        now: DateTime<Utc>,
    ) -> Result<(DeviceHandle, bool), RegistryError> {
        validate_imei(imei)?;
        if let Some(handle) = self.devices.read().await.get(&imei) {
            return Ok((Arc::clone(handle), false));
        }

        let (device, created) = {
            let mut store = self.storage.lock().await;
            match store.find_device(imei)? {
                Some(device) => (device, false),
                None => {
                    let device = Device::new(imei, protocol, self.alarm_mask_default, now);
                    store.create_device(&device)?;
                    info!(imei, protocol = %protocol, "registered new device");
                    (device, true)
                }
            }
        };

        let mut map = self.devices.write().await;
        // Another task may have won the insert race; keep its handle.
        let handle = map
            .entry(imei)
            .or_insert_with(|| Arc::new(Mutex::new(device)));
        Ok((Arc::clone(handle), created))
    }

    /// Cache-or-storage lookup without auto-create (liveness sweeps,
    /// command-only paths).
    pub async fn get_or_load(&self, imei: u64) -> StorageResult<Option<DeviceHandle>> {
        if let Some(handle) = self.devices.read().await.get(&imei) {
            return Ok(Some(Arc::clone(handle)));
        }
        let loaded = self.storage.lock().await.find_device(imei)?;
        match loaded {
            None => Ok(None),
            Some(device) => {
                let mut map = self.devices.write().await;
                let handle = map
                    .entry(imei)
                    .or_insert_with(|| Arc::new(Mutex::new(device)));
                Ok(Some(Arc::clone(handle)))
            }
        }
    }

    /// Write-through of the current device state.
    pub async fn persist(&self, device: &Device) -> StorageResult<()> {
        self.storage.lock().await.update_device(device)
    }

    /// Mark a fresh contact: one connection (TCP accept or UDP login),
    /// remote address, ONLINE status.
    pub async fn record_connect(
        &self,
        handle: &DeviceHandle,
        addr: SocketAddr,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut device = handle.lock().await;
        device.total_connections += 1;
        device.remote_addr = Some(addr);
        device.status = ConnStatus::Online;
        if now > device.last_contact {
            device.last_contact = now;
        }
        self.persist(&device).await
    }

    /// Count a protocol error against a known device.
    pub async fn record_error(&self, imei: u64) -> StorageResult<()> {
        if let Some(handle) = self.get_or_load(imei).await? {
            let mut device = handle.lock().await;
            device.error_count += 1;
            self.persist(&device).await?;
        }
        Ok(())
    }
}
