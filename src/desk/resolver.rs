use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::DeskError;

/// A discovered (not yet connected) BLE device
#[derive(Clone)]
pub struct DeskDevice {
    pub peripheral: Peripheral,
    pub adapter: Adapter,
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl fmt::Display for DeskDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.name.as_deref().unwrap_or("Unknown"))?;
        if let Some(rssi) = self.rssi {
            write!(f, " (RSSI {})", rssi)?;
        }
        Ok(())
    }
}

pub enum Discovery {
    /// Every device seen, when no address was asked for
    All(Vec<DeskDevice>),
    Found(DeskDevice),
}

pub fn addresses_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Index of the adapter whose description mentions `name`
fn pick_adapter(infos: &[String], name: &str) -> Option<usize> {
    infos.iter().position(|info| info.contains(name))
}

pub struct DeviceResolver {
    adapter: Adapter,
    adapter_name: String,
    scan_timeout: Duration,
    cache: Option<DeviceCache>,
}

impl DeviceResolver {
    /// Open the configured adapter, or the default one where adapters are
    /// not named (macOS, Windows)
    pub async fn new(
        adapter_name: &str,
        scan_timeout: Duration,
        cache: Option<DeviceCache>,
    ) -> Result<Self, DeskError> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(DeskError::NoAdapter);
        }

        let mut infos = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            infos.push(adapter.adapter_info().await.unwrap_or_default());
        }

        let index = match pick_adapter(&infos, adapter_name) {
            Some(index) => index,
            None => {
                if cfg!(target_os = "linux") {
                    log::warn!(
                        "Adapter {} not found, using {}",
                        adapter_name,
                        infos[0]
                    );
                }
                0
            }
        };
        log::debug!("Using adapter {}", infos[index]);

        Ok(Self {
            adapter: adapters.swap_remove(index),
            adapter_name: adapter_name.to_string(),
            scan_timeout,
            cache,
        })
    }

    /// Scan for the configured timeout.
    ///
    /// Without a target every device seen is returned; with one, only the
    /// matching device, or [`DeskError::NotFound`].
    pub async fn scan(&self, target: Option<&str>) -> Result<Discovery, DeskError> {
        log::info!("Scanning for {}s using {}...", self.scan_timeout.as_secs(), self.adapter_name);
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.scan_timeout).await;
        let devices = self.known_devices().await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("Failed to stop scan cleanly: {}", e);
        }
        let devices = devices?;
        log::info!("Found {} BLE devices", devices.len());

        let Some(address) = target else {
            return Ok(Discovery::All(devices));
        };

        match devices
            .into_iter()
            .find(|device| addresses_match(&device.address, address))
        {
            Some(device) => {
                log::info!("Scanning - Desk Found");
                Ok(Discovery::Found(device))
            }
            None => {
                log::info!("Scanning - Desk {} Not Found", address);
                Err(DeskError::NotFound(address.to_string()))
            }
        }
    }

    /// Find the desk, using the cached identity to skip the scan when the
    /// adapter already knows it
    pub async fn resolve(&self, address: &str) -> Result<DeskDevice, DeskError> {
        if let Some(device) = self.from_cache(address).await {
            log::info!("Using cached desk {}", device.address);
            return Ok(device);
        }

        match self.scan(Some(address)).await? {
            Discovery::Found(device) => Ok(device),
            Discovery::All(_) => Err(DeskError::NotFound(address.to_string())),
        }
    }

    async fn from_cache(&self, address: &str) -> Option<DeskDevice> {
        let cached = self.cache.as_ref()?.load(address)?;
        let devices = match self.known_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                log::debug!("Could not list known devices: {}", e);
                return None;
            }
        };
        let device = devices
            .into_iter()
            .find(|device| addresses_match(&device.address, &cached.address));
        if device.is_none() {
            log::debug!("Cached desk {} not known to the adapter, scanning", cached.address);
        }
        device
    }

    /// Record the desk after a successful connect. Failures only warn.
    pub fn remember(&self, device: &DeskDevice) {
        let Some(cache) = &self.cache else {
            return;
        };
        let record = CachedDevice::new(&device.address, device.name.clone(), &self.adapter_name);
        if let Err(e) = cache.store(&record) {
            log::warn!("Failed to cache desk identity in {:?}: {:#}", cache.path(), e);
        }
    }

    async fn known_devices(&self) -> Result<Vec<DeskDevice>, DeskError> {
        let peripherals = self.adapter.peripherals().await?;

        let mut devices = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            match peripheral.properties().await {
                Ok(Some(props)) => devices.push(DeskDevice {
                    address: props.address.to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                    adapter: self.adapter.clone(),
                    peripheral,
                }),
                Ok(None) => log::debug!("Peripheral has no properties"),
                Err(e) => log::debug!("Failed to get peripheral properties: {}", e),
            }
        }
        Ok(devices)
    }
}

const CACHE_VERSION: u32 = 1;

/// Identity of the last desk connected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDevice {
    pub version: u32,
    pub address: String,
    pub name: Option<String>,
    pub adapter: String,
}

impl CachedDevice {
    pub fn new(address: &str, name: Option<String>, adapter: &str) -> Self {
        Self {
            version: CACHE_VERSION,
            address: address.to_string(),
            name,
            adapter: adapter.to_string(),
        }
    }
}

/// JSON file holding one [`CachedDevice`]
#[derive(Debug, Clone)]
pub struct DeviceCache {
    path: PathBuf,
}

impl DeviceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached desk, if there is a readable record for `address`.
    /// Anything else is a miss.
    pub fn load(&self, address: &str) -> Option<CachedDevice> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("No desk cache at {:?}: {}", self.path, e);
                return None;
            }
        };

        let record: CachedDevice = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                log::debug!("Ignoring unreadable desk cache: {}", e);
                return None;
            }
        };

        if record.version != CACHE_VERSION {
            log::debug!("Ignoring desk cache version {}", record.version);
            return None;
        }
        if !addresses_match(&record.address, address) {
            log::debug!("Desk cache is for {}, not {}", record.address, address);
            return None;
        }
        Some(record)
    }

    pub fn store(&self, record: &CachedDevice) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create cache directory")?;
        }
        let content =
            serde_json::to_string_pretty(record).context("Failed to serialize desk cache")?;
        fs::write(&self.path, content).context("Failed to write desk cache")?;
        log::debug!("Desk cache saved to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(name: &str) -> DeviceCache {
        let path = std::env::temp_dir()
            .join(format!("idasen-desk-{}-{}", std::process::id(), name))
            .join("desk-cache.json");
        let _ = fs::remove_file(&path);
        DeviceCache::new(path)
    }

    #[test]
    fn test_addresses_match_ignores_case() {
        assert!(addresses_match("E8:5B:5B:24:22:E4", "e8:5b:5b:24:22:e4"));
        assert!(addresses_match(" E8:5B:5B:24:22:E4", "E8:5B:5B:24:22:E4"));
        assert!(!addresses_match("E8:5B:5B:24:22:E4", "E8:5B:5B:24:22:E5"));
    }

    #[test]
    fn test_pick_adapter() {
        let infos = vec![
            "hci1 (usb:v1D6Bp0246d0540)".to_string(),
            "hci0 (usb:v8087p0A2Bd0001)".to_string(),
        ];
        assert_eq!(pick_adapter(&infos, "hci0"), Some(1));
        assert_eq!(pick_adapter(&infos, "hci1"), Some(0));
        assert_eq!(pick_adapter(&infos, "hci7"), None);
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = temp_cache("round-trip");
        let record = CachedDevice::new("E8:5B:5B:24:22:E4", Some("Desk 1234".to_string()), "hci0");

        cache.store(&record).unwrap();

        assert_eq!(cache.load("e8:5b:5b:24:22:e4"), Some(record));
    }

    #[test]
    fn test_cache_address_mismatch_is_a_miss() {
        let cache = temp_cache("mismatch");
        cache
            .store(&CachedDevice::new("E8:5B:5B:24:22:E4", None, "hci0"))
            .unwrap();

        assert_eq!(cache.load("AA:BB:CC:DD:EE:FF"), None);
    }

    #[test]
    fn test_missing_cache_is_a_miss() {
        let cache = temp_cache("missing");
        assert_eq!(cache.load("E8:5B:5B:24:22:E4"), None);
    }

    #[test]
    fn test_corrupt_cache_is_a_miss() {
        let cache = temp_cache("corrupt");
        fs::create_dir_all(cache.path().parent().unwrap()).unwrap();
        fs::write(cache.path(), b"\x80\x04\x95 not json").unwrap();

        assert_eq!(cache.load("E8:5B:5B:24:22:E4"), None);
    }

    #[test]
    fn test_other_cache_version_is_a_miss() {
        let cache = temp_cache("version");
        let mut record = CachedDevice::new("E8:5B:5B:24:22:E4", None, "hci0");
        record.version = CACHE_VERSION + 1;
        cache.store(&record).unwrap();

        assert_eq!(cache.load("E8:5B:5B:24:22:E4"), None);
    }
}
