//! Configuration captured from the controller before it is reprogrammed.

use {
    crate::error::Result,
    chrono::Local,
    log::info,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Key→scalar mapping reported by the controller.
pub type SettingsMap = Map<String, Value>;

/// Field holding a device's bus address.
pub const ADDRESS_KEY: &str = "a";

/// Field holding a device's pin or port.
pub const PIN_KEY: &str = "p";

/// One installed-device record.
///
/// The firmware defines many more fields than address and pin; the record is
/// kept as an open mapping so every field survives the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceDescriptor(pub Map<String, Value>);

impl DeviceDescriptor {
    /// Bus address (hex string), if the device has one.
    pub fn address(&self) -> Option<&str> {
        self.0
            .get(ADDRESS_KEY)
            .and_then(Value::as_str)
    }

    /// Pin/port identifier.
    pub fn pin(&self) -> Option<&Value> {
        self.0
            .get(PIN_KEY)
    }

    /// Replace the bus address.
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.0
            .insert(ADDRESS_KEY.to_string(), Value::String(address.into()));
    }

    /// Whether the address is the legacy "first device on this bus" marker.
    ///
    /// Old firmware accepted an all-zero address to mean "whatever sensor is
    /// found first"; current firmware needs the real address.
    pub fn has_autodetect_address(&self) -> bool {
        self.address()
            .is_some_and(|a| u64::from_str_radix(a.trim(), 16) == Ok(0))
    }
}

impl From<Map<String, Value>> for DeviceDescriptor {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Settings and devices read from the old firmware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    /// Control constants (`c` query).
    #[serde(default)]
    pub control_constants: SettingsMap,
    /// Control settings (`s` query).
    #[serde(default)]
    pub control_settings: SettingsMap,
    /// Installed devices (`d` query), in the order the firmware listed them.
    #[serde(default)]
    pub installed_devices: Vec<DeviceDescriptor>,
}

impl SettingsSnapshot {
    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.control_constants
            .is_empty()
            && self
                .control_settings
                .is_empty()
            && self
                .installed_devices
                .is_empty()
    }
}

/// Destination for the per-session snapshot backup.
pub trait BackupSink {
    /// Persist the snapshot, returning where it went (if anywhere).
    fn store(&mut self, snapshot: &SettingsSnapshot) -> Result<Option<PathBuf>>;
}

/// Writes each snapshot as a timestamped JSON file in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    dir: PathBuf,
}

impl DirectoryBackup {
    /// Create a sink writing into `dir` (created on first use).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name used for a backup taken now.
    pub fn file_name() -> String {
        format!(
            "oldSettings-{}.json",
            Local::now().format("%b-%d-%Y-%H-%M-%S")
        )
    }
}

impl BackupSink for DirectoryBackup {
    fn store(&mut self, snapshot: &SettingsSnapshot) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(Self::file_name());
        fs::write(&path, serde_json::to_vec(snapshot)?)?;
        info!("Saved old settings to {}", path.display());
        Ok(Some(path))
    }
}

/// Sink that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackup;

impl BackupSink for NoBackup {
    fn store(&mut self, _snapshot: &SettingsSnapshot) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}
