//! Configuration file support for brewflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BREWFLASH_*)
//! 3. Local config file (./brewflash.toml)
//! 4. Global config file (e.g. ~/.config/brewflash/config.toml)
//!
//! `--config PATH` replaces both files.

use {
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Name of the per-directory config file.
pub const LOCAL_CONFIG: &str = "brewflash.toml";

/// Serial link configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Port the board may come back on after a reset.
    pub alt_serial: Option<String>,
    /// Link baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// "packet" or "external".
    pub method: Option<String>,
    /// External programmer executable.
    pub tool: Option<PathBuf>,
    /// External programmer arguments, with `{port}` and `{file}` placeholders.
    #[serde(default)]
    pub tool_args: Vec<String>,
    /// Largest program the board accepts, in bytes.
    pub max_size: Option<usize>,
    /// Open the port at this baud first to enter the bootloader.
    pub touch_baud: Option<u32>,
    /// Name used for the board in messages.
    pub display_name: Option<String>,
    /// Seconds to wait after opening the port before talking to the board.
    pub open_delay_secs: Option<u64>,
}

/// What to restore after flashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Restore control constants and settings.
    pub settings: Option<bool>,
    /// Restore installed devices.
    pub devices: Option<bool>,
}

/// Where settings backups go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backup directory.
    pub dir: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Restore configuration.
    #[serde(default)]
    pub restore: RestoreConfig,
    /// Backup configuration.
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "brewflash")
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Backup directory from the config, or the platform data directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("backups")))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            port,
            flash,
            restore,
            backup,
        } = other;

        if port.serial.is_some() {
            self.port.serial = port.serial;
        }
        if port.alt_serial.is_some() {
            self.port.alt_serial = port.alt_serial;
        }
        if port.baud.is_some() {
            self.port.baud = port.baud;
        }

        if flash.method.is_some() {
            self.flash.method = flash.method;
        }
        if flash.tool.is_some() {
            self.flash.tool = flash.tool;
        }
        if !flash.tool_args.is_empty() {
            self.flash.tool_args = flash.tool_args;
        }
        if flash.max_size.is_some() {
            self.flash.max_size = flash.max_size;
        }
        if flash.touch_baud.is_some() {
            self.flash.touch_baud = flash.touch_baud;
        }
        if flash.display_name.is_some() {
            self.flash.display_name = flash.display_name;
        }
        if flash.open_delay_secs.is_some() {
            self.flash.open_delay_secs = flash.open_delay_secs;
        }

        if restore.settings.is_some() {
            self.restore.settings = restore.settings;
        }
        if restore.devices.is_some() {
            self.restore.devices = restore.devices;
        }

        if backup.dir.is_some() {
            self.backup.dir = backup.dir;
        }
    }
}
