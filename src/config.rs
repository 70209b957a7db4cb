use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address (0.0.0.0 for LAN, 127.0.0.1 for localhost)
    pub bind_addr: String,
    /// Root of all on-disk state (settings, firmware, recordings)
    pub data_dir: PathBuf,
    /// External programmer used to query the microcontroller
    pub probe_tool: PathBuf,
    /// External programmer used to write firmware
    pub flash_tool: PathBuf,
    /// Maximum firmware upload size in bytes (default 8MB)
    pub max_firmware_size: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env::var("EXO_PORT")
                .unwrap_or_else(|_| "5050".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            bind_addr: env::var("EXO_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            data_dir: env::var("EXO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_dir()),
            probe_tool: env::var("EXO_PROBE_TOOL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("st-info")),
            flash_tool: env::var("EXO_FLASH_TOOL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("st-flash")),
            max_firmware_size: env::var("EXO_MAX_FIRMWARE_SIZE")
                .unwrap_or_else(|_| "8388608".to_string()) // 8MB default
                .parse()
                .unwrap_or(8 * 1024 * 1024),
        })
    }

    /// Get the full bind address (addr:port)
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(".exoskeleton").join("config.toml")
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.data_dir.join(".exoskeleton").join("firmware.bin")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("EXPDATA")
    }
}

// The capture host is a headless Pi with a dedicated /data mount; macOS
// development machines fall back to the home directory.
fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from("/data")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Device settings persisted as TOML at `<data_dir>/.exoskeleton/config.toml`.
///
/// The serial section feeds the recorder; control and assistance are
/// free-form parameter tables owned by the GUI and replaced wholesale on
/// update. The file is read per request rather than cached so edits made
/// over SSH on the capture host take effect immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub control: toml::Table,
    #[serde(default)]
    pub assistance: toml::Table,
    #[serde(default)]
    pub recording: RecordingSettings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            control: toml::Table::new(),
            assistance: toml::Table::new(),
            recording: RecordingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud: default_baud(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud() -> u32 {
    115200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    /// Ingest worker poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a start request waits for the channel to open, milliseconds
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_startup_grace_ms() -> u64 {
    500
}

impl DeviceSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the settings file, creating it with defaults on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::load(path)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".exoskeleton").join("config.toml");

        let settings = DeviceSettings::load_or_create(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(settings.serial.port, "/dev/ttyACM0");
        assert_eq!(settings.serial.baud, 115200);
        assert_eq!(settings.recording.poll_interval_ms, 100);
        assert!(settings.control.is_empty());
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = DeviceSettings::default();
        settings.serial.port = "/dev/ttyUSB3".to_string();
        settings.serial.baud = 921600;
        settings
            .control
            .insert("kp".to_string(), toml::Value::Float(1.5));
        settings.save(&path).unwrap();

        let loaded = DeviceSettings::load(&path).unwrap();
        assert_eq!(loaded.serial.port, "/dev/ttyUSB3");
        assert_eq!(loaded.serial.baud, 921600);
        assert_eq!(loaded.control.get("kp"), Some(&toml::Value::Float(1.5)));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings: DeviceSettings = toml::from_str("[serial]\nport = \"/dev/ttyS0\"\n").unwrap();
        assert_eq!(settings.serial.port, "/dev/ttyS0");
        assert_eq!(settings.serial.baud, 115200);
        assert_eq!(settings.recording.startup_grace_ms, 500);
    }
}
