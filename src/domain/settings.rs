use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "TrackingDetection";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join(APP_DIR).join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
        .to_string_lossy()
        .into_owned()
}
fn default_prefix() -> String {
    "tracking_detection".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    /// Overrides the default database location when set
    #[serde(default)]
    pub database_path: Option<String>,

    // Scanning
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    #[serde(default = "default_false")]
    pub show_all_devices: bool,

    // Sound alert
    #[serde(default = "default_sound_timeout_secs")]
    pub sound_timeout_secs: u64,
    #[serde(default = "default_sound_service_uuid")]
    pub sound_service_uuid: String,
    #[serde(default = "default_sound_characteristic_uuid")]
    pub sound_characteristic_uuid: String,

    // History
    #[serde(default = "default_monitoring_window_minutes")]
    pub monitoring_window_minutes: i64,
    #[serde(default = "default_beacon_retention_days")]
    pub beacon_retention_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            database_path: None,
            scan_duration_secs: default_scan_duration_secs(),
            show_all_devices: false,
            sound_timeout_secs: default_sound_timeout_secs(),
            sound_service_uuid: default_sound_service_uuid(),
            sound_characteristic_uuid: default_sound_characteristic_uuid(),
            monitoring_window_minutes: default_monitoring_window_minutes(),
            beacon_retention_days: default_beacon_retention_days(),
        }
    }
}

fn default_scan_duration_secs() -> u64 {
    10
}
fn default_sound_timeout_secs() -> u64 {
    30
}
fn default_sound_service_uuid() -> String {
    "7dfc9000-7d1c-4951-86aa-8d9728f8d66c".to_string()
}
fn default_sound_characteristic_uuid() -> String {
    "7dfc9001-7d1c-4951-86aa-8d9728f8d66c".to_string()
}
fn default_monitoring_window_minutes() -> i64 {
    15
}
fn default_beacon_retention_days() -> i64 {
    30
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Database file to open: the configured override or the per-user default
    pub fn database_path(&self) -> PathBuf {
        match &self.settings.database_path {
            Some(path) => PathBuf::from(path),
            None => default_database_path(),
        }
    }
}

pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("devices.db")
}
