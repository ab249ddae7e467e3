use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Database URL
    pub database_url: String,

    /// Identifier reported with configuration and uploads
    pub device_id: String,

    /// Remote store base URL; uploads are skipped when unset
    pub backend_url: Option<String>,

    /// Interval between sync cycles
    pub sync_interval: Duration,

    /// Backup folder used until a device config is saved
    pub default_backup_folder: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let default_backup_folder = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Filewarden_Backups");

        Self {
            port: 8787,
            database_url: "sqlite://filewarden.db".to_string(),
            device_id: "default".to_string(),
            backend_url: None,
            sync_interval: Duration::from_secs(60),
            default_backup_folder,
        }
    }
}

impl Config {
    /// Load config from environment and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Override with environment variables
        if let Ok(port) = std::env::var("WARDEN_PORT") {
            config.port = port.parse()?;
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(device_id) = std::env::var("WARDEN_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                config.device_id = device_id;
            }
        }

        if let Ok(url) = std::env::var("WARDEN_BACKEND_URL") {
            if !url.trim().is_empty() {
                config.backend_url = Some(url.trim_end_matches('/').to_string());
            }
        }

        if let Ok(interval) = std::env::var("WARDEN_SYNC_INTERVAL") {
            config.sync_interval = humantime::parse_duration(&interval)?;
        }

        if let Ok(folder) = std::env::var("WARDEN_BACKUP_FOLDER") {
            config.default_backup_folder = PathBuf::from(folder);
        }

        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
