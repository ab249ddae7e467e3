use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Per-device monitoring configuration, editable through the REST API
/// and read by the sync loop once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub monitor_folders: Vec<PathBuf>,
    pub backup_folder: PathBuf,
    pub monitoring_enabled: bool,
}

impl DeviceConfig {
    pub fn defaults(device_id: &str, backup_folder: &Path) -> Self {
        Self {
            device_id: device_id.to_string(),
            monitor_folders: Vec::new(),
            backup_folder: backup_folder.to_path_buf(),
            monitoring_enabled: false,
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create the parent directory for file-backed databases
        if !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_config (
                device_id TEXT PRIMARY KEY,
                monitor_folders TEXT NOT NULL,
                backup_folder TEXT NOT NULL,
                monitoring_enabled INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_config(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        let row = sqlx::query(
            r#"
            SELECT monitor_folders, backup_folder, monitoring_enabled
            FROM device_config
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let folders_json: String = row.get("monitor_folders");
        let monitor_folders: Vec<PathBuf> = serde_json::from_str(&folders_json)?;
        let backup_folder: String = row.get("backup_folder");
        let monitoring_enabled: bool = row.get("monitoring_enabled");

        Ok(Some(DeviceConfig {
            device_id: device_id.to_string(),
            monitor_folders,
            backup_folder: PathBuf::from(backup_folder),
            monitoring_enabled,
        }))
    }

    pub async fn save_config(&self, config: &DeviceConfig) -> Result<()> {
        let folders_json = serde_json::to_string(&config.monitor_folders)?;

        sqlx::query(
            r#"
            INSERT INTO device_config (device_id, monitor_folders, backup_folder, monitoring_enabled, updated_at)
            VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
            ON CONFLICT(device_id) DO UPDATE SET
                monitor_folders = excluded.monitor_folders,
                backup_folder = excluded.backup_folder,
                monitoring_enabled = excluded.monitoring_enabled,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&config.device_id)
        .bind(&folders_json)
        .bind(config.backup_folder.to_string_lossy().as_ref())
        .bind(config.monitoring_enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn storage() -> (Storage, TempDir) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}/config.db", dir.path().display());
        let storage = Storage::new(&url).await.unwrap();
        storage.run_migrations().await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn unknown_device_yields_none() {
        let (storage, _dir) = storage().await;
        assert!(storage.load_config("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_roundtrips_through_sqlite() {
        let (storage, _dir) = storage().await;

        let config = DeviceConfig {
            device_id: "laptop-1".to_string(),
            monitor_folders: vec![PathBuf::from("/docs"), PathBuf::from("/projects")],
            backup_folder: PathBuf::from("/backups"),
            monitoring_enabled: true,
        };
        storage.save_config(&config).await.unwrap();

        let loaded = storage.load_config("laptop-1").await.unwrap().unwrap();
        assert_eq!(loaded.monitor_folders, config.monitor_folders);
        assert_eq!(loaded.backup_folder, config.backup_folder);
        assert!(loaded.monitoring_enabled);
    }

    #[tokio::test]
    async fn save_overwrites_existing_config() {
        let (storage, _dir) = storage().await;

        let mut config = DeviceConfig {
            device_id: "laptop-1".to_string(),
            monitor_folders: vec![PathBuf::from("/docs")],
            backup_folder: PathBuf::from("/backups"),
            monitoring_enabled: true,
        };
        storage.save_config(&config).await.unwrap();

        config.monitoring_enabled = false;
        config.monitor_folders.push(PathBuf::from("/music"));
        storage.save_config(&config).await.unwrap();

        let loaded = storage.load_config("laptop-1").await.unwrap().unwrap();
        assert_eq!(loaded.monitor_folders.len(), 2);
        assert!(!loaded.monitoring_enabled);
    }
}
