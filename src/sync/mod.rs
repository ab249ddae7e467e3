use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::monitor::{MonitorSupervisor, RetentionStore};
use crate::storage::{DeviceConfig, Storage};
use crate::utils::config::Config;

/// Capability for the remote object store. The sync loop only ever
/// pushes whole files and never depends on remote state.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap connectivity probe, run before any upload attempt.
    async fn is_reachable(&self) -> bool;

    /// Replace the remote copy of `name` for this device.
    async fn upload(&self, device_id: &str, name: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Remote store speaking the control-plane's HTTP upload API.
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { base_url, client }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn upload(&self, device_id: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("device_id", device_id.to_string())
            .part("file", part);

        let url = format!("{}/api/file-monitor/upload", self.base_url);
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("uploading {} to {}", name, url))?;

        resp.error_for_status()
            .with_context(|| format!("remote rejected upload of {}", name))?;
        Ok(())
    }
}

/// Handle for nudging the sync loop out of its interval sleep, used by
/// the REST layer right after a configuration write.
#[derive(Clone)]
pub struct SyncHandle {
    trigger_tx: mpsc::Sender<()>,
}

impl SyncHandle {
    pub fn trigger(&self) {
        // A full queue already guarantees an imminent cycle.
        let _ = self.trigger_tx.try_send(());
    }
}

/// Periodic reconciliation: keeps the supervisor aligned with the
/// persisted device config and pushes changed backups to the remote
/// store when one is configured.
pub struct SyncLoop {
    storage: Storage,
    supervisor: MonitorSupervisor,
    remote: Option<Arc<dyn RemoteStore>>,
    device_id: String,
    default_backup_folder: std::path::PathBuf,
    uploaded: HashMap<String, blake3::Hash>,
}

impl SyncLoop {
    pub fn new(
        storage: Storage,
        supervisor: MonitorSupervisor,
        remote: Option<Arc<dyn RemoteStore>>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            supervisor,
            remote,
            device_id: config.device_id.clone(),
            default_backup_folder: config.default_backup_folder.clone(),
            uploaded: HashMap::new(),
        }
    }

    pub fn spawn(
        storage: Storage,
        supervisor: MonitorSupervisor,
        remote: Option<Arc<dyn RemoteStore>>,
        config: &Config,
    ) -> SyncHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
        let mut sync = Self::new(storage, supervisor, remote, config);
        let period = config.sync_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    Some(()) = trigger_rx.recv() => {}
                }
                sync.run_cycle().await;
            }
        });

        SyncHandle { trigger_tx }
    }

    async fn run_cycle(&mut self) {
        let config = match self.storage.load_config(&self.device_id).await {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::defaults(&self.device_id, &self.default_backup_folder),
            Err(e) => {
                warn!("failed to load device config: {:#}", e);
                return;
            }
        };

        self.reconcile(&config).await;

        if self.supervisor.status() {
            if let Some(remote) = self.remote.clone() {
                self.push_backups(remote.as_ref(), &config).await;
            }
        }
    }

    /// Align the supervisor with the configured flag; a no-op when they
    /// already agree.
    async fn reconcile(&self, config: &DeviceConfig) {
        let active = self.supervisor.status();

        if config.monitoring_enabled && !active {
            let started = self
                .supervisor
                .start(&config.monitor_folders, &config.backup_folder)
                .await;
            if !started {
                warn!("monitoring enabled but could not start with current configuration");
            }
        } else if !config.monitoring_enabled && active {
            self.supervisor.stop().await;
        }
    }

    /// Push every backup entry whose content changed since the last
    /// successful upload. Skipped wholesale when the remote is
    /// unreachable; per-file failures are logged and retried next cycle.
    async fn push_backups(&mut self, remote: &dyn RemoteStore, config: &DeviceConfig) {
        if !remote.is_reachable().await {
            info!("remote store unreachable, skipping upload cycle");
            return;
        }

        let store = RetentionStore::new(&config.backup_folder);
        let entries = match store.list_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot list backup folder for upload: {:#}", e);
                return;
            }
        };

        let mut pushed = 0usize;
        for entry in entries {
            let path = config.backup_folder.join(&entry.name);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("cannot read {} for upload: {}", entry.name, e);
                    continue;
                }
            };

            let hash = blake3::hash(&bytes);
            if self.uploaded.get(&entry.name) == Some(&hash) {
                debug!("unchanged since last push, skipping: {}", entry.name);
                continue;
            }

            match remote.upload(&self.device_id, &entry.name, bytes).await {
                Ok(()) => {
                    self.uploaded.insert(entry.name.clone(), hash);
                    pushed += 1;
                    info!("uploaded to remote store: {}", entry.name);
                }
                Err(e) => warn!("upload failed for {}: {:#}", entry.name, e),
            }
        }

        if pushed > 0 {
            info!("sync cycle pushed {} file(s)", pushed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SettleDelays;
    use crate::utils::event_log::ActivityLog;
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    struct RecordingRemote {
        reachable: bool,
        uploads: Mutex<Vec<String>>,
    }

    impl RecordingRemote {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable,
                uploads: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteStore for RecordingRemote {
        async fn is_reachable(&self) -> bool {
            self.reachable
        }

        async fn upload(&self, _device_id: &str, name: &str, _bytes: Vec<u8>) -> Result<()> {
            self.uploads.lock().push(name.to_string());
            Ok(())
        }
    }

    async fn test_storage() -> (Storage, TempDir) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}/config.db", dir.path().display());
        let storage = Storage::new(&url).await.unwrap();
        storage.run_migrations().await.unwrap();
        (storage, dir)
    }

    fn test_supervisor() -> MonitorSupervisor {
        let delays = SettleDelays {
            create_settle: Duration::from_millis(20),
            delete_grace: Duration::from_millis(20),
            delete_settle: Duration::from_millis(40),
        };
        MonitorSupervisor::new(delays, ActivityLog::new(100))
    }

    fn agent_config(backup_folder: &std::path::Path) -> Config {
        Config {
            device_id: "test-device".to_string(),
            default_backup_folder: backup_folder.to_path_buf(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn reconcile_starts_and_stops_with_config_flag() {
        let (storage, _db) = test_storage().await;
        let supervisor = test_supervisor();
        let docs = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let device = DeviceConfig {
            device_id: "test-device".to_string(),
            monitor_folders: vec![docs.path().to_path_buf()],
            backup_folder: backups.path().to_path_buf(),
            monitoring_enabled: true,
        };
        storage.save_config(&device).await.unwrap();

        let mut sync = SyncLoop::new(
            storage.clone(),
            supervisor.clone(),
            None,
            &agent_config(backups.path()),
        );

        sync.run_cycle().await;
        assert!(supervisor.status());

        // Unchanged config: no transition, still active.
        sync.run_cycle().await;
        assert!(supervisor.status());

        let mut device = device;
        device.monitoring_enabled = false;
        storage.save_config(&device).await.unwrap();

        sync.run_cycle().await;
        assert!(!supervisor.status());
    }

    #[tokio::test]
    async fn unchanged_files_are_uploaded_once() {
        let (storage, _db) = test_storage().await;
        let supervisor = test_supervisor();
        let docs = tempdir().unwrap();
        let backups = tempdir().unwrap();

        tokio::fs::write(backups.path().join("report.txt_BACKUP"), "v1")
            .await
            .unwrap();

        let device = DeviceConfig {
            device_id: "test-device".to_string(),
            monitor_folders: vec![docs.path().to_path_buf()],
            backup_folder: backups.path().to_path_buf(),
            monitoring_enabled: true,
        };
        storage.save_config(&device).await.unwrap();

        let remote = RecordingRemote::new(true);
        let mut sync = SyncLoop::new(
            storage,
            supervisor.clone(),
            Some(remote.clone()),
            &agent_config(backups.path()),
        );

        sync.run_cycle().await;
        sync.run_cycle().await;
        assert_eq!(remote.uploads.lock().len(), 1);

        // Content change makes the file eligible again.
        tokio::fs::write(backups.path().join("report.txt_BACKUP"), "v2")
            .await
            .unwrap();
        sync.run_cycle().await;
        assert_eq!(remote.uploads.lock().len(), 2);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn unreachable_remote_skips_cycle_without_stopping_monitoring() {
        let (storage, _db) = test_storage().await;
        let supervisor = test_supervisor();
        let docs = tempdir().unwrap();
        let backups = tempdir().unwrap();

        tokio::fs::write(backups.path().join("report.txt_BACKUP"), "v1")
            .await
            .unwrap();

        let device = DeviceConfig {
            device_id: "test-device".to_string(),
            monitor_folders: vec![docs.path().to_path_buf()],
            backup_folder: backups.path().to_path_buf(),
            monitoring_enabled: true,
        };
        storage.save_config(&device).await.unwrap();

        let remote = RecordingRemote::new(false);
        let mut sync = SyncLoop::new(
            storage,
            supervisor.clone(),
            Some(remote.clone()),
            &agent_config(backups.path()),
        );

        sync.run_cycle().await;
        assert!(remote.uploads.lock().is_empty());
        assert!(supervisor.status());

        supervisor.stop().await;
    }
}
