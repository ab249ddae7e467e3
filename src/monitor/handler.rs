use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::retention::RetentionStore;
use super::{EventKind, FileEvent};
use crate::utils::event_log::ActivityLog;

// Editor scratch files; deletions of these never mean data loss.
static TRANSIENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^~").expect("valid pattern"),
        Regex::new(r"^\.tmp").expect("valid pattern"),
        Regex::new(r"\.tmp$").expect("valid pattern"),
    ]
});

fn is_transient(name: &str) -> bool {
    TRANSIENT_PATTERNS.iter().any(|re| re.is_match(name))
}

/// Delay/recheck windows used to classify racy filesystem events.
#[derive(Debug, Clone, Copy)]
pub struct SettleDelays {
    /// Wait after Created before reading the file; some editors create a
    /// zero-byte placeholder first.
    pub create_settle: Duration,
    /// Wait after Deleted before rechecking existence; an atomic
    /// save-as-replace surfaces as delete-then-create within this window.
    pub delete_grace: Duration,
    /// Additional wait before a deletion is considered final.
    pub delete_settle: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            create_settle: Duration::from_millis(200),
            delete_grace: Duration::from_millis(100),
            delete_settle: Duration::from_millis(300),
        }
    }
}

/// Decides, for every filesystem event, whether and how to produce a
/// backup. Shared by all folder watchers of a monitoring session.
pub struct ChangeHandler {
    store: RetentionStore,
    delays: SettleDelays,
    activity: ActivityLog,
    file_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ChangeHandler {
    pub fn new(store: RetentionStore, delays: SettleDelays, activity: ActivityLog) -> Self {
        Self {
            store,
            delays,
            activity,
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for one normalized event. Fault-isolated: a failure
    /// here is logged and never propagated to the watcher.
    pub async fn handle(&self, event: FileEvent) {
        let result = match event.kind {
            EventKind::Modified => self.on_changed(&event.path).await,
            EventKind::Created => self.on_created(&event.path).await,
            EventKind::Moved => match &event.dest_path {
                Some(dest) => self.on_created(dest).await,
                None => Ok(()),
            },
            EventKind::Deleted => self.on_deleted(&event.path).await,
        };

        if let Err(e) = result {
            let name = file_name(&event.path);
            warn!("error backing up {}: {:#}", event.path.display(), e);
            self.activity.record(
                "error",
                format!("Backup failed: {:#}", e),
                name,
            );
        }
    }

    async fn on_changed(&self, path: &Path) -> Result<()> {
        if self.is_own_backup(path) {
            return Ok(());
        }
        self.backup_now(path).await
    }

    async fn on_created(&self, path: &Path) -> Result<()> {
        if self.is_own_backup(path) {
            return Ok(());
        }

        // Settle window for editors that create a placeholder first.
        tokio::time::sleep(self.delays.create_settle).await;

        if !exists(path).await {
            debug!("created file vanished before settle: {}", path.display());
            return Ok(());
        }
        self.backup_now(path).await
    }

    async fn on_deleted(&self, path: &Path) -> Result<()> {
        if self.is_own_backup(path) {
            return Ok(());
        }
        let Some(name) = file_name(path) else {
            return Ok(());
        };
        if is_transient(&name) {
            debug!("ignoring transient file deletion: {}", name);
            return Ok(());
        }

        tokio::time::sleep(self.delays.delete_grace).await;
        if exists(path).await {
            // Save-as-replace, not a real delete. Single re-dispatch.
            info!("save detected, not a deletion: {}", name);
            return self.backup_now(path).await;
        }

        tokio::time::sleep(self.delays.delete_settle).await;
        if exists(path).await {
            info!("file reappeared within grace window: {}", name);
            return self.backup_now(path).await;
        }

        // Deletion confirmed. Retain the last known content, or a marker
        // when this file was never backed up.
        let _guard = self.lock_for(&name).lock_owned().await;
        let prior = self.store.latest_backup_for(&name).await;
        let had_prior = prior.is_some();
        self.store.write_deletion_marker(path, prior.as_deref()).await?;

        if had_prior {
            info!("preserved last backup of deleted file: {}", name);
            self.activity
                .record("info", format!("Preserved backup of deleted {}", name), Some(name));
        } else {
            info!("created deletion marker: {}", name);
            self.activity
                .record("info", format!("Created deletion marker for {}", name), Some(name));
        }
        Ok(())
    }

    async fn backup_now(&self, path: &Path) -> Result<()> {
        let Some(name) = file_name(path) else {
            return Ok(());
        };
        if !exists(path).await {
            debug!("file gone before backup: {}", path.display());
            return Ok(());
        }

        let _guard = self.lock_for(&name).lock_owned().await;
        self.store.write_backup(path).await?;

        info!("backed up latest version: {}", name);
        self.activity
            .record("info", format!("Backed up {}", name), Some(name));
        Ok(())
    }

    // Mutations on the backup folder are serialized per filename so that
    // near-simultaneous events on the same file cannot interleave the
    // purge-then-write sequence.
    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.file_locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // Writes into the backup folder raise their own events when that
    // folder lives inside a watched root; those must not be backed up
    // again.
    fn is_own_backup(&self, path: &Path) -> bool {
        path.starts_with(self.store.folder())
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(String::from)
}
