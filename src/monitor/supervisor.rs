use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::handler::{ChangeHandler, SettleDelays};
use super::retention::RetentionStore;
use super::watcher::FolderWatcher;
use crate::utils::event_log::ActivityLog;

struct Session {
    id: Uuid,
    watchers: Vec<FolderWatcher>,
}

struct Inner {
    delays: SettleDelays,
    activity: ActivityLog,
    active: AtomicBool,
    // Guards start/stop transitions; only one in flight at a time.
    session: Mutex<Option<Session>>,
}

/// Owns the lifecycle of one watcher per configured root folder and the
/// process-wide "is monitoring active" status. At most one session is
/// active at a time.
#[derive(Clone)]
pub struct MonitorSupervisor {
    inner: Arc<Inner>,
}

impl MonitorSupervisor {
    pub fn new(delays: SettleDelays, activity: ActivityLog) -> Self {
        Self {
            inner: Arc::new(Inner {
                delays,
                activity,
                active: AtomicBool::new(false),
                session: Mutex::new(None),
            }),
        }
    }

    /// Start a monitoring session. Returns false, with no side effect,
    /// when the configuration is unusable or a session is already
    /// active. Non-existent roots are skipped with a warning; the
    /// session starts if at least one watcher was installed.
    pub async fn start(&self, roots: &[PathBuf], backup_folder: &Path) -> bool {
        let mut slot = self.inner.session.lock().await;

        if slot.is_some() {
            warn!("monitoring already active, ignoring start");
            return false;
        }
        if roots.is_empty() {
            warn!("no folders configured to monitor");
            return false;
        }
        if backup_folder.as_os_str().is_empty() {
            warn!("no backup folder configured");
            return false;
        }

        let store = RetentionStore::new(backup_folder);
        if let Err(e) = store.ensure_folder().await {
            error!("cannot create backup folder: {:#}", e);
            return false;
        }

        let handler = Arc::new(ChangeHandler::new(
            store,
            self.inner.delays,
            self.inner.activity.clone(),
        ));

        let mut watchers = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!("folder does not exist, skipping: {}", root.display());
                continue;
            }
            match FolderWatcher::spawn(root, handler.clone()) {
                Ok(watcher) => {
                    info!("monitoring folder: {}", root.display());
                    watchers.push(watcher);
                }
                Err(e) => warn!("failed to watch {}: {}", root.display(), e),
            }
        }

        if watchers.is_empty() {
            warn!("no valid folders to monitor");
            return false;
        }

        let id = Uuid::new_v4();
        info!(
            session = %id,
            "monitoring started, backups saved to {}",
            backup_folder.display()
        );
        self.inner.activity.record(
            "info",
            format!("Monitoring started ({} folders)", watchers.len()),
            None,
        );

        *slot = Some(Session { id, watchers });
        self.inner.active.store(true, Ordering::SeqCst);
        true
    }

    /// Stop the active session, joining every watcher before returning
    /// so no event fires afterwards. Safe no-op when not active.
    pub async fn stop(&self) -> bool {
        let mut slot = self.inner.session.lock().await;
        self.inner.active.store(false, Ordering::SeqCst);

        if let Some(session) = slot.take() {
            let count = session.watchers.len();
            futures::future::join_all(session.watchers.into_iter().map(FolderWatcher::stop))
                .await;
            info!(session = %session.id, "monitoring stopped ({} watchers joined)", count);
            self.inner
                .activity
                .record("info", "Monitoring stopped".to_string(), None);
        }
        true
    }

    /// Current active flag; pure read.
    pub fn status(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}
