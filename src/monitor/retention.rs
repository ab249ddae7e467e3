use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use tokio_stream::{wrappers::ReadDirStream, StreamExt};
use tracing::{debug, warn};

/// Suffix appended to a source filename to form its retained backup name.
pub const BACKUP_SUFFIX: &str = "_BACKUP";

#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    #[serde(rename = "sizeBytes")]
    pub size: u64,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
}

/// Manages the on-disk backup folder: one retained entry per source
/// filename, named `<name>_BACKUP`. Legacy timestamp-suffixed entries
/// (`<name>_<timestamp>`) are honored on lookup and purge only.
#[derive(Debug, Clone)]
pub struct RetentionStore {
    folder: PathBuf,
}

impl RetentionStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Create the backup folder if it does not exist. Idempotent.
    pub async fn ensure_folder(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.folder)
            .await
            .with_context(|| format!("creating backup folder {}", self.folder.display()))?;
        Ok(())
    }

    fn retained_path(&self, source_name: &str) -> PathBuf {
        self.folder.join(format!("{}{}", source_name, BACKUP_SUFFIX))
    }

    // Prefix rule covers both the current `<name>_BACKUP` naming and the
    // legacy `<name>_<timestamp>` form.
    fn matches(entry_name: &str, source_name: &str) -> bool {
        entry_name
            .strip_prefix(source_name)
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Find an existing backup entry for `source_name`. Enumeration order
    /// is filesystem-defined; with multiple legacy entries any match may
    /// be returned.
    pub async fn latest_backup_for(&self, source_name: &str) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(&self.folder).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if Self::matches(name, source_name) {
                    return Some(entry.path());
                }
            }
        }
        None
    }

    /// Delete every entry matching `source_name`. Individual deletion
    /// failures (locked files) are logged and skipped.
    pub async fn purge_backups_for(&self, source_name: &str) -> Result<()> {
        self.purge_except(source_name, None).await
    }

    async fn purge_except(&self, source_name: &str, keep: Option<&Path>) -> Result<()> {
        if !tokio::fs::try_exists(&self.folder).await.unwrap_or(false) {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(&self.folder)
            .await
            .with_context(|| format!("reading backup folder {}", self.folder.display()))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !Self::matches(name, source_name) {
                continue;
            }
            let path = entry.path();
            if keep.is_some_and(|k| k == path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("removed old backup: {}", name),
                Err(e) => warn!("failed to remove old backup {}: {}", name, e),
            }
        }

        Ok(())
    }

    /// Copy the current content of `source_path` to the retained backup
    /// name, replacing any older entries. Exactly one entry exists for
    /// the filename afterwards.
    pub async fn write_backup(&self, source_path: &Path) -> Result<PathBuf> {
        let source_name = file_name_of(source_path)?;
        self.ensure_folder().await?;

        let dest = self.retained_path(&source_name);
        let modified = tokio::fs::metadata(source_path)
            .await
            .and_then(|m| m.modified())
            .with_context(|| format!("reading metadata of {}", source_path.display()))?;

        self.purge_backups_for(&source_name).await?;

        tokio::fs::copy(source_path, &dest)
            .await
            .with_context(|| format!("copying {} to backup", source_path.display()))?;

        // Carry the source's modification time onto the copy.
        let dest_for_times = dest.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&dest_for_times)?;
            file.set_times(FileTimes::new().set_modified(modified))
        })
        .await??;

        Ok(dest)
    }

    /// Retain an artifact for a file observed deleted: carry forward the
    /// prior backup when one exists, otherwise write a text marker with
    /// the original path and deletion time.
    pub async fn write_deletion_marker(
        &self,
        original_path: &Path,
        prior_backup: Option<&Path>,
    ) -> Result<PathBuf> {
        let source_name = file_name_of(original_path)?;
        self.ensure_folder().await?;

        let dest = self.retained_path(&source_name);

        match prior_backup {
            Some(prior) if prior != dest => {
                tokio::fs::copy(prior, &dest)
                    .await
                    .with_context(|| format!("carrying forward {}", prior.display()))?;
            }
            Some(_) => {
                // Prior backup already lives under the retained name.
            }
            None => {
                let marker = format!(
                    "File was deleted: {}\nTimestamp: {}\n",
                    original_path.display(),
                    Utc::now().to_rfc3339()
                );
                tokio::fs::write(&dest, marker)
                    .await
                    .with_context(|| format!("writing deletion marker for {}", source_name))?;
            }
        }

        self.purge_except(&source_name, Some(&dest)).await?;
        Ok(dest)
    }

    /// Enumerate the backup folder, newest first.
    pub async fn list_entries(&self) -> Result<Vec<BackupEntry>> {
        let mut out = Vec::new();

        if !tokio::fs::try_exists(&self.folder).await.unwrap_or(false) {
            return Ok(out);
        }

        let read_dir = tokio::fs::read_dir(&self.folder)
            .await
            .with_context(|| format!("reading backup folder {}", self.folder.display()))?;
        let mut entries = ReadDirStream::new(read_dir);

        while let Some(entry) = entries.next().await {
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(BackupEntry {
                name,
                size: meta.len(),
                last_modified,
            });
        }

        out.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(out)
    }

    /// Remove a single entry by its backup name. Returns false when the
    /// entry does not exist. Rejects anything but a bare filename.
    pub async fn remove_entry(&self, name: &str) -> Result<bool> {
        anyhow::ensure!(is_bare_filename(name), "invalid backup name: {}", name);

        let path = self.folder.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing backup {}", name)),
        }
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .with_context(|| format!("path has no usable filename: {}", path.display()))
}

pub(crate) fn is_bare_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    async fn write_source(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn write_backup_keeps_exactly_one_entry() {
        let src_dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let source = write_source(src_dir.path(), "report.txt", "v1").await;
        store.write_backup(&source).await.unwrap();

        tokio::fs::write(&source, "v2").await.unwrap();
        store.write_backup(&source).await.unwrap();

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report.txt_BACKUP");

        let content = tokio::fs::read_to_string(backup_dir.path().join("report.txt_BACKUP"))
            .await
            .unwrap();
        assert_eq!(content, "v2");
    }

    #[tokio::test]
    async fn write_backup_replaces_legacy_timestamped_entries() {
        let src_dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        tokio::fs::write(backup_dir.path().join("report.txt_20240101T120000"), "old")
            .await
            .unwrap();

        let source = write_source(src_dir.path(), "report.txt", "new").await;
        store.write_backup(&source).await.unwrap();

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report.txt_BACKUP");
    }

    #[tokio::test]
    async fn prefix_match_does_not_cross_filenames() {
        let src_dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let report = write_source(src_dir.path(), "report.txt", "a").await;
        let report2 = write_source(src_dir.path(), "report.txt.bak", "b").await;
        store.write_backup(&report).await.unwrap();
        store.write_backup(&report2).await.unwrap();

        let mut names: Vec<_> = store
            .list_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["report.txt.bak_BACKUP", "report.txt_BACKUP"]);
    }

    #[tokio::test]
    async fn deletion_marker_without_prior_backup_records_path_and_time() {
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let original = Path::new("/docs/notes.txt");
        let dest = store.write_deletion_marker(original, None).await.unwrap();

        let content = tokio::fs::read_to_string(&dest).await.unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("File was deleted: /docs/notes.txt"));
        assert!(lines.next().unwrap().starts_with("Timestamp: "));
    }

    #[tokio::test]
    async fn deletion_with_prior_backup_preserves_content() {
        let src_dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let source = write_source(src_dir.path(), "report.txt", "last known").await;
        store.write_backup(&source).await.unwrap();

        let prior = store.latest_backup_for("report.txt").await;
        let dest = store
            .write_deletion_marker(&source, prior.as_deref())
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&dest).await.unwrap();
        assert_eq!(content, "last known");

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn deletion_carries_legacy_backup_forward_under_retained_name() {
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let legacy = backup_dir.path().join("report.txt_20240101T120000");
        tokio::fs::write(&legacy, "legacy content").await.unwrap();

        let prior = store.latest_backup_for("report.txt").await;
        assert_eq!(prior.as_deref(), Some(legacy.as_path()));

        store
            .write_deletion_marker(Path::new("/docs/report.txt"), prior.as_deref())
            .await
            .unwrap();

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report.txt_BACKUP");

        let content = tokio::fs::read_to_string(backup_dir.path().join("report.txt_BACKUP"))
            .await
            .unwrap();
        assert_eq!(content, "legacy content");
    }

    #[tokio::test]
    async fn list_entries_orders_newest_first() {
        let src_dir = tempdir().unwrap();
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        let older = write_source(src_dir.path(), "a.txt", "a").await;
        store.write_backup(&older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let newer = write_source(src_dir.path(), "b.txt", "b").await;
        store.write_backup(&newer).await.unwrap();

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries[0].name, "b.txt_BACKUP");
        assert_eq!(entries[1].name, "a.txt_BACKUP");
    }

    #[tokio::test]
    async fn remove_entry_rejects_path_traversal() {
        let backup_dir = tempdir().unwrap();
        let store = RetentionStore::new(backup_dir.path());

        assert!(store.remove_entry("../escape").await.is_err());
        assert!(store.remove_entry("a/b").await.is_err());
        assert!(!store.remove_entry("missing_BACKUP").await.unwrap());
    }

    #[tokio::test]
    async fn purge_is_safe_on_missing_folder() {
        let store = RetentionStore::new("/nonexistent/backup/folder");
        store.purge_backups_for("report.txt").await.unwrap();
        assert!(store.latest_backup_for("report.txt").await.is_none());
    }

    proptest! {
        #[test]
        fn retention_count_is_one_for_any_filename(
            name in "[A-Za-z0-9][A-Za-z0-9._-]{0,24}",
            writes in 1usize..4,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                let src_dir = tempdir().unwrap();
                let backup_dir = tempdir().unwrap();
                let store = RetentionStore::new(backup_dir.path());

                let source = src_dir.path().join(&name);
                for i in 0..writes {
                    tokio::fs::write(&source, format!("v{}", i)).await.unwrap();
                    store.write_backup(&source).await.unwrap();
                }

                let entries = store.list_entries().await.unwrap();
                prop_assert_eq!(entries.len(), 1);
                prop_assert_eq!(&entries[0].name, &format!("{}_BACKUP", name));
                Ok(())
            })?;
        }
    }
}
