use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::handler::ChangeHandler;
use super::{EventKind, FileEvent};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("folder does not exist: {0}")]
    RootNotFound(String),
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

/// Recursive watch on one root folder. Raw notify events are bridged
/// into a tokio channel, normalized, and each handled on its own task so
/// per-event settle delays never stall other events.
///
/// The inner `RecommendedWatcher` must stay alive for the watch to keep
/// delivering; `stop` consumes the watcher and joins all in-flight work.
pub struct FolderWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
}

impl FolderWatcher {
    pub fn spawn(root: &Path, handler: Arc<ChangeHandler>) -> Result<Self, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::RootNotFound(root.display().to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!("filesystem watcher error: {}", e),
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let root_buf = root.to_path_buf();
        let forwarder = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            while let Some(raw) = rx.recv().await {
                for event in normalize(raw) {
                    let handler = handler.clone();
                    in_flight.spawn(async move { handler.handle(event).await });
                }
                // Reap whatever already finished; completion is awaited
                // in full on shutdown.
                while in_flight.try_join_next().is_some() {}
            }
            while in_flight.join_next().await.is_some() {}
            debug!("watcher drained for {}", root_buf.display());
        });

        Ok(Self {
            root: root.to_path_buf(),
            watcher,
            forwarder,
        })
    }

    /// Deregister the OS watch and block until every in-flight event has
    /// been fully handled.
    pub async fn stop(self) {
        // Dropping the watcher drops its callback and with it the channel
        // sender; the forwarder then drains and exits.
        drop(self.watcher);
        if let Err(e) = self.forwarder.await {
            warn!("watcher task for {} ended abnormally: {}", self.root.display(), e);
        }
    }
}

/// Map raw notify events onto the normalized event model. Directory
/// events and metadata-only changes are filtered out here.
fn normalize(event: notify::Event) -> Vec<FileEvent> {
    let mut out = Vec::new();

    match event.kind {
        notify::EventKind::Create(CreateKind::Folder) => {}
        notify::EventKind::Create(_) => {
            for path in event.paths {
                if !path.is_dir() {
                    out.push(FileEvent {
                        kind: EventKind::Created,
                        path,
                        dest_path: None,
                    });
                }
            }
        }
        notify::EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => {
                if let [src, dest] = event.paths.as_slice() {
                    out.push(FileEvent {
                        kind: EventKind::Moved,
                        path: src.clone(),
                        dest_path: Some(dest.clone()),
                    });
                }
            }
            // A lone rename-from means the file left this path.
            RenameMode::From => {
                for path in event.paths {
                    out.push(FileEvent {
                        kind: EventKind::Deleted,
                        path,
                        dest_path: None,
                    });
                }
            }
            RenameMode::To => {
                for path in event.paths {
                    if !path.is_dir() {
                        out.push(FileEvent {
                            kind: EventKind::Created,
                            path,
                            dest_path: None,
                        });
                    }
                }
            }
            _ => {
                // Backend could not tell which side of the rename this
                // is; classify by current existence.
                for path in event.paths {
                    if path.is_file() {
                        out.push(FileEvent {
                            kind: EventKind::Created,
                            path,
                            dest_path: None,
                        });
                    } else if !path.exists() {
                        out.push(FileEvent {
                            kind: EventKind::Deleted,
                            path,
                            dest_path: None,
                        });
                    }
                }
            }
        },
        notify::EventKind::Modify(ModifyKind::Metadata(_)) => {}
        notify::EventKind::Modify(_) => {
            for path in event.paths {
                if !path.is_dir() {
                    out.push(FileEvent {
                        kind: EventKind::Modified,
                        path,
                        dest_path: None,
                    });
                }
            }
        }
        notify::EventKind::Remove(RemoveKind::Folder) => {}
        notify::EventKind::Remove(_) => {
            for path in event.paths {
                out.push(FileEvent {
                    kind: EventKind::Deleted,
                    path,
                    dest_path: None,
                });
            }
        }
        _ => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, MetadataKind};

    fn raw(kind: notify::EventKind, paths: Vec<PathBuf>) -> notify::Event {
        notify::Event {
            kind,
            paths,
            attrs: Default::default(),
        }
    }

    #[test]
    fn rename_both_becomes_a_move_with_destination() {
        let events = normalize(raw(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![PathBuf::from("/a/old.txt"), PathBuf::from("/a/new.txt")],
        ));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Moved);
        assert_eq!(events[0].path, PathBuf::from("/a/old.txt"));
        assert_eq!(events[0].dest_path, Some(PathBuf::from("/a/new.txt")));
    }

    #[test]
    fn lone_rename_from_is_a_deletion() {
        let events = normalize(raw(
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec![PathBuf::from("/a/gone.txt")],
        ));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Deleted);
    }

    #[test]
    fn metadata_only_changes_are_filtered() {
        let events = normalize(raw(
            notify::EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)),
            vec![PathBuf::from("/a/file.txt")],
        ));
        assert!(events.is_empty());
    }

    #[test]
    fn data_changes_map_to_modified() {
        let events = normalize(raw(
            notify::EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec![PathBuf::from("/a/file.txt")],
        ));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Modified);
    }

    #[test]
    fn folder_removal_is_filtered() {
        let events = normalize(raw(
            notify::EventKind::Remove(RemoveKind::Folder),
            vec![PathBuf::from("/a/subdir")],
        ));
        assert!(events.is_empty());
    }
}
