pub mod handler;
pub mod retention;
pub mod supervisor;
pub mod watcher;

pub use handler::{ChangeHandler, SettleDelays};
pub use retention::{BackupEntry, RetentionStore};
pub use supervisor::MonitorSupervisor;
pub use watcher::FolderWatcher;

use std::path::PathBuf;

/// Normalized filesystem change kinds delivered to the change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// One normalized filesystem event. `dest_path` is set for moves only.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: EventKind,
    pub path: PathBuf,
    pub dest_path: Option<PathBuf>,
}
