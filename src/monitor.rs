//! Watch a folder for new video files and feed them to the upload intake.
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "mkv", "flv"];

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitoring is already active")]
    AlreadyRunning,
    #[error("no folder selected")]
    NoFolder,
    #[error("folder does not exist: {0}")]
    MissingFolder(PathBuf),
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

struct ActiveWatch {
    folder: PathBuf,
    _watcher: RecommendedWatcher,
    forwarder: JoinHandle<()>,
}

/// Non-recursive folder watcher. Detected files are sent on `intake`.
pub struct FolderMonitor {
    intake: mpsc::UnboundedSender<PathBuf>,
    settle_delay: Duration,
    active: Mutex<Option<ActiveWatch>>,
}

impl std::fmt::Debug for FolderMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderMonitor")
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl FolderMonitor {
    pub fn new(intake: mpsc::UnboundedSender<PathBuf>, settle_delay: Duration) -> Self {
        Self {
            intake,
            settle_delay,
            active: Mutex::new(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self, folder: &Path, check_existing: bool) -> Result<(), MonitorError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        if folder.as_os_str().is_empty() {
            return Err(MonitorError::NoFolder);
        }
        if !tokio::fs::metadata(folder)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(MonitorError::MissingFolder(folder.to_path_buf()));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for path in candidate_paths(&event) {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(err) => warn!(?err, "watch error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(folder, RecursiveMode::NonRecursive)?;

        let forwarder = tokio::spawn(forward_settled(
            raw_rx,
            self.intake.clone(),
            self.settle_delay,
        ));

        *active = Some(ActiveWatch {
            folder: folder.to_path_buf(),
            _watcher: watcher,
            forwarder,
        });
        drop(active);
        info!(folder = %folder.display(), "monitoring started");

        if check_existing {
            let found = self.scan(folder).await?;
            debug!(found, "queued existing files");
        }
        Ok(())
    }

    /// Stop watching. Stopping an idle monitor is a no-op.
    pub async fn stop(&self) {
        if let Some(watch) = self.active.lock().await.take() {
            watch.forwarder.abort();
            info!(folder = %watch.folder.display(), "monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Send every video file already in `folder` to the intake.
    #[instrument(skip(self))]
    pub async fn scan(&self, folder: &Path) -> Result<usize, MonitorError> {
        if !tokio::fs::try_exists(folder).await.unwrap_or(false) {
            return Err(MonitorError::MissingFolder(folder.to_path_buf()));
        }
        let mut entries = tokio::fs::read_dir(folder).await?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_video_file(&path) && entry.file_type().await?.is_file() {
                found.push(path);
            }
        }
        found.sort();
        let count = found.len();
        for path in found {
            let _ = self.intake.send(path);
        }
        Ok(count)
    }
}

/// Paths from a watcher event that may be new video files.
fn candidate_paths(event: &Event) -> Vec<PathBuf> {
    let paths: Vec<&PathBuf> = match event.kind {
        EventKind::Create(_) => event.paths.iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            event.paths.iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().into_iter().collect()
        }
        _ => Vec::new(),
    };
    paths
        .into_iter()
        .filter(|p| is_video_file(p))
        .cloned()
        .collect()
}

/// Wait `delay` after each detection so the writer can finish, then forward
/// the path if it is still a regular file.
async fn forward_settled(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    intake: mpsc::UnboundedSender<PathBuf>,
    delay: Duration,
) {
    while let Some(path) = raw.recv().await {
        let intake = intake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file {
                debug!(path = %path.display(), "new video detected");
                let _ = intake.send(path);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use tempfile::tempdir;

    #[test]
    fn video_extensions() {
        assert!(is_video_file(Path::new("/a/b.mp4")));
        assert!(is_video_file(Path::new("CLIP.MKV")));
        assert!(is_video_file(Path::new("x.flv")));
        assert!(!is_video_file(Path::new("notes.txt")));
        assert!(!is_video_file(Path::new("mp4")));
    }

    #[test]
    fn create_and_rename_events_are_candidates() {
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/w/a.mp4"))
            .add_path(PathBuf::from("/w/a.txt"));
        assert_eq!(candidate_paths(&create), vec![PathBuf::from("/w/a.mp4")]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/a.part"))
            .add_path(PathBuf::from("/w/a.mov"));
        assert_eq!(candidate_paths(&rename), vec![PathBuf::from("/w/a.mov")]);

        let data = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/w/a.mp4"));
        assert!(candidate_paths(&data).is_empty());
    }

    #[tokio::test]
    async fn start_rejects_missing_folder_and_double_start() {
        let td = tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(tx, Duration::from_millis(10));

        let err = monitor.start(&td.path().join("nope"), false).await.unwrap_err();
        assert!(matches!(err, MonitorError::MissingFolder(_)));
        assert!(!monitor.is_monitoring().await);

        monitor.start(td.path(), false).await.unwrap();
        assert!(monitor.is_monitoring().await);
        assert!(matches!(
            monitor.start(td.path(), false).await,
            Err(MonitorError::AlreadyRunning)
        ));

        monitor.stop().await;
        assert!(!monitor.is_monitoring().await);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn start_with_existing_files_scans() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(td.path().join("a.mov"), b"x").unwrap();
        std::fs::write(td.path().join("readme.txt"), b"x").unwrap();
        std::fs::create_dir(td.path().join("dir.mp4")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(tx, Duration::from_millis(10));
        monitor.start(td.path(), true).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), td.path().join("a.mov"));
        assert_eq!(rx.recv().await.unwrap(), td.path().join("b.mp4"));
        assert!(rx.try_recv().is_err());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn new_file_is_forwarded_after_settle() {
        let td = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(tx, Duration::from_millis(50));
        monitor.start(td.path(), false).await.unwrap();

        let path = td.path().join("fresh.mp4");
        tokio::fs::write(&path, b"video").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("file should be detected")
            .unwrap();
        assert_eq!(got.file_name(), path.file_name());
        monitor.stop().await;
    }
}
