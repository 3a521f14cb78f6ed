//! Background upload processing: intake of detected files and the upload loop.
use crate::db::{self, Pool};
use crate::queue::UploadQueue;
use crate::quota::QuotaTracker;
use crate::settings::{Settings, SettingsStore};
use crate::youtube::{ChunkStatus, UploadError, VideoMetadata, VideoPlatform, DEFAULT_CATEGORY_ID};
use anyhow::Result;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

const SMALL_CHUNK: usize = 1024 * 1024;
const LARGE_CHUNK: usize = 4 * 1024 * 1024;
const LARGE_FILE: u64 = 100 * 1024 * 1024;

pub fn chunk_size_for(file_size: u64) -> usize {
    if file_size > LARGE_FILE {
        LARGE_CHUNK
    } else {
        SMALL_CHUNK
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub cleanup_after: Duration,
    /// Retry `n` waits `2^n` of these.
    pub backoff_unit: Duration,
    pub unauthenticated_sleep: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            cleanup_after: Duration::from_secs(3600),
            backoff_unit: Duration::from_secs(1),
            unauthenticated_sleep: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Unauthenticated,
    LimitReached,
    Idle,
    Processed,
}

enum Step {
    Session(String),
    Chunk(ChunkStatus),
}

#[derive(Clone)]
pub struct Uploader {
    queue: UploadQueue,
    settings: SettingsStore,
    platform: Arc<dyn VideoPlatform>,
    quota: QuotaTracker,
    pool: Pool,
    opts: WorkerOptions,
}

impl Uploader {
    pub fn new(
        queue: UploadQueue,
        settings: SettingsStore,
        platform: Arc<dyn VideoPlatform>,
        quota: QuotaTracker,
        pool: Pool,
        opts: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            settings,
            platform,
            quota,
            pool,
            opts,
        }
    }

    /// Process the queue forever, one upload at a time.
    pub async fn run(self) {
        loop {
            let pause = match self.tick().await {
                Ok(Tick::Unauthenticated) => self.opts.unauthenticated_sleep,
                Ok(_) => self.opts.poll_interval,
                Err(err) => {
                    error!(?err, "upload worker error");
                    Duration::from_secs(1)
                }
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// One pass: upload the next pending task if allowed, then clean up.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<Tick> {
        if !self.platform.is_authenticated().await {
            return Ok(Tick::Unauthenticated);
        }

        let limit = self.quota.status().await;
        if self.quota.take_cleared().await {
            self.platform.limit_window_ended().await;
            let requeued = self.queue.requeue_limit_blocked().await;
            info!(requeued, "upload limit reset; requeued blocked tasks");
        }

        let outcome = if limit.reached {
            Tick::LimitReached
        } else if let Some(id) = self.queue.next_pending().await {
            self.upload_task(&id).await?;
            Tick::Processed
        } else {
            Tick::Idle
        };

        let removed = self.queue.cleanup(self.opts.cleanup_after).await;
        if removed > 0 {
            debug!(removed, "cleaned up finished tasks");
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn upload_task(&self, id: &str) -> Result<()> {
        let settings = self.settings.snapshot().await;
        let Some(task) = self.queue.with_task(id, |t| {
            t.mark_uploading();
            t.clone()
        })
        .await
        else {
            return Ok(());
        };

        let path = task.file_path.clone();
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.fail(id, "File no longer exists").await;
                return Ok(());
            }
        };
        if size == 0 {
            self.fail(id, "File is empty").await;
            return Ok(());
        }
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(err) => {
                self.fail(id, format!("Upload failed: {}", err)).await;
                return Ok(());
            }
        };

        let metadata = VideoMetadata {
            title: settings.render_title(&task.stem()),
            description: settings.description.clone(),
            tags: settings.tag_list(),
            category_id: DEFAULT_CATEGORY_ID.to_string(),
            privacy: settings.privacy,
        };
        let channel = settings.selected_channel_id.clone();
        let chunk_size = chunk_size_for(size);

        let mut session: Option<String> = None;
        let mut offset: u64 = 0;
        let mut retries: u32 = 0;

        loop {
            let cancelled = self
                .queue
                .with_task(id, |t| t.cancel_requested)
                .await
                .unwrap_or(true);
            if cancelled {
                self.queue.with_task(id, |t| t.mark_cancelled()).await;
                info!(id, "upload cancelled");
                return Ok(());
            }

            let step = match &session {
                None => self
                    .platform
                    .start_upload(&metadata, size, channel.as_deref())
                    .await
                    .map(Step::Session),
                Some(url) => {
                    let expected = size.saturating_sub(offset).min(chunk_size as u64) as usize;
                    let chunk = match read_chunk(&mut file, offset, chunk_size).await {
                        Ok(chunk) if chunk.len() == expected && expected > 0 => chunk,
                        Ok(chunk) => {
                            warn!(id, offset, expected, read = chunk.len(), "file size changed");
                            self.fail(id, "File changed during upload").await;
                            return Ok(());
                        }
                        Err(err) => {
                            self.fail(id, format!("Upload failed: {}", err)).await;
                            return Ok(());
                        }
                    };
                    self.platform
                        .upload_chunk(url, offset, chunk, size)
                        .await
                        .map(Step::Chunk)
                }
            };

            match step {
                Ok(Step::Session(url)) => {
                    session = Some(url);
                    retries = 0;
                }
                Ok(Step::Chunk(ChunkStatus::Incomplete { next_offset })) => {
                    offset = next_offset;
                    retries = 0;
                    let progress = ((offset.min(size) * 100) / size).min(99) as u8;
                    self.queue.with_task(id, |t| t.progress = progress).await;
                }
                Ok(Step::Chunk(ChunkStatus::Complete { video_id })) => {
                    self.complete(id, &path, &video_id, &settings).await;
                    return Ok(());
                }
                Err(UploadError::LimitExceeded(detail)) => {
                    self.handle_limit(id, &settings, &detail).await;
                    return Ok(());
                }
                Err(UploadError::Transient(msg)) => {
                    retries += 1;
                    warn!(id, retries, max = settings.max_retries, error = %msg, "network error during upload");
                    if retries > settings.max_retries {
                        self.fail(id, "Failed after maximum retry attempts").await;
                        return Ok(());
                    }
                    let wait = self.opts.backoff_unit * 2u32.saturating_pow(retries);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    self.fail(id, format!("Upload failed: {}", err)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn complete(
        &self,
        id: &str,
        path: &Path,
        video_id: &str,
        settings: &Settings,
    ) {
        self.queue.with_task(id, |t| t.mark_completed(video_id)).await;
        info!(id, video_id, "upload completed");
        if let Err(err) = db::record_upload(&self.pool, &path.to_string_lossy(), video_id).await {
            warn!(?err, id, "failed to record upload history");
        }
        if settings.delete_after_upload {
            spawn_delete(
                self.queue.clone(),
                id.to_string(),
                path.to_path_buf(),
                settings.delete_retry_count,
                Duration::from_secs(settings.delete_retry_delay),
            );
        }
    }

    async fn handle_limit(&self, id: &str, settings: &Settings, detail: &str) {
        match self.platform.switch_project_after_limit().await {
            Ok(Some(project)) => {
                info!(id, project = %project, "retrying upload with another project");
                self.queue.with_task(id, |t| t.reset_pending()).await;
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(?err, "failed to switch project"),
        }
        let hours = settings.upload_limit_duration;
        warn!(id, detail, "upload limit exceeded");
        self.queue
            .with_task(id, |t| {
                t.mark_error(format!("Upload limit exceeded. Will retry in {} hours.", hours));
                t.limit_blocked = true;
            })
            .await;
        // The window is held in memory even when persisting it fails.
        if let Err(err) = self.quota.set_reached(hours).await {
            warn!(?err, "failed to persist upload limit");
        }
    }

    async fn fail(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(id, error = %message, "upload failed");
        self.queue.with_task(id, |t| t.mark_error(message)).await;
    }
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, size: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(size);
    file.take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Delete an uploaded file in the background, retrying while it is locked.
pub fn spawn_delete(
    queue: UploadQueue,
    id: String,
    path: PathBuf,
    attempts: u32,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..attempts {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                queue.with_task(&id, |t| t.delete_success = true).await;
                return;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(id = %id, path = %path.display(), "deleted uploaded file");
                    queue.with_task(&id, |t| t.delete_success = true).await;
                    return;
                }
                Err(err) => {
                    debug!(?err, path = %path.display(), "delete attempt failed");
                    queue.with_task(&id, |t| t.delete_attempts += 1).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!(id = %id, path = %path.display(), attempts, "giving up on deleting file");
        queue
            .with_task(&id, |t| {
                t.error = Some(format!("Failed to delete file after {} attempts", attempts));
            })
            .await;
    })
}

/// Feed detected files into the queue, skipping files uploaded before.
pub async fn run_intake(mut rx: mpsc::UnboundedReceiver<PathBuf>, queue: UploadQueue, pool: Pool) {
    while let Some(path) = rx.recv().await {
        let key = path.to_string_lossy().into_owned();
        match db::is_uploaded(&pool, &key).await {
            Ok(true) => {
                debug!(path = %key, "already uploaded; skipping");
                continue;
            }
            Ok(false) => {}
            Err(err) => warn!(?err, "failed to check upload history"),
        }
        if let Err(err) = queue.add(&path).await {
            warn!(?err, path = %key, "failed to queue file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes() {
        assert_eq!(chunk_size_for(10), SMALL_CHUNK);
        assert_eq!(chunk_size_for(LARGE_FILE), SMALL_CHUNK);
        assert_eq!(chunk_size_for(LARGE_FILE + 1), LARGE_CHUNK);
    }

    #[tokio::test]
    async fn delete_missing_file_counts_as_success() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("gone.mp4");
        tokio::fs::write(&path, b"x").await.unwrap();
        let queue = UploadQueue::new();
        let view = queue.add(&path).await.unwrap().unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        spawn_delete(queue.clone(), view.id.clone(), path, 3, Duration::from_millis(1))
            .await
            .unwrap();
        let task = queue.get(&view.id).await.unwrap();
        assert!(task.delete_success);
        assert_eq!(task.delete_attempts, 0);
    }

    #[tokio::test]
    async fn delete_gives_up_on_directory() {
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("a.mp4");
        tokio::fs::write(&file, b"x").await.unwrap();
        let queue = UploadQueue::new();
        let view = queue.add(&file).await.unwrap().unwrap();

        // remove_file on a directory always fails
        let dir = td.path().join("locked.mp4");
        tokio::fs::create_dir(&dir).await.unwrap();
        spawn_delete(queue.clone(), view.id.clone(), dir, 2, Duration::from_millis(1))
            .await
            .unwrap();
        let task = queue.get(&view.id).await.unwrap();
        assert!(!task.delete_success);
        assert_eq!(task.delete_attempts, 2);
        assert_eq!(task.error.as_deref(), Some("Failed to delete file after 2 attempts"));
    }
}
