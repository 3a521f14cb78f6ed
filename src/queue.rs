use crate::model::{TaskStatus, TaskView, UploadTask};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Ordered in-memory upload queue shared by the API, the intake and the worker.
#[derive(Debug, Clone, Default)]
pub struct UploadQueue {
    tasks: Arc<Mutex<Vec<UploadTask>>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a file. Returns `None` when the same path is already queued.
    pub async fn add(&self, path: &Path) -> Result<Option<TaskView>> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let mut tasks = self.tasks.lock().await;
        if tasks.iter().any(|t| t.file_path == path) {
            debug!(path = %path.display(), "file already queued");
            return Ok(None);
        }
        let task = UploadTask::new(path, size);
        info!(id = %task.id, path = %path.display(), size, "queued upload");
        let view = task.view();
        tasks.push(task);
        Ok(Some(view))
    }

    pub async fn next_pending(&self) -> Option<String> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .find(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
    }

    /// Pending tasks are dropped, uploading tasks get a cancellation request.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(pos) = tasks.iter().position(|t| t.id == id) else {
            return false;
        };
        match tasks[pos].status {
            TaskStatus::Pending => {
                tasks.remove(pos);
                true
            }
            TaskStatus::Uploading => {
                tasks[pos].cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub async fn clear_completed(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|t| t.status != TaskStatus::Completed);
        before - tasks.len()
    }

    /// Drop completed tasks whose file is gone and that finished more than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|t| {
            let expired = t
                .end_time
                .map(|end| now.signed_duration_since(end) > max_age)
                .unwrap_or(true);
            !(t.status == TaskStatus::Completed && t.delete_success && expired)
        });
        before - tasks.len()
    }

    pub async fn requeue_limit_blocked(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut count = 0;
        for task in tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Error && t.limit_blocked)
        {
            task.reset_pending();
            count += 1;
        }
        count
    }

    pub async fn snapshot(&self) -> Vec<TaskView> {
        self.tasks.lock().await.iter().map(UploadTask::view).collect()
    }

    pub async fn get(&self, id: &str) -> Option<UploadTask> {
        self.tasks.lock().await.iter().find(|t| t.id == id).cloned()
    }

    /// Run `f` against the task with `id` while holding the lock.
    pub async fn with_task<R>(&self, id: &str, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().await;
        tasks.iter_mut().find(|t| t.id == id).map(f)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn video(dir: &Path, name: &str) -> std::path::PathBuf {
        let p = dir.join(name);
        tokio::fs::write(&p, b"0123456789").await.unwrap();
        p
    }

    #[tokio::test]
    async fn add_dedupes_by_path() {
        let td = tempdir().unwrap();
        let p = video(td.path(), "a.mp4").await;
        let q = UploadQueue::new();
        let first = q.add(&p).await.unwrap().unwrap();
        assert_eq!(first.file_size, 10);
        assert!(q.add(&p).await.unwrap().is_none());
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn add_missing_file_errors() {
        let td = tempdir().unwrap();
        let q = UploadQueue::new();
        assert!(q.add(&td.path().join("ghost.mp4")).await.is_err());
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn cancel_rules() {
        let td = tempdir().unwrap();
        let q = UploadQueue::new();
        let a = q.add(&video(td.path(), "a.mp4").await).await.unwrap().unwrap();
        let b = q.add(&video(td.path(), "b.mp4").await).await.unwrap().unwrap();
        let c = q.add(&video(td.path(), "c.mp4").await).await.unwrap().unwrap();

        q.with_task(&b.id, |t| t.mark_uploading()).await;
        q.with_task(&c.id, |t| t.mark_completed("vid")).await;

        assert!(q.cancel(&a.id).await);
        assert!(q.get(&a.id).await.is_none());

        assert!(q.cancel(&b.id).await);
        assert!(q.get(&b.id).await.unwrap().cancel_requested);

        assert!(!q.cancel(&c.id).await);
        assert!(!q.cancel("missing").await);
    }

    #[tokio::test]
    async fn next_pending_in_order() {
        let td = tempdir().unwrap();
        let q = UploadQueue::new();
        let a = q.add(&video(td.path(), "a.mp4").await).await.unwrap().unwrap();
        let b = q.add(&video(td.path(), "b.mp4").await).await.unwrap().unwrap();
        assert_eq!(q.next_pending().await.as_deref(), Some(a.id.as_str()));
        q.with_task(&a.id, |t| t.mark_uploading()).await;
        assert_eq!(q.next_pending().await.as_deref(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn clear_and_cleanup() {
        let td = tempdir().unwrap();
        let q = UploadQueue::new();
        let a = q.add(&video(td.path(), "a.mp4").await).await.unwrap().unwrap();
        let b = q.add(&video(td.path(), "b.mp4").await).await.unwrap().unwrap();
        q.add(&video(td.path(), "c.mp4").await).await.unwrap().unwrap();

        q.with_task(&a.id, |t| {
            t.mark_completed("x");
            t.delete_success = true;
            t.end_time = Some(Utc::now() - chrono::Duration::hours(2));
        })
        .await;
        q.with_task(&b.id, |t| {
            t.mark_completed("y");
            t.delete_success = true;
        })
        .await;

        assert_eq!(q.cleanup(Duration::from_secs(3600)).await, 1);
        assert_eq!(q.len().await, 2);
        assert_eq!(q.clear_completed().await, 1);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn requeue_only_limit_blocked() {
        let td = tempdir().unwrap();
        let q = UploadQueue::new();
        let a = q.add(&video(td.path(), "a.mp4").await).await.unwrap().unwrap();
        let b = q.add(&video(td.path(), "b.mp4").await).await.unwrap().unwrap();
        q.with_task(&a.id, |t| {
            t.mark_error("Upload limit exceeded. Will retry in 24 hours.");
            t.limit_blocked = true;
        })
        .await;
        q.with_task(&b.id, |t| t.mark_error("Upload failed: bad request")).await;

        assert_eq!(q.requeue_limit_blocked().await, 1);
        assert_eq!(q.get(&a.id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(q.get(&b.id).await.unwrap().status, TaskStatus::Error);
    }
}
