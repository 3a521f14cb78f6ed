use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn parse(value: &str) -> Option<Theme> {
        match value {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

/// One video file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    pub file_path: PathBuf,
    pub filename: String,
    pub file_size: u64,
    pub status: TaskStatus,
    pub progress: u8,
    pub video_id: Option<String>,
    pub video_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub delete_attempts: u32,
    pub delete_success: bool,
    /// Failed because the upload limit was hit; goes back to pending once it resets.
    pub limit_blocked: bool,
}

impl UploadTask {
    pub fn new(file_path: &Path, file_size: u64) -> Self {
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.to_path_buf(),
            filename,
            file_size,
            status: TaskStatus::Pending,
            progress: 0,
            video_id: None,
            video_url: None,
            start_time: None,
            end_time: None,
            error: None,
            cancel_requested: false,
            delete_attempts: 0,
            delete_success: false,
            limit_blocked: false,
        }
    }

    /// File name without its extension, used for `{filename}` in titles.
    pub fn stem(&self) -> String {
        self.file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.clone())
    }

    pub fn mark_uploading(&mut self) {
        self.status = TaskStatus::Uploading;
        self.progress = 0;
        self.start_time = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, video_id: &str) {
        self.video_url = Some(format!("https://youtu.be/{}", video_id));
        self.video_id = Some(video_id.to_string());
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.end_time = Some(Utc::now());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Error;
        self.error = Some(message.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
    }

    pub fn reset_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.error = None;
        self.cancel_requested = false;
        self.limit_blocked = false;
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            filename: self.filename.clone(),
            file_size: self.file_size,
            status: self.status,
            progress: self.progress,
            video_url: self.video_url.clone(),
            error: self.error.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            delete_success: self.delete_success,
        }
    }
}

/// Wire representation of a task as served by `GET /api/queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskView {
    pub id: String,
    pub filename: String,
    pub file_size: u64,
    pub status: TaskStatus,
    pub progress: u8,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delete_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub title: String,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub is_authenticated: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRecord {
    pub file_path: String,
    pub video_id: String,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_marks() {
        let mut task = UploadTask::new(Path::new("/videos/clip one.mp4"), 42);
        assert_eq!(task.filename, "clip one.mp4");
        assert_eq!(task.stem(), "clip one");
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_uploading();
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(task.start_time.is_some());

        task.mark_completed("abc123");
        assert_eq!(task.progress, 100);
        assert_eq!(task.video_url.as_deref(), Some("https://youtu.be/abc123"));
        assert!(task.end_time.is_some());
    }

    #[test]
    fn reset_pending_clears_failure() {
        let mut task = UploadTask::new(Path::new("a.mkv"), 1);
        task.mark_uploading();
        task.progress = 40;
        task.mark_error("boom");
        task.limit_blocked = true;
        task.reset_pending();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.error.is_none());
        assert!(!task.limit_blocked);
    }

    #[test]
    fn view_serializes_lowercase_status() {
        let task = UploadTask::new(Path::new("a.mov"), 10);
        let json = serde_json::to_value(task.view()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["file_size"], 10);
        assert!(json["video_url"].is_null());
    }

    #[test]
    fn theme_parse() {
        assert_eq!(Theme::parse("dark"), Some(Theme::Dark));
        assert_eq!(Theme::parse("blue"), None);
    }
}
