//! Typed client for the control API.
//!
//! Calls are independent: there is no retry, cancellation or ordering between
//! them, so when two requests overlap the last response to arrive wins.
use crate::model::{Channel, ProjectInfo, TaskStatus, TaskView, Theme, UploadRecord};
use crate::settings::{Settings, SettingsPatch};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced a readable response.
    #[error("{0}")]
    Transport(String),
    /// The server answered with `success: false`.
    #[error("{0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Transport(format!("unexpected response: {}", err))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queue: Vec<TaskView>,
    pub is_monitoring: bool,
    pub upload_limit_reached: bool,
    pub upload_limit_reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub is_authenticated: bool,
    pub is_monitoring: bool,
    pub upload_limit_reached: bool,
    pub upload_limit_reset_time: Option<DateTime<Utc>>,
    pub watch_folder: String,
    pub theme: Theme,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderListing {
    pub current_path: String,
    pub parent: Option<String>,
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelList {
    pub channels: Vec<Channel>,
    pub selected_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateStatus {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub release_notes: Option<String>,
    pub auto_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectSelection {
    Selected,
    /// The project has no token yet; the user must visit `auth_url`.
    NeedsAuth { auth_url: String },
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("uploader-ctl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Browser URL that starts the OAuth flow for `project_id`.
    pub fn auth_url(&self, project_id: &str) -> String {
        self.url(&format!("/auth/{}", project_id))
    }

    async fn call(&self, req: RequestBuilder) -> ClientResult<Value> {
        let body: Value = req.send().await?.json().await?;
        check(body)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let body = self.call(self.http.get(self.url(path))).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, payload: Value) -> ClientResult<T> {
        let body = self
            .call(self.http.post(self.url(path)).json(&payload))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn queue(&self) -> ClientResult<QueueSnapshot> {
        self.get("/api/queue").await
    }

    pub async fn start_monitoring(&self) -> ClientResult<()> {
        self.post::<Value>("/api/monitor/start", json!({})).await?;
        Ok(())
    }

    pub async fn stop_monitoring(&self) -> ClientResult<()> {
        self.post::<Value>("/api/monitor/stop", json!({})).await?;
        Ok(())
    }

    /// Queue the video files already in the watch folder.
    pub async fn scan_folder(&self) -> ClientResult<usize> {
        let body: Value = self.post("/api/monitor/scan", json!({})).await?;
        Ok(body["added"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn cancel_task(&self, task_id: &str) -> ClientResult<()> {
        self.post::<Value>(&format!("/api/task/{}/cancel", task_id), json!({}))
            .await?;
        Ok(())
    }

    pub async fn clear_completed(&self) -> ClientResult<usize> {
        let body: Value = self.post("/api/queue/clear-completed", json!({})).await?;
        Ok(body["removed"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn settings(&self) -> ClientResult<Settings> {
        let body: Value = self.get("/api/settings").await?;
        Ok(serde_json::from_value(body["config"].clone())?)
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> ClientResult<Settings> {
        let body: Value = self
            .post("/api/settings", serde_json::to_value(patch)?)
            .await?;
        Ok(serde_json::from_value(body["config"].clone())?)
    }

    pub async fn set_theme(&self, theme: &str) -> ClientResult<Theme> {
        let body: Value = self.post("/api/theme", json!({ "theme": theme })).await?;
        Ok(serde_json::from_value(body["theme"].clone())?)
    }

    pub async fn status(&self) -> ClientResult<StatusReport> {
        self.get("/api/status").await
    }

    pub async fn browse(&self, path: Option<&str>) -> ClientResult<FolderListing> {
        let mut req = self.http.get(self.url("/api/folder/browse"));
        if let Some(path) = path {
            req = req.query(&[("path", path)]);
        }
        Ok(serde_json::from_value(self.call(req).await?)?)
    }

    pub async fn channels(&self) -> ClientResult<ChannelList> {
        self.get("/api/channels").await
    }

    pub async fn select_channel(&self, channel_id: &str) -> ClientResult<()> {
        self.post::<Value>("/api/channels/select", json!({ "channel_id": channel_id }))
            .await?;
        Ok(())
    }

    pub async fn projects(&self) -> ClientResult<Vec<ProjectInfo>> {
        let body: Value = self.get("/api/projects").await?;
        Ok(serde_json::from_value(body["projects"].clone())?)
    }

    pub async fn select_project(&self, project_id: &str) -> ClientResult<ProjectSelection> {
        let req = self
            .http
            .post(self.url("/api/projects/select"))
            .json(&json!({ "project_id": project_id }));
        let body: Value = req.send().await?.json().await?;
        if body["needs_auth"].as_bool() == Some(true) {
            return Ok(ProjectSelection::NeedsAuth {
                auth_url: self.auth_url(project_id),
            });
        }
        check(body)?;
        Ok(ProjectSelection::Selected)
    }

    /// Upload a client secret file. Returns the new project id.
    pub async fn add_project(&self, secret_file: &Path) -> ClientResult<String> {
        let content = tokio::fs::read(secret_file)
            .await
            .map_err(|e| ClientError::Transport(format!("{}: {}", secret_file.display(), e)))?;
        let filename = secret_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_project_bytes(&filename, content).await
    }

    pub async fn add_project_bytes(&self, filename: &str, content: Vec<u8>) -> ClientResult<String> {
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let body = self
            .call(self.http.post(self.url("/api/projects/add")).multipart(form))
            .await?;
        Ok(body["project_id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn history(&self) -> ClientResult<Vec<UploadRecord>> {
        let body: Value = self.get("/api/history").await?;
        Ok(serde_json::from_value(body["uploads"].clone())?)
    }

    pub async fn check_updates(&self) -> ClientResult<UpdateStatus> {
        self.get("/api/updates/check").await
    }

    /// Install the latest release. Returns the installed version.
    pub async fn apply_update(&self) -> ClientResult<String> {
        let body: Value = self.post("/api/updates/apply", json!({})).await?;
        Ok(body["version"].as_str().unwrap_or_default().to_string())
    }

    pub async fn set_auto_update(&self, enabled: bool) -> ClientResult<bool> {
        let body: Value = self
            .post("/api/updates/settings", json!({ "auto_update": enabled }))
            .await?;
        Ok(body["auto_update"].as_bool().unwrap_or(enabled))
    }

    pub async fn restart(&self) -> ClientResult<()> {
        self.post::<Value>("/api/updates/restart", json!({})).await?;
        Ok(())
    }
}

fn check(body: Value) -> ClientResult<Value> {
    if body.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(body);
    }
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("Unknown error");
    Err(ClientError::Rejected(message.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    QueueChanged,
    MonitoringChanged(bool),
    LimitChanged {
        reached: bool,
        reset_at: Option<DateTime<Utc>>,
    },
}

/// Client-side mirror of the server queue. Each snapshot replaces the
/// previous one wholesale.
#[derive(Debug, Default)]
pub struct QueueWatcher {
    last: Option<QueueSnapshot>,
}

impl QueueWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&QueueSnapshot> {
        self.last.as_ref()
    }

    pub fn apply(&mut self, snap: QueueSnapshot) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        let prev = self.last.as_ref();
        if prev.map(|p| p.queue != snap.queue).unwrap_or(true) {
            events.push(QueueEvent::QueueChanged);
        }
        if prev.map(|p| p.is_monitoring != snap.is_monitoring).unwrap_or(true) {
            events.push(QueueEvent::MonitoringChanged(snap.is_monitoring));
        }
        let limit_moved = prev
            .map(|p| {
                p.upload_limit_reached != snap.upload_limit_reached
                    || p.upload_limit_reset_time != snap.upload_limit_reset_time
            })
            .unwrap_or(true);
        if limit_moved {
            events.push(QueueEvent::LimitChanged {
                reached: snap.upload_limit_reached,
                reset_at: snap.upload_limit_reset_time,
            });
        }
        self.last = Some(snap);
        events
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub completed: usize,
    pub pending: usize,
    pub uploading: usize,
    pub failed: usize,
}

pub fn queue_stats(tasks: &[TaskView]) -> QueueStats {
    tasks.iter().fold(QueueStats::default(), |mut stats, task| {
        match task.status {
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Pending => stats.pending += 1,
            TaskStatus::Uploading => stats.uploading += 1,
            TaskStatus::Error | TaskStatus::Cancelled => stats.failed += 1,
        }
        stats
    })
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut exp = 0;
    let mut scaled = bytes;
    while scaled >= 1024 && exp < UNITS.len() - 1 {
        scaled /= 1024;
        exp += 1;
    }
    let value = bytes as f64 / 1024f64.powi(exp as i32);
    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[exp])
}

pub fn limit_countdown(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = (reset_at - now).num_seconds();
    if remaining <= 0 {
        return "Limit should be reset soon.".to_string();
    }
    let (h, m, s) = (remaining / 3600, (remaining % 3600) / 60, remaining % 60);
    format!("Reset in: {:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(id: &str, status: TaskStatus) -> TaskView {
        TaskView {
            id: id.into(),
            filename: format!("{}.mp4", id),
            file_size: 10,
            status,
            progress: 0,
            video_url: None,
            error: None,
            start_time: None,
            end_time: None,
            delete_success: false,
        }
    }

    fn snapshot(queue: Vec<TaskView>, monitoring: bool) -> QueueSnapshot {
        QueueSnapshot {
            queue,
            is_monitoring: monitoring,
            upload_limit_reached: false,
            upload_limit_reset_time: None,
        }
    }

    #[test]
    fn file_sizes() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(500), "500 Bytes");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1_048_576), "1 MB");
        assert_eq!(format_file_size(1_288_490_189), "1.2 GB");
    }

    #[test]
    fn countdown() {
        let now = Utc::now();
        assert_eq!(
            limit_countdown(now + Duration::seconds(3 * 3600 + 25 * 60 + 7), now),
            "Reset in: 03:25:07"
        );
        assert_eq!(limit_countdown(now, now), "Limit should be reset soon.");
        assert_eq!(
            limit_countdown(now - Duration::seconds(5), now),
            "Limit should be reset soon."
        );
    }

    #[test]
    fn stats_count_cancelled_as_failed() {
        let tasks = vec![
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::Pending),
            task("c", TaskStatus::Pending),
            task("d", TaskStatus::Uploading),
            task("e", TaskStatus::Error),
            task("f", TaskStatus::Cancelled),
        ];
        assert_eq!(
            queue_stats(&tasks),
            QueueStats {
                completed: 1,
                pending: 2,
                uploading: 1,
                failed: 2
            }
        );
    }

    #[test]
    fn watcher_reports_only_changes() {
        let mut watcher = QueueWatcher::new();
        let first = watcher.apply(snapshot(vec![task("a", TaskStatus::Pending)], false));
        assert_eq!(first.len(), 3);

        let same = watcher.apply(snapshot(vec![task("a", TaskStatus::Pending)], false));
        assert!(same.is_empty());

        let mut progressed = task("a", TaskStatus::Uploading);
        progressed.progress = 40;
        let events = watcher.apply(snapshot(vec![progressed], true));
        assert_eq!(
            events,
            vec![QueueEvent::QueueChanged, QueueEvent::MonitoringChanged(true)]
        );

        let mut limited = snapshot(vec![], true);
        limited.upload_limit_reached = true;
        let events = watcher.apply(limited);
        assert!(events.contains(&QueueEvent::QueueChanged));
        assert!(matches!(
            events.last(),
            Some(QueueEvent::LimitChanged { reached: true, .. })
        ));
        assert!(watcher.snapshot().unwrap().queue.is_empty());
    }

    #[test]
    fn rejected_message_defaults() {
        let err = check(json!({ "success": false })).unwrap_err();
        assert_eq!(err.to_string(), "Unknown error");
        let err = check(json!({ "success": false, "error": "No folder selected" })).unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref m) if m == "No folder selected"));
        assert!(check(json!({ "success": true, "queue": [] })).is_ok());
    }
}
