//! HTTP control surface of the upload service.
use crate::config::expand_home;
use crate::db::{self, Pool};
use crate::model::Theme;
use crate::monitor::FolderMonitor;
use crate::queue::UploadQueue;
use crate::quota::QuotaTracker;
use crate::settings::{SettingsPatch, SettingsStore};
use crate::updater::{self, Updater};
use crate::youtube::{ProjectError, ProjectRegistry, VideoPlatform};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const HISTORY_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub settings: SettingsStore,
    pub queue: UploadQueue,
    pub monitor: Arc<FolderMonitor>,
    pub platform: Arc<dyn VideoPlatform>,
    pub projects: Arc<ProjectRegistry>,
    pub quota: QuotaTracker,
    pub updater: Arc<Updater>,
    pub pool: Pool,
    /// OAuth redirect target, normally `http://<bind>/oauth2callback`.
    pub redirect_uri: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/queue", get(get_queue))
        .route("/api/queue/clear-completed", post(clear_completed))
        .route("/api/task/{id}/cancel", post(cancel_task))
        .route("/api/monitor/start", post(start_monitoring))
        .route("/api/monitor/stop", post(stop_monitoring))
        .route("/api/monitor/scan", post(scan_folder))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/theme", post(set_theme))
        .route("/api/status", get(status))
        .route("/api/folder/browse", get(browse_folders))
        .route("/api/channels", get(list_channels))
        .route("/api/channels/select", post(select_channel))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/select", post(select_project))
        .route("/api/projects/add", post(add_project))
        .route("/api/history", get(history))
        .route("/api/updates/check", get(check_updates))
        .route("/api/updates/apply", post(apply_update))
        .route("/api/updates/settings", post(update_settings_auto))
        .route("/api/updates/restart", post(restart))
        .route("/auth/{project}", get(start_auth))
        .route("/oauth2callback", get(oauth_callback))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr().ok(), "serving control API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// A server running on a background task.
pub struct ApiServer {
    pub address: String,
    shutdown: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl ApiServer {
    pub async fn start(listener: TcpListener, state: AppState) -> std::io::Result<Self> {
        let address = format!("http://{}", listener.local_addr()?);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let stopped = async {
                let _ = shutdown_rx.await;
            };
            if let Err(err) = serve(listener, state, stopped).await {
                error!(?err, "control API stopped");
            }
        });
        Ok(Self {
            address,
            shutdown: Some(shutdown_tx),
            join,
        })
    }

    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.join.await;
    }
}

fn ok(mut body: Value) -> Response {
    if let Value::Object(map) = &mut body {
        map.insert("success".into(), Value::Bool(true));
    }
    Json(body).into_response()
}

fn fail(message: impl Display) -> Response {
    Json(json!({ "success": false, "error": message.to_string() })).into_response()
}

const NOT_AUTHENTICATED: &str = "Not authenticated with YouTube";

async fn get_queue(State(state): State<AppState>) -> Response {
    let limit = state.quota.status().await;
    ok(json!({
        "queue": state.queue.snapshot().await,
        "is_monitoring": state.monitor.is_monitoring().await,
        "upload_limit_reached": limit.reached,
        "upload_limit_reset_time": limit.reset_at,
    }))
}

async fn clear_completed(State(state): State<AppState>) -> Response {
    let removed = state.queue.clear_completed().await;
    ok(json!({ "removed": removed }))
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.queue.cancel(&id).await {
        ok(json!({}))
    } else {
        fail("Task not found or cannot be cancelled")
    }
}

async fn start_monitoring(State(state): State<AppState>) -> Response {
    if !state.platform.is_authenticated().await {
        return fail(NOT_AUTHENTICATED);
    }
    let settings = state.settings.snapshot().await;
    let Some(folder) = settings.watch_path() else {
        return fail("No folder selected");
    };
    let folder = expand_home(&folder.to_string_lossy());
    // An active watch is replaced so a changed folder takes effect.
    state.monitor.stop().await;
    match state.monitor.start(&folder, settings.check_existing_files).await {
        Ok(()) => ok(json!({})),
        Err(err) => {
            warn!(?err, folder = %folder.display(), "failed to start monitoring");
            fail(format!(
                "Failed to start monitoring for folder: {}",
                settings.watch_folder
            ))
        }
    }
}

async fn stop_monitoring(State(state): State<AppState>) -> Response {
    state.monitor.stop().await;
    ok(json!({}))
}

async fn scan_folder(State(state): State<AppState>) -> Response {
    let Some(folder) = state.settings.snapshot().await.watch_path() else {
        return fail("No folder selected");
    };
    match state.monitor.scan(&folder).await {
        Ok(added) => ok(json!({ "added": added })),
        Err(err) => fail(err),
    }
}

async fn get_settings(State(state): State<AppState>) -> Response {
    ok(json!({ "config": state.settings.snapshot().await }))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Response {
    match state.settings.update(patch).await {
        Ok(config) => ok(json!({ "config": config })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ThemeBody {
    #[serde(default)]
    theme: String,
}

async fn set_theme(State(state): State<AppState>, Json(body): Json<ThemeBody>) -> Response {
    let Some(theme) = Theme::parse(&body.theme) else {
        return fail("Invalid theme");
    };
    match state.settings.set_theme(theme).await {
        Ok(()) => ok(json!({ "theme": theme })),
        Err(err) => fail(err),
    }
}

async fn status(State(state): State<AppState>) -> Response {
    let settings = state.settings.snapshot().await;
    let limit = state.quota.status().await;
    ok(json!({
        "is_authenticated": state.platform.is_authenticated().await,
        "is_monitoring": state.monitor.is_monitoring().await,
        "upload_limit_reached": limit.reached,
        "upload_limit_reset_time": limit.reset_at,
        "watch_folder": settings.watch_folder,
        "theme": settings.theme,
    }))
}

#[derive(Debug, Deserialize)]
struct BrowseQuery {
    path: Option<String>,
}

async fn browse_folders(Query(query): Query<BrowseQuery>) -> Response {
    let home = expand_home("~");
    let mut current = query
        .path
        .filter(|p| !p.trim().is_empty())
        .map(|p| expand_home(&p))
        .unwrap_or_else(|| home.clone());
    if !tokio::fs::try_exists(&current).await.unwrap_or(false) {
        current = home;
    }
    match list_directories(&current).await {
        Ok(directories) => ok(json!({
            "current_path": current.to_string_lossy(),
            "parent": current.parent().map(|p| p.to_string_lossy().into_owned()),
            "directories": directories,
        })),
        Err(err) => fail(err),
    }
}

async fn list_directories(dir: &std::path::Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            dirs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn list_channels(State(state): State<AppState>) -> Response {
    if !state.platform.is_authenticated().await {
        return fail(NOT_AUTHENTICATED);
    }
    match state.platform.list_channels().await {
        Ok(channels) => ok(json!({
            "channels": channels,
            "selected_channel": state.settings.snapshot().await.selected_channel_id,
        })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    channel_id: Option<String>,
}

async fn select_channel(State(state): State<AppState>, Json(body): Json<ChannelBody>) -> Response {
    if !state.platform.is_authenticated().await {
        return fail(NOT_AUTHENTICATED);
    }
    let Some(channel_id) = body.channel_id.filter(|c| !c.trim().is_empty()) else {
        return fail("No channel ID provided");
    };
    match state.settings.select_channel(&channel_id).await {
        Ok(()) => ok(json!({ "channel_id": channel_id })),
        Err(err) => fail(err),
    }
}

async fn list_projects(State(state): State<AppState>) -> Response {
    match state.projects.list().await {
        Ok(projects) => ok(json!({ "projects": projects })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct ProjectBody {
    project_id: Option<String>,
}

async fn select_project(State(state): State<AppState>, Json(body): Json<ProjectBody>) -> Response {
    let Some(project_id) = body.project_id.filter(|p| !p.trim().is_empty()) else {
        return fail("No project ID provided");
    };
    match state.projects.select(&project_id).await {
        Ok(()) => ok(json!({ "project_id": project_id })),
        Err(ProjectError::NotAuthenticated(_)) => Json(json!({
            "success": false,
            "error": "Project not authenticated",
            "needs_auth": true,
            "project_id": project_id,
        }))
        .into_response(),
        Err(err) => fail(err),
    }
}

async fn add_project(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return fail("No file uploaded"),
            Err(err) => return fail(err),
        };
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return fail(err),
        };
        return match state.projects.add(&filename, &content).await {
            Ok(project_id) => ok(json!({ "project_id": project_id })),
            Err(err) => fail(err),
        };
    }
}

async fn history(State(state): State<AppState>) -> Response {
    match db::recent_uploads(&state.pool, HISTORY_LIMIT).await {
        Ok(uploads) => ok(json!({ "uploads": uploads })),
        Err(err) => fail(err),
    }
}

async fn check_updates(State(state): State<AppState>) -> Response {
    match state.updater.check().await {
        Ok(check) => ok(json!({
            "update_available": check.update_available,
            "current_version": check.current_version,
            "latest_version": check.latest_version,
            "release_notes": check.release_notes,
            "auto_update": check.auto_update,
        })),
        Err(err) => {
            warn!(?err, "update check failed");
            fail(err)
        }
    }
}

async fn apply_update(State(state): State<AppState>) -> Response {
    match state.updater.apply().await {
        Ok(version) => ok(json!({ "version": version })),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct AutoUpdateBody {
    #[serde(default)]
    auto_update: bool,
}

async fn update_settings_auto(
    State(state): State<AppState>,
    Json(body): Json<AutoUpdateBody>,
) -> Response {
    match state.updater.set_auto_update(body.auto_update).await {
        Ok(()) => ok(json!({ "auto_update": body.auto_update })),
        Err(err) => fail(err),
    }
}

async fn restart() -> Response {
    updater::schedule_restart(Duration::from_secs(1));
    ok(json!({}))
}

async fn start_auth(State(state): State<AppState>, Path(project): Path<String>) -> Response {
    match state
        .projects
        .authorization_url(&project, &state.redirect_uri)
        .await
    {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => fail(err),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(err) = query.error {
        return (StatusCode::BAD_REQUEST, format!("Authorization failed: {}", err)).into_response();
    }
    let (Some(code), Some(project)) = (query.code, query.state) else {
        return (StatusCode::BAD_REQUEST, "Missing code or state").into_response();
    };
    let result = async {
        state
            .projects
            .exchange_code(&project, &code, &state.redirect_uri)
            .await?;
        state.projects.select(&project).await
    }
    .await;
    match result {
        Ok(()) => {
            info!(project = %project, "OAuth flow completed");
            "Authentication complete. You can close this window.".into_response()
        }
        Err(err) => {
            warn!(?err, project = %project, "OAuth callback failed");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

pub fn default_redirect_uri(bind: &str) -> String {
    format!("http://{}/oauth2callback", bind)
}
