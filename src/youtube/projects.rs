//! API projects (client-secret files) and their OAuth tokens.
use crate::model::ProjectInfo;
use crate::settings::SettingsStore;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &str =
    "https://www.googleapis.com/auth/youtube.upload https://www.googleapis.com/auth/youtube.readonly";
/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("project not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("no authenticated project")]
    NoActiveProject,
    #[error("{0}")]
    InvalidUpload(&'static str),
    #[error("invalid client secret: {0}")]
    InvalidSecret(String),
    #[error("OAuth error: {0}")]
    OAuth(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecretFile {
    fn into_secret(self) -> Option<ClientSecret> {
        self.installed.or(self.web)
    }
}

pub fn parse_client_secret(raw: &[u8]) -> Result<ClientSecret, ProjectError> {
    let file: ClientSecretFile =
        serde_json::from_slice(raw).map_err(|e| ProjectError::InvalidSecret(e.to_string()))?;
    let secret = file.into_secret().ok_or_else(|| {
        ProjectError::InvalidSecret("expected an `installed` or `web` section".into())
    })?;
    if secret.client_id.trim().is_empty() {
        return Err(ProjectError::InvalidSecret("client_id is empty".into()));
    }
    Ok(secret)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl StoredToken {
    fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Registry of API projects found in the credentials directory.
pub struct ProjectRegistry {
    credentials_dir: PathBuf,
    tokens_dir: PathBuf,
    settings: SettingsStore,
    http: Client,
    /// Projects that hit the upload limit in the current window.
    limited: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ProjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectRegistry")
            .field("credentials_dir", &self.credentials_dir)
            .field("tokens_dir", &self.tokens_dir)
            .finish_non_exhaustive()
    }
}

impl ProjectRegistry {
    pub fn new(credentials_dir: PathBuf, tokens_dir: PathBuf, settings: SettingsStore) -> Self {
        let http = Client::builder()
            .user_agent(concat!("auto-uploader/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            credentials_dir,
            tokens_dir,
            settings,
            http,
            limited: Mutex::new(HashSet::new()),
        }
    }

    fn secret_path(&self, id: &str) -> PathBuf {
        self.credentials_dir.join(format!("client_secret_{}.json", id))
    }

    fn token_path(&self, id: &str) -> PathBuf {
        self.tokens_dir.join(format!("token_{}.json", id))
    }

    /// Project ids in name order.
    pub async fn project_ids(&self) -> Result<Vec<String>, ProjectError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.credentials_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix("client_secret_")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn is_authenticated(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.token_path(id)).await.unwrap_or(false)
    }

    pub async fn load_secret(&self, id: &str) -> Result<ClientSecret, ProjectError> {
        let path = self.secret_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProjectError::NotFound(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        parse_client_secret(&raw)
    }

    /// The project uploads go through: the selected one if it is
    /// authenticated, otherwise the first authenticated project.
    pub async fn active_id(&self) -> Option<String> {
        if let Some(selected) = self.settings.snapshot().await.active_project_id {
            if self.is_authenticated(&selected).await {
                return Some(selected);
            }
        }
        let ids = self.project_ids().await.ok()?;
        for id in ids {
            if self.is_authenticated(&id).await {
                return Some(id);
            }
        }
        None
    }

    pub async fn list(&self) -> Result<Vec<ProjectInfo>, ProjectError> {
        let active = self.active_id().await;
        let mut out = Vec::new();
        for id in self.project_ids().await? {
            let name = match self.load_secret(&id).await {
                Ok(secret) => secret.project_id.unwrap_or_else(|| id.clone()),
                Err(err) => {
                    debug!(?err, id = %id, "unreadable client secret");
                    id.clone()
                }
            };
            out.push(ProjectInfo {
                is_authenticated: self.is_authenticated(&id).await,
                is_active: active.as_deref() == Some(id.as_str()),
                name,
                id,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn select(&self, id: &str) -> Result<(), ProjectError> {
        if !tokio::fs::try_exists(self.secret_path(id)).await.unwrap_or(false) {
            return Err(ProjectError::NotFound(id.to_string()));
        }
        if !self.is_authenticated(id).await {
            return Err(ProjectError::NotAuthenticated(id.to_string()));
        }
        self.settings
            .set_active_project(Some(id))
            .await
            .map_err(|e| ProjectError::OAuth(e.to_string()))?;
        info!(project = id, "active project selected");
        Ok(())
    }

    /// Store an uploaded client-secret file under a fresh project id.
    #[instrument(skip(self, content))]
    pub async fn add(&self, filename: &str, content: &[u8]) -> Result<String, ProjectError> {
        if filename.trim().is_empty() {
            return Err(ProjectError::InvalidUpload("No file selected"));
        }
        if !filename.to_ascii_lowercase().ends_with(".json") {
            return Err(ProjectError::InvalidUpload("File must be a JSON file"));
        }
        parse_client_secret(content)?;

        tokio::fs::create_dir_all(&self.credentials_dir).await?;
        let base = format!("project_{}", Utc::now().timestamp());
        let mut id = base.clone();
        let mut n = 1;
        while tokio::fs::try_exists(self.secret_path(&id)).await.unwrap_or(false) {
            n += 1;
            id = format!("{}_{}", base, n);
        }
        tokio::fs::write(self.secret_path(&id), content).await?;
        info!(project = %id, "client secret added");
        Ok(id)
    }

    /// Mark the active project as limited and activate another authenticated one.
    pub async fn rotate_after_limit(&self) -> Result<Option<String>, ProjectError> {
        let current = self.active_id().await;
        let mut limited = self.limited.lock().await;
        if let Some(cur) = &current {
            limited.insert(cur.clone());
        }
        for id in self.project_ids().await? {
            if limited.contains(&id) || current.as_deref() == Some(id.as_str()) {
                continue;
            }
            if self.is_authenticated(&id).await {
                self.settings
                    .set_active_project(Some(&id))
                    .await
                    .map_err(|e| ProjectError::OAuth(e.to_string()))?;
                warn!(from = ?current, to = %id, "switched project after upload limit");
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub async fn clear_limited(&self) {
        self.limited.lock().await.clear();
    }

    /// Consent URL for `id`; the project id travels in `state`.
    pub async fn authorization_url(&self, id: &str, redirect_uri: &str) -> Result<String, ProjectError> {
        let secret = self.load_secret(id).await?;
        let url = Url::parse_with_params(
            &secret.auth_uri,
            &[
                ("client_id", secret.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", id),
            ],
        )
        .map_err(|e| ProjectError::InvalidSecret(e.to_string()))?;
        Ok(url.to_string())
    }

    #[instrument(skip(self, code))]
    pub async fn exchange_code(
        &self,
        id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<StoredToken, ProjectError> {
        let secret = self.load_secret(id).await?;
        let resp = self
            .request_token(
                &secret,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", secret.client_id.as_str()),
                    ("client_secret", secret.client_secret.as_str()),
                ],
            )
            .await?;
        let token = StoredToken {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        };
        self.save_token(id, &token).await?;
        info!(project = id, "project authenticated");
        Ok(token)
    }

    /// Valid access token for the active project, refreshed when close to expiry.
    pub async fn access_token(&self) -> Result<String, ProjectError> {
        let id = self.active_id().await.ok_or(ProjectError::NoActiveProject)?;
        let token = self.load_token(&id).await?;
        if token.is_fresh() {
            return Ok(token.access_token);
        }
        let refreshed = self.refresh(&id, token).await?;
        Ok(refreshed.access_token)
    }

    async fn refresh(&self, id: &str, token: StoredToken) -> Result<StoredToken, ProjectError> {
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or_else(|| ProjectError::NotAuthenticated(id.to_string()))?;
        let secret = self.load_secret(id).await?;
        let resp = self
            .request_token(
                &secret,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", secret.client_id.as_str()),
                    ("client_secret", secret.client_secret.as_str()),
                ],
            )
            .await?;
        let token = StoredToken {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token.or(Some(refresh_token)),
            expires_at: Utc::now() + Duration::seconds(resp.expires_in),
        };
        self.save_token(id, &token).await?;
        debug!(project = id, "access token refreshed");
        Ok(token)
    }

    async fn request_token(
        &self,
        secret: &ClientSecret,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, ProjectError> {
        let res = self.http.post(&secret.token_uri).form(form).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProjectError::OAuth(format!("{}: {}", status, body)));
        }
        Ok(res.json().await?)
    }

    pub async fn load_token(&self, id: &str) -> Result<StoredToken, ProjectError> {
        let raw = match tokio::fs::read(self.token_path(id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProjectError::NotAuthenticated(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn save_token(&self, id: &str, token: &StoredToken) -> Result<(), ProjectError> {
        tokio::fs::create_dir_all(&self.tokens_dir).await?;
        write_json(&self.token_path(id), token).await
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProjectError> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const SECRET: &str = r#"{"installed":{"client_id":"cid","client_secret":"cs","project_id":"my-proj"}}"#;

    async fn registry() -> (TempDir, ProjectRegistry) {
        let td = tempdir().unwrap();
        let settings = SettingsStore::open(td.path()).await.unwrap();
        let reg = ProjectRegistry::new(td.path().join("creds"), td.path().join("tokens"), settings);
        (td, reg)
    }

    fn token() -> StoredToken {
        StoredToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn parse_secret_formats() {
        let s = parse_client_secret(SECRET.as_bytes()).unwrap();
        assert_eq!(s.client_id, "cid");
        assert_eq!(s.token_uri, DEFAULT_TOKEN_URI);

        let web = parse_client_secret(br#"{"web":{"client_id":"w","client_secret":"x"}}"#).unwrap();
        assert_eq!(web.client_id, "w");

        assert!(parse_client_secret(br#"{"other":{}}"#).is_err());
        assert!(parse_client_secret(b"not json").is_err());
    }

    #[tokio::test]
    async fn add_validates_upload() {
        let (_td, reg) = registry().await;
        assert!(matches!(
            reg.add("", SECRET.as_bytes()).await,
            Err(ProjectError::InvalidUpload("No file selected"))
        ));
        assert!(matches!(
            reg.add("secret.txt", SECRET.as_bytes()).await,
            Err(ProjectError::InvalidUpload("File must be a JSON file"))
        ));
        assert!(matches!(
            reg.add("secret.json", b"{}").await,
            Err(ProjectError::InvalidSecret(_))
        ));

        let a = reg.add("secret.json", SECRET.as_bytes()).await.unwrap();
        let b = reg.add("secret.json", SECRET.as_bytes()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("project_"));
        assert_eq!(reg.project_ids().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn select_requires_token() {
        let (_td, reg) = registry().await;
        let id = reg.add("s.json", SECRET.as_bytes()).await.unwrap();
        assert!(matches!(reg.select(&id).await, Err(ProjectError::NotAuthenticated(_))));
        assert!(matches!(reg.select("ghost").await, Err(ProjectError::NotFound(_))));

        reg.save_token(&id, &token()).await.unwrap();
        reg.select(&id).await.unwrap();
        let list = reg.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_active);
        assert!(list[0].is_authenticated);
        assert_eq!(list[0].name, "my-proj");
        assert_eq!(reg.access_token().await.unwrap(), "at");
    }

    #[tokio::test]
    async fn rotation_skips_limited_and_unauthenticated() {
        let (td, reg) = registry().await;
        tokio::fs::create_dir_all(td.path().join("creds")).await.unwrap();
        for id in ["a", "b", "c"] {
            tokio::fs::write(reg.secret_path(id), SECRET).await.unwrap();
        }
        reg.save_token("a", &token()).await.unwrap();
        reg.save_token("c", &token()).await.unwrap();
        reg.select("a").await.unwrap();

        assert_eq!(reg.rotate_after_limit().await.unwrap().as_deref(), Some("c"));
        assert_eq!(reg.active_id().await.as_deref(), Some("c"));
        assert_eq!(reg.rotate_after_limit().await.unwrap(), None);

        reg.clear_limited().await;
        assert_eq!(reg.rotate_after_limit().await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn authorization_url_carries_state() {
        let (_td, reg) = registry().await;
        let id = reg.add("s.json", SECRET.as_bytes()).await.unwrap();
        let url = reg
            .authorization_url(&id, "http://127.0.0.1:5000/oauth2callback")
            .await
            .unwrap();
        assert!(url.starts_with(DEFAULT_AUTH_URI));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains(&format!("state={}", id)));
    }

    #[tokio::test]
    async fn no_project_means_no_token() {
        let (_td, reg) = registry().await;
        assert!(reg.active_id().await.is_none());
        assert!(matches!(reg.access_token().await, Err(ProjectError::NoActiveProject)));
    }
}
