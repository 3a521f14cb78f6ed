//! User-tunable settings, persisted as JSON in the data directory.
use crate::config::expand_home;
use crate::model::{Privacy, Theme};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub watch_folder: String,
    pub check_existing_files: bool,
    pub title_template: String,
    pub description: String,
    pub tags: String,
    pub privacy: Privacy,
    pub delete_after_upload: bool,
    pub max_retries: u32,
    /// Hours the upload limit lasts once YouTube reports it.
    pub upload_limit_duration: u32,
    pub delete_retry_count: u32,
    /// Seconds between deletion attempts.
    pub delete_retry_delay: u64,
    pub selected_channel_id: Option<String>,
    pub active_project_id: Option<String>,
    pub theme: Theme,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_folder: String::new(),
            check_existing_files: true,
            title_template: "{filename}".into(),
            description: String::new(),
            tags: String::new(),
            privacy: Privacy::Unlisted,
            delete_after_upload: false,
            max_retries: 3,
            upload_limit_duration: 24,
            delete_retry_count: 5,
            delete_retry_delay: 5,
            selected_channel_id: None,
            active_project_id: None,
            theme: Theme::Light,
        }
    }
}

impl Settings {
    /// Video title for a file stem, falling back to the stem when the template renders blank.
    pub fn render_title(&self, stem: &str) -> String {
        let title = self.title_template.replace("{filename}", stem);
        if title.trim().is_empty() {
            stem.to_string()
        } else {
            title
        }
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn watch_path(&self) -> Option<PathBuf> {
        if self.watch_folder.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.watch_folder))
        }
    }

    fn apply(&mut self, patch: SettingsPatch) {
        if let Some(v) = patch.watch_folder {
            self.watch_folder = v;
        }
        if let Some(v) = patch.check_existing_files {
            self.check_existing_files = v;
        }
        if let Some(v) = patch.title_template {
            self.title_template = v;
        }
        if let Some(v) = patch.description {
            self.description = v;
        }
        if let Some(v) = patch.tags {
            self.tags = v;
        }
        if let Some(v) = patch.privacy {
            self.privacy = v;
        }
        if let Some(v) = patch.delete_after_upload {
            self.delete_after_upload = v;
        }
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.upload_limit_duration {
            self.upload_limit_duration = v;
        }
        if let Some(v) = patch.delete_retry_count {
            self.delete_retry_count = v;
        }
        if let Some(v) = patch.delete_retry_delay {
            self.delete_retry_delay = v;
        }
    }
}

/// Partial update accepted by `POST /api/settings`. Absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_existing_files: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<Privacy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_after_upload: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_limit_duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_retry_delay: Option<u64>,
}

/// Shared handle to the persisted settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    inner: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    /// Open `settings.json` in `data_dir`; a missing file yields defaults.
    #[instrument(skip_all)]
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("settings.json");
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    pub async fn snapshot(&self) -> Settings {
        self.inner.read().await.clone()
    }

    /// Merge `patch` into the stored settings and persist the result.
    #[instrument(skip_all)]
    pub async fn update(&self, mut patch: SettingsPatch) -> Result<Settings> {
        if let Some(folder) = patch.watch_folder.take() {
            patch.watch_folder = Some(normalize_watch_folder(&folder).await);
        }
        let mut guard = self.inner.write().await;
        guard.apply(patch);
        self.persist(&guard).await?;
        Ok(guard.clone())
    }

    pub async fn set_theme(&self, theme: Theme) -> Result<()> {
        self.modify(|s| s.theme = theme).await
    }

    pub async fn select_channel(&self, channel_id: &str) -> Result<()> {
        let id = channel_id.to_string();
        self.modify(move |s| s.selected_channel_id = Some(id)).await
    }

    pub async fn set_active_project(&self, project_id: Option<&str>) -> Result<()> {
        let id = project_id.map(str::to_string);
        self.modify(move |s| s.active_project_id = id).await
    }

    async fn modify(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut guard = self.inner.write().await;
        f(&mut guard);
        self.persist(&guard).await
    }

    async fn persist(&self, settings: &Settings) -> Result<()> {
        let body = serde_json::to_string_pretty(settings)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Expand `~` and create the folder if it does not exist yet. Creation
/// failures are only logged; starting the monitor reports them later.
async fn normalize_watch_folder(folder: &str) -> String {
    let trimmed = folder.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let expanded = expand_home(trimmed);
    if !tokio::fs::try_exists(&expanded).await.unwrap_or(false) {
        debug!(folder = %expanded.display(), "creating watch folder");
        if let Err(err) = tokio::fs::create_dir_all(&expanded).await {
            warn!(?err, folder = %expanded.display(), "failed to create watch folder");
        }
    }
    expanded.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let td = tempdir().unwrap();
        let store = SettingsStore::open(td.path()).await.unwrap();
        let s = store.snapshot().await;
        assert_eq!(s, Settings::default());
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.privacy, Privacy::Unlisted);
    }

    #[tokio::test]
    async fn patch_merges_and_persists() {
        let td = tempdir().unwrap();
        let store = SettingsStore::open(td.path()).await.unwrap();
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"tags":"a, b","privacy":"private","max_retries":7}"#).unwrap();
        let merged = store.update(patch).await.unwrap();
        assert_eq!(merged.privacy, Privacy::Private);
        assert_eq!(merged.max_retries, 7);
        assert_eq!(merged.title_template, "{filename}");

        let reopened = SettingsStore::open(td.path()).await.unwrap();
        assert_eq!(reopened.snapshot().await, merged);
    }

    #[tokio::test]
    async fn watch_folder_is_created() {
        let td = tempdir().unwrap();
        let store = SettingsStore::open(td.path()).await.unwrap();
        let folder = td.path().join("incoming");
        let patch = SettingsPatch {
            watch_folder: Some(folder.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let merged = store.update(patch).await.unwrap();
        assert!(folder.is_dir());
        assert_eq!(merged.watch_path(), Some(folder));
    }

    #[test]
    fn title_and_tags() {
        let s = Settings {
            title_template: "Clip: {filename}".into(),
            tags: " gaming, ,highlights ,".into(),
            ..Default::default()
        };
        assert_eq!(s.render_title("match1"), "Clip: match1");
        assert_eq!(s.tag_list(), vec!["gaming", "highlights"]);

        let blank = Settings {
            title_template: "  ".into(),
            ..Default::default()
        };
        assert_eq!(blank.render_title("match1"), "match1");
    }
}
