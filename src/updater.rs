//! Self-update from GitHub releases.
use chrono::Local;
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Names never overwritten by an update, matched at any depth.
pub const UPDATE_EXCLUDE: &[&str] = &[
    "config.yaml",
    "version.json",
    "credentials",
    "tokens",
    "data",
    "logs",
    ".git",
    "target",
    "temp",
];

const NO_RELEASE_NOTES: &str = "No release notes available.";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Auto-update is disabled")]
    Disabled,
    #[error("No updates available")]
    NoUpdate,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub build_date: String,
    #[serde(default = "default_true")]
    pub auto_update: bool,
}

fn default_true() -> bool {
    true
}

impl VersionInfo {
    fn new(version: &str, auto_update: bool) -> Self {
        Self {
            version: version.to_string(),
            build_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            auto_update,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCheck {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub release_notes: Option<String>,
    pub download_url: Option<String>,
    pub auto_update: bool,
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
    zipball_url: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// True when `latest` is a newer dotted version than `current`.
pub fn version_is_newer(latest: &str, current: &str) -> bool {
    fn parts(v: &str) -> Option<Vec<u64>> {
        let mut out = v
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        while out.len() < 3 {
            out.push(0);
        }
        Some(out)
    }
    match (parts(latest), parts(current)) {
        (Some(l), Some(c)) => {
            for (a, b) in l.iter().zip(c.iter()) {
                if a != b {
                    return a > b;
                }
            }
            false
        }
        _ => latest.trim() > current.trim(),
    }
}

#[derive(Debug)]
pub struct Updater {
    http: Client,
    api_base: Url,
    repo: String,
    install_dir: PathBuf,
    version_file: PathBuf,
    lock: Mutex<()>,
}

impl Updater {
    pub fn new(
        api_base: Url,
        repo: impl Into<String>,
        install_dir: PathBuf,
        data_dir: &Path,
    ) -> Result<Self, UpdateError> {
        let http = Client::builder()
            .user_agent(concat!("auto-uploader/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            api_base,
            repo: repo.into(),
            install_dir,
            version_file: data_dir.join("version.json"),
            lock: Mutex::new(()),
        })
    }

    /// Read `version.json`, creating it with the crate version on first use.
    pub async fn version_info(&self) -> Result<VersionInfo, UpdateError> {
        match tokio::fs::read(&self.version_file).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let info = VersionInfo::new(env!("CARGO_PKG_VERSION"), true);
                self.write_version(&info).await?;
                Ok(info)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_version(&self, info: &VersionInfo) -> Result<(), UpdateError> {
        if let Some(parent) = self.version_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.version_file, serde_json::to_vec_pretty(info)?).await?;
        Ok(())
    }

    pub async fn set_auto_update(&self, enabled: bool) -> Result<(), UpdateError> {
        let _guard = self.lock.lock().await;
        let mut info = self.version_info().await?;
        info.auto_update = enabled;
        self.write_version(&info).await?;
        info!(enabled, "auto-update setting changed");
        Ok(())
    }

    fn api_url(&self, path: &str) -> Result<Url, UpdateError> {
        self.api_base
            .join(path)
            .map_err(|e| UpdateError::Other(format!("invalid update URL: {}", e)))
    }

    #[instrument(skip_all)]
    pub async fn check(&self) -> Result<UpdateCheck, UpdateError> {
        let info = self.version_info().await?;
        let url = self.api_url(&format!("repos/{}/releases/latest", self.repo))?;
        info!(current = %info.version, url = %url, "checking for updates");
        let release: Release = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let latest = release.tag_name.trim_start_matches('v').to_string();
        let download_url = release
            .assets
            .iter()
            .find(|a| a.name.ends_with(".zip"))
            .map(|a| a.browser_download_url.clone())
            .or(release.zipball_url)
            .map(Ok)
            .unwrap_or_else(|| {
                self.api_url(&format!("repos/{}/zipball/latest", self.repo))
                    .map(|u| u.to_string())
            })?;
        let available = !latest.is_empty() && version_is_newer(&latest, &info.version);
        info!(latest = %latest, available, "update check finished");

        Ok(UpdateCheck {
            update_available: available,
            current_version: info.version,
            latest_version: (!latest.is_empty()).then_some(latest),
            release_notes: Some(release.body.unwrap_or_else(|| NO_RELEASE_NOTES.to_string())),
            download_url: available.then_some(download_url),
            auto_update: info.auto_update,
        })
    }

    /// Download and install the latest release. Returns the installed version.
    #[instrument(skip_all)]
    pub async fn apply(&self) -> Result<String, UpdateError> {
        let _guard = self.lock.lock().await;
        if !self.version_info().await?.auto_update {
            return Err(UpdateError::Disabled);
        }
        let check = self.check().await?;
        let (Some(version), Some(url), true) =
            (check.latest_version, check.download_url, check.update_available)
        else {
            return Err(UpdateError::NoUpdate);
        };

        let staging = tempfile::tempdir()?;
        let archive = staging.path().join("update.zip");
        self.download(&url, &archive).await?;

        let install_dir = self.install_dir.clone();
        let extract_dir = staging.path().join("extracted");
        let copied = tokio::task::spawn_blocking(move || {
            install_archive(&archive, &extract_dir, &install_dir)
        })
        .await
        .map_err(|e| UpdateError::Other(e.to_string()))??;

        let auto_update = self.version_info().await.map(|i| i.auto_update).unwrap_or(true);
        self.write_version(&VersionInfo::new(&version, auto_update)).await?;
        info!(version = %version, copied, "update applied");
        Ok(version)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), UpdateError> {
        info!(url, "downloading update");
        let res = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk?).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }
}

/// Extract `archive` and copy its contents over `install_dir`.
/// Returns the number of files copied.
pub(crate) fn install_archive(
    archive: &Path,
    extract_dir: &Path,
    install_dir: &Path,
) -> Result<usize, UpdateError> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive)?)?;
    fs::create_dir_all(extract_dir)?;
    zip.extract(extract_dir)?;

    let root = single_top_dir(extract_dir)?.unwrap_or_else(|| extract_dir.to_path_buf());
    fs::create_dir_all(install_dir)?;
    copy_tree(&root, install_dir)
}

/// GitHub zipballs wrap everything in one `<owner>-<repo>-<sha>` directory.
fn single_top_dir(dir: &Path) -> Result<Option<PathBuf>, UpdateError> {
    let entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(Some(only.path())),
        _ => Ok(None),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<usize, UpdateError> {
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if UPDATE_EXCLUDE.iter().any(|ex| name == *ex) {
            info!(item = %name.to_string_lossy(), "skipping excluded item");
            continue;
        }
        let target = dst.join(&name);
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Re-execute the current binary with the same arguments after `delay`.
pub fn schedule_restart(delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(err) = restart() {
            warn!(?err, "restart failed");
        }
    });
}

fn restart() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    info!(exe = %exe.display(), "restarting application");
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // only returns on failure
        Err(std::process::Command::new(exe).args(args).exec())
    }
    #[cfg(not(unix))]
    {
        std::process::Command::new(exe).args(args).spawn()?;
        std::process::exit(0)
    }
}
