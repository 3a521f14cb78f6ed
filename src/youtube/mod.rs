use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::model::{Channel, Privacy};
use crate::youtube::model::{ChannelListResponse, VideoResource};

pub mod model;
pub mod projects;

pub use projects::{ProjectError, ProjectRegistry};

/// Category 20 is "Gaming".
pub const DEFAULT_CATEGORY_ID: &str = "20";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("uploadLimitExceeded: {0}")]
    LimitExceeded(String),
    #[error("{0}")]
    Transient(String),
    #[error("not authenticated: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    Fatal(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transient(err.to_string())
    }
}

impl From<ProjectError> for UploadError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::NoActiveProject | ProjectError::NotAuthenticated(_) => {
                UploadError::Unauthorized(err.to_string())
            }
            ProjectError::Http(e) => UploadError::Transient(e.to_string()),
            other => UploadError::Fatal(other.to_string()),
        }
    }
}

/// Classify a failed API response.
pub fn classify_failure(status: StatusCode, body: &str) -> UploadError {
    let lower = body.to_ascii_lowercase();
    if body.contains("uploadLimitExceeded") || body.contains("quotaExceeded") {
        return UploadError::LimitExceeded(body.to_string());
    }
    if status == StatusCode::UNAUTHORIZED {
        return UploadError::Unauthorized(format!("{}: {}", status, body));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || body.contains("SSL")
        || lower.contains("connection")
        || lower.contains("timeout")
    {
        return UploadError::Transient(format!("{}: {}", status, body));
    }
    UploadError::Fatal(format!("{}: {}", status, body))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
}

impl VideoMetadata {
    pub fn to_body(&self) -> Value {
        json!({
            "snippet": {
                "title": self.title,
                "description": self.description,
                "tags": self.tags,
                "categoryId": self.category_id,
            },
            "status": {
                "privacyStatus": self.privacy.as_str(),
                "selfDeclaredMadeForKids": false,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    Incomplete { next_offset: u64 },
    Complete { video_id: String },
}

#[async_trait]
pub trait VideoPlatform: Send + Sync {
    async fn is_authenticated(&self) -> bool;

    /// Open a resumable upload session and return its URL.
    async fn start_upload(
        &self,
        metadata: &VideoMetadata,
        file_size: u64,
        channel_id: Option<&str>,
    ) -> Result<String, UploadError>;

    async fn upload_chunk(
        &self,
        session_url: &str,
        offset: u64,
        chunk: Vec<u8>,
        total: u64,
    ) -> Result<ChunkStatus, UploadError>;

    async fn list_channels(&self) -> Result<Vec<Channel>, UploadError>;

    /// Activate another credential set after the limit was hit. Returns its id.
    async fn switch_project_after_limit(&self) -> Result<Option<String>, UploadError>;

    /// Called once the limit window has passed.
    async fn limit_window_ended(&self) {}
}

#[derive(Clone)]
pub struct YouTubeClient {
    http: Client,
    api_base: Url,
    projects: Arc<ProjectRegistry>,
}

impl fmt::Debug for YouTubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl YouTubeClient {
    pub fn new(api_base: Url, projects: Arc<ProjectRegistry>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("auto-uploader/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base,
            projects,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, UploadError> {
        self.api_base
            .join(path)
            .map_err(|e| UploadError::Fatal(format!("invalid API base URL: {}", e)))
    }

    async fn failure(res: reqwest::Response) -> UploadError {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        classify_failure(status, &body)
    }
}

/// Parse a `Range: bytes=0-N` header into the next offset.
fn next_offset_from_range(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.rsplit('-').next())
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

#[async_trait]
impl VideoPlatform for YouTubeClient {
    async fn is_authenticated(&self) -> bool {
        self.projects.active_id().await.is_some()
    }

    async fn start_upload(
        &self,
        metadata: &VideoMetadata,
        file_size: u64,
        channel_id: Option<&str>,
    ) -> Result<String, UploadError> {
        let token = self.projects.access_token().await?;
        let mut url = self.endpoint("upload/youtube/v3/videos")?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("part", "snippet,status");
        if let Some(channel) = channel_id {
            url.query_pairs_mut()
                .append_pair("onBehalfOfContentOwner", channel);
        }
        let body = metadata.to_body();
        debug!(url = %url, payload = %body, "opening upload session");
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("X-Upload-Content-Length", file_size)
            .header("X-Upload-Content-Type", "video/*")
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::failure(res).await);
        }
        res.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UploadError::Fatal("upload session has no Location header".into()))
    }

    async fn upload_chunk(
        &self,
        session_url: &str,
        offset: u64,
        chunk: Vec<u8>,
        total: u64,
    ) -> Result<ChunkStatus, UploadError> {
        if chunk.is_empty() {
            return Err(UploadError::Fatal(format!("empty chunk at offset {}", offset)));
        }
        let token = self.projects.access_token().await?;
        let end = offset + chunk.len() as u64 - 1;
        let res = self
            .http
            .put(session_url)
            .bearer_auth(token)
            .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total))
            .body(chunk)
            .send()
            .await?;
        let status = res.status();
        if status.as_u16() == 308 {
            let range = res
                .headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok());
            return Ok(ChunkStatus::Incomplete {
                next_offset: next_offset_from_range(range),
            });
        }
        if !status.is_success() {
            return Err(Self::failure(res).await);
        }
        let video: VideoResource = res
            .json()
            .await
            .map_err(|e| UploadError::Fatal(format!("invalid upload response: {}", e)))?;
        Ok(ChunkStatus::Complete { video_id: video.id })
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, UploadError> {
        let token = self.projects.access_token().await?;
        let mut url = self.endpoint("youtube/v3/channels")?;
        url.query_pairs_mut()
            .append_pair("part", "snippet")
            .append_pair("mine", "true");
        let res = self.http.get(url).bearer_auth(token).send().await?;
        if !res.status().is_success() {
            return Err(Self::failure(res).await);
        }
        let payload: ChannelListResponse = res
            .json()
            .await
            .map_err(|e| UploadError::Fatal(format!("invalid channel list: {}", e)))?;
        Ok(payload
            .items
            .into_iter()
            .map(|item| Channel {
                id: item.id,
                title: item.snippet.title,
                thumbnail: item
                    .snippet
                    .thumbnails
                    .default
                    .or(item.snippet.thumbnails.medium)
                    .map(|t| t.url),
            })
            .collect())
    }

    async fn switch_project_after_limit(&self) -> Result<Option<String>, UploadError> {
        Ok(self.projects.rotate_after_limit().await?)
    }

    async fn limit_window_ended(&self) {
        self.projects.clear_limited().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsStore;

    #[test]
    fn classify_limit_and_transient() {
        let limit = classify_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"errors":[{"reason":"uploadLimitExceeded"}]}}"#,
        );
        assert!(matches!(limit, UploadError::LimitExceeded(_)));

        assert!(matches!(
            classify_failure(StatusCode::SERVICE_UNAVAILABLE, "backend error"),
            UploadError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "Connection reset by peer"),
            UploadError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, "invalid credentials"),
            UploadError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "invalid title"),
            UploadError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn empty_chunk_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        let settings = SettingsStore::open(td.path()).await.unwrap();
        let projects = Arc::new(ProjectRegistry::new(
            td.path().join("credentials"),
            td.path().join("tokens"),
            settings,
        ));
        let api = Url::parse("http://127.0.0.1:9/").unwrap();
        let client = YouTubeClient::new(api, projects).unwrap();
        let err = client
            .upload_chunk("http://127.0.0.1:9/session", 0, Vec::new(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Fatal(_)));
    }

    #[test]
    fn range_header_parsing() {
        assert_eq!(next_offset_from_range(Some("bytes=0-1048575")), 1_048_576);
        assert_eq!(next_offset_from_range(None), 0);
        assert_eq!(next_offset_from_range(Some("garbage")), 0);
    }

    #[test]
    fn metadata_body_shape() {
        let meta = VideoMetadata {
            title: "t".into(),
            description: "d".into(),
            tags: vec!["a".into()],
            category_id: DEFAULT_CATEGORY_ID.into(),
            privacy: Privacy::Private,
        };
        let body = meta.to_body();
        assert_eq!(body["snippet"]["categoryId"], "20");
        assert_eq!(body["status"]["privacyStatus"], "private");
        assert_eq!(body["status"]["selfDeclaredMadeForKids"], false);
    }
}
