use super::model::UploadRow;
use crate::model::UploadRecord;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = crate::config::expand_home(path_part);
    if let Some(parent) = expanded.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded.display());
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_upload(pool: &Pool, file_path: &str, video_id: &str) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO uploads (file_path, video_id, uploaded_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(file_path)
    .bind(video_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn is_uploaded(pool: &Pool, file_path: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT id FROM uploads WHERE file_path = ? LIMIT 1")
        .bind(file_path)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

#[instrument(skip_all)]
pub async fn recent_uploads(pool: &Pool, limit: i64) -> Result<Vec<UploadRecord>> {
    let rows = sqlx::query_as::<_, UploadRow>(
        "SELECT id, file_path, video_id, uploaded_at FROM uploads ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(UploadRecord::from).collect())
}

/// Persist the active upload-limit window, or clear it with `None`.
#[instrument(skip_all)]
pub async fn save_limit(pool: &Pool, reset_at: Option<DateTime<Utc>>) -> Result<()> {
    match reset_at {
        Some(at) => {
            sqlx::query(
                "INSERT INTO upload_limit (id, reset_at) VALUES (1, ?) \
                 ON CONFLICT(id) DO UPDATE SET reset_at = excluded.reset_at",
            )
            .bind(at)
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM upload_limit WHERE id = 1")
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_limit(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let at = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT reset_at FROM upload_limit WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn upload_history_roundtrip() {
        let pool = setup_pool().await;
        assert!(!is_uploaded(&pool, "/v/a.mp4").await.unwrap());

        record_upload(&pool, "/v/a.mp4", "vid-a").await.unwrap();
        record_upload(&pool, "/v/b.mp4", "vid-b").await.unwrap();
        assert!(is_uploaded(&pool, "/v/a.mp4").await.unwrap());

        let recent = recent_uploads(&pool, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].video_id, "vid-b");

        let limited = recent_uploads(&pool, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn limit_state_set_and_clear() {
        let pool = setup_pool().await;
        assert!(load_limit(&pool).await.unwrap().is_none());

        let at = Utc::now() + chrono::Duration::hours(3);
        save_limit(&pool, Some(at)).await.unwrap();
        let later = at + chrono::Duration::hours(1);
        save_limit(&pool, Some(later)).await.unwrap();
        let loaded = load_limit(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp(), later.timestamp());

        save_limit(&pool, None).await.unwrap();
        assert!(load_limit(&pool).await.unwrap().is_none());
    }

    #[test]
    fn sqlite_url_gets_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/uploads.db", td.path().display());
        let prepared = prepare_sqlite_url(&url);
        assert!(prepared.ends_with("uploads.db?mode=rwc"));
        assert!(td.path().join("nested").is_dir());
    }
}
