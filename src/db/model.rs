//! Row models used by repositories.

use crate::model::UploadRecord;
use chrono::{DateTime, Utc};

/// One uploaded file as stored in `uploads`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub file_path: String,
    pub video_id: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<UploadRow> for UploadRecord {
    fn from(row: UploadRow) -> Self {
        UploadRecord {
            file_path: row.file_path,
            video_id: row.video_id,
            uploaded_at: row.uploaded_at,
        }
    }
}
