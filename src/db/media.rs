//! Media records: uploaded images and videos.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

use super::{now_timestamp, Database};

/// Extensions accepted for upload, with the media kind they map to.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov"];
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Kind for an uploaded file name, or `None` when the extension is not allowed.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        let ext = ext.to_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Uploaded,
    Annotated,
    Processed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Uploaded => "uploaded",
            MediaStatus::Annotated => "annotated",
            MediaStatus::Processed => "processed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(MediaStatus::Uploaded),
            "annotated" => Some(MediaStatus::Annotated),
            "processed" => Some(MediaStatus::Processed),
            _ => None,
        }
    }
}

/// A unit of uploaded content.
#[derive(Debug, Clone, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub filename: String,
    /// Location recorded at upload time; may be relative to a different
    /// working directory than the current one.
    pub filepath: String,
    pub kind: MediaKind,
    pub status: MediaStatus,
    pub upload_time: String,
}

const MEDIA_COLUMNS: &str = "id, filename, filepath, file_type, status, upload_time";

fn row_to_media(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    let kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(MediaRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        filepath: row.get(2)?,
        kind: MediaKind::from_str(&kind).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(3, kind.clone(), rusqlite::types::Type::Text)
        })?,
        status: MediaStatus::from_str(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(4, status.clone(), rusqlite::types::Type::Text)
        })?,
        upload_time: row.get(5)?,
    })
}

impl Database {
    pub fn insert_media(&self, filename: &str, filepath: &Path, kind: MediaKind) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO media_files (filename, filepath, file_type, status, upload_time)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                filename,
                filepath.to_string_lossy(),
                kind.as_str(),
                MediaStatus::Uploaded.as_str(),
                now_timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_media(&self, id: i64) -> Result<Option<MediaRecord>> {
        let sql = format!("SELECT {MEDIA_COLUMNS} FROM media_files WHERE id = ?");
        Ok(self.conn.query_row(&sql, [id], row_to_media).optional()?)
    }

    /// All media, newest upload first.
    pub fn list_media(&self) -> Result<Vec<MediaRecord>> {
        let sql = format!("SELECT {MEDIA_COLUMNS} FROM media_files ORDER BY upload_time DESC, id DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_media)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Media with the given status, in insertion order.
    pub fn media_with_status(&self, status: MediaStatus) -> Result<Vec<MediaRecord>> {
        let sql = format!("SELECT {MEDIA_COLUMNS} FROM media_files WHERE status = ? ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([status.as_str()], row_to_media)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count_media(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?)
    }

    pub fn count_media_with_status(&self, status: MediaStatus) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM media_files WHERE status = ?",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn set_media_status(&self, id: i64, status: MediaStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE media_files SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )?;
        Ok(())
    }
}
