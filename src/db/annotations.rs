//! Behavior annotations on images and sampled video frames.

use anyhow::Result;
use rusqlite::{params, Row};
use serde::Serialize;

use super::{now_timestamp, Database};

pub const DEFAULT_ANNOTATOR: &str = "system";

#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub id: i64,
    pub media_id: i64,
    /// Synthetic frame index into the record's frame cache. `None` for images.
    pub frame_index: Option<f64>,
    pub behavior: String,
    pub coordinates: Option<String>,
    pub annotator: String,
    pub created_at: String,
}

impl Annotation {
    /// Frame index truncated to the integer used in frame file names.
    pub fn frame_number(&self) -> Option<i64> {
        self.frame_index.map(|f| f as i64)
    }
}

/// Fields supplied when creating an annotation.
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub media_id: i64,
    pub frame_index: Option<f64>,
    pub behavior: String,
    pub coordinates: Option<String>,
    pub annotator: String,
}

impl NewAnnotation {
    pub fn new(media_id: i64, behavior: impl Into<String>) -> Self {
        Self {
            media_id,
            frame_index: None,
            behavior: behavior.into(),
            coordinates: None,
            annotator: DEFAULT_ANNOTATOR.to_string(),
        }
    }

    pub fn with_frame(mut self, frame_index: f64) -> Self {
        self.frame_index = Some(frame_index);
        self
    }

    pub fn with_coordinates(mut self, coordinates: impl Into<String>) -> Self {
        self.coordinates = Some(coordinates.into());
        self
    }

    pub fn with_annotator(mut self, annotator: impl Into<String>) -> Self {
        self.annotator = annotator.into();
        self
    }
}

const ANNOTATION_COLUMNS: &str =
    "id, media_id, frame_index, behavior, coordinates, annotator, created_at";

fn row_to_annotation(row: &Row<'_>) -> rusqlite::Result<Annotation> {
    Ok(Annotation {
        id: row.get(0)?,
        media_id: row.get(1)?,
        frame_index: row.get(2)?,
        behavior: row.get(3)?,
        coordinates: row.get(4)?,
        annotator: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl Database {
    pub fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO annotations (media_id, frame_index, behavior, coordinates, annotator, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                annotation.media_id,
                annotation.frame_index,
                annotation.behavior,
                annotation.coordinates,
                annotation.annotator,
                now_timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Annotations owned by a media record, oldest first.
    pub fn annotations_for(&self, media_id: i64) -> Result<Vec<Annotation>> {
        let sql = format!("SELECT {ANNOTATION_COLUMNS} FROM annotations WHERE media_id = ? ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let annotations = stmt
            .query_map([media_id], row_to_annotation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(annotations)
    }

    /// One page (1-based) of a record's annotations.
    pub fn annotations_page(&self, media_id: i64, page: usize, per_page: usize) -> Result<Vec<Annotation>> {
        let offset = page.saturating_sub(1) * per_page;
        let sql = format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations WHERE media_id = ? ORDER BY id LIMIT ? OFFSET ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let annotations = stmt
            .query_map(params![media_id, per_page as i64, offset as i64], row_to_annotation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(annotations)
    }

    pub fn count_annotations_for(&self, media_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM annotations WHERE media_id = ?",
            [media_id],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MediaKind;
    use std::path::Path;

    #[test]
    fn test_frame_number_truncates() {
        let db = Database::open_in_memory().unwrap();
        let media = db
            .insert_media("v.mp4", Path::new("v.mp4"), MediaKind::Video)
            .unwrap();
        db.insert_annotation(
            &NewAnnotation::new(media, "questioning")
                .with_frame(7.9)
                .with_coordinates("[10,20,30,40]"),
        )
        .unwrap();

        let stored = db.annotations_for(media).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].frame_number(), Some(7));
        assert_eq!(stored[0].coordinates.as_deref(), Some("[10,20,30,40]"));
        assert_eq!(stored[0].annotator, DEFAULT_ANNOTATOR);
    }

    #[test]
    fn test_annotation_pages() {
        let db = Database::open_in_memory().unwrap();
        let media = db
            .insert_media("v.mp4", Path::new("v.mp4"), MediaKind::Video)
            .unwrap();
        for i in 0..7 {
            db.insert_annotation(&NewAnnotation::new(media, "lecturing").with_frame(i as f64))
                .unwrap();
        }

        assert_eq!(db.count_annotations_for(media).unwrap(), 7);
        assert_eq!(db.annotations_page(media, 1, 5).unwrap().len(), 5);
        let second = db.annotations_page(media, 2, 5).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].frame_number(), Some(5));
        assert!(db.annotations_page(media, 3, 5).unwrap().is_empty());
    }
}
