//! Behavior vocabulary rows.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{now_timestamp, Database};

/// Vocabulary written on first run.
pub const DEFAULT_BEHAVIORS: &[(&str, &str)] = &[
    ("lecturing", "Lecturing"),
    ("questioning", "Questioning"),
    ("group_discussion", "Group discussion"),
    ("individual_work", "Individual work"),
    ("demonstration", "Demonstration"),
    ("interaction", "Interaction"),
    ("assessment", "Assessment"),
    ("other", "Other"),
];

#[derive(Debug, Clone, Serialize)]
pub struct Behavior {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_behavior(row: &Row<'_>) -> rusqlite::Result<Behavior> {
    Ok(Behavior {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl Database {
    /// Insert any default behavior whose key is missing.
    pub fn seed_default_behaviors(&self) -> Result<()> {
        let now = now_timestamp();
        for (key, value) in DEFAULT_BEHAVIORS {
            self.conn.execute(
                r#"
                INSERT OR IGNORE INTO behaviors (key, value, created_at, updated_at)
                VALUES (?, ?, ?, ?)
                "#,
                params![key, value, now, now],
            )?;
        }
        Ok(())
    }

    /// All behaviors, most recently added first.
    pub fn list_behaviors(&self) -> Result<Vec<Behavior>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, key, value, description, created_at, updated_at FROM behaviors ORDER BY id DESC",
        )?;
        let behaviors = stmt
            .query_map([], row_to_behavior)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(behaviors)
    }

    pub fn behavior_by_key(&self, key: &str) -> Result<Option<Behavior>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, key, value, description, created_at, updated_at FROM behaviors WHERE key = ?",
                [key],
                row_to_behavior,
            )
            .optional()?)
    }

    /// Add a behavior. Returns `None` when the key is already taken.
    pub fn add_behavior(&self, key: &str, value: &str, description: Option<&str>) -> Result<Option<i64>> {
        if self.behavior_by_key(key)?.is_some() {
            return Ok(None);
        }
        let now = now_timestamp();
        self.conn.execute(
            r#"
            INSERT INTO behaviors (key, value, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![key, value, description, now, now],
        )?;
        Ok(Some(self.conn.last_insert_rowid()))
    }

    /// Rename a behavior. Returns false when no row has this id.
    pub fn update_behavior(&self, id: i64, key: &str, value: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE behaviors SET key = ?, value = ?, updated_at = ? WHERE id = ?",
            params![key, value, now_timestamp(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_behavior(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM behaviors WHERE id = ?", [id])?;
        Ok(changed > 0)
    }
}
