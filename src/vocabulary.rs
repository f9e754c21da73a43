//! In-memory copy of the behavior vocabulary.

use std::collections::BTreeMap;

use crate::db::{Behavior, Database};
use crate::error::Result;

/// Snapshot of the `behaviors` table, refreshed after every edit.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    entries: Vec<Behavior>,
    labels: BTreeMap<String, String>,
}

impl Vocabulary {
    pub fn load(db: &Database) -> Result<Self> {
        let mut vocabulary = Self::default();
        vocabulary.refresh(db)?;
        Ok(vocabulary)
    }

    pub fn refresh(&mut self, db: &Database) -> Result<()> {
        self.entries = db.list_behaviors()?;
        self.labels = self
            .entries
            .iter()
            .map(|b| (b.key.clone(), b.value.clone()))
            .collect();
        tracing::debug!(behaviors = self.entries.len(), "Vocabulary refreshed");
        Ok(())
    }

    /// Entries in listing order, newest first.
    pub fn entries(&self) -> &[Behavior] {
        &self.entries
    }

    pub fn keys(&self) -> Vec<String> {
        self.labels.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    /// Display label for `key`, falling back to the key itself.
    pub fn display<'a>(&'a self, key: &'a str) -> &'a str {
        self.labels.get(key).map(String::as_str).unwrap_or(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
