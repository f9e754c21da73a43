//! Resolve a media record to a file that exists on disk.
//!
//! Stored locations may have been written under a different working
//! directory than the current process uses. Each [`ResolveStrategy`]
//! proposes one candidate; the first candidate that exists wins.

use std::path::{Path, PathBuf};

use crate::db::MediaRecord;
use crate::error::{Error, Result};

/// One way of turning a record into a candidate path.
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate location, or `None` when this strategy does not apply.
    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf>;
}

/// The stored location, when it is already absolute.
pub struct StoredAbsolute;

impl ResolveStrategy for StoredAbsolute {
    fn name(&self) -> &'static str {
        "stored-absolute"
    }

    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf> {
        let stored = Path::new(&record.filepath);
        stored.is_absolute().then(|| stored.to_path_buf())
    }
}

/// The stored location joined onto the working directory.
pub struct StoredRelative {
    pub cwd: PathBuf,
}

impl ResolveStrategy for StoredRelative {
    fn name(&self) -> &'static str {
        "stored-relative"
    }

    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf> {
        let stored = Path::new(&record.filepath);
        (!stored.is_absolute()).then(|| self.cwd.join(stored))
    }
}

/// The uploads directory, as configured, joined with the file name.
pub struct UploadsDir {
    pub uploads_dir: PathBuf,
}

impl ResolveStrategy for UploadsDir {
    fn name(&self) -> &'static str {
        "uploads-dir"
    }

    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf> {
        Some(self.uploads_dir.join(&record.filename))
    }
}

/// The uploads directory anchored at the working directory.
pub struct CwdUploadsDir {
    pub cwd: PathBuf,
    pub uploads_dir: PathBuf,
}

impl ResolveStrategy for CwdUploadsDir {
    fn name(&self) -> &'static str {
        "cwd-uploads-dir"
    }

    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf> {
        Some(self.cwd.join(&self.uploads_dir).join(&record.filename))
    }
}

/// Absolute form of the uploads-directory candidate, as seen by the process.
pub struct AbsoluteUploadsDir {
    pub uploads_dir: PathBuf,
}

impl ResolveStrategy for AbsoluteUploadsDir {
    fn name(&self) -> &'static str {
        "absolute-uploads-dir"
    }

    fn candidate(&self, record: &MediaRecord) -> Option<PathBuf> {
        std::path::absolute(self.uploads_dir.join(&record.filename)).ok()
    }
}

/// Ordered list of strategies, first match wins.
pub struct PathResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl PathResolver {
    /// The standard five-step search rooted at `cwd`.
    pub fn new(uploads_dir: &Path, cwd: &Path) -> Self {
        Self::with_strategies(vec![
            Box::new(StoredAbsolute),
            Box::new(StoredRelative {
                cwd: cwd.to_path_buf(),
            }),
            Box::new(UploadsDir {
                uploads_dir: uploads_dir.to_path_buf(),
            }),
            Box::new(CwdUploadsDir {
                cwd: cwd.to_path_buf(),
                uploads_dir: uploads_dir.to_path_buf(),
            }),
            Box::new(AbsoluteUploadsDir {
                uploads_dir: uploads_dir.to_path_buf(),
            }),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// Every candidate in search order, for diagnostics.
    pub fn candidates(&self, record: &MediaRecord) -> Vec<(&'static str, PathBuf)> {
        self.strategies
            .iter()
            .filter_map(|s| s.candidate(record).map(|p| (s.name(), p)))
            .collect()
    }

    pub fn resolve(&self, record: &MediaRecord) -> Result<PathBuf> {
        for strategy in &self.strategies {
            if let Some(path) = strategy.candidate(record) {
                if path.exists() {
                    tracing::debug!(
                        media_id = record.id,
                        strategy = strategy.name(),
                        path = %path.display(),
                        "Resolved media path"
                    );
                    return Ok(path);
                }
            }
        }

        tracing::warn!(
            media_id = record.id,
            filename = %record.filename,
            candidates = ?self.candidates(record),
            "Media file not found"
        );
        Err(Error::MediaNotFound {
            media_id: record.id,
            filename: record.filename.clone(),
        })
    }
}
