//! Per-record cache of sampled video frames.
//!
//! Layout: `<frames_dir>/<media id>/frame_NNNN.jpg`. A directory holding at
//! least one frame file counts as populated; nothing checks whether the
//! source video changed since.

use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SamplerConfig;
use crate::db::{MediaKind, MediaRecord};
use crate::error::{Error, Result};

use super::resolver::PathResolver;
use super::sampler::{frame_file_name, FrameSampler, FRAME_EXTENSION};

/// A cached frame on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    pub index: usize,
    pub path: PathBuf,
}

/// Frame index encoded in a cache file name, e.g. `frame_0012.jpg` -> 12.
pub fn parse_frame_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(FRAME_EXTENSION)?.strip_suffix('.')?;
    stem.strip_prefix("frame_")?.parse().ok()
}

pub struct FrameStore {
    root: PathBuf,
    sampler: FrameSampler,
    default_interval_secs: f64,
    fallback_interval_secs: f64,
}

impl FrameStore {
    pub fn new(root: impl Into<PathBuf>, sampler: FrameSampler, config: &SamplerConfig) -> Self {
        Self {
            root: root.into(),
            sampler,
            default_interval_secs: config.default_interval_secs,
            fallback_interval_secs: config.fallback_interval_secs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn frame_dir(&self, media_id: i64) -> PathBuf {
        self.root.join(media_id.to_string())
    }

    /// Where the frame with this index lives, whether or not it exists.
    pub fn frame_path(&self, media_id: i64, index: usize) -> PathBuf {
        self.frame_dir(media_id).join(frame_file_name(index))
    }

    /// Cached frames for a record, sorted by index. Empty when not populated.
    pub fn list_frames(&self, media_id: i64) -> Result<Vec<FrameFile>> {
        let dir = self.frame_dir(media_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut frames: Vec<FrameFile> = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let index = parse_frame_index(&e.file_name().to_string_lossy())?;
                Some(FrameFile {
                    index,
                    path: e.into_path(),
                })
            })
            .collect();

        // Zero-padded names sort the same way; sorting on the parsed index also
        // covers indices past four digits.
        frames.sort_by_key(|f| f.index);
        Ok(frames)
    }

    pub fn is_populated(&self, media_id: i64) -> Result<bool> {
        Ok(!self.list_frames(media_id)?.is_empty())
    }

    /// Return the record's cached frames, sampling the source video first
    /// when the cache is empty.
    ///
    /// A pass at the default interval that writes nothing is retried once at
    /// the fallback interval. Sampler errors are not retried.
    pub fn ensure_populated(&self, record: &MediaRecord, resolver: &PathResolver) -> Result<Vec<FrameFile>> {
        if record.kind != MediaKind::Video {
            return Ok(Vec::new());
        }

        let existing = self.list_frames(record.id)?;
        if !existing.is_empty() {
            tracing::debug!(media_id = record.id, frames = existing.len(), "Frame cache hit");
            return Ok(existing);
        }

        let video = resolver.resolve(record)?;
        let dir = self.frame_dir(record.id);

        self.sampler.sample(&video, &dir, self.default_interval_secs)?;
        let mut frames = self.list_frames(record.id)?;

        if frames.is_empty() {
            tracing::warn!(
                media_id = record.id,
                interval = self.fallback_interval_secs,
                "No frames at default interval, retrying at fallback interval"
            );
            self.sampler.sample(&video, &dir, self.fallback_interval_secs)?;
            frames = self.list_frames(record.id)?;
        }

        if frames.is_empty() {
            return Err(Error::NoFrames {
                media_id: record.id,
            });
        }
        Ok(frames)
    }

    /// Remove every per-record cache directory under the root.
    pub fn clear_all(&self) -> Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                match fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove frame cache");
                    }
                }
            }
        }
        Ok(removed)
    }
}
