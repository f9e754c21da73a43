//! Interval sampling of video frames into a frame directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::SamplerConfig;
use crate::error::{Error, Result};

use super::video::{DecoderBackend, VideoDecoder, VideoStream};

/// Extension of every written frame file.
pub const FRAME_EXTENSION: &str = "jpg";

/// File name for the `index`-th sampled frame: `frame_0007.jpg`.
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:04}.{FRAME_EXTENSION}")
}

/// Source frames between two sampled frames; never less than one.
pub fn frame_interval(frame_rate: f64, interval_secs: f64) -> u64 {
    let frames = (frame_rate * interval_secs).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as u64
    } else {
        1
    }
}

/// Maximum number of frames to write for a source of `total_frames`.
///
/// `min(max_frames, floor(duration / interval) + 1)` with the duration taken
/// as zero when the frame count is unknown.
pub fn extraction_cap(total_frames: Option<u64>, frame_rate: f64, interval_secs: f64, max_frames: usize) -> usize {
    let duration = match total_frames {
        Some(n) if n > 0 && frame_rate > 0.0 => n as f64 / frame_rate,
        _ => 0.0,
    };
    let by_duration = if interval_secs > 0.0 {
        (duration / interval_secs).floor() as usize + 1
    } else {
        1
    };
    by_duration.min(max_frames)
}

pub struct FrameSampler {
    decoder: Arc<dyn VideoDecoder>,
    max_frames: usize,
    fallback_fps: f64,
}

impl FrameSampler {
    pub fn new(decoder: Arc<dyn VideoDecoder>, config: &SamplerConfig) -> Self {
        Self {
            decoder,
            max_frames: config.max_frames,
            fallback_fps: config.fallback_fps,
        }
    }

    /// Decode `video_path` and write every `interval_secs`-th second of it
    /// into `output_dir` as `frame_NNNN.jpg`. Returns the number written.
    pub fn sample(&self, video_path: &Path, output_dir: &Path, interval_secs: f64) -> Result<usize> {
        match fs::metadata(video_path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => return Err(Error::VideoEmpty(video_path.to_path_buf())),
        }

        fs::create_dir_all(output_dir).map_err(|source| Error::Directory {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut stream = self.open(video_path)?;
        let info = stream.info();

        let frame_rate = if info.frame_rate > 0.0 {
            info.frame_rate
        } else {
            tracing::debug!(
                path = %video_path.display(),
                fallback_fps = self.fallback_fps,
                "Video reports no frame rate"
            );
            self.fallback_fps
        };
        let step = frame_interval(frame_rate, interval_secs);
        let cap = extraction_cap(info.frame_count, frame_rate, interval_secs, self.max_frames);

        tracing::info!(
            path = %video_path.display(),
            output = %output_dir.display(),
            frame_rate,
            frame_count = ?info.frame_count,
            step,
            cap,
            "Sampling video frames"
        );

        let extracted = Self::write_frames(stream.as_mut(), output_dir, step, cap)?;
        // The stream drops here, or on any early return above.

        tracing::info!(path = %video_path.display(), extracted, "Frame sampling finished");
        Ok(extracted)
    }

    fn open(&self, video_path: &Path) -> Result<Box<dyn VideoStream>> {
        match self.decoder.open(video_path, DecoderBackend::Auto) {
            Ok(stream) => Ok(stream),
            Err(first) => {
                tracing::warn!(
                    path = %video_path.display(),
                    error = %first,
                    "Default decoder failed, retrying with explicit backend"
                );
                self.decoder.open(video_path, DecoderBackend::Explicit)
            }
        }
    }

    fn write_frames(stream: &mut dyn VideoStream, output_dir: &Path, step: u64, cap: usize) -> Result<usize> {
        let mut source_index: u64 = 0;
        let mut extracted = 0usize;

        while extracted < cap {
            let Some(frame) = stream.next_frame()? else {
                break;
            };

            if source_index % step == 0 {
                let target = output_dir.join(frame_file_name(extracted));
                match frame.save(&target) {
                    Ok(()) => extracted += 1,
                    Err(e) => {
                        tracing::warn!(path = %target.display(), error = %e, "Failed to write frame");
                    }
                }
            }
            source_index += 1;
        }

        Ok(extracted)
    }
}
