//! Video decoding.
//!
//! [`VideoDecoder`] opens a source and hands back a [`VideoStream`] that yields
//! RGB frames in order. Dropping the stream releases the decoder. The shipped
//! implementation drives `ffprobe` for stream metadata and `ffmpeg` for raw
//! RGB24 frames over a pipe.

use image::RgbImage;
use serde::Deserialize;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::error::{Error, Result};

/// Stream properties reported by the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frames per second; zero or negative when unknown.
    pub frame_rate: f64,
    pub frame_count: Option<u64>,
}

/// How hard to try when opening a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderBackend {
    /// Decoder defaults.
    Auto,
    /// Absolute path, software decoding, enlarged probe window.
    Explicit,
}

pub trait VideoStream {
    fn info(&self) -> VideoInfo;

    /// Next decoded frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path, backend: DecoderBackend) -> Result<Box<dyn VideoStream>>;
}

// ---------------------------------------------------------------------------
// ffprobe JSON output
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// e.g. "30/1" or "30000/1001"
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    /// Older containers carry the rotation as a tag.
    tags: Option<ProbeTags>,
    /// Newer ffprobe reports a display matrix rotation here instead.
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    /// Rotation in degrees, normalized to `0..360`.
    fn rotation(&self) -> i64 {
        let degrees = self
            .side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| {
                self.tags
                    .as_ref()
                    .and_then(|t| t.rotate.as_deref())
                    .and_then(|r| r.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        (degrees.round() as i64).rem_euclid(360)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rational such as `"30000/1001"`. `"0/0"` yields 0.
pub(crate) fn parse_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.trim().parse().unwrap_or(0.0),
    }
}

fn parse_probe(json: &str) -> std::result::Result<VideoInfo, String> {
    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| "no video stream".to_string())?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no dimensions".to_string()),
    };
    // ffmpeg autorotates while decoding, so quarter turns arrive transposed
    let (width, height) = match stream.rotation() {
        90 | 270 => (height, width),
        _ => (width, height),
    };

    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .map(parse_rate)
        .filter(|r| *r > 0.0)
        .or_else(|| stream.avg_frame_rate.as_deref().map(parse_rate))
        .unwrap_or(0.0);

    let duration = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| match duration {
            Some(d) if d > 0.0 && frame_rate > 0.0 => Some((d * frame_rate).round() as u64),
            _ => None,
        });

    Ok(VideoInfo {
        width,
        height,
        frame_rate,
        frame_count,
    })
}

/// Decoder backed by the `ffprobe` and `ffmpeg` binaries.
pub struct FfmpegDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn probe(&self, path: &Path, backend: DecoderBackend) -> Result<VideoInfo> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error"]);
        if backend == DecoderBackend::Explicit {
            cmd.args(["-probesize", "50M", "-analyzeduration", "100M"]);
        }
        let output = cmd
            .args(["-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .map_err(|e| Error::VideoOpen {
                path: path.to_path_buf(),
                reason: format!("failed to run ffprobe: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::VideoOpen {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_probe(&String::from_utf8_lossy(&output.stdout)).map_err(|reason| Error::VideoOpen {
            path: path.to_path_buf(),
            reason,
        })
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path, backend: DecoderBackend) -> Result<Box<dyn VideoStream>> {
        let source = match backend {
            DecoderBackend::Auto => path.to_path_buf(),
            DecoderBackend::Explicit => std::path::absolute(path)?,
        };

        let info = self.probe(&source, backend)?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error", "-nostdin"]);
        if backend == DecoderBackend::Explicit {
            cmd.args(["-hwaccel", "none"]);
        }
        let mut child = cmd
            .arg("-i")
            .arg(&source)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::VideoOpen {
                path: source.clone(),
                reason: format!("failed to spawn ffmpeg: {e}"),
            })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::VideoOpen {
                    path: source,
                    reason: "ffmpeg stdout unavailable".to_string(),
                });
            }
        };

        Ok(Box::new(FfmpegStream {
            info,
            child,
            reader: BufReader::new(stdout),
            frame_len: info.width as usize * info.height as usize * 3,
        }))
    }
}

struct FfmpegStream {
    info: VideoInfo,
    child: Child,
    reader: BufReader<ChildStdout>,
    frame_len: usize,
}

impl VideoStream for FfmpegStream {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.frame_len];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => Ok(RgbImage::from_raw(self.info.width, self.info.height, buf)),
            // A trailing partial frame counts as end of stream
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
