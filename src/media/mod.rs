//! Media access: path resolution, video decoding, frame sampling and caching,
//! and the image feature transform.

pub mod features;
pub mod frames;
pub mod resolver;
pub mod sampler;
pub mod video;

pub use features::{extract_features, load_features, FEATURE_LEN};
pub use frames::{parse_frame_index, FrameFile, FrameStore};
pub use resolver::{PathResolver, ResolveStrategy};
pub use sampler::{frame_file_name, FrameSampler};
pub use video::{DecoderBackend, FfmpegDecoder, VideoDecoder, VideoInfo, VideoStream};
