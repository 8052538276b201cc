//! thermo_media - fixed-capacity HTTP media processing service
//!
//! Uploads are staged to disk, decoded into frames, run through an ordered
//! list of pixel stages and encoded into an immutable artifact. Video shells
//! out to system `ffmpeg`/`ffprobe` (no linking) and streams frame by frame.
//!
//! A supervisor process runs a fixed pool of worker processes, each with a
//! fixed number of request slots, and kills any worker that overruns the
//! request timeout.

pub mod admission;
pub mod card;
pub mod codec;
pub mod config;
pub mod density;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod reaper;
pub mod stages;
pub mod storage;
pub mod supervisor;
pub mod video;
pub mod worker;

pub use codec::{InputFormat, MediaKind, OutputFormat};
pub use config::ServiceConfig;
pub use density::{DensityMeter, DensityReading, DensitySummary};
pub use error::{ErrorCode, MediaError, RejectReason, Result};
pub use ffmpeg::{FfmpegCommand, FfmpegError};
pub use frame::{Frame, PixelLayout};
pub use lifecycle::{ArtifactReceipt, RequestLifecycle, RequestOptions, Upload};
pub use stages::{Stage, StageError, StagePlan, StageRegistry};
pub use storage::{ArtifactId, Storage};
