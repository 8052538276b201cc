//! Media pipeline: decode → transform → encode
//!
//! Still images are decoded in memory. Video is streamed one frame at a time
//! from a decoder child through the stage plan into an encoder child that
//! writes straight into a pending artifact, so a request never holds more
//! than one decoded frame and its transformed copy.

use std::path::Path;
use tracing::debug;

use crate::codec::{self, InputFormat, MediaKind, OutputFormat};
use crate::density::DensityMeter;
use crate::error::{MediaError, Result};
use crate::ffmpeg::{self, FfmpegError};
use crate::frame::Frame;
use crate::stages::StagePlan;
use crate::storage::PendingArtifact;
use crate::video::{VideoDecoder, VideoEncoder};

/// Apply every stage of the plan in order, feeding any density reading to `meter`
pub fn transform(frame: Frame, plan: &StagePlan, meter: &mut DensityMeter) -> Result<Frame> {
    let (frame, reading) = plan.apply_measured(frame)?;
    if let Some(reading) = reading {
        meter.record(reading);
    }
    Ok(frame)
}

pub fn encode(frame: &Frame, target: OutputFormat) -> Result<Vec<u8>> {
    codec::encode_image(frame, target)
}

/// Summary of a finished transcode
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSummary {
    pub width: u32,
    pub height: u32,
    pub frames: u64,
}

/// A probed video with its decoder running
pub struct VideoSource {
    decoder: VideoDecoder,
}

impl VideoSource {
    /// Probe the staged file and start decoding it
    pub fn open(path: &Path, format: InputFormat) -> Result<Self> {
        if format.kind() != MediaKind::Video {
            return Err(MediaError::UnsupportedFormat(format!("{} is not a video format", format.mime())));
        }
        let info = ffmpeg::probe(path).map_err(decode_error)?;
        debug!(
            "Probed {} video {}x{} @ {} fps",
            format.mime(),
            info.width,
            info.height,
            info.frame_rate
        );
        let decoder = VideoDecoder::open(path, info).map_err(decode_error)?;
        Ok(Self { decoder })
    }

    /// Transform every frame and feed it to an encoder writing into `pending`.
    ///
    /// The encoder starts on the first transformed frame, whose dimensions the
    /// rest of the stream must match.
    pub fn transform_into(
        mut self,
        plan: &StagePlan,
        pending: &PendingArtifact,
        meter: &mut DensityMeter,
    ) -> Result<EncodingVideo> {
        let frame_rate = self.decoder.info().frame_rate.clone();
        let mut encoder: Option<VideoEncoder> = None;

        while let Some(frame) = self.decoder.next_frame().map_err(decode_error)? {
            let index = self.decoder.frames_read();
            let out = transform(frame, plan, meter)?;

            let mut active = match encoder.take() {
                Some(active) => active,
                None => VideoEncoder::start(pending.path(), out.width(), out.height(), &frame_rate)
                    .map_err(encode_error)?,
            };

            let (width, height) = active.dimensions();
            if out.dimensions() != (width, height) {
                return Err(MediaError::transform(
                    "pipeline",
                    format!(
                        "frame {} is {}x{} but the stream started at {}x{}",
                        index,
                        out.width(),
                        out.height(),
                        width,
                        height
                    ),
                ));
            }
            active.write_frame(out).map_err(encode_error)?;
            encoder = Some(active);
        }

        self.decoder.finish().map_err(decode_error)?;
        let encoder = encoder.ok_or_else(|| MediaError::CorruptInput("video contains no frames".to_string()))?;
        Ok(EncodingVideo { encoder })
    }
}

/// All frames handed to the encoder, container not yet finalised
pub struct EncodingVideo {
    encoder: VideoEncoder,
}

impl EncodingVideo {
    pub fn finish(self) -> Result<VideoSummary> {
        let (width, height) = self.encoder.dimensions();
        let frames = self.encoder.finish().map_err(encode_error)?;
        Ok(VideoSummary { width, height, frames })
    }
}

fn decode_error(e: FfmpegError) -> MediaError {
    match e {
        FfmpegError::NotInstalled => {
            MediaError::UnsupportedFormat("video decoding is unavailable on this host".to_string())
        }
        other => MediaError::CorruptInput(other.to_string()),
    }
}

fn encode_error(e: FfmpegError) -> MediaError {
    match e {
        FfmpegError::NotInstalled => {
            MediaError::EncodeFault("video encoding is unavailable on this host".to_string())
        }
        other => MediaError::EncodeFault(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageRegistry;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_fn(30, 30, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 0]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_transform_encode() {
        let registry = StageRegistry::builtin();
        let plan = registry.build("grayscale,resize:10x5").unwrap();

        let frame = codec::decode_image(&png_bytes(), InputFormat::Png).unwrap();
        let mut meter = DensityMeter::new(0.45);
        let frame = transform(frame, &plan, &mut meter).unwrap();
        assert!(meter.summary().is_none());
        let encoded = encode(&frame, OutputFormat::Jpeg).unwrap();

        let decoded = codec::decode_image(&encoded, InputFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (10, 5));
    }

    #[test]
    fn test_transform_records_heatmap_readings() {
        let plan = StageRegistry::builtin().build("heatmap:10").unwrap();
        let mut meter = DensityMeter::new(0.45);
        for _ in 0..3 {
            let frame = codec::decode_image(&png_bytes(), InputFormat::Png).unwrap();
            transform(frame, &plan, &mut meter).unwrap();
        }
        assert_eq!(meter.summary().unwrap().frames, 3);
    }

    #[test]
    fn test_video_source_refuses_still_images() {
        let err = VideoSource::open(Path::new("/nonexistent.png"), InputFormat::Png).err().unwrap();
        assert!(matches!(err, MediaError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_ffmpeg_errors_map_to_taxonomy() {
        assert!(matches!(decode_error(FfmpegError::NotInstalled), MediaError::UnsupportedFormat(_)));
        assert!(matches!(
            decode_error(FfmpegError::InvalidOutput("x".into())),
            MediaError::CorruptInput(_)
        ));
        assert!(matches!(encode_error(FfmpegError::NotInstalled), MediaError::EncodeFault(_)));
    }
}
