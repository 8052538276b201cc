//! Format detection plus still-image decode/encode
//!
//! ## Supported inputs
//!
//! - **Images**: PNG, JPEG, WebP, BMP, GIF (first frame), TIFF
//! - **Video**: MP4, AVI, MOV, MKV, FLV (decoded through ffmpeg, see [`crate::video`])
//!
//! ## Supported outputs
//!
//! PNG, JPEG, lossless WebP and BMP for images; H.264 MP4 for video.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::io::Cursor;
use tracing::debug;

use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelLayout};

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Png,
    Jpeg,
    WebP,
    Bmp,
    Gif,
    Tiff,
    Mp4,
    Avi,
    Mov,
    Mkv,
    Flv,
}

impl InputFormat {
    pub const ALL: [InputFormat; 11] = [
        InputFormat::Png,
        InputFormat::Jpeg,
        InputFormat::WebP,
        InputFormat::Bmp,
        InputFormat::Gif,
        InputFormat::Tiff,
        InputFormat::Mp4,
        InputFormat::Avi,
        InputFormat::Mov,
        InputFormat::Mkv,
        InputFormat::Flv,
    ];

    /// Map a declared or sniffed MIME type onto a supported format
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/png" => Some(InputFormat::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(InputFormat::Jpeg),
            "image/webp" => Some(InputFormat::WebP),
            "image/bmp" | "image/x-ms-bmp" => Some(InputFormat::Bmp),
            "image/gif" => Some(InputFormat::Gif),
            "image/tiff" => Some(InputFormat::Tiff),
            "video/mp4" | "video/x-m4v" => Some(InputFormat::Mp4),
            "video/x-msvideo" | "video/avi" | "video/msvideo" => Some(InputFormat::Avi),
            "video/quicktime" => Some(InputFormat::Mov),
            "video/x-matroska" => Some(InputFormat::Mkv),
            "video/x-flv" => Some(InputFormat::Flv),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(InputFormat::Png),
            "jpg" | "jpeg" => Some(InputFormat::Jpeg),
            "webp" => Some(InputFormat::WebP),
            "bmp" => Some(InputFormat::Bmp),
            "gif" => Some(InputFormat::Gif),
            "tif" | "tiff" => Some(InputFormat::Tiff),
            "mp4" | "m4v" => Some(InputFormat::Mp4),
            "avi" => Some(InputFormat::Avi),
            "mov" => Some(InputFormat::Mov),
            "mkv" => Some(InputFormat::Mkv),
            "flv" => Some(InputFormat::Flv),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            InputFormat::Png => "image/png",
            InputFormat::Jpeg => "image/jpeg",
            InputFormat::WebP => "image/webp",
            InputFormat::Bmp => "image/bmp",
            InputFormat::Gif => "image/gif",
            InputFormat::Tiff => "image/tiff",
            InputFormat::Mp4 => "video/mp4",
            InputFormat::Avi => "video/x-msvideo",
            InputFormat::Mov => "video/quicktime",
            InputFormat::Mkv => "video/x-matroska",
            InputFormat::Flv => "video/x-flv",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            InputFormat::Mp4 | InputFormat::Avi | InputFormat::Mov | InputFormat::Mkv | InputFormat::Flv => {
                MediaKind::Video
            }
            _ => MediaKind::Image,
        }
    }

    fn image_format(&self) -> Option<ImageFormat> {
        match self {
            InputFormat::Png => Some(ImageFormat::Png),
            InputFormat::Jpeg => Some(ImageFormat::Jpeg),
            InputFormat::WebP => Some(ImageFormat::WebP),
            InputFormat::Bmp => Some(ImageFormat::Bmp),
            InputFormat::Gif => Some(ImageFormat::Gif),
            InputFormat::Tiff => Some(ImageFormat::Tiff),
            _ => None,
        }
    }

    fn carries_exif(&self) -> bool {
        matches!(self, InputFormat::Jpeg | InputFormat::Tiff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    WebP,
    Bmp,
    Mp4,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Png,
        OutputFormat::Jpeg,
        OutputFormat::WebP,
        OutputFormat::Bmp,
        OutputFormat::Mp4,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(OutputFormat::Png),
            "jpg" | "jpeg" => Some(OutputFormat::Jpeg),
            "webp" => Some(OutputFormat::WebP),
            "bmp" => Some(OutputFormat::Bmp),
            "mp4" => Some(OutputFormat::Mp4),
            _ => None,
        }
    }

    /// Default target for a media kind
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => OutputFormat::Png,
            MediaKind::Video => OutputFormat::Mp4,
        }
    }

    /// Resolve the requested target, checking it can encode `kind`
    pub fn resolve(requested: Option<&str>, kind: MediaKind) -> Result<Self> {
        let target = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            None => return Ok(Self::default_for(kind)),
            Some(name) => Self::parse(name)
                .ok_or_else(|| MediaError::EncodeFault(format!("unknown target format '{}'", name)))?,
        };
        if target.kind() != kind {
            return Err(MediaError::EncodeFault(format!(
                "target format '{}' cannot encode {:?} input",
                target.extension(),
                kind
            )));
        }
        Ok(target)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::WebP => "webp",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Mp4 => "mp4",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Bmp => "image/bmp",
            OutputFormat::Mp4 => "video/mp4",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            OutputFormat::Mp4 => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }

    /// Content type for a committed artifact, by file extension
    pub fn mime_for_extension(ext: &str) -> &'static str {
        Self::parse(ext)
            .map(|f| f.mime())
            .unwrap_or("application/octet-stream")
    }
}

/// Detect the payload format and check it against the declared type.
///
/// The declared type must name a supported codec. Magic-number sniffing wins
/// over the declaration within a media kind (a PNG labelled `image/jpeg` is
/// decoded as PNG), but a payload of the other kind is refused.
pub fn sniff(bytes: &[u8], declared_type: &str) -> Result<InputFormat> {
    let declared = InputFormat::from_mime(declared_type).ok_or_else(|| {
        MediaError::UnsupportedFormat(format!("no decoder for declared type '{}'", declared_type))
    })?;

    let detected = detect_mime(bytes).ok_or_else(|| {
        MediaError::CorruptInput("payload does not match any known media signature".to_string())
    })?;

    let format = InputFormat::from_mime(detected).ok_or_else(|| {
        MediaError::UnsupportedFormat(format!("detected '{}' is not a supported format", detected))
    })?;

    if format.kind() != declared.kind() {
        return Err(MediaError::UnsupportedFormat(format!(
            "declared {:?} but payload is {:?}",
            declared.kind(),
            format.kind()
        )));
    }

    if format != declared {
        debug!("Declared {} but sniffed {}; using sniffed format", declared.mime(), format.mime());
    }
    Ok(format)
}

fn detect_mime(bytes: &[u8]) -> Option<&'static str> {
    if let Some(kind) = infer::get(bytes) {
        return Some(kind.mime_type());
    }
    let fallback = tree_magic_mini::from_u8(bytes);
    (fallback.starts_with("image/") || fallback.starts_with("video/")).then_some(fallback)
}

/// Decode a still image, applying EXIF orientation where present
pub fn decode_image(bytes: &[u8], format: InputFormat) -> Result<Frame> {
    let image_format = format.image_format().ok_or_else(|| {
        MediaError::UnsupportedFormat(format!("{} is not a still image format", format.mime()))
    })?;

    let img = image::load_from_memory_with_format(bytes, image_format)
        .map_err(|e| MediaError::CorruptInput(format!("cannot decode {}: {}", format.mime(), e)))?;

    let img = if format.carries_exif() {
        match exif_orientation(bytes) {
            Some(orientation) => apply_orientation(img, orientation),
            None => img,
        }
    } else {
        img
    };

    Ok(Frame::new(img))
}

fn exif_orientation(bytes: &[u8]) -> Option<u32> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
}

/// EXIF orientation values 1-8
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Encode a frame into a still-image container
pub fn encode_image(frame: &Frame, target: OutputFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());

    match target {
        OutputFormat::Png => frame
            .image()
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| MediaError::EncodeFault(format!("png: {}", e)))?,
        OutputFormat::Bmp => frame
            .image()
            .write_to(&mut out, ImageFormat::Bmp)
            .map_err(|e| MediaError::EncodeFault(format!("bmp: {}", e)))?,
        OutputFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
            // JPEG has no alpha channel
            let result = match frame.layout() {
                PixelLayout::Gray8 => encoder.encode_image(&frame.luma()),
                PixelLayout::Rgb8 | PixelLayout::Rgba8 => encoder.encode_image(&frame.image().to_rgb8()),
            };
            result.map_err(|e| MediaError::EncodeFault(format!("jpeg: {}", e)))?;
        }
        OutputFormat::WebP => {
            let (width, height) = frame.dimensions();
            let memory = match frame.layout() {
                PixelLayout::Rgba8 => webp::Encoder::from_rgba(frame.as_bytes(), width, height).encode_lossless(),
                PixelLayout::Rgb8 => webp::Encoder::from_rgb(frame.as_bytes(), width, height).encode_lossless(),
                PixelLayout::Gray8 => {
                    let rgb = frame.image().to_rgb8();
                    webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_lossless()
                }
            };
            return Ok(memory.to_vec());
        }
        OutputFormat::Mp4 => {
            return Err(MediaError::EncodeFault(
                "mp4 output requires a video input".to_string(),
            ))
        }
    }

    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sample_png() -> Vec<u8> {
        let img = RgbImage::from_fn(8, 6, |x, y| Rgb([(x * 30) as u8, (y * 40) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_sniff_accepts_matching_declaration() {
        let png = sample_png();
        assert_eq!(sniff(&png, "image/png").unwrap(), InputFormat::Png);
        // sniffed format wins within the same media kind
        assert_eq!(sniff(&png, "image/jpeg").unwrap(), InputFormat::Png);
    }

    #[test]
    fn test_sniff_rejects_unknown_declaration() {
        let err = sniff(&sample_png(), "application/pdf").unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_sniff_rejects_kind_mismatch() {
        let err = sniff(&sample_png(), "video/mp4").unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_sniff_garbage_is_corrupt() {
        let garbage = vec![0x13u8, 0x37, 0x00, 0x42, 0x99, 0x01, 0x02, 0x03, 0x04, 0x05];
        let err = sniff(&garbage, "image/png").unwrap_err();
        assert!(matches!(
            err,
            MediaError::CorruptInput(_) | MediaError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn test_truncated_png_is_corrupt() {
        let png = sample_png();
        let truncated = &png[..png.len() / 2];
        let format = sniff(truncated, "image/png").unwrap();
        let err = decode_image(truncated, format).unwrap_err();
        assert!(matches!(err, MediaError::CorruptInput(_)));
    }

    #[test]
    fn test_png_round_trip_is_lossless() {
        let png = sample_png();
        let frame = decode_image(&png, InputFormat::Png).unwrap();
        let encoded = encode_image(&frame, OutputFormat::Png).unwrap();
        let again = decode_image(&encoded, InputFormat::Png).unwrap();
        assert_eq!(frame.as_bytes(), again.as_bytes());
        assert_eq!(again.dimensions(), (8, 6));
    }

    #[test]
    fn test_all_image_targets_encode() {
        let frame = decode_image(&sample_png(), InputFormat::Png).unwrap();
        for target in [OutputFormat::Png, OutputFormat::Jpeg, OutputFormat::WebP, OutputFormat::Bmp] {
            let bytes = encode_image(&frame, target).unwrap();
            assert!(!bytes.is_empty(), "{:?} produced no bytes", target);
        }
        assert!(matches!(
            encode_image(&frame, OutputFormat::Mp4),
            Err(MediaError::EncodeFault(_))
        ));
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(OutputFormat::resolve(None, MediaKind::Image).unwrap(), OutputFormat::Png);
        assert_eq!(OutputFormat::resolve(Some("JPG"), MediaKind::Image).unwrap(), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::resolve(Some(""), MediaKind::Video).unwrap(), OutputFormat::Mp4);
        assert!(OutputFormat::resolve(Some("gif"), MediaKind::Image).is_err());
        assert!(OutputFormat::resolve(Some("png"), MediaKind::Video).is_err());
    }

    #[test]
    fn test_orientation_swaps_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(4, 2));
        assert_eq!(apply_orientation(img.clone(), 6).width(), 2);
        assert_eq!(apply_orientation(img.clone(), 3).width(), 4);
        assert_eq!(apply_orientation(img, 1).height(), 2);
    }
}
