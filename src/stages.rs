//! Transform stages and the registry that builds them from a textual plan
//!
//! A plan is a comma separated list of `name[:arg[:arg]]` entries, applied
//! strictly left to right:
//!
//! ```text
//! grayscale, blur:2.0, resize:640x360
//! heatmap:25:0.7
//! ```
//!
//! Every stage is stateless and deterministic: the output depends only on the
//! input pixels and the stage arguments. A stage consumes its input frame, so a
//! chain never holds more than the current frame and the one being produced.
//!
//! ## Built-in stages
//!
//! | name        | args                 |
//! |-------------|----------------------|
//! | `identity`  | -                    |
//! | `grayscale` | -                    |
//! | `blur`      | `sigma`              |
//! | `resize`    | `WxH`                |
//! | `threshold` | `level`              |
//! | `edges`     | -                    |
//! | `heatmap`   | `grid`, `opacity`    |

use fast_image_resize as fr;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::density::DensityReading;
use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelLayout};

const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),
}

/// A pure frame transform
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError>;

    /// `apply`, plus a density reading from stages that measure one
    fn apply_measured(&self, frame: Frame) -> std::result::Result<(Frame, Option<DensityReading>), StageError> {
        self.apply(frame).map(|frame| (frame, None))
    }
}

pub type StageFactory = Arc<dyn Fn(&[&str]) -> std::result::Result<Box<dyn Stage>, StageError> + Send + Sync>;

/// Registry entry describing a stage for the capability card
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub args: String,
    pub description: String,
}

struct StageEntry {
    info: StageInfo,
    factory: StageFactory,
}

/// Mapping from stage name to constructor; the pipeline's extension point
pub struct StageRegistry {
    entries: BTreeMap<String, StageEntry>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the built-in stages
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("identity", "", "Pass the frame through unchanged", |args| {
            no_args("identity", args)?;
            Ok(Box::new(Identity))
        });
        registry.register("grayscale", "", "Convert to 8-bit luma", |args| {
            no_args("grayscale", args)?;
            Ok(Box::new(Grayscale))
        });
        registry.register("blur", "sigma (default 1.5)", "Gaussian blur", |args| {
            Ok(Box::new(Blur::from_args(args)?))
        });
        registry.register("resize", "WxH", "Exact resize with a Lanczos3 filter", |args| {
            Ok(Box::new(Resize::from_args(args)?))
        });
        registry.register("threshold", "level (default 128)", "Binary threshold on luma", |args| {
            Ok(Box::new(Threshold::from_args(args)?))
        });
        registry.register("edges", "", "Sobel gradient magnitude", |args| {
            no_args("edges", args)?;
            Ok(Box::new(Edges))
        });
        registry.register(
            "heatmap",
            "grid (default 25), opacity (default 0.70)",
            "Activity density heatmap blended over the frame",
            |args| Ok(Box::new(Heatmap::from_args(args)?)),
        );
        registry
    }

    /// Register (or replace) a stage constructor
    pub fn register<F>(&mut self, name: &str, args: &str, description: &str, factory: F)
    where
        F: Fn(&[&str]) -> std::result::Result<Box<dyn Stage>, StageError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            StageEntry {
                info: StageInfo {
                    name: name.to_string(),
                    args: args.to_string(),
                    description: description.to_string(),
                },
                factory: Arc::new(factory),
            },
        );
    }

    pub fn describe(&self) -> Vec<StageInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Parse a plan into a ready-to-run stage list
    pub fn build(&self, plan: &str) -> Result<StagePlan> {
        let mut stages = Vec::new();

        for entry in plan.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = entry.split(':').map(str::trim);
            let name = parts.next().unwrap_or_default().to_ascii_lowercase();
            let args: Vec<&str> = parts.collect();

            let registered = self
                .entries
                .get(&name)
                .ok_or_else(|| MediaError::transform(name.as_str(), "unknown stage"))?;
            let stage = (registered.factory)(&args)
                .map_err(|e| MediaError::transform(name.as_str(), e.to_string()))?;
            stages.push(stage);
        }

        Ok(StagePlan { stages })
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// An ordered, validated list of stages
pub struct StagePlan {
    stages: Vec<Box<dyn Stage>>,
}

impl StagePlan {
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order; the first failure aborts the chain
    pub fn apply(&self, frame: Frame) -> Result<Frame> {
        self.apply_measured(frame).map(|(frame, _)| frame)
    }

    /// [`StagePlan::apply`], also returning the last density reading taken
    pub fn apply_measured(&self, frame: Frame) -> Result<(Frame, Option<DensityReading>)> {
        self.stages.iter().try_fold((frame, None), |(frame, reading), stage| {
            let (frame, measured) = stage
                .apply_measured(frame)
                .map_err(|e| MediaError::transform(stage.name(), e.to_string()))?;
            Ok((frame, measured.or(reading)))
        })
    }
}

fn no_args(name: &str, args: &[&str]) -> std::result::Result<(), StageError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(StageError::InvalidArgument(format!("{} takes no arguments", name)))
    }
}

fn parse_arg<T: std::str::FromStr>(raw: Option<&&str>, default: T, what: &str) -> std::result::Result<T, StageError> {
    match raw {
        None => Ok(default),
        Some(s) if s.is_empty() => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| StageError::InvalidArgument(format!("{} '{}' is not a number", what, s))),
    }
}

// ============================================================================
// Built-in stages
// ============================================================================

pub struct Identity;

impl Stage for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        Ok(frame)
    }
}

pub struct Grayscale;

impl Stage for Grayscale {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        if frame.layout() == PixelLayout::Gray8 {
            return Ok(frame);
        }
        Ok(Frame::from_gray(frame.luma()))
    }
}

pub struct Blur {
    sigma: f32,
}

impl Blur {
    fn from_args(args: &[&str]) -> std::result::Result<Self, StageError> {
        let sigma: f32 = parse_arg(args.first(), 1.5, "sigma")?;
        if !(sigma > 0.0 && sigma <= 50.0) {
            return Err(StageError::InvalidArgument(format!("sigma {} outside (0, 50]", sigma)));
        }
        Ok(Self { sigma })
    }
}

impl Stage for Blur {
    fn name(&self) -> &str {
        "blur"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        Ok(Frame::new(frame.image().blur(self.sigma)))
    }
}

pub struct Resize {
    width: u32,
    height: u32,
}

impl Resize {
    fn from_args(args: &[&str]) -> std::result::Result<Self, StageError> {
        let size = args
            .first()
            .ok_or_else(|| StageError::InvalidArgument("expected WxH".to_string()))?;
        let (w, h) = size
            .to_ascii_lowercase()
            .split_once('x')
            .map(|(w, h)| (w.trim().parse::<u32>(), h.trim().parse::<u32>()))
            .ok_or_else(|| StageError::InvalidArgument(format!("'{}' is not WxH", size)))?;
        match (w, h) {
            (Ok(width), Ok(height))
                if (1..=MAX_DIMENSION).contains(&width) && (1..=MAX_DIMENSION).contains(&height) =>
            {
                Ok(Self { width, height })
            }
            _ => Err(StageError::InvalidArgument(format!(
                "'{}' must be two sizes between 1 and {}",
                size, MAX_DIMENSION
            ))),
        }
    }
}

impl Stage for Resize {
    fn name(&self) -> &str {
        "resize"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        if frame.dimensions() == (self.width, self.height) {
            return Ok(frame);
        }

        let layout = frame.layout();
        let pixel_type = match layout {
            PixelLayout::Gray8 => fr::PixelType::U8,
            PixelLayout::Rgb8 => fr::PixelType::U8x3,
            PixelLayout::Rgba8 => fr::PixelType::U8x4,
        };
        let (src_w, src_h) = frame.dimensions();

        let src = fr::images::Image::from_vec_u8(src_w, src_h, frame.into_image().into_bytes(), pixel_type)
            .map_err(|e| StageError::Failed(format!("source buffer: {:?}", e)))?;
        let mut dst = fr::images::Image::new(self.width, self.height, pixel_type);

        let mut resizer = fr::Resizer::new();
        resizer
            .resize(&src, &mut dst, None)
            .map_err(|e| StageError::Failed(format!("resize: {:?}", e)))?;

        let bytes = dst.buffer().to_vec();
        let img = match layout {
            PixelLayout::Gray8 => GrayImage::from_raw(self.width, self.height, bytes).map(image::DynamicImage::ImageLuma8),
            PixelLayout::Rgb8 => RgbImage::from_raw(self.width, self.height, bytes).map(image::DynamicImage::ImageRgb8),
            PixelLayout::Rgba8 => {
                image::RgbaImage::from_raw(self.width, self.height, bytes).map(image::DynamicImage::ImageRgba8)
            }
        };
        img.map(Frame::new)
            .ok_or_else(|| StageError::Failed("resized buffer has unexpected length".to_string()))
    }
}

pub struct Threshold {
    level: u8,
}

impl Threshold {
    fn from_args(args: &[&str]) -> std::result::Result<Self, StageError> {
        Ok(Self {
            level: parse_arg(args.first(), 128u8, "level")?,
        })
    }
}

impl Stage for Threshold {
    fn name(&self) -> &str {
        "threshold"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        let mut luma = frame.luma();
        for pixel in luma.pixels_mut() {
            pixel.0[0] = if pixel.0[0] > self.level { 255 } else { 0 };
        }
        Ok(Frame::from_gray(luma))
    }
}

/// Sobel gradient magnitude on luma; border pixels are zero
pub struct Edges;

impl Stage for Edges {
    fn name(&self) -> &str {
        "edges"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        let luma = frame.luma();
        drop(frame);
        let (w, h) = luma.dimensions();
        let (wu, hu) = (w as usize, h as usize);
        let src = luma.as_raw();
        let mut out = vec![0u8; wu * hu];

        if wu >= 3 && hu >= 3 {
            out.par_chunks_mut(wu)
                .enumerate()
                .filter(|(y, _)| *y > 0 && *y < hu - 1)
                .for_each(|(y, row)| {
                    let px = |x: usize, y: usize| src[y * wu + x] as i32;
                    for x in 1..wu - 1 {
                        let gx = -px(x - 1, y - 1) - 2 * px(x - 1, y) - px(x - 1, y + 1)
                            + px(x + 1, y - 1)
                            + 2 * px(x + 1, y)
                            + px(x + 1, y + 1);
                        let gy = -px(x - 1, y - 1) - 2 * px(x, y - 1) - px(x + 1, y - 1)
                            + px(x - 1, y + 1)
                            + 2 * px(x, y + 1)
                            + px(x + 1, y + 1);
                        let magnitude = ((gx * gx + gy * gy) as f32).sqrt();
                        row[x] = magnitude.min(255.0) as u8;
                    }
                });
        }

        GrayImage::from_raw(w, h, out)
            .map(Frame::from_gray)
            .ok_or_else(|| StageError::Failed("edge buffer has unexpected length".to_string()))
    }
}

/// Activity density heatmap.
///
/// Pixels whose luma deviates from the frame mean by more than
/// [`Heatmap::ACTIVE_DELTA`] count as active. The active fraction of each
/// `grid`x`grid` cell is stretched back to frame size, smoothed, colour mapped
/// (JET) and blended over the frame.
pub struct Heatmap {
    grid: u32,
    opacity: f32,
}

impl Heatmap {
    pub const ACTIVE_DELTA: f32 = 30.0;
    const SMOOTHING_SIGMA: f32 = 8.0;

    fn from_args(args: &[&str]) -> std::result::Result<Self, StageError> {
        let grid: u32 = parse_arg(args.first(), 25, "grid")?;
        if !(2..=512).contains(&grid) {
            return Err(StageError::InvalidArgument(format!("grid {} outside 2..=512", grid)));
        }
        let opacity: f32 = parse_arg(args.get(1), 0.70, "opacity")?;
        if !opacity.is_finite() {
            return Err(StageError::InvalidArgument("opacity must be finite".to_string()));
        }
        Ok(Self {
            grid,
            opacity: opacity.clamp(0.3, 1.0),
        })
    }

    /// Per-cell fraction of active pixels, and the active pixel count of the
    /// whole frame (partial cells at the right and bottom edges included)
    fn density(&self, luma: &GrayImage) -> (Array2<f32>, u64) {
        let (w, h) = luma.dimensions();
        let grid = self.grid;
        let mean = luma.as_raw().iter().map(|&v| v as f64).sum::<f64>() / (w as f64 * h as f64);
        let mean = mean as f32;

        let (rows, cols) = ((h / grid) as usize, (w / grid) as usize);
        let mut counts = Array2::<u32>::zeros((rows, cols));
        let mut total = 0u64;

        for (x, y, pixel) in luma.enumerate_pixels() {
            if (pixel.0[0] as f32 - mean).abs() <= Self::ACTIVE_DELTA {
                continue;
            }
            total += 1;
            let (i, j) = ((y / grid) as usize, (x / grid) as usize);
            if i < rows && j < cols {
                counts[[i, j]] += 1;
            }
        }

        let cell_area = (grid * grid) as f32;
        (counts.mapv(|c| c as f32 / cell_area), total)
    }
}

impl Stage for Heatmap {
    fn name(&self) -> &str {
        "heatmap"
    }

    fn apply(&self, frame: Frame) -> std::result::Result<Frame, StageError> {
        self.apply_measured(frame).map(|(frame, _)| frame)
    }

    fn apply_measured(&self, frame: Frame) -> std::result::Result<(Frame, Option<DensityReading>), StageError> {
        let (w, h) = frame.dimensions();
        if w < self.grid || h < self.grid {
            return Err(StageError::Failed(format!(
                "frame {}x{} is smaller than one {}px cell",
                w, h, self.grid
            )));
        }

        let (density, active_pixels) = self.density(&frame.luma());
        let reading = DensityReading {
            density: density.mean().unwrap_or(0.0),
            active_pixels,
        };
        let (rows, cols) = density.dim();
        let cells = GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([(density[[y as usize, x as usize]] * 255.0).round() as u8])
        });
        let intensity = imageops::blur(&imageops::resize(&cells, w, h, FilterType::Triangle), Self::SMOOTHING_SIGMA);

        let mut base = frame.into_rgb();
        let alpha = self.opacity;
        let row_len = w as usize * 3;
        let heat = intensity.as_raw();

        base.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
            for x in 0..w as usize {
                let colour = jet(heat[y * w as usize + x]);
                for c in 0..3 {
                    let blended = row[x * 3 + c] as f32 * (1.0 - alpha) + colour[c] as f32 * alpha;
                    row[x * 3 + c] = blended.round().clamp(0.0, 255.0) as u8;
                }
            }
        });

        Ok((Frame::from_rgb(base), Some(reading)))
    }
}

/// JET colormap: blue (0) through green to red (255)
pub fn jet(value: u8) -> [u8; 3] {
    let v = value as f32 / 255.0;
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}
