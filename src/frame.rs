//! In-memory frame representation shared by decoders, stages and encoders

use image::{DynamicImage, GrayImage, RgbImage};
use serde::Serialize;

/// Pixel layouts a [`Frame`] can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelLayout {
    Gray8,
    Rgb8,
    Rgba8,
}

/// A decoded image or a single video frame.
///
/// Layouts other than 8-bit gray/RGB/RGBA are normalised on construction, so
/// stages only ever see one of the three [`PixelLayout`] variants.
#[derive(Debug, Clone)]
pub struct Frame {
    image: DynamicImage,
}

impl Frame {
    pub fn new(image: DynamicImage) -> Self {
        let image = match image {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => image,
            other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
            other if other.color().has_color() => DynamicImage::ImageRgb8(other.to_rgb8()),
            other => DynamicImage::ImageLuma8(other.to_luma8()),
        };
        Self { image }
    }

    /// Wrap a tightly packed RGB24 buffer (the raw video frame layout)
    pub fn from_rgb24(width: u32, height: u32, buffer: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, buffer).map(|img| Self {
            image: DynamicImage::ImageRgb8(img),
        })
    }

    pub fn from_gray(img: GrayImage) -> Self {
        Self {
            image: DynamicImage::ImageLuma8(img),
        }
    }

    pub fn from_rgb(img: RgbImage) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(img),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn layout(&self) -> PixelLayout {
        match &self.image {
            DynamicImage::ImageLuma8(_) => PixelLayout::Gray8,
            DynamicImage::ImageRgba8(_) => PixelLayout::Rgba8,
            _ => PixelLayout::Rgb8,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Raw pixel bytes in the frame's own layout
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_bytes()
    }

    pub fn luma(&self) -> GrayImage {
        match &self.image {
            DynamicImage::ImageLuma8(img) => img.clone(),
            other => other.to_luma8(),
        }
    }

    /// Consume the frame as RGB24, converting only when needed
    pub fn into_rgb(self) -> RgbImage {
        match self.image {
            DynamicImage::ImageRgb8(img) => img,
            other => other.to_rgb8(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, LumaA, Rgb};

    #[test]
    fn test_layout_normalisation() {
        let gray_alpha = ImageBuffer::from_pixel(2, 2, LumaA([10u8, 200]));
        let frame = Frame::new(DynamicImage::ImageLumaA8(gray_alpha));
        assert_eq!(frame.layout(), PixelLayout::Rgba8);

        let rgb16 = ImageBuffer::from_pixel(2, 2, Rgb([1000u16, 2000, 3000]));
        let frame = Frame::new(DynamicImage::ImageRgb16(rgb16));
        assert_eq!(frame.layout(), PixelLayout::Rgb8);

        let gray16 = ImageBuffer::from_pixel(2, 2, Luma([40000u16]));
        let frame = Frame::new(DynamicImage::ImageLuma16(gray16));
        assert_eq!(frame.layout(), PixelLayout::Gray8);
    }

    #[test]
    fn test_from_rgb24_checks_length() {
        assert!(Frame::from_rgb24(2, 2, vec![0; 12]).is_some());
        assert!(Frame::from_rgb24(2, 2, vec![0; 11]).is_none());
    }
}
