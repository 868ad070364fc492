//! Derivative encoding for world screenshots.
//!
//! Both derivatives keep the source's pixel size and differ only in encoder
//! quality. Output never carries transparency.

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageError, ImageReader};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Error types for derivative building
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),
}

/// Result type for derivative builds
pub type BuildResult<T> = Result<T, BuildError>;

/// Encoder settings for the two derivative tiers.
#[derive(Debug, Clone, Copy)]
pub struct DerivativeBuilder {
    pub thumbnail_quality: u8,
    pub full_quality: u8,
}

impl Default for DerivativeBuilder {
    fn default() -> Self {
        Self {
            thumbnail_quality: 15,
            full_quality: 95,
        }
    }
}

impl DerivativeBuilder {
    pub fn new(thumbnail_quality: u8, full_quality: u8) -> Self {
        Self {
            thumbnail_quality: thumbnail_quality.clamp(1, 100),
            full_quality: full_quality.clamp(1, 100),
        }
    }

    /// Write the low-quality thumbnail and return the source dimensions.
    pub fn build_thumbnail(&self, src: &Path, dst: &Path) -> BuildResult<(u32, u32)> {
        encode_derivative(src, dst, self.thumbnail_quality)
    }

    /// Write the near-original derivative and return the source dimensions.
    pub fn build_full(&self, src: &Path, dst: &Path) -> BuildResult<(u32, u32)> {
        encode_derivative(src, dst, self.full_quality)
    }
}

fn encode_derivative(src: &Path, dst: &Path, quality: u8) -> BuildResult<(u32, u32)> {
    // Animated formats decode to their first frame here.
    let decoded = ImageReader::open(src)?.with_guessed_format()?.decode()?;
    let (width, height) = (decoded.width(), decoded.height());
    let rgb = flatten(decoded);

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut encoded), quality).encode(
        rgb.as_raw(),
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;

    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&encoded)?;
    tmp.persist(dst).map_err(|e| BuildError::Io(e.error))?;

    Ok((width, height))
}

fn flatten(image: DynamicImage) -> image::RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn builds_both_tiers_with_source_dimensions() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("shot.png");
        RgbaImage::from_pixel(12, 7, Rgba([200, 10, 10, 128])).save(&src).unwrap();

        let builder = DerivativeBuilder::default();
        let thumb = dir.path().join("thumb").join("shot.jpg");
        let full = dir.path().join("view").join("shot.jpg");

        assert_eq!(builder.build_thumbnail(&src, &thumb).unwrap(), (12, 7));
        assert_eq!(builder.build_full(&src, &full).unwrap(), (12, 7));

        let reopened = image::open(&full).unwrap();
        assert_eq!((reopened.width(), reopened.height()), (12, 7));
        assert!(!reopened.color().has_alpha());
    }

    #[test]
    fn thumbnail_is_smaller_than_full() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("noise.png");
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            Rgba([(x * 7 % 255) as u8, (y * 13 % 255) as u8, ((x ^ y) * 3 % 255) as u8, 255])
        });
        img.save(&src).unwrap();

        let builder = DerivativeBuilder::default();
        let thumb = dir.path().join("t.jpg");
        let full = dir.path().join("f.jpg");
        builder.build_thumbnail(&src, &thumb).unwrap();
        builder.build_full(&src, &full).unwrap();

        let thumb_len = fs::metadata(&thumb).unwrap().len();
        let full_len = fs::metadata(&full).unwrap().len();
        assert!(thumb_len < full_len);
    }

    #[test]
    fn corrupt_source_fails_without_output() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("broken.png");
        fs::write(&src, b"\x89PNG\r\n\x1a\nnot really").unwrap();

        let dst = dir.path().join("out").join("broken.jpg");
        assert!(DerivativeBuilder::default().build_thumbnail(&src, &dst).is_err());
        assert!(!dst.exists());
    }
}
